//! Architecture profiles: the fixed compiler and linker flags a kernel build
//! uses for each supported CPU architecture.
//!
//! These tables mirror what kbuild passes for the corresponding `ARCH=` on
//! recent 5.x kernels. They are versioned constants: when targeting a kernel
//! whose Makefiles changed the ABI flags, the table has to be revalidated
//! against `make V=1` output of that kernel rather than edited ad hoc.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arch {
    X86_64,
    I386,
    Arm,
    Arm64,
}

impl Arch {
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim() {
            "x86_64" | "x64" | "amd64" => Ok(Arch::X86_64),
            "i386" | "i686" | "x86" => Ok(Arch::I386),
            "arm" | "armv7" | "armeb" => Ok(Arch::Arm),
            "arm64" | "arm64-v8a" | "aarch64" => Ok(Arch::Arm64),
            other => Err(Error::UnsupportedArchitecture(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::I386 => "i386",
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
        }
    }

    pub fn profile(self) -> &'static ArchProfile {
        match self {
            Arch::X86_64 => &X86_64,
            Arch::I386 => &I386,
            Arch::Arm => &ARM,
            Arch::Arm64 => &ARM64,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ArchProfile {
    pub arch: Arch,
    /// Relative to the SDK dir, e.g. `arch/x86`.
    pub include_subdir: &'static str,
    pub cflags: &'static [&'static str],
    pub defines: &'static [&'static str],
    /// ELF format selection passed to every `ld` invocation.
    pub link_args: &'static [&'static str],
}

/// Flags every kernel object is built with regardless of architecture.
pub const COMMON_CFLAGS: &[&str] = &[
    "-O2",
    "-Wall",
    "-Wundef",
    "-Werror=strict-prototypes",
    "-Wno-trigraphs",
    "-Werror=implicit-function-declaration",
    "-Werror=implicit-int",
    "-Werror=return-type",
    "-Wno-format-security",
    "-Wno-frame-address",
    "-Wno-address-of-packed-member",
    "-Wdeclaration-after-statement",
    "-Wvla",
    "-Wno-pointer-sign",
    "-Werror=date-time",
    "-Werror=incompatible-pointer-types",
    "-Werror=designated-init",
    "-fno-strict-aliasing",
    "-fno-common",
    "-fshort-wchar",
    "-fno-PIE",
    "-fno-delete-null-pointer-checks",
    "-fno-allow-store-data-races",
    "-fno-stack-check",
    "-fconserve-stack",
    "-fno-strict-overflow",
    "-fno-merge-all-constants",
    "-fmerge-constants",
    "-fno-var-tracking-assignments",
];

pub const DEFAULT_LANGUAGE: &str = "gnu89";

pub const FENTRY_CFLAGS: &[&str] = &["-pg", "-mfentry"];
pub const FENTRY_DEFINES: &[&str] = &["CC_USING_FENTRY"];

/// Generic KASAN shadow offset used by x86_64 and arm64 kernels.
pub const KASAN_SHADOW_OFFSET: &str = "0xdffffc0000000000";

pub const KASAN_CFLAGS: &[&str] = &[
    "-fsanitize=kernel-address",
    "-fasan-shadow-offset=0xdffffc0000000000",
    "--param=asan-globals=1",
    "--param=asan-instrumentation-with-call-threshold=0",
    "--param=asan-stack=1",
    "--param=asan-instrument-allocas=1",
    "-fsanitize-coverage=trace-pc",
    "-fsanitize-coverage=trace-cmp",
];

static X86_64: ArchProfile = ArchProfile {
    arch: Arch::X86_64,
    include_subdir: "arch/x86",
    cflags: &[
        "-m64",
        "-mno-sse",
        "-mno-mmx",
        "-mno-sse2",
        "-mno-3dnow",
        "-mno-avx",
        "-mno-80387",
        "-mno-fp-ret-in-387",
        "-mpreferred-stack-boundary=3",
        "-mskip-rax-setup",
        "-mtune=generic",
        "-mno-red-zone",
        "-mcmodel=kernel",
        "-fcf-protection=none",
        "-falign-jumps=1",
        "-falign-loops=1",
        "-fno-jump-tables",
        "-fno-asynchronous-unwind-tables",
        "-fno-omit-frame-pointer",
        "-fno-reorder-blocks",
        "-fno-ipa-cp-clone",
        "-fno-partial-inlining",
        "-fstack-protector-strong",
    ],
    defines: &[
        "CONFIG_X86_X32_ABI",
        "CONFIG_AS_CFI=1",
        "CONFIG_AS_CFI_SIGNAL_FRAME=1",
        "CONFIG_AS_CFI_SECTIONS=1",
        "CONFIG_AS_SSSE3=1",
        "CONFIG_AS_AVX=1",
        "CONFIG_AS_AVX2=1",
        "CONFIG_AS_AVX512=1",
        "CONFIG_AS_SHA1_NI=1",
        "CONFIG_AS_SHA256_NI=1",
    ],
    link_args: &["-m", "elf_x86_64"],
};

static I386: ArchProfile = ArchProfile {
    arch: Arch::I386,
    include_subdir: "arch/x86",
    cflags: &[
        "-m32",
        "-msoft-float",
        "-mregparm=3",
        "-freg-struct-return",
        "-fno-pic",
        "-march=i686",
        "-mtune=generic",
        "-mpreferred-stack-boundary=2",
        "-mno-sse",
        "-mno-mmx",
        "-mno-sse2",
        "-mno-3dnow",
        "-mno-avx",
        "-fcf-protection=none",
        "-fno-jump-tables",
        "-fno-asynchronous-unwind-tables",
        "-fno-omit-frame-pointer",
        "-fstack-protector-strong",
    ],
    defines: &[
        "CONFIG_AS_CFI=1",
        "CONFIG_AS_CFI_SIGNAL_FRAME=1",
        "CONFIG_AS_CFI_SECTIONS=1",
    ],
    link_args: &["-m", "elf_i386"],
};

static ARM: ArchProfile = ArchProfile {
    arch: Arch::Arm,
    include_subdir: "arch/arm",
    cflags: &[
        "-mbig-endian",
        "-mabi=aapcs-linux",
        "-mfpu=vfp",
        "-marm",
        "-march=armv6k",
        "-mtune=arm1136j-s",
        "-msoft-float",
        "-Uarm",
        "-mno-unaligned-access",
        "-fno-dwarf2-cfi-asm",
        "-fno-omit-frame-pointer",
        "-fstack-protector-strong",
    ],
    defines: &["__LINUX_ARM_ARCH__=6"],
    link_args: &["-EB"],
};

static ARM64: ArchProfile = ArchProfile {
    arch: Arch::Arm64,
    include_subdir: "arch/arm64",
    cflags: &[
        "-mlittle-endian",
        "-mgeneral-regs-only",
        "-mabi=lp64",
        "-fno-asynchronous-unwind-tables",
        "-fno-unwind-tables",
        "-mbranch-protection=pac-ret+leaf",
        "-fno-omit-frame-pointer",
        "-fstack-protector-strong",
    ],
    defines: &["KASAN_SHADOW_SCALE_SHIFT=3"],
    link_args: &["-EL", "-maarch64elf"],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        assert_eq!(Arch::parse("x86_64").expect("x86_64"), Arch::X86_64);
        assert_eq!(Arch::parse("i686").expect("i686"), Arch::I386);
        assert_eq!(Arch::parse("armv7").expect("armv7"), Arch::Arm);
        assert_eq!(Arch::parse("arm64-v8a").expect("arm64"), Arch::Arm64);
        assert_eq!(Arch::parse("aarch64").expect("aarch64"), Arch::Arm64);
    }

    #[test]
    fn unknown_arch_is_rejected() {
        let err = Arch::parse("mips").expect_err("mips");
        assert!(matches!(err, Error::UnsupportedArchitecture(ref a) if a == "mips"));
    }

    #[test]
    fn link_format_table() {
        assert_eq!(Arch::X86_64.profile().link_args, ["-m", "elf_x86_64"]);
        assert_eq!(Arch::I386.profile().link_args, ["-m", "elf_i386"]);
        assert_eq!(Arch::Arm.profile().link_args, ["-EB"]);
        assert_eq!(Arch::Arm64.profile().link_args, ["-EL", "-maarch64elf"]);
    }

    #[test]
    fn x86_profile_disables_pic_and_vector_units() {
        let p = Arch::X86_64.profile();
        assert_eq!(p.include_subdir, "arch/x86");
        for f in ["-mcmodel=kernel", "-mno-red-zone", "-mno-sse", "-fno-jump-tables"] {
            assert!(p.cflags.contains(&f), "missing {f}");
        }
        assert!(COMMON_CFLAGS.contains(&"-fno-PIE"));
    }

    #[test]
    fn kasan_flags_embed_shadow_offset() {
        let want = format!("-fasan-shadow-offset={KASAN_SHADOW_OFFSET}");
        assert!(KASAN_CFLAGS.iter().any(|f| *f == want));
    }
}

//! Load stage: turns a freshly created target into a kernel module target.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::kmod::arch::{self, Arch, ArchProfile};
use crate::kmod::probe::CompilerProbe;
use crate::kmod::sdk::{self, KernelHeaderSdk, LINUX_HEADERS_PACKAGE, PackageDescriptor};
use crate::kmod::target::{Features, ModuleBuildTarget, TargetKind};
use crate::kmod::toolchain::Toolchain;

/// Generic build-mode rules that would fight the kernel flag set.
pub const INCOMPATIBLE_RULES: &[&str] = &[
    "mode.debug",
    "mode.release",
    "mode.releasedbg",
    "mode.minsizerel",
    "mode.check",
    "mode.profile",
    "mode.coverage",
    "mode.valgrind",
    "mode.asan",
    "mode.tsan",
    "mode.lsan",
    "mode.ubsan",
];

/// Everything the kernel build dictates for one (arch, features, sdk, probe)
/// combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelFlags {
    pub sysincludedirs: Vec<PathBuf>,
    pub includedirs: Vec<PathBuf>,
    pub cflags: Vec<String>,
    pub defines: Vec<String>,
}

pub fn kernel_flags(
    profile: &ArchProfile,
    features: Features,
    sdk: &KernelHeaderSdk,
    probe_dir: Option<&Path>,
) -> KernelFlags {
    let inc = &sdk.include_dir;
    let arch_inc = sdk.sdk_dir.join(profile.include_subdir).join("include");

    let sysincludedirs = probe_dir.map(Path::to_path_buf).into_iter().collect();
    let includedirs = vec![
        arch_inc.clone(),
        arch_inc.join("generated"),
        inc.clone(),
        arch_inc.join("uapi"),
        arch_inc.join("generated").join("uapi"),
        inc.join("uapi"),
        inc.join("generated").join("uapi"),
    ];

    let mut cflags = vec![
        "-include".to_string(),
        inc.join("linux").join("kconfig.h").display().to_string(),
        "-include".to_string(),
        inc.join("linux").join("compiler_types.h").display().to_string(),
    ];
    cflags.extend(arch::COMMON_CFLAGS.iter().map(|s| s.to_string()));
    cflags.extend(profile.cflags.iter().map(|s| s.to_string()));

    let mut defines = vec!["__KERNEL__".to_string(), "MODULE".to_string()];
    defines.extend(profile.defines.iter().map(|s| s.to_string()));

    if features.fentry {
        cflags.extend(arch::FENTRY_CFLAGS.iter().map(|s| s.to_string()));
        defines.extend(arch::FENTRY_DEFINES.iter().map(|s| s.to_string()));
    }
    if features.kasan {
        cflags.extend(arch::KASAN_CFLAGS.iter().map(|s| s.to_string()));
    }

    KernelFlags {
        sysincludedirs,
        includedirs,
        cflags,
        defines,
    }
}

/// Kbuild's name-fix: `-` and `,` are not valid in C identifiers.
pub fn kbuild_name(raw: &str) -> String {
    raw.replace(['-', ','], "_")
}

/// Look up and resolve the kernel-headers SDK a target depends on.
pub fn sdk_for_target(
    target: &ModuleBuildTarget,
    packages: &BTreeMap<String, PackageDescriptor>,
) -> Result<KernelHeaderSdk> {
    if !target.packages.iter().any(|p| p == LINUX_HEADERS_PACKAGE) {
        return Err(Error::config(format!(
            "kmod target '{}' does not depend on package '{LINUX_HEADERS_PACKAGE}'",
            target.name
        )));
    }
    let Some(pkg) = packages.get(LINUX_HEADERS_PACKAGE) else {
        return Err(Error::config(format!(
            "package '{LINUX_HEADERS_PACKAGE}' is not declared ([packages.{LINUX_HEADERS_PACKAGE}])"
        )));
    };
    sdk::resolve_sdk(pkg)
}

/// Configure a target for the kernel. Consumes the unconfigured target so it
/// can only be configured once.
pub fn configure(
    mut target: ModuleBuildTarget,
    sdk: &KernelHeaderSdk,
    probe: &CompilerProbe,
    tc: &dyn Toolchain,
) -> Result<ModuleBuildTarget> {
    target.kind = TargetKind::Binary;
    target.extension = ".ko".into();
    target.custom_link = true;

    if let Some(rule) = target
        .rules
        .iter()
        .find(|r| INCOMPATIBLE_RULES.contains(&r.trim()))
    {
        return Err(Error::IncompatibleRule {
            target: target.name.clone(),
            rule: rule.trim().to_string(),
        });
    }

    // Resolved before the compiler is ever spawned.
    let profile = Arch::parse(&target.arch)?.profile();

    let family = probe.family(tc);
    if !family.is_gnu() {
        return Err(Error::UnsupportedToolchain {
            compiler: format!("{} ({family:?})", probe.cc().display()),
        });
    }
    let probe_dir = probe.include_dir(tc);

    let flags = kernel_flags(profile, target.features, sdk, probe_dir.as_deref());
    tracing::debug!(
        kmod = %target.name,
        arch = %profile.arch,
        includes = flags.sysincludedirs.len() + flags.includedirs.len(),
        "configured kernel flags"
    );

    target.sysincludedirs = merge_unique(flags.sysincludedirs, &target.sysincludedirs);
    target.includedirs = merge_unique(flags.includedirs, &target.includedirs);
    target.package_includedirs.clear();

    let mut defines = flags.defines;
    defines.push(format!("KBUILD_MODNAME=\"{}\"", kbuild_name(&target.name)));
    defines.append(&mut target.defines);
    target.defines = defines;

    target.file_defines = target
        .sources
        .iter()
        .map(|src| {
            let stem = src
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            (
                src.clone(),
                vec![format!("KBUILD_BASENAME=\"{}\"", kbuild_name(&stem))],
            )
        })
        .collect();

    target.auto_ignore_flags = false;

    let mut cflags = flags.cflags;
    cflags.append(&mut target.cflags);
    target.cflags = cflags;
    if target.language.is_none() {
        target.language = Some(arch::DEFAULT_LANGUAGE.to_string());
    }

    Ok(target)
}

fn merge_unique(mut first: Vec<PathBuf>, rest: &[PathBuf]) -> Vec<PathBuf> {
    for p in rest {
        if !first.contains(p) {
            first.push(p.clone());
        }
    }
    first
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use proptest::prelude::*;

    use super::*;
    use crate::kmod::target::TargetSpec;
    use crate::kmod::toolchain::{ToolInvocation, ToolOutput};
    use crate::workspace::WorkspacePaths;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<ToolInvocation>>,
        banner: String,
    }

    impl Toolchain for Recorder {
        fn run(&self, inv: &ToolInvocation) -> Result<ToolOutput> {
            self.calls.lock().expect("lock").push(inv.clone());
            Ok(ToolOutput {
                success: true,
                status: "exit status: 0".into(),
                stdout: self.banner.clone(),
                stderr: String::new(),
            })
        }
    }

    fn sdk() -> KernelHeaderSdk {
        KernelHeaderSdk {
            version: "5.15.0".into(),
            sdk_dir: PathBuf::from("/usr/src/linux-headers-5.15.0"),
            include_dir: PathBuf::from("/usr/src/linux-headers-5.15.0/include"),
        }
    }

    fn target(arch: &str, rules: &[&str]) -> ModuleBuildTarget {
        let ws = WorkspacePaths {
            root: PathBuf::from("/work"),
            build_dir: PathBuf::from("/work/build"),
            out_dir: PathBuf::from("/work/out"),
        };
        let spec = TargetSpec {
            name: "my-mod".into(),
            arch: arch.into(),
            sources: vec!["src/main.c".into(), "src/ring-buf.c".into()],
            rules: rules.iter().map(|r| r.to_string()).collect(),
            defines: vec!["DEBUG_LEVEL=2".into()],
            cflags: vec!["-Wno-unused".into()],
            ..TargetSpec::default()
        };
        let mut t = ModuleBuildTarget::from_spec(&spec, &ws, &BTreeMap::new()).expect("target");
        t.package_includedirs = vec![PathBuf::from("/usr/src/linux-headers-5.15.0/include")];
        t
    }

    #[test]
    fn configures_x86_module() {
        let tc = Recorder::default();
        let probe = CompilerProbe::new("gcc");
        let t = configure(target("x86_64", &[]), &sdk(), &probe, &tc).expect("configure");

        assert_eq!(t.kind, TargetKind::Binary);
        assert_eq!(t.extension, ".ko");
        assert!(t.custom_link);
        assert!(!t.auto_ignore_flags);
        assert!(t.package_includedirs.is_empty());
        assert_eq!(t.language.as_deref(), Some("gnu89"));

        let sdk_dir = sdk().sdk_dir;
        assert_eq!(
            &t.includedirs[..4],
            &[
                sdk_dir.join("arch/x86/include"),
                sdk_dir.join("arch/x86/include/generated"),
                sdk_dir.join("include"),
                sdk_dir.join("arch/x86/include/uapi"),
            ]
        );
        assert_eq!(t.cflags[0], "-include");
        assert!(t.cflags[1].ends_with("linux/kconfig.h"));
        assert_eq!(t.cflags[2], "-include");
        assert!(t.cflags[3].ends_with("linux/compiler_types.h"));
        assert_eq!(t.cflags.last().map(String::as_str), Some("-Wno-unused"));

        assert_eq!(&t.defines[..2], &["__KERNEL__", "MODULE"]);
        assert!(t.defines.contains(&"KBUILD_MODNAME=\"my_mod\"".to_string()));
        assert_eq!(t.defines.last().map(String::as_str), Some("DEBUG_LEVEL=2"));
        assert_eq!(
            t.file_defines[&PathBuf::from("/work/src/ring-buf.c")],
            vec!["KBUILD_BASENAME=\"ring_buf\"".to_string()]
        );
    }

    #[test]
    fn unknown_arch_fails_before_any_subprocess() {
        let tc = Recorder::default();
        // Name does not reveal the family, so identifying it would spawn.
        let probe = CompilerProbe::new("/opt/cross/bin/cc");
        let err = configure(target("mips", &[]), &sdk(), &probe, &tc).expect_err("mips");
        assert!(matches!(err, Error::UnsupportedArchitecture(_)), "{err:?}");
        assert!(tc.calls.lock().expect("lock").is_empty());
    }

    #[test]
    fn build_mode_rules_are_rejected() {
        let tc = Recorder::default();
        let probe = CompilerProbe::new("gcc");
        let err = configure(target("arm64", &["mode.release"]), &sdk(), &probe, &tc)
            .expect_err("mode.release");
        assert!(
            matches!(err, Error::IncompatibleRule { ref rule, .. } if rule == "mode.release"),
            "{err:?}"
        );
    }

    #[test]
    fn non_gnu_compiler_is_rejected() {
        let tc = Recorder {
            banner: "Ubuntu clang version 14.0.0\n".into(),
            ..Recorder::default()
        };
        let probe = CompilerProbe::new("cc");
        let err = configure(target("x86_64", &[]), &sdk(), &probe, &tc).expect_err("clang");
        assert!(matches!(err, Error::UnsupportedToolchain { .. }), "{err:?}");
    }

    #[test]
    fn missing_headers_package_is_named() {
        let mut t = target("x86_64", &[]);
        t.packages.clear();
        let err = sdk_for_target(&t, &BTreeMap::new()).expect_err("no package");
        assert!(err.to_string().contains("linux-headers"), "{err}");
    }

    #[test]
    fn features_layer_on_top() {
        let plain = kernel_flags(Arch::Arm64.profile(), Features::default(), &sdk(), None);
        let both = kernel_flags(
            Arch::Arm64.profile(),
            Features {
                fentry: true,
                kasan: true,
            },
            &sdk(),
            None,
        );
        assert_eq!(&both.cflags[..plain.cflags.len()], &plain.cflags[..]);
        assert!(both.cflags.contains(&"-mfentry".to_string()));
        assert!(both.cflags.contains(&"-fsanitize=kernel-address".to_string()));
        assert!(both.defines.contains(&"CC_USING_FENTRY".to_string()));
    }

    fn arch_strategy() -> impl Strategy<Value = Arch> {
        prop_oneof![
            Just(Arch::X86_64),
            Just(Arch::I386),
            Just(Arch::Arm),
            Just(Arch::Arm64),
        ]
    }

    proptest! {
        #[test]
        fn flag_set_is_pure_and_order_independent(
            archs in proptest::collection::vec(arch_strategy(), 1..6),
            fentry in any::<bool>(),
            kasan in any::<bool>(),
            probed in any::<bool>(),
        ) {
            let probe_dir = probed.then(|| PathBuf::from("/usr/lib/gcc/x86_64-linux-gnu/12/include"));
            let features = Features { fentry, kasan };

            let forward: Vec<KernelFlags> = archs
                .iter()
                .map(|a| kernel_flags(a.profile(), features, &sdk(), probe_dir.as_deref()))
                .collect();
            let mut backward: Vec<KernelFlags> = archs
                .iter()
                .rev()
                .map(|a| kernel_flags(a.profile(), features, &sdk(), probe_dir.as_deref()))
                .collect();
            backward.reverse();
            prop_assert_eq!(&forward, &backward);

            for (a, flags) in archs.iter().zip(&forward) {
                prop_assert!(flags.sysincludedirs.len() + flags.includedirs.len() >= 6);
                prop_assert_eq!(flags.cflags[0].as_str(), "-include");
                let profile_flags_present = a.profile().cflags.iter().all(|f| flags.cflags.iter().any(|c| c == f));
                prop_assert!(profile_flags_present);
            }
        }
    }
}

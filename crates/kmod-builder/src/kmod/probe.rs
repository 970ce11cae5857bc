use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::kmod::toolchain::{ToolInvocation, Toolchain};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilerFamily {
    Gnu,
    Clang,
    Other(String),
}

impl CompilerFamily {
    pub fn is_gnu(&self) -> bool {
        matches!(self, CompilerFamily::Gnu)
    }
}

/// Per-session facts about the configured C compiler.
///
/// Each fact is computed at most once; later callers (including other worker
/// threads) read the cached value.
#[derive(Debug)]
pub struct CompilerProbe {
    cc: PathBuf,
    include_dir: OnceLock<Option<PathBuf>>,
    family: OnceLock<CompilerFamily>,
}

impl CompilerProbe {
    pub fn new(cc: impl Into<PathBuf>) -> Self {
        Self {
            cc: cc.into(),
            include_dir: OnceLock::new(),
            family: OnceLock::new(),
        }
    }

    pub fn cc(&self) -> &Path {
        &self.cc
    }

    /// The compiler's own system include directory, if it can be determined.
    pub fn include_dir(&self, tc: &dyn Toolchain) -> Option<PathBuf> {
        self.include_dir
            .get_or_init(|| {
                let inv = ToolInvocation::new(&self.cc).args(["-E", "-Wp,-v", "-xc", "/dev/null"]);
                let out = match tc.run(&inv) {
                    Ok(out) => out,
                    Err(e) => {
                        tracing::warn!(cc = %self.cc.display(), error = %e, "include dir probe failed");
                        return None;
                    }
                };
                let dir = parse_search_list(&out.combined(), |p| p.is_dir());
                tracing::debug!(cc = %self.cc.display(), dir = ?dir, "probed compiler include dir");
                dir
            })
            .clone()
    }

    pub fn family(&self, tc: &dyn Toolchain) -> CompilerFamily {
        self.family
            .get_or_init(|| {
                if let Some(f) = family_from_name(&self.cc) {
                    return f;
                }
                match tc.run(&ToolInvocation::new(&self.cc).arg("--version")) {
                    Ok(out) if out.success => family_from_version(&out.combined()),
                    Ok(out) => CompilerFamily::Other(format!("{} ({})", self.cc.display(), out.status)),
                    Err(e) => CompilerFamily::Other(format!("{} ({e})", self.cc.display())),
                }
            })
            .clone()
    }
}

/// Last existing directory listed before the `End of search list.` line of
/// `cc -E -Wp,-v` output.
pub fn parse_search_list(output: &str, is_dir: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    let mut found = None;
    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("End") {
            break;
        }
        if line.is_empty() {
            continue;
        }
        let p = Path::new(line);
        if is_dir(p) {
            found = Some(p.to_path_buf());
        }
    }
    found
}

fn family_from_name(cc: &Path) -> Option<CompilerFamily> {
    let name = cc.file_name()?.to_str()?;
    let is_versioned = |prefix: &str| {
        name.strip_prefix(prefix)
            .is_some_and(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit() || c == '.'))
    };
    if name == "gcc" || name.ends_with("-gcc") || is_versioned("gcc-") {
        return Some(CompilerFamily::Gnu);
    }
    if name == "clang" || name.ends_with("-clang") || is_versioned("clang-") {
        return Some(CompilerFamily::Clang);
    }
    None
}

fn family_from_version(text: &str) -> CompilerFamily {
    let lower = text.to_ascii_lowercase();
    if lower.contains("clang") {
        return CompilerFamily::Clang;
    }
    if lower.contains("free software foundation") || lower.contains("gcc") {
        return CompilerFamily::Gnu;
    }
    CompilerFamily::Other(text.lines().next().unwrap_or_default().trim().to_string())
}

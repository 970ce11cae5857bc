use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_build_dir() -> String {
    "build".into()
}

fn default_out_dir() -> String {
    "out".into()
}

fn default_root_dir() -> String {
    ".".into()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    Build,
    Out,
    All,
}

impl CleanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CleanMode::None => "none",
            CleanMode::Build => "build",
            CleanMode::Out => "out",
            CleanMode::All => "all",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub root_dir: String,
    pub build_dir: String,
    pub out_dir: String,
    pub clean: CleanMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            build_dir: default_build_dir(),
            out_dir: default_out_dir(),
            clean: CleanMode::None,
        }
    }
}

impl WorkspaceConfig {
    /// Same directories; cleaning only ever happens in core.init.
    pub fn without_clean(&self) -> Self {
        Self {
            clean: CleanMode::None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub out_dir: PathBuf,
}

impl WorkspacePaths {
    /// Relative paths are rooted at the workspace root; absolute paths are kept.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::config("empty path"));
        }
        let p = PathBuf::from(raw);
        Ok(if p.is_absolute() { p } else { self.root.join(p) })
    }

    /// Scratch area owned by one kernel module target.
    pub fn target_dir(&self, target: &str) -> PathBuf {
        self.build_dir.join("kmod").join(target)
    }

    pub fn target_object_dir(&self, target: &str) -> PathBuf {
        self.target_dir(target).join("obj")
    }

    pub fn target_link_dir(&self, target: &str) -> PathBuf {
        self.target_dir(target).join("link")
    }

    pub fn error_logs_dir(&self) -> PathBuf {
        self.build_dir.join("error-logs")
    }
}

/// Resolve workspace directories relative to `base` (normally the directory of
/// the build definition).
pub fn load_paths(base: &Path, cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let root = join_user_path(base, &cfg.root_dir)?;
    let build_dir = join_user_dir(&root, &cfg.build_dir)?;
    let out_dir = join_user_dir(&root, &cfg.out_dir)?;
    Ok(WorkspacePaths {
        root,
        build_dir,
        out_dir,
    })
}

pub fn init_dirs(base: &Path, cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let paths = load_paths(base, cfg)?;

    match cfg.clean {
        CleanMode::None => {}
        CleanMode::Build => remove_inside_root(&paths.root, &paths.build_dir)?,
        CleanMode::Out => remove_inside_root(&paths.root, &paths.out_dir)?,
        CleanMode::All => {
            remove_inside_root(&paths.root, &paths.build_dir)?;
            remove_inside_root(&paths.root, &paths.out_dir)?;
        }
    }

    for dir in [&paths.build_dir, &paths.out_dir] {
        fs::create_dir_all(dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
    }
    Ok(paths)
}

fn join_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace dir"));
    }
    if Path::new(p)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::config(format!(
            "invalid workspace dir '{p}' (contains '..')"
        )));
    }
    join_user_path(root, p)
}

fn join_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn remove_inside_root(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) || dir_can == root_can {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (not inside workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove {}: {e}", dir_can.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_dirs_are_scoped_per_target() {
        let ws = load_paths(Path::new("/tmp/kmod-root"), &WorkspaceConfig::default())
            .expect("paths");
        assert_eq!(ws.build_dir, PathBuf::from("/tmp/kmod-root/./build"));
        assert_ne!(ws.target_link_dir("a"), ws.target_link_dir("b"));
        assert!(ws.target_object_dir("hello").ends_with("kmod/hello/obj"));
    }

    #[test]
    fn rejects_parent_components_in_dirs() {
        let cfg = WorkspaceConfig {
            build_dir: "../escape".into(),
            ..WorkspaceConfig::default()
        };
        let err = load_paths(Path::new("/tmp/x"), &cfg).expect_err("must fail");
        assert!(err.to_string().contains("'..'"), "{err}");
    }

    #[test]
    fn clean_build_removes_previous_contents() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = WorkspaceConfig {
            clean: CleanMode::Build,
            ..WorkspaceConfig::default()
        };
        let stale = tmp.path().join("build/kmod/hello/link/hello.o");
        fs::create_dir_all(stale.parent().expect("parent")).expect("mkdir");
        fs::write(&stale, b"old").expect("write");

        let paths = init_dirs(tmp.path(), &cfg).expect("init");
        assert!(paths.build_dir.is_dir());
        assert!(!stale.exists());
    }
}

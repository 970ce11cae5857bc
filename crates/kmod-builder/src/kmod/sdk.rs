use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Package name the SDK descriptor is looked up under.
pub const LINUX_HEADERS_PACKAGE: &str = "linux-headers";

const TREE_MARKER: &str = "linux-headers";

/// Files whose presence shows the kernel tree has been configured.
pub const CONFIG_MARKERS: [&str; 2] = ["generated/autoconf.h", "config/auto.conf"];

/// A resolved dependency as handed over by the package system
/// (`[packages.<name>]` in the build definition).
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PackageDescriptor {
    pub version: Option<String>,
    pub includedirs: Vec<PathBuf>,
    pub sysincludedirs: Vec<PathBuf>,
}

impl PackageDescriptor {
    pub fn all_includedirs(&self) -> impl Iterator<Item = &PathBuf> {
        self.includedirs.iter().chain(self.sysincludedirs.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelHeaderSdk {
    pub version: String,
    pub sdk_dir: PathBuf,
    pub include_dir: PathBuf,
}

impl KernelHeaderSdk {
    pub fn modpost(&self) -> PathBuf {
        self.sdk_dir.join("scripts").join("mod").join("modpost")
    }

    pub fn module_lds(&self) -> PathBuf {
        self.sdk_dir.join("scripts").join("module.lds")
    }
}

pub fn is_configured(include_dir: &Path) -> bool {
    CONFIG_MARKERS
        .iter()
        .any(|m| include_dir.join(m).is_file())
}

pub fn resolve_sdk(pkg: &PackageDescriptor) -> Result<KernelHeaderSdk> {
    let Some(include_dir) = pkg
        .all_includedirs()
        .find(|d| d.to_string_lossy().contains(TREE_MARKER))
    else {
        return Err(Error::config(format!(
            "{LINUX_HEADERS_PACKAGE} not found: no include directory contains '{TREE_MARKER}'"
        )));
    };
    let sdk_dir = include_dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| {
            Error::config(format!(
                "{LINUX_HEADERS_PACKAGE} include dir {} has no parent",
                include_dir.display()
            ))
        })?;

    if !is_configured(include_dir) {
        return Err(Error::config(format!(
            "kernel tree at {} is not configured: {} and {} are missing under {}",
            sdk_dir.display(),
            CONFIG_MARKERS[0],
            CONFIG_MARKERS[1],
            include_dir.display()
        )));
    }

    let version = pkg
        .version
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown")
        .to_string();
    tracing::debug!(%version, sdk_dir = %sdk_dir.display(), "resolved kernel headers");

    Ok(KernelHeaderSdk {
        version,
        sdk_dir: sdk_dir.to_path_buf(),
        include_dir: include_dir.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use proptest::prelude::*;

    use super::*;

    fn headers_tree(root: &Path, marker: Option<&str>) -> PathBuf {
        let include = root.join("linux-headers-5.15.0").join("include");
        fs::create_dir_all(&include).expect("mkdir");
        if let Some(m) = marker {
            let p = include.join(m);
            fs::create_dir_all(p.parent().expect("parent")).expect("mkdir marker");
            fs::write(p, "").expect("write marker");
        }
        include
    }

    #[test]
    fn resolves_configured_tree_from_includedirs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let include = headers_tree(tmp.path(), Some("generated/autoconf.h"));
        let pkg = PackageDescriptor {
            version: Some("5.15.0".into()),
            includedirs: vec![tmp.path().join("unrelated"), include.clone()],
            sysincludedirs: vec![],
        };

        let sdk = resolve_sdk(&pkg).expect("resolve");
        assert_eq!(sdk.version, "5.15.0");
        assert_eq!(sdk.include_dir, include);
        assert_eq!(sdk.sdk_dir, tmp.path().join("linux-headers-5.15.0"));
        assert!(sdk.modpost().ends_with("scripts/mod/modpost"));
        assert!(sdk.module_lds().ends_with("scripts/module.lds"));
    }

    #[test]
    fn falls_back_to_sysincludedirs_and_auto_conf() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let include = headers_tree(tmp.path(), Some("config/auto.conf"));
        let pkg = PackageDescriptor {
            version: None,
            includedirs: vec![],
            sysincludedirs: vec![include],
        };
        let sdk = resolve_sdk(&pkg).expect("resolve");
        assert_eq!(sdk.version, "unknown");
    }

    #[test]
    fn missing_tree_marker_is_configuration_error() {
        let pkg = PackageDescriptor {
            version: Some("6.1".into()),
            includedirs: vec![PathBuf::from("/usr/include")],
            sysincludedirs: vec![],
        };
        let err = resolve_sdk(&pkg).expect_err("no linux-headers dir");
        assert!(matches!(err, Error::Configuration(_)), "{err:?}");
    }

    proptest! {
        #[test]
        fn unconfigured_candidates_are_always_rejected(
            suffix in "[a-z0-9.]{1,12}",
            nested in proptest::collection::vec("[a-z]{1,8}", 0..3),
            with_unrelated_file in any::<bool>(),
        ) {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut include = tmp.path().join(format!("linux-headers-{suffix}"));
            for n in &nested {
                include = include.join(n);
            }
            include = include.join("include");
            fs::create_dir_all(include.join("generated")).expect("mkdir");
            if with_unrelated_file {
                fs::write(include.join("generated/utsrelease.h"), "").expect("write");
            }
            let pkg = PackageDescriptor {
                version: Some(suffix),
                includedirs: vec![include],
                sysincludedirs: vec![],
            };
            let rejected = matches!(resolve_sdk(&pkg), Err(Error::Configuration(_)));
            prop_assert!(rejected);
        }
    }
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kmod::sdk::{KernelHeaderSdk, LINUX_HEADERS_PACKAGE, PackageDescriptor};
use crate::workspace::WorkspacePaths;

fn default_true() -> bool {
    true
}

fn default_packages() -> Vec<String> {
    vec![LINUX_HEADERS_PACKAGE.to_string()]
}

/// One `[[kmod.targets]]` entry of the build definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub name: String,
    pub arch: String,
    pub sources: Vec<String>,
    #[serde(default = "default_packages")]
    pub packages: Vec<String>,
    pub rules: Vec<String>,
    pub language: Option<String>,
    pub defines: Vec<String>,
    pub cflags: Vec<String>,
    pub includedirs: Vec<String>,
    pub fentry: bool,
    pub kasan: bool,
}

impl Default for TargetSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            name: String::new(),
            arch: String::new(),
            sources: Vec::new(),
            packages: default_packages(),
            rules: Vec::new(),
            language: None,
            defines: Vec::new(),
            cflags: Vec::new(),
            includedirs: Vec::new(),
            fentry: false,
            kasan: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Object,
    Binary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Features {
    pub fentry: bool,
    pub kasan: bool,
}

/// A kernel module as seen by the build graph.
///
/// The load stage is the only writer; compile and link only read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleBuildTarget {
    pub name: String,
    pub arch: String,
    pub kind: TargetKind,
    pub extension: String,
    /// The generic linker must not run; the module link pipeline owns linking.
    pub custom_link: bool,
    pub sources: Vec<PathBuf>,
    pub objects: Vec<PathBuf>,
    pub artifact: PathBuf,
    pub link_dir: PathBuf,
    pub sysincludedirs: Vec<PathBuf>,
    pub includedirs: Vec<PathBuf>,
    /// Include dirs a package would add on its own; cleared by the load stage.
    pub package_includedirs: Vec<PathBuf>,
    pub packages: Vec<String>,
    pub defines: Vec<String>,
    pub file_defines: BTreeMap<PathBuf, Vec<String>>,
    pub cflags: Vec<String>,
    pub language: Option<String>,
    pub rules: Vec<String>,
    pub auto_ignore_flags: bool,
    pub features: Features,
}

impl ModuleBuildTarget {
    /// Build the unconfigured target from its definition.
    pub fn from_spec(
        spec: &TargetSpec,
        ws: &WorkspacePaths,
        packages: &BTreeMap<String, PackageDescriptor>,
    ) -> Result<Self> {
        let name = spec.name.trim();
        validate_name(name)?;

        let mut sources = Vec::new();
        for raw in &spec.sources {
            sources.extend(expand_source(&ws.resolve(raw)?)?);
        }
        if sources.is_empty() {
            return Err(Error::config(format!("kmod target '{name}' has no sources")));
        }

        let obj_dir = ws.target_object_dir(name);
        let objects = sources
            .iter()
            .map(|s| object_path(&obj_dir, &ws.root, s))
            .collect();

        let mut package_includedirs = Vec::new();
        for p in &spec.packages {
            if let Some(desc) = packages.get(p) {
                package_includedirs.extend(desc.all_includedirs().cloned());
            }
        }

        let includedirs = spec
            .includedirs
            .iter()
            .map(|d| ws.resolve(d))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: name.to_string(),
            arch: spec.arch.trim().to_string(),
            kind: TargetKind::Object,
            extension: ".o".into(),
            custom_link: false,
            sources,
            objects,
            artifact: ws.out_dir.join(format!("{name}.ko")),
            link_dir: ws.target_link_dir(name),
            sysincludedirs: Vec::new(),
            includedirs,
            package_includedirs,
            packages: spec.packages.clone(),
            defines: spec.defines.clone(),
            file_defines: BTreeMap::new(),
            cflags: spec.cflags.clone(),
            language: spec.language.clone().filter(|l| !l.trim().is_empty()),
            rules: spec.rules.clone(),
            auto_ignore_flags: true,
            features: Features {
                fentry: spec.fentry,
                kasan: spec.kasan,
            },
        })
    }

    pub fn object_for(&self, source: &Path) -> Option<&Path> {
        self.sources
            .iter()
            .position(|s| s == source)
            .and_then(|i| self.objects.get(i))
            .map(PathBuf::as_path)
    }

    /// Include dirs the compiler actually sees, in order.
    pub fn effective_includedirs(&self) -> impl Iterator<Item = &PathBuf> {
        self.includedirs
            .iter()
            .chain(self.package_includedirs.iter())
    }
}

/// Output of the load stage, shared read-only with the compile and link tasks.
#[derive(Debug, Clone)]
pub struct ConfiguredTarget {
    pub target: Arc<ModuleBuildTarget>,
    pub sdk: Arc<KernelHeaderSdk>,
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::config("kmod.targets[].name is empty"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::config(format!(
            "kmod target name '{name}' contains invalid characters (allowed: a-zA-Z0-9_-)"
        )));
    }
    Ok(())
}

// A directory source expands to every `.c` file below it, sorted.
fn expand_source(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_dir() {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(path).follow_links(false) {
            let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
            if entry.file_type().is_file()
                && entry.path().extension().is_some_and(|e| e == "c")
            {
                out.push(entry.into_path());
            }
        }
        out.sort();
        return Ok(out);
    }
    Ok(vec![path.to_path_buf()])
}

fn object_path(obj_dir: &Path, root: &Path, source: &Path) -> PathBuf {
    let rel = source.strip_prefix(root).unwrap_or(source);
    let rel = rel.strip_prefix("/").unwrap_or(rel);
    obj_dir.join(rel).with_extension("o")
}

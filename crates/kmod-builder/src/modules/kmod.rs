use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use kmod_builder_macros::{Module, TargetTask, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::kmod::arch::Arch;
use crate::kmod::compile;
use crate::kmod::configure;
use crate::kmod::link::{self, LinkTools};
use crate::kmod::sdk::PackageDescriptor;
use crate::kmod::target::{ConfiguredTarget, ModuleBuildTarget, TargetSpec};
use crate::kmod::toolchain::ToolchainConfig;
use crate::modules::util;
use crate::workspace::WorkspacePaths;
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KmodConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub targets: Vec<TargetSpec>,
}

impl Default for KmodConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            targets: Vec::new(),
        }
    }
}

fn load_cfg(doc: &ConfigDoc) -> Result<KmodConfig> {
    Ok(doc.deserialize_path("kmod")?.unwrap_or_default())
}

pub fn toolchain_config(doc: &ConfigDoc) -> Result<ToolchainConfig> {
    Ok(doc.deserialize_path("toolchain")?.unwrap_or_default())
}

/// `[packages.*]` with relative include dirs rooted at the workspace root.
pub fn load_packages(
    doc: &ConfigDoc,
    ws: &WorkspacePaths,
) -> Result<BTreeMap<String, PackageDescriptor>> {
    let mut packages: BTreeMap<String, PackageDescriptor> =
        doc.deserialize_path("packages")?.unwrap_or_default();
    for pkg in packages.values_mut() {
        for dir in pkg.includedirs.iter_mut().chain(pkg.sysincludedirs.iter_mut()) {
            if dir.is_relative() {
                *dir = ws.root.join(&*dir);
            }
        }
    }
    Ok(packages)
}

/// Names of the enabled targets, in definition order.
pub fn enabled_targets(cfg: &KmodConfig) -> Result<Vec<String>> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for t in &cfg.targets {
        let name = t.name.trim();
        if name.is_empty() {
            return Err(Error::config("kmod.targets[].name is empty"));
        }
        if !seen.insert(name) {
            return Err(Error::config(format!("duplicate kmod target '{name}'")));
        }
        if t.enabled {
            out.push(name.to_string());
        }
    }
    Ok(out)
}

fn find_spec<'a>(cfg: &'a KmodConfig, target: &str) -> Result<&'a TargetSpec> {
    cfg.targets
        .iter()
        .find(|t| t.name.trim() == target)
        .ok_or_else(|| Error::config(format!("kmod target '{target}' is not defined")))
}

/// Create and configure one target outside of a task run (`kmodb resolve`
/// uses this too).
pub fn load_target(
    doc: &ConfigDoc,
    target: &str,
    ctx: &ExecCtx,
    ws: &WorkspacePaths,
) -> Result<ConfiguredTarget> {
    let cfg = load_cfg(doc)?;
    let spec = find_spec(&cfg, target)?;
    let packages = load_packages(doc, ws)?;

    let unconfigured = ModuleBuildTarget::from_spec(spec, ws, &packages)?;
    let sdk = configure::sdk_for_target(&unconfigured, &packages)?;
    ctx.log(&format!(
        "kernel headers {} at {}",
        sdk.version,
        sdk.sdk_dir.display()
    ));

    let tc = toolchain_config(doc)?;
    let probe = ctx.compiler_probe(Path::new(&tc.cc))?;
    let configured = configure::configure(unconfigured, &sdk, &probe, ctx)?;

    Ok(ConfiguredTarget {
        target: Arc::new(configured),
        sdk: Arc::new(sdk),
    })
}

#[Task(
    id = "kmod.toolchain",
    module = "kmod",
    phase = "probe",
    provides = ["kmod:toolchain"],
    after = ["core.init"],
    default_label = "Probe C compiler"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolchainTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ToolchainTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ToolchainTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        // Every enabled target's architecture is checked before the compiler
        // is spawned. The include dir probe is left to the load stage.
        let cfg = load_cfg(doc)?;
        for spec in cfg.targets.iter().filter(|t| t.enabled) {
            let arch = Arch::parse(&spec.arch)?;
            ctx.log(&format!("target {} = {arch}", spec.name.trim()));
        }

        let tc = toolchain_config(doc)?;
        let probe = ctx.compiler_probe(Path::new(&tc.cc))?;
        let family = probe.family(&*ctx);
        ctx.log(&format!("cc = {} ({family:?})", tc.cc));
        if !family.is_gnu() {
            return Err(Error::UnsupportedToolchain {
                compiler: tc.cc.clone(),
            });
        }
        ctx.log(&format!("ld = {}", tc.ld));
        Ok(())
    }
}

#[TargetTask(
    prefix = "kmod.load",
    module = "kmod",
    phase = "load",
    after = ["core.init", "kmod:toolchain?"],
    provides = ["kmod:{target}:configured"],
    default_label = "Configure"
)]
pub struct LoadTask;

impl LoadTask {
    pub fn run(target: &str, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let configured = load_target(doc, target, ctx, &ws)?;

        let t = &configured.target;
        ctx.log(&format!(
            "{} sources, {} include dirs, {} flags, -std={}",
            t.sources.len(),
            t.sysincludedirs.len() + t.includedirs.len(),
            t.cflags.len(),
            t.language.as_deref().unwrap_or_default()
        ));

        let manifest_path = ws.target_dir(target).join("target.json");
        let manifest = serde_json::json!({
            "target": serde_json::to_value(&**t)?,
            "sdk": serde_json::to_value(&*configured.sdk)?,
            "configured_at": chrono::Utc::now().to_rfc3339(),
        });
        util::write_json_pretty(&manifest_path, &manifest)?;
        ctx.log(&format!("wrote {}", manifest_path.display()));

        ctx.store_target(configured)
    }
}

#[TargetTask(
    prefix = "kmod.compile",
    module = "kmod",
    phase = "compile",
    after = ["kmod:{target}:configured"],
    provides = ["kmod:{target}:objects"],
    default_label = "Compile"
)]
pub struct CompileTask;

impl CompileTask {
    pub fn run(target: &str, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let configured = ctx.configured_target(target)?;
        let tc = toolchain_config(doc)?;
        let report = compile::compile_sources(
            &*ctx,
            Path::new(&tc.cc),
            &configured.target,
            ctx.rebuild,
        )?;
        ctx.log(&format!(
            "compiled {} object(s), {} up to date",
            report.compiled, report.up_to_date
        ));
        Ok(())
    }
}

#[TargetTask(
    prefix = "kmod.link",
    module = "kmod",
    phase = "link",
    after = ["kmod:{target}:objects"],
    provides = ["artifact:{target}.ko"],
    default_label = "Link"
)]
pub struct LinkTask;

impl LinkTask {
    pub fn run(target: &str, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let configured = ctx.configured_target(target)?;
        let tc = toolchain_config(doc)?;
        let tools = LinkTools {
            cc: Path::new(&tc.cc),
            ld: Path::new(&tc.ld),
        };
        let ran = link::link_module_if_changed(
            &*ctx,
            tools,
            &configured.target,
            &configured.sdk,
            ctx.rebuild,
        )?;
        let artifact = configured.target.artifact.display();
        if ran {
            ctx.log(&format!("built {artifact}"));
        } else {
            ctx.log(&format!("{artifact} is up to date"));
        }
        Ok(())
    }
}

#[Module(
    id = "kmod",
    config = KmodConfig,
    config_path = "kmod",
    tasks = [ToolchainTask],
    target_tasks = [LoadTask, CompileTask, LinkTask],
    targets = enabled_targets
)]
pub struct KmodModule;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::kmod::probe::CompilerProbe;
use crate::kmod::target::ConfiguredTarget;
use crate::kmod::toolchain::{SystemToolchain, ToolInvocation, ToolOutput, Toolchain};
use crate::log_sanitize::sanitize_log_line;
use crate::workspace::{WorkspaceConfig, WorkspacePaths};

mod schedule;
mod sink;

pub use schedule::{execute_plan, execute_plan_parallel};
pub use sink::{ExecEvent, ExecSink, StdoutSink};

pub type TaskExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

/// State every clone of one session's [`ExecCtx`] sees.
#[derive(Default)]
struct Session {
    workspace: Mutex<Option<WorkspacePaths>>,
    probes: Mutex<BTreeMap<PathBuf, Arc<CompilerProbe>>>,
    // Written by kmod.load:<t>, read by compile and link.
    targets: Mutex<BTreeMap<String, ConfiguredTarget>>,
}

fn poisoned(what: &str) -> Error {
    Error::msg(format!("{what} lock poisoned by a panicking task"))
}

/// What a task body gets to work with. Cloned per worker thread; clones share
/// the session.
#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    /// Ignore recorded change-detector state.
    pub rebuild: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_task_id: Option<String>,
    toolchain: Arc<dyn Toolchain>,
    session: Arc<Session>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            rebuild: false,
            sink,
            current_task_id: None,
            toolchain: Arc::new(SystemToolchain),
            session: Arc::default(),
        }
    }

    pub fn with_toolchain(mut self, toolchain: Arc<dyn Toolchain>) -> Self {
        self.toolchain = toolchain;
        self
    }

    pub fn with_rebuild(mut self, rebuild: bool) -> Self {
        self.rebuild = rebuild;
        self
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    pub fn workspace_paths(&self) -> Option<WorkspacePaths> {
        self.session.workspace.lock().ok()?.clone()
    }

    /// Paths set by core.init; resolved (without cleaning) when a task runs
    /// on its own.
    pub fn workspace_paths_or_init(&self, doc: &ConfigDoc) -> Result<WorkspacePaths> {
        let mut slot = self
            .session
            .workspace
            .lock()
            .map_err(|_| poisoned("workspace"))?;
        if let Some(p) = slot.as_ref() {
            return Ok(p.clone());
        }
        let cfg: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
        let paths = crate::workspace::init_dirs(&doc.base_dir(), &cfg.without_clean())?;
        *slot = Some(paths.clone());
        Ok(paths)
    }

    fn set_workspace_paths(&self, paths: WorkspacePaths) -> Result<()> {
        *self
            .session
            .workspace
            .lock()
            .map_err(|_| poisoned("workspace"))? = Some(paths);
        Ok(())
    }

    /// The session's probe for `cc`; created on first use.
    pub fn compiler_probe(&self, cc: &Path) -> Result<Arc<CompilerProbe>> {
        let mut probes = self.session.probes.lock().map_err(|_| poisoned("probe"))?;
        let probe = probes
            .entry(cc.to_path_buf())
            .or_insert_with(|| Arc::new(CompilerProbe::new(cc)));
        Ok(Arc::clone(probe))
    }

    pub fn store_target(&self, configured: ConfiguredTarget) -> Result<()> {
        self.session
            .targets
            .lock()
            .map_err(|_| poisoned("target"))?
            .insert(configured.target.name.clone(), configured);
        Ok(())
    }

    pub fn configured_target(&self, name: &str) -> Result<ConfiguredTarget> {
        let targets = self.session.targets.lock().map_err(|_| poisoned("target"))?;
        targets.get(name).cloned().ok_or_else(|| {
            Error::msg(format!(
                "kmod target '{name}' has not been loaded (kmod.load:{name} must run first)"
            ))
        })
    }

    pub fn log(&self, msg: &str) {
        self.sink.emit(ExecEvent::TaskLog {
            id: self
                .current_task_id
                .clone()
                .unwrap_or_else(|| "<none>".into()),
            line: msg.to_string(),
        });
    }
}

/// Every subprocess a task runs is echoed to the task log together with its
/// sanitized output.
impl Toolchain for ExecCtx {
    fn run(&self, inv: &ToolInvocation) -> Result<ToolOutput> {
        self.log(&format!("$ {inv}"));
        let out = self.toolchain.run(inv)?;
        out.combined()
            .lines()
            .map(sanitize_log_line)
            .filter(|l| !l.is_empty())
            .for_each(|l| self.log(&l));
        if !out.success {
            self.log(&format!("{} exited with {}", inv.program_name(), out.status));
        }
        Ok(out)
    }
}

/// Task id to body. Per-target tasks (`<prefix>:<target>`) are registered
/// once under their prefix.
#[derive(Default)]
pub struct TaskRegistry {
    exact: BTreeMap<&'static str, TaskExecFn>,
    prefixed: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exact.insert(id, f).is_some() {
            return Err(Error::msg(format!("duplicate task executor for '{id}'")));
        }
        Ok(())
    }

    pub fn add_prefixed(&mut self, prefix: &'static str, f: TaskExecFn) -> Result<()> {
        if self.prefixed.insert(prefix, f).is_some() {
            return Err(Error::msg(format!(
                "duplicate task executor for '{prefix}:*'"
            )));
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        if let Some(f) = self.exact.get(id) {
            return Some(*f);
        }
        match id.split_once(':') {
            Some((prefix, target)) if !target.is_empty() => self.prefixed.get(prefix).copied(),
            _ => None,
        }
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    reg.add("core.init", core_init)?;
    crate::modules::kmod::KmodModule::register_tasks(&mut reg)?;
    Ok(reg)
}

fn core_init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let cfg: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
    ctx.log(&format!("workspace.clean = {}", cfg.clean.as_str()));

    let paths = crate::workspace::init_dirs(&doc.base_dir(), &cfg)?;
    ctx.log(&format!("workspace.root = {}", paths.root.display()));
    ctx.log(&format!("workspace.build_dir = {}", paths.build_dir.display()));
    ctx.log(&format!("workspace.out_dir = {}", paths.out_dir.display()));
    ctx.set_workspace_paths(paths)
}

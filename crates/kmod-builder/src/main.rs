use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kmod_builder::executor::{self, ExecCtx, ExecEvent, ExecSink, StdoutSink};
use kmod_builder::kmod::{CompilerProbe, SystemToolchain, Toolchain};
use kmod_builder::workspace::{self, WorkspaceConfig};
use kmod_builder::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Emit library diagnostics as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load config and print the computed task plan
    Plan {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Load config, compute the plan, and build every enabled module
    Run {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Print what would run without executing task bodies
        #[arg(long)]
        dry_run: bool,
        /// Max number of tasks to execute concurrently (0 = use CPU count)
        #[arg(long, default_value_t = 0)]
        max_parallel: usize,
        /// Ignore recorded change-detector state and rebuild everything
        #[arg(long)]
        rebuild: bool,
    },
    /// Print the fully-resolved TOML (after imports/extends), or one
    /// configured target as JSON
    Resolve {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Configure this target and print its compiler inputs
        #[arg(long)]
        target: Option<String>,
    },
    /// Report what the C compiler looks like to the build
    Probe {
        #[arg(long, default_value = "gcc")]
        cc: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);
    match args.cmd {
        Command::Plan { build, dot } => cmd_plan(&build, dot),
        Command::Run {
            build,
            dry_run,
            max_parallel,
            rebuild,
        } => cmd_run(&build, dry_run, max_parallel, rebuild),
        Command::Resolve { build, target } => cmd_resolve(&build, target.as_deref()),
        Command::Probe { cc } => cmd_probe(&cc),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn cmd_plan(path: &Path, dot: bool) -> Result<()> {
    let doc = kmod_builder::config::load(path)?;
    let plan = kmod_builder::modules::build_plan(&doc)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    let ordered = plan.ordered()?;
    for (i, task) in ordered.iter().enumerate() {
        println!(
            "{:>2}. {:<26}  {:<6} {:<8}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_resolve(path: &Path, target: Option<&str>) -> Result<()> {
    let doc = kmod_builder::config::load(path)?;

    let Some(target) = target else {
        let s = toml::to_string_pretty(&doc.value)
            .map_err(|e| Error::msg(format!("failed to render resolved config: {e}")))?;
        print!("{s}");
        return Ok(());
    };

    let ws_cfg: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
    let ws = workspace::load_paths(&doc.base_dir(), &ws_cfg)?;
    let ctx = ExecCtx::new(false, Arc::new(StderrLogSink));
    let configured = kmod_builder::modules::kmod::load_target(&doc, target, &ctx, &ws)?;
    let out = serde_json::json!({
        "target": serde_json::to_value(&*configured.target)?,
        "sdk": serde_json::to_value(&*configured.sdk)?,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

/// Keeps stdout clean for the JSON printed by `resolve --target`.
struct StderrLogSink;

impl ExecSink for StderrLogSink {
    fn emit(&self, ev: ExecEvent) {
        if let ExecEvent::TaskLog { line, .. } = ev {
            eprintln!("{line}");
        }
    }
}

fn cmd_probe(cc: &Path) -> Result<()> {
    let tc: &dyn Toolchain = &SystemToolchain;
    let probe = CompilerProbe::new(cc);
    let family = probe.family(tc);
    println!("cc = {}", probe.cc().display());
    println!("family = {family:?}");
    match probe.include_dir(tc) {
        Some(dir) => println!("include_dir = {}", dir.display()),
        None => println!("include_dir = (not found)"),
    }
    if !family.is_gnu() {
        return Err(Error::UnsupportedToolchain {
            compiler: cc.display().to_string(),
        });
    }
    Ok(())
}

fn cmd_run(path: &Path, dry_run: bool, max_parallel: usize, rebuild: bool) -> Result<()> {
    let doc = kmod_builder::config::load(path)?;
    let plan = kmod_builder::modules::build_plan(&doc)?;

    let ws_cfg: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
    let ws = workspace::load_paths(&doc.base_dir(), &ws_cfg)?;

    let reg = executor::builtin_registry()?;
    let sink = Arc::new(StdoutSink::with_error_logs_root(ws.error_logs_dir()));
    let mut ctx = ExecCtx::new(dry_run, sink).with_rebuild(rebuild);

    let max_parallel = if max_parallel == 0 {
        num_cpus::get().max(1)
    } else {
        max_parallel.max(1)
    };
    tracing::info!(tasks = plan.len(), max_parallel, dry_run, rebuild, "executing plan");

    if max_parallel <= 1 || dry_run {
        executor::execute_plan(&doc, &plan, &reg, &mut ctx)?;
    } else {
        executor::execute_plan_parallel(&doc, &plan, &reg, &ctx, max_parallel)?;
    }
    Ok(())
}

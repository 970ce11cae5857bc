#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use kmod_builder::executor::{ExecEvent, ExecSink};
use kmod_builder::kmod::{ToolInvocation, ToolOutput, Toolchain};

/// Stands in for gcc, ld and modpost: records every call and writes the
/// files the real tools would produce.
#[derive(Default)]
pub struct FakeToolchain {
    pub calls: Mutex<Vec<ToolInvocation>>,
    /// Program name (`gcc`, `ld`, `modpost`) that exits non-zero.
    pub fail: Option<&'static str>,
}

impl FakeToolchain {
    pub fn failing(program: &'static str) -> Self {
        Self {
            fail: Some(program),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn count(&self, program: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.program_name() == program)
            .count()
    }

    pub fn compile_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.program_name() == "gcc" && c.args.first().map(String::as_str) == Some("-c"))
            .count()
    }

    pub fn reset(&self) {
        self.calls.lock().expect("lock").clear();
    }
}

fn output_arg(args: &[String]) -> Option<PathBuf> {
    args.iter()
        .position(|a| a == "-o")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
}

fn ok() -> ToolOutput {
    ToolOutput {
        success: true,
        status: "exit status: 0".into(),
        stdout: String::new(),
        stderr: String::new(),
    }
}

impl Toolchain for FakeToolchain {
    fn run(&self, inv: &ToolInvocation) -> kmod_builder::Result<ToolOutput> {
        self.calls.lock().expect("lock").push(inv.clone());
        let name = inv.program_name();
        if self.fail == Some(name.as_str()) {
            return Ok(ToolOutput {
                success: false,
                status: "exit status: 1".into(),
                stdout: String::new(),
                stderr: format!("{name}: simulated failure\n"),
            });
        }
        match name.as_str() {
            "modpost" => {
                let order = inv.stdin.as_ref().expect("modpost reads modules.order");
                let listing = fs::read_to_string(order).expect("read modules.order");
                for partial in listing.lines().filter(|l| !l.is_empty()) {
                    let glue = Path::new(partial).with_extension("mod.c");
                    fs::write(glue, "/* generated */\n").expect("write glue");
                }
                if let Some(symvers) = output_arg(&inv.args) {
                    fs::write(symvers, "").expect("write symvers");
                }
            }
            _ => {
                if let Some(out) = output_arg(&inv.args) {
                    if let Some(parent) = out.parent() {
                        fs::create_dir_all(parent).expect("mkdir output parent");
                    }
                    fs::write(&out, format!("{name} output\n")).expect("write output");
                }
            }
        }
        Ok(ok())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<ExecEvent>>,
}

impl RecordingSink {
    pub fn finished(&self) -> Vec<(String, bool)> {
        self.events
            .lock()
            .expect("lock")
            .iter()
            .filter_map(|e| match e {
                ExecEvent::TaskFinished { id, ok, .. } => Some((id.clone(), *ok)),
                _ => None,
            })
            .collect()
    }

    pub fn log_lines(&self, task: &str) -> Vec<String> {
        self.events
            .lock()
            .expect("lock")
            .iter()
            .filter_map(|e| match e {
                ExecEvent::TaskLog { id, line } if id == task => Some(line.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ExecSink for RecordingSink {
    fn emit(&self, ev: ExecEvent) {
        self.events.lock().expect("lock").push(ev);
    }
}

/// A configured kernel tree under `root`: `linux-headers-<version>/include`
/// with the autoconf marker plus the modpost binary and linker script.
pub fn fake_sdk(root: &Path, version: &str) -> PathBuf {
    let sdk = root.join(format!("linux-headers-{version}"));
    let include = sdk.join("include");
    fs::create_dir_all(include.join("generated")).expect("mkdir include");
    fs::write(include.join("generated").join("autoconf.h"), "").expect("write autoconf.h");
    fs::create_dir_all(sdk.join("scripts").join("mod")).expect("mkdir scripts");
    fs::write(sdk.join("scripts").join("mod").join("modpost"), "").expect("write modpost");
    fs::write(sdk.join("scripts").join("module.lds"), "").expect("write module.lds");
    include
}

pub fn write_sources(dir: &Path, names: &[&str]) {
    fs::create_dir_all(dir).expect("mkdir src");
    for n in names {
        fs::write(dir.join(n), format!("/* {n} */\n")).expect("write source");
    }
}

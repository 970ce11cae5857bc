use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_log_line;

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskSpawned {
        id: String,
    },
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

// Lines kept per task for its failure log.
const TASK_LOG_TAIL: usize = 4000;

/// Line-oriented progress on stdout. A failed task gets a log file with the
/// tail of its output under `<error logs root>/<timestamp>/<task>.log`.
#[derive(Default)]
pub struct StdoutSink {
    error_logs_root: Option<PathBuf>,
    run: Mutex<RunState>,
}

#[derive(Default)]
struct RunState {
    started_at: Option<Instant>,
    spawned: usize,
    started: usize,
    ok: usize,
    failed: Vec<String>,
    log_lines: usize,
    task_time: Duration,
    tails: BTreeMap<String, VecDeque<String>>,
    // Created on the first failure of a run.
    run_dir: Option<PathBuf>,
    error_logs: BTreeMap<String, PathBuf>,
}

impl StdoutSink {
    /// Without a root, failure logs go to `./build/error-logs`.
    pub fn with_error_logs_root(root: impl Into<PathBuf>) -> Self {
        Self {
            error_logs_root: Some(root.into()),
            run: Mutex::default(),
        }
    }

    fn logs_root(&self) -> PathBuf {
        self.error_logs_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("build").join("error-logs"))
    }

    fn write_error_log(
        &self,
        run: &mut RunState,
        id: &str,
        error: &str,
        elapsed_ms: u128,
    ) -> Result<PathBuf> {
        if let Some(existing) = run.error_logs.get(id) {
            return Ok(existing.clone());
        }
        let dir = match &run.run_dir {
            Some(d) => d.clone(),
            None => {
                let d = self
                    .logs_root()
                    .join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
                fs::create_dir_all(&d).map_err(|e| {
                    Error::msg(format!("failed to create {}: {e}", d.display()))
                })?;
                run.run_dir = Some(d.clone());
                d
            }
        };

        let mut body = format!("task: {id}\nstatus: failed\nelapsed_ms: {elapsed_ms}\n");
        if !error.trim().is_empty() {
            let _ = writeln!(body, "error: {error}");
        }
        body.push_str("\nlogs:\n");
        for line in run.tails.get(id).into_iter().flatten() {
            body.push_str(line);
            body.push('\n');
        }

        let path = dir.join(format!("{}.log", file_component(id)));
        fs::write(&path, body)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;
        run.error_logs.insert(id.to_string(), path.clone());
        Ok(path)
    }
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        let Ok(mut run) = self.run.lock() else {
            return;
        };
        match ev {
            ExecEvent::TaskSpawned { id } => {
                run.spawned += 1;
                println!("SPAWN: {id}");
            }
            ExecEvent::TaskStarted { id } => {
                run.started += 1;
                run.started_at.get_or_insert_with(Instant::now);
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => {
                run.log_lines += 1;
                let tail = run.tails.entry(id.clone()).or_default();
                if tail.len() == TASK_LOG_TAIL {
                    tail.pop_front();
                }
                tail.push_back(sanitize_log_line(&line));
                println!("[{id}] {line}");
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                run.task_time += Duration::from_millis(elapsed_ms.try_into().unwrap_or(u64::MAX));
                if ok {
                    run.ok += 1;
                    run.tails.remove(&id);
                    println!("DONE: {id} ({elapsed_ms}ms)");
                    return;
                }
                let error = error.unwrap_or_default();
                run.failed.push(id.clone());
                println!("FAIL: {id} ({elapsed_ms}ms) {error}");
                match self.write_error_log(&mut run, &id, &error, elapsed_ms) {
                    Ok(path) => println!("ERROR_LOG: {id} => {}", path.display()),
                    Err(e) => println!("WARN: no error log for {id}: {e}"),
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                match (&error, ok) {
                    (_, true) => println!("DONE: ok"),
                    (Some(e), false) => println!("DONE: failed {e}"),
                    (None, false) => println!("DONE: failed"),
                }
                print!("{}", summary(&run, ok));
                *run = RunState::default();
            }
        }
    }
}

fn summary(run: &RunState, ok: bool) -> String {
    let wall = run.started_at.map(|t| t.elapsed()).unwrap_or_default();
    let mut out = String::from("SUMMARY:\n");
    let _ = writeln!(out, "  status: {}", if ok { "ok" } else { "failed" });
    let _ = writeln!(
        out,
        "  tasks: spawned={} started={} ok={} failed={}",
        run.spawned,
        run.started,
        run.ok,
        run.failed.len()
    );
    let _ = writeln!(out, "  logs: {}", run.log_lines);
    let _ = writeln!(out, "  elapsed: {}", hms(wall));
    let _ = writeln!(out, "  summed_task_time: {}", hms(run.task_time));
    if !run.failed.is_empty() {
        let _ = writeln!(out, "  failed_tasks: {}", run.failed.join(", "));
    }
    if !run.error_logs.is_empty() {
        out.push_str("  error_logs:\n");
        for path in run.error_logs.values() {
            let _ = writeln!(out, "    {}", path.display());
        }
    }
    out
}

fn hms(d: Duration) -> String {
    let s = d.as_secs();
    format!("{:02}:{:02}:{:02}", s / 3600, s / 60 % 60, s % 60)
}

/// Task ids contain `:`; keep file names portable.
fn file_component(id: &str) -> String {
    let out: String = id
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect();
    if out.is_empty() { "task".into() } else { out }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_task_log_contains_sanitized_output() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sink = StdoutSink::with_error_logs_root(tmp.path());
        sink.emit(ExecEvent::TaskLog {
            id: "kmod.link:hello".into(),
            line: "\u{1b}[31mERROR: modpost: missing symbol\u{1b}[0m".into(),
        });
        sink.emit(ExecEvent::TaskFinished {
            id: "kmod.link:hello".into(),
            ok: false,
            error: Some("link stage 4 (modpost) failed".into()),
            elapsed_ms: 12,
        });

        let logs: Vec<PathBuf> = walkdir::WalkDir::new(tmp.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].ends_with("kmod.link_hello.log"));
        let body = fs::read_to_string(&logs[0]).expect("read log");
        assert!(body.contains("error: link stage 4 (modpost) failed"), "{body}");
        assert!(body.contains("ERROR: modpost: missing symbol"), "{body}");
        assert!(!body.contains('\u{1b}'), "{body}");
    }

    #[test]
    fn successful_tasks_leave_no_log() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sink = StdoutSink::with_error_logs_root(tmp.path());
        sink.emit(ExecEvent::TaskLog {
            id: "kmod.load:a".into(),
            line: "configured".into(),
        });
        sink.emit(ExecEvent::TaskFinished {
            id: "kmod.load:a".into(),
            ok: true,
            error: None,
            elapsed_ms: 1,
        });
        sink.emit(ExecEvent::ExecutorDone {
            ok: true,
            error: None,
        });
        assert_eq!(fs::read_dir(tmp.path()).expect("read dir").count(), 0);
    }

    #[test]
    fn formatting_helpers() {
        assert_eq!(hms(Duration::from_secs(3725)), "01:02:05");
        assert_eq!(file_component("kmod.load:a/b"), "kmod.load_a_b");
        assert_eq!(file_component(""), "task");
    }
}

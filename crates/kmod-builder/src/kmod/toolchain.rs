use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_cc() -> String {
    "gcc".into()
}

fn default_ld() -> String {
    "ld".into()
}

/// `[toolchain]` table of the build definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub cc: String,
    pub ld: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            cc: default_cc(),
            ld: default_ld(),
        }
    }
}

/// One program run: what to spawn and where its stdin comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdin: Option<PathBuf>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, p: &Path) -> Self {
        self.arg(p.display().to_string())
    }

    pub fn stdin_from(mut self, p: impl Into<PathBuf>) -> Self {
        self.stdin = Some(p.into());
        self
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for a in &self.args {
            if a.is_empty() || a.contains(char::is_whitespace) || a.contains('"') {
                write!(f, " '{a}'")?;
            } else {
                write!(f, " {a}")?;
            }
        }
        if let Some(stdin) = &self.stdin {
            write!(f, " < {}", stdin.display())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// stdout followed by stderr, for diagnostics.
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        out.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stdout.ends_with('\n') && !self.stderr.is_empty() {
            out.push('\n');
        }
        out.push_str(&self.stderr);
        out
    }
}

/// Runs compilers, linkers and kernel scripts.
///
/// `Err` means the program could not be run at all; a program that ran and
/// exited non-zero is an `Ok` output with `success == false`.
pub trait Toolchain: Send + Sync {
    fn run(&self, inv: &ToolInvocation) -> Result<ToolOutput>;
}

/// Spawns real processes and blocks until they exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemToolchain;

impl Toolchain for SystemToolchain {
    fn run(&self, inv: &ToolInvocation) -> Result<ToolOutput> {
        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        match &inv.stdin {
            Some(p) => {
                let f = File::open(p).map_err(|e| {
                    Error::msg(format!("failed to open stdin file {}: {e}", p.display()))
                })?;
                cmd.stdin(Stdio::from(f));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }

        tracing::debug!(cmd = %inv, "spawning");
        let out = cmd.output().map_err(|e| {
            Error::msg(format!("failed to spawn {}: {e}", inv.program.display()))
        })?;
        Ok(ToolOutput {
            success: out.status.success(),
            status: out.status.to_string(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_quotes_args_with_spaces_and_quotes() {
        let inv = ToolInvocation::new("/usr/bin/gcc")
            .arg("-c")
            .arg("-DKBUILD_MODNAME=\"hello\"")
            .arg("a b.c")
            .stdin_from("/tmp/order");
        assert_eq!(
            inv.to_string(),
            "/usr/bin/gcc -c '-DKBUILD_MODNAME=\"hello\"' 'a b.c' < /tmp/order"
        );
        assert_eq!(inv.program_name(), "gcc");
    }

    #[test]
    fn combined_output_separates_streams() {
        let out = ToolOutput {
            success: false,
            status: "exit status: 1".into(),
            stdout: "first".into(),
            stderr: "second\n".into(),
        };
        assert_eq!(out.combined(), "first\nsecond\n");
    }

    #[cfg(unix)]
    #[test]
    fn system_toolchain_captures_exit_status_and_stdin() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let input = tmp.path().join("in.txt");
        std::fs::write(&input, "from stdin\n").expect("write");

        let out = SystemToolchain
            .run(&ToolInvocation::new("cat").stdin_from(&input))
            .expect("run cat");
        assert!(out.success);
        assert_eq!(out.stdout, "from stdin\n");

        let out = SystemToolchain
            .run(&ToolInvocation::new("sh").args(["-c", "echo oops >&2; exit 3"]))
            .expect("run sh");
        assert!(!out.success);
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[test]
    fn missing_program_is_an_error() {
        let err = SystemToolchain
            .run(&ToolInvocation::new("/definitely/not/a/program"))
            .expect_err("spawn must fail");
        assert!(err.to_string().contains("failed to spawn"), "{err}");
    }
}

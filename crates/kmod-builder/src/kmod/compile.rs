use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::kmod::depend::{self, DependInputs};
use crate::kmod::target::ModuleBuildTarget;
use crate::kmod::toolchain::{ToolInvocation, ToolOutput, Toolchain};
use crate::modules::util::ensure_dir;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileReport {
    pub compiled: usize,
    pub up_to_date: usize,
}

/// Compiler arguments for one translation unit of a configured target.
///
/// Order: `-c`, target flags, `-std`, `-isystem` dirs, `-I` dirs, target
/// defines, per-file defines, then `-o <obj> <src>`.
pub fn compile_args(target: &ModuleBuildTarget, src: &Path, obj: &Path) -> Vec<String> {
    let mut args = vec!["-c".to_string()];
    args.extend(target.cflags.iter().cloned());
    if let Some(lang) = &target.language {
        args.push(format!("-std={lang}"));
    }
    for d in &target.sysincludedirs {
        args.push("-isystem".into());
        args.push(d.display().to_string());
    }
    for d in target.effective_includedirs() {
        args.push(format!("-I{}", d.display()));
    }
    for d in &target.defines {
        args.push(format!("-D{d}"));
    }
    if let Some(per_file) = target.file_defines.get(src) {
        args.extend(per_file.iter().map(|d| format!("-D{d}")));
    }
    args.push("-o".into());
    args.push(obj.display().to_string());
    args.push(src.display().to_string());
    args
}

pub fn compile_invocation(
    cc: &Path,
    target: &ModuleBuildTarget,
    src: &Path,
    obj: &Path,
) -> ToolInvocation {
    ToolInvocation::new(cc).args(compile_args(target, src, obj))
}

/// Compile one file; a non-zero exit carries the compiler diagnostics.
pub fn compile_one(
    tc: &dyn Toolchain,
    cc: &Path,
    target: &ModuleBuildTarget,
    src: &Path,
    obj: &Path,
) -> Result<ToolOutput> {
    if let Some(parent) = obj.parent() {
        ensure_dir(parent)?;
    }
    let inv = compile_invocation(cc, target, src, obj);
    let out = tc.run(&inv)?;
    if !out.success {
        return Err(Error::msg(format!(
            "compile {} failed ({}):\n{}",
            src.display(),
            out.status,
            out.combined().trim_end()
        )));
    }
    Ok(out)
}

pub fn dep_file_for(obj: &Path) -> PathBuf {
    let mut s = OsString::from(obj.as_os_str());
    s.push(".dep.json");
    PathBuf::from(s)
}

/// Compile every source of the target whose object is out of date.
pub fn compile_sources(
    tc: &dyn Toolchain,
    cc: &Path,
    target: &ModuleBuildTarget,
    force: bool,
) -> Result<CompileReport> {
    let mut report = CompileReport::default();
    for (src, obj) in target.sources.iter().zip(&target.objects) {
        let mut values = vec![cc.display().to_string()];
        values.extend(compile_args(target, src, obj));
        let inputs = DependInputs {
            files: vec![src.clone()],
            values,
            artifact: obj.clone(),
            force,
        };
        let ran = depend::on_changed(&dep_file_for(obj), &inputs, || {
            compile_one(tc, cc, target, src, obj).map(|_| ())
        })?;
        if ran {
            report.compiled += 1;
        } else {
            report.up_to_date += 1;
        }
    }
    tracing::info!(
        kmod = %target.name,
        compiled = report.compiled,
        up_to_date = report.up_to_date,
        "compiled sources"
    );
    Ok(report)
}

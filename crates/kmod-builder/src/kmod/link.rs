//! Module link pipeline: the out-of-tree replay of kbuild's module
//! finalization (`modpost` and the final `.ko` link).

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, LinkStage, Result};
use crate::kmod::arch::Arch;
use crate::kmod::compile;
use crate::kmod::depend::{self, DependInputs};
use crate::kmod::sdk::KernelHeaderSdk;
use crate::kmod::target::ModuleBuildTarget;
use crate::kmod::toolchain::{ToolInvocation, ToolOutput, Toolchain};
use crate::modules::util::{ensure_dir, write_text};

/// Programs the pipeline spawns besides the SDK's `modpost`.
#[derive(Debug, Clone, Copy)]
pub struct LinkTools<'a> {
    pub cc: &'a Path,
    pub ld: &'a Path,
}

/// Files produced while linking one module. All but `artifact` live in the
/// target's link scratch dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLinkArtifacts {
    pub partial: PathBuf,
    pub descriptor: PathBuf,
    pub order: PathBuf,
    pub symvers: PathBuf,
    pub glue_src: PathBuf,
    pub glue_obj: PathBuf,
    /// One empty `.<obj>.cmd` per object, next to the object.
    pub stubs: Vec<PathBuf>,
    pub artifact: PathBuf,
    pub tmp_artifact: PathBuf,
}

impl ModuleLinkArtifacts {
    pub fn for_target(target: &ModuleBuildTarget) -> Self {
        let dir = &target.link_dir;
        let name = &target.name;
        let mut tmp_name = target
            .artifact
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| format!("{name}.ko").into());
        tmp_name.push(".tmp");
        Self {
            partial: dir.join(format!("{name}.o")),
            descriptor: dir.join(format!("{name}.mod")),
            order: dir.join("modules.order"),
            symvers: dir.join("Module.symvers"),
            glue_src: dir.join(format!("{name}.mod.c")),
            glue_obj: dir.join(format!("{name}.mod.o")),
            stubs: target.objects.iter().map(|o| command_stub_for(o)).collect(),
            artifact: target.artifact.clone(),
            tmp_artifact: target.artifact.with_file_name(tmp_name),
        }
    }
}

/// `<dir>/.<file>.cmd` for an object `<dir>/<file>`.
pub fn command_stub_for(obj: &Path) -> PathBuf {
    let file = obj
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    obj.with_file_name(format!(".{file}.cmd"))
}

pub fn link_state_file(target: &ModuleBuildTarget) -> PathBuf {
    target.link_dir.with_file_name("link.dep.json")
}

fn stage_error(stage: LinkStage, message: impl Into<String>, output: impl Into<String>) -> Error {
    Error::LinkStage {
        stage,
        message: message.into(),
        output: output.into(),
    }
}

fn io_stage(stage: LinkStage) -> impl Fn(Error) -> Error {
    move |e| stage_error(stage, e.to_string(), "")
}

fn run_tool(tc: &dyn Toolchain, stage: LinkStage, inv: &ToolInvocation) -> Result<ToolOutput> {
    tracing::debug!(%stage, cmd = %inv, "running");
    let out = tc
        .run(inv)
        .map_err(|e| stage_error(stage, e.to_string(), ""))?;
    if !out.success {
        return Err(stage_error(
            stage,
            format!("{} exited with {}", inv.program_name(), out.status),
            out.combined(),
        ));
    }
    Ok(out)
}

fn remove_if_exists(p: &Path) {
    match fs::remove_file(p) {
        Ok(()) => tracing::debug!(path = %p.display(), "removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %p.display(), error = %e, "failed to remove"),
    }
}

/// Link a configured target into its `.ko`. On failure no artifact is left
/// at the artifact path.
pub fn link_module(
    tc: &dyn Toolchain,
    tools: LinkTools<'_>,
    target: &ModuleBuildTarget,
    sdk: &KernelHeaderSdk,
) -> Result<PathBuf> {
    let modpost = sdk.modpost();
    let lds = sdk.module_lds();
    for tool in [&modpost, &lds] {
        if !tool.is_file() {
            return Err(Error::MissingTool { path: tool.clone() });
        }
    }
    let link_args = Arch::parse(&target.arch)?.profile().link_args;
    let files = ModuleLinkArtifacts::for_target(target);

    let res = run_stages(tc, tools, target, &modpost, &lds, link_args, &files);
    if res.is_err() {
        remove_if_exists(&files.tmp_artifact);
        remove_if_exists(&files.artifact);
    }
    res.map(|()| files.artifact)
}

fn run_stages(
    tc: &dyn Toolchain,
    tools: LinkTools<'_>,
    target: &ModuleBuildTarget,
    modpost: &Path,
    lds: &Path,
    link_args: &[&str],
    files: &ModuleLinkArtifacts,
) -> Result<()> {
    ensure_dir(&target.link_dir).map_err(io_stage(LinkStage::PartialLink))?;

    // 1
    let stage = LinkStage::PartialLink;
    tracing::info!(kmod = %target.name, %stage, "linking");
    let mut inv = ToolInvocation::new(tools.ld)
        .args(link_args.iter().copied())
        .arg("-r")
        .arg("-o")
        .path_arg(&files.partial);
    for obj in &target.objects {
        inv = inv.path_arg(obj);
    }
    run_tool(tc, stage, &inv)?;

    // 2
    let stage = LinkStage::ModDescriptor;
    let listing = target
        .objects
        .iter()
        .map(|o| o.display().to_string())
        .collect::<Vec<_>>()
        .join(" ");
    write_text(&files.descriptor, &format!("{listing}\n")).map_err(io_stage(stage))?;

    // 3
    let stage = LinkStage::CommandStubs;
    for stub in &files.stubs {
        write_text(stub, "").map_err(io_stage(stage))?;
    }

    // 4
    let stage = LinkStage::Modpost;
    tracing::info!(kmod = %target.name, %stage, "post-processing");
    write_text(&files.order, &format!("{}\n", files.partial.display()))
        .map_err(io_stage(stage))?;
    let inv = ToolInvocation::new(modpost)
        .args(["-m", "-a", "-o"])
        .path_arg(&files.symvers)
        .args(["-e", "-N", "-T", "-"])
        .stdin_from(&files.order);
    run_tool(tc, stage, &inv)?;
    if !files.glue_src.is_file() {
        return Err(stage_error(
            stage,
            format!("modpost did not produce {}", files.glue_src.display()),
            "",
        ));
    }

    // 5
    let stage = LinkStage::GlueCompile;
    let inv = compile::compile_invocation(tools.cc, target, &files.glue_src, &files.glue_obj);
    run_tool(tc, stage, &inv)?;

    // 6
    let stage = LinkStage::FinalLink;
    tracing::info!(kmod = %target.name, %stage, "linking");
    if let Some(parent) = files.artifact.parent() {
        ensure_dir(parent).map_err(io_stage(stage))?;
    }
    remove_if_exists(&files.tmp_artifact);
    let inv = ToolInvocation::new(tools.ld)
        .args(link_args.iter().copied())
        .args(["-r", "--build-id=sha1", "-T"])
        .path_arg(lds)
        .arg("-o")
        .path_arg(&files.tmp_artifact)
        .path_arg(&files.partial)
        .path_arg(&files.glue_obj);
    run_tool(tc, stage, &inv)?;
    fs::rename(&files.tmp_artifact, &files.artifact).map_err(|e| {
        stage_error(
            stage,
            format!(
                "failed to move {} to {}: {e}",
                files.tmp_artifact.display(),
                files.artifact.display()
            ),
            "",
        )
    })?;
    Ok(())
}

/// [`link_module`] gated by the change detector over the target's objects.
/// Returns whether the pipeline ran.
pub fn link_module_if_changed(
    tc: &dyn Toolchain,
    tools: LinkTools<'_>,
    target: &ModuleBuildTarget,
    sdk: &KernelHeaderSdk,
    force: bool,
) -> Result<bool> {
    let mut values = vec![
        tools.cc.display().to_string(),
        tools.ld.display().to_string(),
        sdk.version.clone(),
        sdk.sdk_dir.display().to_string(),
    ];
    values.extend(target.cflags.iter().cloned());
    let inputs = DependInputs {
        files: target.objects.clone(),
        values,
        artifact: target.artifact.clone(),
        force,
    };
    depend::on_changed(&link_state_file(target), &inputs, || {
        link_module(tc, tools, target, sdk).map(|_| ())
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::kmod::target::TargetSpec;
    use crate::workspace::WorkspacePaths;

    #[test]
    fn command_stub_names() {
        assert_eq!(
            command_stub_for(Path::new("/b/obj/src/main.o")),
            PathBuf::from("/b/obj/src/.main.o.cmd")
        );
    }

    #[test]
    fn artifacts_cover_every_generated_file() {
        let ws = WorkspacePaths {
            root: PathBuf::from("/work"),
            build_dir: PathBuf::from("/work/build"),
            out_dir: PathBuf::from("/work/out"),
        };
        let spec = TargetSpec {
            name: "hello".into(),
            arch: "x86_64".into(),
            sources: vec!["main.c".into(), "sub/util.c".into()],
            ..TargetSpec::default()
        };
        let target = ModuleBuildTarget::from_spec(&spec, &ws, &BTreeMap::new()).expect("target");
        let files = ModuleLinkArtifacts::for_target(&target);

        assert_eq!(files.partial, target.link_dir.join("hello.o"));
        assert_eq!(files.glue_src, target.link_dir.join("hello.mod.c"));
        assert_eq!(files.tmp_artifact, PathBuf::from("/work/out/hello.ko.tmp"));
        assert_eq!(files.stubs.len(), 2);
        for (stub, obj) in files.stubs.iter().zip(&target.objects) {
            assert_eq!(stub.parent(), obj.parent());
            let obj_name = obj.file_name().expect("name").to_string_lossy();
            assert_eq!(stub.file_name().expect("name").to_string_lossy(), format!(".{obj_name}.cmd"));
        }
    }

    #[test]
    fn stage_error_carries_index_and_output() {
        let err = stage_error(LinkStage::Modpost, "modpost exited with 1", "ERROR: undefined!");
        assert_eq!(err.link_stage().map(LinkStage::index), Some(4));
        let text = err.to_string();
        assert!(text.starts_with("link stage 4 (modpost) failed"), "{text}");
        assert!(text.contains("undefined!"), "{text}");
    }
}

//! Out-of-tree Linux kernel module builds: SDK lookup, compiler probing,
//! kernel flag configuration, compilation and the modpost link pipeline.

pub mod arch;
pub mod compile;
pub mod configure;
pub mod depend;
pub mod link;
pub mod probe;
pub mod sdk;
pub mod target;
pub mod toolchain;

pub use arch::{Arch, ArchProfile};
pub use configure::configure;
pub use link::{LinkTools, ModuleLinkArtifacts, link_module, link_module_if_changed};
pub use probe::{CompilerFamily, CompilerProbe};
pub use sdk::{KernelHeaderSdk, PackageDescriptor, resolve_sdk};
pub use target::{ConfiguredTarget, ModuleBuildTarget, TargetSpec};
pub use toolchain::{SystemToolchain, ToolInvocation, ToolOutput, Toolchain, ToolchainConfig};

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Position of a stage inside the module link pipeline.
///
/// Indices are 1-based and fixed; `Modpost` is always stage 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkStage {
    PartialLink,
    ModDescriptor,
    CommandStubs,
    Modpost,
    GlueCompile,
    FinalLink,
}

impl LinkStage {
    pub const ALL: [LinkStage; 6] = [
        LinkStage::PartialLink,
        LinkStage::ModDescriptor,
        LinkStage::CommandStubs,
        LinkStage::Modpost,
        LinkStage::GlueCompile,
        LinkStage::FinalLink,
    ];

    pub fn index(self) -> usize {
        match self {
            LinkStage::PartialLink => 1,
            LinkStage::ModDescriptor => 2,
            LinkStage::CommandStubs => 3,
            LinkStage::Modpost => 4,
            LinkStage::GlueCompile => 5,
            LinkStage::FinalLink => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LinkStage::PartialLink => "partial link",
            LinkStage::ModDescriptor => "module descriptor",
            LinkStage::CommandStubs => "command stubs",
            LinkStage::Modpost => "modpost",
            LinkStage::GlueCompile => "glue compile",
            LinkStage::FinalLink => "final link",
        }
    }
}

impl fmt::Display for LinkStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} ({})", self.index(), self.name())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or unconfigured kernel-headers SDK, bad build definition values.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unsupported toolchain: {compiler} is not the GNU C compiler")]
    UnsupportedToolchain { compiler: String },

    #[error("target '{target}' is a kernel module and cannot use rule '{rule}'")]
    IncompatibleRule { target: String, rule: String },

    #[error("unsupported architecture '{0}' (supported: x86_64, i386, arm, arm64)")]
    UnsupportedArchitecture(String),

    #[error("required tool not found: {}", .path.display())]
    MissingTool { path: PathBuf },

    #[error("link {stage} failed: {message}{}", format_output(.output))]
    LinkStage {
        stage: LinkStage,
        message: String,
        output: String,
    },

    #[error("{0}")]
    Msg(String),
}

fn format_output(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("\n{trimmed}")
    }
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn link_stage(&self) -> Option<LinkStage> {
        match self {
            Error::LinkStage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(format!("json error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

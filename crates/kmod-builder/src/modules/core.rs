use crate::config::ConfigDoc;
use crate::error::Result;
use crate::modules::Module;
use crate::planner::{Plan, Task};

/// Top-level tables a build definition may contain.
pub const KNOWN_TABLES: &[&str] = &["workspace", "toolchain", "packages", "kmod"];

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        if let Some(root) = doc.value.as_table() {
            for key in root.keys() {
                if !KNOWN_TABLES.contains(&key.as_str()) {
                    return Err(crate::Error::config(format!(
                        "config table '{key}' is not supported in this schema; use {}",
                        KNOWN_TABLES.join(", ")
                    )));
                }
            }
        }

        plan.add(Task {
            id: "core.init".into(),
            label: "Init".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
        })
    }
}

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

/// A fully composed build definition (after `extends` and `imports`).
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn parse_str(path: impl Into<PathBuf>, src: &str) -> Result<Self> {
        let value: Value = toml::from_str(src)?;
        Ok(Self {
            path: path.into(),
            value,
        })
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        path.split('.')
            .try_fold(&self.value, |cur, seg| cur.as_table()?.get(seg))
    }

    pub fn has_table_path(&self, path: &str) -> bool {
        self.value_path(path).is_some_and(Value::is_table)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::config(format!("invalid value at '{path}': {e}")))?;
        Ok(Some(parsed))
    }

    /// Directory relative paths in the document are resolved against.
    pub fn base_dir(&self) -> PathBuf {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Deep merge: tables merge key by key, everything else is replaced by `overlay`.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(over_tbl)) => {
            for (k, v) in over_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn relative_to(file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        return p;
    }
    file.parent().unwrap_or_else(|| Path::new(".")).join(p)
}

fn take_imports(file: &Path, tbl: &mut toml::value::Table) -> Result<Vec<String>> {
    let Some(raw) = tbl.remove("imports") else {
        return Ok(Vec::new());
    };
    let Value::Array(items) = raw else {
        return Err(Error::config(format!(
            "'imports' in {} must be an array of strings",
            file.display()
        )));
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Value::String(s) = item else {
            return Err(Error::config(format!(
                "invalid imports entry in {} (expected string)",
                file.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

// Imports are allowed at any table level; the imported documents form the base
// and the local table is layered on top.
fn inline_imports(file: &Path, value: &mut Value, seen: &mut HashSet<PathBuf>) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };

    let imports = take_imports(file, tbl)?;
    if !imports.is_empty() {
        let mut acc = Value::Table(Default::default());
        for imp in imports {
            merge(&mut acc, load_value(&relative_to(file, &imp), seen)?);
        }
        merge(&mut acc, Value::Table(std::mem::take(tbl)));
        if let Value::Table(merged) = acc {
            *tbl = merged;
        }
    }

    for (_, child) in tbl.iter_mut() {
        inline_imports(file, child, seen)?;
    }
    Ok(())
}

fn load_value(path: &Path, seen: &mut HashSet<PathBuf>) -> Result<Value> {
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !seen.insert(key.clone()) {
        return Err(Error::config(format!(
            "build definition import cycle at {}",
            key.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(tbl) = value.as_table_mut()
        && let Some(ext) = tbl.remove("extends")
    {
        let Value::String(ext) = ext else {
            return Err(Error::config(format!(
                "'extends' in {} must be a string",
                path.display()
            )));
        };
        out = load_value(&relative_to(path, &ext), seen)?;
    }

    inline_imports(path, &mut value, seen)?;
    merge(&mut out, value);

    seen.remove(&key);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut seen = HashSet::new();
    let value = load_value(path, &mut seen)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_paths_only_match_tables() {
        let doc = ConfigDoc::parse_str(
            "<mem>",
            "[kmod]\nenabled = true\n[kmod.steps.toolchain]\nlabel = \"cc\"\n",
        )
        .expect("parse");
        assert!(doc.has_table_path("kmod"));
        assert!(doc.has_table_path("kmod.steps.toolchain"));
        assert!(!doc.has_table_path("kmod.enabled"));
        assert!(!doc.has_table_path("workspace"));
    }

    #[test]
    fn extends_and_imports_compose() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path();
        fs::write(
            dir.join("base.toml"),
            "[toolchain]\ncc = \"gcc\"\nld = \"ld\"\n",
        )
        .expect("write base");
        fs::write(
            dir.join("headers.toml"),
            "[linux-headers]\nversion = \"5.15.0\"\n",
        )
        .expect("write headers");
        fs::write(
            dir.join("build.toml"),
            r#"
extends = "base.toml"

[toolchain]
ld = "ld.bfd"

[packages]
imports = ["headers.toml"]
"#,
        )
        .expect("write build");

        let doc = load(&dir.join("build.toml")).expect("load");
        assert_eq!(
            doc.value_path("toolchain.cc").and_then(Value::as_str),
            Some("gcc")
        );
        assert_eq!(
            doc.value_path("toolchain.ld").and_then(Value::as_str),
            Some("ld.bfd")
        );
        assert_eq!(
            doc.value_path("packages.linux-headers.version")
                .and_then(Value::as_str),
            Some("5.15.0")
        );
        assert!(doc.value_path("packages.imports").is_none());
    }

    #[test]
    fn import_cycle_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path();
        fs::write(dir.join("a.toml"), "extends = \"b.toml\"\n").expect("write a");
        fs::write(dir.join("b.toml"), "extends = \"a.toml\"\n").expect("write b");

        let err = load(&dir.join("a.toml")).expect_err("cycle");
        assert!(err.to_string().contains("import cycle"), "{err}");
    }
}

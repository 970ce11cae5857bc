use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    /// Task ids or provide tokens; a trailing `?` marks the dependency optional.
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

/// Dependency edges with every `after` entry resolved to a concrete task id.
pub struct Edges<'a> {
    pub incoming: BTreeMap<&'a str, usize>,
    pub outgoing: BTreeMap<&'a str, BTreeSet<&'a str>>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{p}' is produced by both '{existing}' and '{id}'"
                    )));
                }
            }
        }
        Ok(out)
    }

    /// `Ok(None)` for an optional dependency nobody provides.
    fn resolve_dep<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        raw: &'a str,
    ) -> Result<Option<&'a str>> {
        let (dep, optional) = match raw.strip_suffix('?') {
            Some(d) => (d, true),
            None => (raw, false),
        };
        if let Some((id, _)) = self.tasks.get_key_value(dep) {
            return Ok(Some(id.as_str()));
        }
        if let Some(&provider) = provides.get(dep) {
            return Ok(Some(provider));
        }
        if optional {
            return Ok(None);
        }
        Err(Error::msg(format!("unknown dependency '{dep}'")))
    }

    pub fn edges(&self) -> Result<Edges<'_>> {
        let provides = self.provides_index()?;
        let mut incoming: BTreeMap<&str, usize> = BTreeMap::new();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for id in self.tasks.keys() {
            incoming.insert(id.as_str(), 0);
            outgoing.entry(id.as_str()).or_default();
        }
        for (id, task) in &self.tasks {
            for dep in &task.after {
                let Some(dep_id) = self.resolve_dep(&provides, dep.as_str()).map_err(|e| {
                    Error::msg(format!("task '{id}' has invalid dependency '{dep}': {e}"))
                })?
                else {
                    continue;
                };
                if outgoing.entry(dep_id).or_default().insert(id.as_str()) {
                    *incoming.entry(id.as_str()).or_default() += 1;
                }
            }
        }
        Ok(Edges { incoming, outgoing })
    }

    /// Deterministic topological order (ties broken by task id).
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let Edges {
            mut incoming,
            outgoing,
        } = self.edges()?;

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&Task> = Vec::with_capacity(self.tasks.len());

        while let Some(n) = q.pop_front() {
            if let Some(t) = self.tasks.get(n) {
                out.push(t);
            }
            for &m in outgoing.get(n).into_iter().flatten() {
                if let Some(slot) = incoming.get_mut(m) {
                    *slot -= 1;
                    if *slot == 0 {
                        q.push_back(m);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }

    /// Validate the graph once all modules have planned.
    pub fn finalize_default(&mut self) -> Result<()> {
        self.ordered().map(|_| ())
    }

    pub fn to_dot(&self) -> Result<String> {
        let edges = self.edges()?;

        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.module, task.phase
            ));
        }
        for (from, tos) in &edges.outgoing {
            for to in tos {
                out.push_str(&format!("  \"{from}\" -> \"{to}\";\n"));
            }
        }
        out.push_str("}\n");
        Ok(out)
    }
}

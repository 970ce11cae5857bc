use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::time::Instant;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ExecEvent, TaskExecFn, TaskRegistry};
use crate::planner::Plan;

/// Releases tasks once everything they depend on has completed. With one worker the
/// release order matches `Plan::ordered`.
struct Scheduler<'p> {
    waiting_on: BTreeMap<&'p str, usize>,
    dependents: BTreeMap<&'p str, BTreeSet<&'p str>>,
    ready: VecDeque<&'p str>,
    remaining: usize,
}

impl<'p> Scheduler<'p> {
    fn new(plan: &'p Plan) -> Result<Self> {
        let edges = plan.edges()?;
        let ready = edges
            .incoming
            .iter()
            .filter_map(|(id, n)| (*n == 0).then_some(*id))
            .collect();
        Ok(Self {
            remaining: edges.incoming.len(),
            waiting_on: edges.incoming,
            dependents: edges.outgoing,
            ready,
        })
    }

    fn next_ready(&mut self) -> Option<&'p str> {
        self.ready.pop_front()
    }

    fn complete(&mut self, id: &str) {
        self.remaining -= 1;
        for &child in self.dependents.get(id).into_iter().flatten() {
            if let Some(n) = self.waiting_on.get_mut(child) {
                *n -= 1;
                if *n == 0 {
                    self.ready.push_back(child);
                }
            }
        }
    }

    fn is_done(&self) -> bool {
        self.remaining == 0
    }

    fn stalled(&self) -> Error {
        let blocked: Vec<&str> = self
            .waiting_on
            .iter()
            .filter_map(|(id, n)| (*n > 0).then_some(*id))
            .collect();
        Error::msg(format!(
            "task graph contains a cycle; remaining nodes: {}",
            blocked.join(", ")
        ))
    }
}

fn executor_for(reg: &TaskRegistry, id: &str) -> Result<TaskExecFn> {
    reg.get(id)
        .ok_or_else(|| Error::msg(format!("no executor registered for task '{id}'")))
}

/// Run one task body on the calling thread. A panic becomes a task failure.
fn run_task(doc: &ConfigDoc, ctx: &mut ExecCtx, id: &str, exec: TaskExecFn) -> (Result<()>, u128) {
    ctx.sink.emit(ExecEvent::TaskStarted { id: id.to_string() });
    ctx.set_task(id);
    let start = Instant::now();
    let res = panic::catch_unwind(AssertUnwindSafe(|| exec(doc, ctx)))
        .unwrap_or_else(|p| {
            let what = p
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| p.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            Err(Error::msg(format!("panicked: {what}")))
        });
    (res, start.elapsed().as_millis())
}

fn report(ctx: &ExecCtx, id: &str, res: &Result<()>, elapsed_ms: u128) {
    ctx.sink.emit(ExecEvent::TaskFinished {
        id: id.to_string(),
        ok: res.is_ok(),
        error: res.as_ref().err().map(|e| e.to_string()),
        elapsed_ms,
    });
}

fn finish(ctx: &ExecCtx, outcome: Result<()>) -> Result<()> {
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: outcome.is_ok(),
        error: outcome.as_ref().err().map(|e| e.to_string()),
    });
    outcome
}

fn task_failed(id: &str, e: Error) -> Error {
    Error::msg(format!("task '{id}' failed: {e}"))
}

/// Run the plan one task at a time in dependency order; stops at the first
/// failure.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    let outcome = run_sequential(doc, plan, reg, ctx);
    finish(ctx, outcome)
}

fn run_sequential(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    let mut sched = Scheduler::new(plan)?;
    while let Some(id) = sched.next_ready() {
        let exec = executor_for(reg, id)?;
        ctx.sink.emit(ExecEvent::TaskSpawned { id: id.to_string() });

        let (res, elapsed_ms) = if ctx.dry_run {
            ctx.sink.emit(ExecEvent::TaskStarted { id: id.to_string() });
            ctx.set_task(id);
            if let Some(t) = plan.get(id) {
                ctx.log(&format!("DRY-RUN: {} ({}/{})", t.id, t.module, t.phase));
            }
            (Ok(()), 0)
        } else {
            run_task(doc, ctx, id, exec)
        };
        report(ctx, id, &res, elapsed_ms);
        res.map_err(|e| task_failed(id, e))?;
        sched.complete(id);
    }
    if !sched.is_done() {
        return Err(sched.stalled());
    }
    Ok(())
}

struct Finished<'p> {
    id: &'p str,
    res: Result<()>,
    elapsed_ms: u128,
}

/// Run independent tasks on up to `max_parallel` scoped worker threads. After
/// the first failure no new task is started; running ones are awaited.
pub fn execute_plan_parallel(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &ExecCtx,
    max_parallel: usize,
) -> Result<()> {
    if max_parallel <= 1 || ctx.dry_run {
        return execute_plan(doc, plan, reg, &mut ctx.clone());
    }
    let outcome = run_parallel(doc, plan, reg, ctx, max_parallel);
    finish(ctx, outcome)
}

fn run_parallel(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &ExecCtx,
    max_parallel: usize,
) -> Result<()> {
    let mut sched = Scheduler::new(plan)?;
    let (tx, rx) = mpsc::channel::<Finished<'_>>();

    std::thread::scope(|scope| -> Result<()> {
        let mut running = 0usize;
        let mut failure: Option<Error> = None;

        loop {
            while failure.is_none() && running < max_parallel {
                let Some(id) = sched.next_ready() else {
                    break;
                };
                let exec = match executor_for(reg, id) {
                    Ok(f) => f,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                };
                ctx.sink.emit(ExecEvent::TaskSpawned { id: id.to_string() });
                let tx = tx.clone();
                let mut local = ctx.clone();
                scope.spawn(move || {
                    let (res, elapsed_ms) = run_task(doc, &mut local, id, exec);
                    // The receiver outlives the scope.
                    let _ = tx.send(Finished { id, res, elapsed_ms });
                });
                running += 1;
            }

            if running == 0 {
                if let Some(e) = failure {
                    return Err(e);
                }
                if sched.is_done() {
                    return Ok(());
                }
                return Err(sched.stalled());
            }

            let done = rx
                .recv()
                .map_err(|e| Error::msg(format!("executor channel closed: {e}")))?;
            running -= 1;
            report(ctx, done.id, &done.res, done.elapsed_ms);
            match done.res {
                Ok(()) => sched.complete(done.id),
                Err(e) => {
                    failure.get_or_insert_with(|| task_failed(done.id, e));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::executor::ExecSink;
    use crate::planner::Task;

    #[derive(Default)]
    struct Events(Mutex<Vec<ExecEvent>>);

    impl ExecSink for Events {
        fn emit(&self, ev: ExecEvent) {
            self.0.lock().expect("lock").push(ev);
        }
    }

    impl Events {
        fn finished(&self) -> Vec<(String, bool)> {
            self.0
                .lock()
                .expect("lock")
                .iter()
                .filter_map(|e| match e {
                    ExecEvent::TaskFinished { id, ok, .. } => Some((id.clone(), *ok)),
                    _ => None,
                })
                .collect()
        }
    }

    fn task(id: &str, after: &[&str]) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            module: "test".into(),
            phase: "test".into(),
            after: after.iter().map(|s| s.to_string()).collect(),
            provides: vec![],
        }
    }

    fn ok(_doc: &ConfigDoc, _ctx: &mut ExecCtx) -> Result<()> {
        Ok(())
    }

    fn fail(_doc: &ConfigDoc, _ctx: &mut ExecCtx) -> Result<()> {
        Err(Error::msg("boom"))
    }

    fn explode(_doc: &ConfigDoc, _ctx: &mut ExecCtx) -> Result<()> {
        panic!("kaboom")
    }

    fn doc() -> ConfigDoc {
        ConfigDoc::parse_str("<mem>", "").expect("doc")
    }

    fn plan(tasks: &[Task]) -> Plan {
        let mut p = Plan::default();
        for t in tasks {
            p.add(t.clone()).expect("add");
        }
        p
    }

    #[test]
    fn sequential_follows_plan_order_and_stops_on_failure() {
        let p = plan(&[task("a", &[]), task("b", &["a"]), task("c", &["b"])]);
        let mut reg = TaskRegistry::default();
        reg.add("a", ok).expect("add");
        reg.add("b", fail).expect("add");
        reg.add("c", ok).expect("add");

        let events = Arc::new(Events::default());
        let mut ctx = ExecCtx::new(false, events.clone());
        let err = execute_plan(&doc(), &p, &reg, &mut ctx).expect_err("b fails");
        assert_eq!(err.to_string(), "task 'b' failed: boom");
        assert_eq!(
            events.finished(),
            [("a".to_string(), true), ("b".to_string(), false)]
        );
    }

    #[test]
    fn parallel_runs_everything_and_turns_panics_into_failures() {
        let p = plan(&[task("a", &[]), task("b", &[]), task("c", &["a", "b"])]);
        let mut reg = TaskRegistry::default();
        for id in ["a", "b", "c"] {
            reg.add(id, ok).expect("add");
        }
        let events = Arc::new(Events::default());
        let ctx = ExecCtx::new(false, events.clone());
        execute_plan_parallel(&doc(), &p, &reg, &ctx, 4).expect("parallel");
        let finished = events.finished();
        assert_eq!(finished.len(), 3);
        assert_eq!(finished.last().map(|(id, _)| id.as_str()), Some("c"));

        let mut reg = TaskRegistry::default();
        reg.add("a", explode).expect("add");
        reg.add("b", ok).expect("add");
        reg.add("c", ok).expect("add");
        let events = Arc::new(Events::default());
        let ctx = ExecCtx::new(false, events.clone());
        let err = execute_plan_parallel(&doc(), &p, &reg, &ctx, 4).expect_err("panic");
        assert!(err.to_string().contains("kaboom"), "{err}");
        assert!(!events.finished().iter().any(|(id, _)| id == "c"));
    }

    #[test]
    fn missing_executor_is_an_error() {
        let p = plan(&[task("a", &[])]);
        let reg = TaskRegistry::default();
        let mut ctx = ExecCtx::new(false, Arc::new(Events::default()));
        let err = execute_plan(&doc(), &p, &reg, &mut ctx).expect_err("unregistered");
        assert!(err.to_string().contains("no executor"), "{err}");
    }
}

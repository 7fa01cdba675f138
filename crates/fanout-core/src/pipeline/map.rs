//! Bounded fan-out over an array, preserving input order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::config::Env;
use crate::error::Error;
use crate::operation::Operation;
use crate::task::{Callable, TaskResult};

use super::lane::{Lane, StageRunner};
use super::{Pipeline, expect_array};

impl Pipeline {
    /// Apply `callable` to every element of the upstream array.
    ///
    /// At most `max_workers` units run at once. A worker that finishes picks
    /// up the next unstarted index, so a stage over `n` items creates at most
    /// `min(max_workers, n)` workers. The result array matches the input
    /// order regardless of completion order.
    pub fn map(&self, callable: Callable, env: Option<Env>) -> Pipeline {
        let downstream = Operation::new();
        let out = downstream.clone();
        let runner = self.runner(callable, env);

        self.on_upstream(move |result| {
            match result.and_then(|value| expect_array("map", value)) {
                Ok(items) => MapStage::start(runner, items, out),
                Err(error) => {
                    out.reject(error);
                }
            }
        });

        self.derive(downstream)
    }
}

struct Progress {
    items: Vec<Option<Value>>,
    results: Vec<Option<Value>>,
    started: usize,
    done: usize,
}

struct MapStage {
    runner: StageRunner,
    out: Operation<Value>,
    progress: Mutex<Progress>,
}

impl MapStage {
    fn start(runner: StageRunner, items: Vec<Value>, out: Operation<Value>) {
        let n = items.len();
        if n == 0 {
            out.resolve(Value::Array(Vec::new()));
            return;
        }

        let width = runner.max_workers().min(n);
        tracing::debug!("Mapping {} items over {} workers", n, width);

        let stage = Arc::new(MapStage {
            runner,
            out,
            progress: Mutex::new(Progress {
                items: items.into_iter().map(Some).collect(),
                results: vec![None; n],
                started: 0,
                done: 0,
            }),
        });

        for _ in 0..width {
            if !stage.out.is_pending() {
                break;
            }
            match stage.runner.open_lane() {
                Ok(lane) => stage.next(lane),
                Err(error) => {
                    stage.out.reject(error);
                }
            }
        }
    }

    /// Hand the next unstarted index to `lane`, or release it.
    fn next(self: &Arc<Self>, lane: Lane) {
        let claimed = {
            let mut progress = self.lock();
            if progress.started < progress.items.len() && self.out.is_pending() {
                let index = progress.started;
                progress.started += 1;
                progress.items[index].take().map(|item| (index, item))
            } else {
                None
            }
        };

        let Some((index, item)) = claimed else {
            lane.terminate();
            return;
        };

        let stage = Arc::clone(self);
        let done_lane = lane.clone();
        self.runner
            .dispatch(&lane, item, move |result| stage.complete(index, done_lane, result));
    }

    fn complete(self: &Arc<Self>, index: usize, lane: Lane, result: TaskResult) {
        let value = match result {
            Ok(value) => value,
            Err(error) => {
                tracing::debug!("Map unit {} failed: {}", index, error);
                lane.terminate();
                self.out.reject(Error::WorkerFailure(error));
                return;
            }
        };

        let finished: Option<Vec<Value>> = {
            let mut progress = self.lock();
            progress.results[index] = Some(value);
            progress.done += 1;
            if progress.done == progress.results.len() {
                Some(progress.results.drain(..).map(Option::unwrap_or_default).collect())
            } else {
                None
            }
        };

        match finished {
            Some(results) => {
                lane.terminate();
                self.out.resolve(Value::Array(results));
            }
            None => self.next(lane),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

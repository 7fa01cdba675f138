//! Pairwise tree reduction over a work queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::config::Env;
use crate::error::Error;
use crate::operation::Operation;
use crate::task::{Callable, TaskResult};

use super::lane::{Lane, StageRunner};
use super::{Pipeline, expect_array};

impl Pipeline {
    /// Combine the elements of the upstream array pairwise until one value
    /// remains.
    ///
    /// `callable` receives a two-element array `[a, b]`. The pairing depends
    /// on completion timing, so the combiner must be associative and
    /// commutative for the result to be deterministic.
    pub fn reduce(&self, callable: Callable, env: Option<Env>) -> Pipeline {
        let downstream = Operation::new();
        let out = downstream.clone();
        let runner = self.runner(callable, env);

        self.on_upstream(move |result| {
            match result.and_then(|value| expect_array("reduce", value)) {
                Ok(items) => ReduceStage::start(runner, items, out),
                Err(error) => {
                    out.reject(error);
                }
            }
        });

        self.derive(downstream)
    }
}

struct Queue {
    pending: VecDeque<Value>,
    in_flight: usize,
}

struct ReduceStage {
    runner: StageRunner,
    out: Operation<Value>,
    queue: Mutex<Queue>,
}

enum Step {
    Combine(Value, Value),
    Finished(Value),
    Idle,
}

impl ReduceStage {
    fn start(runner: StageRunner, items: Vec<Value>, out: Operation<Value>) {
        let n = items.len();
        let mut pending = VecDeque::from(items);
        match n {
            0 => {
                out.reject(Error::EmptySequence);
                return;
            }
            1 => {
                if let Some(only) = pending.pop_front() {
                    out.resolve(only);
                }
                return;
            }
            _ => {}
        }

        let width = runner.max_workers().min(n / 2);
        tracing::debug!("Reducing {} items over {} workers", n, width);

        let stage = Arc::new(ReduceStage {
            runner,
            out,
            queue: Mutex::new(Queue {
                pending,
                in_flight: 0,
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

    /// Decide what `lane` does next. Called with the queue already updated.
    fn next(self: &Arc<Self>, lane: Lane) {
        let step = {
            let mut queue = self.lock();
            if !self.out.is_pending() {
                Step::Idle
            } else if queue.pending.len() == 1 && queue.in_flight == 0 {
                queue.pending.pop_front().map_or(Step::Idle, Step::Finished)
            } else if queue.pending.len() >= 2 {
                match (queue.pending.pop_front(), queue.pending.pop_front()) {
                    (Some(a), Some(b)) => {
                        queue.in_flight += 1;
                        Step::Combine(a, b)
                    }
                    _ => Step::Idle,
                }
            } else {
                Step::Idle
            }
        };

        match step {
            Step::Combine(a, b) => {
                let stage = Arc::clone(self);
                let done_lane = lane.clone();
                self.runner.dispatch(&lane, Value::Array(vec![a, b]), move |result| {
                    stage.complete(done_lane, result)
                });
            }
            Step::Finished(value) => {
                lane.terminate();
                self.out.resolve(value);
            }
            Step::Idle => lane.terminate(),
        }
    }

    fn complete(self: &Arc<Self>, lane: Lane, result: TaskResult) {
        match result {
            Ok(value) => {
                {
                    let mut queue = self.lock();
                    queue.in_flight -= 1;
                    queue.pending.push_back(value);
                }
                self.next(lane);
            }
            Err(error) => {
                tracing::debug!("Reduce unit failed: {}", error);
                lane.terminate();
                self.out.reject(Error::WorkerFailure(error));
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::context::Context;
    use crate::task::{TaskContext, TaskError};
    use crate::worker::ThreadWorkerFactory;
    use serde_json::json;
    use std::time::Duration;

    fn sum() -> Callable {
        Callable::binary("sum", |_: &TaskContext, a: Value, b: Value| {
            let (a, b) = (a.as_i64().unwrap_or(0), b.as_i64().unwrap_or(0));
            std::thread::sleep(Duration::from_millis(((a + b) % 4) as u64 * 2));
            Ok(json!(a + b))
        })
    }

    fn pipeline(context: Context, data: Value) -> Pipeline {
        Pipeline::from_value(Options::default().with_max_workers(3), context, data).unwrap()
    }

    #[test]
    fn test_sum() {
        let p = pipeline(Context::threaded().unwrap(), json!((1..=10).collect::<Vec<i64>>()));
        assert_eq!(p.reduce(sum(), None).collect::<i64>().wait().unwrap(), 55);
    }

    #[test]
    fn test_permutations_agree() {
        let orders = [
            vec![1, 2, 3, 4, 5, 6, 7],
            vec![7, 6, 5, 4, 3, 2, 1],
            vec![4, 1, 7, 2, 6, 3, 5],
        ];
        for order in orders {
            let p = pipeline(Context::threaded().unwrap(), json!(order));
            assert_eq!(p.reduce(sum(), None).collect::<i64>().wait().unwrap(), 28);
        }
    }

    #[test]
    fn test_single_element_starts_no_worker() {
        let factory = Arc::new(ThreadWorkerFactory::new());
        let context = Context::new(Arc::clone(&factory)).unwrap();
        let p = pipeline(context, json!(["only"]));
        assert_eq!(p.reduce(sum(), None).collect::<String>().wait().unwrap(), "only");
        assert_eq!(factory.spawned(), 0);
    }

    #[test]
    fn test_empty_sequence() {
        let p = pipeline(Context::threaded().unwrap(), json!([]));
        let err = p.reduce(sum(), None).finally(|v| v).wait().unwrap_err();
        assert_eq!(err, Error::EmptySequence);
    }

    #[test]
    fn test_non_array_starts_no_worker() {
        let factory = Arc::new(ThreadWorkerFactory::new());
        let context = Context::new(Arc::clone(&factory)).unwrap();
        let p = pipeline(context, json!("abc"));
        let err = p.reduce(sum(), None).finally(|v| v).wait().unwrap_err();
        assert_eq!(
            err,
            Error::TypeMismatch {
                operation: "reduce",
                found: "string"
            }
        );
        assert_eq!(factory.spawned(), 0);
    }

    #[test]
    fn test_width_is_half_the_input() {
        let factory = Arc::new(ThreadWorkerFactory::new());
        let context = Context::new(Arc::clone(&factory)).unwrap();
        let p = Pipeline::from_value(Options::default().with_max_workers(8), context, json!([1, 2, 3]))
            .unwrap();
        assert_eq!(p.reduce(sum(), None).collect::<i64>().wait().unwrap(), 6);
        assert_eq!(factory.spawned(), 1);
    }

    #[test]
    fn test_combiner_failure_rejects() {
        let p = pipeline(Context::threaded().unwrap(), json!([1, 2, 3, 4]));
        let failing = Callable::new("broken", |_, _| Err(TaskError::new("boom", "combiner failed")));
        let err = p.reduce(failing, None).finally(|v| v).wait().unwrap_err();
        assert_eq!(err, Error::WorkerFailure(TaskError::new("boom", "combiner failed")));
    }

    #[test]
    fn test_synchronous_fallback() {
        let p = pipeline(Context::synchronous().unwrap(), json!([2, 3, 4]));
        assert_eq!(p.reduce(sum(), None).collect::<i64>().wait().unwrap(), 9);
    }

    #[test]
    fn test_map_then_reduce() {
        let square = Callable::new("square", |_, v| Ok(json!(v.as_i64().unwrap_or(0).pow(2))));
        let p = pipeline(Context::threaded().unwrap(), json!([1, 2, 3, 4]));
        let total = p
            .map(square, None)
            .reduce(sum(), None)
            .collect::<i64>()
            .wait()
            .unwrap();
        assert_eq!(total, 30);
    }
}

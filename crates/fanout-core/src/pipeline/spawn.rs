//! Single-unit stage: the whole upstream value on one worker.

use serde_json::Value;

use crate::config::Env;
use crate::error::Error;
use crate::operation::Operation;
use crate::task::Callable;

use super::Pipeline;
use super::lane::StageRunner;

impl Pipeline {
    /// Run `callable` once on the whole upstream value.
    ///
    /// A `timeout` entry (milliseconds) in the merged environment arms a
    /// deadline: if the unit has not finished by then its worker is
    /// terminated and the stage fails with [`Error::Timeout`].
    pub fn spawn(&self, callable: Callable, env: Option<Env>) -> Pipeline {
        let downstream = Operation::new();
        let out = downstream.clone();
        let runner = self.runner(callable, env);

        self.on_upstream(move |result| match result {
            Ok(value) => run_spawn(runner, value, out),
            Err(error) => {
                out.reject(error);
            }
        });

        self.derive(downstream)
    }
}

fn run_spawn(runner: StageRunner, value: Value, out: Operation<Value>) {
    let lane = match runner.open_lane() {
        Ok(lane) => lane,
        Err(error) => {
            out.reject(error);
            return;
        }
    };

    let timer = {
        let out = out.clone();
        let lane = lane.clone();
        runner.start_timer(move |deadline| {
            if out.is_pending() {
                tracing::debug!("Spawned unit exceeded {:?}, terminating worker", deadline);
                lane.terminate();
                out.reject(Error::Timeout(deadline));
            }
        })
    };

    let done_lane = lane.clone();
    runner.dispatch(&lane, value, move |result| {
        if let Some(timer) = timer {
            timer.cancel();
        }
        done_lane.terminate();
        match result {
            Ok(value) => out.resolve(value),
            Err(error) => out.reject(Error::WorkerFailure(error)),
        };
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::context::Context;
    use crate::task::TaskError;
    use serde_json::json;
    use std::time::Duration;

    fn slow(ms: u64) -> Callable {
        Callable::new("slow", move |_, v| {
            std::thread::sleep(Duration::from_millis(ms));
            Ok(v)
        })
    }

    fn timeout_env(ms: u64) -> Option<Env> {
        let mut env = Env::new();
        env.insert("timeout".into(), json!(ms));
        Some(env)
    }

    #[test]
    fn test_spawn_whole_value() {
        let p = Pipeline::from_value(Options::default(), Context::threaded().unwrap(), json!([1, 2, 3]))
            .unwrap();
        let sum = Callable::new("sum", |_, v| {
            Ok(json!(v.as_array().map(|a| a.iter().filter_map(|x| x.as_i64()).sum::<i64>())))
        });
        assert_eq!(p.spawn(sum, None).collect::<i64>().wait().unwrap(), 6);
    }

    #[test]
    fn test_spawn_times_out() {
        let p = Pipeline::from_value(Options::default(), Context::threaded().unwrap(), json!(1)).unwrap();
        let err = p.spawn(slow(500), timeout_env(20)).finally(|v| v).wait().unwrap_err();
        assert_eq!(err, Error::Timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_spawn_within_timeout() {
        let p = Pipeline::from_value(Options::default(), Context::threaded().unwrap(), json!(7)).unwrap();
        let value = p.spawn(slow(10), timeout_env(5_000)).collect::<i64>().wait().unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        let p = Pipeline::from_value(Options::default(), Context::threaded().unwrap(), json!(3)).unwrap();
        let mut env = Env::new();
        env.insert("timeout".into(), json!(0));
        let value = p.spawn(slow(5), Some(env)).collect::<i64>().wait().unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_fractional_timeout_fires() {
        let p = Pipeline::from_value(Options::default(), Context::threaded().unwrap(), json!(1)).unwrap();
        let mut env = Env::new();
        env.insert("timeout".into(), json!(20.0));
        let err = p.spawn(slow(400), Some(env)).finally(|v| v).wait().unwrap_err();
        assert_eq!(err, Error::Timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_timeout_from_pipeline_env() {
        let options = Options::default().with_env_value("timeout", json!(20));
        let p = Pipeline::from_value(options, Context::threaded().unwrap(), json!(1)).unwrap();
        let err = p.spawn(slow(500), None).finally(|v| v).wait().unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_worker_failure() {
        let p = Pipeline::from_value(Options::default(), Context::threaded().unwrap(), json!(1)).unwrap();
        let failing = Callable::new("fail", |_, _| Err(TaskError::new("bad", "broken")));
        let err = p.spawn(failing, None).finally(|v| v).wait().unwrap_err();
        assert_eq!(err, Error::WorkerFailure(TaskError::new("bad", "broken")));
    }

    #[test]
    fn test_synchronous_fallback() {
        let p = Pipeline::from_value(Options::default(), Context::synchronous().unwrap(), json!(2)).unwrap();
        let square = Callable::new("square", |_, v| Ok(json!(v.as_i64().unwrap_or(0).pow(2))));
        assert_eq!(p.spawn(square, None).collect::<i64>().wait().unwrap(), 4);
    }

    #[test]
    fn test_no_capability_and_no_fallback() {
        let options = Options::default().with_synchronous(false);
        let p = Pipeline::from_value(options, Context::synchronous().unwrap(), json!(2)).unwrap();
        let err = p
            .spawn(Callable::anonymous(|_, v| Ok(v)), None)
            .finally(|v| v)
            .wait()
            .unwrap_err();
        assert_eq!(err, Error::CapabilityUnavailable);
    }

    #[test]
    fn test_upstream_failure_propagates() {
        let upstream = Operation::rejected(Error::EmptySequence);
        let p = Pipeline::from_operation(Options::default(), Context::threaded().unwrap(), upstream)
            .unwrap();
        let err = p
            .spawn(Callable::anonymous(|_, _| panic!("must not run")), None)
            .finally(|v| v)
            .wait()
            .unwrap_err();
        assert_eq!(err, Error::EmptySequence);
    }

    #[test]
    fn test_env_and_namespace_visible_to_task() {
        let options = Options::default()
            .with_env_namespace("globals")
            .with_env_value("base", json!(100));
        let p = Pipeline::from_value(options, Context::threaded().unwrap(), json!(5)).unwrap();
        let task = Callable::new("offset", |ctx, v| {
            let base = ctx.globals()["globals"]["base"].as_i64().unwrap_or(0);
            let extra = ctx.env_value("extra").and_then(|e| e.as_i64()).unwrap_or(0);
            Ok(json!(base + extra + v.as_i64().unwrap_or(0)))
        });

        let mut env = Env::new();
        env.insert("extra".into(), json!(10));
        assert_eq!(p.spawn(task, Some(env)).collect::<i64>().wait().unwrap(), 115);
    }
}

//! Tasks compiled into the stock `fanout-worker` binary.

use std::time::Duration;

use fanout_core::{Callable, TaskContext, TaskError, TaskResult};
use serde_json::{Value, json};

use crate::TaskRegistry;

/// Registry holding every builtin task.
pub fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register(Callable::new("identity", |_, v| Ok(v)))
        .register(Callable::binary("add", add))
        .register(Callable::new("pow10", pow10))
        .register(Callable::new("factorial", factorial))
        .register(Callable::new("factorial_helper", |ctx, v| ctx.call("factorial", v)))
        .register(Callable::new("sleep", sleep))
        .register(Callable::new("fail", fail));
    registry
}

fn int(value: &Value) -> Result<i64, TaskError> {
    value
        .as_i64()
        .ok_or_else(|| TaskError::bad_input(format!("expected an integer, got {}", value)))
}

/// Sum of two numbers. Integers stay integers.
fn add(_: &TaskContext, a: Value, b: Value) -> TaskResult {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a
            .checked_add(b)
            .map(|sum| json!(sum))
            .ok_or_else(|| TaskError::new("overflow", "integer overflow in add"));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok(json!(a + b)),
        _ => Err(TaskError::bad_input(format!("cannot add {} and {}", a, b))),
    }
}

fn pow10(_: &TaskContext, n: Value) -> TaskResult {
    let exp = u32::try_from(int(&n)?).map_err(|_| TaskError::bad_input("negative exponent"))?;
    10i64
        .checked_pow(exp)
        .map(|v| json!(v))
        .ok_or_else(|| TaskError::new("overflow", format!("10^{} does not fit in i64", exp)))
}

fn factorial(_: &TaskContext, n: Value) -> TaskResult {
    let n = int(&n)?;
    if n < 0 {
        return Err(TaskError::bad_input("factorial of a negative number"));
    }
    (1..=n)
        .try_fold(1i64, |acc, k| acc.checked_mul(k))
        .map(|v| json!(v))
        .ok_or_else(|| TaskError::new("overflow", format!("{}! does not fit in i64", n)))
}

/// Sleep for `input` milliseconds and return it.
fn sleep(_: &TaskContext, ms: Value) -> TaskResult {
    let millis = ms
        .as_u64()
        .ok_or_else(|| TaskError::bad_input("expected milliseconds"))?;
    std::thread::sleep(Duration::from_millis(millis));
    Ok(ms)
}

/// Always fails, with the input as the message.
fn fail(_: &TaskContext, input: Value) -> TaskResult {
    let message = match input {
        Value::String(s) => s,
        other => other.to_string(),
    };
    Err(TaskError::new("fail", message))
}

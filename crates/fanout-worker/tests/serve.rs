//! Drives the worker loop over in-memory pipes.

use std::io::Cursor;

use fanout_core::ipc::{WorkerCommand, WorkerResponse, read_message, write_message};
use fanout_worker::{builtins, serve};

fn execute(task: &str, payload: &str, helpers: &[&str]) -> WorkerCommand {
    WorkerCommand::Execute {
        task: task.to_string(),
        payload_json: payload.to_string(),
        env_json: "{}".to_string(),
        namespace: "env".to_string(),
        objects_json: "{}".to_string(),
        helpers: helpers.iter().map(|h| h.to_string()).collect(),
        scripts: Vec::new(),
    }
}

/// Feed `commands` to a worker and collect every response it writes.
fn exchange(commands: &[WorkerCommand]) -> Vec<WorkerResponse> {
    let mut input = Vec::new();
    for command in commands {
        write_message(&mut input, command).unwrap();
    }

    let mut output = Vec::new();
    serve(&builtins::registry(), Cursor::new(input), &mut output).unwrap();

    let mut reader = Cursor::new(output);
    let mut responses = Vec::new();
    while let Ok(response) = read_message::<_, WorkerResponse>(&mut reader) {
        responses.push(response);
    }
    responses
}

#[test]
fn test_ping_execute_shutdown() {
    let responses = exchange(&[
        WorkerCommand::Ping,
        execute("pow10", "4", &[]),
        execute("add", "[40, 2]", &[]),
        WorkerCommand::Shutdown,
        execute("pow10", "1", &[]),
    ]);

    assert_eq!(
        responses,
        vec![
            WorkerResponse::Pong,
            WorkerResponse::Output {
                payload_json: "10000".to_string()
            },
            WorkerResponse::Output {
                payload_json: "42".to_string()
            },
            WorkerResponse::ShuttingDown,
        ]
    );
}

#[test]
fn test_errors_are_reported_not_fatal() {
    let responses = exchange(&[
        execute("no-such-task", "1", &[]),
        execute("fail", "\"bad day\"", &[]),
        execute("identity", "[1]", &[]),
    ]);

    assert_eq!(responses.len(), 3);
    assert!(matches!(&responses[0], WorkerResponse::Error { code, .. } if code == "unknown_task"));
    assert_eq!(
        responses[1],
        WorkerResponse::Error {
            code: "fail".to_string(),
            message: "bad day".to_string()
        }
    );
    assert_eq!(
        responses[2],
        WorkerResponse::Output {
            payload_json: "[1]".to_string()
        }
    );
}

#[test]
fn test_helper_tasks_resolved_from_registry() {
    let responses = exchange(&[
        execute("factorial_helper", "6", &["factorial"]),
        execute("factorial_helper", "6", &[]),
    ]);

    assert_eq!(
        responses[0],
        WorkerResponse::Output {
            payload_json: "720".to_string()
        }
    );
    assert!(matches!(&responses[1], WorkerResponse::Error { code, .. } if code == "unknown_task"));
}

#[test]
fn test_end_of_input_is_clean_exit() {
    assert!(exchange(&[]).is_empty());
}

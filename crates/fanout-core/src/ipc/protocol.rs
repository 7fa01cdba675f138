//! IPC protocol messages for fanout worker processes.
//!
//! Uses length-prefixed rkyv messages over stdin/stdout.
//! Format: 4-byte length (u32 LE) + rkyv-encoded message.
//! Pipeline values travel inside the messages as JSON text.

use std::io::{Read, Write};

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest message either side accepts (100MB).
pub const MAX_MESSAGE_LEN: usize = 100 * 1024 * 1024;

/// Command sent from parent to worker process.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Run a registered task on one payload.
    Execute {
        /// Registry name of the task.
        task: String,
        /// Input value as JSON.
        payload_json: String,
        /// Merged stage environment as a JSON object.
        env_json: String,
        /// Name under which the task sees the environment.
        namespace: String,
        /// Required objects as a JSON object (name -> value).
        objects_json: String,
        /// Registry names of helper tasks the task may call.
        helpers: Vec<String>,
        /// Required scripts, passed through verbatim.
        scripts: Vec<String>,
    },

    /// Shutdown the worker process gracefully.
    Shutdown,

    /// Ping to check if worker is alive.
    Ping,
}

/// Response sent from worker to parent process.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// Task completed successfully.
    Output {
        /// Result value as JSON.
        payload_json: String,
    },

    /// Task failed with an error.
    Error {
        /// Error code.
        code: String,
        /// Error message.
        message: String,
    },

    /// Worker panicked during execution.
    Panic {
        /// Panic message if available.
        message: String,
    },

    /// Response to Ping command.
    Pong,

    /// Acknowledgement of shutdown request.
    ShuttingDown,
}

/// Write a message to a writer using length-prefixed rkyv encoding.
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(Error::Ipc(format!(
            "IPC message too large: {} bytes",
            bytes.len()
        )));
    }

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read a message from a reader using length-prefixed rkyv encoding.
///
/// # Safety
///
/// Uses unchecked deserialization for performance. Only safe when reading from
/// trusted sources (our own worker processes or their parent).
pub fn read_message<R: Read, T>(reader: &mut R) -> Result<T>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message length: {}", e)))?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    // Archived data must be read back from an aligned buffer.
    let mut bytes = rkyv::util::AlignedVec::<16>::with_capacity(len);
    bytes.resize(len, 0);
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    // SAFETY: Both ends of the pipe are fanout processes writing with
    // `write_message`.
    let message = unsafe { rkyv::from_bytes_unchecked::<T, rkyv::rancor::Error>(&bytes) }
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))?;

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_execute_command_roundtrip() {
        let cmd = WorkerCommand::Execute {
            task: "factorial".to_string(),
            payload_json: "5".to_string(),
            env_json: r#"{"timeout":100}"#.to_string(),
            namespace: "env".to_string(),
            objects_json: "{}".to_string(),
            helpers: vec!["add".to_string()],
            scripts: vec![],
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &cmd).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: WorkerCommand = read_message(&mut cursor).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_error_response_roundtrip() {
        let resp = WorkerResponse::Error {
            code: "unknown_task".to_string(),
            message: "no task registered under 'nope'".to_string(),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &resp).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: WorkerResponse = read_message(&mut cursor).unwrap();

        match decoded {
            WorkerResponse::Error { code, message } => {
                assert_eq!(code, "unknown_task");
                assert!(message.contains("nope"));
            }
            _ => panic!("Wrong response type"),
        }
    }

    #[test]
    fn test_several_messages_on_one_stream() {
        let mut buf = Vec::new();
        write_message(&mut buf, &WorkerCommand::Ping).unwrap();
        write_message(&mut buf, &WorkerCommand::Shutdown).unwrap();

        let mut cursor = Cursor::new(buf);
        let first: WorkerCommand = read_message(&mut cursor).unwrap();
        let second: WorkerCommand = read_message(&mut cursor).unwrap();
        assert_eq!(first, WorkerCommand::Ping);
        assert_eq!(second, WorkerCommand::Shutdown);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let len = (MAX_MESSAGE_LEN as u32 + 1).to_le_bytes();
        let mut cursor = Cursor::new(len.to_vec());
        let result: Result<WorkerResponse> = read_message(&mut cursor);
        assert!(matches!(result, Err(Error::Ipc(msg)) if msg.contains("too large")));
    }

    #[test]
    fn test_truncated_stream() {
        let mut buf = Vec::new();
        write_message(&mut buf, &WorkerResponse::Pong).unwrap();
        buf.truncate(buf.len() - 1);

        let mut cursor = Cursor::new(buf);
        let result: Result<WorkerResponse> = read_message(&mut cursor);
        assert!(matches!(result, Err(Error::Ipc(_))));
    }
}

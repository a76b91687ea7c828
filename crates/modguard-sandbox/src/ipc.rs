//! IPC protocol between the host and child-process workers.
//!
//! Length-delimited JSON over the worker's stdin/stdout: a 4-byte big-endian
//! length prefix followed by the JSON payload. Messages are typed by
//! [`HostMessage`] and [`WorkerMessage`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::audit::TerminationReason;
use crate::executor::WatchdogSettings;
use crate::permissions::PermissionSet;
use crate::result::ExecutionResult;

/// Default maximum IPC message size: 16 MB.
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Messages sent from the host to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostMessage {
    /// First message: compile and run this script.
    Execute(WorkerRequest),
    /// External cancellation; the worker cancels the script's token.
    Cancel,
}

/// One invocation, as handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Validated source.
    pub source: String,
    /// Entry point to invoke.
    pub entry_point: String,
    /// Arguments for the entry point.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Namespaces the validator saw.
    #[serde(default)]
    pub referenced_namespaces: Vec<String>,
    /// The script's permission set; re-validated on deserialization.
    pub permissions: PermissionSet,
    /// Watchdog tuning for the worker's own supervisor.
    pub settings: WatchdogSettings,
    /// Largest message the worker accepts from the host.
    #[serde(default = "default_max_ipc_message_size")]
    pub max_ipc_message_size: usize,
}

fn default_max_ipc_message_size() -> usize {
    DEFAULT_MAX_IPC_MESSAGE_SIZE
}

/// Messages sent from a worker to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// Compilation succeeded; the entry point is running. The host starts
    /// the invocation deadline here.
    Invoking,
    /// The invocation is over.
    Finished {
        /// The result as the worker's supervisor produced it.
        result: ExecutionResult,
        /// Set when the worker's own watchdog stopped the script.
        #[serde(default)]
        forced: Option<TerminationReason>,
    },
    /// A log line from the worker.
    Log {
        /// The log message text.
        message: String,
    },
}

/// Write a length-delimited JSON message to an async writer.
///
/// Format: 4-byte big-endian length prefix followed by the JSON payload bytes.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), std::io::Error> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "IPC payload too large: {} bytes (max {} bytes)",
                payload.len(),
                u32::MAX
            ),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-delimited JSON message with the default size limit.
///
/// Returns `None` at EOF.
pub async fn read_message<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<T>, std::io::Error> {
    read_message_with_limit(reader, DEFAULT_MAX_IPC_MESSAGE_SIZE).await
}

/// Read a length-delimited JSON message, rejecting payloads over `max_size`.
///
/// Returns `None` at EOF. Not cancel-safe: a partially read frame is lost
/// if the future is dropped.
pub async fn read_message_with_limit<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, std::io::Error> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("IPC message too large: {len} bytes (limit: {max_size} bytes)"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let msg: T = serde_json::from_slice(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(msg))
}

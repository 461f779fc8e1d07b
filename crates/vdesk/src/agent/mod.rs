//! NDJSON action agent.
//!
//! Listens on TCP; each connection carries newline-delimited JSON requests
//! and receives exactly one JSON result line per request, in order. A bad
//! request produces an error result, never a dropped connection.

mod driver;
mod executor;
mod keys;

pub use driver::{InputDriver, XdotoolDriver};
pub use executor::{ActionExecutor, ACTION_TIMEOUT};
pub use keys::Key;

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::model::{ActionKind, ActionRequest, ActionResult, ConnectionId};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Largest accepted request line, newline included.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Pause after a failed `accept` so fd exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts clients and executes their actions on the guest desktop.
pub struct ActionAgent {
    executor: ActionExecutor,
    idle_timeout: Duration,
}

impl ActionAgent {
    pub fn new(driver: Arc<dyn InputDriver>, config: &AgentConfig) -> Self {
        Self {
            executor: ActionExecutor::new(driver, config.min_screenshot_bytes),
            idle_timeout: config.idle_timeout,
        }
    }

    pub async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|err| Error::bind(addr, err))
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Connections already in flight keep running on their own tasks.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "action agent listening");
        }
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("action agent shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = ConnectionId::new();
                        if let Err(err) = stream.set_nodelay(true) {
                            debug!(connection = %id, error = %err, "failed to set TCP_NODELAY");
                        }
                        let executor = self.executor.clone();
                        let idle_timeout = self.idle_timeout;
                        debug!(connection = %id, %peer, "client connected");
                        tokio::spawn(async move {
                            match handle_connection(stream, &executor, idle_timeout, id).await {
                                Ok(()) => debug!(connection = %id, "client disconnected"),
                                Err(err) => warn!(
                                    connection = %id,
                                    error = %err,
                                    "connection ended with error"
                                ),
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }
}

enum Frame {
    Line,
    Eof,
    TooLarge,
}

/// Serve one client until it disconnects or idles out.
///
/// An oversized frame is answered with an error result, then the connection
/// ends with an `E_PROTOCOL` error.
pub async fn handle_connection<S>(
    stream: S,
    executor: &ActionExecutor,
    idle_timeout: Duration,
    id: ConnectionId,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        let next = tokio::time::timeout(idle_timeout, read_frame(&mut reader, &mut line));
        let frame = match next.await {
            Ok(frame) => frame?,
            Err(_) => {
                debug!(connection = %id, "idle timeout");
                return Ok(());
            }
        };
        match frame {
            Frame::Eof => return Ok(()),
            Frame::TooLarge => {
                let message = format!("Request exceeds {MAX_FRAME_BYTES} bytes");
                write_result(&mut writer, &ActionResult::failure("", message.as_str())).await?;
                return Err(Error::protocol(message));
            }
            Frame::Line => {}
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let result = match decode_request(&line) {
            Ok(request) => executor.execute(request).await,
            Err(rejected) => rejected,
        };
        debug!(
            connection = %id,
            action = %result.action,
            success = result.success,
            "action handled"
        );
        write_result(&mut writer, &result).await?;
    }
}

async fn read_frame<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(MAX_FRAME_BYTES).unwrap_or(u64::MAX);
    let read = reader
        .take(limit)
        .read_until(b'\n', line)
        .await
        .map_err(|err| Error::io("failed to read request", err))?;
    if read == 0 {
        return Ok(Frame::Eof);
    }
    if line.len() >= MAX_FRAME_BYTES && line.last() != Some(&b'\n') {
        return Ok(Frame::TooLarge);
    }
    Ok(Frame::Line)
}

/// Decode one request line, or produce the result that rejects it.
pub fn decode_request(line: &[u8]) -> std::result::Result<ActionRequest, ActionResult> {
    let value: Value = serde_json::from_slice(line).map_err(|_| ActionResult::invalid_json())?;
    let Some(object) = value.as_object() else {
        return Err(ActionResult::invalid_json());
    };
    let tag = match object.get("action") {
        Some(Value::String(tag)) => tag.clone(),
        Some(other) => return Err(ActionResult::unknown_action(&other.to_string())),
        None => return Err(ActionResult::failure("", "Missing action")),
    };
    let Some(kind) = ActionKind::parse(&tag) else {
        return Err(ActionResult::unknown_action(&tag));
    };
    serde_json::from_value(value).map_err(|err| {
        ActionResult::failure(kind.as_str(), format!("Invalid parameters for {kind}: {err}"))
    })
}

async fn write_result<W>(writer: &mut W, result: &ActionResult) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = serde_json::to_vec(result)
        .map_err(|err| Error::internal(format!("failed to encode result: {err}")))?;
    payload.push(b'\n');
    writer
        .write_all(&payload)
        .await
        .map_err(|err| Error::io("failed to write result", err))?;
    writer
        .flush()
        .await
        .map_err(|err| Error::io("failed to flush result", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_non_objects() {
        for line in [&b"not json"[..], b"[1,2]", b"42", b"\"click\""] {
            assert_eq!(decode_request(line), Err(ActionResult::invalid_json()));
        }
    }

    #[test]
    fn decode_reports_unknown_and_missing_actions() {
        assert_eq!(
            decode_request(br#"{"action":"dance"}"#),
            Err(ActionResult::unknown_action("dance"))
        );
        let missing = decode_request(br#"{"x":1}"#).unwrap_err();
        assert_eq!(missing.action, "");
        assert_eq!(missing.error.as_deref(), Some("Missing action"));
    }

    #[test]
    fn decode_reports_bad_parameters_under_the_action_name() {
        let rejected = decode_request(br#"{"action":"click","x":"left"}"#).unwrap_err();
        assert_eq!(rejected.action, "click");
        assert!(rejected
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("Invalid parameters for click")));
    }

    #[test]
    fn decode_accepts_defaults_and_extra_fields() {
        assert_eq!(
            decode_request(br#"{"action":"wait"}"#),
            Ok(ActionRequest::Wait { duration: 1.0 })
        );
        assert_eq!(
            decode_request(br#"{"action":"screenshot","id":7}"#),
            Ok(ActionRequest::Screenshot)
        );
    }
}

//! Frames exchanged over a client connection.
//!
//! Every frame is one JSON document followed by `\n`. JSON string escaping guarantees the
//! document itself never contains a raw newline, so frames of any size (large history arrays
//! included) are delimited without a length prefix and without a size limit.
//!
//! Client → server: [`RequestFrame`] with a request id. Server → client: [`ServerFrame`], either a
//! reply correlated by id or an unsolicited [`Notification`].
use std::io::{BufRead, BufReader, Read, Write};

use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::command::{Command, SessionHandle};
use crate::error::{BridgeError, WireFault};
use crate::event::EngineEvent;
use crate::quote::Quote;
use crate::response::Response;
use crate::result::Result;

/// Correlates a reply with the request that caused it.
pub type RequestId = u64;

/// Remote operations a client can invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Handshake: register for notifications, bound to the listed sessions.
    Connect {
        /// Sessions whose engine events this client wants.
        #[serde(default)]
        sessions: Vec<SessionHandle>,
    },
    /// One-way goodbye; no reply is sent.
    Disconnect,
    /// Execute a command on a session and wait for its response.
    SendCommand(Command),
    /// Latest quote of every registered session.
    GetQuotes,
}

/// Client → server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Request id, unique per connection.
    pub id: RequestId,
    /// Requested operation.
    pub op: Operation,
}

/// Result of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    /// Handshake outcome.
    Connected(bool),
    /// Engine response to `SendCommand`.
    Command(Response),
    /// Answer to `GetQuotes`.
    Quotes(Vec<Quote>),
    /// The operation failed before or while reaching the engine.
    Fault(WireFault),
}

impl Reply {
    /// Turns a server side result into a reply.
    pub fn from_result(result: Result<Reply>) -> Reply {
        result.unwrap_or_else(|e| Reply::Fault(WireFault::from(&e)))
    }
}

/// Unsolicited server → client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    /// A session's quote changed.
    QuoteUpdate(Quote),
    /// A session registered.
    QuoteAdded(Quote),
    /// A session deregistered.
    QuoteRemoved(Quote),
    /// The server is closing its listeners.
    ServerStopped,
    /// Event emitted by the session the client is bound to.
    EngineEvent(EngineEvent),
}

/// Server → client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Reply to request `id`.
    Reply {
        /// Id of the request being answered.
        id: RequestId,
        /// Outcome.
        reply: Reply,
    },
    /// Notification.
    Notify(Notification),
}

/// Writes one frame and flushes.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> Result<()> {
    let mut buf = serde_json::to_vec(frame)?;
    buf.push(b'\n');
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Reads newline-delimited frames from a byte stream.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    line: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    /// Wraps a reader.
    pub fn new(reader: R) -> Self {
        FrameReader {
            inner: BufReader::new(reader),
            line: Vec::new(),
        }
    }

    /// Next frame; `Ok(None)` on a clean end of stream.
    ///
    /// A frame that does not parse is reported as a protocol error with its size; the stream
    /// stays usable for the next frame.
    pub fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            self.line.clear();
            let n = self.inner.read_until(b'\n', &mut self.line)?;
            if n == 0 {
                return Ok(None);
            }
            let body = trim_newline(&self.line);
            if body.is_empty() {
                continue;
            }
            return match serde_json::from_slice(body) {
                Ok(frame) => Ok(Some(frame)),
                Err(e) => {
                    warn!("Dropping malformed frame of {} bytes: {}", body.len(), e);
                    Err(BridgeError::Protocol(format!(
                        "malformed frame of {} bytes: {e}",
                        body.len()
                    )))
                }
            };
        }
    }
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

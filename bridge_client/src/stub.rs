//! Remote stub: one open channel to a bridge server.
//!
//! Requests are written under a lock and correlated with their replies by request id. A reader
//! thread owns the inbound half of the socket: replies go to the waiting caller through a
//! single-use channel, notifications go to the event channel handed out by [`ClientStub::open`].
//! When the channel breaks without [`ClientStub::close`] having been called, the reader reports
//! it once as [`StubEvent::Faulted`] and every waiting caller gets a connection error.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use log::{debug, info, warn};
use mtbridge_common::net::{Endpoint, Stream};
use mtbridge_common::wire::{
    FrameReader, Notification, Operation, Reply, RequestFrame, RequestId, ServerFrame,
    write_frame,
};
use mtbridge_common::{BridgeError, Command, Quote, Response, Result, SessionHandle};

use crate::events::ClientConfig;

type PendingReplies = Arc<Mutex<HashMap<RequestId, Sender<Reply>>>>;
type EventSink = Arc<Mutex<Option<Sender<StubEvent>>>>;

/// What the reader thread reports besides replies.
#[derive(Debug, Clone, PartialEq)]
pub enum StubEvent {
    /// Unsolicited server message.
    Notification(Notification),
    /// The channel broke; carries the reason.
    Faulted(String),
}

/// Open channel to a bridge server.
pub struct ClientStub {
    endpoint: Endpoint,
    writer: Mutex<Stream>,
    control: Stream,
    next_id: AtomicU64,
    pending: PendingReplies,
    events: EventSink,
    closing: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    config: ClientConfig,
}

impl ClientStub {
    /// Connects to the configured endpoint and starts the reader thread.
    pub fn open(config: &ClientConfig) -> Result<(Arc<ClientStub>, Receiver<StubEvent>)> {
        let stream = Stream::connect(&config.endpoint, config.connect_timeout).map_err(|e| {
            BridgeError::Connection(format!("cannot reach {}: {e}", config.endpoint))
        })?;
        let writer = stream.try_clone()?;
        let control = stream.try_clone()?;

        let (events_tx, events_rx) = unbounded::<StubEvent>();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let events: EventSink = Arc::new(Mutex::new(Some(events_tx)));
        let closing = Arc::new(AtomicBool::new(false));

        let reader = {
            let pending = Arc::clone(&pending);
            let events = Arc::clone(&events);
            let closing = Arc::clone(&closing);
            let endpoint = config.endpoint.clone();
            thread::Builder::new()
                .name("stub-reader".into())
                .spawn(move || read_loop(&endpoint, stream, &pending, &events, &closing))?
        };
        info!("Channel to {} open", config.endpoint);

        let stub = Arc::new(ClientStub {
            endpoint: config.endpoint.clone(),
            writer: Mutex::new(writer),
            control,
            next_id: AtomicU64::new(0),
            pending,
            events,
            closing,
            reader: Mutex::new(Some(reader)),
            config: config.clone(),
        });
        Ok((stub, events_rx))
    }

    /// Endpoint this channel is connected to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether the channel is still usable.
    pub fn is_open(&self) -> bool {
        if self.closing.load(Ordering::Acquire) {
            return false;
        }
        match self.reader.lock() {
            Ok(reader) => reader.as_ref().is_some_and(|r| !r.is_finished()),
            Err(_) => false,
        }
    }

    /// Handshake: subscribes to notifications, bound to `sessions`.
    pub fn connect(&self, sessions: &[SessionHandle]) -> Result<bool> {
        match self.call(Operation::Connect {
            sessions: sessions.to_vec(),
        })? {
            Reply::Connected(accepted) => Ok(accepted),
            other => Err(unexpected("Connect", &other)),
        }
    }

    /// One-way goodbye; the server unsubscribes this channel.
    pub fn disconnect(&self) -> Result<()> {
        let id = self.next_request_id();
        self.write(&RequestFrame {
            id,
            op: Operation::Disconnect,
        })
    }

    /// Executes `command` on its session and returns the engine response.
    pub fn send_command(&self, command: Command) -> Result<Response> {
        match self.call(Operation::SendCommand(command))? {
            Reply::Command(response) => Ok(response),
            other => Err(unexpected("SendCommand", &other)),
        }
    }

    /// Latest quote of every registered session.
    pub fn get_quotes(&self) -> Result<Vec<Quote>> {
        match self.call(Operation::GetQuotes)? {
            Reply::Quotes(quotes) => Ok(quotes),
            other => Err(unexpected("GetQuotes", &other)),
        }
    }

    /// Stops delivering notifications; the event receiver disconnects.
    pub fn detach_events(&self) -> Result<()> {
        self.events.lock()?.take();
        Ok(())
    }

    /// Shuts the channel down and waits for the reader. Idempotent; never reports a fault.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.control.shutdown() {
            debug!("Shutdown of channel to {}: {}", self.endpoint, e);
        }
        let reader = match self.reader.lock() {
            Ok(mut reader) => reader.take(),
            Err(e) => {
                warn!("Reader handle poisoned: {}", e);
                None
            }
        };
        if let Some(reader) = reader {
            if reader.join().is_err() {
                warn!("Reader of {} panicked", self.endpoint);
            }
        }
        info!("Channel to {} closed", self.endpoint);
    }

    fn call(&self, op: Operation) -> Result<Reply> {
        if !self.is_open() {
            return Err(BridgeError::Connection(format!(
                "channel to {} is closed",
                self.endpoint
            )));
        }
        let handle = match &op {
            Operation::SendCommand(command) => command.expert_handle,
            _ => 0,
        };
        let id = self.next_request_id();
        let (reply_tx, reply_rx) = bounded::<Reply>(1);
        self.pending.lock()?.insert(id, reply_tx);

        if let Err(e) = self.write(&RequestFrame { id, op }) {
            self.pending.lock()?.remove(&id);
            return Err(e);
        }

        let timeout = self.config.call_timeout;
        match reply_rx.recv_timeout(timeout) {
            Ok(Reply::Fault(fault)) => Err(BridgeError::from(fault)),
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => {
                self.pending.lock()?.remove(&id);
                warn!("Request {} to {} got no reply within {:?}", id, self.endpoint, timeout);
                Err(BridgeError::Timeout {
                    handle,
                    after: timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::Connection(format!(
                "channel to {} closed before request {} was answered",
                self.endpoint, id
            ))),
        }
    }

    fn write(&self, frame: &RequestFrame) -> Result<()> {
        let mut writer = self.writer.lock()?;
        write_frame(&mut *writer, frame).map_err(|e| {
            BridgeError::Connection(format!("write to {} failed: {e}", self.endpoint))
        })
    }

    fn next_request_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Drop for ClientStub {
    fn drop(&mut self) {
        self.close();
    }
}

fn unexpected(operation: &str, reply: &Reply) -> BridgeError {
    let message = format!("unexpected reply to {operation}: {reply:?}");
    warn!("{}", message);
    BridgeError::Protocol(message)
}

fn read_loop(
    endpoint: &Endpoint,
    stream: Stream,
    pending: &PendingReplies,
    events: &EventSink,
    closing: &AtomicBool,
) {
    let mut reader = FrameReader::new(stream);
    let reason = loop {
        match reader.read::<ServerFrame>() {
            Ok(Some(ServerFrame::Reply { id, reply })) => deliver_reply(id, reply, pending),
            Ok(Some(ServerFrame::Notify(notification))) => {
                deliver_event(StubEvent::Notification(notification), events)
            }
            Ok(None) => break "server closed the channel".to_string(),
            Err(e) if e.is_protocol() => continue,
            Err(e) => break e.to_string(),
        }
    };

    // Waiting callers see their reply sender dropped.
    match pending.lock() {
        Ok(mut pending) => pending.clear(),
        Err(e) => warn!("Pending replies poisoned: {}", e),
    }
    if closing.load(Ordering::Acquire) {
        debug!("Reader of {} stopped", endpoint);
        return;
    }
    warn!("Channel to {} faulted: {}", endpoint, reason);
    deliver_event(StubEvent::Faulted(reason), events);
}

fn deliver_reply(id: RequestId, reply: Reply, pending: &PendingReplies) {
    let waiter = match pending.lock() {
        Ok(mut pending) => pending.remove(&id),
        Err(e) => {
            warn!("Pending replies poisoned: {}", e);
            None
        }
    };
    match waiter {
        Some(tx) => {
            if tx.send(reply).is_err() {
                debug!("Caller of request {} is gone", id);
            }
        }
        None => warn!("Reply to request {} arrived after its caller gave up", id),
    }
}

fn deliver_event(event: StubEvent, events: &EventSink) {
    match events.lock() {
        Ok(events) => {
            if let Some(tx) = events.as_ref() {
                if tx.send(event).is_err() {
                    debug!("Event receiver dropped");
                }
            }
        }
        Err(e) => warn!("Event sink poisoned: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtbridge_common::ResponseValue;
    use std::net::TcpListener;
    use std::time::Duration;

    fn config_for(listener: &TcpListener) -> ClientConfig {
        let port = listener.local_addr().unwrap().port();
        ClientConfig {
            call_timeout: Duration::from_millis(300),
            ..ClientConfig::new(Endpoint::tcp("127.0.0.1", port))
        }
    }

    /// Accepts one connection and answers each request with `answer`.
    fn fake_server(listener: TcpListener, answer: fn(&RequestFrame) -> Vec<ServerFrame>) {
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = Stream::Tcp(stream.try_clone().unwrap());
            let mut reader = FrameReader::new(Stream::Tcp(stream));
            while let Ok(Some(frame)) = reader.read::<RequestFrame>() {
                for out in answer(&frame) {
                    write_frame(&mut writer, &out).unwrap();
                }
            }
        });
    }

    #[test]
    fn replies_are_matched_by_id_and_notifications_forwarded() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config_for(&listener);
        fake_server(listener, |frame| match &frame.op {
            Operation::Connect { .. } => vec![
                ServerFrame::Notify(Notification::ServerStopped),
                ServerFrame::Reply {
                    id: frame.id,
                    reply: Reply::Connected(true),
                },
            ],
            Operation::SendCommand(_) => vec![ServerFrame::Reply {
                id: frame.id,
                reply: Reply::Command(Response::ok(ResponseValue::Double(1.2345))),
            }],
            _ => vec![],
        });

        let (stub, events) = ClientStub::open(&config).unwrap();
        assert!(stub.connect(&[7]).unwrap());
        let response = stub.send_command(Command::new(17, vec![], 7)).unwrap();
        assert_eq!(response.into_result::<f64>().unwrap(), 1.2345);
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            StubEvent::Notification(Notification::ServerStopped)
        );
        stub.close();
        assert!(!stub.is_open());
    }

    #[test]
    fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config_for(&listener);
        fake_server(listener, |_| vec![]);

        let (stub, _events) = ClientStub::open(&config).unwrap();
        let err = stub.send_command(Command::new(1, vec![], 3)).unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { handle: 3, .. }));
        assert!(err.is_connection());
    }

    #[test]
    fn peer_close_is_reported_once_as_fault() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config_for(&listener);
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let (stub, events) = ClientStub::open(&config).unwrap();
        match events.recv_timeout(Duration::from_secs(2)).unwrap() {
            StubEvent::Faulted(_) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(stub.get_quotes().is_err());
        stub.close();
    }

    #[test]
    fn close_does_not_report_a_fault() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config_for(&listener);
        fake_server(listener, |_| vec![]);

        let (stub, events) = ClientStub::open(&config).unwrap();
        stub.close();
        drop(stub);
        assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn unreachable_endpoint_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config_for(&listener);
        drop(listener);
        let err = ClientStub::open(&config).err().unwrap();
        assert!(err.is_connection());
    }
}

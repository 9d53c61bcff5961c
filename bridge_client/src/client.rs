//! Connection-managing client on top of [`ClientStub`].
//!
//! State machine:
//! - `Disconnected`/`Failed` → `Connecting` on connect; connect while `Connecting` or `Connected`
//!   does nothing.
//! - `Connecting` → `Connected` after the handshake, or → `Failed` with the half-built channel
//!   closed.
//! - `Connected` → `Disconnected` on disconnect or `ServerStopped`, or → `Failed` when the channel
//!   faults.
//!
//! Transitions are serialized by one lock and each one is announced with
//! [`ClientEvent::ConnectionStateChanged`]. Notifications are pumped from the stub by a thread that
//! only holds a weak reference to the client.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error, info, warn};
use mtbridge_common::response::FromResponse;
use mtbridge_common::wire::Notification;
use mtbridge_common::{
    Arg, BridgeError, Command, Quote, Response, Result, SessionHandle, StructuredRequest,
    StructuredResponse,
};
use serde::de::DeserializeOwned;

use crate::events::{ClientConfig, ClientEvent, ConnectionState};
use crate::stub::{ClientStub, StubEvent};

/// A remote call: a flat command or a structured request. Both travel the same path.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    /// Op code with positional and named arguments.
    Command {
        /// Op code.
        command_type: i32,
        /// Positional arguments.
        parameters: Vec<Arg>,
        /// Named arguments.
        named: BTreeMap<String, Arg>,
    },
    /// Structured request sent as an `MT_REQUEST` command.
    Request(StructuredRequest),
}

impl Call {
    fn into_command(self, handle: SessionHandle) -> Result<Command> {
        match self {
            Call::Command {
                command_type,
                parameters,
                named,
            } => Ok(Command::new(command_type, parameters, handle).with_named(named)),
            Call::Request(request) => {
                debug!("Structured request {} for session {}", request.kind(), handle);
                request.into_command(handle)
            }
        }
    }
}

/// Client of one bridge server.
pub struct BridgeClient {
    config: ClientConfig,
    transition: Mutex<()>,
    state: Mutex<ConnectionState>,
    stub: Mutex<Option<Arc<ClientStub>>>,
    executor_handle: Mutex<Option<SessionHandle>>,
    subscribers: Mutex<Vec<Sender<ClientEvent>>>,
}

impl BridgeClient {
    /// Disconnected client for `config`.
    pub fn new(config: ClientConfig) -> Arc<BridgeClient> {
        Arc::new(BridgeClient {
            config,
            transition: Mutex::new(()),
            state: Mutex::new(ConnectionState::Disconnected),
            stub: Mutex::new(None),
            executor_handle: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Current state.
    pub fn state(&self) -> Result<ConnectionState> {
        Ok(*self.state.lock()?)
    }

    /// Session that commands are sent to, if one is chosen. Any handle is valid, 0 included.
    pub fn executor_handle(&self) -> Result<Option<SessionHandle>> {
        Ok(*self.executor_handle.lock()?)
    }

    /// Changes the session commands are sent to.
    pub fn set_executor_handle(&self, handle: SessionHandle) -> Result<()> {
        *self.executor_handle.lock()? = Some(handle);
        Ok(())
    }

    /// Forgets the executor session; commands fail until a new one is set.
    pub fn clear_executor_handle(&self) -> Result<()> {
        *self.executor_handle.lock()? = None;
        Ok(())
    }

    /// New receiver of every event emitted from now on.
    pub fn subscribe(&self) -> Result<Receiver<ClientEvent>> {
        let (tx, rx) = unbounded();
        self.subscribers.lock()?.push(tx);
        Ok(rx)
    }

    /// Opens the channel and performs the handshake, bound to the executor handle when set.
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        let _transition = self.transition.lock()?;
        match self.state()? {
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!("Connect ignored: already {}", self.state()?);
                return Ok(());
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {}
        }
        self.set_state(ConnectionState::Connecting, None)?;
        match self.open_channel() {
            Ok(stub) => {
                *self.stub.lock()? = Some(stub);
                self.set_state(ConnectionState::Connected, None)
            }
            Err(e) => {
                error!("Connect to {} failed: {}", self.config.endpoint, e);
                self.set_state(ConnectionState::Failed, Some(e.to_string()))?;
                Err(e)
            }
        }
    }

    /// Runs [`Self::connect`] on a worker thread.
    pub fn begin_connect(self: &Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        let client = Arc::clone(self);
        Ok(thread::Builder::new()
            .name("client-connect".into())
            .spawn(move || client.connect())?)
    }

    /// Unsubscribes, says goodbye and closes the channel.
    pub fn disconnect(&self) -> Result<()> {
        let _transition = self.transition.lock()?;
        let stub = self.stub.lock()?.take();
        let Some(stub) = stub else {
            if self.state()? != ConnectionState::Disconnected {
                self.set_state(ConnectionState::Disconnected, None)?;
            }
            return Ok(());
        };
        stub.detach_events()?;
        if let Err(e) = stub.disconnect() {
            warn!("Goodbye to {} not sent: {}", self.config.endpoint, e);
        }
        stub.close();
        self.set_state(ConnectionState::Disconnected, None)
    }

    /// Runs [`Self::disconnect`] on a worker thread.
    pub fn begin_disconnect(self: &Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        let client = Arc::clone(self);
        Ok(thread::Builder::new()
            .name("client-disconnect".into())
            .spawn(move || client.disconnect())?)
    }

    /// Sends a command to the executor session and converts its result.
    pub fn send_command<T: FromResponse>(
        &self,
        command_type: i32,
        parameters: Vec<Arg>,
        named: BTreeMap<String, Arg>,
    ) -> Result<T> {
        self.execute(Call::Command {
            command_type,
            parameters,
            named,
        })?
        .into_result()
    }

    /// Sends a structured request to the executor session and decodes the typed value.
    pub fn send_request<T: DeserializeOwned>(&self, request: StructuredRequest) -> Result<T> {
        let document: String = self.execute(Call::Request(request))?.into_result()?;
        StructuredResponse::<T>::from_json(&document)?.into_value()
    }

    /// Sends `call` to the executor session and returns the raw response.
    pub fn execute(&self, call: Call) -> Result<Response> {
        let stub = self.connected_stub()?;
        let handle = self.executor_handle()?.ok_or_else(|| {
            BridgeError::Connection("no executor session chosen for commands".into())
        })?;
        let command = call.into_command(handle)?;
        stub.send_command(command)
    }

    /// Latest quote of every session registered on the server.
    pub fn get_quotes(&self) -> Result<Vec<Quote>> {
        self.connected_stub()?.get_quotes()
    }

    fn connected_stub(&self) -> Result<Arc<ClientStub>> {
        self.stub.lock()?.clone().ok_or_else(|| {
            BridgeError::Connection(format!("not connected to {}", self.config.endpoint))
        })
    }

    fn open_channel(self: &Arc<Self>) -> Result<Arc<ClientStub>> {
        let (stub, events) = ClientStub::open(&self.config)?;
        let sessions: Vec<SessionHandle> = self.executor_handle()?.into_iter().collect();
        match stub.connect(&sessions) {
            Ok(true) => {}
            Ok(false) => {
                stub.close();
                return Err(BridgeError::Connection(format!(
                    "{} refused the handshake",
                    self.config.endpoint
                )));
            }
            Err(e) => {
                stub.close();
                return Err(e);
            }
        }
        start_pump(Arc::downgrade(self), Arc::clone(&stub), events)?;
        info!("Connected to {}", self.config.endpoint);
        Ok(stub)
    }

    /// Tears down `stub` after the server stopped or the channel faulted, unless it has already
    /// been replaced or released.
    fn on_channel_closed(
        &self,
        stub: &Arc<ClientStub>,
        state: ConnectionState,
        message: String,
    ) -> Result<()> {
        let _transition = self.transition.lock()?;
        {
            let mut current = self.stub.lock()?;
            match current.as_ref() {
                Some(c) if Arc::ptr_eq(c, stub) => {
                    current.take();
                }
                _ => return Ok(()),
            }
        }
        stub.detach_events()?;
        stub.close();
        self.set_state(state, Some(message))
    }

    fn set_state(&self, state: ConnectionState, message: Option<String>) -> Result<()> {
        *self.state.lock()? = state;
        match &message {
            Some(message) => info!("Connection state: {} ({})", state, message),
            None => info!("Connection state: {}", state),
        }
        self.emit(ClientEvent::ConnectionStateChanged { state, message })
    }

    fn emit(&self, event: ClientEvent) -> Result<()> {
        self.subscribers
            .lock()?
            .retain(|tx| tx.send(event.clone()).is_ok());
        Ok(())
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        let stub = match self.stub.lock() {
            Ok(mut stub) => stub.take(),
            Err(e) => {
                error!("Client state poisoned on drop: {}", e);
                None
            }
        };
        if let Some(stub) = stub {
            if let Err(e) = stub.detach_events() {
                debug!("Detach on drop: {}", e);
            }
            if let Err(e) = stub.disconnect() {
                debug!("Goodbye on drop: {}", e);
            }
            stub.close();
        }
    }
}

fn start_pump(
    client: Weak<BridgeClient>,
    stub: Arc<ClientStub>,
    events: Receiver<StubEvent>,
) -> Result<()> {
    thread::Builder::new()
        .name("client-events".into())
        .spawn(move || {
            for event in events.iter() {
                let Some(client) = client.upgrade() else {
                    break;
                };
                let outcome = match event {
                    StubEvent::Notification(Notification::ServerStopped) => client
                        .on_channel_closed(
                            &stub,
                            ConnectionState::Disconnected,
                            "server stopped".to_string(),
                        ),
                    StubEvent::Notification(notification) => {
                        client.emit(translate(notification))
                    }
                    StubEvent::Faulted(reason) => {
                        client.on_channel_closed(&stub, ConnectionState::Failed, reason)
                    }
                };
                if let Err(e) = outcome {
                    error!("Event handling failed: {}", e);
                }
            }
            debug!("Event pump stopped");
        })?;
    Ok(())
}

fn translate(notification: Notification) -> ClientEvent {
    match notification {
        Notification::QuoteUpdate(quote) => ClientEvent::QuoteUpdate(quote),
        Notification::QuoteAdded(quote) => ClientEvent::QuoteAdded(quote),
        Notification::QuoteRemoved(quote) => ClientEvent::QuoteRemoved(quote),
        Notification::EngineEvent(raw) => {
            let decoded = match raw.decode() {
                Ok(decoded) => Some(decoded),
                Err(e) => {
                    warn!("{}", e);
                    None
                }
            };
            ClientEvent::EngineEvent { raw, decoded }
        }
        // Handled by the pump before translation.
        Notification::ServerStopped => ClientEvent::ConnectionStateChanged {
            state: ConnectionState::Disconnected,
            message: Some("server stopped".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtbridge_common::EngineEvent;
    use mtbridge_common::event::{DecodedEvent, EngineEventType, TimeBar};
    use mtbridge_common::net::Endpoint;
    use std::net::TcpListener;

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn calls_require_a_connection() {
        let client = BridgeClient::new(ClientConfig::default());
        let err = client.get_quotes().unwrap_err();
        assert!(err.is_connection());
        let err = client
            .send_command::<f64>(17, vec![], BTreeMap::new())
            .unwrap_err();
        assert!(err.is_connection());
    }

    #[test]
    fn failed_connect_moves_to_failed() {
        let client = BridgeClient::new(ClientConfig::new(Endpoint::tcp("127.0.0.1", closed_port())));
        let events = client.subscribe().unwrap();
        assert!(client.connect().unwrap_err().is_connection());
        assert_eq!(client.state().unwrap(), ConnectionState::Failed);

        let states: Vec<ConnectionState> = events
            .try_iter()
            .filter_map(|e| match e {
                ClientEvent::ConnectionStateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::Failed]
        );
    }

    #[test]
    fn disconnect_without_channel_is_quiet() {
        let client = BridgeClient::new(ClientConfig::default());
        let events = client.subscribe().unwrap();
        client.disconnect().unwrap();
        assert_eq!(client.state().unwrap(), ConnectionState::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn structured_request_keeps_executor_handle() {
        let client = BridgeClient::new(ClientConfig::default());
        client.set_executor_handle(7).unwrap();
        let request = StructuredRequest::MarketBookGet(Default::default());
        let command = Call::Request(request)
            .into_command(client.executor_handle().unwrap().unwrap())
            .unwrap();
        assert_eq!(command.command_type, mtbridge_common::command::MT_REQUEST);
        assert_eq!(command.expert_handle, 7);
    }

    #[test]
    fn handle_zero_is_a_chosen_session() {
        let client = BridgeClient::new(ClientConfig::default());
        assert_eq!(client.executor_handle().unwrap(), None);
        client.set_executor_handle(0).unwrap();
        assert_eq!(client.executor_handle().unwrap(), Some(0));
        client.clear_executor_handle().unwrap();
        assert_eq!(client.executor_handle().unwrap(), None);
    }

    #[test]
    fn known_events_are_decoded() {
        let bar = TimeBar {
            symbol: "EURUSD".into(),
            open_time: 60,
            close_time: 120,
            open: 1.1,
            close: 1.2,
            high: 1.25,
            low: 1.05,
        };
        let raw = EngineEvent::encode(EngineEventType::LastTimeBar, &bar, 7).unwrap();
        match translate(Notification::EngineEvent(raw)) {
            ClientEvent::EngineEvent { decoded, .. } => {
                assert_eq!(decoded, Some(DecodedEvent::LastTimeBar(bar)));
            }
            other => panic!("unexpected {other:?}"),
        }

        let broken = EngineEvent {
            event_type: EngineEventType::ChartEvent as i32,
            payload: "{".into(),
            expert_handle: 7,
        };
        match translate(Notification::EngineEvent(broken)) {
            ClientEvent::EngineEvent { decoded, .. } => assert_eq!(decoded, None),
            other => panic!("unexpected {other:?}"),
        }
    }
}

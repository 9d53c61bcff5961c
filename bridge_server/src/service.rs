//! Dispatcher shared by every listener of one server.
//!
//! `Service` turns remote operations into registry and hub calls. It holds no per-connection
//! state; the connection code passes the caller's subscriber id and callback channel in.
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use mtbridge_common::wire::{Operation, Reply};
use mtbridge_common::{Command, Quote, Response, Result, SessionHandle};

use crate::hub::{CallbackChannel, FanoutHub, SubscriberId};
use crate::model::registry::SessionRegistry;

/// Remote entry points of one server.
pub struct Service {
    registry: Arc<SessionRegistry>,
    hub: Arc<FanoutHub>,
    command_timeout: Duration,
}

impl Service {
    /// Dispatcher over `registry` and `hub`, waiting at most `command_timeout` per command.
    pub fn new(
        registry: Arc<SessionRegistry>,
        hub: Arc<FanoutHub>,
        command_timeout: Duration,
    ) -> Self {
        Service {
            registry,
            hub,
            command_timeout,
        }
    }

    /// Handshake: subscribes the caller and binds it to `sessions`.
    pub fn connect(
        &self,
        id: SubscriberId,
        channel: Arc<dyn CallbackChannel>,
        sessions: &[SessionHandle],
    ) -> Result<bool> {
        debug!("Connect: subscriber {} sessions {:?}", id, sessions);
        self.hub.subscribe(id, channel)?;
        for handle in sessions {
            self.hub.bind(id, *handle)?;
        }
        Ok(true)
    }

    /// Goodbye: stops notifications to the caller.
    pub fn disconnect(&self, id: SubscriberId) -> Result<()> {
        debug!("Disconnect: subscriber {}", id);
        self.hub.unsubscribe(id)?;
        Ok(())
    }

    /// Runs `command` on its session and waits for the engine's response.
    ///
    /// The caller is bound to the addressed session so it receives that session's events.
    pub fn send_command(&self, id: SubscriberId, command: Command) -> Result<Response> {
        debug!("SendCommand: begin [{}]", command);
        self.hub.bind(id, command.expert_handle)?;
        let task = self.registry.enqueue(command)?;
        let result = task
            .wait_result(self.command_timeout)
            .and_then(Response::ensure_finite);
        match &result {
            Ok(response) => debug!("SendCommand: end [{}] -> {}", task, response),
            Err(e) => warn!("SendCommand: [{}] failed: {}", task, e),
        }
        result
    }

    /// Latest quote of every session.
    pub fn get_quotes(&self) -> Result<Vec<Quote>> {
        debug!("GetQuotes");
        self.registry.quotes()
    }

    /// Executes one remote operation. `Disconnect` is one-way and yields no reply.
    pub fn dispatch(
        &self,
        id: SubscriberId,
        channel: Arc<dyn CallbackChannel>,
        op: Operation,
    ) -> Option<Reply> {
        let result = match op {
            Operation::Connect { sessions } => {
                self.connect(id, channel, &sessions).map(Reply::Connected)
            }
            Operation::Disconnect => {
                if let Err(e) = self.disconnect(id) {
                    warn!("Disconnect of subscriber {} failed: {}", id, e);
                }
                return None;
            }
            Operation::SendCommand(command) => self.send_command(id, command).map(Reply::Command),
            Operation::GetQuotes => self.get_quotes().map(Reply::Quotes),
        };
        Some(Reply::from_result(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::executor::NoopWaker;
    use crossbeam_channel::unbounded;
    use mtbridge_common::wire::{Notification, ServerFrame};
    use mtbridge_common::command::NO_COMMAND;
    use mtbridge_common::{BridgeError, ResponseValue};
    use std::thread;

    fn service(timeout: Duration) -> (Arc<Service>, Arc<SessionRegistry>, Arc<FanoutHub>) {
        let registry = Arc::new(SessionRegistry::new(Arc::new(NoopWaker)));
        let hub = Arc::new(FanoutHub::new());
        let service = Arc::new(Service::new(
            Arc::clone(&registry),
            Arc::clone(&hub),
            timeout,
        ));
        (service, registry, hub)
    }

    #[test]
    fn command_round_trip_through_the_engine() {
        let (service, registry, _hub) = service(Duration::from_secs(5));
        let (executor, _) = registry
            .register(7, Quote::new("EURUSD", 1.2345, 1.2347, 7), false)
            .unwrap();

        let engine = thread::spawn(move || {
            loop {
                if let Some(command) = executor.dequeue_next().unwrap() {
                    assert_eq!(command.command_type, 17);
                    let bid = executor.quote().unwrap().bid;
                    executor.complete(Response::ok(ResponseValue::Double(bid))).unwrap();
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
        });

        let command = Command::new(17, vec!["EURUSD".into(), 1i32.into()], 7);
        let response = service.send_command(1, command).unwrap();
        assert_eq!(response.into_result::<f64>().unwrap(), 1.2345);
        engine.join().unwrap();
    }

    #[test]
    fn non_finite_engine_value_becomes_a_protocol_fault() {
        let (service, registry, _hub) = service(Duration::from_secs(5));
        let (executor, _) = registry
            .register(7, Quote::new("EURUSD", 1.2345, 1.2347, 7), false)
            .unwrap();
        let engine = thread::spawn(move || {
            loop {
                if executor.dequeue_next().unwrap().is_some() {
                    executor
                        .complete(Response::ok(ResponseValue::Double(f64::NAN)))
                        .unwrap();
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
        });

        let (tx, _rx) = unbounded::<ServerFrame>();
        let reply = service
            .dispatch(1, Arc::new(tx), Operation::SendCommand(Command::new(17, vec![], 7)))
            .unwrap();
        engine.join().unwrap();
        let Reply::Fault(fault) = reply else {
            panic!("expected a fault, got {reply:?}");
        };
        assert!(BridgeError::from(fault).is_protocol());
    }

    #[test]
    fn reserved_op_code_is_refused_at_once() {
        let (service, registry, _hub) = service(Duration::from_secs(40));
        registry
            .register(7, Quote::new("EURUSD", 1.0, 1.0, 7), false)
            .unwrap();
        let err = service
            .send_command(1, Command::new(NO_COMMAND, vec![], 7))
            .unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn unknown_session_is_a_fault_reply() {
        let (service, _registry, _hub) = service(Duration::from_secs(40));
        let (tx, _rx) = unbounded::<ServerFrame>();
        let reply = service
            .dispatch(1, Arc::new(tx), Operation::SendCommand(Command::new(1, vec![], 42)))
            .unwrap();
        let Reply::Fault(fault) = reply else {
            panic!("expected a fault, got {reply:?}");
        };
        assert!(matches!(BridgeError::from(fault), BridgeError::SessionNotFound(42)));
    }

    #[test]
    fn engine_silence_times_out() {
        let (service, registry, _hub) = service(Duration::from_millis(50));
        registry
            .register(2, Quote::new("EURUSD", 1.0, 1.0, 2), false)
            .unwrap();
        let err = service
            .send_command(1, Command::new(5, vec![], 2))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { handle: 2, .. }));
    }

    #[test]
    fn connect_binds_listed_sessions_and_disconnect_is_one_way() {
        let (service, _registry, hub) = service(Duration::from_secs(1));
        let (tx, rx) = unbounded::<ServerFrame>();
        let reply = service.dispatch(9, Arc::new(tx.clone()), Operation::Connect { sessions: vec![3] });
        assert_eq!(reply, Some(Reply::Connected(true)));

        let note = Notification::ServerStopped;
        assert_eq!(hub.deliver_to_session(3, &note).unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), ServerFrame::Notify(note));

        assert_eq!(service.dispatch(9, Arc::new(tx), Operation::Disconnect), None);
        assert!(hub.is_empty().unwrap());
    }
}

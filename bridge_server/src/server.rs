//! One bridge server: the sessions registered on a port, their subscribers and their listeners.
//!
//! The server is created when the first session registers on a port and stops by itself once the
//! last session has been gone for the idle teardown delay. Stopping fails every pending command,
//! tells every subscriber with `ServerStopped` and closes the listeners.
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, error, info, warn};
use mtbridge_common::wire::Notification;
use mtbridge_common::{BridgeError, EngineEvent, Quote, Result, SessionHandle};

use crate::config::ServerConfig;
use crate::host::Host;
use crate::hub::FanoutHub;
use crate::model::executor::{EngineWaker, Executor};
use crate::model::poll_monitor::PollMonitor;
use crate::model::registry::SessionRegistry;
use crate::service::Service;

/// A running server.
pub struct BridgeServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    hub: Arc<FanoutHub>,
    host: Mutex<Option<Host>>,
    monitor: Mutex<PollMonitor>,
    idle_generation: AtomicU64,
    stopped: AtomicBool,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
}

impl BridgeServer {
    /// Opens the listeners of `config` and starts the tester watchdog.
    pub fn start(config: ServerConfig, waker: Arc<dyn EngineWaker>) -> Result<Arc<BridgeServer>> {
        let registry = Arc::new(SessionRegistry::new(waker));
        let hub = Arc::new(FanoutHub::new());
        let service = Arc::new(Service::new(
            Arc::clone(&registry),
            Arc::clone(&hub),
            config.command_timeout,
        ));
        let host = Host::open(&config, service)?;
        info!(
            "Server on port {} listening on {}",
            config.port,
            host.addresses().join(", ")
        );

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let server = Arc::new(BridgeServer {
            monitor: Mutex::new(PollMonitor::new(config.tester_stall_timeout)),
            config,
            registry,
            hub,
            host: Mutex::new(Some(host)),
            idle_generation: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
        });
        start_watchdog(Arc::downgrade(&server), server.config.tester_stall_timeout);
        Ok(server)
    }

    /// Configured port.
    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Whether the server has stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Receiver that disconnects when the server stops.
    pub fn stopped(&self) -> Receiver<()> {
        self.stop_rx.clone()
    }

    /// Listener addresses.
    pub fn addresses(&self) -> Result<Vec<String>> {
        Ok(self
            .host
            .lock()?
            .as_ref()
            .map(Host::addresses)
            .unwrap_or_default())
    }

    /// Bound TCP addresses.
    pub fn tcp_addrs(&self) -> Result<Vec<SocketAddr>> {
        Ok(self
            .host
            .lock()?
            .as_ref()
            .map(Host::tcp_addrs)
            .unwrap_or_default())
    }

    /// Path of the local channel, when open.
    pub fn local_path(&self) -> Result<Option<PathBuf>> {
        Ok(self
            .host
            .lock()?
            .as_ref()
            .and_then(|h| h.local_path().map(|p| p.to_path_buf())))
    }

    /// Registers a session and announces it with `QuoteAdded`.
    pub fn add_session(
        &self,
        handle: SessionHandle,
        quote: Quote,
        test_mode: bool,
    ) -> Result<Arc<Executor>> {
        if self.is_stopped() {
            return Err(self.stopped_error());
        }
        ensure_finite(&quote)?;
        // Cancels a pending idle teardown.
        self.idle_generation.fetch_add(1, Ordering::AcqRel);
        let (executor, created) = self.registry.register(handle, quote.clone(), test_mode)?;
        // `stop` raises the flag before draining the registry, so a registration that missed the
        // drain sees the flag here.
        if self.is_stopped() {
            if created {
                self.registry.deregister(handle)?;
            }
            return Err(self.stopped_error());
        }
        if created {
            self.hub.broadcast(&Notification::QuoteAdded(quote))?;
        }
        Ok(executor)
    }

    /// Deregisters a session, announces it with `QuoteRemoved` and schedules the idle teardown
    /// when it was the last one.
    pub fn remove_session(self: &Arc<Self>, handle: SessionHandle) -> Result<()> {
        if let Some(executor) = self.registry.deregister(handle)? {
            self.monitor.lock()?.forget(handle);
            self.hub
                .broadcast(&Notification::QuoteRemoved(executor.quote()?))?;
        }
        if self.registry.is_empty()? && !self.is_stopped() {
            self.schedule_idle_teardown();
        }
        Ok(())
    }

    /// Executor of `handle`.
    pub fn executor(&self, handle: SessionHandle) -> Result<Arc<Executor>> {
        self.registry.require(handle)
    }

    /// Type code of the next command for `handle`; records the poll for the tester watchdog.
    pub fn next_command_type(&self, handle: SessionHandle) -> Result<i32> {
        let executor = self.registry.require(handle)?;
        self.monitor.lock()?.update_poll(handle, Instant::now());
        executor.next_command_type()
    }

    /// Stores the new quote of `handle` and broadcasts it.
    pub fn update_quote(&self, quote: Quote) -> Result<()> {
        ensure_finite(&quote)?;
        let executor = self.registry.require(quote.expert_handle)?;
        executor.update_quote(quote.clone())?;
        self.hub.broadcast(&Notification::QuoteUpdate(quote))?;
        Ok(())
    }

    /// Delivers an engine event to the subscribers bound to its session.
    pub fn send_event(&self, event: EngineEvent) -> Result<usize> {
        let handle = event.expert_handle;
        let executor = self.registry.require(handle)?;
        if executor.is_test_mode() {
            // A tester session that emitted an event must keep polling.
            self.monitor.lock()?.arm(handle);
        }
        self.hub
            .deliver_to_session(handle, &Notification::EngineEvent(event))
    }

    /// Latest quote of every session.
    pub fn quotes(&self) -> Result<Vec<Quote>> {
        self.registry.quotes()
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> Result<usize> {
        self.registry.len()
    }

    /// Fails pending commands, notifies subscribers and closes the listeners. Idempotent.
    pub fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Stopping server on port {}", self.config.port);
        let drained = self.registry.drain()?;
        debug!("{} session(s) closed", drained.len());
        self.hub.broadcast(&Notification::ServerStopped)?;

        if let Some(mut host) = self.host.lock()?.take() {
            if let Err(e) = host.close() {
                warn!("Graceful close failed, aborting connections: {}", e);
                host.abort();
            }
        }
        self.stop_tx.lock()?.take();
        info!("Server on port {} stopped", self.config.port);
        Ok(())
    }

    fn stopped_error(&self) -> BridgeError {
        BridgeError::Connection(format!("server on port {} has stopped", self.config.port))
    }

    fn schedule_idle_teardown(self: &Arc<Self>) {
        let generation = self.idle_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let delay = self.config.idle_teardown;
        let server = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name(format!("idle-teardown-{}", self.config.port))
            .spawn(move || {
                thread::sleep(delay);
                let Some(server) = server.upgrade() else {
                    return;
                };
                if server.idle_generation.load(Ordering::Acquire) != generation {
                    return;
                }
                match server.registry.is_empty() {
                    Ok(true) => {
                        info!("No sessions left on port {}", server.config.port);
                        if let Err(e) = server.stop() {
                            error!("Idle teardown failed: {}", e);
                        }
                    }
                    Ok(false) => {}
                    Err(e) => error!("Idle teardown check failed: {}", e),
                }
            });
        if let Err(e) = spawned {
            error!("Cannot schedule idle teardown: {}", e);
        }
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Stop on drop failed: {}", e);
        }
    }
}

fn ensure_finite(quote: &Quote) -> Result<()> {
    if quote.is_finite() {
        Ok(())
    } else {
        Err(BridgeError::Protocol(format!(
            "quote of session {} has a non-finite price: {}",
            quote.expert_handle, quote
        )))
    }
}

/// Sleeps until the earliest stall deadline, waking at least every `stall_timeout / 4` so new
/// deadlines and a stopped server are noticed.
fn start_watchdog(server: Weak<BridgeServer>, stall_timeout: Duration) {
    let idle_wait = (stall_timeout / 4).max(Duration::from_millis(10));
    let spawned = thread::Builder::new()
        .name("tester-watchdog".into())
        .spawn(move || {
            let mut wait = idle_wait;
            loop {
                thread::sleep(wait);
                let Some(server) = server.upgrade() else {
                    break;
                };
                if server.is_stopped() {
                    break;
                }
                let now = Instant::now();
                let (stalls, next_deadline) = match server.monitor.lock() {
                    Ok(mut monitor) => (monitor.expired(now), monitor.next_deadline()),
                    Err(e) => {
                        error!("Tester watchdog stopped: {}", e);
                        break;
                    }
                };
                for stall in stalls {
                    warn!(
                        "Tester session {} has not polled for {:?}, the tester was probably stopped; deinitializing it",
                        stall.handle, stall.silent_for
                    );
                    if let Err(e) = server.remove_session(stall.handle) {
                        error!("Removing stalled session {} failed: {}", stall.handle, e);
                    }
                }
                wait = next_deadline
                    .map(|deadline| deadline.saturating_duration_since(now) + Duration::from_millis(1))
                    .map_or(idle_wait, |until| until.min(idle_wait));
            }
        });
    if let Err(e) = spawned {
        error!("Cannot start tester watchdog: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::executor::NoopWaker;
    use crossbeam_channel::RecvTimeoutError;

    fn config() -> ServerConfig {
        ServerConfig {
            port: 0,
            local_channel: false,
            network_interfaces: false,
            idle_teardown: Duration::from_millis(100),
            tester_stall_timeout: Duration::from_millis(100),
            ..ServerConfig::default()
        }
    }

    fn quote(handle: SessionHandle) -> Quote {
        Quote::new("EURUSD", 1.1, 1.2, handle)
    }

    #[test]
    fn stops_after_last_session_leaves() {
        let server = BridgeServer::start(config(), Arc::new(NoopWaker)).unwrap();
        server.add_session(1, quote(1), false).unwrap();
        server.remove_session(1).unwrap();
        let stopped = server.stopped();
        assert_eq!(
            stopped.recv_timeout(Duration::from_secs(2)),
            Err(RecvTimeoutError::Disconnected)
        );
        assert!(server.is_stopped());
        assert!(server.add_session(2, quote(2), false).is_err());
    }

    #[test]
    fn registration_racing_stop_never_outlives_it() {
        for round in 0..20 {
            let server = BridgeServer::start(config(), Arc::new(NoopWaker)).unwrap();
            let adder = {
                let server = Arc::clone(&server);
                thread::spawn(move || {
                    (0..50)
                        .map(|handle| server.add_session(handle, quote(handle), false).is_ok())
                        .collect::<Vec<bool>>()
                })
            };
            if round % 2 == 0 {
                thread::yield_now();
            }
            server.stop().unwrap();
            adder.join().unwrap();
            assert_eq!(server.session_count().unwrap(), 0);
        }
    }

    #[test]
    fn non_finite_quote_is_refused() {
        let server = BridgeServer::start(config(), Arc::new(NoopWaker)).unwrap();
        assert!(
            server
                .add_session(1, Quote::new("EURUSD", f64::NAN, 1.2, 1), false)
                .err().unwrap()
                .is_protocol()
        );
        server.add_session(1, quote(1), false).unwrap();
        let err = server
            .update_quote(Quote::new("EURUSD", 1.1, f64::INFINITY, 1))
            .unwrap_err();
        assert!(err.is_protocol());
        assert_eq!(server.quotes().unwrap()[0].ask, 1.2);
        server.stop().unwrap();
    }

    #[test]
    fn new_session_cancels_idle_teardown() {
        let server = BridgeServer::start(config(), Arc::new(NoopWaker)).unwrap();
        server.add_session(1, quote(1), false).unwrap();
        server.remove_session(1).unwrap();
        server.add_session(2, quote(2), false).unwrap();
        thread::sleep(Duration::from_millis(300));
        assert!(!server.is_stopped());
        assert_eq!(server.session_count().unwrap(), 1);
    }

    #[test]
    fn stalled_tester_session_is_removed() {
        let server = BridgeServer::start(config(), Arc::new(NoopWaker)).unwrap();
        server.add_session(1, quote(1), true).unwrap();
        server.add_session(2, quote(2), false).unwrap();
        let event = EngineEvent {
            event_type: 3,
            payload: r#"{"Instrument":"EURUSD"}"#.into(),
            expert_handle: 1,
        };
        server.send_event(event).unwrap();
        // No countdown before the first poll.
        thread::sleep(Duration::from_millis(250));
        assert!(server.executor(1).is_ok());

        server.next_command_type(1).unwrap();
        server.next_command_type(2).unwrap();
        thread::sleep(Duration::from_millis(400));
        assert!(server.executor(1).is_err());
        assert!(server.executor(2).is_ok());
    }

    #[test]
    fn polling_keeps_tester_session_alive() {
        let server = BridgeServer::start(config(), Arc::new(NoopWaker)).unwrap();
        server.add_session(1, quote(1), true).unwrap();
        server
            .send_event(EngineEvent {
                event_type: 1,
                payload: "{}".into(),
                expert_handle: 1,
            })
            .unwrap();
        for _ in 0..8 {
            thread::sleep(Duration::from_millis(40));
            server.next_command_type(1).unwrap();
        }
        assert!(server.executor(1).is_ok());
        server.stop().unwrap();
    }
}

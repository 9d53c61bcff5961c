//! Polling loop of one simulated session.
//!
//! Each session thread behaves like an engine script: on every tick it publishes its quote, and
//! whenever it is woken or ticked it drains its command queue one command at a time through the
//! adapter. Closed bars are emitted as `LastTimeBar` events.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select, tick, unbounded};
use log::{debug, info, warn};
use mtbridge_common::command::NO_COMMAND;
use mtbridge_common::event::EngineEventType;
use mtbridge_common::{BridgeError, Result, SessionHandle};
use mtbridge_server::EngineAdapter;
use mtbridge_server::model::executor::EngineWaker;

use crate::sim::market::Market;
use crate::sim::ops::{SimSession, execute};

/// Routes wake-ups to the thread of the addressed session.
#[derive(Default)]
pub struct SessionWaker {
    routes: Mutex<HashMap<SessionHandle, Sender<()>>>,
}

impl SessionWaker {
    /// Registers `handle` and returns the receiver its thread listens on.
    pub fn route(&self, handle: SessionHandle) -> Result<Receiver<()>> {
        let (tx, rx) = unbounded();
        self.routes.lock()?.insert(handle, tx);
        Ok(rx)
    }
}

impl EngineWaker for SessionWaker {
    fn wake(&self, handle: SessionHandle) {
        match self.routes.lock() {
            Ok(routes) => {
                if let Some(tx) = routes.get(&handle) {
                    if tx.send(()).is_err() {
                        debug!("Session {} thread is gone", handle);
                    }
                }
            }
            Err(e) => warn!("Wake-up of session {} lost: {}", handle, e),
        }
    }
}

/// Parameters of one simulated session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub handle: SessionHandle,
    pub port: u16,
    pub symbol: String,
    pub bid: f64,
    pub spread: f64,
    pub test_mode: bool,
    pub tick_interval: Duration,
    pub bar_ticks: u32,
}

/// Runs one session until `stop_rx` fires or disconnects.
pub fn run_session(
    adapter: Arc<EngineAdapter>,
    spec: SessionSpec,
    wake_rx: Receiver<()>,
    stop_rx: Receiver<()>,
) -> Result<()> {
    let market = Market::new(&spec.symbol, spec.bid, spec.spread, spec.bar_ticks);
    adapter.init_expert(
        spec.handle,
        spec.port,
        &spec.symbol,
        market.bid,
        market.ask(),
        spec.test_mode,
    )?;
    let mut session = SimSession::new(spec.handle, spec.test_mode, market);
    let ticker = tick(spec.tick_interval);
    info!("Simulated session {} on {} started", spec.handle, spec.symbol);

    let outcome = loop {
        select! {
            recv(stop_rx) -> _ => break Ok(()),
            recv(wake_rx) -> _ => {},
            recv(ticker) -> _ => {
                if let Err(e) = on_tick(&adapter, &mut session) {
                    break Err(e);
                }
            },
        }
        if let Err(e) = drain_commands(&adapter, &mut session) {
            break Err(e);
        }
    };

    match &outcome {
        // Already gone, e.g. removed by the tester watchdog.
        Err(BridgeError::SessionNotFound(_)) => {
            warn!("Simulated session {} was deinitialized remotely", spec.handle)
        }
        _ => {
            if let Err(e) = adapter.deinit_expert(spec.handle) {
                warn!("Deinit of session {} failed: {}", spec.handle, e);
            }
        }
    }
    info!("Simulated session {} stopped", spec.handle);
    match outcome {
        Err(BridgeError::SessionNotFound(_)) => Ok(()),
        other => other,
    }
}

fn on_tick(adapter: &EngineAdapter, session: &mut SimSession) -> Result<()> {
    let closed = session.market.tick();
    adapter.update_quote(
        session.handle,
        &session.market.symbol,
        session.market.bid,
        session.market.ask(),
    )?;
    if let Some(bar) = closed {
        let payload = serde_json::to_string(&bar)?;
        adapter.send_event(session.handle, EngineEventType::LastTimeBar as i32, &payload)?;
    }
    Ok(())
}

fn drain_commands(adapter: &EngineAdapter, session: &mut SimSession) -> Result<()> {
    loop {
        if adapter.get_command_type(session.handle)? == NO_COMMAND {
            return Ok(());
        }
        let Some(command) = adapter.current_command(session.handle)? else {
            return Ok(());
        };
        let response = execute(&command, session);
        adapter.send_response(session.handle, response)?;
    }
}

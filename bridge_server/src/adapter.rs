//! Entry points for the embedding engine.
//!
//! The engine identifies itself by session handle on every call. The adapter keeps one server per
//! port, creates it when the first session on that port initialises, and forgets it once it has
//! stopped. All calls are safe to make from any thread.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use mtbridge_common::{
    Arg, BridgeError, Command, EngineEvent, Quote, Response, Result, SessionHandle,
};

use crate::config::ServerConfig;
use crate::model::executor::EngineWaker;
use crate::server::BridgeServer;

/// Engine-facing facade over the servers of this process.
pub struct EngineAdapter {
    template: ServerConfig,
    waker: Arc<dyn EngineWaker>,
    servers: Mutex<HashMap<u16, Arc<BridgeServer>>>,
    experts: Mutex<HashMap<SessionHandle, Arc<BridgeServer>>>,
}

impl EngineAdapter {
    /// Adapter creating servers from `template` (its port is replaced per session).
    pub fn new(template: ServerConfig, waker: Arc<dyn EngineWaker>) -> Self {
        EngineAdapter {
            template,
            waker,
            servers: Mutex::new(HashMap::new()),
            experts: Mutex::new(HashMap::new()),
        }
    }

    /// Registers session `handle` on the server of `port`, starting that server if needed.
    pub fn init_expert(
        &self,
        handle: SessionHandle,
        port: u16,
        symbol: &str,
        bid: f64,
        ask: f64,
        test_mode: bool,
    ) -> Result<()> {
        info!(
            "InitExpert: handle = {}, port = {}, symbol = {}, test mode = {}",
            handle, port, symbol, test_mode
        );
        let quote = Quote::new(symbol, bid, ask, handle);
        // A server that stops between lookup and registration is replaced once.
        let mut attempts = 0;
        let server = loop {
            attempts += 1;
            let server = self.server_for(port)?;
            match server.add_session(handle, quote.clone(), test_mode) {
                Ok(_) => break server,
                Err(e) if server.is_stopped() && attempts < 2 => {
                    debug!("Server on port {} stopped during registration: {}", port, e);
                }
                Err(e) => return Err(e),
            }
        };
        self.experts.lock()?.insert(handle, server);
        Ok(())
    }

    /// Deregisters session `handle`.
    pub fn deinit_expert(&self, handle: SessionHandle) -> Result<()> {
        info!("DeinitExpert: handle = {}", handle);
        let server = self.experts.lock()?.remove(&handle).ok_or_else(|| {
            warn!("DeinitExpert: session {} has not been found", handle);
            BridgeError::SessionNotFound(handle)
        })?;
        server.remove_session(handle)
    }

    /// Publishes a new quote of `handle` to every client.
    pub fn update_quote(&self, handle: SessionHandle, symbol: &str, bid: f64, ask: f64) -> Result<()> {
        debug!("UpdateQuote: handle = {}, symbol = {}, bid = {}, ask = {}", handle, symbol, bid, ask);
        self.session(handle)?
            .update_quote(Quote::new(symbol, bid, ask, handle))
    }

    /// Forwards an engine event to the clients bound to `handle`.
    pub fn send_event(&self, handle: SessionHandle, event_type: i32, payload: &str) -> Result<()> {
        debug!("SendEvent: handle = {}, type = {}", handle, event_type);
        let delivered = self.session(handle)?.send_event(EngineEvent {
            event_type,
            payload: payload.to_string(),
            expert_handle: handle,
        })?;
        debug!("SendEvent: delivered to {} client(s)", delivered);
        Ok(())
    }

    /// Completes the outstanding command of `handle`.
    pub fn send_response(&self, handle: SessionHandle, response: Response) -> Result<()> {
        debug!("SendResponse: handle = {}, response = {}", handle, response);
        self.session(handle)?.executor(handle)?.complete(response)
    }

    /// Completes the outstanding command of `handle` with an engine error.
    pub fn send_error_response(&self, handle: SessionHandle, code: i32, message: &str) -> Result<()> {
        self.send_response(handle, Response::error(code, message))
    }

    /// Type code of the next command for `handle`, `0` when there is nothing to do.
    pub fn get_command_type(&self, handle: SessionHandle) -> Result<i32> {
        let command_type = self.session(handle)?.next_command_type(handle)?;
        if command_type != 0 {
            debug!("GetCommandType: handle = {} -> {}", handle, command_type);
        }
        Ok(command_type)
    }

    /// Command currently being executed by `handle`.
    pub fn current_command(&self, handle: SessionHandle) -> Result<Option<Arc<Command>>> {
        self.session(handle)?.executor(handle)?.current_command()
    }

    /// Positional parameter `index` of the current command.
    pub fn get_command_parameter(&self, handle: SessionHandle, index: usize) -> Result<Option<Arg>> {
        self.session(handle)?.executor(handle)?.parameter(index)
    }

    /// Named parameter of the current command.
    pub fn get_named_parameter(&self, handle: SessionHandle, name: &str) -> Result<Option<Arg>> {
        self.session(handle)?.executor(handle)?.named_parameter(name)
    }

    /// Whether the current command carries the named parameter.
    pub fn contains_named_parameter(&self, handle: SessionHandle, name: &str) -> Result<bool> {
        self.session(handle)?
            .executor(handle)?
            .contains_named_parameter(name)
    }

    /// Writes an engine-side failure to the log.
    pub fn log_error(&self, message: &str) {
        error!("{}", message);
    }

    /// Running server of `port`.
    pub fn server(&self, port: u16) -> Result<Option<Arc<BridgeServer>>> {
        Ok(self
            .servers
            .lock()?
            .get(&port)
            .filter(|s| !s.is_stopped())
            .cloned())
    }

    /// Stops every server.
    pub fn shutdown(&self) -> Result<()> {
        let servers: Vec<Arc<BridgeServer>> = self.servers.lock()?.drain().map(|(_, s)| s).collect();
        self.experts.lock()?.clear();
        for server in servers {
            server.stop()?;
        }
        Ok(())
    }

    fn server_for(&self, port: u16) -> Result<Arc<BridgeServer>> {
        let mut servers = self.servers.lock()?;
        if let Some(server) = servers.get(&port) {
            if !server.is_stopped() {
                return Ok(Arc::clone(server));
            }
            info!("Replacing stopped server on port {}", port);
        }
        let config = ServerConfig {
            port,
            ..self.template.clone()
        };
        let server = BridgeServer::start(config, Arc::clone(&self.waker))?;
        servers.insert(port, Arc::clone(&server));
        Ok(server)
    }

    fn session(&self, handle: SessionHandle) -> Result<Arc<BridgeServer>> {
        let mut experts = self.experts.lock()?;
        let Some(server) = experts.get(&handle).cloned() else {
            warn!("Session {} has not been found", handle);
            return Err(BridgeError::SessionNotFound(handle));
        };
        if server.is_stopped() || server.executor(handle).is_err() {
            experts.remove(&handle);
            warn!("Session {} is no longer registered", handle);
            return Err(BridgeError::SessionNotFound(handle));
        }
        Ok(server)
    }
}

impl Drop for EngineAdapter {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Adapter shutdown failed: {}", e);
        }
    }
}

//! Handle → executor map of one server.
//!
//! The registry owns the mapping between engine session handles and their executors. Lookups,
//! registration and removal are serialized by one mutex; the executor itself is shared out as an
//! `Arc`, so the lock is never held while a command is being waited on.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{info, warn};
use mtbridge_common::{BridgeError, Command, Quote, Result, SessionHandle};

use crate::model::executor::{EngineWaker, Executor};
use crate::model::task::CommandTask;

/// Registered sessions of one server.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionHandle, Arc<Executor>>>,
    waker: Arc<dyn EngineWaker>,
}

impl SessionRegistry {
    /// Empty registry whose executors wake the engine through `waker`.
    pub fn new(waker: Arc<dyn EngineWaker>) -> Self {
        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
            waker,
        }
    }

    /// Registers a session. Registering a known handle returns the existing executor and `false`.
    pub fn register(
        &self,
        handle: SessionHandle,
        quote: Quote,
        test_mode: bool,
    ) -> Result<(Arc<Executor>, bool)> {
        let mut sessions = self.sessions.lock()?;
        if let Some(existing) = sessions.get(&handle) {
            warn!("Session {} is already registered", handle);
            return Ok((Arc::clone(existing), false));
        }
        let executor = Arc::new(Executor::new(
            handle,
            quote,
            test_mode,
            Arc::clone(&self.waker),
        ));
        sessions.insert(handle, Arc::clone(&executor));
        info!("Session {} registered; {} active", handle, sessions.len());
        Ok((executor, true))
    }

    /// Removes a session and fails its pending commands.
    pub fn deregister(&self, handle: SessionHandle) -> Result<Option<Arc<Executor>>> {
        let removed = self.sessions.lock()?.remove(&handle);
        match &removed {
            Some(executor) => {
                executor.close()?;
                info!("Session {} deregistered", handle);
            }
            None => warn!("Session {} is not registered", handle),
        }
        Ok(removed)
    }

    /// Executor of `handle`.
    pub fn get(&self, handle: SessionHandle) -> Result<Option<Arc<Executor>>> {
        Ok(self.sessions.lock()?.get(&handle).cloned())
    }

    /// Executor of `handle`, or `SessionNotFound`.
    pub fn require(&self, handle: SessionHandle) -> Result<Arc<Executor>> {
        self.get(handle)?
            .ok_or(BridgeError::SessionNotFound(handle))
    }

    /// Enqueues `command` on the session it addresses.
    ///
    /// An unknown handle yields a task that is already failed with `SessionNotFound`, so the caller
    /// observes the failure immediately instead of after the command timeout.
    pub fn enqueue(&self, command: Command) -> Result<Arc<CommandTask>> {
        let handle = command.expert_handle;
        match self.get(handle)? {
            Some(executor) => executor.enqueue(command),
            None => {
                warn!("Command [{}] addressed to unknown session {}", command, handle);
                Ok(Arc::new(CommandTask::failed(
                    command,
                    BridgeError::SessionNotFound(handle),
                )))
            }
        }
    }

    /// Latest quote of every session.
    pub fn quotes(&self) -> Result<Vec<Quote>> {
        let executors: Vec<Arc<Executor>> = self.sessions.lock()?.values().cloned().collect();
        let mut quotes = executors
            .iter()
            .map(|e| e.quote())
            .collect::<Result<Vec<_>>>()?;
        quotes.sort_by_key(|q| q.expert_handle);
        Ok(quotes)
    }

    /// Removes every session, failing their pending commands.
    pub fn drain(&self) -> Result<Vec<Arc<Executor>>> {
        let drained: Vec<Arc<Executor>> = self.sessions.lock()?.drain().map(|(_, e)| e).collect();
        for executor in &drained {
            executor.close()?;
        }
        Ok(drained)
    }

    /// Number of registered sessions.
    pub fn len(&self) -> Result<usize> {
        Ok(self.sessions.lock()?.len())
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

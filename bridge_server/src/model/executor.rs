//! Per-session command queue driven by the engine.
//!
//! Network threads call [`Executor::enqueue`] and block on the returned task. The engine thread
//! polls [`Executor::dequeue_next`], executes the command and answers with
//! [`Executor::complete`]. At most one command is outstanding per session: the next command is
//! only handed out after the previous one was completed, and queued commands leave in FIFO order.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use crossbeam_channel::Sender;
use log::{debug, warn};
use mtbridge_common::command::NO_COMMAND;
use mtbridge_common::{Arg, BridgeError, Command, Quote, Response, Result, SessionHandle};

use crate::model::task::CommandTask;

/// Nudges the engine so it polls a session soon after a command was enqueued.
pub trait EngineWaker: Send + Sync {
    /// Called once per enqueued command, outside any executor lock.
    fn wake(&self, handle: SessionHandle);
}

impl EngineWaker for Sender<SessionHandle> {
    fn wake(&self, handle: SessionHandle) {
        if self.send(handle).is_err() {
            debug!("Engine wake-up for session {} dropped: receiver gone", handle);
        }
    }
}

/// Waker for engines that poll on their own schedule.
pub struct NoopWaker;

impl EngineWaker for NoopWaker {
    fn wake(&self, _handle: SessionHandle) {}
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<Arc<CommandTask>>,
    current: Option<Arc<CommandTask>>,
    closed: bool,
}

/// Command executor of one engine session.
pub struct Executor {
    handle: SessionHandle,
    test_mode: bool,
    queue: Mutex<Queue>,
    quote: RwLock<Quote>,
    waker: Arc<dyn EngineWaker>,
}

impl Executor {
    /// Creates the executor of session `handle` with its initial quote.
    pub fn new(
        handle: SessionHandle,
        quote: Quote,
        test_mode: bool,
        waker: Arc<dyn EngineWaker>,
    ) -> Self {
        Executor {
            handle,
            test_mode,
            queue: Mutex::new(Queue::default()),
            quote: RwLock::new(quote),
            waker,
        }
    }

    /// Session handle.
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Whether the session runs inside the strategy tester.
    pub fn is_test_mode(&self) -> bool {
        self.test_mode
    }

    /// Latest quote snapshot.
    pub fn quote(&self) -> Result<Quote> {
        Ok(self.quote.read()?.clone())
    }

    /// Replaces the quote snapshot.
    pub fn update_quote(&self, quote: Quote) -> Result<()> {
        *self.quote.write()? = quote;
        Ok(())
    }

    /// Appends a command and wakes the engine.
    ///
    /// A closed executor returns a failed task. So does an op code the engine could not tell
    /// apart from "nothing to do": such a command would be dequeued but never completed.
    pub fn enqueue(&self, command: Command) -> Result<Arc<CommandTask>> {
        if command.command_type <= NO_COMMAND {
            warn!("Session {}: rejected reserved op code [{}]", self.handle, command);
            let code = command.command_type;
            return Ok(Arc::new(CommandTask::failed(
                command,
                BridgeError::Protocol(format!("op code {code} is reserved")),
            )));
        }
        let task = {
            let mut queue = self.queue.lock()?;
            if queue.closed {
                return Ok(Arc::new(CommandTask::failed(
                    command,
                    BridgeError::SessionNotFound(self.handle),
                )));
            }
            let task = Arc::new(CommandTask::new(command));
            queue.pending.push_back(Arc::clone(&task));
            task
        };
        debug!("Session {}: enqueued [{}]", self.handle, task);
        self.waker.wake(self.handle);
        Ok(task)
    }

    /// Next command to execute, or `None` while a command is outstanding or nothing is queued.
    pub fn dequeue_next(&self) -> Result<Option<Arc<Command>>> {
        let mut queue = self.queue.lock()?;
        if queue.current.is_some() {
            return Ok(None);
        }
        let Some(task) = queue.pending.pop_front() else {
            return Ok(None);
        };
        let command = Arc::clone(task.command());
        queue.current = Some(task);
        Ok(Some(command))
    }

    /// Type code of the next command; `NO_COMMAND` when there is nothing to execute.
    pub fn next_command_type(&self) -> Result<i32> {
        Ok(self
            .dequeue_next()?
            .map(|c| c.command_type)
            .unwrap_or(NO_COMMAND))
    }

    /// Command handed out by the last successful dequeue and not yet completed.
    pub fn current_command(&self) -> Result<Option<Arc<Command>>> {
        let queue = self.queue.lock()?;
        Ok(queue.current.as_ref().map(|t| Arc::clone(t.command())))
    }

    /// Positional parameter of the current command.
    pub fn parameter(&self, index: usize) -> Result<Option<Arg>> {
        Ok(self
            .current_command()?
            .and_then(|c| c.param(index).cloned()))
    }

    /// Named parameter of the current command.
    pub fn named_parameter(&self, name: &str) -> Result<Option<Arg>> {
        Ok(self.current_command()?.and_then(|c| c.named(name).cloned()))
    }

    /// Whether the current command carries `name`.
    pub fn contains_named_parameter(&self, name: &str) -> Result<bool> {
        Ok(self
            .current_command()?
            .is_some_and(|c| c.contains_named(name)))
    }

    /// Completes the outstanding command with the engine's response.
    ///
    /// Fails with a protocol error when no command is outstanding. A response for a command whose
    /// caller already timed out is logged and dropped.
    pub fn complete(&self, response: Response) -> Result<()> {
        let task = self.queue.lock()?.current.take().ok_or_else(|| {
            BridgeError::Protocol(format!(
                "session {} has no command awaiting a response",
                self.handle
            ))
        })?;
        if task.is_abandoned() {
            warn!(
                "Session {}: late response for [{}] discarded: {}",
                self.handle, task, response
            );
        }
        task.set_result(Ok(response));
        Ok(())
    }

    /// Fails every queued and outstanding command and rejects new ones.
    pub fn close(&self) -> Result<()> {
        let drained: Vec<Arc<CommandTask>> = {
            let mut queue = self.queue.lock()?;
            queue.closed = true;
            let mut drained: Vec<_> = queue.current.take().into_iter().collect();
            drained.extend(queue.pending.drain(..));
            drained
        };
        for task in drained {
            task.set_result(Err(BridgeError::SessionNotFound(self.handle)));
        }
        Ok(())
    }

    /// Number of commands waiting to be dequeued.
    pub fn pending(&self) -> Result<usize> {
        Ok(self.queue.lock()?.pending.len())
    }
}

//! Single-assignment completion slot for one command.
//!
//! A `CommandTask` is created when a command is enqueued on a session. The network thread that
//! issued the command blocks in [`CommandTask::wait_result`]; the engine thread that executed it
//! calls [`CommandTask::set_result`]. The slot is a `crossbeam_channel::bounded(1)` channel, so the
//! value is handed over exactly once and the waiter is released by the same operation.
//!
//! - `set_result` stores the first result only; later calls are logged and ignored.
//! - `wait_result` returns the stored result or `BridgeError::Timeout`, never both. After a
//!   timeout the task is marked abandoned so a late completion can be recognised and discarded.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use log::{debug, warn};
use mtbridge_common::{BridgeError, Command, Response, Result};

/// Outcome stored in a task: the engine response or the reason it never reached the engine.
pub type TaskResult = Result<Response>;

/// One enqueued command and its pending result.
pub struct CommandTask {
    command: Arc<Command>,
    result_tx: Sender<TaskResult>,
    result_rx: Receiver<TaskResult>,
    completed: AtomicBool,
    waiting: AtomicBool,
    abandoned: AtomicBool,
}

impl CommandTask {
    /// Creates a task waiting for its result.
    pub fn new(command: Command) -> Self {
        let (result_tx, result_rx) = bounded(1);
        CommandTask {
            command: Arc::new(command),
            result_tx,
            result_rx,
            completed: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
        }
    }

    /// Creates a task that is already completed with `err`, so waiting on it returns at once.
    pub fn failed(command: Command, err: BridgeError) -> Self {
        let task = CommandTask::new(command);
        task.set_result(Err(err));
        task
    }

    /// The command this task carries.
    pub fn command(&self) -> &Arc<Command> {
        &self.command
    }

    /// Stores the result and releases the waiter. Returns `false` when a result was already set.
    pub fn set_result(&self, result: TaskResult) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            warn!(
                "Ignoring second result for task [{}]; the first one stands",
                self.command
            );
            return false;
        }
        // Capacity is one and only the first caller gets here, so this cannot block or fail.
        if self.result_tx.try_send(result).is_err() {
            warn!("Result slot of task [{}] is unavailable", self.command);
        }
        true
    }

    /// Blocks until the result is set or `timeout` elapses.
    pub fn wait_result(&self, timeout: Duration) -> TaskResult {
        if self.waiting.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::Protocol(format!(
                "task [{}] already has a waiter",
                self.command
            )));
        }
        match self.result_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.abandoned.store(true, Ordering::Release);
                debug!("Task [{}] abandoned after {:?}", self.command, timeout);
                Err(BridgeError::Timeout {
                    handle: self.command.expert_handle,
                    after: timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::ChannelRecv(format!(
                "result slot of task [{}] closed",
                self.command
            ))),
        }
    }

    /// Whether a result has been set.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Whether the waiter gave up before the result arrived.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }
}

impl std::fmt::Display for CommandTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Command = {}", self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtbridge_common::ResponseValue;
    use std::thread;
    use std::time::Instant;

    fn task() -> Arc<CommandTask> {
        Arc::new(CommandTask::new(Command::new(17, vec![], 7)))
    }

    #[test]
    fn waiter_receives_the_value_set_later() {
        let task = task();
        let setter = Arc::clone(&task);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            setter.set_result(Ok(Response::ok(ResponseValue::Double(1.2345))))
        });
        let response = task.wait_result(Duration::from_secs(5)).unwrap();
        assert_eq!(response.value, ResponseValue::Double(1.2345));
        assert!(handle.join().unwrap());
        assert!(!task.is_abandoned());
    }

    #[test]
    fn second_result_does_not_overwrite_the_first() {
        let task = task();
        assert!(task.set_result(Ok(Response::ok(ResponseValue::Int(1)))));
        assert!(!task.set_result(Ok(Response::ok(ResponseValue::Int(2)))));
        let response = task.wait_result(Duration::from_millis(10)).unwrap();
        assert_eq!(response.value, ResponseValue::Int(1));
    }

    #[test]
    fn timeout_returns_sentinel_and_marks_abandoned() {
        let task = task();
        let started = Instant::now();
        let err = task.wait_result(Duration::from_millis(30)).unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(matches!(err, BridgeError::Timeout { handle: 7, .. }));
        assert!(task.is_abandoned());

        // The late completion is accepted by the abandoned task only.
        let fresh = self::task();
        assert!(task.set_result(Ok(Response::ok(ResponseValue::Int(99)))));
        assert!(!fresh.is_completed());
        assert!(fresh.wait_result(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn failed_task_returns_immediately() {
        let task = CommandTask::failed(Command::new(1, vec![], 3), BridgeError::SessionNotFound(3));
        let started = Instant::now();
        let err = task.wait_result(Duration::from_secs(40)).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(err.is_connection());
    }

    #[test]
    fn only_one_waiter_is_admitted() {
        let task = task();
        task.set_result(Ok(Response::void()));
        task.wait_result(Duration::from_millis(10)).unwrap();
        assert!(task.wait_result(Duration::from_millis(10)).unwrap_err().is_protocol());
    }
}

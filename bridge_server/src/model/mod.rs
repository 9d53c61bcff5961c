//! Session state shared between the engine and the network side.
//!
//! - `task`: one command and its pending result.
//! - `executor`: command queue of one session.
//! - `registry`: sessions of one server.
//! - `poll_monitor`: stall tracker for tester sessions.

pub mod executor;
pub mod poll_monitor;
pub mod registry;
pub mod task;

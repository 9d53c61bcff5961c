//! Simulated engine used by the server binary.
//!
//! - `market`: random-walk quotes and bar history.
//! - `ops`: the command table the simulated sessions answer.
//! - `engine`: one polling thread per session, driven through the engine adapter.

pub mod engine;
pub mod market;
pub mod ops;

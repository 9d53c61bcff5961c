//!
//! Common types and utilities shared by the bridge server, the engine adapter and the client.
//!
//! This crate aggregates:
//! - `error`: unified error type `BridgeError` and its wire form.
//! - `result`: handy `Result<T, BridgeError>` alias.
//! - `command`: Tier-1 command payload and argument values.
//! - `response`: tagged-union engine response and typed extraction.
//! - `request`: Tier-2 structured request/response envelopes.
//! - `quote` / `event`: notifications produced by engine sessions.
//! - `wire`: frames exchanged over a client connection.
//! - `net`: ports, addressing and the transport-agnostic stream.
#![warn(missing_docs)]
pub mod command;
pub mod error;
pub mod event;
pub mod net;
pub mod quote;
pub mod request;
pub mod response;
pub mod result;
pub mod wire;

pub use command::{Arg, Command, SessionHandle};
pub use error::BridgeError;
pub use event::EngineEvent;
pub use quote::Quote;
pub use request::{StructuredRequest, StructuredResponse};
pub use response::{Response, ResponseValue};
pub use result::Result;

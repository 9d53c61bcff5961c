//! Client side of the bridge.
//!
//! - `stub`: one open channel: request/reply correlation and the notification reader.
//! - `client`: connection state machine, executor handle and typed calls on top of the stub.
//! - `events`: connection states, client events and settings.
#![warn(missing_docs)]
pub mod client;
pub mod events;
pub mod stub;

pub use client::{BridgeClient, Call};
pub use events::{ClientConfig, ClientEvent, ConnectionState};
pub use stub::{ClientStub, StubEvent};

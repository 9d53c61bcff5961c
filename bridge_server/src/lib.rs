//! Server side of the bridge between a polling script engine and remote clients.
//!
//! The engine talks to an [`adapter::EngineAdapter`]; remote clients talk to the listeners of a
//! [`server::BridgeServer`]. In between:
//! - `model::task`: single-assignment result slot a caller waits on;
//! - `model::executor`: per-session FIFO the engine polls one command at a time;
//! - `model::registry`: handle → executor map of one server;
//! - `model::poll_monitor`: stall tracker for tester sessions;
//! - `hub`: quote/event fan-out to connected clients;
//! - `service`: dispatcher of remote operations;
//! - `connection` / `host`: per-client threads and the listeners that accept them.
#![warn(missing_docs)]
pub mod adapter;
pub mod config;
pub mod connection;
pub mod host;
pub mod hub;
pub mod model;
pub mod server;
pub mod service;

pub use adapter::EngineAdapter;
pub use config::ServerConfig;
pub use server::BridgeServer;

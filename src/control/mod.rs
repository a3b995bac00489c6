//! Private control channel between the manager and its connectors.
//!
//! Frames are JSON objects `{verb, msg, data, id}` carried over one WebSocket per
//! connector. The manager pushes configuration (`NOTIFY` once, `PATCH` afterwards) and peer
//! JWS keys; connectors read state and report peer keys.

pub mod client;
pub mod message;
pub mod server;

pub use client::{ConfigApplier, FileApplier, run_session};
pub use message::{Message, Msg, ProtocolError, Verb};
pub use server::{ControlBackend, ControlChannel, Push, start_control_server};

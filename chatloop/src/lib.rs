//! chatloop — real-time conversation sync engine for an AI chat client.
//!
//! Keeps three asynchronous sources of truth consistent: optimistic local
//! state in the [`store::MessageStore`], a long-lived WebSocket stream owned
//! by the [`connection::ConnectionManager`], and long-running query requests
//! issued by the [`query::QueryDispatcher`]. Attachment uploads are handled
//! by [`upload::UploadTracker`].

pub mod auth;
pub mod config;
pub mod connection;
pub mod http;
pub mod query;
pub mod store;
pub mod upload;

pub use chatloop_proto as proto;

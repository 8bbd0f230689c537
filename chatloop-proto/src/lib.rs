//! Shared wire types for the chatloop backend protocol.
//!
//! Everything the backend sends or accepts is JSON; these types define the
//! exact shapes for the real-time channel envelopes, the query endpoint,
//! the upload endpoint, and token refresh.

pub mod auth;
pub mod event;
pub mod message;
pub mod query;
pub mod upload;

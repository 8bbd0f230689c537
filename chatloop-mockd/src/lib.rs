//! Scriptable mock backend for exercising the chatloop engine over real
//! sockets.
//!
//! Serves the four surfaces the engine consumes — the real-time channel,
//! `/query`, `/upload`, and `/token/refresh` — with behavior scripted per
//! test: canned or delayed answers, 503/504/error statuses, token
//! requirements, and direct event push into connected channels.

pub mod backend;

pub use backend::{MockBackend, QueryScript, RefreshBehavior, canned_response};

//! API management backend: registered APIs, API keys, call logs, and the
//! gate that rate limits and authorizes every request before it reaches a
//! handler.

pub mod api;
pub mod auth;
pub mod crypto;
pub mod gate;
pub mod keys;
pub mod policy;
pub mod quota;
pub mod store;
pub mod upstream;

//! # Portcullis (request-serving core)
//!
//! `portcullis` is a hardened JSON API core. Every inbound request passes a
//! fixed pipeline: per-client throttling, bearer-token authentication,
//! permission checks, then the handler. Handlers may hand fire-and-forget
//! work to a supervised background pool, and mutate versioned resources
//! under optimistic concurrency control.
//!
//! ## Pipeline
//!
//! - **Throttle:** each client IP owns an independent token bucket; idle
//!   buckets are swept out to bound memory.
//! - **Authenticate:** `Authorization: Bearer <token>` resolves to a
//!   [`api::auth::Principal`]; absence means anonymous, never an error.
//! - **Authorize:** authenticated → activated → holds the permission code,
//!   checked in that order, each with its own rejection.
//! - **Handle:** resource reads and OCC-guarded writes against the store.
//!
//! ## Shutdown
//!
//! SIGINT/SIGTERM stop the listener, drain in-flight requests within a
//! bounded budget, then wait for every outstanding background task before
//! the process reports itself stopped. Accepted background work is never
//! discarded.

pub mod api;
pub mod cli;

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}

//! The controller-facing half: wire protocol, per-connection endpoints, the
//! per-session hub and the session registry with its HTTP surface.

pub mod endpoint;
pub mod hub;
pub mod proto;
pub mod server;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("maximum number of sessions ({0}) reached")]
    CapacityExceeded(usize),
    #[error("session `{0}` already exists")]
    Duplicate(String),
    #[error("session `{0}` not found")]
    NotFound(String),
}

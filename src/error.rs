//! Application-wide error types.

use thiserror::Error;

/// Error taxonomy shared by the scheduler, the agent and the client helpers.
///
/// Only startup preconditions (socket bind, initial registry load, agent
/// privilege check) are treated as fatal by callers; every per-request
/// variant is converted into a typed wire reply and the service loop
/// continues.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    /// Malformed inbound envelope — answered with an error reply, never fatal.
    #[error("decode error: {0}")]
    Decode(String),

    /// Identity absent from the registry. An expected reply, not a fault.
    #[error("app id not found: {0}")]
    NotFound(String),

    /// The named OS account does not exist on this host.
    #[error("account error: {0}")]
    Account(String),

    /// Child command failed to start or exited non-zero. Carries the
    /// failure detail; any captured output travels in the reply payload.
    #[error("execution error: {0}")]
    Execution(String),

    /// Connect/send/recv failure on a client call.
    #[error("transport error: {0}")]
    Transport(String),

    /// No reply within the configured bound.
    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

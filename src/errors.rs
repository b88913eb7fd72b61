//! QRTR bus error hierarchy.
//!
//! Errors raised during object construction abort construction. Errors in the
//! steady-state decode loop stop the observer and freeze the directory at its
//! last-known state; they surface through the diagnostic log, not through the
//! event stream. Per-call errors on a client `send` are returned to the
//! caller.

use std::io;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to open an `AF_QIPCRTR` datagram socket. Fatal to the object
    /// being constructed.
    #[error("failed to create QRTR socket: {0}")]
    SocketCreate(#[source] io::Error),

    /// A send/recv/getsockname call failed. Fatal to the bus observer,
    /// per-call for a client channel.
    #[error("QRTR socket i/o error: {0}")]
    SocketIo(#[source] io::Error),

    /// A connect or wait deadline elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The awaited node deregistered all of its services before the wait
    /// completed.
    #[error("QRTR node {0} was removed from the bus")]
    NodeRemoved(u32),

    /// Rejected [`BusConfig`](crate::BusConfig) values.
    #[error("invalid configuration: {0}")]
    Config(String),
}

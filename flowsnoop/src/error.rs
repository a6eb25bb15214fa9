//! Typed error taxonomy for the producer/consumer flush contract.
//!
//! Mirrors the shape of a hand-rolled `AppError`: one enum per surface, a
//! `Display` impl that is safe to log directly, and `From` impls at the
//! boundaries where a third-party error needs folding in. No `thiserror`.

use std::fmt;

/// Errors a [`crate::flow::Producer`] can surface through `Init` or through
/// the flush reply channel.
#[derive(Debug)]
pub enum ProducerError {
    /// Resource unavailable: no privilege, missing kernel feature, interface
    /// does not exist. Fatal — prevents `run` from starting.
    Setup(String),
    /// Ring/socket read error other than a timeout. The producer enters its
    /// stuck state and reports this on every subsequent flush until
    /// cancelled.
    CaptureRead(String),
    /// Kernel map iterate/lookup/delete failure. Reported once, then the
    /// producer terminates.
    KernelMapIo(String),
    /// Flow key failed to unpack from its wire bytes. Treated the same as
    /// `KernelMapIo`.
    Decode(String),
    /// The consumer's `push` failed while flushing a snapshot. The
    /// controller treats this as fatal, same as `KernelMapIo`/`Decode`.
    ConsumerPush(String),
}

impl fmt::Display for ProducerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProducerError::Setup(msg) => write!(f, "producer setup failed: {msg}"),
            ProducerError::CaptureRead(msg) => write!(f, "capture read failed: {msg}"),
            ProducerError::KernelMapIo(msg) => write!(f, "kernel map i/o failed: {msg}"),
            ProducerError::Decode(msg) => write!(f, "flow key decode failed: {msg}"),
            ProducerError::ConsumerPush(msg) => write!(f, "consumer push failed: {msg}"),
        }
    }
}

impl std::error::Error for ProducerError {}

impl From<std::io::Error> for ProducerError {
    fn from(e: std::io::Error) -> Self {
        ProducerError::CaptureRead(e.to_string())
    }
}

/// Errors a [`crate::flow::Consumer`] can surface through `Init` or `Push`.
#[derive(Debug)]
pub enum ConsumerError {
    /// Sink unavailable at `Init` time (can't open file, can't dial db).
    Init(String),
    /// `Push` failed. The controller treats this as fatal: no further
    /// flushes are attempted, though `Finalize` still runs.
    Push(String),
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerError::Init(msg) => write!(f, "consumer init failed: {msg}"),
            ConsumerError::Push(msg) => write!(f, "consumer push failed: {msg}"),
        }
    }
}

impl std::error::Error for ConsumerError {}

impl From<sqlx::Error> for ConsumerError {
    fn from(e: sqlx::Error) -> Self {
        ConsumerError::Push(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_error_display_is_descriptive() {
        let e = ProducerError::Setup("no CAP_NET_ADMIN".into());
        assert_eq!(e.to_string(), "producer setup failed: no CAP_NET_ADMIN");
    }

    #[test]
    fn consumer_error_from_sqlx() {
        let e: ConsumerError = sqlx::Error::RowNotFound.into();
        assert!(matches!(e, ConsumerError::Push(_)));
    }
}

//! Error types for block exchange

use crate::types::MailboxId;
use query_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while routing blocks to mailboxes
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// Invalid exchange or mailbox construction
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport failure on a remote mailbox; the mailbox is broken afterwards
    #[error("I/O error on mailbox {mailbox}: {source}")]
    Io {
        mailbox: MailboxId,
        #[source]
        source: TransportError,
    },

    /// Backpressure did not clear in time
    #[error("Timed out after {timeout:?} sending to mailbox {mailbox}")]
    Timeout { mailbox: MailboxId, timeout: Duration },

    /// Mailbox or its connection was closed
    #[error("Mailbox {mailbox} is closed")]
    Closed { mailbox: MailboxId },

    /// Send after the terminal block
    #[error("Mailbox {mailbox} already received its terminal block")]
    Terminated { mailbox: MailboxId },

    /// Partitioning failed on a block
    #[error("Partition error: {0}")]
    Partition(String),

    /// Block could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Exchange is unusable after an earlier failure
    #[error("Exchange failed earlier: {0}")]
    Failed(String),

    /// Transport error outside any mailbox
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ExchangeError {
    /// Mailbox the error happened on, if any
    pub fn mailbox(&self) -> Option<&MailboxId> {
        match self {
            ExchangeError::Io { mailbox, .. }
            | ExchangeError::Timeout { mailbox, .. }
            | ExchangeError::Closed { mailbox }
            | ExchangeError::Terminated { mailbox } => Some(mailbox),
            _ => None,
        }
    }

    /// Whether the error is a backpressure timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExchangeError::Timeout { .. })
    }
}

/// Result type for exchange operations
pub type Result<T> = std::result::Result<T, ExchangeError>;

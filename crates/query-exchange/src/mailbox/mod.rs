//! Mailboxes: directed single-producer channels between stage instances
//!
//! A [`SendingMailbox`] is either local, delivering straight into a
//! [`ReceivingMailbox`] in the same worker, or remote, writing framed
//! [`MailboxMessage`]s to the [`MailboxService`] of another worker.
//!
//! Every sending mailbox accepts any number of data blocks followed by
//! exactly one terminal block. Anything sent after the terminal block is
//! rejected with [`ExchangeError::Terminated`].

pub mod local;
pub mod message;
pub mod receiving;
pub mod remote;
pub mod service;

pub use local::LocalSendingMailbox;
pub use message::{MailboxMessage, MessagePayload};
pub use receiving::ReceivingMailbox;
pub use remote::RemoteSendingMailbox;
pub use service::{MailboxService, MailboxServiceConfig};

use crate::block::{DataBlock, EosBlock};
use crate::error::{ExchangeError, Result};
use crate::types::MailboxId;
use async_trait::async_trait;

/// Sending side of a mailbox
///
/// Not safe for concurrent use: the owning exchange serializes calls.
#[async_trait]
pub trait SendingMailbox: Send {
    /// Get the mailbox ID
    fn id(&self) -> &MailboxId;

    /// Whether the receiver lives in this process
    fn is_local(&self) -> bool;

    /// Send a data block, waiting up to the send timeout under backpressure
    ///
    /// Blocks for an early-terminated receiver are dropped.
    async fn send(&mut self, block: DataBlock) -> Result<()>;

    /// Send the terminal block; nothing may follow it
    async fn complete(&mut self, eos: EosBlock) -> Result<()>;

    /// Abort the mailbox, telling the receiver on a best-effort basis
    async fn cancel(&mut self, reason: &str);

    /// Whether the terminal block was sent or the mailbox was cancelled
    fn is_terminated(&self) -> bool;

    /// Whether the receiver asked for no more data
    fn is_early_terminated(&self) -> bool;
}

/// Lifecycle of a sending mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SenderState {
    Open,
    Completed,
    Cancelled,
    Broken,
}

impl SenderState {
    /// Reject sends that are not allowed in this state
    pub(crate) fn ensure_open(&self, mailbox: &MailboxId) -> Result<()> {
        match self {
            SenderState::Open => Ok(()),
            SenderState::Completed => Err(ExchangeError::Terminated { mailbox: *mailbox }),
            SenderState::Cancelled | SenderState::Broken => {
                Err(ExchangeError::Closed { mailbox: *mailbox })
            }
        }
    }
}

//! Block exchange for multi-stage query execution
//!
//! A stage pushes its output blocks into a [`BlockExchange`], which splits
//! oversized blocks, picks destinations with a [`DistributionType`] and
//! forwards each block to the stage's [`SendingMailbox`]es. A mailbox
//! delivers either into a [`ReceivingMailbox`] in the same worker or over a
//! framed connection to the [`MailboxService`] of another worker.
//!
//! # Architecture
//!
//! - **BlockExchange**: split, route, forward; terminal marker and stats
//! - **Distributor**: singleton, broadcast, hash, random and round-robin
//! - **BlockSplitter**: zero-copy row-range splitting by memory size
//! - **Mailboxes**: local and remote senders, bounded receiving queues
//! - **MailboxService**: transport request handler feeding receiving mailboxes
//!
//! # Example
//!
//! ```ignore
//! use query_exchange::*;
//!
//! let service = MailboxService::new(MailboxServiceConfig::default());
//! let id = MailboxId::new(QueryId::new(), 1, 0, 2, 0);
//! let receiver = service.receiving(id);
//!
//! let mut exchange = BlockExchange::new(
//!     vec![Box::new(service.local_sender(id))],
//!     DistributionType::Singleton,
//!     BlockSplitter::default(),
//!     ExchangeConfig::default(),
//! )?;
//! exchange.send(DataBlock::new(batch)).await?;
//! exchange.send_eos(EosBlock::success()).await?;
//!
//! while let Some(block) = receiver.recv().await {
//!     // ...
//! }
//! ```

pub mod block;
pub mod distribution;
pub mod error;
pub mod exchange;
pub mod mailbox;
pub mod splitter;
pub mod types;

pub use block::{Block, DataBlock, EosBlock};
pub use distribution::{hash_destinations, DistributionType, Distributor, Route};
pub use error::{ExchangeError, Result};
pub use exchange::{
    BlockExchange, ExchangeConfig, ExchangeStats, StatsIndexChooser, DEFAULT_MAX_BLOCK_SIZE,
};
pub use mailbox::{
    LocalSendingMailbox, MailboxMessage, MailboxService, MailboxServiceConfig, MessagePayload,
    ReceivingMailbox, RemoteSendingMailbox, SendingMailbox,
};
pub use splitter::{BlockSplitter, SplitBlocks};
pub use types::{MailboxId, QueryId, StageStats};

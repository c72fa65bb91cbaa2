//! Exchange router
//!
//! A [`BlockExchange`] owns the ordered sending mailboxes of one stage
//! output. Each block is split to the configured size, routed by the
//! distribution policy and forwarded in emission order. The first failure
//! poisons the exchange; the stage is expected to [`cancel`] it.
//!
//! [`cancel`]: BlockExchange::cancel

use crate::block::{DataBlock, EosBlock};
use crate::distribution::{DistributionType, Distributor, Route};
use crate::error::{ExchangeError, Result};
use crate::mailbox::SendingMailbox;
use crate::splitter::BlockSplitter;
use crate::types::{MailboxId, StageStats};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default largest block forwarded without splitting
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Blocks larger than this many bytes are split
    pub max_block_size: usize,
    /// Seed for the random policy and the stats chooser
    pub seed: Option<u64>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            seed: None,
        }
    }
}

impl ExchangeConfig {
    /// Set the split threshold
    pub fn with_max_block_size(mut self, bytes: usize) -> Self {
        self.max_block_size = bytes;
        self
    }

    /// Make random choices reproducible
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Decides which mailbox carries the full statistics on the terminal marker
#[derive(Clone, Default)]
pub enum StatsIndexChooser {
    /// A uniformly random mailbox
    #[default]
    Random,
    /// The first mailbox
    First,
    /// No mailbox; statistics are dropped
    None,
    /// Caller-supplied choice given the mailbox count
    Custom(Arc<dyn Fn(usize) -> Option<usize> + Send + Sync>),
}

impl StatsIndexChooser {
    /// Wrap a custom chooser
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(usize) -> Option<usize> + Send + Sync + 'static,
    {
        StatsIndexChooser::Custom(Arc::new(f))
    }

    fn choose(&self, num_mailboxes: usize, rng: &mut StdRng) -> Option<usize> {
        match self {
            StatsIndexChooser::Random => Some(rng.gen_range(0..num_mailboxes)),
            StatsIndexChooser::First => Some(0),
            StatsIndexChooser::None => None,
            StatsIndexChooser::Custom(f) => match f(num_mailboxes) {
                Some(idx) if idx >= num_mailboxes => {
                    warn!(
                        "Stats chooser picked mailbox {} of {}, dropping stats",
                        idx, num_mailboxes
                    );
                    None
                }
                choice => choice,
            },
        }
    }
}

impl fmt::Debug for StatsIndexChooser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsIndexChooser::Random => write!(f, "Random"),
            StatsIndexChooser::First => write!(f, "First"),
            StatsIndexChooser::None => write!(f, "None"),
            StatsIndexChooser::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Per-destination delivery counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    pub blocks_per_mailbox: Vec<u64>,
    pub rows_per_mailbox: Vec<u64>,
    pub blocks_split: u64,
    pub blocks_dropped: u64,
}

impl ExchangeStats {
    fn new(num_mailboxes: usize) -> Self {
        Self {
            blocks_per_mailbox: vec![0; num_mailboxes],
            rows_per_mailbox: vec![0; num_mailboxes],
            ..Default::default()
        }
    }

    /// Blocks delivered across all mailboxes
    pub fn total_blocks(&self) -> u64 {
        self.blocks_per_mailbox.iter().sum()
    }

    /// Rows delivered across all mailboxes
    pub fn total_rows(&self) -> u64 {
        self.rows_per_mailbox.iter().sum()
    }

    fn merge_into(&self, stats: &mut StageStats) {
        for (idx, (blocks, rows)) in self
            .blocks_per_mailbox
            .iter()
            .zip(&self.rows_per_mailbox)
            .enumerate()
        {
            stats.add_counter(format!("exchange.blocks.{}", idx), *blocks);
            stats.add_counter(format!("exchange.rows.{}", idx), *rows);
        }
        stats.add_counter("exchange.splits", self.blocks_split);
        stats.add_counter("exchange.dropped", self.blocks_dropped);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ExchangeState {
    Open,
    Finished,
    Cancelled,
    Failed(String),
}

/// Routes a stage's output blocks to its destination mailboxes
pub struct BlockExchange {
    mailboxes: Vec<Box<dyn SendingMailbox>>,
    distributor: Distributor,
    splitter: BlockSplitter,
    config: ExchangeConfig,
    stats_chooser: StatsIndexChooser,
    rng: StdRng,
    stats: ExchangeStats,
    state: ExchangeState,
}

impl BlockExchange {
    /// Create an exchange over `mailboxes`, in canonical partition order
    ///
    /// Fails if there are no mailboxes, two mailboxes share an ID, or the
    /// distribution does not fit the mailbox count.
    pub fn new(
        mailboxes: Vec<Box<dyn SendingMailbox>>,
        distribution: DistributionType,
        splitter: BlockSplitter,
        config: ExchangeConfig,
    ) -> Result<Self> {
        if mailboxes.is_empty() {
            return Err(ExchangeError::Config(
                "exchange needs at least one mailbox".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(mailboxes.len());
        for mailbox in &mailboxes {
            if !seen.insert(*mailbox.id()) {
                return Err(ExchangeError::Config(format!(
                    "duplicate mailbox {}",
                    mailbox.id()
                )));
            }
        }

        let distributor = Distributor::new(distribution, mailboxes.len(), config.seed)?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };

        debug!(
            "Exchange created: {} over {} mailboxes",
            distributor.kind(),
            mailboxes.len()
        );
        Ok(Self {
            stats: ExchangeStats::new(mailboxes.len()),
            mailboxes,
            distributor,
            splitter,
            config,
            stats_chooser: StatsIndexChooser::default(),
            rng,
            state: ExchangeState::Open,
        })
    }

    /// Replace the stats index chooser
    pub fn with_stats_chooser(mut self, chooser: StatsIndexChooser) -> Self {
        self.stats_chooser = chooser;
        self
    }

    /// Get the distribution policy
    pub fn distribution(&self) -> &DistributionType {
        self.distributor.kind()
    }

    /// Number of mailboxes
    pub fn num_mailboxes(&self) -> usize {
        self.mailboxes.len()
    }

    /// Mailbox IDs in partition order
    pub fn mailbox_ids(&self) -> Vec<MailboxId> {
        self.mailboxes.iter().map(|m| *m.id()).collect()
    }

    /// Get delivery counters
    pub fn stats(&self) -> &ExchangeStats {
        &self.stats
    }

    /// Whether the terminal marker has been sent
    pub fn is_finished(&self) -> bool {
        self.state == ExchangeState::Finished
    }

    /// Whether every mailbox asked for no more data
    pub fn is_early_terminated(&self) -> bool {
        self.mailboxes.iter().all(|m| m.is_early_terminated())
    }

    fn ensure_open(&self) -> Result<()> {
        let first = *self.mailboxes[0].id();
        match &self.state {
            ExchangeState::Open => Ok(()),
            ExchangeState::Finished => Err(ExchangeError::Terminated { mailbox: first }),
            ExchangeState::Cancelled => Err(ExchangeError::Closed { mailbox: first }),
            ExchangeState::Failed(reason) => Err(ExchangeError::Failed(reason.clone())),
        }
    }

    /// Split, route and forward a block
    ///
    /// Returns `true` once every mailbox is early-terminated, telling the
    /// producer it can stop. Any mailbox failure fails the call and leaves
    /// the exchange unusable; pieces already delivered are not recalled.
    pub async fn send(&mut self, block: DataBlock) -> Result<bool> {
        self.ensure_open()?;

        let pieces = self.splitter.split(block, self.config.max_block_size);
        if pieces.is_split() {
            self.stats.blocks_split += 1;
            debug!("Split oversized block into {} pieces", pieces.len());
        }

        for piece in pieces {
            if let Err(e) = self.route(piece).await {
                warn!("Exchange failed: {}", e);
                self.state = ExchangeState::Failed(e.to_string());
                return Err(e);
            }
        }
        Ok(self.is_early_terminated())
    }

    async fn route(&mut self, piece: DataBlock) -> Result<()> {
        match self.distributor.route(&piece)? {
            Route::All => {
                for idx in 0..self.mailboxes.len() {
                    self.deliver(idx, piece.clone()).await?;
                }
            }
            Route::One(idx) => self.deliver(idx, piece).await?,
            Route::Partitioned(parts) => {
                for (idx, part) in parts {
                    self.deliver(idx, part).await?;
                }
            }
        }
        Ok(())
    }

    async fn deliver(&mut self, idx: usize, block: DataBlock) -> Result<()> {
        let mailbox = &mut self.mailboxes[idx];
        if mailbox.is_early_terminated() {
            self.stats.blocks_dropped += 1;
            return Ok(());
        }

        let rows = block.num_rows() as u64;
        mailbox.send(block).await?;
        self.stats.blocks_per_mailbox[idx] += 1;
        self.stats.rows_per_mailbox[idx] += rows;
        Ok(())
    }

    /// Send the terminal marker to every mailbox
    ///
    /// One mailbox, picked by the stats chooser, gets the statistics merged
    /// with the exchange counters; the others get the bare marker. Every
    /// mailbox is attempted; the first failure is returned.
    pub async fn send_eos(&mut self, eos: EosBlock) -> Result<()> {
        self.ensure_open()?;

        let chosen = self.stats_chooser.choose(self.mailboxes.len(), &mut self.rng);
        let mut full = eos;
        self.stats
            .merge_into(full.stats.get_or_insert_with(StageStats::default));
        let bare = full.without_stats();

        let mut first_error = None;
        for (idx, mailbox) in self.mailboxes.iter_mut().enumerate() {
            let marker = if chosen == Some(idx) {
                full.clone()
            } else {
                bare.clone()
            };
            if let Err(e) = mailbox.complete(marker).await {
                warn!("Failed to complete mailbox {}: {}", mailbox.id(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => {
                self.state = ExchangeState::Failed(e.to_string());
                Err(e)
            }
            None => {
                self.state = ExchangeState::Finished;
                debug!(
                    "Exchange finished: {} blocks, {} rows",
                    self.stats.total_blocks(),
                    self.stats.total_rows()
                );
                Ok(())
            }
        }
    }

    /// Cancel every mailbox; later sends fail with `Closed`
    pub async fn cancel(&mut self, reason: &str) {
        if matches!(
            self.state,
            ExchangeState::Finished | ExchangeState::Cancelled
        ) {
            return;
        }
        for mailbox in &mut self.mailboxes {
            mailbox.cancel(reason).await;
        }
        self.state = ExchangeState::Cancelled;
        debug!("Exchange cancelled: {}", reason);
    }
}

impl fmt::Debug for BlockExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockExchange")
            .field("distribution", self.distributor.kind())
            .field("mailboxes", &self.mailbox_ids())
            .field("splitter", &self.splitter)
            .field("config", &self.config)
            .field("stats_chooser", &self.stats_chooser)
            .field("state", &self.state)
            .finish()
    }
}

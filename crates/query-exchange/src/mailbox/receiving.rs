//! Receiving end of a mailbox

use crate::block::{Block, EosBlock};
use crate::error::{ExchangeError, Result};
use crate::types::MailboxId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bounded FIFO queue of blocks addressed to one stage instance
///
/// Producers (a local sending mailbox or the mailbox service decoding remote
/// frames) offer blocks with a timeout; the consuming stage pulls them with
/// [`recv`](Self::recv) until the terminal block.
#[derive(Debug)]
pub struct ReceivingMailbox {
    id: MailboxId,
    tx: mpsc::Sender<Block>,
    rx: Mutex<mpsc::Receiver<Block>>,
    closed: CancellationToken,
    failure: OnceLock<EosBlock>,
    failed: CancellationToken,
    early_terminated: AtomicBool,
    finished: AtomicBool,
}

impl ReceivingMailbox {
    /// Create a mailbox holding at most `capacity` blocks
    pub fn new(id: MailboxId, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            id,
            tx,
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
            failure: OnceLock::new(),
            failed: CancellationToken::new(),
            early_terminated: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    /// Get the mailbox ID
    pub fn id(&self) -> &MailboxId {
        &self.id
    }

    /// Enqueue a block, waiting up to `timeout` for room
    pub async fn offer(&self, block: Block, timeout: Duration) -> Result<()> {
        if self.closed.is_cancelled() || self.failed.is_cancelled() {
            return Err(ExchangeError::Closed { mailbox: self.id });
        }

        tokio::select! {
            _ = self.closed.cancelled() => Err(ExchangeError::Closed { mailbox: self.id }),
            _ = self.failed.cancelled() => Err(ExchangeError::Closed { mailbox: self.id }),
            sent = tokio::time::timeout(timeout, self.tx.send(block)) => match sent {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(ExchangeError::Closed { mailbox: self.id }),
                Err(_) => Err(ExchangeError::Timeout {
                    mailbox: self.id,
                    timeout,
                }),
            },
        }
    }

    /// Enqueue a block only if there is room right now
    pub fn try_offer(&self, block: Block) -> bool {
        !self.closed.is_cancelled()
            && !self.failed.is_cancelled()
            && self.tx.try_send(block).is_ok()
    }

    /// Next block in arrival order
    ///
    /// Returns the terminal block once, then `None`. Also returns `None`
    /// after the mailbox is closed. A failure recorded with
    /// [`fail`](Self::fail) is returned ahead of any queued data.
    pub async fn recv(&self) -> Option<Block> {
        if self.finished.load(Ordering::Acquire) {
            return None;
        }
        if let Some(block) = self.take_failure() {
            return Some(block);
        }

        let mut rx = self.rx.lock().await;
        let block = tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            _ = self.failed.cancelled() => return self.take_failure(),
            block = rx.recv() => block,
        }?;

        if block.is_eos() {
            self.finished.store(true, Ordering::Release);
            debug!("Mailbox {} received terminal block", self.id);
        }
        Some(block)
    }

    /// Tell senders no more data is needed
    ///
    /// Data already queued is kept; senders still deliver the terminal block.
    pub fn early_terminate(&self) {
        if !self.early_terminated.swap(true, Ordering::AcqRel) {
            debug!("Mailbox {} early-terminated by receiver", self.id);
        }
    }

    /// Whether the receiver asked senders to stop
    pub fn is_early_terminated(&self) -> bool {
        self.early_terminated.load(Ordering::Acquire)
    }

    /// Whether the terminal block has been consumed
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Close the mailbox; pending and later offers fail with `Closed`
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the mailbox is closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Fail the mailbox with an error terminal block
    ///
    /// The error does not need queue room: the next `recv` returns it and
    /// queued data is discarded. Only the first failure is kept.
    pub fn fail(&self, reason: &str) {
        self.fail_with(EosBlock::error(reason));
    }

    /// Fail the mailbox with a caller-built error terminal block
    pub fn fail_with(&self, eos: EosBlock) {
        let reason = eos.error.clone().unwrap_or_default();
        if self.failure.set(eos).is_ok() {
            self.failed.cancel();
            debug!("Mailbox {} failed: {}", self.id, reason);
        }
    }

    /// Whether a failure was recorded
    pub fn is_failed(&self) -> bool {
        self.failed.is_cancelled()
    }

    fn take_failure(&self) -> Option<Block> {
        let eos = self.failure.get()?;
        if self.finished.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(Block::Eos(eos.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::test_support::sequential_batch;
    use crate::block::DataBlock;
    use crate::types::QueryId;
    use std::sync::Arc;

    fn mailbox(capacity: usize) -> Arc<ReceivingMailbox> {
        Arc::new(ReceivingMailbox::new(
            MailboxId::new(QueryId::new(), 1, 0, 0, 0),
            capacity,
        ))
    }

    fn data(start: i64) -> Block {
        Block::Data(DataBlock::new(sequential_batch(start, 2)))
    }

    #[tokio::test]
    async fn test_fifo_until_terminal() {
        let mb = mailbox(8);
        let timeout = Duration::from_secs(1);
        mb.offer(data(0), timeout).await.unwrap();
        mb.offer(data(10), timeout).await.unwrap();
        mb.offer(Block::Eos(EosBlock::success()), timeout).await.unwrap();

        assert_eq!(mb.recv().await, Some(data(0)));
        assert_eq!(mb.recv().await, Some(data(10)));
        assert!(mb.recv().await.unwrap().is_eos());
        assert!(mb.is_finished());
        assert_eq!(mb.recv().await, None);
    }

    #[tokio::test]
    async fn test_offer_times_out_when_full() {
        let mb = mailbox(1);
        mb.offer(data(0), Duration::from_secs(1)).await.unwrap();

        let err = mb
            .offer(data(1), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.mailbox(), Some(mb.id()));
    }

    #[tokio::test]
    async fn test_close_fails_pending_offer() {
        let mb = mailbox(1);
        mb.offer(data(0), Duration::from_secs(1)).await.unwrap();

        let pending = {
            let mb = Arc::clone(&mb);
            tokio::spawn(async move { mb.offer(data(1), Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mb.close();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ExchangeError::Closed { .. })));
        assert_eq!(mb.recv().await, None);
    }

    #[tokio::test]
    async fn test_try_offer_and_early_terminate() {
        let mb = mailbox(1);
        assert!(mb.try_offer(data(0)));
        assert!(!mb.try_offer(data(1)));

        assert!(!mb.is_early_terminated());
        mb.early_terminate();
        assert!(mb.is_early_terminated());
    }

    #[tokio::test]
    async fn test_fail_overtakes_full_queue() {
        let mb = mailbox(1);
        mb.offer(data(0), Duration::from_secs(1)).await.unwrap();
        mb.fail("query cancelled");
        mb.fail("second reason");
        assert!(mb.is_failed());
        assert!(!mb.try_offer(data(1)));

        let block = tokio::time::timeout(Duration::from_secs(2), mb.recv())
            .await
            .unwrap();
        let Some(Block::Eos(eos)) = block else {
            panic!("expected error terminal block");
        };
        assert_eq!(eos.error.as_deref(), Some("query cancelled"));
        assert_eq!(mb.recv().await, None);
    }

    #[tokio::test]
    async fn test_fail_wakes_waiting_receiver() {
        let mb = mailbox(4);
        let waiting = {
            let mb = Arc::clone(&mb);
            tokio::spawn(async move { mb.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mb.fail("upstream failed");

        let block = tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(block, Some(Block::Eos(eos)) if eos.is_error()));
    }
}

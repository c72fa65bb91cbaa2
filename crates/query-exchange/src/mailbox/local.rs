//! In-process sending mailbox

use super::{ReceivingMailbox, SenderState, SendingMailbox};
use crate::block::{Block, DataBlock, EosBlock};
use crate::error::{ExchangeError, Result};
use crate::types::MailboxId;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sends straight into a receiving mailbox in the same worker
#[derive(Debug)]
pub struct LocalSendingMailbox {
    id: MailboxId,
    receiver: Arc<ReceivingMailbox>,
    send_timeout: Duration,
    state: SenderState,
}

impl LocalSendingMailbox {
    /// Create a sender for `receiver`
    pub fn new(receiver: Arc<ReceivingMailbox>, send_timeout: Duration) -> Self {
        Self {
            id: *receiver.id(),
            receiver,
            send_timeout,
            state: SenderState::Open,
        }
    }

    async fn deliver(&mut self, block: Block) -> Result<()> {
        let result = self.receiver.offer(block, self.send_timeout).await;
        if let Err(ExchangeError::Closed { .. }) = &result {
            self.state = SenderState::Broken;
        }
        result
    }
}

#[async_trait]
impl SendingMailbox for LocalSendingMailbox {
    fn id(&self) -> &MailboxId {
        &self.id
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn send(&mut self, block: DataBlock) -> Result<()> {
        self.state.ensure_open(&self.id)?;
        if self.receiver.is_early_terminated() {
            return Ok(());
        }
        self.deliver(Block::Data(block)).await
    }

    async fn complete(&mut self, eos: EosBlock) -> Result<()> {
        self.state.ensure_open(&self.id)?;
        let result = self.deliver(Block::Eos(eos)).await;
        self.state = SenderState::Completed;
        debug!("Local mailbox {} completed", self.id);
        result
    }

    async fn cancel(&mut self, reason: &str) {
        if self.state != SenderState::Open {
            return;
        }
        self.state = SenderState::Cancelled;
        self.receiver.fail(reason);
        debug!("Local mailbox {} cancelled: {}", self.id, reason);
    }

    fn is_terminated(&self) -> bool {
        self.state != SenderState::Open
    }

    fn is_early_terminated(&self) -> bool {
        self.receiver.is_early_terminated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::test_support::sequential_batch;
    use crate::types::QueryId;

    fn pair(capacity: usize) -> (LocalSendingMailbox, Arc<ReceivingMailbox>) {
        let receiver = Arc::new(ReceivingMailbox::new(
            MailboxId::new(QueryId::new(), 1, 0, 0, 0),
            capacity,
        ));
        let sender = LocalSendingMailbox::new(Arc::clone(&receiver), Duration::from_millis(50));
        (sender, receiver)
    }

    #[tokio::test]
    async fn test_send_then_complete() {
        let (mut sender, receiver) = pair(4);
        sender
            .send(DataBlock::new(sequential_batch(0, 3)))
            .await
            .unwrap();
        sender.complete(EosBlock::success()).await.unwrap();
        assert!(sender.is_terminated());

        assert_eq!(receiver.recv().await.unwrap().num_rows(), 3);
        assert!(receiver.recv().await.unwrap().is_eos());
    }

    #[tokio::test]
    async fn test_send_after_terminal_rejected() {
        let (mut sender, _receiver) = pair(4);
        sender.complete(EosBlock::success()).await.unwrap();

        let err = sender
            .send(DataBlock::new(sequential_batch(0, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Terminated { .. }));
        assert!(matches!(
            sender.complete(EosBlock::success()).await,
            Err(ExchangeError::Terminated { .. })
        ));
    }

    #[tokio::test]
    async fn test_backpressure_times_out() {
        let (mut sender, _receiver) = pair(1);
        sender
            .send(DataBlock::new(sequential_batch(0, 1)))
            .await
            .unwrap();
        let err = sender
            .send(DataBlock::new(sequential_batch(1, 1)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_closed_receiver_breaks_sender() {
        let (mut sender, receiver) = pair(1);
        receiver.close();

        let err = sender
            .send(DataBlock::new(sequential_batch(0, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Closed { .. }));
        assert!(sender.is_terminated());
    }

    #[tokio::test]
    async fn test_early_terminated_data_dropped() {
        let (mut sender, receiver) = pair(4);
        receiver.early_terminate();
        assert!(sender.is_early_terminated());

        sender
            .send(DataBlock::new(sequential_batch(0, 1)))
            .await
            .unwrap();
        sender.complete(EosBlock::success()).await.unwrap();
        assert!(receiver.recv().await.unwrap().is_eos());
    }

    #[tokio::test]
    async fn test_cancel_delivers_error_terminal() {
        let (mut sender, receiver) = pair(4);
        sender.cancel("query cancelled").await;

        let Some(Block::Eos(eos)) = receiver.recv().await else {
            panic!("expected terminal block");
        };
        assert_eq!(eos.error.as_deref(), Some("query cancelled"));
        assert!(matches!(
            sender.send(DataBlock::new(sequential_batch(0, 1))).await,
            Err(ExchangeError::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_with_full_queue_reaches_receiver() {
        let (mut sender, receiver) = pair(1);
        sender
            .send(DataBlock::new(sequential_batch(0, 1)))
            .await
            .unwrap();
        sender.cancel("query cancelled").await;

        let block = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
            .await
            .unwrap();
        let Some(Block::Eos(eos)) = block else {
            panic!("expected error terminal block");
        };
        assert_eq!(eos.error.as_deref(), Some("query cancelled"));
        assert_eq!(receiver.recv().await, None);
    }
}

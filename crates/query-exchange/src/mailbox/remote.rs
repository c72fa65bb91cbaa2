//! Sending mailbox backed by a connection to another worker

use super::message::{MailboxMessage, MessagePayload};
use super::{SenderState, SendingMailbox};
use crate::block::{DataBlock, EosBlock};
use crate::error::{ExchangeError, Result};
use crate::types::MailboxId;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use query_transport::{ConnectOptions, FrameConnection};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Writes mailbox messages as frames to a remote [`MailboxService`]
///
/// A background task reads the connection's return direction and records
/// early-termination requests from the receiver.
///
/// [`MailboxService`]: super::MailboxService
pub struct RemoteSendingMailbox {
    id: MailboxId,
    peer: SocketAddr,
    sink: SplitSink<FrameConnection, Bytes>,
    send_timeout: Duration,
    state: SenderState,
    early_terminated: Arc<AtomicBool>,
    control: JoinHandle<()>,
}

impl RemoteSendingMailbox {
    /// Connect to the worker at `addr`
    pub async fn connect(
        id: MailboxId,
        addr: SocketAddr,
        options: &ConnectOptions,
        send_timeout: Duration,
    ) -> Result<Self> {
        let conn = query_transport::connect(addr, options)
            .await
            .map_err(|source| ExchangeError::Io {
                mailbox: id,
                source,
            })?;
        Ok(Self::from_connection(id, addr, conn, send_timeout))
    }

    /// Wrap an established connection
    pub fn from_connection(
        id: MailboxId,
        peer: SocketAddr,
        conn: FrameConnection,
        send_timeout: Duration,
    ) -> Self {
        let (sink, stream) = conn.split();
        let early_terminated = Arc::new(AtomicBool::new(false));
        let control = tokio::spawn(watch_control_frames(
            id,
            stream,
            Arc::clone(&early_terminated),
        ));

        debug!("Remote mailbox {} connected to {}", id, peer);
        Self {
            id,
            peer,
            sink,
            send_timeout,
            state: SenderState::Open,
            early_terminated,
            control,
        }
    }

    /// Address of the receiving worker
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    async fn write(&mut self, message: MailboxMessage) -> Result<()> {
        let frame = message.encode()?;
        match tokio::time::timeout(self.send_timeout, self.sink.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => {
                self.state = SenderState::Broken;
                Err(ExchangeError::Io {
                    mailbox: self.id,
                    source,
                })
            }
            Err(_) => {
                // A partially written frame leaves the stream unusable
                self.state = SenderState::Broken;
                Err(ExchangeError::Timeout {
                    mailbox: self.id,
                    timeout: self.send_timeout,
                })
            }
        }
    }

    async fn close_sink(&mut self) {
        match tokio::time::timeout(self.send_timeout, self.sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Closing mailbox {} connection failed: {}", self.id, e),
            Err(_) => debug!("Closing mailbox {} connection timed out", self.id),
        }
    }
}

#[async_trait]
impl SendingMailbox for RemoteSendingMailbox {
    fn id(&self) -> &MailboxId {
        &self.id
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn send(&mut self, block: DataBlock) -> Result<()> {
        self.state.ensure_open(&self.id)?;
        if self.is_early_terminated() {
            return Ok(());
        }
        self.write(MailboxMessage::data(self.id, block)).await
    }

    async fn complete(&mut self, eos: EosBlock) -> Result<()> {
        self.state.ensure_open(&self.id)?;
        let result = self.write(MailboxMessage::eos(self.id, eos)).await;
        if result.is_ok() {
            self.state = SenderState::Completed;
            self.close_sink().await;
            debug!("Remote mailbox {} completed", self.id);
        }
        result
    }

    async fn cancel(&mut self, reason: &str) {
        if self.state != SenderState::Open {
            return;
        }
        if let Err(e) = self
            .write(MailboxMessage::eos(self.id, EosBlock::error(reason)))
            .await
        {
            debug!("Could not notify {} of cancellation: {}", self.peer, e);
        }
        self.state = SenderState::Cancelled;
        self.close_sink().await;
        debug!("Remote mailbox {} cancelled: {}", self.id, reason);
    }

    fn is_terminated(&self) -> bool {
        self.state != SenderState::Open
    }

    fn is_early_terminated(&self) -> bool {
        self.early_terminated.load(Ordering::Acquire)
    }
}

impl Drop for RemoteSendingMailbox {
    fn drop(&mut self) {
        self.control.abort();
    }
}

async fn watch_control_frames(
    id: MailboxId,
    mut stream: SplitStream<FrameConnection>,
    early_terminated: Arc<AtomicBool>,
) {
    while let Some(frame) = stream.next().await {
        match frame
            .map_err(ExchangeError::from)
            .and_then(MailboxMessage::decode)
        {
            Ok(MailboxMessage {
                mailbox_id,
                payload: MessagePayload::EarlyTerminate,
            }) if mailbox_id == id => {
                if !early_terminated.swap(true, Ordering::AcqRel) {
                    debug!("Mailbox {} early-terminated by receiver", id);
                }
            }
            Ok(other) => warn!(
                "Unexpected message for {} on mailbox {} connection",
                other.mailbox_id, id
            ),
            Err(e) => {
                debug!("Control stream of mailbox {} ended: {}", id, e);
                break;
            }
        }
    }
}

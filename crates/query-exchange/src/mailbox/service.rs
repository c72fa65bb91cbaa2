//! Per-worker registry of receiving mailboxes
//!
//! The service is the request handler installed on the worker's query
//! server. Frames on one connection are handled in order, so a full
//! receiving queue stalls that connection and the backpressure reaches the
//! remote sender through TCP.

use super::message::{MailboxMessage, MessagePayload};
use super::{LocalSendingMailbox, ReceivingMailbox, RemoteSendingMailbox};
use crate::block::Block;
use crate::error::Result;
use crate::types::{MailboxId, QueryId};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use query_transport::{ConnectOptions, ConnectionContext, RequestHandler, TransportError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Configuration for the mailbox service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxServiceConfig {
    /// Blocks buffered per receiving mailbox
    pub queue_capacity: usize,
    /// How long an inbound frame may wait for queue room, in milliseconds
    pub offer_timeout_ms: u64,
    /// Send timeout for sending mailboxes created by the service, in milliseconds
    pub send_timeout_ms: u64,
}

impl Default for MailboxServiceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            offer_timeout_ms: 10_000,
            send_timeout_ms: 10_000,
        }
    }
}

impl MailboxServiceConfig {
    /// Set the receive queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the offer timeout
    pub fn with_offer_timeout(mut self, timeout: Duration) -> Self {
        self.offer_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the send timeout
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Offer timeout
    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }

    /// Send timeout
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Receiving mailboxes of one worker, keyed by mailbox ID
#[derive(Debug)]
pub struct MailboxService {
    config: MailboxServiceConfig,
    mailboxes: DashMap<MailboxId, Arc<ReceivingMailbox>>,
    released: DashMap<MailboxId, ()>,
}

impl MailboxService {
    /// Create an empty service
    pub fn new(config: MailboxServiceConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            mailboxes: DashMap::new(),
            released: DashMap::new(),
        })
    }

    /// Get service configuration
    pub fn config(&self) -> &MailboxServiceConfig {
        &self.config
    }

    /// Get or create the receiving mailbox for `id`
    pub fn receiving(&self, id: MailboxId) -> Arc<ReceivingMailbox> {
        self.mailboxes
            .entry(id)
            .or_insert_with(|| Arc::new(ReceivingMailbox::new(id, self.config.queue_capacity)))
            .clone()
    }

    /// Get the receiving mailbox for `id` if it exists
    pub fn get(&self, id: &MailboxId) -> Option<Arc<ReceivingMailbox>> {
        self.mailboxes.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `id` was released and must not be recreated by inbound frames
    pub fn is_released(&self, id: &MailboxId) -> bool {
        self.released.contains_key(id)
    }

    /// Sending mailbox for a receiver in this worker
    pub fn local_sender(&self, id: MailboxId) -> LocalSendingMailbox {
        LocalSendingMailbox::new(self.receiving(id), self.config.send_timeout())
    }

    /// Sending mailbox for a receiver on the worker at `addr`
    pub async fn remote_sender(
        &self,
        id: MailboxId,
        addr: SocketAddr,
        options: &ConnectOptions,
    ) -> Result<RemoteSendingMailbox> {
        RemoteSendingMailbox::connect(id, addr, options, self.config.send_timeout()).await
    }

    /// Remove and close a receiving mailbox
    ///
    /// Frames arriving later for `id` are rejected instead of recreating it,
    /// until the query is released.
    pub fn release(&self, id: &MailboxId) -> Option<Arc<ReceivingMailbox>> {
        let (_, mailbox) = self.mailboxes.remove(id)?;
        self.released.insert(*id, ());
        mailbox.close();
        Some(mailbox)
    }

    /// Remove and close every receiving mailbox of a query
    pub fn release_query(&self, query_id: QueryId) -> usize {
        let ids: Vec<MailboxId> = self
            .mailboxes
            .iter()
            .filter(|entry| entry.key().query_id == query_id)
            .map(|entry| *entry.key())
            .collect();
        let count = ids.iter().filter(|id| self.release(id).is_some()).count();
        self.released.retain(|id, _| id.query_id != query_id);
        count
    }

    /// Number of receiving mailboxes
    pub fn len(&self) -> usize {
        self.mailboxes.len()
    }

    /// Whether there are no receiving mailboxes
    pub fn is_empty(&self) -> bool {
        self.mailboxes.is_empty()
    }
}

#[async_trait]
impl RequestHandler for MailboxService {
    async fn handle(
        &self,
        ctx: &ConnectionContext,
        frame: Bytes,
    ) -> query_transport::Result<Option<Bytes>> {
        let message =
            MailboxMessage::decode(frame).map_err(|e| TransportError::Handler(e.to_string()))?;
        let id = message.mailbox_id;

        if let MessagePayload::EarlyTerminate = message.payload {
            warn!(
                "Ignoring early-terminate frame from {} for mailbox {}",
                ctx.peer_addr, id
            );
            return Ok(None);
        }
        if self.is_released(&id) {
            warn!(
                "Rejecting frame from {} for released mailbox {}",
                ctx.peer_addr, id
            );
            return Err(TransportError::Handler(format!(
                "Mailbox {} was released",
                id
            )));
        }
        let mailbox = self.receiving(id);

        let block = match message.payload {
            MessagePayload::Data(data) => {
                if mailbox.is_early_terminated() {
                    trace!("Dropping block for early-terminated mailbox {}", id);
                    let reply = MailboxMessage::early_terminate(id)
                        .encode()
                        .map_err(|e| TransportError::Handler(e.to_string()))?;
                    return Ok(Some(reply));
                }
                Block::Data(data)
            }
            MessagePayload::Eos(eos) if eos.is_error() => {
                mailbox.fail_with(eos);
                return Ok(None);
            }
            MessagePayload::Eos(eos) => Block::Eos(eos),
            MessagePayload::EarlyTerminate => return Ok(None),
        };

        mailbox
            .offer(block, self.config.offer_timeout())
            .await
            .map_err(|e| {
                warn!("Failed to deliver frame from {}: {}", ctx.peer_addr, e);
                TransportError::Handler(e.to_string())
            })?;
        Ok(None)
    }
}

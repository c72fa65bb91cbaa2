//! Mailbox wire envelope
//!
//! Each transport frame carries one message:
//!
//! ```text
//! [kind u8][query uuid 16B][sender stage u32][sender worker u32]
//! [receiver stage u32][receiver worker u32][body]
//! ```
//!
//! Integers are big-endian. Data bodies are an Arrow IPC stream holding one
//! batch; terminal bodies are JSON.

use crate::block::{DataBlock, EosBlock};
use crate::error::{ExchangeError, Result};
use crate::types::{MailboxId, QueryId};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Size of the fixed header
pub const HEADER_LEN: usize = 1 + 16 + 4 * 4;

const KIND_DATA: u8 = 1;
const KIND_EOS: u8 = 2;
const KIND_EARLY_TERMINATE: u8 = 3;

/// Message body
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    /// Rows for the receiver
    Data(DataBlock),
    /// Terminal marker
    Eos(EosBlock),
    /// Receiver to sender: stop sending data
    EarlyTerminate,
}

/// One framed mailbox message
#[derive(Debug, Clone, PartialEq)]
pub struct MailboxMessage {
    pub mailbox_id: MailboxId,
    pub payload: MessagePayload,
}

impl MailboxMessage {
    /// Data message
    pub fn data(mailbox_id: MailboxId, block: DataBlock) -> Self {
        Self {
            mailbox_id,
            payload: MessagePayload::Data(block),
        }
    }

    /// Terminal message
    pub fn eos(mailbox_id: MailboxId, eos: EosBlock) -> Self {
        Self {
            mailbox_id,
            payload: MessagePayload::Eos(eos),
        }
    }

    /// Early-termination control message
    pub fn early_terminate(mailbox_id: MailboxId) -> Self {
        Self {
            mailbox_id,
            payload: MessagePayload::EarlyTerminate,
        }
    }

    /// Encode into a frame payload
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        let kind = match &self.payload {
            MessagePayload::Data(_) => KIND_DATA,
            MessagePayload::Eos(_) => KIND_EOS,
            MessagePayload::EarlyTerminate => KIND_EARLY_TERMINATE,
        };
        buf.put_u8(kind);
        buf.put_slice(self.mailbox_id.query_id.0.as_bytes());
        buf.put_u32(self.mailbox_id.sender_stage);
        buf.put_u32(self.mailbox_id.sender_worker);
        buf.put_u32(self.mailbox_id.receiver_stage);
        buf.put_u32(self.mailbox_id.receiver_worker);

        match &self.payload {
            MessagePayload::Data(block) => {
                let batch = block.batch();
                let mut writer = StreamWriter::try_new((&mut buf).writer(), &batch.schema())
                    .map_err(|e| ExchangeError::Serialization(e.to_string()))?;
                writer
                    .write(batch)
                    .map_err(|e| ExchangeError::Serialization(e.to_string()))?;
                writer
                    .finish()
                    .map_err(|e| ExchangeError::Serialization(e.to_string()))?;
            }
            MessagePayload::Eos(eos) => {
                serde_json::to_writer((&mut buf).writer(), eos)
                    .map_err(|e| ExchangeError::Serialization(e.to_string()))?;
            }
            MessagePayload::EarlyTerminate => {}
        }

        Ok(buf.freeze())
    }

    /// Decode a frame payload
    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.len() < HEADER_LEN {
            return Err(ExchangeError::Serialization(format!(
                "mailbox frame of {} bytes is shorter than the {} byte header",
                frame.len(),
                HEADER_LEN
            )));
        }

        let kind = frame.get_u8();
        let query_id = Uuid::from_slice(&frame[..16])
            .map_err(|e| ExchangeError::Serialization(e.to_string()))?;
        frame.advance(16);
        let mailbox_id = MailboxId::new(
            QueryId::from_uuid(query_id),
            frame.get_u32(),
            frame.get_u32(),
            frame.get_u32(),
            frame.get_u32(),
        );

        let payload = match kind {
            KIND_DATA => {
                let mut reader = StreamReader::try_new(frame.reader(), None)
                    .map_err(|e| ExchangeError::Serialization(e.to_string()))?;
                let batch = reader
                    .next()
                    .ok_or_else(|| {
                        ExchangeError::Serialization("No batch found in data frame".to_string())
                    })?
                    .map_err(|e| ExchangeError::Serialization(e.to_string()))?;
                MessagePayload::Data(DataBlock::new(batch))
            }
            KIND_EOS => {
                let eos = serde_json::from_slice(&frame)
                    .map_err(|e| ExchangeError::Serialization(e.to_string()))?;
                MessagePayload::Eos(eos)
            }
            KIND_EARLY_TERMINATE => MessagePayload::EarlyTerminate,
            other => {
                return Err(ExchangeError::Serialization(format!(
                    "unknown mailbox message kind {}",
                    other
                )))
            }
        };

        Ok(Self {
            mailbox_id,
            payload,
        })
    }
}

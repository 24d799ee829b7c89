//! Fan-out of attestation events to external consumers.
//!
//! The processor reports every observation it signs and every VAA it finalizes. Each
//! subscriber gets its own bounded channels; a subscriber that falls behind loses events
//! rather than stalling the processor.

use std::{
    collections::HashMap,
    fmt, io,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
};

use async_trait::async_trait;
use guardian_vaa::{token, Vaa};
use log::*;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
};

/// An observation the local guardian signed, as an unsigned VAA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePublicationEvent {
    pub vaa: Vaa,
    pub initiating_tx: Vec<u8>,
}

/// A VAA that reached quorum along with its wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumEvent {
    pub vaa: Vaa,
    pub signed: Vec<u8>,
}

#[derive(Debug)]
struct Subscriber {
    messages: mpsc::Sender<MessagePublicationEvent>,
    quorums: mpsc::Sender<QuorumEvent>,
}

#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub messages: mpsc::Receiver<MessagePublicationEvent>,
    pub quorums: mpsc::Receiver<QuorumEvent>,
}

#[derive(Debug, Default)]
pub struct AttestationEventReporter {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

impl AttestationEventReporter {
    pub fn new() -> AttestationEventReporter {
        AttestationEventReporter::default()
    }

    pub fn subscribe(&self, capacity: usize) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (messages_tx, messages) = mpsc::channel(capacity.max(1));
        let (quorums_tx, quorums) = mpsc::channel(capacity.max(1));

        let _ = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Subscriber {
                    messages: messages_tx,
                    quorums: quorums_tx,
                },
            );
        debug!("reporter subscriber {} added", id);

        Subscription {
            id,
            messages,
            quorums,
        }
    }

    /// Removes subscriber `id`, closing its channels. Returns whether it existed.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn report_message_publication(&self, vaa: &Vaa, initiating_tx: &[u8]) {
        let event = MessagePublicationEvent {
            vaa: vaa.clone(),
            initiating_tx: initiating_tx.to_vec(),
        };
        self.fan_out("message publication", event, |s| &s.messages);
    }

    pub fn report_quorum(&self, vaa: &Vaa, signed: &[u8]) {
        let event = QuorumEvent {
            vaa: vaa.clone(),
            signed: signed.to_vec(),
        };
        self.fan_out("quorum", event, |s| &s.quorums);
    }

    fn fan_out<T, F>(&self, kind: &str, event: T, pick: F)
    where
        T: Clone,
        F: Fn(&Subscriber) -> &mpsc::Sender<T>,
    {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut closed = Vec::new();
        for (id, sub) in subscribers.iter() {
            match pick(sub).try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("reporter subscriber {} is full, dropping {} event", id, kind)
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            let _ = subscribers.remove(&id);
            debug!("reporter subscriber {} went away", id);
        }
    }
}

/// Database friendly form of a `u64`: values that fit a signed 64-bit column stay integers,
/// larger ones become decimal strings.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum PersistedValue {
    Int(i64),
    Decimal(String),
}

impl fmt::Display for PersistedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistedValue::Int(i) => write!(f, "{i}"),
            PersistedValue::Decimal(s) => f.write_str(s),
        }
    }
}

impl From<u64> for PersistedValue {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(i) => PersistedValue::Int(i),
            Err(_) => PersistedValue::Decimal(v.to_string()),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenTransferRecord {
    pub payload_id: u8,
    /// Decimal string, amounts do not fit any integer column.
    pub amount: String,
    pub token_address: String,
    pub token_chain: u16,
    pub target_address: String,
    pub target_chain: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AssetMetaRecord {
    pub token_address: String,
    pub token_chain: u16,
    pub decimals: u8,
    pub symbol: String,
    pub name: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecodedPayload {
    TokenTransfer(TokenTransferRecord),
    AssetMeta(AssetMetaRecord),
}

impl From<&token::Message> for DecodedPayload {
    fn from(msg: &token::Message) -> Self {
        match msg {
            token::Message::Transfer {
                amount,
                token_address,
                token_chain,
                recipient,
                recipient_chain,
                fee,
            } => DecodedPayload::TokenTransfer(TokenTransferRecord {
                payload_id: token::TRANSFER_PAYLOAD_ID,
                amount: amount.to_string(),
                token_address: token_address.to_string(),
                token_chain: (*token_chain).into(),
                target_address: recipient.to_string(),
                target_chain: (*recipient_chain).into(),
                fee: Some(fee.to_string()),
                from_address: None,
                payload: None,
            }),
            token::Message::AssetMeta {
                token_address,
                token_chain,
                decimals,
                symbol,
                name,
            } => DecodedPayload::AssetMeta(AssetMetaRecord {
                token_address: token_address.to_string(),
                token_chain: (*token_chain).into(),
                decimals: *decimals,
                symbol: symbol.to_string(),
                name: name.to_string(),
            }),
            token::Message::TransferWithPayload {
                amount,
                token_address,
                token_chain,
                redeemer,
                redeemer_chain,
                sender_address,
                payload,
            } => DecodedPayload::TokenTransfer(TokenTransferRecord {
                payload_id: token::TRANSFER_WITH_PAYLOAD_PAYLOAD_ID,
                amount: amount.to_string(),
                token_address: token_address.to_string(),
                token_chain: (*token_chain).into(),
                target_address: redeemer.to_string(),
                target_chain: (*redeemer_chain).into(),
                fee: None,
                from_address: Some(sender_address.to_string()),
                payload: Some(base64::encode(payload)),
            }),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct MessagePublicationRecord {
    pub emitter_chain: u16,
    pub emitter_address: String,
    pub sequence: PersistedValue,
    pub version: u8,
    pub guardian_set_index: u32,
    pub timestamp: u32,
    pub nonce: u32,
    pub initiating_tx_id: String,
    /// Base64 of the raw payload.
    pub payload: String,
    /// Present when the payload is a token bridge message.
    pub decoded_payload: Option<DecodedPayload>,
}

impl From<&MessagePublicationEvent> for MessagePublicationRecord {
    fn from(ev: &MessagePublicationEvent) -> Self {
        let body = &ev.vaa.body;
        let decoded_payload = if body.is_governance() {
            None
        } else {
            token::Message::deserialize(&body.payload)
                .ok()
                .map(|m| DecodedPayload::from(&m))
        };

        MessagePublicationRecord {
            emitter_chain: body.emitter_chain.into(),
            emitter_address: body.emitter_address.to_string(),
            sequence: body.sequence.into(),
            version: ev.vaa.header.version,
            guardian_set_index: ev.vaa.header.guardian_set_index,
            timestamp: body.timestamp,
            nonce: body.nonce,
            initiating_tx_id: hex::encode(&ev.initiating_tx),
            payload: base64::encode(&body.payload),
            decoded_payload,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct QuorumStateRecord {
    pub emitter_chain: u16,
    pub emitter_address: String,
    pub sequence: PersistedValue,
    /// Base64 of the signed VAA.
    pub signed_vaa: String,
}

impl From<&QuorumEvent> for QuorumStateRecord {
    fn from(ev: &QuorumEvent) -> Self {
        QuorumStateRecord {
            emitter_chain: ev.vaa.body.emitter_chain.into(),
            emitter_address: ev.vaa.body.emitter_address.to_string(),
            sequence: ev.vaa.body.sequence.into(),
            signed_vaa: base64::encode(&ev.signed),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    MessagePublication(MessagePublicationRecord),
    QuorumState(QuorumStateRecord),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink i/o failed")]
    Io(#[from] io::Error),

    #[error("failed to encode record")]
    Json(#[from] serde_json::Error),
}

/// Somewhere reporter records end up.
#[async_trait]
pub trait AttestationSink: Send {
    async fn write(&mut self, record: &Record) -> Result<(), SinkError>;
}

#[async_trait]
impl<S: AttestationSink + ?Sized> AttestationSink for &mut S {
    async fn write(&mut self, record: &Record) -> Result<(), SinkError> {
        (**self).write(record).await
    }
}

/// Writes a one line summary of every record to the log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl AttestationSink for LogSink {
    async fn write(&mut self, record: &Record) -> Result<(), SinkError> {
        match record {
            Record::MessagePublication(r) => info!(
                "message publication {}/{}/{} tx {} payload {} bytes",
                r.emitter_chain,
                r.emitter_address,
                r.sequence,
                r.initiating_tx_id,
                r.payload.len()
            ),
            Record::QuorumState(r) => info!(
                "quorum reached {}/{}/{}",
                r.emitter_chain, r.emitter_address, r.sequence
            ),
        }
        Ok(())
    }
}

/// Appends records to a file as JSON lines.
#[derive(Debug)]
pub struct JsonFileSink {
    file: File,
}

impl JsonFileSink {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<JsonFileSink, SinkError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(JsonFileSink { file })
    }
}

#[async_trait]
impl AttestationSink for JsonFileSink {
    async fn write(&mut self, record: &Record) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        self.file.flush().await?;
        Ok(())
    }
}

/// Drains `sub` into `sink` until both channels close or shutdown is signalled. Failed writes
/// are logged and skipped.
pub async fn run_sink<S: AttestationSink>(
    mut sub: Subscription,
    mut sink: S,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut messages_open = true;
    let mut quorums_open = true;

    while messages_open || quorums_open {
        let record = tokio::select! {
            _ = shutdown.changed() => break,
            ev = sub.messages.recv(), if messages_open => match ev {
                Some(ev) => Record::MessagePublication((&ev).into()),
                None => {
                    messages_open = false;
                    continue;
                }
            },
            ev = sub.quorums.recv(), if quorums_open => match ev {
                Some(ev) => Record::QuorumState((&ev).into()),
                None => {
                    quorums_open = false;
                    continue;
                }
            },
        };

        if let Err(e) = sink.write(&record).await {
            error!("failed to write record for subscriber {}: {}", sub.id, e);
        }
    }

    debug!("sink for subscriber {} stopped", sub.id);
}

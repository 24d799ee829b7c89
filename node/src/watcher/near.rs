//! NEAR source.
//!
//! The core contract reports messages through a `message_published` function call on itself,
//! so events are found by scanning each chunk of a block for receipts coming from the contract
//! account. NEAR has no indexer for transaction lookup by receipt, so reobservation is not
//! supported.

use async_trait::async_trait;
use guardian_vaa::{Address, Chain};
use log::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use super::{ChainSource, RpcError};
use crate::common::{MessagePublication, ReobservationError};

const MESSAGE_PUBLISHED: &str = "message_published";

/// Error cause NEAR reports for heights where no block was produced.
const UNKNOWN_BLOCK: &str = "UNKNOWN_BLOCK";

/// Failure to decode a single event. The event is skipped.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("args are not base64")]
    Base64(#[from] base64::DecodeError),

    #[error("args are not a message event")]
    Json(#[from] serde_json::Error),

    #[error("invalid hex field")]
    Hex(#[from] hex::FromHexError),

    #[error("emitter is {0} bytes, expected 32")]
    EmitterLength(usize),

    #[error("receipt id is not base58")]
    ReceiptId(#[from] bs58::decode::Error),
}

#[derive(Serialize, Debug)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize, Debug)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize, Debug, Default)]
struct JsonRpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    cause: Option<ErrorCause>,
}

#[derive(Deserialize, Debug)]
struct ErrorCause {
    name: String,
}

impl JsonRpcError {
    fn is_unknown_block(&self) -> bool {
        self.cause.as_ref().map_or(false, |c| c.name == UNKNOWN_BLOCK)
    }
}

impl From<JsonRpcError> for RpcError {
    fn from(e: JsonRpcError) -> Self {
        let message = match e.data {
            Some(Value::String(data)) => format!("{}: {}", e.message, data),
            _ => e.message,
        };
        RpcError::Rpc {
            code: e.code,
            message,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Block {
    pub header: BlockHeader,
    pub chunks: Vec<ChunkHeader>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct BlockHeader {
    pub height: u64,
    /// Nanoseconds since the unix epoch.
    pub timestamp: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ChunkHeader {
    pub chunk_hash: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Chunk {
    #[serde(default)]
    pub receipts: Vec<Receipt>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Receipt {
    pub predecessor_id: String,
    pub receipt_id: String,
    /// `{"Action": {"actions": [..]}}` or `{"Data": ..}`.
    pub receipt: Value,
}

#[derive(Deserialize, Debug)]
struct FunctionCall {
    method_name: String,
    args: String,
}

/// Arguments of the `message_published` call.
#[derive(Deserialize, Debug)]
struct MessageEvent {
    emitter: String,
    nonce: u32,
    seq: u64,
    data: String,
}

impl Receipt {
    fn function_calls(&self) -> impl Iterator<Item = FunctionCall> + '_ {
        self.receipt
            .get("Action")
            .and_then(|a| a.get("actions"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|action| action.get("FunctionCall"))
            .filter_map(|call| serde_json::from_value(call.clone()).ok())
    }
}

fn parse_event(
    receipt: &Receipt,
    call: &FunctionCall,
    timestamp: u32,
) -> Result<MessagePublication, EventError> {
    let args = base64::decode(&call.args)?;
    let event: MessageEvent = serde_json::from_slice(&args)?;

    let emitter = hex::decode(event.emitter.trim_start_matches("0x"))?;
    let mut emitter_address = Address::default();
    if emitter.len() != emitter_address.0.len() {
        return Err(EventError::EmitterLength(emitter.len()));
    }
    emitter_address.0.copy_from_slice(&emitter);

    Ok(MessagePublication {
        tx_hash: bs58::decode(&receipt.receipt_id).into_vec()?,
        timestamp,
        nonce: event.nonce,
        sequence: event.seq,
        consistency_level: 0,
        emitter_chain: Chain::Near,
        emitter_address,
        payload: hex::decode(event.data.trim_start_matches("0x"))?,
    })
}

/// Extracts every message published by `contract` in `chunk`.
pub fn extract(contract: &str, timestamp: u32, chunk: &Chunk) -> Vec<MessagePublication> {
    let mut out = Vec::new();
    for receipt in chunk
        .receipts
        .iter()
        .filter(|r| r.predecessor_id.ends_with(contract))
    {
        for call in receipt
            .function_calls()
            .filter(|c| c.method_name == MESSAGE_PUBLISHED)
        {
            match parse_event(receipt, &call, timestamp) {
                Ok(msg) => out.push(msg),
                Err(e) => warn!(
                    "skipping malformed near event in receipt {}: {}",
                    receipt.receipt_id, e
                ),
            }
        }
    }
    out
}

/// Block timestamps are nanoseconds, VAAs carry seconds.
fn block_time(header: &BlockHeader) -> u32 {
    u32::try_from(header.timestamp / 1_000_000_000).unwrap_or(u32::MAX)
}

pub struct NearSource {
    client: reqwest::Client,
    rpc: String,
    contract: String,
    /// The final block fetched by the last height query, reused when its height comes up.
    final_block: Option<Block>,
}

impl NearSource {
    pub fn new(rpc: String, contract: String) -> NearSource {
        NearSource {
            client: reqwest::Client::new(),
            rpc,
            contract,
            final_block: None,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Result<T, JsonRpcError>, RpcError> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id: "dontcare",
            method,
            params,
        };

        let resp: JsonRpcResponse<T> = self
            .client
            .post(&self.rpc)
            .json(&req)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match (resp.result, resp.error) {
            (_, Some(e)) => Ok(Err(e)),
            (Some(result), None) => Ok(Ok(result)),
            (None, None) => Err(RpcError::EmptyResponse),
        }
    }

    async fn fetch_final_block(&self) -> Result<Block, RpcError> {
        Ok(self
            .call::<Block>("block", json!({ "finality": "final" }))
            .await??)
    }

    /// The block at `height`, or `None` when the chain skipped that height.
    async fn block_at(&self, height: u64) -> Result<Option<Block>, RpcError> {
        match self
            .call::<Block>("block", json!({ "block_id": height }))
            .await?
        {
            Ok(block) => Ok(Some(block)),
            Err(e) if e.is_unknown_block() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn chunk(&self, hash: &str) -> Result<Chunk, RpcError> {
        Ok(self
            .call::<Chunk>("chunk", json!({ "chunk_id": hash }))
            .await??)
    }

    async fn inspect(&self, block: &Block) -> Result<Vec<MessagePublication>, RpcError> {
        let timestamp = block_time(&block.header);
        let mut out = Vec::new();
        for header in &block.chunks {
            let chunk = self.chunk(&header.chunk_hash).await?;
            out.extend(extract(&self.contract, timestamp, &chunk));
        }
        Ok(out)
    }
}

#[async_trait]
impl ChainSource for NearSource {
    fn chain(&self) -> Chain {
        Chain::Near
    }

    fn contract(&self) -> String {
        self.contract.clone()
    }

    async fn final_height(&mut self) -> Result<u64, RpcError> {
        let block = self.fetch_final_block().await?;
        let height = block.header.height;
        self.final_block = Some(block);
        Ok(height)
    }

    async fn observations_at(&mut self, height: u64) -> Result<Vec<MessagePublication>, RpcError> {
        let cached = self
            .final_block
            .take()
            .filter(|b| b.header.height == height);

        let block = match cached {
            Some(block) => block,
            None => match self.block_at(height).await? {
                Some(block) => block,
                None => {
                    debug!("near height {} has no block", height);
                    return Ok(Vec::new());
                }
            },
        };

        self.inspect(&block).await
    }

    async fn reobserve(
        &mut self,
        _tx_hash: &[u8],
    ) -> Result<Vec<MessagePublication>, ReobservationError> {
        Err(ReobservationError::Unsupported(Chain::Near))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CONTRACT: &str = "wormhole.test.near";

    fn function_call(method: &str, args: &Value) -> Value {
        json!({
            "FunctionCall": {
                "args": base64::encode(serde_json::to_vec(args).unwrap()),
                "deposit": "0",
                "gas": 100000000000000u64,
                "method_name": method,
            }
        })
    }

    fn receipt(predecessor: &str, receipt_id: &str, actions: Vec<Value>) -> Value {
        json!({
            "predecessor_id": predecessor,
            "receiver_id": CONTRACT,
            "receipt_id": receipt_id,
            "receipt": {
                "Action": {
                    "actions": actions,
                    "gas_price": "103000000",
                    "input_data_ids": [],
                    "output_data_receivers": [],
                    "signer_id": "test.near",
                }
            }
        })
    }

    fn event(seq: u64) -> Value {
        json!({
            "emitter": "00".repeat(31) + "01",
            "nonce": 7,
            "seq": seq,
            "data": "beef",
        })
    }

    #[test]
    fn extract_messages() {
        let receipt_id = bs58::encode([0x11; 32]).into_string();

        let ours = receipt(
            CONTRACT,
            &receipt_id,
            vec![
                json!("CreateAccount"),
                function_call(MESSAGE_PUBLISHED, &event(1)),
                function_call("publish_message", &event(9)),
                function_call(MESSAGE_PUBLISHED, &event(2)),
            ],
        );
        let foreign = receipt(
            "someone.near",
            &receipt_id,
            vec![function_call(MESSAGE_PUBLISHED, &event(3))],
        );
        let malformed = receipt(
            CONTRACT,
            &receipt_id,
            vec![
                function_call(
                    MESSAGE_PUBLISHED,
                    &json!({ "emitter": "abcd", "nonce": 1, "seq": 4, "data": "" }),
                ),
                function_call(MESSAGE_PUBLISHED, &json!({ "unexpected": true })),
            ],
        );
        let data = json!({
            "predecessor_id": CONTRACT,
            "receiver_id": CONTRACT,
            "receipt_id": receipt_id,
            "receipt": { "Data": { "data": null, "data_id": "x" } }
        });

        let chunk: Chunk = serde_json::from_value(json!({
            "author": "test.near",
            "header": {},
            "transactions": [],
            "receipts": [ours, foreign, malformed, data],
        }))
        .unwrap();

        let found = extract(CONTRACT, 1_650_000_000, &chunk);
        assert_eq!(
            vec![1, 2],
            found.iter().map(|m| m.sequence).collect::<Vec<_>>()
        );

        let msg = &found[0];
        assert_eq!(Chain::Near, msg.emitter_chain);
        assert_eq!(1, msg.emitter_address.0[31]);
        assert_eq!(7, msg.nonce);
        assert_eq!(vec![0xbe, 0xef], msg.payload);
        assert_eq!(vec![0x11; 32], msg.tx_hash);
        assert_eq!(0, msg.consistency_level);
        assert_eq!(1_650_000_000, msg.timestamp);
    }

    #[test]
    fn block_shape() {
        let resp: JsonRpcResponse<Block> = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": "dontcare",
            "result": {
                "author": "node0",
                "header": {
                    "height": 1234,
                    "timestamp": 1_650_000_123_456_789_000u64,
                    "hash": "abc",
                },
                "chunks": [
                    { "chunk_hash": "c1", "height_created": 1234 },
                    { "chunk_hash": "c2", "height_created": 1233 },
                ]
            }
        }))
        .unwrap();

        let block = resp.result.unwrap();
        assert_eq!(1234, block.header.height);
        assert_eq!(1_650_000_123, block_time(&block.header));
        assert_eq!(2, block.chunks.len());
    }

    #[test]
    fn rpc_errors() {
        let resp: JsonRpcResponse<Block> = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": "dontcare",
            "error": {
                "name": "HANDLER_ERROR",
                "cause": { "name": "UNKNOWN_BLOCK", "info": {} },
                "code": -32000,
                "message": "Server error",
                "data": "DB Not Found Error: BLOCK HEIGHT: 12",
            }
        }))
        .unwrap();

        let err = resp.error.unwrap();
        assert!(err.is_unknown_block());
        let err = RpcError::from(err);
        assert_eq!(
            "rpc error -32000: Server error: DB Not Found Error: BLOCK HEIGHT: 12",
            err.to_string()
        );
        assert!(!JsonRpcError::default().is_unknown_block());
    }

    #[tokio::test]
    async fn reobservation_unsupported() {
        let mut source = NearSource::new("http://localhost:3030".into(), CONTRACT.into());
        assert!(matches!(
            source.reobserve(&[1; 32]).await,
            Err(ReobservationError::Unsupported(Chain::Near))
        ));
    }
}

//! [`ChainSource`] over an Ethereum JSON-RPC node.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use chainsync_core::{
    ChainSource, DecodeError, DecodedTransaction, Log, SourceBlock, SourcePool, SourceReceipt,
    SyncConfig, SyncError,
};

use crate::decode::decode_signed;
use crate::rpc::{HttpClientConfig, HttpRpcClient, RpcTransport};

/// Chain source backed by `eth_*` JSON-RPC methods.
#[derive(Clone)]
pub struct EvmChainSource {
    transport: Arc<dyn RpcTransport>,
}

impl EvmChainSource {
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self { transport }
    }

    /// Source over a new HTTP client for `config.rpc_url`.
    pub fn connect(config: &SyncConfig) -> Result<Self, SyncError> {
        let client = HttpRpcClient::new(&config.rpc_url, HttpClientConfig::from(&config.rpc))?;
        Ok(Self::new(Arc::new(client)))
    }

    /// Pool of `source_pool_size` handles sharing one HTTP client, so the
    /// rate limit and circuit breaker apply to the process as a whole.
    pub fn pool(config: &SyncConfig) -> Result<SourcePool, SyncError> {
        let source = Self::connect(config)?;
        let handles: Vec<Arc<dyn ChainSource>> = (0..config.source_pool_size.max(1))
            .map(|_| Arc::new(source.clone()) as Arc<dyn ChainSource>)
            .collect();
        SourcePool::new(handles, config.source_pool_size)
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, SyncError> {
        self.transport.call(method, params).await.map_err(|e| {
            SyncError::TransientSource(format!("{method}: {e}"))
        })
    }
}

impl std::fmt::Debug for EvmChainSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmChainSource")
            .field("url", &self.url())
            .finish()
    }
}

#[async_trait]
impl ChainSource for EvmChainSource {
    async fn head_height(&self) -> Result<u64, SyncError> {
        let v = self.call("eth_blockNumber", vec![]).await?;
        parse_quantity(&v, "eth_blockNumber")
    }

    async fn block_at(&self, height: u64) -> Result<Option<SourceBlock>, SyncError> {
        let v = self
            .call("eth_getBlockByNumber", vec![json!(format!("0x{height:x}")), json!(false)])
            .await?;
        if v.is_null() {
            return Ok(None);
        }
        block_from_json(&v).map(Some)
    }

    async fn raw_transaction(&self, tx_hash: &str) -> Result<Vec<u8>, SyncError> {
        let v = self
            .call("eth_getRawTransactionByHash", vec![json!(tx_hash)])
            .await?;
        let hex_str = v.as_str().ok_or_else(|| {
            SyncError::TransientSource(format!("raw transaction {tx_hash} not available"))
        })?;
        parse_bytes(hex_str)
            .map_err(|e| SyncError::TransientSource(format!("raw transaction {tx_hash}: {e}")))
    }

    async fn receipt_for(&self, tx_hash: &str) -> Result<Option<SourceReceipt>, SyncError> {
        let v = self
            .call("eth_getTransactionReceipt", vec![json!(tx_hash)])
            .await?;
        if v.is_null() {
            return Ok(None);
        }
        receipt_from_json(&v).map(Some)
    }

    async fn chain_id(&self) -> Result<u64, SyncError> {
        let v = self.call("eth_chainId", vec![]).await?;
        parse_quantity(&v, "eth_chainId")
    }

    fn decode_sender(&self, raw_tx: &[u8], chain_id: u64) -> Result<DecodedTransaction, DecodeError> {
        decode_signed(raw_tx, chain_id)
    }
}

// ─── JSON helpers ────────────────────────────────────────────────────────────

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

fn parse_quantity(v: &Value, what: &str) -> Result<u64, SyncError> {
    v.as_str()
        .and_then(parse_hex_u64)
        .ok_or_else(|| SyncError::TransientSource(format!("{what}: invalid quantity {v}")))
}

fn parse_bytes(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s))
}

fn field_str<'a>(v: &'a Value, field: &str) -> Result<&'a str, SyncError> {
    v[field]
        .as_str()
        .ok_or_else(|| SyncError::TransientSource(format!("response is missing `{field}`")))
}

/// Convert an `eth_getBlockByNumber(_, false)` result.
pub fn block_from_json(v: &Value) -> Result<SourceBlock, SyncError> {
    let height = parse_quantity(&v["number"], "block number")?;
    let timestamp = parse_quantity(&v["timestamp"], "block timestamp")?;
    let tx_hashes = match v["transactions"].as_array() {
        Some(txs) => txs
            .iter()
            .map(|t| {
                t.as_str().map(str::to_lowercase).ok_or_else(|| {
                    SyncError::TransientSource(format!(
                        "block {height}: transactions must be hashes"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };
    Ok(SourceBlock {
        height,
        hash: field_str(v, "hash")?.to_lowercase(),
        parent_hash: field_str(v, "parentHash")?.to_lowercase(),
        timestamp,
        tx_hashes,
    })
}

/// Convert an `eth_getTransactionReceipt` result, keeping only the logs.
pub fn receipt_from_json(v: &Value) -> Result<SourceReceipt, SyncError> {
    let logs = v["logs"]
        .as_array()
        .map(|logs| {
            logs.iter()
                .map(|log| -> Result<Log, SyncError> {
                    Ok(Log {
                        index: parse_quantity(&log["logIndex"], "log index")?,
                        data: field_str(log, "data")?.to_lowercase(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();
    Ok(SourceReceipt { logs })
}

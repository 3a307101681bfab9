//! Scripted in-process chain used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{DecodeError, SyncError};
use crate::source::ChainSource;
use crate::types::{DecodedTransaction, Log, SourceBlock, SourceReceipt};

/// Deterministic fake chain. Block `h` has hash `0xb{h}` and
/// `txs_per_block` transactions `0xt{h}_{i}`; raw payloads are `"{h}:{i}"`.
pub(crate) struct ScriptedSource {
    chain_id: u64,
    head: AtomicU64,
    pub(crate) txs_per_block: usize,
    block_failures: Mutex<HashMap<u64, u32>>,
    head_failures: AtomicUsize,
    hash_overrides: Mutex<HashMap<u64, String>>,
    undecodable: Mutex<HashSet<String>>,
    missing_receipts: Mutex<HashSet<String>>,
    requested: Mutex<Vec<(u64, u64)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    latency: Duration,
}

impl ScriptedSource {
    pub(crate) fn new(chain_id: u64, head: u64) -> Self {
        Self {
            chain_id,
            head: AtomicU64::new(head),
            txs_per_block: 2,
            block_failures: Mutex::new(HashMap::new()),
            head_failures: AtomicUsize::new(0),
            hash_overrides: Mutex::new(HashMap::new()),
            undecodable: Mutex::new(HashSet::new()),
            missing_receipts: Mutex::new(HashSet::new()),
            requested: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            latency: Duration::from_millis(2),
        }
    }

    pub(crate) fn with_txs_per_block(mut self, n: usize) -> Self {
        self.txs_per_block = n;
        self
    }

    /// Time each `block_at` call takes.
    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// `block_at(height)` fails the next `times` calls.
    pub(crate) fn fail_block(&self, height: u64, times: u32) {
        self.block_failures.lock().unwrap().insert(height, times);
    }

    pub(crate) fn fail_head(&self, times: usize) {
        self.head_failures.store(times, Ordering::SeqCst);
    }

    /// Report a different hash for `height`, as after a reorg.
    pub(crate) fn override_hash(&self, height: u64, hash: &str) {
        self.hash_overrides.lock().unwrap().insert(height, hash.to_string());
    }

    pub(crate) fn make_undecodable(&self, tx_hash: &str) {
        self.undecodable.lock().unwrap().insert(tx_hash.to_string());
    }

    pub(crate) fn drop_receipt(&self, tx_hash: &str) {
        self.missing_receipts.lock().unwrap().insert(tx_hash.to_string());
    }

    /// `(height, head at request time)` for every `block_at` call.
    pub(crate) fn requested(&self) -> Vec<(u64, u64)> {
        self.requested.lock().unwrap().clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn tx_hash(height: u64, i: usize) -> String {
        format!("0xt{height}_{i}")
    }

    pub(crate) fn block_hash(height: u64) -> String {
        format!("0xb{height}")
    }

    fn parse_tx_hash(tx_hash: &str) -> Option<(u64, usize)> {
        let rest = tx_hash.strip_prefix("0xt")?;
        let (h, i) = rest.split_once('_')?;
        Some((h.parse().ok()?, i.parse().ok()?))
    }
}

#[async_trait]
impl ChainSource for ScriptedSource {
    async fn head_height(&self) -> Result<u64, SyncError> {
        let remaining = self.head_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.head_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::TransientSource("head: connection reset".into()));
        }
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block_at(&self, height: u64) -> Result<Option<SourceBlock>, SyncError> {
        let head = self.head.load(Ordering::SeqCst);
        self.requested.lock().unwrap().push((height, head));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        {
            let mut failures = self.block_failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&height) {
                if *left > 0 {
                    *left -= 1;
                    return Err(SyncError::TransientSource(format!("block {height}: timeout")));
                }
            }
        }

        if height > head {
            return Ok(None);
        }
        let hash = self
            .hash_overrides
            .lock()
            .unwrap()
            .get(&height)
            .cloned()
            .unwrap_or_else(|| Self::block_hash(height));
        Ok(Some(SourceBlock {
            height,
            hash,
            parent_hash: Self::block_hash(height.saturating_sub(1)),
            timestamp: 1_700_000_000 + height * 12,
            tx_hashes: (0..self.txs_per_block).map(|i| Self::tx_hash(height, i)).collect(),
        }))
    }

    async fn raw_transaction(&self, tx_hash: &str) -> Result<Vec<u8>, SyncError> {
        let (h, i) = Self::parse_tx_hash(tx_hash)
            .ok_or_else(|| SyncError::TransientSource(format!("unknown tx {tx_hash}")))?;
        if self.undecodable.lock().unwrap().contains(tx_hash) {
            return Ok(vec![0xff]);
        }
        Ok(format!("{h}:{i}").into_bytes())
    }

    async fn receipt_for(&self, tx_hash: &str) -> Result<Option<SourceReceipt>, SyncError> {
        if self.missing_receipts.lock().unwrap().contains(tx_hash) {
            return Ok(None);
        }
        // Logs deliberately out of order; the fetcher sorts them.
        Ok(Some(SourceReceipt {
            logs: vec![
                Log { index: 1, data: "0x02".into() },
                Log { index: 0, data: "0x01".into() },
            ],
        }))
    }

    async fn chain_id(&self) -> Result<u64, SyncError> {
        Ok(self.chain_id)
    }

    fn decode_sender(&self, raw_tx: &[u8], chain_id: u64) -> Result<DecodedTransaction, DecodeError> {
        if chain_id != self.chain_id {
            return Err(DecodeError::ChainIdMismatch {
                expected: self.chain_id,
                found: chain_id,
            });
        }
        let text = std::str::from_utf8(raw_tx).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let (h, i) = text
            .split_once(':')
            .ok_or_else(|| DecodeError::Malformed(text.to_string()))?;
        Ok(DecodedTransaction {
            sender: format!("0xs{h}"),
            recipient: (i != "0").then(|| format!("0xr{h}_{i}")),
            nonce: i.parse().unwrap_or(0),
            value: format!("{h}000"),
            input: "0x".into(),
        })
    }
}

/// Two-tier write-back cache fronting the store's UTXO keyspace.
///
/// `cache` holds additions made this session, keyed by the full
/// `(txid, vout)` so a same-block spend of a same-block output never touches
/// the store. `db_cache` remembers compressed-key lookups already fetched
/// from the store (including negative results) for the lifetime of one
/// flush window, so repeat spends into the same bucket don't re-read.
///
/// Store-level UTXO keys are compressed to `txid[0..4] || vout_be16`: a
/// single 4-byte prefix scan then retrieves every output of one transaction.
/// Collisions (two txids sharing a 4-byte prefix and vout) are resolved by
/// reading the stored entry's `tx_num` back out through FSCache and
/// comparing its full txid against the spend request.
use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::constants::{ADDRESS_ID_LEN, DB_CACHE_ENTRY_BYTES, NO_CACHE_ENTRY, UNDO_ENTRY_LEN, UTXO_CACHE_ENTRY_BYTES};
use crate::decode::Hash32;
use crate::error::StoreError;
use crate::fs_cache::FsCache;
use crate::kv::{Batch, Store};

pub const UTXO_KEY_PREFIX: u8 = b'u';
const COMPRESSED_KEY_LEN: usize = 1 + 4 + 2;

/// A single UTXO's recorded value: who owns it, which transaction created
/// it, and how many satoshis it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtxoValue {
    pub address: [u8; ADDRESS_ID_LEN],
    pub tx_num: u32,
    pub value: u64,
}

impl UtxoValue {
    pub(crate) fn encode(&self) -> [u8; UNDO_ENTRY_LEN] {
        let mut out = [0u8; UNDO_ENTRY_LEN];
        out[..ADDRESS_ID_LEN].copy_from_slice(&self.address);
        LittleEndian::write_u32(&mut out[ADDRESS_ID_LEN..ADDRESS_ID_LEN + 4], self.tx_num);
        LittleEndian::write_u64(&mut out[ADDRESS_ID_LEN + 4..], self.value);
        out
    }

    pub(crate) fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != UNDO_ENTRY_LEN {
            return None;
        }
        let mut address = [0u8; ADDRESS_ID_LEN];
        address.copy_from_slice(&bytes[..ADDRESS_ID_LEN]);
        let tx_num = LittleEndian::read_u32(&bytes[ADDRESS_ID_LEN..ADDRESS_ID_LEN + 4]);
        let value = LittleEndian::read_u64(&bytes[ADDRESS_ID_LEN + 4..]);
        Some(Self { address, tx_num, value })
    }
}

fn compressed_key(txid: &Hash32, vout: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(COMPRESSED_KEY_LEN);
    key.push(UTXO_KEY_PREFIX);
    key.extend_from_slice(&txid[..4]);
    key.extend_from_slice(&(vout as u16).to_be_bytes());
    key
}

/// Extracts the `vout` suffix from a compressed UTXO key, for callers
/// scanning the whole `u`-prefixed keyspace directly.
pub fn vout_from_compressed_key(key: &[u8]) -> Option<u32> {
    if key.len() != COMPRESSED_KEY_LEN {
        return None;
    }
    Some(BigEndian::read_u16(&key[5..7]) as u32)
}

/// Decodes the bucket value stored at a compressed UTXO key.
pub fn decode_utxo_bucket(bytes: &[u8]) -> Vec<UtxoValue> {
    decode_bucket(bytes)
}

struct DbCacheEntry {
    /// All undecoded entries currently stored at this compressed key,
    /// post any same-flush-window removals.
    entries: Vec<UtxoValue>,
    dirty: bool,
}

/// Write-back UTXO cache owned exclusively by the Processor.
pub struct UtxoCache {
    /// Additions made this session, not yet flushed to the store.
    cache: HashMap<(Hash32, u32), UtxoValue>,
    /// Per-compressed-key view of what the store holds, refreshed from disk
    /// on first touch within this flush window.
    db_cache: HashMap<Vec<u8>, DbCacheEntry>,
}

impl Default for UtxoCache {
    fn default() -> Self {
        Self::new()
    }
}

impl UtxoCache {
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
            db_cache: HashMap::new(),
        }
    }

    pub fn put(&mut self, txid: Hash32, vout: u32, value: UtxoValue) {
        self.cache.insert((txid, vout), value);
    }

    /// Pending (not yet flushed) additions owned by `address`. Used by the
    /// query surface to see same-session writes that haven't hit the store.
    pub fn pending_additions_for(&self, address: [u8; ADDRESS_ID_LEN]) -> Vec<(Hash32, u32, UtxoValue)> {
        self.cache
            .iter()
            .filter(|(_, v)| v.address == address)
            .map(|(&(txid, vout), &value)| (txid, vout, value))
            .collect()
    }

    /// Spend the UTXO at `(prev_txid, prev_vout)`. Returns its recorded
    /// value, or `NO_CACHE_ENTRY`'s all-zero sentinel encoded in an
    /// `UtxoValue` with address `NO_CACHE_ENTRY` if the output was never
    /// indexed (ungrokkable script).
    pub fn spend(
        &mut self,
        store: &impl Store,
        fs_cache: &mut FsCache,
        prev_txid: &Hash32,
        prev_vout: u32,
    ) -> Result<UtxoValue, StoreError> {
        if let Some(value) = self.cache.remove(&(*prev_txid, prev_vout)) {
            return Ok(value);
        }

        let key = compressed_key(prev_txid, prev_vout);
        if !self.db_cache.contains_key(&key) {
            let entries = store
                .get(&key)?
                .map(|bytes| decode_bucket(&bytes))
                .unwrap_or_default();
            self.db_cache.insert(key.clone(), DbCacheEntry { entries, dirty: false });
        }

        let bucket = self.db_cache.get_mut(&key).expect("just inserted");
        let mut matched_index = None;
        for (i, entry) in bucket.entries.iter().enumerate() {
            let (stored_txid, _height) = fs_cache.get_tx_hash(entry.tx_num)?;
            if &stored_txid == prev_txid {
                matched_index = Some(i);
                break;
            }
        }

        match matched_index {
            Some(i) => {
                let value = bucket.entries.remove(i);
                bucket.dirty = true;
                Ok(value)
            }
            None => Ok(UtxoValue {
                address: NO_CACHE_ENTRY,
                tx_num: 0,
                value: 0,
            }),
        }
    }

    /// Write pending adds and deletes to `batch`, then clear both maps.
    pub fn flush(&mut self, batch: &mut Batch) {
        // Group pending additions by compressed key so multiple new outputs
        // sharing a bucket merge into one store write.
        let mut additions: HashMap<Vec<u8>, Vec<UtxoValue>> = HashMap::new();
        for ((txid, vout), value) in self.cache.drain() {
            let key = compressed_key(&txid, vout);
            additions.entry(key).or_default().push(value);
        }

        for (key, mut new_entries) in additions {
            let mut entries = match self.db_cache.remove(&key) {
                Some(existing) => existing.entries,
                None => Vec::new(),
            };
            entries.append(&mut new_entries);
            write_bucket(batch, &key, &entries);
        }

        for (key, entry) in self.db_cache.drain() {
            if !entry.dirty {
                continue;
            }
            write_bucket(batch, &key, &entry.entries);
        }
    }

    /// Approximate in-memory byte footprint, for flush-threshold decisions.
    pub fn approx_size_bytes(&self) -> usize {
        self.cache.len() * UTXO_CACHE_ENTRY_BYTES + self.db_cache.len() * DB_CACHE_ENTRY_BYTES
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty() && self.db_cache.is_empty()
    }
}

fn write_bucket(batch: &mut Batch, key: &[u8], entries: &[UtxoValue]) {
    if entries.is_empty() {
        batch.delete(key.to_vec());
        return;
    }
    let mut bytes = Vec::with_capacity(entries.len() * UNDO_ENTRY_LEN);
    for entry in entries {
        bytes.extend_from_slice(&entry.encode());
    }
    batch.put(key.to_vec(), bytes);
}

fn decode_bucket(bytes: &[u8]) -> Vec<UtxoValue> {
    bytes
        .chunks_exact(UNDO_ENTRY_LEN)
        .filter_map(UtxoValue::decode)
        .collect()
}

/// Builds the `U||height_be32` undo key for a given height.
pub fn undo_key(height: i32) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(b'U');
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, height as u32);
    key.extend_from_slice(&buf);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::rocks::RocksStore;
    use tempfile::TempDir;

    fn sample_value(tag: u8, tx_num: u32, sats: u64) -> UtxoValue {
        UtxoValue {
            address: [tag; ADDRESS_ID_LEN],
            tx_num,
            value: sats,
        }
    }

    #[test]
    fn spend_resolves_same_block_addition_without_store_read() {
        let mut utxo_cache = UtxoCache::new();
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let mut fs_cache = FsCache::open(dir.path().join("fs"), 80).unwrap();

        let txid = [7u8; 32];
        utxo_cache.put(txid, 0, sample_value(1, 5, 1000));

        let spent = utxo_cache.spend(&store, &mut fs_cache, &txid, 0).unwrap();
        assert_eq!(spent.value, 1000);
        assert_eq!(spent.tx_num, 5);
    }

    #[test]
    fn spend_unknown_output_returns_no_cache_entry_sentinel() {
        let mut utxo_cache = UtxoCache::new();
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let mut fs_cache = FsCache::open(dir.path().join("fs"), 80).unwrap();

        let txid = [9u8; 32];
        let spent = utxo_cache.spend(&store, &mut fs_cache, &txid, 0).unwrap();
        assert_eq!(spent.address, NO_CACHE_ENTRY);
    }

    #[test]
    fn flush_then_reload_spend_round_trips_through_store() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let mut fs_cache = FsCache::open(dir.path().join("fs"), 80).unwrap();

        let header = crate::decode::BlockHeader {
            version: 1,
            prev_hash: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 0,
            bits: 0,
            nonce: 0,
            raw: vec![0u8; 80],
        };
        let txid = [3u8; 32];
        fs_cache.advance_block(&header, &[txid]).unwrap();
        fs_cache.flush().unwrap();

        let mut utxo_cache = UtxoCache::new();
        utxo_cache.put(txid, 1, sample_value(2, 0, 2500));

        let mut batch = Batch::new();
        utxo_cache.flush(&mut batch);
        store.write(batch).unwrap();
        assert!(utxo_cache.is_empty());

        let mut reloaded = UtxoCache::new();
        let spent = reloaded.spend(&store, &mut fs_cache, &txid, 1).unwrap();
        assert_eq!(spent.value, 2500);
    }
}

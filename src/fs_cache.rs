/// File-system cache: append-only on-disk block headers and tx-hash arrays,
/// plus an in-memory offset index for fast `tx_num -> (tx_hash, height)` and
/// `height -> header` lookups.
///
/// Two data files per coin/network (`headers.dat`, `txhashes.dat`) hold fixed-
/// size header records and length-prefixed tx-hash arrays respectively. A
/// third file, `heights.idx`, records one `(header_offset, txhash_offset,
/// cumulative_tx_count)` triple per height; it is read fully into memory on
/// open and appended to (and truncated from, on backup) in lockstep with the
/// data files.
///
/// Write-ahead discipline: `advance_block`/`backup_block` only touch the
/// in-memory index and the in-process file buffers. `flush` is what fsyncs
/// and durably commits the offset index — a crash between `advance_block`
/// and the next `flush` leaves the data files over-long, which `open` trims
/// on the next start. A DB that referenced FS data not yet durable would be
/// corruption; an over-long file is harmless.
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::decode::{double_sha256, BlockHeader, Hash32};
use crate::error::StoreError;

#[derive(Debug, Clone, Copy)]
struct HeightRecord {
    header_offset: u64,
    txhash_offset: u64,
    /// Total tx_count after this height's block, i.e. tx_num of the next
    /// block's first (coinbase) transaction.
    cumulative_tx_count: u32,
}

pub struct FsCache {
    header_size: usize,
    headers_path: PathBuf,
    headers_file: File,
    txhashes_file: File,
    /// In-memory, durable-and-pending offset index. `index[h]` describes
    /// the record for height `h`. Index 0 is genesis.
    index: Vec<HeightRecord>,
}

impl FsCache {
    /// Open (creating if absent) the cache files under `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>, header_size: usize) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&data_dir).map_err(to_store_err)?;
        let headers_path = data_dir.as_ref().join("headers.dat");
        let txhashes_path = data_dir.as_ref().join("txhashes.dat");
        let heights_path = data_dir.as_ref().join("heights.idx");

        let headers_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&headers_path)
            .map_err(to_store_err)?;
        let txhashes_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&txhashes_path)
            .map_err(to_store_err)?;

        let index = read_index_file(&heights_path)?;

        let mut cache = Self {
            header_size,
            headers_path,
            headers_file,
            txhashes_file,
            index,
        };
        cache.trim_to_durable()?;
        Ok(cache)
    }

    /// Current durable+pending height count (i.e. `height + 1`), or 0 if empty.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Truncate data files back to exactly what `self.index` (pending included)
    /// describes. Called on open to discard an over-long tail left by a crash
    /// between a prior `advance_block` and its `flush`.
    fn trim_to_durable(&mut self) -> Result<(), StoreError> {
        match self.index.last().copied() {
            Some(last) => {
                let header_len = last.header_offset + self.header_size as u64;
                let (record_len, _) = self.read_txhash_record_len(last.txhash_offset)?;
                self.headers_file.set_len(header_len).map_err(to_store_err)?;
                self.txhashes_file
                    .set_len(last.txhash_offset + record_len)
                    .map_err(to_store_err)?;
            }
            None => {
                self.headers_file.set_len(0).map_err(to_store_err)?;
                self.txhashes_file.set_len(0).map_err(to_store_err)?;
            }
        }
        Ok(())
    }

    /// Append a decoded block's header and tx hashes. Updates only the
    /// in-memory index and file contents; does not fsync.
    pub fn advance_block(
        &mut self,
        header: &BlockHeader,
        tx_hashes: &[Hash32],
    ) -> Result<(), StoreError> {
        if header.raw.len() != self.header_size {
            return Err(StoreError(format!(
                "header length {} does not match configured header_size {}",
                header.raw.len(),
                self.header_size
            )));
        }

        let header_offset = self.headers_file.seek(SeekFrom::End(0)).map_err(to_store_err)?;
        self.headers_file.write_all(&header.raw).map_err(to_store_err)?;

        let txhash_offset = self.txhashes_file.seek(SeekFrom::End(0)).map_err(to_store_err)?;
        self.txhashes_file
            .write_u32::<BigEndian>(tx_hashes.len() as u32)
            .map_err(to_store_err)?;
        for hash in tx_hashes {
            self.txhashes_file.write_all(hash).map_err(to_store_err)?;
        }

        let cumulative_tx_count = self.index.last().map(|r| r.cumulative_tx_count).unwrap_or(0)
            + tx_hashes.len() as u32;

        self.index.push(HeightRecord {
            header_offset,
            txhash_offset,
            cumulative_tx_count,
        });
        Ok(())
    }

    /// Logically shorten the cache by one block. The underlying files are
    /// not truncated until the next `flush`.
    pub fn backup_block(&mut self) -> Result<(), StoreError> {
        if self.index.pop().is_none() {
            return Err(StoreError("backup_block called on empty FSCache".into()));
        }
        Ok(())
    }

    /// fsync content files, then persist the offset index, in that order, so
    /// the index never references data that isn't durable yet. Truncates the
    /// files to drop anything rolled back by `backup_block`.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        let (header_len, txhash_len) = match self.index.last() {
            Some(last) => {
                let next_txhash_len = self
                    .read_txhash_record_len(last.txhash_offset)
                    .map(|(record_len, _)| last.txhash_offset + record_len)?;
                (last.header_offset + self.header_size as u64, next_txhash_len)
            }
            None => (0, 0),
        };

        self.headers_file.set_len(header_len).map_err(to_store_err)?;
        self.txhashes_file.set_len(txhash_len).map_err(to_store_err)?;
        self.headers_file.sync_all().map_err(to_store_err)?;
        self.txhashes_file.sync_all().map_err(to_store_err)?;

        write_index_file(&self.heights_idx_path(), &self.index)?;
        Ok(())
    }

    fn heights_idx_path(&self) -> PathBuf {
        self.headers_path
            .parent()
            .expect("headers.dat always has a parent directory")
            .join("heights.idx")
    }

    /// Returns `(total_record_len, tx_count)` for the length-prefixed tx-hash
    /// record starting at `offset`.
    fn read_txhash_record_len(&mut self, offset: u64) -> Result<(u64, u32), StoreError> {
        self.txhashes_file.seek(SeekFrom::Start(offset)).map_err(to_store_err)?;
        let count = self.txhashes_file.read_u32::<BigEndian>().map_err(to_store_err)?;
        Ok((4 + count as u64 * 32, count))
    }

    fn header_at(&mut self, height: i32) -> Result<Vec<u8>, StoreError> {
        let record = self.record_at(height)?;
        let mut buf = vec![0u8; self.header_size];
        self.headers_file
            .seek(SeekFrom::Start(record.header_offset))
            .map_err(to_store_err)?;
        self.headers_file.read_exact(&mut buf).map_err(to_store_err)?;
        Ok(buf)
    }

    fn record_at(&self, height: i32) -> Result<HeightRecord, StoreError> {
        if height < 0 || height as usize >= self.index.len() {
            return Err(StoreError(format!("height {} out of range", height)));
        }
        Ok(self.index[height as usize])
    }

    /// Returns the header at `height`, decorated with its hash and height.
    pub fn encode_header(&mut self, height: i32) -> Result<(BlockHeader, Hash32), StoreError> {
        let raw = self.header_at(height)?;
        let header = parse_header(&raw)?;
        let hash = double_sha256(&raw);
        Ok((header, hash))
    }

    /// Binary search over the cumulative tx-count index to find the height
    /// owning `tx_num`, then a direct file read for the exact tx hash.
    /// Returns `(tx_hash, height)`.
    pub fn get_tx_hash(&mut self, tx_num: u32) -> Result<(Hash32, i32), StoreError> {
        let (hash, height, _tx_pos) = self.get_tx_hash_with_pos(tx_num)?;
        Ok((hash, height))
    }

    /// As [`Self::get_tx_hash`], but also returns the transaction's position
    /// within its block (its index among that block's transactions).
    pub fn get_tx_hash_with_pos(&mut self, tx_num: u32) -> Result<(Hash32, i32, u32), StoreError> {
        // First height whose cumulative_tx_count exceeds tx_num owns it.
        let height = self.index.partition_point(|record| record.cumulative_tx_count <= tx_num);
        if height >= self.index.len() {
            return Err(StoreError(format!("tx_num {} not resolvable", tx_num)));
        }

        let record = self.index[height];
        let prev_cumulative = if height == 0 {
            0
        } else {
            self.index[height - 1].cumulative_tx_count
        };
        let local_index = (tx_num - prev_cumulative) as u64;

        self.txhashes_file
            .seek(SeekFrom::Start(record.txhash_offset + 4 + local_index * 32))
            .map_err(to_store_err)?;
        let mut hash = [0u8; 32];
        self.txhashes_file.read_exact(&mut hash).map_err(to_store_err)?;
        Ok((hash, height as i32, local_index as u32))
    }

    /// Hashes of `count` headers starting at `start_height`.
    pub fn block_hashes(&mut self, start_height: i32, count: usize) -> Result<Vec<Hash32>, StoreError> {
        let mut hashes = Vec::with_capacity(count);
        for h in start_height..start_height + count as i32 {
            if h < 0 || h as usize >= self.index.len() {
                break;
            }
            let raw = self.header_at(h)?;
            hashes.push(double_sha256(&raw));
        }
        Ok(hashes)
    }
}

fn parse_header(raw: &[u8]) -> Result<BlockHeader, StoreError> {
    use std::io::Cursor;
    let mut cur = Cursor::new(raw);
    let version = cur.read_u32::<LittleEndian>().map_err(to_store_err)?;
    let mut prev_hash = [0u8; 32];
    cur.read_exact(&mut prev_hash).map_err(to_store_err)?;
    let mut merkle_root = [0u8; 32];
    cur.read_exact(&mut merkle_root).map_err(to_store_err)?;
    let time = cur.read_u32::<LittleEndian>().map_err(to_store_err)?;
    let bits = cur.read_u32::<LittleEndian>().map_err(to_store_err)?;
    let nonce = cur.read_u32::<LittleEndian>().map_err(to_store_err)?;
    Ok(BlockHeader {
        version,
        prev_hash,
        merkle_root,
        time,
        bits,
        nonce,
        raw: raw.to_vec(),
    })
}

fn read_index_file(path: &Path) -> Result<Vec<HeightRecord>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut file = File::open(path).map_err(to_store_err)?;
    let mut records = Vec::new();
    loop {
        let header_offset = match file.read_u64::<BigEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(to_store_err(e)),
        };
        let txhash_offset = file.read_u64::<BigEndian>().map_err(to_store_err)?;
        let cumulative_tx_count = file.read_u32::<BigEndian>().map_err(to_store_err)?;
        records.push(HeightRecord {
            header_offset,
            txhash_offset,
            cumulative_tx_count,
        });
    }
    Ok(records)
}

fn write_index_file(path: &Path, index: &[HeightRecord]) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("idx.tmp");
    {
        let mut file = File::create(&tmp_path).map_err(to_store_err)?;
        for record in index {
            file.write_u64::<BigEndian>(record.header_offset).map_err(to_store_err)?;
            file.write_u64::<BigEndian>(record.txhash_offset).map_err(to_store_err)?;
            file.write_u32::<BigEndian>(record.cumulative_tx_count).map_err(to_store_err)?;
        }
        file.sync_all().map_err(to_store_err)?;
    }
    std::fs::rename(&tmp_path, path).map_err(to_store_err)?;
    Ok(())
}

fn to_store_err(e: std::io::Error) -> StoreError {
    StoreError(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_header(nonce: u32) -> BlockHeader {
        let mut raw = vec![0u8; 80];
        raw[76..80].copy_from_slice(&nonce.to_le_bytes());
        BlockHeader {
            version: 1,
            prev_hash: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 0,
            bits: 0,
            nonce,
            raw,
        }
    }

    #[test]
    fn advance_and_flush_roundtrips_tx_hash_lookup() {
        let dir = TempDir::new().unwrap();
        let mut cache = FsCache::open(dir.path(), 80).unwrap();

        let h0 = sample_header(0);
        let tx_hashes_0 = vec![[1u8; 32], [2u8; 32]];
        cache.advance_block(&h0, &tx_hashes_0).unwrap();

        let h1 = sample_header(1);
        let tx_hashes_1 = vec![[3u8; 32]];
        cache.advance_block(&h1, &tx_hashes_1).unwrap();

        cache.flush().unwrap();

        let (hash, height) = cache.get_tx_hash(0).unwrap();
        assert_eq!(hash, [1u8; 32]);
        assert_eq!(height, 0);

        let (hash, height) = cache.get_tx_hash(2).unwrap();
        assert_eq!(hash, [3u8; 32]);
        assert_eq!(height, 1);
    }

    #[test]
    fn backup_block_then_flush_drops_tail() {
        let dir = TempDir::new().unwrap();
        let mut cache = FsCache::open(dir.path(), 80).unwrap();
        cache.advance_block(&sample_header(0), &[[1u8; 32]]).unwrap();
        cache.advance_block(&sample_header(1), &[[2u8; 32]]).unwrap();
        cache.flush().unwrap();

        cache.backup_block().unwrap();
        cache.flush().unwrap();

        assert_eq!(cache.len(), 1);
        assert!(cache.get_tx_hash(1).is_err());
    }

    #[test]
    fn reopen_after_flush_recovers_index() {
        let dir = TempDir::new().unwrap();
        {
            let mut cache = FsCache::open(dir.path(), 80).unwrap();
            cache.advance_block(&sample_header(0), &[[9u8; 32]]).unwrap();
            cache.flush().unwrap();
        }
        let mut reopened = FsCache::open(dir.path(), 80).unwrap();
        assert_eq!(reopened.len(), 1);
        let (hash, _) = reopened.get_tx_hash(0).unwrap();
        assert_eq!(hash, [9u8; 32]);
    }

    #[test]
    fn block_hashes_returns_requested_range() {
        let dir = TempDir::new().unwrap();
        let mut cache = FsCache::open(dir.path(), 80).unwrap();
        cache.advance_block(&sample_header(0), &[[1u8; 32]]).unwrap();
        cache.advance_block(&sample_header(1), &[[2u8; 32]]).unwrap();
        cache.advance_block(&sample_header(2), &[[3u8; 32]]).unwrap();
        cache.flush().unwrap();

        let hashes = cache.block_hashes(1, 2).unwrap();
        assert_eq!(hashes.len(), 2);
    }
}

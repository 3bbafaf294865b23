/// Raw block decoding: turns node-supplied block bytes into a header, the
/// array of transaction hashes, and the parsed transactions.
///
/// Deliberately minimal — no witness data, no coin-specific transaction
/// types — since coin-specific parsing is explicitly out of scope. A real
/// coin integration swaps in a richer `BlockDecoder`.
use byteorder::{LittleEndian, ReadBytesExt};
use sha2::{Digest, Sha256};
use std::io::{self, Cursor, Read};

use crate::error::DecodeError;

pub type Hash32 = [u8; 32];

#[derive(Debug, Clone)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash32,
    pub merkle_root: Hash32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    /// Raw header bytes, exactly `header_size` long, as stored in FSCache.
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TxOutput {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TxInput {
    pub prev_txid: Hash32,
    pub prev_vout: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prev_txid == [0u8; 32] && self.inputs[0].prev_vout == 0xffff_ffff
    }
}

/// Decodes raw block bytes into a header plus the transactions it contains.
pub trait BlockDecoder: Send + Sync {
    fn decode_block(&self, bytes: &[u8]) -> Result<(BlockHeader, Vec<Hash32>, Vec<Transaction>), DecodeError>;

    /// Computes `(prev_hash, header_hash)` for a header — used by the
    /// processor to detect whether a block extends the current tip.
    fn header_hashes(&self, header: &BlockHeader) -> (Hash32, Hash32) {
        (header.prev_hash, double_sha256(&header.raw))
    }
}

pub fn double_sha256(data: &[u8]) -> Hash32 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(&first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Decoder for a legacy (pre-segwit) Bitcoin/PIVX-style block layout:
/// fixed 80-byte header, varint tx count, then each transaction's
/// version/inputs/outputs/locktime.
pub struct LegacyBlockDecoder {
    pub header_size: usize,
}

impl LegacyBlockDecoder {
    pub fn new(header_size: usize) -> Self {
        Self { header_size }
    }
}

fn read_hash32(cur: &mut Cursor<&[u8]>) -> io::Result<Hash32> {
    let mut buf = [0u8; 32];
    cur.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_varint(cur: &mut Cursor<&[u8]>) -> io::Result<u64> {
    let first = cur.read_u8()?;
    match first {
        0xfd => Ok(cur.read_u16::<LittleEndian>()? as u64),
        0xfe => Ok(cur.read_u32::<LittleEndian>()? as u64),
        0xff => cur.read_u64::<LittleEndian>(),
        n => Ok(n as u64),
    }
}

fn read_var_bytes(cur: &mut Cursor<&[u8]>) -> io::Result<Vec<u8>> {
    let len = read_varint(cur)? as usize;
    let mut buf = vec![0u8; len];
    cur.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_transaction(cur: &mut Cursor<&[u8]>) -> io::Result<Transaction> {
    let version = cur.read_i32::<LittleEndian>()?;
    let in_count = read_varint(cur)?;
    let mut inputs = Vec::with_capacity(in_count as usize);
    for _ in 0..in_count {
        let prev_txid = read_hash32(cur)?;
        let prev_vout = cur.read_u32::<LittleEndian>()?;
        let script_sig = read_var_bytes(cur)?;
        let sequence = cur.read_u32::<LittleEndian>()?;
        inputs.push(TxInput { prev_txid, prev_vout, script_sig, sequence });
    }

    let out_count = read_varint(cur)?;
    let mut outputs = Vec::with_capacity(out_count as usize);
    for _ in 0..out_count {
        let value = cur.read_u64::<LittleEndian>()?;
        let script_pubkey = read_var_bytes(cur)?;
        outputs.push(TxOutput { value, script_pubkey });
    }

    let lock_time = cur.read_u32::<LittleEndian>()?;
    Ok(Transaction { version, inputs, outputs, lock_time })
}

impl BlockDecoder for LegacyBlockDecoder {
    fn decode_block(&self, bytes: &[u8]) -> Result<(BlockHeader, Vec<Hash32>, Vec<Transaction>), DecodeError> {
        if bytes.len() < self.header_size {
            return Err(DecodeError(format!(
                "block shorter than header size ({} < {})",
                bytes.len(),
                self.header_size
            )));
        }

        let raw_header = bytes[..self.header_size].to_vec();
        let mut hcur = Cursor::new(&raw_header[..]);
        let version = hcur.read_u32::<LittleEndian>().map_err(to_decode_err)?;
        let prev_hash = read_hash32(&mut hcur).map_err(to_decode_err)?;
        let merkle_root = read_hash32(&mut hcur).map_err(to_decode_err)?;
        let time = hcur.read_u32::<LittleEndian>().map_err(to_decode_err)?;
        let bits = hcur.read_u32::<LittleEndian>().map_err(to_decode_err)?;
        let nonce = hcur.read_u32::<LittleEndian>().map_err(to_decode_err)?;

        let header = BlockHeader { version, prev_hash, merkle_root, time, bits, nonce, raw: raw_header };

        let mut cur = Cursor::new(&bytes[self.header_size..]);
        let tx_count = read_varint(&mut cur).map_err(to_decode_err)?;

        let mut txs = Vec::with_capacity(tx_count as usize);
        let mut tx_hashes = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            let start = self.header_size + cur.position() as usize;
            let tx = read_transaction(&mut cur).map_err(to_decode_err)?;
            let end = self.header_size + cur.position() as usize;
            tx_hashes.push(double_sha256(&bytes[start..end]));
            txs.push(tx);
        }

        Ok((header, tx_hashes, txs))
    }
}

fn to_decode_err(e: io::Error) -> DecodeError {
    DecodeError(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_varint(n: u64, out: &mut Vec<u8>) {
        out.push(n as u8);
    }

    fn sample_coinbase_block() -> Vec<u8> {
        let mut bytes = vec![0u8; 80]; // header, all zero is fine for this test
        encode_varint(1, &mut bytes); // tx_count = 1

        // one coinbase tx: version(4) + in_count(1) + prev_txid(32 zero) +
        // prev_vout(0xffffffff) + script_sig(var, len 0) + sequence(4) +
        // out_count(1) + value(8) + script_pubkey(var, len 0) + locktime(4)
        bytes.extend_from_slice(&1i32.to_le_bytes());
        encode_varint(1, &mut bytes);
        bytes.extend_from_slice(&[0u8; 32]);
        bytes.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
        encode_varint(0, &mut bytes);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        encode_varint(1, &mut bytes);
        bytes.extend_from_slice(&5_000_000_000u64.to_le_bytes());
        encode_varint(0, &mut bytes);
        bytes.extend_from_slice(&0u32.to_le_bytes());

        bytes
    }

    #[test]
    fn decodes_single_coinbase_block() {
        let decoder = LegacyBlockDecoder::new(80);
        let bytes = sample_coinbase_block();
        let (header, tx_hashes, txs) = decoder.decode_block(&bytes).unwrap();
        assert_eq!(header.raw.len(), 80);
        assert_eq!(tx_hashes.len(), 1);
        assert_eq!(txs.len(), 1);
        assert!(txs[0].is_coinbase());
        assert_eq!(txs[0].outputs[0].value, 5_000_000_000);
    }

    #[test]
    fn rejects_truncated_header() {
        let decoder = LegacyBlockDecoder::new(80);
        let err = decoder.decode_block(&[0u8; 10]).unwrap_err();
        assert!(err.0.contains("shorter than header size"));
    }
}

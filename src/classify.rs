/// Script classification: maps an output script to an opaque, fixed-width
/// `AddressId`, or to `NO_CACHE_ENTRY` for anything the indexer can't grok.
///
/// Recognizes P2PKH, P2SH and bare P2PK templates. This is the narrow,
/// coin-generic default the core calls for; a full coin integration would
/// plug in a richer classifier behind the same function signature.
use bitcoin::blockdata::script::Script;
use bitcoin::util::address::Address;
use bitcoin::Network;
use ripemd160::{Digest as RipemdDigest, Ripemd160};
use sha2::{Digest, Sha256};

use crate::constants::{ADDRESS_ID_LEN, NO_CACHE_ENTRY};

/// Fixed-width opaque identifier for the recipient of a UTXO.
///
/// Layout: 1 tag byte (0 = P2PKH, 1 = P2SH, 2 = P2PK, 3 = other-but-indexable)
/// followed by a 20-byte hash160.
pub type AddressId = [u8; ADDRESS_ID_LEN];

const TAG_P2PKH: u8 = 0;
const TAG_P2SH: u8 = 1;
const TAG_P2PK: u8 = 2;
const TAG_OTHER: u8 = 3;

fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(&sha));
    out
}

fn build_id(tag: u8, hash: [u8; 20]) -> AddressId {
    let mut id = [0u8; ADDRESS_ID_LEN];
    id[0] = tag;
    id[1..].copy_from_slice(&hash);
    id
}

/// Classify a raw output script into an `AddressId`, or `NO_CACHE_ENTRY` if
/// it can't be classified (OP_RETURN, multisig, non-standard, ...).
pub fn classify_output_script(script_bytes: &[u8]) -> AddressId {
    let script = Script::from(script_bytes.to_vec());

    if script.is_p2pkh() {
        let hash = &script_bytes[3..23];
        let mut h = [0u8; 20];
        h.copy_from_slice(hash);
        return build_id(TAG_P2PKH, h);
    }

    if script.is_p2sh() {
        let hash = &script_bytes[2..22];
        let mut h = [0u8; 20];
        h.copy_from_slice(hash);
        return build_id(TAG_P2SH, h);
    }

    if let Some(pubkey) = extract_bare_pubkey(script_bytes) {
        return build_id(TAG_P2PK, hash160(pubkey));
    }

    // Fallback: ask the `bitcoin` crate whether this is a recognized address
    // template the checks above don't bother with (segwit and friends). The
    // AddressId is still derived from the script bytes themselves, not the
    // encoded address string, so it stays a deterministic function of the
    // script rather than of string formatting.
    if Address::from_script(&script, Network::Bitcoin).is_some() {
        return build_id(TAG_OTHER, hash160(script_bytes));
    }

    NO_CACHE_ENTRY
}

fn extract_bare_pubkey(script: &[u8]) -> Option<&[u8]> {
    const OP_CHECKSIG: u8 = 0xac;
    if script.last()? != &OP_CHECKSIG {
        return None;
    }
    match script.len() {
        // push 65 (uncompressed) + OP_CHECKSIG
        67 if script[0] == 65 => Some(&script[1..66]),
        // push 33 (compressed) + OP_CHECKSIG
        35 if script[0] == 33 => Some(&script[1..34]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2pkh_script(hash: [u8; 20]) -> Vec<u8> {
        let mut s = vec![0x76, 0xa9, 0x14];
        s.extend_from_slice(&hash);
        s.push(0x88);
        s.push(0xac);
        s
    }

    fn p2sh_script(hash: [u8; 20]) -> Vec<u8> {
        let mut s = vec![0xa9, 0x14];
        s.extend_from_slice(&hash);
        s.push(0x87);
        s
    }

    #[test]
    fn classifies_p2pkh() {
        let hash = [0x11u8; 20];
        let id = classify_output_script(&p2pkh_script(hash));
        assert_eq!(id[0], TAG_P2PKH);
        assert_eq!(&id[1..], &hash[..]);
    }

    #[test]
    fn classifies_p2sh() {
        let hash = [0x22u8; 20];
        let id = classify_output_script(&p2sh_script(hash));
        assert_eq!(id[0], TAG_P2SH);
        assert_eq!(&id[1..], &hash[..]);
    }

    #[test]
    fn op_return_is_unindexable() {
        let script = vec![0x6a, 0x04, 0xde, 0xad, 0xbe, 0xef];
        assert_eq!(classify_output_script(&script), NO_CACHE_ENTRY);
    }

    fn p2wpkh_script(hash: [u8; 20]) -> Vec<u8> {
        // OP_0 push-20 <hash>: a v0 witness-pubkey-hash program, recognized
        // by the `bitcoin` crate's address derivation but not by the
        // hand-rolled P2PKH/P2SH/P2PK checks above.
        let mut s = vec![0x00, 0x14];
        s.extend_from_slice(&hash);
        s
    }

    #[test]
    fn classifies_segwit_fallback_as_other_tag_deterministically() {
        let hash = [0x33u8; 20];
        let script = p2wpkh_script(hash);
        let id = classify_output_script(&script);
        assert_eq!(id[0], TAG_OTHER);
        assert_eq!(id, build_id(TAG_OTHER, hash160(&script)), "AddressId must be a deterministic function of the script bytes");
    }
}

//! Mining work and solution types.
//!
//! A [`Work`] is built from a `mining.notify` parameter array together with
//! the two values the client threads in: the pool-assigned extranonce1 and
//! the share target currently in force. A [`Solution`] is produced by the
//! mining engine against a specific `Work`; the client compares that work
//! against its current one to detect stale submissions.

use bitcoin::block::Version;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{BlockHash, CompactTarget, TxMerkleNode};
use serde_json::Value;

use crate::u256::U256;

/// Target corresponding to difficulty 1.
pub const DIFF1_TARGET: U256 = U256::from_limbs([0, 0, 0, 0x00000000ffff0000]);

/// Fixed-point scale applied to pool difficulties before integer division.
pub const DIFF_MULT: u64 = 100_000;

/// Convert a pool difficulty to a 256-bit share target.
///
/// The difficulty is floored at 1e-4, scaled to an integer, and divided into
/// [`DIFF1_TARGET`] with exact 256-bit arithmetic. The division happens
/// before the scale is multiplied back: the product would not fit in 256
/// bits the other way around.
pub fn diff_to_target(diff: f64) -> U256 {
    let diff = diff.max(0.0001);
    let mdiff = (diff * DIFF_MULT as f64) as u64;
    (DIFF1_TARGET / mdiff) * DIFF_MULT
}

/// A mining job bound to its per-connection protocol state.
///
/// Two `Work` values compare equal iff every field, including the bound
/// extranonce1 and target, is equal.
#[derive(Debug, Clone, PartialEq)]
pub struct Work {
    /// Pool-assigned job identifier
    pub job_id: String,

    /// Previous block hash
    pub prev_hash: BlockHash,

    /// First part of the coinbase transaction (before extranonces)
    pub coinbase1: Vec<u8>,

    /// Second part of the coinbase transaction (after extranonces)
    pub coinbase2: Vec<u8>,

    /// Merkle branches for climbing to the root
    pub merkle_branches: Vec<TxMerkleNode>,

    /// Block version field
    pub version: Version,

    /// Encoded difficulty target (nbits)
    pub nbits: CompactTarget,

    /// Block timestamp (Unix epoch seconds)
    pub ntime: u32,

    /// Clean-jobs flag from the notify (params index 8)
    pub reset_job: bool,

    /// Extranonce1 in force when this job arrived (hex)
    pub extra_nonce1: String,

    /// Share target in force when this job arrived
    pub target: U256,

    /// Merkle root of the coinbase with extranonce1 folded in
    pub merkle_root: TxMerkleNode,
}

impl Work {
    /// Build a `Work` from `mining.notify` params plus the client's
    /// per-connection extranonce1 and target.
    ///
    /// Params layout: [job_id, prev_hash, coinbase1, coinbase2,
    /// merkle_branches, version, nbits, ntime, reset_job]. The coinbase
    /// parts must be non-empty hex strings; pools that send placeholder
    /// notifies without them are ignored upstream.
    pub fn from_notify_params(
        params: &[Value],
        extra_nonce1: &str,
        target: U256,
    ) -> Result<Self, String> {
        if params.len() < 9 {
            return Err("mining.notify params too short".to_string());
        }

        let job_id = params[0].as_str().ok_or("job_id not a string")?.to_string();

        let prev_hash_str = params[1].as_str().ok_or("prev_hash not a string")?;
        let prev_hash = parse_block_hash(prev_hash_str)?;

        let coinbase1_str = params[2].as_str().ok_or("coinbase1 not a string")?;
        let coinbase1 = hex::decode(coinbase1_str).map_err(|e| format!("coinbase1 hex: {}", e))?;

        let coinbase2_str = params[3].as_str().ok_or("coinbase2 not a string")?;
        let coinbase2 = hex::decode(coinbase2_str).map_err(|e| format!("coinbase2 hex: {}", e))?;

        let branches_json = params[4].as_array().ok_or("merkle_branches not an array")?;
        let mut merkle_branches = Vec::new();
        for branch in branches_json {
            let branch_str = branch.as_str().ok_or("merkle branch not a string")?;
            merkle_branches.push(parse_merkle_node(branch_str)?);
        }

        let version_str = params[5].as_str().ok_or("version not a string")?;
        let version_u32 =
            u32::from_str_radix(version_str, 16).map_err(|e| format!("version hex: {}", e))?;
        let version = Version::from_consensus(version_u32 as i32);

        let nbits_str = params[6].as_str().ok_or("nbits not a string")?;
        let nbits_u32 =
            u32::from_str_radix(nbits_str, 16).map_err(|e| format!("nbits hex: {}", e))?;
        let nbits = CompactTarget::from_consensus(nbits_u32);

        let ntime_str = params[7].as_str().ok_or("ntime not a string")?;
        let ntime = u32::from_str_radix(ntime_str, 16).map_err(|e| format!("ntime hex: {}", e))?;

        let reset_job = params[8].as_bool().ok_or("reset_job not a bool")?;

        let extra_nonce1_bytes =
            hex::decode(extra_nonce1).map_err(|e| format!("extranonce1 hex: {}", e))?;
        let merkle_root =
            compute_merkle_root(&coinbase1, &extra_nonce1_bytes, &coinbase2, &merkle_branches);

        Ok(Self {
            job_id,
            prev_hash,
            coinbase1,
            coinbase2,
            merkle_branches,
            version,
            nbits,
            ntime,
            reset_job,
            extra_nonce1: extra_nonce1.to_string(),
            target,
            merkle_root,
        })
    }

    /// Merkle root as the hex string submitted with shares.
    pub fn merkle_root_hex(&self) -> String {
        self.merkle_root.to_string()
    }
}

/// Hash the coinbase with extranonce1 folded in, then climb the branches.
fn compute_merkle_root(
    coinbase1: &[u8],
    extra_nonce1: &[u8],
    coinbase2: &[u8],
    branches: &[TxMerkleNode],
) -> TxMerkleNode {
    let mut coinbase = Vec::with_capacity(coinbase1.len() + extra_nonce1.len() + coinbase2.len());
    coinbase.extend_from_slice(coinbase1);
    coinbase.extend_from_slice(extra_nonce1);
    coinbase.extend_from_slice(coinbase2);

    let mut current = sha256d::Hash::hash(&coinbase).to_byte_array();
    for branch in branches {
        let mut combined = Vec::with_capacity(64);
        combined.extend_from_slice(&current);
        combined.extend_from_slice(branch.as_byte_array());
        current = sha256d::Hash::hash(&combined).to_byte_array();
    }

    TxMerkleNode::from_byte_array(current)
}

/// Parse a block hash from its Stratum hex encoding.
///
/// Stratum transmits the 256-bit hash as 8 four-byte words with the bytes
/// of each word reversed relative to the internal byte order, a leftover
/// from 32-bit era implementations. Reversing each word restores the
/// internal representation.
fn parse_block_hash(hex: &str) -> Result<BlockHash, String> {
    let mut bytes = hex::decode(hex).map_err(|e| format!("block hash hex: {}", e))?;
    if bytes.len() != 32 {
        return Err(format!("block hash wrong length: {}", bytes.len()));
    }

    for chunk in bytes.chunks_mut(4) {
        chunk.reverse();
    }

    BlockHash::from_slice(&bytes).map_err(|e| format!("block hash parse: {}", e))
}

/// Parse a merkle node from a Stratum hex string.
fn parse_merkle_node(hex: &str) -> Result<TxMerkleNode, String> {
    let bytes = hex::decode(hex).map_err(|e| format!("merkle node hex: {}", e))?;
    if bytes.len() != 32 {
        return Err(format!("merkle node wrong length: {}", bytes.len()));
    }
    TxMerkleNode::from_slice(&bytes).map_err(|e| format!("merkle node parse: {}", e))
}

/// A solved share found by the mining engine.
///
/// Opaque to the client apart from its accessors and the back-reference to
/// the [`Work`] it was computed against.
#[derive(Debug, Clone)]
pub struct Solution {
    job_name: String,
    extra_nonce2: String,
    time: String,
    nonce: String,
    hash_mix: [u8; 32],
    block_transaction: String,
    work: Work,
}

impl Solution {
    pub fn new(
        work: Work,
        extra_nonce2: String,
        time: String,
        nonce: String,
        hash_mix: [u8; 32],
        block_transaction: String,
    ) -> Self {
        Self {
            job_name: work.job_id.clone(),
            extra_nonce2,
            time,
            nonce,
            hash_mix,
            block_transaction,
            work,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn extra_nonce2(&self) -> &str {
        &self.extra_nonce2
    }

    pub fn time(&self) -> &str {
        &self.time
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn hash_mix_hex(&self) -> String {
        hex::encode(self.hash_mix)
    }

    pub fn block_transaction(&self) -> &str {
        &self.block_transaction
    }

    pub fn work(&self) -> &Work {
        &self.work
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn notify_params(job_id: &str, reset: bool) -> Vec<Value> {
        vec![
            json!(job_id),
            json!("6b6455fd6db962c101f2d4fc0d67f4a3bc96391d000152960000000000000000"),
            json!("aa11"),
            json!("bb22"),
            json!([]),
            json!("20000000"),
            json!("1d00ffff"),
            json!("5a5a5a5a"),
            json!(reset),
        ]
    }

    #[test]
    fn test_diff_one_is_diff1_target() {
        let target = diff_to_target(1.0);
        // Divide-then-multiply loses at most DIFF_MULT of the low bits.
        assert!(target <= DIFF1_TARGET);
        assert_eq!(target, (DIFF1_TARGET / DIFF_MULT) * DIFF_MULT);
    }

    #[test]
    fn test_diff_to_target_monotone() {
        let diffs = [0.0001, 0.5, 1.0, 2.0, 10.0, 1000.0, 65536.0];
        let targets: Vec<U256> = diffs.iter().map(|d| diff_to_target(*d)).collect();
        for pair in targets.windows(2) {
            assert!(pair[0] >= pair[1], "target must not increase with difficulty");
        }
    }

    #[test]
    fn test_diff_to_target_clamps_tiny_difficulty() {
        assert_eq!(diff_to_target(0.00001), diff_to_target(0.0001));
        assert_eq!(diff_to_target(-3.0), diff_to_target(0.0001));
    }

    #[test]
    fn test_work_from_notify_params() {
        let params = notify_params("job1", false);
        let work = Work::from_notify_params(&params, "f000000f", DIFF1_TARGET).unwrap();

        assert_eq!(work.job_id, "job1");
        assert_eq!(work.coinbase1, vec![0xaa, 0x11]);
        assert_eq!(work.coinbase2, vec![0xbb, 0x22]);
        assert!(work.merkle_branches.is_empty());
        assert_eq!(work.ntime, 0x5a5a5a5a);
        assert!(!work.reset_job);
        assert_eq!(work.extra_nonce1, "f000000f");
        assert_eq!(work.target, DIFF1_TARGET);
    }

    #[test]
    fn test_work_prev_hash_word_swap() {
        let params = notify_params("job1", false);
        let work = Work::from_notify_params(&params, "f000000f", DIFF1_TARGET).unwrap();
        let bytes = work.prev_hash.as_byte_array();
        assert_eq!(&bytes[0..4], &[0xfd, 0x55, 0x64, 0x6b]);
        assert_eq!(&bytes[4..8], &[0xc1, 0x62, 0xb9, 0x6d]);
    }

    #[test]
    fn test_work_equality_includes_bound_fields() {
        let params = notify_params("job1", false);
        let a = Work::from_notify_params(&params, "f000000f", DIFF1_TARGET).unwrap();
        let b = Work::from_notify_params(&params, "f000000f", DIFF1_TARGET).unwrap();
        assert_eq!(a, b);

        let other_nonce = Work::from_notify_params(&params, "deadbeef", DIFF1_TARGET).unwrap();
        assert_ne!(a, other_nonce);

        let other_target =
            Work::from_notify_params(&params, "f000000f", diff_to_target(2.0)).unwrap();
        assert_ne!(a, other_target);
    }

    #[test]
    fn test_merkle_root_tracks_extranonce() {
        let params = notify_params("job1", false);
        let a = Work::from_notify_params(&params, "f000000f", DIFF1_TARGET).unwrap();
        let b = Work::from_notify_params(&params, "deadbeef", DIFF1_TARGET).unwrap();
        assert_ne!(a.merkle_root, b.merkle_root);
        assert_eq!(a.merkle_root_hex().len(), 64);
    }

    #[test]
    fn test_work_rejects_short_params() {
        let mut params = notify_params("job1", false);
        params.truncate(8);
        assert!(Work::from_notify_params(&params, "f000000f", DIFF1_TARGET).is_err());
    }

    #[test]
    fn test_solution_accessors() {
        let params = notify_params("job7", false);
        let work = Work::from_notify_params(&params, "f000000f", DIFF1_TARGET).unwrap();
        let sol = Solution::new(
            work.clone(),
            "00000001".into(),
            "5a5a5a5a".into(),
            "deadbeef".into(),
            [0x11; 32],
            "txblob".into(),
        );
        assert_eq!(sol.job_name(), "job7");
        assert_eq!(sol.hash_mix_hex(), "11".repeat(32));
        assert_eq!(sol.work(), &work);
    }
}

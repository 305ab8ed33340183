//! Merkle branch builder: computes the coinbase-side branch and root
//! of a block's transaction tree via double-SHA256.
//!
//! Only the coinbase transaction changes between jobs (extranonce
//! rolls), so the branch — the sibling hashes needed to fold a
//! coinbase hash up to the root — is computed once per job and reused
//! for every share, rather than rehashing the whole tree each time.

use sha2::{Digest, Sha256};

pub type Hash32 = [u8; 32];

/// Bitcoin-style double-SHA256.
pub fn dsha256(data: &[u8]) -> Hash32 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

fn concat_and_hash(a: &Hash32, b: &Hash32) -> Hash32 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(a);
    buf[32..].copy_from_slice(b);
    dsha256(&buf)
}

/// Build the coinbase merkle branch: the list of sibling hashes needed
/// to fold a yet-unknown coinbase hash (at tree position 0) up to the
/// merkle root, given the remaining transaction hashes in block order.
pub fn build_branch(tx_hashes: &[Hash32]) -> Vec<Hash32> {
    // Level 0: coinbase placeholder (position 0, value unused) ++ tx_hashes.
    // We only need to know the *position* of the coinbase slot, not its
    // value, so placeholder content is irrelevant to the branch result.
    let placeholder: Hash32 = [0u8; 32];
    let mut level: Vec<Hash32> = std::iter::once(placeholder)
        .chain(tx_hashes.iter().copied())
        .collect();

    let mut branch = Vec::new();
    let mut coinbase_index = 0usize;

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = *level.last().unwrap();
            level.push(last);
        }

        let sibling_index = coinbase_index ^ 1;
        branch.push(level[sibling_index]);

        let mut next_level = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            next_level.push(concat_and_hash(&pair[0], &pair[1]));
        }
        level = next_level;
        coinbase_index /= 2;
    }

    branch
}

/// Fold the coinbase hash up through `branch` to recover the merkle root.
pub fn compute_root(coinbase_hash: Hash32, branch: &[Hash32]) -> Hash32 {
    let mut h = coinbase_hash;
    for sibling in branch {
        h = concat_and_hash(&h, sibling);
    }
    h
}

/// Reference (non-incremental) merkle root over the full ordered list,
/// coinbase first — used only by tests to check the round-trip
/// invariant against `build_branch`/`compute_root`.
#[cfg(test)]
fn naive_merkle_root(hashes: &[Hash32]) -> Hash32 {
    let mut level: Vec<Hash32> = hashes.to_vec();
    if level.is_empty() {
        return [0u8; 32];
    }
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = *level.last().unwrap();
            level.push(last);
        }
        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            next.push(concat_and_hash(&pair[0], &pair[1]));
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(byte: u8) -> Hash32 {
        [byte; 32]
    }

    #[test]
    fn single_tx_branch_round_trips() {
        let cb = hash_of(0xAA);
        let tx1 = hash_of(1);
        let branch = build_branch(&[tx1]);
        let root = compute_root(cb, &branch);
        let expected = naive_merkle_root(&[cb, tx1]);
        assert_eq!(root, expected);
    }

    #[test]
    fn even_and_odd_length_lists_round_trip() {
        let cb = hash_of(0xFE);
        for n in 0..8usize {
            let txs: Vec<Hash32> = (1..=n as u8).map(hash_of).collect();
            let branch = build_branch(&txs);
            let root = compute_root(cb, &branch);
            let mut full = vec![cb];
            full.extend(txs.iter().copied());
            let expected = naive_merkle_root(&full);
            assert_eq!(root, expected, "mismatch for n={n}");
        }
    }

    #[test]
    fn empty_tx_list_branch_is_empty_and_root_is_coinbase() {
        let cb = hash_of(7);
        let branch = build_branch(&[]);
        assert!(branch.is_empty());
        assert_eq!(compute_root(cb, &branch), cb);
    }
}

/// Hash primitives shared by the job builder, the share validator and the
/// stratum notify encoder.

use sha2::{Digest, Sha256};

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

fn hash_pair(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(a);
    buf[32..].copy_from_slice(b);
    sha256d(&buf)
}

/// Full merkle root: pairwise double-SHA-256, duplicating the odd leaf.
pub fn merkle_root(hashes: &[[u8; 32]]) -> [u8; 32] {
    if hashes.is_empty() {
        return [0u8; 32];
    }
    let mut layer = hashes.to_vec();
    while layer.len() > 1 {
        if layer.len() % 2 == 1 {
            layer.push(*layer.last().expect("non-empty layer"));
        }
        layer = layer
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    layer[0]
}

/// Merkle path for a coinbase at slot zero, built over the remaining tx
/// hashes. The miner folds its coinbase hash through the returned branch to
/// reach the same root as `merkle_root([coinbase] ++ hashes)`.
pub fn merkle_branch(hashes: &[[u8; 32]]) -> Vec<[u8; 32]> {
    let mut tree = hashes.to_vec();
    let mut mask = 1usize;
    while tree.len() > mask {
        if (tree.len() - mask) % 2 == 1 {
            tree.push(*tree.last().expect("non-empty tree"));
        } else {
            let mut next = tree[..mask].to_vec();
            next.extend(tree[mask..].chunks(2).map(|pair| hash_pair(&pair[0], &pair[1])));
            tree = next;
            mask += 1;
        }
    }
    tree
}

/// Fold a coinbase hash through a merkle branch, the way miners recompute the
/// root from a `mining.notify` message.
pub fn fold_branch(coinbase_hash: [u8; 32], branch: &[[u8; 32]]) -> [u8; 32] {
    branch
        .iter()
        .fold(coinbase_hash, |acc, node| hash_pair(&acc, node))
}

/// Previous-hash preprocessing for `mining.notify`: regroup the 32 bytes as
/// eight 32-bit words in reversed order, then reverse the whole sequence.
pub fn swap_prev_hash(hash: &[u8; 32]) -> [u8; 32] {
    let mut out = Vec::with_capacity(32);
    for i in (0..32).step_by(4).rev() {
        out.extend_from_slice(&hash[i..i + 4]);
    }
    out.reverse();
    out.try_into().expect("32 bytes")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h32(s: &str) -> [u8; 32] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn branch_matches_reference_block() {
        // taken from a live block with five non-coinbase transactions
        let original = [
            h32("41091d1f9b4f2a4f562c4d24793a46d55c915f25e24342bf1918540d317c4c42"),
            h32("281324435c35f53301df50ed9b3af215247f0ab74c35d5df5177d439e0fc87ec"),
            h32("a2500f840f2d53f24dad53b272404fca16798d06e20cba608ea1c0e17e73efd3"),
            h32("1ad525dd7674f427482e9b3a1e57084ca85dc46c4c90d96388a17801f056d65c"),
            h32("a7f52fb50483f77c297e5ab30519102d1a8499412ba6f8c184bd79cb24034705"),
        ];
        let expect = [
            h32("41091d1f9b4f2a4f562c4d24793a46d55c915f25e24342bf1918540d317c4c42"),
            h32("a1bc6f3b480c62ebc04ddfc1e58967e77e56a1ace34c73796008fdba8c2024ab"),
            h32("2532aed76199db600abf31e120c4a70e0405d475f17226553a991d6d54acb3d6"),
        ];
        assert_eq!(merkle_branch(&original), expect);
    }

    #[test]
    fn branch_fold_equals_full_root() {
        // property: folding the coinbase through the branch reproduces the
        // root of the full tree, for every tree width
        let coinbase = sha256d(b"coinbase");
        for n in 0..12usize {
            let hashes: Vec<[u8; 32]> =
                (0..n).map(|i| sha256d(&[i as u8])).collect();
            let branch = merkle_branch(&hashes);
            let mut full = vec![coinbase];
            full.extend_from_slice(&hashes);
            assert_eq!(
                fold_branch(coinbase, &branch),
                merkle_root(&full),
                "width {n}"
            );
        }
    }

    #[test]
    fn swap_prev_hash_word_groups() {
        let input: [u8; 32] = (1..=32).collect::<Vec<u8>>().try_into().unwrap();
        let swapped = swap_prev_hash(&input);
        // each 4-byte word is byte-reversed, word order unchanged
        let expect: Vec<u8> = input
            .chunks(4)
            .flat_map(|w| w.iter().rev().copied())
            .collect();
        assert_eq!(swapped.to_vec(), expect);
    }

    #[test]
    fn single_hash_is_its_own_root() {
        let h = sha256d(b"x");
        assert_eq!(merkle_root(&[h]), h);
        assert!(merkle_branch(&[]).is_empty());
    }
}

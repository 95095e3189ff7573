pub mod address;
pub mod codec;
pub mod hashing;

pub use address::Address;
pub use codec::{bits_to_target, default_target, target_from_difficulty, Block, Tx};
pub use hashing::{merkle_branch, merkle_root, sha256d, swap_prev_hash};

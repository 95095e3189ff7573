/// Binary codec for transactions and block headers
///
/// The coinbase transaction handed out by `getblocktemplate` (requested with
/// the `coinbasetxn` + `messagenonce` capabilities) ends with an 8-byte zero
/// message. That trailing slot is where extranonce1 || extranonce2 lands, so
/// splitting the serialized bytes at `len - 8` yields coinbase1 and an empty
/// coinbase2.

use num_bigint::BigUint;
use num_traits::FromPrimitive;
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::algorithm::Algorithm;
use crate::chain::address::Address;
use crate::chain::hashing::sha256d;

/// 0x00000000ffff0000... - the difficulty-1 target shares are measured against.
static DEFAULT_TARGET: Lazy<BigUint> = Lazy::new(|| {
    let mut bytes = [0u8; 32];
    bytes[4] = 0xff;
    bytes[5] = 0xff;
    BigUint::from_bytes_be(&bytes)
});

/// f64 view of the default target, for difficulty arithmetic.
pub const DEFAULT_TARGET_F64: f64 = 2.695953529101131e67;

pub fn default_target() -> &'static BigUint {
    &DEFAULT_TARGET
}

/// Expand compact bits into the full 256-bit target.
pub fn bits_to_target(bits: u32) -> BigUint {
    let exponent = (bits >> 24) as u32;
    let mantissa = BigUint::from(bits & 0x007f_ffff);
    if exponent <= 3 {
        mantissa >> (8 * (3 - exponent))
    } else {
        mantissa << (8 * (exponent - 3))
    }
}

/// Share target for a normalized difficulty, `DEFAULT_TARGET / difficulty`.
pub fn target_from_difficulty(difficulty: f64) -> BigUint {
    let scaled = DEFAULT_TARGET_F64 / difficulty.max(f64::MIN_POSITIVE);
    BigUint::from_f64(scaled).unwrap_or_default()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input at byte {0}")]
    Truncated(usize),
    #[error("trailing {0} bytes after transaction")]
    TrailingBytes(usize),
}

/// Bitcoin CompactSize.
pub fn write_compact_size(n: u64, out: &mut Vec<u8>) {
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.data.len() {
            return Err(CodecError::Truncated(self.pos));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn compact_size(&mut self) -> Result<u64, CodecError> {
        let tag = self.u8()?;
        Ok(match tag {
            0xfd => u16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")) as u64,
            0xfe => self.u32()? as u64,
            0xff => self.u64()?,
            n => n as u64,
        })
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

pub fn read_compact_size(data: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut reader = Reader::new(data);
    let value = reader.compact_size()?;
    Ok((value, reader.pos))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub hash: [u8; 32],
    pub index: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub address: Address,
    pub coin_id: u32,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    pub version: u32,
    pub tx_type: u32,
    pub time: u32,
    pub deadline: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub gas_price: u64,
    pub gas_amount: i64,
    pub message_type: u8,
    pub message: Vec<u8>,
}

impl Tx {
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(data);
        let version = r.u32()?;
        let tx_type = r.u32()?;
        let time = r.u32()?;
        let deadline = r.u32()?;
        let n_inputs = r.compact_size()? as usize;
        let mut inputs = Vec::with_capacity(n_inputs);
        for _ in 0..n_inputs {
            let hash: [u8; 32] = r.take(32)?.try_into().expect("32 bytes");
            let index = r.u8()?;
            inputs.push(TxInput { hash, index });
        }
        let n_outputs = r.compact_size()? as usize;
        let mut outputs = Vec::with_capacity(n_outputs);
        for _ in 0..n_outputs {
            let addr: [u8; 21] = r.take(21)?.try_into().expect("21 bytes");
            let coin_id = r.u32()?;
            let amount = r.u64()?;
            outputs.push(TxOutput {
                address: Address::from_bytes(&addr),
                coin_id,
                amount,
            });
        }
        let gas_price = r.u64()?;
        let gas_amount = r.i64()?;
        let message_type = r.u8()?;
        let msg_len = r.compact_size()? as usize;
        let message = r.take(msg_len)?.to_vec();
        if r.remaining() != 0 {
            return Err(CodecError::TrailingBytes(r.remaining()));
        }
        Ok(Self {
            version,
            tx_type,
            time,
            deadline,
            inputs,
            outputs,
            gas_price,
            gas_amount,
            message_type,
            message,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.outputs.len() * 33 + self.message.len());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.tx_type.to_le_bytes());
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.deadline.to_le_bytes());
        write_compact_size(self.inputs.len() as u64, &mut out);
        for input in &self.inputs {
            out.extend_from_slice(&input.hash);
            out.push(input.index);
        }
        write_compact_size(self.outputs.len() as u64, &mut out);
        for output in &self.outputs {
            out.extend_from_slice(&output.address.to_bytes());
            out.extend_from_slice(&output.coin_id.to_le_bytes());
            out.extend_from_slice(&output.amount.to_le_bytes());
        }
        out.extend_from_slice(&self.gas_price.to_le_bytes());
        out.extend_from_slice(&self.gas_amount.to_le_bytes());
        out.push(self.message_type);
        write_compact_size(self.message.len() as u64, &mut out);
        out.extend_from_slice(&self.message);
        out
    }

    pub fn hash(&self) -> [u8; 32] {
        sha256d(&self.serialize())
    }
}

/// Assembled block candidate. Both hashes are fixed at construction; the
/// header never changes afterwards.
#[derive(Debug, Clone)]
pub struct Block {
    pub version: u32,
    pub previous_hash: [u8; 32],
    pub merkleroot: [u8; 32],
    pub time: u32,
    pub bits: u32,
    pub nonce: [u8; 4],
    pub height: u64,
    pub algorithm: Algorithm,
    pub hash: [u8; 32],
    pub work_hash: [u8; 32],
}

impl Block {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        version: u32,
        previous_hash: [u8; 32],
        merkleroot: [u8; 32],
        time: u32,
        bits: u32,
        nonce: [u8; 4],
        height: u64,
        algorithm: Algorithm,
    ) -> Self {
        let mut block = Self {
            version,
            previous_hash,
            merkleroot,
            time,
            bits,
            nonce,
            height,
            algorithm,
            hash: [0u8; 32],
            work_hash: [0u8; 32],
        };
        let header = block.header();
        block.hash = sha256d(&header);
        block.work_hash = algorithm.work_hash(&header);
        block
    }

    pub fn header(&self) -> [u8; 80] {
        let mut out = [0u8; 80];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(&self.previous_hash);
        out[36..68].copy_from_slice(&self.merkleroot);
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce);
        out
    }

    /// Work hash against an arbitrary target, little-endian interpretation.
    pub fn pow_check(&self, target: &BigUint) -> bool {
        BigUint::from_bytes_le(&self.work_hash) <= *target
    }

    /// Network difficulty encoded by the compact bits, rounded to 8 decimals.
    pub fn difficulty(&self) -> f64 {
        difficulty_from_bits(self.bits)
    }
}

pub fn difficulty_from_bits(bits: u32) -> f64 {
    let target = bits_to_target(bits);
    let ratio = big_to_f64(&DEFAULT_TARGET) / big_to_f64(&target).max(1.0);
    (ratio * 1e8).round() / 1e8
}

fn big_to_f64(value: &BigUint) -> f64 {
    use num_traits::ToPrimitive;
    value.to_f64().unwrap_or(f64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::address::IDENTIFIER_LEN;

    fn sample_tx(message: Vec<u8>) -> Tx {
        Tx {
            version: 2,
            tx_type: 0,
            time: 1000,
            deadline: 11800,
            inputs: vec![],
            outputs: vec![TxOutput {
                address: Address::new(0, [3u8; IDENTIFIER_LEN]),
                coin_id: 0,
                amount: 5_000_000_000,
            }],
            gas_price: 1,
            gas_amount: 10_000,
            message_type: 0,
            message,
        }
    }

    #[test]
    fn compact_size_boundaries() {
        for (value, encoded_len) in [
            (0xfcu64, 1usize),
            (0xfd, 3),
            (0xffff, 3),
            (0x10000, 5),
            (0xffff_ffff, 5),
            (0x1_0000_0000, 9),
        ] {
            let mut buf = Vec::new();
            write_compact_size(value, &mut buf);
            assert_eq!(buf.len(), encoded_len, "encoding 0x{value:x}");
            let (decoded, used) = read_compact_size(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, encoded_len);
        }
    }

    #[test]
    fn tx_round_trip() {
        let tx = sample_tx(vec![0u8; 8]);
        let bytes = tx.serialize();
        assert_eq!(Tx::parse(&bytes).unwrap(), tx);
    }

    #[test]
    fn coinbase_split_reassembles_with_any_extranonce() {
        // the 8-byte zero message is the extranonce slot: coinbase1 is
        // everything before it and coinbase2 is empty
        let coinbase = sample_tx(vec![0u8; 8]).serialize();
        let coinbase1 = &coinbase[..coinbase.len() - 8];
        assert_eq!(coinbase1.len() + 8, coinbase.len());

        let mut patched = coinbase1.to_vec();
        patched.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        patched.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]);
        let parsed = Tx::parse(&patched).unwrap();
        assert_eq!(
            parsed.message,
            vec![0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04]
        );
    }

    #[test]
    fn truncated_tx_is_rejected() {
        let bytes = sample_tx(vec![0u8; 8]).serialize();
        assert!(matches!(
            Tx::parse(&bytes[..bytes.len() - 3]),
            Err(CodecError::Truncated(_))
        ));
    }

    #[test]
    fn bits_expansion() {
        // 0x1d00ffff is the difficulty-1 compact encoding
        assert_eq!(bits_to_target(0x1d00ffff), *default_target());
        let easy = bits_to_target(0x207fffff);
        assert!(easy > *default_target());
        assert!((difficulty_from_bits(0x1d00ffff) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn header_is_80_bytes_and_hashes_are_fixed() {
        let block = Block::new(
            2,
            [1u8; 32],
            [2u8; 32],
            1234,
            0x207fffff,
            [9, 9, 9, 9],
            10,
            Algorithm::Sha256d,
        );
        let header = block.header();
        assert_eq!(header.len(), 80);
        assert_eq!(block.hash, sha256d(&header));
        assert_eq!(block.work_hash, block.hash);
    }

    #[test]
    fn share_target_scales_inversely_with_difficulty() {
        let t1 = target_from_difficulty(1.0);
        let t2 = target_from_difficulty(2.0);
        assert!(t2 < t1);
        // difficulty 1 reproduces the default target to float precision
        let diff = if t1 > *default_target() {
            &t1 - default_target()
        } else {
            default_target() - &t1
        };
        assert!(diff < (default_target().clone() >> 30u32));
    }
}

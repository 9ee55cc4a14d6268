//! Implode (method 6): LZ77 over a 4 or 8 KiB window with Shannon-Fano coded
//! lengths, distances and optionally literals.

use super::{Huffman, LsbReader};
use crate::error::{DosError, DriveResult};

/// General purpose flag: 8 KiB window.
pub const IMPLODE_8K_WINDOW: u16 = 2;
/// General purpose flag: literals are coded with their own tree.
pub const IMPLODE_LITERAL_TREE: u16 = 4;

/// Read a tree description: a count byte, then (bit length, repeat) nibble pairs.
fn read_tree(bits: &mut LsbReader, symbols: usize) -> DriveResult<Huffman> {
    let pairs = bits.byte() as usize + 1;
    let mut lengths = Vec::with_capacity(symbols);
    for _ in 0..pairs {
        let b = bits.byte();
        let len = (b & 0xf) + 1;
        let count = (b >> 4) as usize + 1;
        if lengths.len() + count > symbols {
            return Err(DosError::DataInvalid);
        }
        lengths.extend(std::iter::repeat(len).take(count));
    }
    if lengths.len() != symbols {
        return Err(DosError::DataInvalid);
    }
    Huffman::new(&lengths)
}

/// Trees are stored with inverted code bits.
fn decode(tree: &Huffman, bits: &mut LsbReader) -> DriveResult<usize> {
    tree.decode(|| Ok(bits.bits(1) ^ 1)).map(|s| s as usize)
}

/// Decode an imploded member of `uncomp_size` bytes.
pub fn explode(comp: &[u8], uncomp_size: usize, bit_flags: u16) -> DriveResult<Vec<u8>> {
    let coded_literals = bit_flags & IMPLODE_LITERAL_TREE != 0;
    let low_dist_bits = if bit_flags & IMPLODE_8K_WINDOW != 0 { 7 } else { 6 };
    let min_len = if coded_literals { 3 } else { 2 };

    let mut bits = LsbReader::new(comp);
    let literals = if coded_literals {
        Some(read_tree(&mut bits, 256)?)
    } else {
        None
    };
    let lengths = read_tree(&mut bits, 64)?;
    let distances = read_tree(&mut bits, 64)?;

    let mut out = Vec::with_capacity(uncomp_size);
    while out.len() < uncomp_size {
        if bits.bits(1) == 1 {
            let b = match &literals {
                Some(tree) => decode(tree, &mut bits)? as u8,
                None => bits.bits(8) as u8,
            };
            out.push(b);
            continue;
        }

        let low = bits.bits(low_dist_bits) as usize;
        let high = decode(&distances, &mut bits)?;
        let dist = 1 + low + (high << low_dist_bits);
        let sym = decode(&lengths, &mut bits)?;
        let mut len = min_len + sym;
        if sym == 63 {
            len += bits.bits(8) as usize;
        }

        for _ in 0..len.min(uncomp_size - out.len()) {
            // Distances reaching before the start of the data copy zeros
            let b = if dist > out.len() { 0 } else { out[out.len() - dist] };
            out.push(b);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BitWriter {
        out: Vec<u8>,
        buf: u32,
        cnt: u32,
    }

    impl BitWriter {
        fn put(&mut self, v: u32, n: u32) {
            self.buf |= v << self.cnt;
            self.cnt += n;
            while self.cnt >= 8 {
                self.out.push(self.buf as u8);
                self.buf >>= 8;
                self.cnt -= 8;
            }
        }

        /// Fixed-width tree code, most significant bit first, inverted.
        fn put_code(&mut self, sym: u32, width: u32) {
            for k in (0..width).rev() {
                self.put(((sym >> k) & 1) ^ 1, 1);
            }
        }
    }

    /// Greedy imploder using uniform trees (6-bit lengths and distances, 8-bit literals).
    fn implode(data: &[u8], flags: u16) -> Vec<u8> {
        let literal_tree = flags & IMPLODE_LITERAL_TREE != 0;
        let low_bits = if flags & IMPLODE_8K_WINDOW != 0 { 7 } else { 6 };
        let window = 64usize << low_bits;
        let min_len = if literal_tree { 3 } else { 2 };

        let mut out = Vec::new();
        if literal_tree {
            out.push(15);
            out.extend([0xF7u8; 16]);
        }
        for _ in 0..2 {
            out.extend([3u8, 0xF5, 0xF5, 0xF5, 0xF5]);
        }
        let mut w = BitWriter { out, buf: 0, cnt: 0 };

        let mut i = 0;
        while i < data.len() {
            let mut best = (0usize, 0usize);
            for dist in 1..=window.min(i) {
                let mut n = 0;
                while i + n < data.len() && n < min_len + 63 + 255 && data[i + n] == data[i + n - dist] {
                    n += 1;
                }
                if n > best.0 {
                    best = (n, dist);
                }
            }
            let (len, dist) = best;
            if len >= min_len.max(3) {
                w.put(0, 1);
                let d = (dist - 1) as u32;
                w.put(d & ((1 << low_bits) - 1), low_bits);
                w.put_code(d >> low_bits, 6);
                let sym = (len - min_len).min(63);
                w.put_code(sym as u32, 6);
                if sym == 63 {
                    w.put((len - min_len - 63) as u32, 8);
                }
                i += len;
            } else {
                w.put(1, 1);
                if literal_tree {
                    w.put_code(data[i] as u32, 8);
                } else {
                    w.put(data[i] as u32, 8);
                }
                i += 1;
            }
        }
        w.put(0, 7);
        w.out
    }

    fn sample() -> Vec<u8> {
        let mut v = b"IMPLODE ".repeat(40);
        v.extend((0..=255u8).cycle().take(600));
        v.extend(b"tail tail tail tail".iter());
        v
    }

    #[test]
    fn test_explode_4k_raw_literals() {
        let data = sample();
        let comp = implode(&data, 0);
        assert_eq!(explode(&comp, data.len(), 0).unwrap(), data);
    }

    #[test]
    fn test_explode_8k_coded_literals() {
        let data = sample();
        let flags = IMPLODE_8K_WINDOW | IMPLODE_LITERAL_TREE;
        let comp = implode(&data, flags);
        assert_eq!(explode(&comp, data.len(), flags).unwrap(), data);
    }

    #[test]
    fn test_explode_long_match_uses_extra_byte() {
        let data = vec![b'z'; 400];
        let comp = implode(&data, 0);
        assert!(comp.len() < 40);
        assert_eq!(explode(&comp, 400, 0).unwrap(), data);
    }

    #[test]
    fn test_explode_distance_before_start_is_zero() {
        let mut w = BitWriter { out: Vec::new(), buf: 0, cnt: 0 };
        for _ in 0..2 {
            w.out.extend([3u8, 0xF5, 0xF5, 0xF5, 0xF5]);
        }
        w.put(0, 1);
        w.put(9, 6); // distance 10
        w.put_code(0, 6);
        w.put_code(2, 6); // length 4
        w.put(0, 7);
        let out = explode(&w.out, 4, 0).unwrap();
        assert_eq!(out, vec![0; 4]);
    }

    #[test]
    fn test_explode_bad_tree() {
        // Tree covering only 32 of 64 symbols
        let comp = [1u8, 0xF5, 0xF5];
        assert_eq!(explode(&comp, 10, 0), Err(DosError::DataInvalid));
    }
}

//! Shrink (method 1): dynamic LZW with 9 to 13 bit codes and partial clearing.

use super::LsbReader;
use crate::error::{DosError, DriveResult};

const INITIAL_CODE_SIZE: u32 = 9;
const MAX_CODE_SIZE: u32 = 13;
const NUM_CODES: usize = 8192;
/// Longest possible chain (8192 - 257 + 1).
const STACK_SIZE: usize = 7936;
/// Control code, also the "unused" marker for table parents.
const CONTROL: u16 = 256;
const FIRST_FREE: u16 = 257;

#[derive(Clone, Copy)]
struct Entry {
    parent: u16,
    value: u8,
    has_child: bool,
}

struct Unshrinker {
    table: Vec<Entry>,
    stack: Vec<u8>,
    out: Vec<u8>,
    limit: usize,
    last_value: u8,
    old_code: Option<u16>,
    free_search: u16,
    highest_used: u16,
}

impl Unshrinker {
    fn new(limit: usize) -> Self {
        let mut table = vec![
            Entry {
                parent: CONTROL,
                value: 0,
                has_child: false,
            };
            NUM_CODES
        ];
        for (i, e) in table.iter_mut().enumerate().take(256) {
            e.value = i as u8;
        }
        Self {
            table,
            stack: vec![0u8; STACK_SIZE],
            out: Vec::with_capacity(limit),
            limit,
            last_value: 0,
            old_code: None,
            free_search: FIRST_FREE,
            highest_used: 0,
        }
    }

    fn in_table(&self, code: u16) -> bool {
        code < 256 || self.table[code as usize].parent != CONTROL
    }

    /// Add (old code, last value) at the first free slot.
    fn add(&mut self, old: u16) -> DriveResult<()> {
        let mut pos = self.free_search;
        while self.table.get(pos as usize).ok_or(DosError::DataInvalid)?.parent != CONTROL {
            pos += 1;
        }
        self.table[pos as usize] = Entry {
            parent: old,
            value: self.last_value,
            has_child: false,
        };
        self.free_search = pos + 1;
        self.highest_used = self.highest_used.max(pos);
        Ok(())
    }

    /// Write out the string of `code`, updating the last value to its first byte.
    fn emit(&mut self, code: u16) -> DriveResult<()> {
        let mut pos = STACK_SIZE;
        let mut c = code;
        loop {
            if c as usize >= NUM_CODES || pos == 0 {
                return Err(DosError::DataInvalid);
            }
            pos -= 1;
            if c >= FIRST_FREE && self.table[c as usize].parent == CONTROL {
                // KwKwK: the code being defined right now
                self.stack[pos] = self.last_value;
                c = self.old_code.ok_or(DosError::DataInvalid)?;
                continue;
            }
            let e = self.table[c as usize];
            self.stack[pos] = e.value;
            if c < FIRST_FREE {
                self.last_value = e.value;
                let n = (STACK_SIZE - pos).min(self.limit - self.out.len());
                self.out.extend_from_slice(&self.stack[pos..pos + n]);
                return Ok(());
            }
            c = e.parent;
        }
    }

    /// Drop every code above 256 that is not the parent of another code.
    fn partial_clear(&mut self) {
        for i in FIRST_FREE..=self.highest_used {
            let parent = self.table[i as usize].parent;
            if parent != CONTROL {
                self.table[parent as usize].has_child = true;
            }
        }
        for i in FIRST_FREE..=self.highest_used {
            let e = &mut self.table[i as usize];
            if e.has_child {
                e.has_child = false;
            } else {
                e.parent = CONTROL;
                e.value = 0;
            }
        }
        self.free_search = FIRST_FREE;
    }
}

/// Decode a shrunk member of `uncomp_size` bytes.
pub fn unshrink(comp: &[u8], uncomp_size: usize) -> DriveResult<Vec<u8>> {
    let mut state = Unshrinker::new(uncomp_size);
    let mut bits = LsbReader::new(comp);
    let mut code_size = INITIAL_CODE_SIZE;
    let mut was_control = false;

    while state.out.len() < uncomp_size {
        if bits.remaining_bits() < code_size as usize {
            return Err(DosError::DataInvalid);
        }
        let code = bits.bits(code_size) as u16;

        if code == CONTROL {
            was_control = true;
            continue;
        }
        if was_control {
            was_control = false;
            match code {
                1 if code_size < MAX_CODE_SIZE => code_size += 1,
                2 => state.partial_clear(),
                _ => return Err(DosError::DataInvalid),
            }
            continue;
        }

        match state.old_code {
            None => state.emit(code)?,
            Some(old) if state.in_table(code) => {
                state.emit(code)?;
                state.add(old)?;
            }
            Some(old) => {
                state.add(old)?;
                state.emit(code)?;
            }
        }
        state.old_code = Some(code);
    }
    Ok(state.out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct BitWriter {
        out: Vec<u8>,
        buf: u32,
        cnt: u32,
    }

    impl BitWriter {
        fn new() -> Self {
            Self { out: Vec::new(), buf: 0, cnt: 0 }
        }

        fn put(&mut self, v: u32, n: u32) {
            self.buf |= v << self.cnt;
            self.cnt += n;
            while self.cnt >= 8 {
                self.out.push(self.buf as u8);
                self.buf >>= 8;
                self.cnt -= 8;
            }
        }

        fn finish(mut self) -> Vec<u8> {
            if self.cnt > 0 {
                self.out.push(self.buf as u8);
            }
            self.out
        }
    }

    /// Plain LZW; optionally announces a 10-bit code size up front.
    fn shrink(data: &[u8], wide: bool) -> Vec<u8> {
        let mut w = BitWriter::new();
        let mut size = 9;
        if wide {
            w.put(256, 9);
            w.put(1, 9);
            size = 10;
        }
        let mut dict: HashMap<Vec<u8>, u32> = HashMap::new();
        let mut next = 257;
        let code_of = |dict: &HashMap<Vec<u8>, u32>, s: &[u8]| if s.len() == 1 { s[0] as u32 } else { dict[s] };
        let mut cur: Vec<u8> = Vec::new();
        for &c in data {
            let mut ext = cur.clone();
            ext.push(c);
            if cur.is_empty() || dict.contains_key(&ext) {
                cur = ext;
            } else {
                w.put(code_of(&dict, &cur), size);
                dict.insert(ext, next);
                next += 1;
                cur = vec![c];
            }
        }
        w.put(code_of(&dict, &cur), size);
        w.finish()
    }

    #[test]
    fn test_unshrink_roundtrip() {
        let data = b"TOBEORNOTTOBEORTOBEORNOT#".repeat(4);
        let comp = shrink(&data, false);
        assert!(comp.len() < data.len());
        assert_eq!(unshrink(&comp, data.len()).unwrap(), data);
    }

    #[test]
    fn test_unshrink_kwkwk() {
        // "aaaa..." exercises codes that refer to themselves
        let data = vec![b'a'; 100];
        assert_eq!(unshrink(&shrink(&data, false), 100).unwrap(), data);
    }

    #[test]
    fn test_unshrink_code_size_increase() {
        let data = b"ABRACADABRA ABRACADABRA ABRACADABRA".to_vec();
        assert_eq!(unshrink(&shrink(&data, true), data.len()).unwrap(), data);
    }

    #[test]
    fn test_unshrink_truncated() {
        let data = b"some text that will be cut short".to_vec();
        let comp = shrink(&data, false);
        assert_eq!(unshrink(&comp[..comp.len() / 2], data.len()), Err(DosError::DataInvalid));
    }

    #[test]
    fn test_unshrink_bad_control() {
        let mut w = BitWriter::new();
        w.put(b'x' as u32, 9);
        w.put(256, 9);
        w.put(7, 9);
        assert_eq!(unshrink(&w.finish(), 4), Err(DosError::DataInvalid));
    }
}

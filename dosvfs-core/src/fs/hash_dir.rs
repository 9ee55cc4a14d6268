//! Open-addressing name table used for directory contents.
//!
//! - Keys are 32-bit FNV hashes of the name; two names with the same hash are the same key
//! - Linear probing over a power-of-two table that doubles at 50% load
//! - Removal shifts following entries back instead of leaving tombstones
//! - Slots can be visited by index, which drive searches use as a stable cursor

const FNV_OFFSET: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 0x01000193;

/// Hash a name, continuing from `init`.
pub fn hash_name_from(name: &[u8], init: u32) -> u32 {
    name.iter()
        .fold(init, |h, &b| h.wrapping_mul(FNV_PRIME) ^ b as u32)
}

/// Hash a name from the standard offset basis.
pub fn hash_name(name: &str) -> u32 {
    hash_name_from(name.as_bytes(), FNV_OFFSET)
}

fn slot_key(name: &str) -> u32 {
    match hash_name(name) {
        0 => 1,
        k => k,
    }
}

/// Name-keyed open-addressing map.
#[derive(Debug, Clone)]
pub struct HashDirectory<V> {
    len: u32,
    maxlen: u32,
    keys: Vec<u32>,
    vals: Vec<Option<V>>,
}

impl<V> Default for HashDirectory<V> {
    fn default() -> Self {
        Self {
            len: 0,
            maxlen: 0,
            keys: Vec::new(),
            vals: Vec::new(),
        }
    }
}

impl<V> HashDirectory<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots (0 before the first insert).
    pub fn capacity(&self) -> usize {
        self.keys.len()
    }

    fn find(&self, key: u32) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let mut i = key;
        loop {
            i &= self.maxlen;
            let k = self.keys[i as usize];
            if k == key {
                return Some(i as usize);
            }
            if k == 0 {
                return None;
            }
            i = i.wrapping_add(1);
        }
    }

    pub fn get(&self, name: &str) -> Option<&V> {
        self.find(slot_key(name))
            .and_then(|i| self.vals[i].as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut V> {
        match self.find(slot_key(name)) {
            Some(i) => self.vals[i].as_mut(),
            None => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(slot_key(name)).is_some()
    }

    /// Insert or replace, returning the previous value.
    pub fn put(&mut self, name: &str, val: V) -> Option<V> {
        if self.len * 2 >= self.maxlen {
            self.grow();
        }
        let key = slot_key(name);
        let mut i = key;
        loop {
            i &= self.maxlen;
            let slot = i as usize;
            if self.keys[slot] == 0 {
                self.len += 1;
                self.keys[slot] = key;
                self.vals[slot] = Some(val);
                return None;
            }
            if self.keys[slot] == key {
                return self.vals[slot].replace(val);
            }
            i = i.wrapping_add(1);
        }
    }

    /// Remove an entry, shifting later collision-chain members back into the hole.
    pub fn remove(&mut self, name: &str) -> Option<V> {
        let mut i = self.find(slot_key(name))? as u32;
        self.keys[i as usize] = 0;
        let removed = self.vals[i as usize].take();
        self.len -= 1;
        loop {
            i = (i + 1) & self.maxlen;
            let key = self.keys[i as usize];
            if key == 0 {
                break;
            }
            let mut j = key;
            loop {
                j &= self.maxlen;
                if self.keys[j as usize] == key {
                    break;
                }
                if self.keys[j as usize] == 0 {
                    self.keys[i as usize] = 0;
                    self.keys[j as usize] = key;
                    self.vals[j as usize] = self.vals[i as usize].take();
                    break;
                }
                j = j.wrapping_add(1);
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.keys.iter_mut().for_each(|k| *k = 0);
        self.vals.iter_mut().for_each(|v| *v = None);
        self.len = 0;
    }

    /// Value stored in slot `idx`, if occupied.
    pub fn get_at_index(&self, idx: usize) -> Option<&V> {
        self.vals.get(idx).and_then(|v| v.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &V> {
        self.vals.iter().filter_map(|v| v.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.vals.iter_mut().filter_map(|v| v.as_mut())
    }

    fn grow(&mut self) {
        let old_keys = std::mem::take(&mut self.keys);
        let old_vals = std::mem::take(&mut self.vals);
        self.maxlen = if self.maxlen != 0 { self.maxlen * 2 + 1 } else { 15 };
        let cap = self.maxlen as usize + 1;
        self.keys = vec![0; cap];
        self.vals = (0..cap).map(|_| None).collect();
        for (key, val) in old_keys.into_iter().zip(old_vals) {
            if key == 0 {
                continue;
            }
            let mut j = key;
            loop {
                j &= self.maxlen;
                if self.keys[j as usize] == 0 {
                    self.keys[j as usize] = key;
                    self.vals[j as usize] = val;
                    break;
                }
                j = j.wrapping_add(1);
            }
        }
    }
}

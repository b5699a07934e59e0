use super::heap::ObjRef;
use super::value::Value;

/// Probe slots never shrink, so deleted entries leave a tombstone
/// (key = None, value = true) to keep later probe sequences intact.
#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
}

const EMPTY: Entry = Entry {
    key: None,
    hash: 0,
    value: Value::Nil,
};

/// Open-addressed hash map from interned strings to values, with linear
/// probing. Keys compare by handle identity; the key's hash is passed in by
/// the caller (the heap knows it). `count` includes tombstones so probing
/// always terminates.
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Self {
            count: 0,
            entries: Vec::new(),
        }
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[Self::find_entry(&self.entries, key, hash)];
        entry.key.map(|_| entry.value)
    }

    /// Inserts or updates, returning true when the key was not present.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if self.count + 1 > self.entries.len() * 3 / 4 {
            self.grow();
        }

        let index = Self::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        if is_new && matches!(entry.value, Value::Nil) {
            self.count += 1;
        }
        *entry = Entry {
            key: Some(key),
            hash,
            value,
        };
        is_new
    }

    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        *entry = Entry {
            key: None,
            hash: 0,
            value: Value::Bool(true),
        };
        true
    }

    /// Content-based lookup used only by the intern pool: identity can't
    /// work before the string is interned, so this probes by hash and asks
    /// the caller to compare the bytes.
    pub fn find_string(&self, hash: u32, mut eq: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                Some(key) => {
                    if entry.hash == hash && eq(key) {
                        return Some(key);
                    }
                }
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return None;
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    /// Tombstones every entry whose key the GC left unmarked; this is what
    /// makes the intern pool a weak map.
    pub fn remove_unmarked(&mut self, mut is_marked: impl FnMut(ObjRef) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !is_marked(key) {
                    *entry = Entry {
                        key: None,
                        hash: 0,
                        value: Value::Bool(true),
                    };
                }
            }
        }
    }

    /// Returns the slot holding `key`, or the slot an insert should use: the
    /// first tombstone on the probe path if there was one, else the empty
    /// slot that ended it.
    fn find_entry(entries: &[Entry], key: ObjRef, hash: u32) -> usize {
        let capacity = entries.len();
        let mut index = hash as usize % capacity;
        let mut tombstone = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                Some(k) => {
                    if k == key {
                        return index;
                    }
                }
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return tombstone.unwrap_or(index);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self) {
        let capacity = if self.entries.len() < 8 {
            8
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![EMPTY; capacity]);

        // Tombstones are dropped on the way over, so recount live entries.
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = Self::find_entry(&self.entries, key, entry.hash);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }

    /// Rough footprint used by the heap's allocation accounting.
    pub fn byte_size(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<Entry>()
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn count(&self) -> usize {
        self.count
    }
}

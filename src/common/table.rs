use std::rc::Rc;

use crate::common::object::Str;
use crate::common::value::Value;

/// Grow once more than three quarters of the slots are live.
const MAX_LOAD: f64 = 0.75;

/// 32-bit FNV-1a. Used for every key the table hashes, and cached
/// on [`Str`] at allocation time.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Hashes a value for use as a table key.
/// Numbers hash their raw bits, strings carry a precomputed hash,
/// and other heap objects hash their address.
pub fn hash_value(value: &Value) -> u32 {
    match value {
        Value::Nil => fnv1a(&[]),
        Value::Bool(b) => *b as u32,
        Value::Number(n) => fnv1a(&n.to_bits().to_le_bytes()),
        Value::Str(s) => s.hash,
        Value::Function(f) => fnv1a(&(Rc::as_ptr(f) as usize).to_le_bytes()),
        Value::Native(n) => fnv1a(&(Rc::as_ptr(n) as usize).to_le_bytes()),
        Value::Closure(c) => fnv1a(&(Rc::as_ptr(c) as usize).to_le_bytes()),
    }
}

#[derive(Clone)]
struct Entry {
    key: Value,
    value: Value,
}

impl Entry {
    /// A slot that has never held a key.
    fn vacant() -> Entry {
        Entry {
            key: Value::Nil,
            value: Value::Nil,
        }
    }

    /// Deleted slots keep a marker so probe chains stay intact.
    fn is_tombstone(&self) -> bool {
        matches!(self.key, Value::Nil) && matches!(self.value, Value::Bool(true))
    }
}

/// A linear-probing open-addressed hash table from values to
/// values. The VM uses one for globals (keyed by interned name)
/// and the heap uses one as the string-intern set.
///
/// A nil key marks an empty slot, so nil itself can never be used
/// as a key.
pub struct Table {
    /// Live entries plus tombstones.
    count: usize,
    /// Always empty or a power of two long.
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    /// Finds the slot `key` lives in, or the slot it would be
    /// inserted into: the first tombstone seen on the probe chain
    /// if there was one, otherwise the first truly empty slot.
    fn find_slot(entries: &[Entry], key: &Value) -> usize {
        let mask = entries.len() - 1;
        let mut index = hash_value(key) as usize & mask;
        let mut tombstone = None;

        loop {
            let entry = &entries[index];
            if let Value::Nil = entry.key {
                if entry.is_tombstone() {
                    tombstone.get_or_insert(index);
                } else {
                    return tombstone.unwrap_or(index);
                }
            } else if entry.key == *key {
                return index;
            }
            index = (index + 1) & mask;
        }
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        if self.entries.is_empty() {
            return None;
        }
        let entry = &self.entries[Table::find_slot(&self.entries, key)];
        match entry.key {
            Value::Nil => None,
            _ => Some(&entry.value),
        }
    }

    /// Inserts or overwrites. Returns true when the key was new.
    pub fn set(&mut self, key: Value, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * MAX_LOAD {
            self.grow();
        }

        let index = Table::find_slot(&self.entries, &key);
        let entry = &mut self.entries[index];
        let is_new = matches!(entry.key, Value::Nil);
        // a reused tombstone was already counted
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        *entry = Entry { key, value };
        is_new
    }

    /// Removes a key, leaving a tombstone. Returns true when the
    /// key was present.
    pub fn delete(&mut self, key: &Value) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Table::find_slot(&self.entries, key);
        let entry = &mut self.entries[index];
        if let Value::Nil = entry.key {
            return false;
        }
        *entry = Entry {
            key: Value::Nil,
            value: Value::Bool(true),
        };
        true
    }

    /// Looks up an interned string by raw content and hash,
    /// without allocating. This is the intern set's fast path:
    /// content comparison happens here and nowhere else.
    pub fn find_str(&self, text: &str, hash: u32) -> Option<Rc<Str>> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;

        loop {
            let entry = &self.entries[index];
            match &entry.key {
                Value::Nil if !entry.is_tombstone() => return None,
                Value::Str(s) if s.hash == hash && &*s.text == text => {
                    return Some(s.clone());
                }
                _ => {}
            }
            index = (index + 1) & mask;
        }
    }

    /// Doubles the backing array and rehashes every live entry.
    /// Tombstones are dropped along the way.
    fn grow(&mut self) {
        let capacity = (self.entries.len() * 2).max(8);
        let old = std::mem::replace(&mut self.entries, vec![Entry::vacant(); capacity]);

        self.count = 0;
        for entry in old {
            if let Value::Nil = entry.key {
                continue;
            }
            let index = Table::find_slot(&self.entries, &entry.key);
            self.entries[index] = entry;
            self.count += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;

    fn key(n: f64) -> Value {
        Value::Number(n)
    }

    #[test]
    fn missing_from_empty() {
        let table = Table::new();
        assert!(table.get(&key(1.0)).is_none());
    }

    #[test]
    fn set_get_overwrite() {
        let mut table = Table::new();
        assert!(table.set(key(1.0), Value::Bool(true)));
        assert!(!table.set(key(1.0), Value::Bool(false)));
        assert_eq!(table.get(&key(1.0)), Some(&Value::Bool(false)));
    }

    #[test]
    fn delete_then_reinsert() {
        let mut table = Table::new();
        table.set(key(1.0), Value::Bool(true));
        assert!(table.delete(&key(1.0)));
        assert!(!table.delete(&key(1.0)));
        assert!(table.get(&key(1.0)).is_none());
        // the tombstone is reused, and the key counts as new again
        assert!(table.set(key(1.0), Value::Nil));
    }

    #[test]
    fn survives_growth() {
        let mut table = Table::new();
        for i in 0..100 {
            table.set(key(i as f64), Value::Number(i as f64 * 2.0));
        }
        for i in 0..100 {
            assert_eq!(table.get(&key(i as f64)), Some(&Value::Number(i as f64 * 2.0)));
        }
    }

    #[test]
    fn probing_steps_over_tombstones() {
        // insert enough colliding-ish keys that chains form, then
        // delete from the middle and make sure later links survive
        let mut table = Table::new();
        for i in 0..32 {
            table.set(key(i as f64), Value::Number(i as f64));
        }
        for i in (0..32).step_by(3) {
            table.delete(&key(i as f64));
        }
        for i in 0..32 {
            let expected = (i % 3 != 0).then(|| Value::Number(i as f64));
            assert_eq!(table.get(&key(i as f64)).cloned(), expected);
        }
    }

    #[test]
    fn find_str_matches_content() {
        let a = Rc::new(Str::new("alpha"));
        let mut table = Table::new();
        table.set(Value::Str(a.clone()), Value::Nil);

        let hash = fnv1a(b"alpha");
        let found = table.find_str("alpha", hash).unwrap();
        assert!(Rc::ptr_eq(&a, &found));
        assert!(table.find_str("omega", fnv1a(b"omega")).is_none());
    }

    proptest! {
        #[test]
        fn behaves_like_a_map(ops in prop::collection::vec((0u8..3, 0i64..50, -100i64..100), 0..400)) {
            let mut table = Table::new();
            let mut model: HashMap<i64, i64> = HashMap::new();

            for (op, k, v) in ops {
                match op {
                    0 => {
                        let new = table.set(key(k as f64), Value::Number(v as f64));
                        prop_assert_eq!(new, model.insert(k, v).is_none());
                    }
                    1 => {
                        let removed = table.delete(&key(k as f64));
                        prop_assert_eq!(removed, model.remove(&k).is_some());
                    }
                    _ => {
                        let got = table.get(&key(k as f64)).cloned();
                        let expected = model.get(&k).map(|v| Value::Number(*v as f64));
                        prop_assert_eq!(got, expected);
                    }
                }
            }
        }
    }
}

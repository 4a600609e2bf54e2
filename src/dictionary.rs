//! String interning with insertion-order-stable 32-bit ids.
//!
//! Id 0 is reserved as the null reference in the recording format, so the
//! first interned string gets id 1. The recorder drains dictionaries into
//! per-chunk constant pools via `collect`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

pub struct Dictionary {
    map: Mutex<HashMap<String, u32>>,
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl Dictionary {
    pub fn new() -> Self {
        Dictionary {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, s: &str) -> u32 {
        let mut map = self.map.lock().unwrap();
        let next = map.len() as u32 + 1;
        *map.entry(s.to_string()).or_insert(next)
    }

    /// Like `lookup`, but refuses to grow past `limit` entries; returns
    /// `u32::MAX` when the string is absent and the dictionary is full.
    pub fn bounded_lookup(&self, s: &str, limit: usize) -> u32 {
        let mut map = self.map.lock().unwrap();
        if let Some(id) = map.get(s) {
            return *id;
        }
        if map.len() >= limit {
            return u32::MAX;
        }
        let id = map.len() as u32 + 1;
        map.insert(s.to_string(), id);
        id
    }

    pub fn size(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    /// Snapshot every entry, keyed by id.
    pub fn collect(&self, out: &mut BTreeMap<u32, String>) {
        let map = self.map.lock().unwrap();
        for (s, id) in map.iter() {
            out.insert(*id, s.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one_and_are_stable() {
        let dict = Dictionary::new();
        let a = dict.lookup("alpha");
        let b = dict.lookup("beta");
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(dict.lookup("alpha"), a);
        assert_eq!(dict.size(), 2);
    }

    #[test]
    fn test_bounded_lookup_saturates() {
        let dict = Dictionary::new();
        assert_eq!(dict.bounded_lookup("a", 2), 1);
        assert_eq!(dict.bounded_lookup("b", 2), 2);
        assert_eq!(dict.bounded_lookup("c", 2), u32::MAX);
        // Existing entries still resolve once full.
        assert_eq!(dict.bounded_lookup("a", 2), 1);
    }

    #[test]
    fn test_collect_orders_by_id() {
        let dict = Dictionary::new();
        dict.lookup("one");
        dict.lookup("two");
        dict.lookup("three");
        let mut out = BTreeMap::new();
        dict.collect(&mut out);
        let names: Vec<_> = out.values().cloned().collect();
        assert_eq!(names, vec!["one", "two", "three"]);
    }
}

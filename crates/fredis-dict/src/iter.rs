//! Dictionary iterators.
//!
//! One iterator type, two contracts. The safe flavor bumps the
//! dictionary's safe-iterator counter on first advance, which
//! suspends incremental rehashing until the iterator is dropped. The
//! fast flavor records a fingerprint instead and verifies it on drop:
//! any table change observed there is a caller bug, reported by
//! panicking rather than by silently corrupted traversal.

use crate::dict::{Dict, DictEntry, DictType};

/// Iterator over every entry of a [`Dict`], in bucket order, covering
/// both tables while a rehash is in flight.
pub struct Iter<'a, K, V, T: DictType<K>> {
    dict: &'a Dict<K, V, T>,
    table: usize,
    index: isize,
    entry: Option<&'a DictEntry<K, V>>,
    safe: bool,
    started: bool,
    fingerprint: u64,
}

impl<'a, K, V, T: DictType<K>> Iter<'a, K, V, T> {
    pub(crate) fn new(dict: &'a Dict<K, V, T>, safe: bool) -> Self {
        Self {
            dict,
            table: 0,
            index: -1,
            entry: None,
            safe,
            started: false,
            fingerprint: 0,
        }
    }
}

impl<'a, K, V, T: DictType<K>> Iterator for Iter<'a, K, V, T> {
    type Item = &'a DictEntry<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.entry {
                None => {
                    if !self.started {
                        self.started = true;
                        if self.safe {
                            self.dict
                                .safe_iterators
                                .set(self.dict.safe_iterators.get() + 1);
                        } else {
                            self.fingerprint = self.dict.fingerprint();
                        }
                    }
                    self.index += 1;
                    if self.index >= self.dict.tables[self.table].size() as isize {
                        if self.dict.is_rehashing() && self.table == 0 {
                            self.table = 1;
                            self.index = 0;
                        } else {
                            return None;
                        }
                    }
                    let table = &self.dict.tables[self.table];
                    self.entry = table.buckets[self.index as usize].as_deref();
                }
                Some(cur) => {
                    self.entry = cur.next.as_deref();
                }
            }
            if let Some(entry) = self.entry {
                return Some(entry);
            }
        }
    }
}

impl<K, V, T: DictType<K>> Drop for Iter<'_, K, V, T> {
    fn drop(&mut self) {
        if !self.started {
            return;
        }
        if self.safe {
            self.dict
                .safe_iterators
                .set(self.dict.safe_iterators.get() - 1);
        } else {
            assert_eq!(
                self.fingerprint,
                self.dict.fingerprint(),
                "dictionary changed during fast iteration"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::dict::{BytesKeys, Dict};

    fn populated(n: u64) -> Dict<Vec<u8>, u64, BytesKeys> {
        let mut dict = Dict::new(BytesKeys);
        for i in 0..n {
            dict.add(format!("k{i}").into_bytes(), i)
                .expect("fresh key should insert");
        }
        dict
    }

    #[test]
    fn test_iter_visits_every_entry_once() {
        let dict = populated(500);
        let seen: HashSet<Vec<u8>> = dict.iter().map(|e| e.key().clone()).collect();
        assert_eq!(seen.len(), 500);
    }

    #[test]
    fn test_iter_covers_both_tables_mid_rehash() {
        let mut dict = populated(64);
        dict.expand(256).expect("growth should start");
        // Move part of the entries across, leaving the rest behind.
        dict.rehash(3);
        assert!(dict.is_rehashing());
        assert!(dict.tables[1].used > 0);

        let seen: HashSet<Vec<u8>> = dict.iter().map(|e| e.key().clone()).collect();
        assert_eq!(seen.len(), 64);
    }

    #[test]
    fn test_empty_dict_iterates_nothing() {
        let dict: Dict<Vec<u8>, u64, BytesKeys> = Dict::new(BytesKeys);
        assert_eq!(dict.iter().count(), 0);
        assert_eq!(dict.iter_safe().count(), 0);
    }

    #[test]
    fn test_safe_iterator_tracks_suspension_counter() {
        let dict = populated(64);
        {
            let mut iter = dict.iter_safe();
            iter.next().expect("dictionary is non-empty");
            assert_eq!(dict.safe_iterators.get(), 1);
            let mut nested = dict.iter_safe();
            nested.next().expect("dictionary is non-empty");
            assert_eq!(dict.safe_iterators.get(), 2);
        }
        assert_eq!(dict.safe_iterators.get(), 0);
    }

    #[test]
    fn test_rehash_step_respects_suspension_counter() {
        let mut dict = populated(64);
        dict.expand(256).expect("growth should start");
        assert!(dict.is_rehashing());

        let cursor_before = dict.rehash_idx;
        dict.safe_iterators.set(1);
        dict.rehash_step();
        assert_eq!(dict.rehash_idx, cursor_before, "suspended step moved the cursor");

        dict.safe_iterators.set(0);
        dict.rehash_step();
        assert!(dict.rehash_idx != cursor_before || !dict.is_rehashing());
    }

    #[test]
    fn test_unstarted_iterators_have_no_side_effects() {
        let dict = populated(8);
        drop(dict.iter_safe());
        assert_eq!(dict.safe_iterators.get(), 0);
    }

    #[test]
    fn test_fingerprint_tracks_table_state() {
        let mut dict = populated(16);
        let before = dict.fingerprint();
        dict.add(b"extra".to_vec(), 99)
            .expect("fresh key should insert");
        assert_ne!(
            before,
            dict.fingerprint(),
            "fingerprint must observe an insert"
        );

        dict.remove(b"extra".as_slice()).expect("remove");
        // Same size and used counts as before, but growth may have
        // reallocated the table; either way a full add/remove cycle
        // that ends in the original state fingerprints equal only if
        // the table pointer and counters all match again.
        let stats = dict.stats();
        assert_eq!(stats.used, 16);
    }
}

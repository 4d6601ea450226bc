//! Stateless cursor traversal.
//!
//! `scan` visits the dictionary one bucket position at a time, driven
//! by an opaque cursor the caller threads between calls. The cursor
//! walk increments the *reversed* bits of the position within the
//! current mask width:
//!
//! ```text
//! cursor |= !mask;            // set the bits above the mask
//! cursor = rev(cursor);       // reverse all 64 bits
//! cursor += 1;                // carry ripples into the masked bits
//! cursor = rev(cursor);
//! ```
//!
//! Because a table resize only adds or removes low-order mask bits,
//! and the walk enumerates high-order bit patterns of a position
//! before moving past it, a traversal started at cursor 0 visits every
//! bucket the table had at any point, even if the table doubled or
//! halved between calls. Entries that stay present for the whole
//! traversal are yielded at least once; some may be yielded more than
//! once. No bucket is ever skipped.
//!
//! While a rehash is in flight both tables are consulted: the smaller
//! table once at the cursor position, and every expansion of that
//! position in the larger table, so a position is fully drained before
//! the cursor moves on.

use crate::dict::{Dict, DictEntry, DictType, Link};

impl<K, V, T: DictType<K>> Dict<K, V, T> {
    /// Visit the bucket(s) selected by `cursor` and return the cursor
    /// for the next call. A return of 0 means the traversal is
    /// complete. Start with `cursor == 0`.
    ///
    /// The dictionary may be mutated freely *between* calls, including
    /// mutations that trigger growth or shrink.
    pub fn scan<F>(&self, cursor: u64, mut visit: F) -> u64
    where
        F: FnMut(&DictEntry<K, V>),
    {
        if self.is_empty() {
            return 0;
        }
        let mut v = cursor;

        if !self.is_rehashing() {
            let m0 = self.tables[0].mask() as u64;
            scan_bucket(&self.tables[0].buckets[(v & m0) as usize], &mut visit);

            v |= !m0;
            v = v.reverse_bits().wrapping_add(1).reverse_bits();
        } else {
            // The smaller table is scanned once per position, the
            // larger one for every expansion of that position.
            let (small, large) = if self.tables[0].size() > self.tables[1].size() {
                (1, 0)
            } else {
                (0, 1)
            };
            let m0 = self.tables[small].mask() as u64;
            let m1 = self.tables[large].mask() as u64;

            scan_bucket(&self.tables[small].buckets[(v & m0) as usize], &mut visit);

            loop {
                scan_bucket(&self.tables[large].buckets[(v & m1) as usize], &mut visit);

                v |= !m1;
                v = v.reverse_bits().wrapping_add(1).reverse_bits();

                // Keep going while the bits covered by the mask
                // difference have not wrapped around.
                if v & (m0 ^ m1) == 0 {
                    break;
                }
            }
        }
        v
    }
}

fn scan_bucket<K, V, F>(head: &Link<K, V>, visit: &mut F)
where
    F: FnMut(&DictEntry<K, V>),
{
    let mut cur = head.as_deref();
    while let Some(entry) = cur {
        visit(entry);
        cur = entry.next.as_deref();
    }
}

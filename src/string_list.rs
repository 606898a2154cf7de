use std::collections::HashMap;

/// String deduplication table for one packet stream.
///
/// Every string written to a stream is interned here and referenced by a
/// compact 1-based index from then on, so repeated strings (category names,
/// thread names, user names) occupy stream space exactly once. The writer and
/// reader each maintain their own copy; because both sides add strings in
/// arrival order, the indices line up without any negotiation.
///
/// Unlike a plain interning map, the table is transactional: a packet that
/// fails mid-serialization may already have added strings that were never
/// flushed. `rollback()` reverts to the last committed size so the table
/// never disagrees with what earlier packets put on the wire.
///
/// # Examples
///
/// ```
/// # use telemetry_pipeline::string_list::UniqueStringList;
/// let mut list = UniqueStringList::new();
///
/// let (first, is_new) = list.intern("Example");
/// assert!(is_new);
///
/// // Interning again returns the same index without growing the table.
/// let (again, is_new) = list.intern("Example");
/// assert_eq!(first, again);
/// assert!(!is_new);
/// ```
#[derive(Debug, Default)]
pub struct UniqueStringList {
    strings: Vec<String>,
    index: HashMap<String, u32>,
    committed_len: usize,
}

impl UniqueStringList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of strings currently in the table, committed or not.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Interns `value`, returning its 1-based index and whether it was new.
    pub fn intern(&mut self, value: &str) -> (u32, bool) {
        if let Some(&existing) = self.index.get(value) {
            return (existing, false);
        }
        let assigned = self.add(value);
        (assigned, true)
    }

    /// Appends `value` unconditionally and returns its 1-based index.
    ///
    /// This is the reader-side entry point: the reader learns strings in
    /// arrival order and must assign the same indices the writer did, even if
    /// a hostile stream repeats a string.
    pub fn add(&mut self, value: &str) -> u32 {
        self.strings.push(value.to_owned());
        let assigned = self.strings.len() as u32;
        self.index.entry(value.to_owned()).or_insert(assigned);
        assigned
    }

    /// Looks up a string by its 1-based index.
    pub fn get(&self, index: u32) -> Option<&str> {
        if index == 0 {
            return None;
        }
        self.strings.get(index as usize - 1).map(String::as_str)
    }

    /// Latches the current size as known-good.
    ///
    /// Call after the packet that introduced the most recent strings has been
    /// durably written.
    pub fn commit(&mut self) {
        self.committed_len = self.strings.len();
    }

    /// Reverts the table to the last committed size.
    pub fn rollback(&mut self) {
        while self.strings.len() > self.committed_len {
            // unwrap is safe: the loop condition guarantees non-empty.
            let removed = self.strings.pop().unwrap();
            if let Some(&mapped) = self.index.get(&removed) {
                // Only drop the map entry if it pointed at the popped slot;
                // an earlier committed duplicate keeps its index.
                if mapped as usize == self.strings.len() + 1 {
                    self.index.remove(&removed);
                }
            }
        }
    }
}

//! Bounded command history (§4.11/§6): a 20-entry circular buffer,
//! persisted to `/.mos_history` by rewriting the whole file in insertion
//! order on every append — not appended to, since a later `history` read
//! depends on the file holding exactly the ring's current contents.
use alloc::string::{String, ToString};
use alloc::vec::Vec;

/// Number of entries the ring holds before it starts overwriting the
/// oldest.
pub const CAPACITY: usize = 20;

/// The path the history is persisted to.
pub const HISTORY_FILE: &str = "/.mos_history";

/// A fixed-capacity circular history buffer.
#[derive(Debug, Default)]
pub struct History {
    entries: Vec<String>,
    next_slot: usize,
}

impl History {
    /// An empty history.
    #[must_use]
    pub fn new() -> Self {
        History {
            entries: Vec::new(),
            next_slot: 0,
        }
    }

    /// Records `line`. Whitespace-only lines are read (the line editor
    /// still hands them here) but not stored, matching the original's
    /// "purely-whitespace line is still read but not recorded" behavior.
    /// Returns `true` if the line was stored.
    pub fn record(&mut self, line: &str) -> bool {
        if line.trim().is_empty() {
            return false;
        }
        if self.entries.len() < CAPACITY {
            self.entries.push(line.to_string());
            self.next_slot = self.entries.len() % CAPACITY;
        } else {
            self.entries[self.next_slot] = line.to_string();
            self.next_slot = (self.next_slot + 1) % CAPACITY;
        }
        true
    }

    /// Entries in insertion order, oldest first. Exactly what gets
    /// replayed into `/.mos_history` and what `history` prints.
    #[must_use]
    pub fn in_order(&self) -> Vec<&str> {
        if self.entries.len() < CAPACITY {
            self.entries.iter().map(String::as_str).collect()
        } else {
            let mut out = Vec::with_capacity(CAPACITY);
            for i in 0..CAPACITY {
                let idx = (self.next_slot + i) % CAPACITY;
                out.push(self.entries[idx].as_str());
            }
            out
        }
    }

    /// Renders the file contents `record` should cause to be written:
    /// every entry, newline-separated, oldest first.
    #[must_use]
    pub fn render_file(&self) -> String {
        let mut out = String::new();
        for entry in self.in_order() {
            out.push_str(entry);
            out.push('\n');
        }
        out
    }

    /// The entry `offset` steps back from the most recent (`1` is the last
    /// command run), or `None` past the start of history. Used by the line
    /// editor's up/down history walk.
    #[must_use]
    pub fn back(&self, offset: usize) -> Option<&str> {
        if offset == 0 || offset > self.entries.len() {
            return None;
        }
        let order = self.in_order();
        order.get(order.len() - offset).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_only_lines_are_not_recorded() {
        let mut h = History::new();
        assert!(!h.record("   "));
        assert!(h.in_order().is_empty());
    }

    #[test]
    fn records_in_insertion_order() {
        let mut h = History::new();
        h.record("a");
        h.record("b");
        h.record("c");
        assert_eq!(h.in_order(), alloc::vec!["a", "b", "c"]);
    }

    #[test]
    fn wraps_after_capacity_entries() {
        let mut h = History::new();
        for i in 0..CAPACITY + 3 {
            h.record(&alloc::format!("cmd{i}"));
        }
        let order = h.in_order();
        assert_eq!(order.len(), CAPACITY);
        assert_eq!(order[0], "cmd3");
        assert_eq!(order[CAPACITY - 1], alloc::format!("cmd{}", CAPACITY + 2));
    }

    #[test]
    fn render_file_is_newline_separated_oldest_first() {
        let mut h = History::new();
        h.record("a");
        h.record("b");
        assert_eq!(h.render_file(), "a\nb\n");
    }

    #[test]
    fn back_walks_from_most_recent() {
        let mut h = History::new();
        h.record("a");
        h.record("b");
        assert_eq!(h.back(1), Some("b"));
        assert_eq!(h.back(2), Some("a"));
        assert_eq!(h.back(3), None);
    }
}

/*
 * list.rs
 *
 * Sorted watch list: the membership structure behind timeouts (keyed by
 * deadline), process watchers (keyed by PID) and signal watchers (keyed by
 * signo). Insertion walks from the front and places the new entry before
 * the first strictly greater key, so equal keys keep FIFO order - expired
 * timers with the same deadline fire in the order they were armed.
 *
 * Linked in the C sense means "present here"; the arena slot carries the
 * payload. Lists stay small (tens of entries), the linear walk is fine.
 */

use crate::slab::Index;

pub(crate) struct WatchList<K> {
    items: Vec<(Index, K)>,
}

impl<K: Ord + Copy> WatchList<K> {
    pub(crate) const fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Insert keeping ascending key order; ties go after existing equals.
    pub(crate) fn insert(&mut self, index: Index, key: K) {
        let pos = self
            .items
            .iter()
            .position(|&(_, k)| k > key)
            .unwrap_or(self.items.len());
        self.items.insert(pos, (index, key));
    }

    /// Unlink by index. Returns false when the index was not linked.
    pub(crate) fn remove(&mut self, index: Index) -> bool {
        match self.items.iter().position(|&(i, _)| i == index) {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Head entry - the next timer to fire / lowest PID / lowest signo.
    pub(crate) fn first(&self) -> Option<(Index, K)> {
        self.items.first().copied()
    }

    /// All entries matching `key`, in list order.
    ///
    /// Walks with the ordering shortcut: skips lower keys, stops at the
    /// first greater one.
    pub(crate) fn matches(&self, key: K) -> Vec<Index> {
        let mut out = Vec::new();
        for &(index, k) in &self.items {
            if k < key {
                continue;
            }
            if k > key {
                break;
            }
            out.push(index);
        }
        out
    }

    /// Snapshot of every linked index, in key order.
    pub(crate) fn indices(&self) -> Vec<Index> {
        self.items.iter().map(|&(i, _)| i).collect()
    }

    /* test support: the raw key sequence */
    #[cfg(test)]
    pub(crate) fn keys(&self) -> Vec<K> {
        self.items.iter().map(|&(_, k)| k).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::Slab;

    fn idx(slab: &mut Slab<u8>) -> Index {
        slab.insert(0)
    }

    #[test]
    fn test_insert_keeps_ascending_order() {
        let mut slab = Slab::new();
        let mut list: WatchList<i64> = WatchList::new();
        list.insert(idx(&mut slab), 30);
        list.insert(idx(&mut slab), 10);
        list.insert(idx(&mut slab), 20);
        assert_eq!(list.keys(), vec![10, 20, 30]);
    }

    #[test]
    fn test_equal_keys_fifo() {
        let mut slab = Slab::new();
        let mut list: WatchList<i64> = WatchList::new();
        let a = idx(&mut slab);
        let b = idx(&mut slab);
        let c = idx(&mut slab);
        list.insert(a, 10);
        list.insert(b, 10);
        list.insert(c, 5);
        assert_eq!(list.indices(), vec![c, a, b]);
    }

    #[test]
    fn test_remove_unlinks() {
        let mut slab = Slab::new();
        let mut list: WatchList<i64> = WatchList::new();
        let a = idx(&mut slab);
        list.insert(a, 1);
        assert!(list.remove(a));
        assert!(!list.remove(a));
        assert!(list.keys().is_empty());
    }

    #[test]
    fn test_matches_exact_key_only() {
        let mut slab = Slab::new();
        let mut list: WatchList<i32> = WatchList::new();
        let a = idx(&mut slab);
        let b = idx(&mut slab);
        let c = idx(&mut slab);
        list.insert(a, 100);
        list.insert(b, 200);
        list.insert(c, 200);
        assert_eq!(list.matches(200), vec![b, c]);
        assert_eq!(list.matches(150), Vec::<Index>::new());
    }

    #[test]
    fn test_first_is_lowest_key() {
        let mut slab = Slab::new();
        let mut list: WatchList<i64> = WatchList::new();
        let a = idx(&mut slab);
        let b = idx(&mut slab);
        list.insert(a, 7);
        list.insert(b, 3);
        assert_eq!(list.first(), Some((b, 3)));
        list.remove(b);
        assert_eq!(list.first(), Some((a, 7)));
        list.remove(a);
        assert_eq!(list.first(), None);
    }
}

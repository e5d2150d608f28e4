//! Fixed-length tile change bitmap.

/// One bit per tile, set when that tile differed from the previous
/// sample. Cloning produces an independent snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangeSet {
    words: Vec<u64>,
    len: usize,
}

impl ChangeSet {
    /// A set of `len` cleared bits.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// A set of `len` bits, all set. Used to force a full render.
    pub fn filled(len: usize) -> Self {
        let mut set = Self::new(len);
        set.fill(true);
        set
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Panics
    ///
    /// Panics if `idx >= len`.
    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of range ({})", self.len);
        let mask = 1u64 << (idx % 64);
        if value {
            self.words[idx / 64] |= mask;
        } else {
            self.words[idx / 64] &= !mask;
        }
    }

    pub fn get(&self, idx: usize) -> bool {
        idx < self.len && self.words[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    pub fn fill(&mut self, value: bool) {
        let word = if value { u64::MAX } else { 0 };
        self.words.iter_mut().for_each(|w| *w = word);
        // Keep bits past `len` clear so `count`/`any` stay exact.
        if value && self.len % 64 != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << (self.len % 64)) - 1;
            }
        }
    }

    /// Whether any bit is set.
    pub fn any(&self) -> bool {
        self.words.iter().any(|&w| w != 0)
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Indices of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(wi * 64 + bit)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_and_iterate() {
        let mut set = ChangeSet::new(130);
        set.set(0, true);
        set.set(64, true);
        set.set(129, true);
        assert!(set.get(64));
        assert!(!set.get(65));
        assert_eq!(set.iter_ones().collect::<Vec<_>>(), vec![0, 64, 129]);
        set.set(64, false);
        assert_eq!(set.count(), 2);
    }

    #[test]
    fn filled_counts_exactly_len() {
        let set = ChangeSet::filled(70);
        assert_eq!(set.count(), 70);
        assert_eq!(set.iter_ones().last(), Some(69));
    }

    #[test]
    fn snapshot_is_independent() {
        let mut live = ChangeSet::new(8);
        live.set(3, true);
        let snapshot = live.clone();
        live.fill(false);
        assert!(!live.any());
        assert!(snapshot.get(3));
    }

    #[test]
    fn empty_set() {
        let set = ChangeSet::filled(0);
        assert!(set.is_empty());
        assert!(!set.any());
        assert_eq!(set.iter_ones().count(), 0);
    }
}

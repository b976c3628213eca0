//! Core identifiers and fixed-width core sets.

use core::fmt;
use kernel_info::memory::MAX_CORES;

/// Index of a logical core, `0..MAX_CORES`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CoreId(u8);

impl CoreId {
    /// Returns `None` if `index` is not below [`MAX_CORES`].
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(index: usize) -> Option<Self> {
        if index < MAX_CORES {
            Some(Self(index as u8))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    const fn bit(self) -> u64 {
        1 << self.0
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// A set of cores, one bit per [`CoreId`].
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct CoreSet(u64);

impl CoreSet {
    pub const EMPTY: Self = Self(0);

    /// The first `count` cores (`cpu0..cpu{count-1}`), clamped to [`MAX_CORES`].
    #[must_use]
    pub const fn first(count: usize) -> Self {
        if count >= MAX_CORES {
            Self(u64::MAX >> (u64::BITS as usize - MAX_CORES))
        } else {
            Self((1 << count) - 1)
        }
    }

    #[must_use]
    pub const fn single(core: CoreId) -> Self {
        Self(core.bit())
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    #[must_use]
    pub const fn contains(self, core: CoreId) -> bool {
        self.0 & core.bit() != 0
    }

    /// Adds `core`; returns whether it was newly inserted.
    pub const fn insert(&mut self, core: CoreId) -> bool {
        let was = self.contains(core);
        self.0 |= core.bit();
        !was
    }

    /// Removes `core`; returns whether it was present.
    pub const fn remove(&mut self, core: CoreId) -> bool {
        let was = self.contains(core);
        self.0 &= !core.bit();
        was
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Iterate members in ascending order.
    pub fn iter(self) -> impl Iterator<Item = CoreId> {
        let mut rest = self.0;
        core::iter::from_fn(move || {
            if rest == 0 {
                return None;
            }
            let idx = rest.trailing_zeros();
            rest &= rest - 1;
            CoreId::new(idx as usize)
        })
    }
}

impl FromIterator<CoreId> for CoreSet {
    fn from_iter<I: IntoIterator<Item = CoreId>>(iter: I) -> Self {
        let mut set = Self::EMPTY;
        for core in iter {
            set.insert(core);
        }
        set
    }
}

impl fmt::Debug for CoreSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(CoreId::index)).finish()
    }
}

impl fmt::Display for CoreSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, core) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", core.index())?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(i: usize) -> CoreId {
        CoreId::new(i).unwrap()
    }

    #[test]
    fn insert_remove_contains() {
        let mut s = CoreSet::EMPTY;
        assert!(s.insert(c(3)));
        assert!(!s.insert(c(3)));
        assert!(s.contains(c(3)));
        assert!(!s.contains(c(2)));
        assert!(s.remove(c(3)));
        assert!(!s.remove(c(3)));
        assert!(s.is_empty());
    }

    #[test]
    fn iterates_in_order() {
        let s: CoreSet = [c(63), c(0), c(7)].into_iter().collect();
        let got: Vec<_> = s.iter().map(CoreId::index).collect();
        assert_eq!(got, vec![0, 7, 63]);
        assert_eq!(s.len(), 3);
        assert_eq!(format!("{s}"), "{0,7,63}");
    }

    #[test]
    fn first_n_and_set_algebra() {
        assert_eq!(CoreSet::first(4).bits(), 0b1111);
        assert_eq!(CoreSet::first(64).len(), 64);
        let a = CoreSet::first(4);
        let b = CoreSet::single(c(1)).union(CoreSet::single(c(9)));
        assert_eq!(a.intersection(b), CoreSet::single(c(1)));
        assert_eq!(a.difference(b).bits(), 0b1101);
    }

    #[test]
    fn core_id_bounds() {
        assert!(CoreId::new(MAX_CORES - 1).is_some());
        assert!(CoreId::new(MAX_CORES).is_none());
    }
}

/// Generational index of a [`Slab`] entry. A key becomes stale once its entry
/// is removed, even if the slot is later reused.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct SlabKey {
    idx: u16,
    gen: u16,
}

impl SlabKey {
    /// Returns the slot index.
    #[inline(always)]
    #[must_use]
    pub const fn index(self) -> u16 {
        self.idx
    }
}

/// Fixed-capacity arena. Running out of slots is reported to the caller
/// instead of growing the arena.
#[derive(Debug)]
pub(crate) struct Slab<T> {
    v: Vec<Slot<T>>,
    free: Vec<u16>,
    len: usize,
}

#[derive(Debug)]
enum Slot<T> {
    Vacant(u16),
    Occupied(u16, T),
}

impl<T> Slab<T> {
    /// Creates an arena with space for `cap` entries.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.min(usize::from(u16::MAX));
        Self {
            v: (0..cap).map(|_| Slot::Vacant(0)).collect(),
            free: (0..cap as u16).rev().collect(),
            len: 0,
        }
    }

    /// Returns the number of occupied entries.
    #[inline(always)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether there are no occupied entries.
    #[inline(always)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns whether all slots are occupied.
    #[inline(always)]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Inserts a new entry, returning its key, or gives `v` back if the arena
    /// is full.
    pub fn insert(&mut self, v: T) -> Result<SlabKey, T> {
        let Some(idx) = self.free.pop() else { return Err(v) };
        let s = &mut self.v[usize::from(idx)];
        let gen = match *s {
            Slot::Vacant(gen) => gen,
            Slot::Occupied(..) => unreachable!("occupied slot in the free list"),
        };
        *s = Slot::Occupied(gen, v);
        self.len += 1;
        Ok(SlabKey { idx, gen })
    }

    /// Removes the entry for key `k`.
    pub fn remove(&mut self, k: SlabKey) -> Option<T> {
        let s = self.v.get_mut(usize::from(k.idx))?;
        if !matches!(*s, Slot::Occupied(gen, _) if gen == k.gen) {
            return None;
        }
        let Slot::Occupied(_, v) = std::mem::replace(s, Slot::Vacant(k.gen.wrapping_add(1))) else {
            unreachable!()
        };
        self.free.push(k.idx);
        self.len -= 1;
        Some(v)
    }

    /// Returns whether `k` refers to an occupied entry.
    #[inline]
    #[must_use]
    pub fn contains(&self, k: SlabKey) -> bool {
        self.get(k).is_some()
    }

    /// Returns a reference to the entry for key `k`.
    #[inline]
    pub fn get(&self, k: SlabKey) -> Option<&T> {
        match self.v.get(usize::from(k.idx)) {
            Some(&Slot::Occupied(gen, ref v)) if gen == k.gen => Some(v),
            _ => None,
        }
    }

    /// Returns a mutable reference to the entry for key `k`.
    #[inline]
    pub fn get_mut(&mut self, k: SlabKey) -> Option<&mut T> {
        match self.v.get_mut(usize::from(k.idx)) {
            Some(&mut Slot::Occupied(gen, ref mut v)) if gen == k.gen => Some(v),
            _ => None,
        }
    }

    /// Returns an iterator over all occupied entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (SlabKey, &T)> {
        self.v.iter().enumerate().filter_map(|(i, s)| match *s {
            #[allow(clippy::cast_possible_truncation)]
            Slot::Occupied(gen, ref v) => Some((SlabKey { idx: i as u16, gen }, v)),
            Slot::Vacant(_) => None,
        })
    }

    /// Returns a mutable iterator over all occupied entries in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SlabKey, &mut T)> {
        self.v.iter_mut().enumerate().filter_map(|(i, s)| match *s {
            #[allow(clippy::cast_possible_truncation)]
            Slot::Occupied(gen, ref mut v) => Some((SlabKey { idx: i as u16, gen }, v)),
            Slot::Vacant(_) => None,
        })
    }

    /// Returns the keys of all occupied entries.
    #[must_use]
    pub fn keys(&self) -> Vec<SlabKey> {
        self.iter().map(|(k, _)| k).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab() {
        let mut s = Slab::with_capacity(2);
        let a = s.insert('a').unwrap();
        let b = s.insert('b').unwrap();
        assert!(s.is_full());
        assert_eq!(s.insert('c'), Err('c'));
        assert_eq!(s.remove(a), Some('a'));
        assert_eq!(s.remove(a), None);

        let c = s.insert('c').unwrap();
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert_eq!(s.get(a), None);
        assert_eq!(s.get(c), Some(&'c'));
        assert_eq!(s.iter().map(|(_, &v)| v).collect::<String>(), "cb");
        assert_eq!(s.keys(), vec![c, b]);
        assert_eq!(s.len(), 2);
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Growable bitmap of port indices.

use std::fmt;

const BITS: usize = u64::BITS as usize;

/// A set of port (or child) indices.
#[derive(Clone, Default)]
pub struct PortSet {
    words: Vec<u64>,
}

impl PortSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty set with room for indices below `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: Vec::with_capacity(capacity.div_ceil(BITS)),
        }
    }

    /// Add an index. Returns true if it was not present.
    pub fn insert(&mut self, index: usize) -> bool {
        let (word, bit) = (index / BITS, index % BITS);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let was_set = self.words[word] & (1 << bit) != 0;
        self.words[word] |= 1 << bit;
        !was_set
    }

    /// Remove an index. Returns true if it was present.
    pub fn remove(&mut self, index: usize) -> bool {
        let (word, bit) = (index / BITS, index % BITS);
        match self.words.get_mut(word) {
            Some(w) if *w & (1 << bit) != 0 => {
                *w &= !(1 << bit);
                true
            }
            _ => false,
        }
    }

    /// Returns true if the index is present.
    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / BITS)
            .is_some_and(|w| w & (1 << (index % BITS)) != 0)
    }

    /// Number of indices in the set.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns true if the set holds no index.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, word)| {
            (0..BITS)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| i * BITS + bit)
        })
    }

    /// Returns true if every index of `self` is also in `other`.
    pub fn is_subset(&self, other: &PortSet) -> bool {
        self.words.iter().enumerate().all(|(i, word)| {
            let theirs = other.words.get(i).copied().unwrap_or(0);
            word & !theirs == 0
        })
    }

    /// The largest index plus one, or 0 for an empty set.
    pub fn upper_bound(&self) -> usize {
        self.iter().last().map_or(0, |max| max + 1)
    }
}

impl FromIterator<usize> for PortSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = PortSet::new();
        for index in iter {
            set.insert(index);
        }
        set
    }
}

impl Extend<usize> for PortSet {
    fn extend<I: IntoIterator<Item = usize>>(&mut self, iter: I) {
        for index in iter {
            self.insert(index);
        }
    }
}

impl PartialEq for PortSet {
    fn eq(&self, other: &Self) -> bool {
        self.is_subset(other) && other.is_subset(self)
    }
}

impl Eq for PortSet {}

impl fmt::Debug for PortSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

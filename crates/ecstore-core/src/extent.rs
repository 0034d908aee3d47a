//! Coalescing byte-interval containers.
//!
//! `ExtentSet` tracks which byte ranges exist; `ExtentMap` additionally
//! carries the bytes. Both keep their intervals sorted, non-overlapping,
//! and merged with any adjacent neighbor, so a range that is fully
//! present is always covered by exactly one interval. Every mutator
//! re-establishes that invariant before returning.

use std::collections::BTreeMap;
use std::fmt;

/// An ordered set of disjoint, coalesced `[start, start+len)` intervals.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ExtentSet {
    /// start -> length
    ivals: BTreeMap<u64, u64>,
}

impl ExtentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ivals.is_empty()
    }

    /// Number of intervals (not bytes).
    pub fn num_intervals(&self) -> usize {
        self.ivals.len()
    }

    /// Total bytes covered.
    pub fn size(&self) -> u64 {
        self.ivals.values().sum()
    }

    /// Smallest covered offset. The set must not be empty.
    pub fn range_start(&self) -> u64 {
        let (&start, _) = self.ivals.iter().next().expect("range_start on empty set");
        start
    }

    /// One past the largest covered offset. The set must not be empty.
    pub fn range_end(&self) -> u64 {
        let (&start, &len) = self.ivals.iter().next_back().expect("range_end on empty set");
        start + len
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ivals.iter().map(|(&s, &l)| (s, l))
    }

    /// Insert `[off, off+len)`, merging with anything it touches.
    pub fn insert(&mut self, off: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut start = off;
        let mut end = off + len;

        // A predecessor that reaches (or abuts) `off` joins the merge.
        if let Some((&s, &l)) = self.ivals.range(..=off).next_back() {
            if s + l >= off {
                start = s.min(start);
                end = end.max(s + l);
                self.ivals.remove(&s);
            }
        }
        // Successors starting inside (or abutting) the new range join too.
        let followers: Vec<u64> = self
            .ivals
            .range(off..)
            .take_while(|(&s, _)| s <= end)
            .map(|(&s, _)| s)
            .collect();
        for s in followers {
            let l = self.ivals.remove(&s).unwrap();
            end = end.max(s + l);
        }
        self.ivals.insert(start, end - start);
    }

    /// Remove `[off, off+len)` from the set.
    pub fn erase(&mut self, off: u64, len: u64) {
        if len == 0 || self.ivals.is_empty() {
            return;
        }
        let end = off + len;

        // Predecessor overlapping the erased range: keep its head,
        // maybe its tail.
        if let Some((&s, &l)) = self.ivals.range(..off).next_back() {
            if s + l > off {
                self.ivals.remove(&s);
                self.ivals.insert(s, off - s);
                if s + l > end {
                    self.ivals.insert(end, s + l - end);
                }
            }
        }
        // Intervals starting inside the erased range: drop, keep tails.
        let inside: Vec<u64> = self
            .ivals
            .range(off..end)
            .map(|(&s, _)| s)
            .collect();
        for s in inside {
            let l = self.ivals.remove(&s).unwrap();
            if s + l > end {
                self.ivals.insert(end, s + l - end);
            }
        }
    }

    /// Union another set into this one.
    pub fn union_with(&mut self, other: &ExtentSet) {
        for (off, len) in other.iter() {
            self.insert(off, len);
        }
    }

    /// Remove every interval of `other` from this set.
    pub fn subtract(&mut self, other: &ExtentSet) {
        for (off, len) in other.iter() {
            self.erase(off, len);
        }
    }

    /// The intersection of this set and `other`.
    pub fn intersection(&self, other: &ExtentSet) -> ExtentSet {
        let mut out = ExtentSet::new();
        for (off, len) in other.iter() {
            for (s, l) in self.overlapping(off, len) {
                let lo = s.max(off);
                let hi = (s + l).min(off + len);
                out.insert(lo, hi - lo);
            }
        }
        out
    }

    /// Expand every interval to `granularity`-aligned bounds.
    pub fn align(&mut self, granularity: u64) {
        assert!(granularity > 0);
        let old = std::mem::take(&mut self.ivals);
        for (s, l) in old {
            let start = s - s % granularity;
            let end = s + l;
            let end = end + (granularity - end % granularity) % granularity;
            self.insert(start, end - start);
        }
    }

    /// True iff `[off, off+len)` is entirely covered.
    pub fn contains(&self, off: u64, len: u64) -> bool {
        if len == 0 {
            return true;
        }
        match self.ivals.range(..=off).next_back() {
            Some((&s, &l)) => s <= off && off + len <= s + l,
            None => false,
        }
    }

    /// True iff every interval of `other` is covered.
    pub fn contains_set(&self, other: &ExtentSet) -> bool {
        other.iter().all(|(off, len)| self.contains(off, len))
    }

    /// Intervals overlapping `[off, off+len)`, as `(start, len)` pairs.
    fn overlapping(&self, off: u64, len: u64) -> Vec<(u64, u64)> {
        let end = off + len;
        let mut out = Vec::new();
        if let Some((&s, &l)) = self.ivals.range(..off).next_back() {
            if s + l > off {
                out.push((s, l));
            }
        }
        for (&s, &l) in self.ivals.range(off..end) {
            out.push((s, l));
        }
        out
    }
}

impl FromIterator<(u64, u64)> for ExtentSet {
    fn from_iter<T: IntoIterator<Item = (u64, u64)>>(iter: T) -> Self {
        let mut set = ExtentSet::new();
        for (off, len) in iter {
            set.insert(off, len);
        }
        set
    }
}

impl fmt::Debug for ExtentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (s, l)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}~{}", s, l)?;
        }
        write!(f, "]")
    }
}

/// An ordered map from byte offset to buffer, with the same coalescing
/// discipline as [`ExtentSet`]. Overlapping inserts overwrite the older
/// bytes; adjacent buffers are merged into one.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ExtentMap {
    bufs: BTreeMap<u64, Vec<u8>>,
}

impl ExtentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Total bytes held.
    pub fn size(&self) -> u64 {
        self.bufs.values().map(|b| b.len() as u64).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &Vec<u8>)> + '_ {
        self.bufs.iter().map(|(&s, b)| (s, b))
    }

    /// Insert `data` at `off`, overwriting overlaps and merging with
    /// anything it touches.
    pub fn insert(&mut self, off: u64, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        let len = data.len() as u64;
        let mut start = off;
        let mut end = off + len;
        let mut absorbed: Vec<(u64, Vec<u8>)> = Vec::new();

        if let Some((&s, b)) = self.bufs.range(..=off).next_back() {
            if s + b.len() as u64 >= off {
                start = s.min(start);
                end = end.max(s + b.len() as u64);
                let b = self.bufs.remove(&s).unwrap();
                absorbed.push((s, b));
            }
        }
        let followers: Vec<u64> = self
            .bufs
            .range(off..)
            .take_while(|(&s, _)| s <= off + len)
            .map(|(&s, _)| s)
            .collect();
        for s in followers {
            let b = self.bufs.remove(&s).unwrap();
            end = end.max(s + b.len() as u64);
            absorbed.push((s, b));
        }

        let mut merged = vec![0u8; (end - start) as usize];
        for (s, b) in absorbed {
            let at = (s - start) as usize;
            merged[at..at + b.len()].copy_from_slice(&b);
        }
        // New bytes win over anything they overlapped.
        let at = (off - start) as usize;
        merged[at..at + data.len()].copy_from_slice(&data);
        self.bufs.insert(start, merged);
    }

    /// Copy out `[off, off+len)` if fully present.
    pub fn read(&self, off: u64, len: u64) -> Option<Vec<u8>> {
        if len == 0 {
            return Some(Vec::new());
        }
        let (&s, b) = self.bufs.range(..=off).next_back()?;
        if off + len > s + b.len() as u64 {
            return None;
        }
        let at = (off - s) as usize;
        Some(b[at..at + len as usize].to_vec())
    }

    /// True iff `[off, off+len)` is fully present.
    pub fn contains(&self, off: u64, len: u64) -> bool {
        if len == 0 {
            return true;
        }
        match self.bufs.range(..=off).next_back() {
            Some((&s, b)) => off + len <= s + b.len() as u64,
            None => false,
        }
    }

    /// Remove `[off, off+len)`, splitting buffers at the boundary.
    pub fn erase(&mut self, off: u64, len: u64) {
        if len == 0 || self.bufs.is_empty() {
            return;
        }
        let end = off + len;

        if let Some((&s, b)) = self.bufs.range(..off).next_back() {
            let b_end = s + b.len() as u64;
            if b_end > off {
                let b = self.bufs.remove(&s).unwrap();
                let head = b[..(off - s) as usize].to_vec();
                self.bufs.insert(s, head);
                if b_end > end {
                    let tail = b[(end - s) as usize..].to_vec();
                    self.bufs.insert(end, tail);
                }
            }
        }
        let inside: Vec<u64> = self.bufs.range(off..end).map(|(&s, _)| s).collect();
        for s in inside {
            let b = self.bufs.remove(&s).unwrap();
            let b_end = s + b.len() as u64;
            if b_end > end {
                let tail = b[(end - s) as usize..].to_vec();
                self.bufs.insert(end, tail);
            }
        }
    }

    /// The present sub-ranges of `want`, with their bytes.
    pub fn intersect(&self, want: &ExtentSet) -> ExtentMap {
        let mut out = ExtentMap::new();
        for (off, len) in want.iter() {
            let end = off + len;
            let from = match self.bufs.range(..=off).next_back() {
                Some((&s, _)) => s,
                None => off,
            };
            for (&s, b) in self.bufs.range(from..end) {
                let b_end = s + b.len() as u64;
                if b_end <= off {
                    continue;
                }
                let lo = s.max(off);
                let hi = b_end.min(end);
                if lo < hi {
                    out.insert(lo, b[(lo - s) as usize..(hi - s) as usize].to_vec());
                }
            }
        }
        out
    }

    /// Insert every buffer of `other`; `other`'s bytes win on overlap.
    pub fn union_with(&mut self, other: &ExtentMap) {
        for (off, b) in other.iter() {
            self.insert(off, b.clone());
        }
    }

    /// The set of offsets present, without the bytes.
    pub fn interval_set(&self) -> ExtentSet {
        self.bufs
            .iter()
            .map(|(&s, b)| (s, b.len() as u64))
            .collect()
    }
}

impl fmt::Debug for ExtentMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (s, b)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}~{}", s, b.len())?;
        }
        write!(f, "}}")
    }
}

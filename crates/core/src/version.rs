//! Version vectors
//!
//! A [`Vector`] is a file's causal clock: a set of (device short-id,
//! counter) pairs, canonicalized so that equal histories have equal
//! representations. Beyond the usual partial order, `compare` breaks
//! concurrent pairs deterministically by their canonical byte encoding,
//! giving every device the same total order without coordination. That
//! total order decides which copy of a file wins cluster-wide.

/// One counter in a version vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// Device short id (see `DeviceId::short_id`).
    pub id: u64,
    /// Number of updates this device has made to the file.
    pub value: u64,
}

/// Outcome of comparing two vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    /// Identical histories.
    Equal,
    /// The left vector strictly dominates the right.
    Greater,
    /// The right vector strictly dominates the left.
    Lesser,
    /// Concurrent, and the left wins the canonical-encoding tiebreak.
    ConcurrentGreater,
    /// Concurrent, and the left loses the canonical-encoding tiebreak.
    ConcurrentLesser,
}

/// A canonical version vector: counters sorted by device id, no
/// duplicates, zero counters elided.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Vector {
    counters: Vec<Counter>,
}

impl Vector {
    /// The empty vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a vector from (id, value) pairs. Zero values are dropped,
    /// duplicate ids keep the largest value, and the result is sorted.
    #[must_use]
    pub fn from_pairs(pairs: &[(u64, u64)]) -> Self {
        let mut v = Self::new();
        for &(id, value) in pairs {
            if value == 0 {
                continue;
            }
            match v.counters.binary_search_by_key(&id, |c| c.id) {
                Ok(i) => v.counters[i].value = v.counters[i].value.max(value),
                Err(i) => v.counters.insert(i, Counter { id, value }),
            }
        }
        v
    }

    /// The canonical counter list, sorted by device id.
    #[must_use]
    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    /// The counter value for a device, zero if absent.
    #[must_use]
    pub fn counter(&self, id: u64) -> u64 {
        self.counters
            .binary_search_by_key(&id, |c| c.id)
            .map(|i| self.counters[i].value)
            .unwrap_or(0)
    }

    /// True for the empty vector.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Return this vector with the given device's counter incremented,
    /// inserting it at one if absent.
    #[must_use]
    pub fn update(mut self, id: u64) -> Self {
        match self.counters.binary_search_by_key(&id, |c| c.id) {
            Ok(i) => self.counters[i].value += 1,
            Err(i) => self.counters.insert(i, Counter { id, value: 1 }),
        }
        self
    }

    /// Multiset equality.
    #[must_use]
    pub fn equal(&self, other: &Self) -> bool {
        self == other
    }

    /// True when `self` compares `Equal`, `Greater` or `ConcurrentGreater`
    /// against `other`.
    #[must_use]
    pub fn greater_equal(&self, other: &Self) -> bool {
        matches!(
            self.compare(other),
            Ordering::Equal | Ordering::Greater | Ordering::ConcurrentGreater
        )
    }

    /// Compare two vectors under the total order.
    ///
    /// Dominance in both directions means `Equal`; dominance one way means
    /// `Greater`/`Lesser`; otherwise the pair is concurrent and the
    /// canonical encodings are compared lexicographically, the smaller one
    /// being `ConcurrentLesser`.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        let mut self_ge = true;
        let mut other_ge = true;

        let mut a = self.counters.iter().peekable();
        let mut b = other.counters.iter().peekable();
        loop {
            match (a.peek(), b.peek()) {
                (None, None) => break,
                (Some(_), None) => {
                    other_ge = false;
                    break;
                }
                (None, Some(_)) => {
                    self_ge = false;
                    break;
                }
                (Some(ca), Some(cb)) => {
                    if ca.id == cb.id {
                        if ca.value > cb.value {
                            other_ge = false;
                        } else if ca.value < cb.value {
                            self_ge = false;
                        }
                        a.next();
                        b.next();
                    } else if ca.id < cb.id {
                        // Device only counted on the left.
                        other_ge = false;
                        a.next();
                    } else {
                        self_ge = false;
                        b.next();
                    }
                }
            }
            if !self_ge && !other_ge {
                break;
            }
        }

        match (self_ge, other_ge) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Lesser,
            (false, false) => {
                if self.encode() < other.encode() {
                    Ordering::ConcurrentLesser
                } else {
                    Ordering::ConcurrentGreater
                }
            }
        }
    }

    /// The canonical byte encoding: each counter as sixteen big-endian
    /// bytes (id, then value), in id order. Two vectors are equal iff
    /// their encodings are equal, so lexicographic comparison of
    /// encodings is a total order.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.counters.len() * 16);
        for c in &self.counters {
            buf.extend_from_slice(&c.id.to_be_bytes());
            buf.extend_from_slice(&c.value.to_be_bytes());
        }
        buf
    }
}

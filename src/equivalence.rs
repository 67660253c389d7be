//! # Equivalence Engine
//!
//! Records "these two items are provably equal" facts and answers
//! equivalence queries over the transitive closure.
//!
//! Edges are stored symmetrically. `are_equivalent` is a breadth-first
//! search bounded to `max_depth` levels: a path longer than the bound is
//! reported as "not proven equivalent" rather than searched further. The
//! bound is an approximation for large equivalence graphs, not a
//! termination proof; the `seen` set alone already guarantees termination
//! on cycles.
//!
//! ```text
//! mark(a, b); mark(b, c)
//!   a <-> b <-> c        are_equivalent(a, c) == true (2 levels)
//! ```

use std::collections::{BTreeMap, BTreeSet};

/// Equivalence classes over items of type `T`
#[derive(Debug, Clone)]
pub struct EquivalenceFinder<T: Ord + Clone> {
    /// Symmetric adjacency: item -> items directly marked equivalent
    equivalences: BTreeMap<T, BTreeSet<T>>,
    /// Maximum number of BFS levels explored by `are_equivalent`
    max_depth: usize,
}

impl<T: Ord + Clone> EquivalenceFinder<T> {
    /// Default search bound
    pub const DEFAULT_MAX_DEPTH: usize = 32;

    /// Create an empty finder with the default search bound
    pub fn new() -> Self {
        EquivalenceFinder::with_max_depth(Self::DEFAULT_MAX_DEPTH)
    }

    /// Create an empty finder with a custom search bound
    pub fn with_max_depth(max_depth: usize) -> Self {
        EquivalenceFinder {
            equivalences: BTreeMap::new(),
            max_depth,
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth;
    }

    pub fn is_empty(&self) -> bool {
        self.equivalences.is_empty()
    }

    /// Record that `a` and `b` are equivalent. Idempotent; `a == b` is a no-op.
    pub fn mark_equivalent(&mut self, a: T, b: T) {
        if a == b {
            return;
        }
        self.equivalences
            .entry(a.clone())
            .or_default()
            .insert(b.clone());
        self.equivalences.entry(b).or_default().insert(a);
    }

    /// Whether `a` and `b` are provably equivalent within the search bound
    pub fn are_equivalent(&self, a: &T, b: &T) -> bool {
        if a == b {
            return true;
        }
        let mut seen: BTreeSet<&T> = BTreeSet::new();
        seen.insert(a);
        let mut frontier = vec![a];
        for _ in 0..self.max_depth {
            let mut next = Vec::new();
            for item in frontier {
                let Some(neighbors) = self.equivalences.get(item) else {
                    continue;
                };
                for neighbor in neighbors {
                    if neighbor == b {
                        return true;
                    }
                    if seen.insert(neighbor) {
                        next.push(neighbor);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        false
    }

    /// Full transitive closure of `item`, excluding `item` itself
    pub fn find_equivalents(&self, item: &T) -> BTreeSet<T> {
        let mut result = BTreeSet::new();
        let mut stack = vec![item];
        while let Some(current) = stack.pop() {
            if let Some(neighbors) = self.equivalences.get(current) {
                for neighbor in neighbors {
                    if neighbor != item && result.insert(neighbor.clone()) {
                        stack.push(neighbor);
                    }
                }
            }
        }
        result
    }

    /// Every directly marked pair exactly once, as `(smaller, larger)`
    pub fn equivalence_pairs(&self) -> Vec<(T, T)> {
        self.equivalences
            .iter()
            .flat_map(|(a, others)| {
                others
                    .iter()
                    .filter(move |b| a < *b)
                    .map(move |b| (a.clone(), b.clone()))
            })
            .collect()
    }

    /// Merge every equivalence recorded in `other` into this finder
    pub fn copy_equivalences(&mut self, other: &EquivalenceFinder<T>) {
        for (a, b) in other.equivalence_pairs() {
            self.mark_equivalent(a, b);
        }
    }
}

impl<T: Ord + Clone> Default for EquivalenceFinder<T> {
    fn default() -> Self {
        EquivalenceFinder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_is_symmetric() {
        let mut finder = EquivalenceFinder::new();
        finder.mark_equivalent(1, 2);
        assert!(finder.are_equivalent(&1, &2));
        assert!(finder.are_equivalent(&2, &1));
        assert!(!finder.are_equivalent(&1, &3));
    }

    #[test]
    fn test_self_mark_is_noop() {
        let mut finder = EquivalenceFinder::new();
        finder.mark_equivalent(7, 7);
        assert!(finder.is_empty());
        assert!(finder.are_equivalent(&7, &7));
    }

    #[test]
    fn test_transitive_within_bound() {
        let mut finder = EquivalenceFinder::new();
        finder.mark_equivalent("a", "b");
        finder.mark_equivalent("b", "c");
        finder.mark_equivalent("c", "a");
        assert!(finder.are_equivalent(&"a", &"c"));
        let equivalents = finder.find_equivalents(&"a");
        assert_eq!(equivalents.into_iter().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn test_pairs_are_canonical() {
        let mut finder = EquivalenceFinder::new();
        finder.mark_equivalent(2, 1);
        finder.mark_equivalent(1, 2);
        finder.mark_equivalent(3, 2);
        assert_eq!(finder.equivalence_pairs(), vec![(1, 2), (2, 3)]);
    }

    #[test]
    fn test_copy_equivalences() {
        let mut fk = EquivalenceFinder::new();
        fk.mark_equivalent(10, 20);
        let mut main = EquivalenceFinder::new();
        main.mark_equivalent(20, 30);
        main.copy_equivalences(&fk);
        assert!(main.are_equivalent(&10, &30));
    }

    #[test]
    fn test_bound_degrades_to_not_proven() {
        let mut finder = EquivalenceFinder::with_max_depth(4);
        for i in 0..10 {
            finder.mark_equivalent(i, i + 1);
        }
        assert!(finder.are_equivalent(&0, &4));
        assert!(!finder.are_equivalent(&0, &5));
        // The closure itself is unbounded.
        assert_eq!(finder.find_equivalents(&0).len(), 10);
    }
}

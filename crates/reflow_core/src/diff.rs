//! Sequence diffing: minimal range patches between two snapshots
//!
//! The output maps a start index to the run of elements replaced there.
//! Unchanged regions are absent, so `diff(a, a)` is empty, and
//! `diff(a, b)` / `diff(b, a)` are old/new-swapped mirrors of each other.

use std::collections::BTreeMap;

/// One contiguous replacement: `old` is removed at the key index, `new`
/// inserted in its place. Either side may be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRun<T> {
    pub old: Vec<T>,
    pub new: Vec<T>,
}

// Manual impl: an empty run needs no `T: Default`.
impl<T> Default for DiffRun<T> {
    fn default() -> Self {
        Self {
            old: Vec::new(),
            new: Vec::new(),
        }
    }
}

/// Sparse patch turning one snapshot into another
pub type Patch<T> = BTreeMap<usize, DiffRun<T>>;

/// Compare two snapshots left-to-right over their common length. A mismatch
/// opens or extends a run keyed by its first index; equality closes it. A
/// trailing length mismatch extends the open run, or opens a tail run at the
/// common length. When `new` is the longer side the comparison runs swapped
/// and the resulting runs are mirrored back, so output is always
/// old-to-new oriented.
pub fn diff<T: Clone + PartialEq>(old: &[T], new: &[T]) -> Patch<T> {
    if new.len() > old.len() {
        return diff(new, old)
            .into_iter()
            .map(|(index, run)| {
                (
                    index,
                    DiffRun {
                        old: run.new,
                        new: run.old,
                    },
                )
            })
            .collect();
    }

    let mut runs: Patch<T> = BTreeMap::new();
    let mut open: Option<usize> = None;

    for i in 0..new.len() {
        if old[i] != new[i] {
            let start = *open.get_or_insert(i);
            let run = runs.entry(start).or_default();
            run.old.push(old[i].clone());
            run.new.push(new[i].clone());
        } else {
            open = None;
        }
    }

    if old.len() > new.len() {
        let start = open.unwrap_or(new.len());
        let run = runs.entry(start).or_default();
        run.old.extend(old[new.len()..].iter().cloned());
    }

    runs
}

/// Apply a patch produced by [`diff`] to a snapshot. Runs are applied in
/// descending index order so earlier indices stay valid.
pub fn apply<T: Clone>(target: &mut Vec<T>, patch: &Patch<T>) {
    for (&index, run) in patch.iter().rev() {
        let start = index.min(target.len());
        let end = (index + run.old.len()).min(target.len());
        target.splice(start..end, run.new.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<T: Clone>(old: &[T], new: &[T]) -> DiffRun<T> {
        DiffRun {
            old: old.to_vec(),
            new: new.to_vec(),
        }
    }

    #[test]
    fn test_identical_is_empty() {
        assert!(diff::<i32>(&[], &[]).is_empty());
        assert!(diff(&[1, 2, 3], &[1, 2, 3]).is_empty());
    }

    #[test]
    fn test_shrink_by_one() {
        let patch = diff(&[1, 2, 3], &[1, 2]);
        assert_eq!(patch.len(), 1);
        assert_eq!(patch[&2], run(&[3], &[]));
    }

    #[test]
    fn test_grow_by_one() {
        let patch = diff(&[2, 4], &[2, 4, 6]);
        assert_eq!(patch.len(), 1);
        assert_eq!(patch[&2], run(&[], &[6]));
    }

    #[test]
    fn test_mid_run_and_tail_run() {
        let patch = diff(&[1, 2, 3, 4, 5], &[1, 9, 9, 4, 6, 7]);
        assert_eq!(patch.len(), 2);
        assert_eq!(patch[&1], run(&[2, 3], &[9, 9]));
        assert_eq!(patch[&4], run(&[5], &[6, 7]));
    }

    #[test]
    fn test_suffix_extends_open_run() {
        // Mismatch at the last common index keeps the run open for the tail.
        let patch = diff(&[1, 2, 9, 8], &[1, 5]);
        assert_eq!(patch.len(), 1);
        assert_eq!(patch[&1], run(&[2, 9, 8], &[5]));
    }

    #[test]
    fn test_mirror_symmetry() {
        let a = vec![1, 2, 3, 4];
        let b = vec![1, 7, 3, 9, 10];
        let forward = diff(&a, &b);
        let backward = diff(&b, &a);
        assert_eq!(forward.len(), backward.len());
        for (index, f) in &forward {
            let r = &backward[index];
            assert_eq!(f.old, r.new);
            assert_eq!(f.new, r.old);
        }
    }

    #[test]
    fn test_round_trip() {
        let cases: Vec<(Vec<i32>, Vec<i32>)> = vec![
            (vec![], vec![]),
            (vec![1, 2, 3], vec![]),
            (vec![], vec![4, 5]),
            (vec![1, 2, 3], vec![1, 2]),
            (vec![2, 4], vec![2, 4, 6]),
            (vec![1, 2, 3, 4, 5], vec![1, 9, 9, 4, 6, 7]),
            (vec![5, 4, 3, 2, 1], vec![1, 2, 3, 4, 5]),
            (vec![1, 1, 1], vec![1, 2, 1]),
        ];
        for (a, b) in cases {
            let patch = diff(&a, &b);
            let mut copy = a.clone();
            apply(&mut copy, &patch);
            assert_eq!(copy, b, "round trip failed for {a:?} -> {b:?}");
        }
    }
}

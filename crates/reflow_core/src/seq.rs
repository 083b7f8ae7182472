//! Reactive ordered sequences with structured change records
//!
//! A [`ReactiveSeq`] owns its backing storage. Every mutation is validated,
//! applied to the storage, mirrored into the per-index container map, and
//! then broadcast as exactly one [`ChangeRecord`] - to the "length" bucket
//! for the add/remove family, to the "index" bucket for in-place updates.
//!
//! Query operations register the active observer (if any) as a coarse
//! dependency on the sequence's "any index" and "length" anchors, an
//! over-approximation that is never an under-approximation.
//!
//! Derived sequences ([`map`](ReactiveSeq::map), [`filter`](ReactiveSeq::filter),
//! [`slice`](ReactiveSeq::slice), [`concat`](ReactiveSeq::concat)) keep
//! themselves consistent by translating incoming records into patches;
//! filtering re-applies its predicate and patches by diff instead of
//! rebuilding.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::diff::{self, Patch};
use crate::error::{ReactiveError, Result};
use crate::reactive::{CellId, Lifecycle, ReactiveGraph};

/// The kind of mutation a [`ChangeRecord`] describes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqOp {
    Set,
    Add,
    Remove,
    SetLength,
    Reverse,
    Sort,
    Splice,
}

/// Immutable description of one sequence mutation, consumed synchronously in
/// the producing turn.
///
/// `index` is the first affected position; whole-sequence operations
/// (`Reverse`, `Sort`) carry index 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeRecord<T> {
    pub op: SeqOp,
    pub index: usize,
    pub removed: Vec<T>,
    pub added: Vec<T>,
}

/// Which listener bucket a record is broadcast to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Bucket {
    Index,
    Length,
}

fn bucket_for<T>(record: &ChangeRecord<T>) -> Bucket {
    match record.op {
        SeqOp::Set | SeqOp::Reverse | SeqOp::Sort => Bucket::Index,
        SeqOp::Add | SeqOp::Remove | SeqOp::SetLength => Bucket::Length,
        SeqOp::Splice => {
            if record.removed.len() == record.added.len() {
                Bucket::Index
            } else {
                Bucket::Length
            }
        }
    }
}

/// Handle for detaching a sequence listener
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeqListenerId(u64);

/// `None` while the callback is checked out for a broadcast
type SeqCallback<T> = Rc<RefCell<Option<Box<dyn FnMut(&mut ReactiveGraph, &ChangeRecord<T>)>>>>;

struct ListenerEntry<T: 'static> {
    id: u64,
    callback: SeqCallback<T>,
}

impl<T: 'static> Clone for ListenerEntry<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: self.callback.clone(),
        }
    }
}

struct SeqInner<T: 'static> {
    items: Vec<T>,
    /// Per-index anchor containers; count always equals `items.len()`
    index_cells: Vec<CellId>,
    /// Coarse "any index changed" anchor
    indices_anchor: CellId,
    /// Coarse "length changed" anchor
    length_anchor: CellId,
    index_listeners: Vec<ListenerEntry<T>>,
    length_listeners: Vec<ListenerEntry<T>>,
    next_listener: u64,
    lifecycle: Lifecycle,
}

impl<T: 'static> SeqInner<T> {
    fn ensure_live(&self) -> Result<()> {
        if self.lifecycle == Lifecycle::Destroyed {
            return Err(ReactiveError::Destroyed);
        }
        Ok(())
    }

    /// Keep the per-index container map in lockstep with the storage length
    fn sync_index_cells(&mut self, g: &mut ReactiveGraph) {
        while self.index_cells.len() < self.items.len() {
            let index = self.index_cells.len();
            self.index_cells.push(g.create_anchor(&index.to_string()));
        }
        while self.index_cells.len() > self.items.len() {
            if let Some(cell) = self.index_cells.pop() {
                g.remove_cell(cell);
            }
        }
    }
}

/// Observable wrapper around an ordered collection
pub struct ReactiveSeq<T: 'static> {
    inner: Rc<RefCell<SeqInner<T>>>,
}

impl<T: 'static> Clone for ReactiveSeq<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + PartialEq + 'static> ReactiveSeq<T> {
    pub fn new(g: &mut ReactiveGraph, items: Vec<T>) -> Self {
        let indices_anchor = g.create_anchor("indices");
        let length_anchor = g.create_anchor("length");
        let index_cells = (0..items.len())
            .map(|i| g.create_anchor(&i.to_string()))
            .collect();
        Self {
            inner: Rc::new(RefCell::new(SeqInner {
                items,
                index_cells,
                indices_anchor,
                length_anchor,
                index_listeners: Vec::new(),
                length_listeners: Vec::new(),
                next_listener: 0,
                lifecycle: Lifecycle::Ready,
            })),
        }
    }

    // =========================================================================
    // QUERIES (coarse dependency registration)
    // =========================================================================

    fn track_coarse(&self, g: &mut ReactiveGraph) {
        let inner = self.inner.borrow();
        g.track(inner.indices_anchor);
        g.track(inner.length_anchor);
    }

    pub fn len(&self, g: &mut ReactiveGraph) -> usize {
        self.track_coarse(g);
        self.inner.borrow().items.len()
    }

    pub fn is_empty(&self, g: &mut ReactiveGraph) -> bool {
        self.len(g) == 0
    }

    pub fn get(&self, g: &mut ReactiveGraph, index: usize) -> Option<T> {
        self.track_coarse(g);
        self.inner.borrow().items.get(index).cloned()
    }

    /// Plain snapshot of the current elements - the serialization boundary:
    /// no reactive metadata survives.
    pub fn snapshot(&self, g: &mut ReactiveGraph) -> Vec<T> {
        self.track_coarse(g);
        self.inner.borrow().items.clone()
    }

    pub fn contains(&self, g: &mut ReactiveGraph, value: &T) -> bool {
        self.track_coarse(g);
        self.inner.borrow().items.contains(value)
    }

    pub fn index_of(&self, g: &mut ReactiveGraph, value: &T) -> Option<usize> {
        self.track_coarse(g);
        self.inner.borrow().items.iter().position(|v| v == value)
    }

    pub fn last_index_of(&self, g: &mut ReactiveGraph, value: &T) -> Option<usize> {
        self.track_coarse(g);
        self.inner.borrow().items.iter().rposition(|v| v == value)
    }

    pub fn fold<A>(&self, g: &mut ReactiveGraph, init: A, f: impl FnMut(A, &T) -> A) -> A {
        self.track_coarse(g);
        self.inner.borrow().items.iter().fold(init, f)
    }

    pub fn for_each(&self, g: &mut ReactiveGraph, mut f: impl FnMut(&T)) {
        self.track_coarse(g);
        for item in self.inner.borrow().items.iter() {
            f(item);
        }
    }

    /// Per-index container count; equals the length at all times
    pub fn container_count(&self) -> usize {
        self.inner.borrow().index_cells.len()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.borrow().lifecycle
    }

    // =========================================================================
    // MUTATIONS (storage first, then cells, then one record)
    // =========================================================================

    /// Append one element
    pub fn push(&self, g: &mut ReactiveGraph, value: T) -> Result<()> {
        let index = {
            let inner = self.inner.borrow();
            inner.ensure_live()?;
            inner.items.len()
        };
        self.insert_all(g, index, vec![value])
    }

    /// Append several elements as one mutation
    pub fn extend(&self, g: &mut ReactiveGraph, values: Vec<T>) -> Result<()> {
        let index = {
            let inner = self.inner.borrow();
            inner.ensure_live()?;
            inner.items.len()
        };
        if values.is_empty() {
            return Ok(());
        }
        self.insert_all(g, index, values)
    }

    /// Prepend one element
    pub fn unshift(&self, g: &mut ReactiveGraph, value: T) -> Result<()> {
        self.inner.borrow().ensure_live()?;
        self.insert_all(g, 0, vec![value])
    }

    /// Remove and return the last element
    pub fn pop(&self, g: &mut ReactiveGraph) -> Result<Option<T>> {
        let len = {
            let inner = self.inner.borrow();
            inner.ensure_live()?;
            inner.items.len()
        };
        if len == 0 {
            return Ok(None);
        }
        let removed = self.remove_at(g, len - 1, 1)?;
        Ok(removed.into_iter().next())
    }

    /// Remove and return the first element
    pub fn shift(&self, g: &mut ReactiveGraph) -> Result<Option<T>> {
        let empty = {
            let inner = self.inner.borrow();
            inner.ensure_live()?;
            inner.items.is_empty()
        };
        if empty {
            return Ok(None);
        }
        let removed = self.remove_at(g, 0, 1)?;
        Ok(removed.into_iter().next())
    }

    /// Replace the element at `index`. Replacing with an equal value is a
    /// no-op that broadcasts nothing.
    pub fn set(&self, g: &mut ReactiveGraph, index: usize, value: T) -> Result<()> {
        let (previous, index_cell) = {
            let mut inner = self.inner.borrow_mut();
            inner.ensure_live()?;
            let len = inner.items.len();
            if index >= len {
                return Err(ReactiveError::IndexOutOfBounds { index, len });
            }
            if inner.items[index] == value {
                return Ok(());
            }
            let previous = std::mem::replace(&mut inner.items[index], value.clone());
            (previous, inner.index_cells[index])
        };
        g.touch(index_cell)?;
        self.emit(
            g,
            ChangeRecord {
                op: SeqOp::Set,
                index,
                removed: vec![previous],
                added: vec![value],
            },
        )
    }

    /// Truncate to `len` elements. Growing is a validation error: the engine
    /// cannot invent filler values.
    pub fn set_len(&self, g: &mut ReactiveGraph, len: usize) -> Result<()> {
        let removed = {
            let mut inner = self.inner.borrow_mut();
            inner.ensure_live()?;
            let current = inner.items.len();
            if len > current {
                return Err(ReactiveError::CannotGrow {
                    len: current,
                    requested: len,
                });
            }
            if len == current {
                return Ok(());
            }
            let removed = inner.items.split_off(len);
            inner.sync_index_cells(g);
            removed
        };
        self.emit(
            g,
            ChangeRecord {
                op: SeqOp::SetLength,
                index: len,
                removed,
                added: Vec::new(),
            },
        )
    }

    /// Reverse the element order in place
    pub fn reverse(&self, g: &mut ReactiveGraph) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            inner.ensure_live()?;
            if inner.items.is_empty() {
                return Ok(());
            }
            inner.items.reverse();
        }
        self.emit(
            g,
            ChangeRecord {
                op: SeqOp::Reverse,
                index: 0,
                removed: Vec::new(),
                added: Vec::new(),
            },
        )
    }

    /// Sort in place with a comparator
    pub fn sort_by(
        &self,
        g: &mut ReactiveGraph,
        compare: impl FnMut(&T, &T) -> std::cmp::Ordering,
    ) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            inner.ensure_live()?;
            if inner.items.is_empty() {
                return Ok(());
            }
            inner.items.sort_by(compare);
        }
        self.emit(
            g,
            ChangeRecord {
                op: SeqOp::Sort,
                index: 0,
                removed: Vec::new(),
                added: Vec::new(),
            },
        )
    }

    /// Remove `remove_count` elements at `index` (clamped to the tail) and
    /// insert `values` in their place. Returns the removed run.
    pub fn splice(
        &self,
        g: &mut ReactiveGraph,
        index: usize,
        remove_count: usize,
        values: Vec<T>,
    ) -> Result<Vec<T>> {
        let removed = {
            let mut inner = self.inner.borrow_mut();
            inner.ensure_live()?;
            let len = inner.items.len();
            if index > len {
                return Err(ReactiveError::IndexOutOfBounds { index, len });
            }
            let end = (index + remove_count).min(len);
            let removed: Vec<T> = inner.items.splice(index..end, values.iter().cloned()).collect();
            inner.sync_index_cells(g);
            removed
        };
        self.emit(
            g,
            ChangeRecord {
                op: SeqOp::Splice,
                index,
                removed: removed.clone(),
                added: values,
            },
        )?;
        Ok(removed)
    }

    /// Tear the sequence down: anchors are dropped, later mutations fail
    pub fn destroy(&self, g: &mut ReactiveGraph) {
        let mut inner = self.inner.borrow_mut();
        inner.lifecycle = Lifecycle::Destroyed;
        inner.index_listeners.clear();
        inner.length_listeners.clear();
        for cell in inner.index_cells.drain(..) {
            g.remove_cell(cell);
        }
        inner.items.clear();
        g.remove_cell(inner.indices_anchor);
        g.remove_cell(inner.length_anchor);
        tracing::debug!("sequence destroyed");
    }

    // =========================================================================
    // LISTENERS
    // =========================================================================

    /// Listen for index-bucket records (set, reverse, sort, balanced splice)
    pub fn on_index(
        &self,
        f: impl FnMut(&mut ReactiveGraph, &ChangeRecord<T>) + 'static,
    ) -> SeqListenerId {
        self.attach(f, true, false)
    }

    /// Listen for length-bucket records (add/remove family, set-length)
    pub fn on_length(
        &self,
        f: impl FnMut(&mut ReactiveGraph, &ChangeRecord<T>) + 'static,
    ) -> SeqListenerId {
        self.attach(f, false, true)
    }

    /// Listen for every record. Each mutation produces exactly one record,
    /// delivered once.
    pub fn on(
        &self,
        f: impl FnMut(&mut ReactiveGraph, &ChangeRecord<T>) + 'static,
    ) -> SeqListenerId {
        self.attach(f, true, true)
    }

    pub fn off(&self, id: SeqListenerId) {
        let mut inner = self.inner.borrow_mut();
        inner.index_listeners.retain(|e| e.id != id.0);
        inner.length_listeners.retain(|e| e.id != id.0);
    }

    fn attach(
        &self,
        f: impl FnMut(&mut ReactiveGraph, &ChangeRecord<T>) + 'static,
        index_bucket: bool,
        length_bucket: bool,
    ) -> SeqListenerId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_listener;
        inner.next_listener += 1;
        let callback: Box<dyn FnMut(&mut ReactiveGraph, &ChangeRecord<T>)> = Box::new(f);
        let entry = ListenerEntry {
            id,
            callback: Rc::new(RefCell::new(Some(callback))),
        };
        if index_bucket {
            inner.index_listeners.push(entry.clone());
        }
        if length_bucket {
            inner.length_listeners.push(entry);
        }
        SeqListenerId(id)
    }

    // =========================================================================
    // DERIVED SEQUENCES
    // =========================================================================

    /// Elementwise-transformed view, kept consistent by positional
    /// translation of incoming records.
    ///
    /// A translation failure has no caller to report to; it is logged at
    /// `warn` and leaves the view out of sync.
    pub fn map<U, F>(&self, g: &mut ReactiveGraph, f: F) -> ReactiveSeq<U>
    where
        U: Clone + PartialEq + 'static,
        F: FnMut(&T) -> U + 'static,
    {
        let mapper = Rc::new(RefCell::new(f));
        let initial = {
            let mut m = mapper.borrow_mut();
            self.inner.borrow().items.iter().map(|v| (*m)(v)).collect()
        };
        let derived = ReactiveSeq::new(g, initial);

        let source = Rc::downgrade(&self.inner);
        let target = Rc::downgrade(&derived.inner);
        self.on(move |g, record| {
            let (Some(src), Some(dst)) = (source.upgrade(), target.upgrade()) else {
                return;
            };
            let dst = ReactiveSeq { inner: dst };
            let mut m = mapper.borrow_mut();
            let outcome = match record.op {
                SeqOp::Set => match record.added.first() {
                    Some(v) => dst.set(g, record.index, (*m)(v)),
                    None => Ok(()),
                },
                SeqOp::Add => dst.insert_all(g, record.index, record.added.iter().map(|v| (*m)(v)).collect()),
                SeqOp::Remove => dst.remove_at(g, record.index, record.removed.len()).map(|_| ()),
                SeqOp::SetLength => dst.set_len(g, record.index),
                SeqOp::Splice => dst
                    .splice(
                        g,
                        record.index,
                        record.removed.len(),
                        record.added.iter().map(|v| (*m)(v)).collect(),
                    )
                    .map(|_| ()),
                SeqOp::Reverse => dst.reverse(g),
                // A comparator permutation is not positionally translatable:
                // re-map the source and patch by diff.
                SeqOp::Sort => {
                    let remapped: Vec<U> = src.borrow().items.iter().map(|v| (*m)(v)).collect();
                    dst.patch_to(g, remapped)
                }
            };
            if let Err(err) = outcome {
                tracing::warn!(%err, "map translation failed, view out of sync");
            }
        });
        derived
    }

    /// Filtered view. Not positionally translatable: every incoming record
    /// re-applies the predicate to the full source and patches this view by
    /// diff, so unchanged regions are untouched.
    ///
    /// A patch failure has no caller to report to; it is logged at `warn`
    /// and leaves the view out of sync.
    pub fn filter<F>(&self, g: &mut ReactiveGraph, predicate: F) -> ReactiveSeq<T>
    where
        F: FnMut(&T) -> bool + 'static,
    {
        let predicate = Rc::new(RefCell::new(predicate));
        let initial = {
            let mut p = predicate.borrow_mut();
            self.inner
                .borrow()
                .items
                .iter()
                .filter(|&v| (*p)(v))
                .cloned()
                .collect()
        };
        let derived = ReactiveSeq::new(g, initial);

        let source = Rc::downgrade(&self.inner);
        let target = Rc::downgrade(&derived.inner);
        self.on(move |g, _record| {
            let (Some(src), Some(dst)) = (source.upgrade(), target.upgrade()) else {
                return;
            };
            let dst = ReactiveSeq { inner: dst };
            let refiltered: Vec<T> = {
                let mut p = predicate.borrow_mut();
                src.borrow().items.iter().filter(|&v| (*p)(v)).cloned().collect()
            };
            if let Err(err) = dst.patch_to(g, refiltered) {
                tracing::warn!(%err, "refilter failed, view out of sync");
            }
        });
        derived
    }

    /// Windowed view over `[start, end)` of the source.
    ///
    /// A translation failure has no caller to report to; it is logged at
    /// `warn` and leaves the view out of sync.
    pub fn slice(&self, g: &mut ReactiveGraph, start: usize, end: usize) -> ReactiveSeq<T> {
        let window = move |items: &[T]| -> Vec<T> {
            let lo = start.min(items.len());
            let hi = end.min(items.len()).max(lo);
            items[lo..hi].to_vec()
        };
        let derived = ReactiveSeq::new(g, window(&self.inner.borrow().items));

        let source = Rc::downgrade(&self.inner);
        let target = Rc::downgrade(&derived.inner);
        self.on(move |g, record| {
            let (Some(src), Some(dst)) = (source.upgrade(), target.upgrade()) else {
                return;
            };
            let dst = ReactiveSeq { inner: dst };
            let outcome = match record.op {
                // In-window sets translate positionally.
                SeqOp::Set if record.index >= start && record.index < end => match record
                    .added
                    .first()
                {
                    Some(v) => dst.set(g, record.index - start, v.clone()),
                    None => Ok(()),
                },
                SeqOp::Set => Ok(()),
                // Length deltas shift the window contents: recut and patch.
                _ => {
                    let recut = window(&src.borrow().items);
                    dst.patch_to(g, recut)
                }
            };
            if let Err(err) = outcome {
                tracing::warn!(%err, "slice translation failed, view out of sync");
            }
        });
        derived
    }

    /// Concatenated view of `self` followed by `other`. Each operand gets an
    /// independent translator; the right operand's indices are offset by the
    /// left operand's current length.
    ///
    /// A translation failure has no caller to report to; it is logged at
    /// `warn` and leaves the view out of sync.
    pub fn concat(&self, g: &mut ReactiveGraph, other: &ReactiveSeq<T>) -> ReactiveSeq<T> {
        let left_items = self.inner.borrow().items.clone();
        let boundary = Rc::new(Cell::new(left_items.len()));
        let mut initial = left_items;
        initial.extend(other.inner.borrow().items.iter().cloned());
        let derived = ReactiveSeq::new(g, initial);

        let left_src = Rc::downgrade(&self.inner);
        let target = Rc::downgrade(&derived.inner);
        let left_boundary = boundary.clone();
        self.on(move |g, record| {
            let (Some(src), Some(dst)) = (left_src.upgrade(), target.upgrade()) else {
                return;
            };
            let dst = ReactiveSeq { inner: dst };
            let outcome =
                translate_concat_operand(g, &dst, record, 0, &left_boundary, true, &src.borrow().items);
            if let Err(err) = outcome {
                tracing::warn!(%err, "concat translation failed, view out of sync");
            }
        });

        let right_src = Rc::downgrade(&other.inner);
        let target = Rc::downgrade(&derived.inner);
        other.on(move |g, record| {
            let (Some(src), Some(dst)) = (right_src.upgrade(), target.upgrade()) else {
                return;
            };
            let dst = ReactiveSeq { inner: dst };
            let offset = boundary.get();
            let outcome =
                translate_concat_operand(g, &dst, record, offset, &boundary, false, &src.borrow().items);
            if let Err(err) = outcome {
                tracing::warn!(%err, "concat translation failed, view out of sync");
            }
        });

        derived
    }

    // =========================================================================
    // INTERNAL
    // =========================================================================

    /// Insert `values` at `index`, broadcasting one `Add` record
    fn insert_all(&self, g: &mut ReactiveGraph, index: usize, values: Vec<T>) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            inner.ensure_live()?;
            let len = inner.items.len();
            if index > len {
                return Err(ReactiveError::IndexOutOfBounds { index, len });
            }
            inner.items.splice(index..index, values.iter().cloned());
            inner.sync_index_cells(g);
        }
        self.emit(
            g,
            ChangeRecord {
                op: SeqOp::Add,
                index,
                removed: Vec::new(),
                added: values,
            },
        )
    }

    /// Remove `count` elements at `index`, broadcasting one `Remove` record
    fn remove_at(&self, g: &mut ReactiveGraph, index: usize, count: usize) -> Result<Vec<T>> {
        let removed = {
            let mut inner = self.inner.borrow_mut();
            inner.ensure_live()?;
            let len = inner.items.len();
            if index > len {
                return Err(ReactiveError::IndexOutOfBounds { index, len });
            }
            let end = (index + count).min(len);
            let removed: Vec<T> = inner.items.drain(index..end).collect();
            inner.sync_index_cells(g);
            removed
        };
        if removed.is_empty() {
            return Ok(removed);
        }
        self.emit(
            g,
            ChangeRecord {
                op: SeqOp::Remove,
                index,
                removed: removed.clone(),
                added: Vec::new(),
            },
        )?;
        Ok(removed)
    }

    /// Diff the current elements against `next` and apply the runs as
    /// Add/Remove/Splice mutations, highest index first.
    fn patch_to(&self, g: &mut ReactiveGraph, next: Vec<T>) -> Result<()> {
        let patch: Patch<T> = {
            let inner = self.inner.borrow();
            diff::diff(&inner.items, &next)
        };
        for (&index, run) in patch.iter().rev() {
            if run.old.is_empty() {
                self.insert_all(g, index, run.new.clone())?;
            } else if run.new.is_empty() {
                self.remove_at(g, index, run.old.len())?;
            } else {
                self.splice(g, index, run.old.len(), run.new.clone())?;
            }
        }
        Ok(())
    }

    /// Broadcast one record: anchors first (waking captured dependents),
    /// then the matching listener bucket, in registration order. The
    /// listener set is captured before the first callback runs.
    fn emit(&self, g: &mut ReactiveGraph, record: ChangeRecord<T>) -> Result<()> {
        let bucket = bucket_for(&record);
        let (indices_anchor, length_anchor, listeners) = {
            let inner = self.inner.borrow();
            let listeners = match bucket {
                Bucket::Index => inner.index_listeners.clone(),
                Bucket::Length => inner.length_listeners.clone(),
            };
            (inner.indices_anchor, inner.length_anchor, listeners)
        };
        g.touch(indices_anchor)?;
        if bucket == Bucket::Length {
            g.touch(length_anchor)?;
        }
        // Callbacks are checked out while they run: a listener that mutates
        // this same sequence re-enters emit and skips itself.
        for entry in listeners {
            let taken = entry.callback.borrow_mut().take();
            let Some(mut callback) = taken else { continue };
            callback(g, &record);
            *entry.callback.borrow_mut() = Some(callback);
        }
        Ok(())
    }
}

impl<T: Clone + Ord + 'static> ReactiveSeq<T> {
    /// Sort in ascending order
    pub fn sort(&self, g: &mut ReactiveGraph) -> Result<()> {
        self.sort_by(g, T::cmp)
    }
}

/// Apply one operand's record to a concatenated view. `boundary` tracks the
/// left operand's length; only the left translator moves it.
fn translate_concat_operand<T: Clone + PartialEq + 'static>(
    g: &mut ReactiveGraph,
    dst: &ReactiveSeq<T>,
    record: &ChangeRecord<T>,
    offset: usize,
    boundary: &Rc<Cell<usize>>,
    is_left: bool,
    operand_items: &[T],
) -> Result<()> {
    let shift_boundary = |delta: isize| {
        if is_left {
            boundary.set((boundary.get() as isize + delta) as usize);
        }
    };
    match record.op {
        SeqOp::Set => match record.added.first() {
            Some(v) => dst.set(g, offset + record.index, v.clone()),
            None => Ok(()),
        },
        SeqOp::Add => {
            dst.insert_all(g, offset + record.index, record.added.clone())?;
            shift_boundary(record.added.len() as isize);
            Ok(())
        }
        SeqOp::Remove => {
            dst.remove_at(g, offset + record.index, record.removed.len())?;
            shift_boundary(-(record.removed.len() as isize));
            Ok(())
        }
        SeqOp::SetLength => {
            let dropped = record.removed.len();
            dst.remove_at(g, offset + record.index, dropped)?;
            shift_boundary(-(dropped as isize));
            Ok(())
        }
        SeqOp::Splice => {
            dst.splice(
                g,
                offset + record.index,
                record.removed.len(),
                record.added.clone(),
            )?;
            shift_boundary(record.added.len() as isize - record.removed.len() as isize);
            Ok(())
        }
        // Permutations rebuild just this operand's region of the view.
        SeqOp::Reverse | SeqOp::Sort => {
            let (before, after) = {
                let inner = dst.inner.borrow();
                let split = if is_left {
                    boundary.get().min(inner.items.len())
                } else {
                    offset.min(inner.items.len())
                };
                if is_left {
                    (Vec::new(), inner.items[split..].to_vec())
                } else {
                    (inner.items[..split].to_vec(), Vec::new())
                }
            };
            let mut next = before;
            next.extend(operand_items.iter().cloned());
            next.extend(after);
            dst.patch_to(g, next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn records<T>() -> (
        Rc<RefCell<Vec<ChangeRecord<T>>>>,
        impl FnMut(&mut ReactiveGraph, &ChangeRecord<T>) + 'static,
    )
    where
        T: Clone + 'static,
    {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |_g: &mut ReactiveGraph, r: &ChangeRecord<T>| {
            sink.borrow_mut().push(r.clone())
        })
    }

    #[test]
    fn test_push_emits_add_records_on_length_bucket() {
        let mut g = ReactiveGraph::new();
        let seq = ReactiveSeq::new(&mut g, vec![1, 2, 3]);
        let (seen, sink) = records();
        seq.on_length(sink);

        seq.push(&mut g, 4).unwrap();
        seq.push(&mut g, 5).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].op, SeqOp::Add);
        assert_eq!(seen[0].index, 3);
        assert_eq!(seen[0].added, vec![4]);
        assert_eq!(seen[1].added, vec![5]);
        drop(seen);
        assert_eq!(seq.snapshot(&mut g), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_set_emits_on_index_bucket_only() {
        let mut g = ReactiveGraph::new();
        let seq = ReactiveSeq::new(&mut g, vec![1, 2, 3]);
        let (index_seen, index_sink) = records();
        let (length_seen, length_sink) = records();
        seq.on_index(index_sink);
        seq.on_length(length_sink);

        seq.set(&mut g, 1, 9).unwrap();
        assert_eq!(index_seen.borrow().len(), 1);
        assert!(length_seen.borrow().is_empty());

        let record = &index_seen.borrow()[0];
        assert_eq!(record.op, SeqOp::Set);
        assert_eq!(record.index, 1);
        assert_eq!(record.removed, vec![2]);
        assert_eq!(record.added, vec![9]);
    }

    #[test]
    fn test_set_equal_value_is_silent() {
        let mut g = ReactiveGraph::new();
        let seq = ReactiveSeq::new(&mut g, vec![1, 2, 3]);
        let (seen, sink) = records::<i32>();
        seq.on(sink);

        seq.set(&mut g, 0, 1).unwrap();
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_mutation_validation_precedes_mutation() {
        let mut g = ReactiveGraph::new();
        let seq = ReactiveSeq::new(&mut g, vec![1, 2, 3]);
        let (seen, sink) = records::<i32>();
        seq.on(sink);

        assert_eq!(
            seq.set(&mut g, 7, 0),
            Err(ReactiveError::IndexOutOfBounds { index: 7, len: 3 })
        );
        assert!(seq.set_len(&mut g, 5).is_err());
        assert!(seq.splice(&mut g, 9, 0, vec![7]).is_err());

        assert!(seen.borrow().is_empty());
        assert_eq!(seq.snapshot(&mut g), vec![1, 2, 3]);
    }

    #[test]
    fn test_container_count_tracks_length() {
        let mut g = ReactiveGraph::new();
        let seq = ReactiveSeq::new(&mut g, vec![1, 2, 3]);
        assert_eq!(seq.container_count(), 3);

        seq.push(&mut g, 4).unwrap();
        seq.unshift(&mut g, 0).unwrap();
        assert_eq!(seq.container_count(), 5);

        seq.pop(&mut g).unwrap();
        seq.shift(&mut g).unwrap();
        assert_eq!(seq.container_count(), 3);

        seq.splice(&mut g, 1, 2, vec![7]).unwrap();
        assert_eq!(seq.container_count(), seq.snapshot(&mut g).len());

        seq.set_len(&mut g, 0).unwrap();
        assert_eq!(seq.container_count(), 0);
    }

    #[test]
    fn test_splice_bucket_depends_on_balance() {
        let mut g = ReactiveGraph::new();
        let seq = ReactiveSeq::new(&mut g, vec![1, 2, 3, 4]);
        let (index_seen, index_sink) = records();
        let (length_seen, length_sink) = records();
        seq.on_index(index_sink);
        seq.on_length(length_sink);

        // Equal-count splice: index bucket.
        seq.splice(&mut g, 1, 2, vec![8, 9]).unwrap();
        assert_eq!(index_seen.borrow().len(), 1);
        assert!(length_seen.borrow().is_empty());

        // Unbalanced splice: length bucket.
        seq.splice(&mut g, 0, 1, vec![]).unwrap();
        assert_eq!(length_seen.borrow().len(), 1);
        assert_eq!(seq.snapshot(&mut g), vec![8, 9, 4]);
    }

    #[test]
    fn test_pop_shift_record_shape() {
        let mut g = ReactiveGraph::new();
        let seq = ReactiveSeq::new(&mut g, vec![1, 2, 3]);
        let (seen, sink) = records();
        seq.on_length(sink);

        assert_eq!(seq.pop(&mut g).unwrap(), Some(3));
        assert_eq!(seq.shift(&mut g).unwrap(), Some(1));

        let seen = seen.borrow();
        assert_eq!(seen[0].op, SeqOp::Remove);
        assert_eq!(seen[0].index, 2);
        assert_eq!(seen[0].removed, vec![3]);
        assert_eq!(seen[1].index, 0);
        assert_eq!(seen[1].removed, vec![1]);
    }

    #[test]
    fn test_queries_register_coarse_dependency() {
        let mut g = ReactiveGraph::new();
        let seq = ReactiveSeq::new(&mut g, vec![1, 2, 3]);
        let seq2 = seq.clone();
        let total = g.create_computed("total", move |g| seq2.fold(g, 0, |acc, v| acc + v));

        assert_eq!(g.read::<i32>(total).unwrap(), 6);
        seq.push(&mut g, 10).unwrap();
        assert_eq!(g.read_untracked::<i32>(total).unwrap(), 16);

        seq.set(&mut g, 0, 5).unwrap();
        assert_eq!(g.read_untracked::<i32>(total).unwrap(), 20);
    }

    #[test]
    fn test_map_translates_positionally() {
        let mut g = ReactiveGraph::new();
        let seq = ReactiveSeq::new(&mut g, vec![1, 2, 3]);
        let doubled = seq.map(&mut g, |v| v * 2);
        assert_eq!(doubled.snapshot(&mut g), vec![2, 4, 6]);

        seq.push(&mut g, 4).unwrap();
        seq.set(&mut g, 0, 10).unwrap();
        assert_eq!(doubled.snapshot(&mut g), vec![20, 4, 6, 8]);

        seq.shift(&mut g).unwrap();
        assert_eq!(doubled.snapshot(&mut g), vec![4, 6, 8]);

        seq.reverse(&mut g).unwrap();
        assert_eq!(doubled.snapshot(&mut g), vec![8, 6, 4]);
    }

    #[test]
    fn test_filter_patches_by_diff_with_add_record() {
        let mut g = ReactiveGraph::new();
        let seq = ReactiveSeq::new(&mut g, vec![1, 2, 3, 4, 5]);
        let evens = seq.filter(&mut g, |v| v % 2 == 0);
        assert_eq!(evens.snapshot(&mut g), vec![2, 4]);

        let (seen, sink) = records();
        evens.on(sink);

        // 5 -> 6: the view grows by one element, patched as a single Add.
        seq.set(&mut g, 4, 6).unwrap();
        assert_eq!(evens.snapshot(&mut g), vec![2, 4, 6]);
        {
            let seen = seen.borrow();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].op, SeqOp::Add);
            assert_eq!(seen[0].index, 2);
            assert_eq!(seen[0].added, vec![6]);
        }

        // And back out: the replacement leaves the view by a single removal.
        seq.set(&mut g, 4, 7).unwrap();
        assert_eq!(evens.snapshot(&mut g), vec![2, 4]);
    }

    #[test]
    fn test_filter_after_push_and_remove() {
        let mut g = ReactiveGraph::new();
        let seq = ReactiveSeq::new(&mut g, vec![1, 2, 3]);
        let evens = seq.filter(&mut g, |v| v % 2 == 0);

        seq.push(&mut g, 4).unwrap();
        assert_eq!(evens.snapshot(&mut g), vec![2, 4]);

        seq.shift(&mut g).unwrap(); // [2, 3, 4]
        assert_eq!(evens.snapshot(&mut g), vec![2, 4]);

        seq.splice(&mut g, 0, 1, vec![]).unwrap(); // [3, 4]
        assert_eq!(evens.snapshot(&mut g), vec![4]);
        assert_eq!(evens.container_count(), 1);
    }

    #[test]
    fn test_slice_window() {
        let mut g = ReactiveGraph::new();
        let seq = ReactiveSeq::new(&mut g, vec![1, 2, 3, 4, 5]);
        let mid = seq.slice(&mut g, 1, 4);
        assert_eq!(mid.snapshot(&mut g), vec![2, 3, 4]);

        seq.set(&mut g, 2, 9).unwrap(); // in window
        assert_eq!(mid.snapshot(&mut g), vec![2, 9, 4]);

        seq.set(&mut g, 4, 50).unwrap(); // outside window
        assert_eq!(mid.snapshot(&mut g), vec![2, 9, 4]);

        seq.shift(&mut g).unwrap(); // [2, 9, 4, 50] -> window [9, 4, 50]
        assert_eq!(mid.snapshot(&mut g), vec![9, 4, 50]);
    }

    #[test]
    fn test_concat_offsets_right_operand() {
        let mut g = ReactiveGraph::new();
        let left = ReactiveSeq::new(&mut g, vec![1, 2]);
        let right = ReactiveSeq::new(&mut g, vec![10, 20]);
        let joined = left.concat(&mut g, &right);
        assert_eq!(joined.snapshot(&mut g), vec![1, 2, 10, 20]);

        right.set(&mut g, 0, 11).unwrap();
        assert_eq!(joined.snapshot(&mut g), vec![1, 2, 11, 20]);

        left.push(&mut g, 3).unwrap();
        assert_eq!(joined.snapshot(&mut g), vec![1, 2, 3, 11, 20]);

        // The boundary moved with the left push: right edits still land
        // after the left region.
        right.push(&mut g, 30).unwrap();
        assert_eq!(joined.snapshot(&mut g), vec![1, 2, 3, 11, 20, 30]);

        left.shift(&mut g).unwrap();
        assert_eq!(joined.snapshot(&mut g), vec![2, 3, 11, 20, 30]);

        right.reverse(&mut g).unwrap();
        assert_eq!(joined.snapshot(&mut g), vec![2, 3, 30, 20, 11]);
    }

    #[test]
    fn test_destroy_blocks_mutation() {
        let mut g = ReactiveGraph::new();
        let seq = ReactiveSeq::new(&mut g, vec![1, 2]);
        seq.destroy(&mut g);
        assert_eq!(seq.lifecycle(), Lifecycle::Destroyed);
        assert_eq!(seq.push(&mut g, 3), Err(ReactiveError::Destroyed));
        assert_eq!(seq.container_count(), 0);
    }

    #[test]
    fn test_listener_may_mutate_its_own_sequence() {
        let mut g = ReactiveGraph::new();
        let seq = ReactiveSeq::new(&mut g, vec![1, 2, 3]);
        // A clamp: any growth past three elements is trimmed from the tail.
        let clamp = seq.clone();
        seq.on_length(move |g, _record| {
            while clamp.len(g) > 3 {
                let _ = clamp.pop(g);
            }
        });

        seq.push(&mut g, 4).unwrap();
        assert_eq!(seq.snapshot(&mut g), vec![1, 2, 3]);
        assert_eq!(seq.container_count(), 3);

        seq.extend(&mut g, vec![5, 6]).unwrap();
        assert_eq!(seq.snapshot(&mut g), vec![1, 2, 3]);
    }

    #[test]
    fn test_off_detaches_listener() {
        let mut g = ReactiveGraph::new();
        let seq = ReactiveSeq::new(&mut g, vec![1]);
        let (seen, sink) = records::<i32>();
        let id = seq.on(sink);

        seq.push(&mut g, 2).unwrap();
        assert_eq!(seen.borrow().len(), 1);

        seq.off(id);
        seq.push(&mut g, 3).unwrap();
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_chained_derivations() {
        let mut g = ReactiveGraph::new();
        let seq = ReactiveSeq::new(&mut g, vec![1, 2, 3, 4]);
        let evens = seq.filter(&mut g, |v| v % 2 == 0);
        let scaled = evens.map(&mut g, |v| v * 10);
        assert_eq!(scaled.snapshot(&mut g), vec![20, 40]);

        seq.push(&mut g, 6).unwrap();
        assert_eq!(scaled.snapshot(&mut g), vec![20, 40, 60]);

        seq.set(&mut g, 1, 3).unwrap(); // drop the 2
        assert_eq!(scaled.snapshot(&mut g), vec![40, 60]);
    }

    #[test]
    fn test_sort_record_and_map_fallback() {
        let mut g = ReactiveGraph::new();
        let seq = ReactiveSeq::new(&mut g, vec![3, 1, 2]);
        let doubled = seq.map(&mut g, |v| v * 2);
        let (seen, sink) = records();
        seq.on_index(sink);

        seq.sort(&mut g).unwrap();
        assert_eq!(seq.snapshot(&mut g), vec![1, 2, 3]);
        assert_eq!(seen.borrow()[0].op, SeqOp::Sort);
        assert_eq!(seen.borrow()[0].index, 0);
        // The mapped view cannot translate a permutation positionally; it
        // re-maps and patches by diff.
        assert_eq!(doubled.snapshot(&mut g), vec![2, 4, 6]);
    }
}

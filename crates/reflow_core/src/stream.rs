//! Push-based event streams
//!
//! A [`Stream`] has no retained value: triggering a value runs it through
//! the stream's transform chain and delivers each surviving output to the
//! listeners registered at the start of that delivery. Transforms flat-map:
//! one input can become one output, several, or none ([`Emit::Skip`]).
//!
//! [`SizeBufferedStream`] wraps a stream with a fixed-capacity accumulator:
//! triggered values are held (together with their transform flag) until the
//! buffer reaches exactly its capacity, then replayed in arrival order.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::{ReactiveError, Result};
use crate::reactive::ReactiveGraph;

/// What a transform produces for one input
pub enum Emit<T> {
    Value(T),
    Many(Vec<T>),
    Skip,
}

/// Handle for detaching a stream listener
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamListenerId(u64);

/// `None` while the callback is checked out for a delivery
type StreamCallback<T> = Rc<RefCell<Option<Box<dyn FnMut(&mut ReactiveGraph, &T)>>>>;
type Transform<T> = Box<dyn FnMut(T) -> Emit<T>>;

struct StreamInner<T: 'static> {
    listeners: Vec<(u64, StreamCallback<T>)>,
    transforms: Vec<Transform<T>>,
    next_listener: u64,
}

/// A source of discrete events
pub struct Stream<T: 'static> {
    inner: Rc<RefCell<StreamInner<T>>>,
}

impl<T: 'static> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Default for Stream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Stream<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(StreamInner {
                listeners: Vec::new(),
                transforms: Vec::new(),
                next_listener: 0,
            })),
        }
    }

    pub fn on(&self, f: impl FnMut(&mut ReactiveGraph, &T) + 'static) -> StreamListenerId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_listener;
        inner.next_listener += 1;
        let callback: Box<dyn FnMut(&mut ReactiveGraph, &T)> = Box::new(f);
        inner.listeners.push((id, Rc::new(RefCell::new(Some(callback)))));
        StreamListenerId(id)
    }

    pub fn off(&self, id: StreamListenerId) {
        self.inner
            .borrow_mut()
            .listeners
            .retain(|(lid, _)| *lid != id.0);
    }

    /// Append a transform to the chain. Transforms run in registration order.
    pub fn add_transform(&self, f: impl FnMut(T) -> Emit<T> + 'static) {
        self.inner.borrow_mut().transforms.push(Box::new(f));
    }

    /// Transform every value elementwise
    pub fn transform_map(&self, mut f: impl FnMut(T) -> T + 'static) {
        self.add_transform(move |v| Emit::Value(f(v)));
    }

    /// Drop values the predicate rejects
    pub fn transform_filter(&self, mut predicate: impl FnMut(&T) -> bool + 'static) {
        self.add_transform(move |v| {
            if predicate(&v) {
                Emit::Value(v)
            } else {
                Emit::Skip
            }
        });
    }

    /// Push a value through the transform chain and deliver it
    pub fn trigger(&self, g: &mut ReactiveGraph, value: T) {
        self.trigger_with(g, value, true);
    }

    /// Push a value, optionally bypassing the transform chain
    pub fn trigger_with(&self, g: &mut ReactiveGraph, value: T, use_transforms: bool) {
        let outputs = if use_transforms {
            self.run_transforms(value)
        } else {
            vec![value]
        };
        // The listener set for the whole trigger call is captured up front:
        // attaching or detaching inside a callback affects the next trigger
        // only, even across flat-mapped outputs. Callbacks are checked out
        // while they run, so a listener that triggers this stream again
        // skips itself in the nested delivery.
        let listeners: Vec<StreamCallback<T>> = self
            .inner
            .borrow()
            .listeners
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for output in outputs {
            for listener in &listeners {
                let taken = listener.borrow_mut().take();
                let Some(mut callback) = taken else { continue };
                callback(g, &output);
                *listener.borrow_mut() = Some(callback);
            }
        }
    }

    /// Flat-map `value` through the chain. The chain is checked out while it
    /// runs so a transform that triggers this stream observes an empty chain
    /// instead of re-entering it.
    fn run_transforms(&self, value: T) -> Vec<T> {
        let mut transforms = std::mem::take(&mut self.inner.borrow_mut().transforms);
        let mut current = vec![value];
        for transform in transforms.iter_mut() {
            let mut next = Vec::new();
            for v in current {
                match transform(v) {
                    Emit::Value(v) => next.push(v),
                    Emit::Many(vs) => next.extend(vs),
                    Emit::Skip => {}
                }
            }
            current = next;
            if current.is_empty() {
                break;
            }
        }
        let mut inner = self.inner.borrow_mut();
        let added = std::mem::replace(&mut inner.transforms, transforms);
        inner.transforms.extend(added);
        current
    }
}

impl<T: 'static> Stream<T> {
    /// Derived stream carrying `f` of every value
    pub fn map<U: 'static>(&self, mut f: impl FnMut(&T) -> U + 'static) -> Stream<U> {
        let out = Stream::new();
        let weak: Weak<RefCell<StreamInner<U>>> = Rc::downgrade(&out.inner);
        self.on(move |g, v| {
            if let Some(inner) = weak.upgrade() {
                Stream { inner }.trigger(g, f(v));
            }
        });
        out
    }

    /// Derived stream carrying only values the predicate accepts
    pub fn filter_stream(&self, mut predicate: impl FnMut(&T) -> bool + 'static) -> Stream<T>
    where
        T: Clone,
    {
        let out = Stream::new();
        let weak = Rc::downgrade(&out.inner);
        self.on(move |g, v| {
            if predicate(v) {
                if let Some(inner) = weak.upgrade() {
                    Stream { inner }.trigger(g, v.clone());
                }
            }
        });
        out
    }

    /// Derived stream interleaving this stream and `other` in trigger order
    pub fn merge(&self, other: &Stream<T>) -> Stream<T>
    where
        T: Clone,
    {
        let out = Stream::new();
        for source in [self, other] {
            let weak = Rc::downgrade(&out.inner);
            source.on(move |g, v| {
                if let Some(inner) = weak.upgrade() {
                    Stream { inner }.trigger(g, v.clone());
                }
            });
        }
        out
    }
}

/// A stream that withholds delivery until a fixed number of values have
/// accumulated, then replays them in order.
pub struct SizeBufferedStream<T: 'static> {
    stream: Stream<T>,
    buffer: Rc<RefCell<Vec<(T, bool)>>>,
    capacity: usize,
}

impl<T: 'static> Clone for SizeBufferedStream<T> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            buffer: self.buffer.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T: 'static> SizeBufferedStream<T> {
    /// Construction fails without a positive capacity: a zero-size buffer
    /// would never hold anything and never flush.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ReactiveError::InvalidCapacity);
        }
        Ok(Self {
            stream: Stream::new(),
            buffer: Rc::new(RefCell::new(Vec::new())),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.borrow().len()
    }

    pub fn on(&self, f: impl FnMut(&mut ReactiveGraph, &T) + 'static) -> StreamListenerId {
        self.stream.on(f)
    }

    pub fn off(&self, id: StreamListenerId) {
        self.stream.off(id);
    }

    pub fn add_transform(&self, f: impl FnMut(T) -> Emit<T> + 'static) {
        self.stream.add_transform(f);
    }

    /// Buffer a value; delivery happens when the buffer reaches capacity
    pub fn trigger(&self, g: &mut ReactiveGraph, value: T) {
        self.trigger_with(g, value, true);
    }

    /// Buffer a value together with its transform flag. The flag is honored
    /// at flush time, per value.
    pub fn trigger_with(&self, g: &mut ReactiveGraph, value: T, use_transforms: bool) {
        let full = {
            let mut buffer = self.buffer.borrow_mut();
            buffer.push((value, use_transforms));
            buffer.len() == self.capacity
        };
        if full {
            self.flush(g);
        }
    }

    /// Replay the buffered values in arrival order. Values triggered while
    /// flushing accumulate into a fresh buffer.
    pub fn flush(&self, g: &mut ReactiveGraph) {
        let drained = std::mem::take(&mut *self.buffer.borrow_mut());
        tracing::trace!(count = drained.len(), "flushing buffered stream");
        for (value, use_transforms) in drained {
            self.stream.trigger_with(g, value, use_transforms);
        }
    }
}

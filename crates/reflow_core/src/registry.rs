//! Named registry for reactive instruments
//!
//! A [`Registry`] maps names to already-built instruments so independent
//! parts of a program can share them by name. Every accessor is
//! create-or-fetch: the first call under a name builds the instrument from
//! the supplied constructor, later calls return the existing one and ignore
//! their constructor. A name bound to one kind of instrument cannot be
//! fetched as another.

use std::any::Any;

use rustc_hash::FxHashMap;

use crate::error::{ReactiveError, Result};
use crate::reactive::{CellId, CoreId, Model, ReactiveGraph};
use crate::seq::ReactiveSeq;
use crate::stream::{SizeBufferedStream, Stream};

/// Caller-owned name-to-instrument map
#[derive(Default)]
pub struct Registry {
    entries: FxHashMap<String, Box<dyn Any>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the container registered under `name`, creating it from `init`
    /// on first use.
    pub fn value<T>(
        &mut self,
        g: &mut ReactiveGraph,
        name: &str,
        init: impl FnOnce() -> T,
    ) -> Result<CellId>
    where
        T: Clone + PartialEq + 'static,
    {
        if let Some(entry) = self.entries.get(name) {
            return fetch::<CellId>(name, entry.as_ref()).copied();
        }
        let cell = g.create_cell(name, init());
        tracing::debug!(name, "registered value container");
        self.entries.insert(name.to_string(), Box::new(cell));
        Ok(cell)
    }

    /// Fetch the reactive object registered under `name`, reactivating the
    /// model from `build` on first use.
    pub fn object(
        &mut self,
        g: &mut ReactiveGraph,
        name: &str,
        build: impl FnOnce() -> Model,
    ) -> Result<CoreId> {
        if let Some(entry) = self.entries.get(name) {
            return fetch::<CoreId>(name, entry.as_ref()).copied();
        }
        let mut model = build();
        let core = g.reactivate(&mut model)?;
        tracing::debug!(name, "registered reactive object");
        self.entries.insert(name.to_string(), Box::new(core));
        Ok(core)
    }

    /// Fetch the sequence registered under `name`, creating it from `init`
    /// on first use.
    pub fn sequence<T>(
        &mut self,
        g: &mut ReactiveGraph,
        name: &str,
        init: impl FnOnce() -> Vec<T>,
    ) -> Result<ReactiveSeq<T>>
    where
        T: Clone + PartialEq + 'static,
    {
        if let Some(entry) = self.entries.get(name) {
            return fetch::<ReactiveSeq<T>>(name, entry.as_ref()).cloned();
        }
        let seq = ReactiveSeq::new(g, init());
        tracing::debug!(name, "registered sequence");
        self.entries.insert(name.to_string(), Box::new(seq.clone()));
        Ok(seq)
    }

    /// Fetch the stream registered under `name`, creating an empty one on
    /// first use.
    pub fn stream<T: 'static>(&mut self, name: &str) -> Result<Stream<T>> {
        if let Some(entry) = self.entries.get(name) {
            return fetch::<Stream<T>>(name, entry.as_ref()).cloned();
        }
        let stream = Stream::new();
        tracing::debug!(name, "registered stream");
        self.entries
            .insert(name.to_string(), Box::new(stream.clone()));
        Ok(stream)
    }

    /// Fetch the buffered stream registered under `name`, creating one with
    /// `capacity` on first use. An existing entry keeps its own capacity.
    pub fn buffered_stream<T: 'static>(
        &mut self,
        name: &str,
        capacity: usize,
    ) -> Result<SizeBufferedStream<T>> {
        if let Some(entry) = self.entries.get(name) {
            return fetch::<SizeBufferedStream<T>>(name, entry.as_ref()).cloned();
        }
        let stream = SizeBufferedStream::new(capacity)?;
        tracing::debug!(name, capacity, "registered buffered stream");
        self.entries
            .insert(name.to_string(), Box::new(stream.clone()));
        Ok(stream)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Drop the binding. The instrument itself is untouched; live handles
    /// keep working.
    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn fetch<'a, K: 'static>(name: &str, entry: &'a dyn Any) -> Result<&'a K> {
    entry
        .downcast_ref::<K>()
        .ok_or_else(|| ReactiveError::RegistryTypeMismatch(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_create_or_fetch() {
        let mut g = ReactiveGraph::new();
        let mut registry = Registry::new();

        let first = registry.value(&mut g, "counter", || 0i64).unwrap();
        g.write(first, 5i64).unwrap();

        // The second constructor never runs.
        let second = registry.value(&mut g, "counter", || 999i64).unwrap();
        assert_eq!(first, second);
        assert_eq!(g.read::<i64>(second).unwrap(), 5);
    }

    #[test]
    fn test_object_create_or_fetch() {
        let mut g = ReactiveGraph::new();
        let mut registry = Registry::new();

        let build = || {
            Model::new().field("x", 1i64).field("y", 2i64).computed(
                "sum",
                |g: &mut ReactiveGraph, core| {
                    let x: i64 = g.read_field(core, "x").unwrap_or(0);
                    let y: i64 = g.read_field(core, "y").unwrap_or(0);
                    x + y
                },
            )
        };
        let core = registry.object(&mut g, "point", build).unwrap();
        assert_eq!(g.read_field::<i64>(core, "sum").unwrap(), 3);

        let again = registry
            .object(&mut g, "point", || Model::new().field("unused", 0i64))
            .unwrap();
        assert_eq!(core, again);
    }

    #[test]
    fn test_sequence_and_stream_entries() {
        let mut g = ReactiveGraph::new();
        let mut registry = Registry::new();

        let seq = registry.sequence(&mut g, "items", || vec![1, 2]).unwrap();
        seq.push(&mut g, 3).unwrap();
        let same = registry
            .sequence::<i32>(&mut g, "items", Vec::new)
            .unwrap();
        assert_eq!(same.snapshot(&mut g), vec![1, 2, 3]);

        let stream = registry.stream::<i32>("events").unwrap();
        let again = registry.stream::<i32>("events").unwrap();
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = seen.clone();
        again.on(move |_g, v: &i32| sink.borrow_mut().push(*v));
        stream.trigger(&mut g, 7);
        assert_eq!(*seen.borrow(), vec![7]);
    }

    #[test]
    fn test_kind_mismatch_is_an_error() {
        let mut g = ReactiveGraph::new();
        let mut registry = Registry::new();
        registry.value(&mut g, "thing", || 1i64).unwrap();

        assert_eq!(
            registry.sequence::<i32>(&mut g, "thing", Vec::new).err(),
            Some(ReactiveError::RegistryTypeMismatch("thing".into()))
        );
        assert!(registry.stream::<i32>("thing").is_err());
    }

    #[test]
    fn test_remove_frees_the_name() {
        let mut g = ReactiveGraph::new();
        let mut registry = Registry::new();
        registry.value(&mut g, "n", || 1i64).unwrap();
        assert!(registry.contains("n"));

        assert!(registry.remove("n"));
        assert!(!registry.contains("n"));
        assert!(!registry.remove("n"));

        let fresh = registry.value(&mut g, "n", || 42i64).unwrap();
        assert_eq!(g.read::<i64>(fresh).unwrap(), 42);
    }

    #[test]
    fn test_buffered_stream_capacity_validation() {
        let mut registry = Registry::new();
        assert!(registry.buffered_stream::<i32>("b", 0).is_err());
        let b = registry.buffered_stream::<i32>("b", 2).unwrap();
        assert_eq!(b.capacity(), 2);

        // Fetch ignores the new capacity.
        let again = registry.buffered_stream::<i32>("b", 9).unwrap();
        assert_eq!(again.capacity(), 2);
    }
}

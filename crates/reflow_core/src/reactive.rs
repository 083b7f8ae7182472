//! Fine-grained reactive containers with automatic dependency capture
//!
//! Every host field becomes a [`CellId`] in a [`ReactiveGraph`]. Reading a
//! cell while a computed cell is being evaluated registers a dependency edge
//! implicitly - there is no explicit subscription call site. Writing a cell
//! notifies its dependents synchronously, depth-first, before the write
//! returns; computed dependents rerun their closure, rebuilding their edge
//! set from scratch so conditional dependencies self-correct.
//!
//! ```
//! use reflow_core::reactive::{Model, ReactiveGraph};
//!
//! let mut graph = ReactiveGraph::new();
//! let mut model = Model::new()
//!     .field("x", 0i64)
//!     .field("y", 0i64)
//!     .computed("sum", |g, core| {
//!         let x: i64 = g.read_field(core, "x").unwrap_or(0);
//!         let y: i64 = g.read_field(core, "y").unwrap_or(0);
//!         x + y
//!     });
//! let core = graph.reactivate(&mut model).unwrap();
//!
//! graph.write_field(core, "x", 5i64).unwrap();
//! graph.write_field(core, "y", 4i64).unwrap();
//! assert_eq!(graph.read_field::<i64>(core, "sum").unwrap(), 9);
//! ```

use indexmap::IndexMap;
use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use std::any::{Any, TypeId};

use crate::error::{ReactiveError, Result};

new_key_type! {
    /// Unique identifier for a reactive container
    pub struct CellId;
    /// Unique identifier for a per-host core
    pub struct CoreId;
    /// Unique identifier for a callback listener
    pub struct ListenerId;
}

/// Lifecycle of a core or container.
///
/// `Init -> Ready` on successful wiring, `Init -> Error` on wiring failure,
/// `Ready -> Destroyed` on explicit teardown. `Error` and `Destroyed` are
/// terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Init,
    Ready,
    Destroyed,
    Error,
}

/// A value that can live in a type-erased container slot.
///
/// Call sites holding a `&BoxedValue` must deref to the trait object before
/// calling these methods; autoref would otherwise match the blanket impl on
/// the reference type itself.
pub trait CloneAny: Any {
    fn clone_boxed(&self) -> Box<dyn CloneAny>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Clone> CloneAny for T {
    fn clone_boxed(&self) -> Box<dyn CloneAny> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Type-erased container value
pub type BoxedValue = Box<dyn CloneAny>;

/// Per-type strict equality, captured when the container is created
type EqFn = fn(&dyn Any, &dyn Any) -> bool;

fn eq_values<T: PartialEq + 'static>(a: &dyn Any, b: &dyn Any) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Recompute closure of a computed container
type ComputeFn = Box<dyn FnMut(&mut ReactiveGraph) -> Result<BoxedValue>>;

/// Callback listener attached to a container
type ListenerFn = Box<dyn FnMut(&mut ReactiveGraph, &ValueChange)>;

/// Value-change notification delivered to callback listeners
pub struct ValueChange {
    /// The container that changed
    pub source: CellId,
    /// Field name of the changed container
    pub field: String,
    previous: Option<BoxedValue>,
    current: Option<BoxedValue>,
}

impl ValueChange {
    /// The value before the change, if its type matches
    pub fn previous<T: 'static>(&self) -> Option<&T> {
        self.previous.as_ref().and_then(|v| (**v).as_any().downcast_ref())
    }

    /// The value after the change, if its type matches
    pub fn current<T: 'static>(&self) -> Option<&T> {
        self.current.as_ref().and_then(|v| (**v).as_any().downcast_ref())
    }
}

/// Dependents of a container, in registration order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dependent {
    /// A computed container that read this one during its last recompute
    Cell(CellId),
    /// An external callback
    Callback(ListenerId),
}

enum CellKind {
    Plain,
    /// `None` while the closure is checked out for a recompute
    Computed(Option<ComputeFn>),
}

struct CellNode {
    field: String,
    kind: CellKind,
    value: Option<BoxedValue>,
    previous: Option<BoxedValue>,
    value_type: TypeId,
    eq: EqFn,
    lifecycle: Lifecycle,
    /// Dependents in registration order
    listeners: SmallVec<[Dependent; 4]>,
    /// For computed cells: current inbound edges, dropped before each rerun
    dependencies: SmallVec<[CellId; 4]>,
}

struct CoreNode {
    fields: IndexMap<String, CellId>,
    lifecycle: Lifecycle,
}

struct ListenerNode {
    cell: CellId,
    /// `None` while the callback is checked out for a notification
    callback: Option<ListenerFn>,
}

/// Engine configuration passed at reactivation time
#[derive(Clone, Debug)]
pub struct ReactiveConfig {
    /// Field names hosts may not declare (attachment points of the engine)
    pub reserved_fields: Vec<String>,
}

impl Default for ReactiveConfig {
    fn default() -> Self {
        Self {
            reserved_fields: vec!["core".to_string()],
        }
    }
}

/// The reactive graph owning every container, core, and listener
pub struct ReactiveGraph {
    cells: SlotMap<CellId, CellNode>,
    cores: SlotMap<CoreId, CoreNode>,
    listeners: SlotMap<ListenerId, ListenerNode>,
    /// The active-observer slot of the dependency capture protocol.
    /// Saved and restored around every recompute, so nested evaluations
    /// behave like a stack.
    observer: Option<CellId>,
    config: ReactiveConfig,
}

impl ReactiveGraph {
    pub fn new() -> Self {
        Self::with_config(ReactiveConfig::default())
    }

    pub fn with_config(config: ReactiveConfig) -> Self {
        Self {
            cells: SlotMap::with_key(),
            cores: SlotMap::with_key(),
            listeners: SlotMap::with_key(),
            observer: None,
            config,
        }
    }

    // =========================================================================
    // CONTAINERS
    // =========================================================================

    /// Create a plain container holding `initial`. Plain containers are
    /// `Ready` from birth.
    pub fn create_cell<T>(&mut self, field: &str, initial: T) -> CellId
    where
        T: Clone + PartialEq + 'static,
    {
        self.cells.insert(CellNode {
            field: field.to_string(),
            kind: CellKind::Plain,
            value: Some(Box::new(initial)),
            previous: None,
            value_type: TypeId::of::<T>(),
            eq: eq_values::<T>,
            lifecycle: Lifecycle::Ready,
            listeners: SmallVec::new(),
            dependencies: SmallVec::new(),
        })
    }

    /// Create a computed container. The closure runs lazily on first read,
    /// with the active-observer slot pointing at this container so every
    /// read inside it becomes an inbound edge.
    pub fn create_computed<T, F>(&mut self, field: &str, mut compute: F) -> CellId
    where
        T: Clone + PartialEq + 'static,
        F: FnMut(&mut ReactiveGraph) -> T + 'static,
    {
        self.create_fallible_computed(field, move |g| Ok(compute(g)))
    }

    /// Fallible variant of [`create_computed`](Self::create_computed). A
    /// failed recompute caches nothing and leaves the lifecycle untouched,
    /// so the next read retries.
    pub fn create_fallible_computed<T, F>(&mut self, field: &str, mut compute: F) -> CellId
    where
        T: Clone + PartialEq + 'static,
        F: FnMut(&mut ReactiveGraph) -> Result<T> + 'static,
    {
        let boxed: ComputeFn = Box::new(move |g| compute(g).map(|v| Box::new(v) as BoxedValue));
        self.cells.insert(CellNode {
            field: field.to_string(),
            kind: CellKind::Computed(Some(boxed)),
            value: None,
            previous: None,
            value_type: TypeId::of::<T>(),
            eq: eq_values::<T>,
            lifecycle: Lifecycle::Init,
            listeners: SmallVec::new(),
            dependencies: SmallVec::new(),
        })
    }

    /// Read a container, registering it under the active observer.
    ///
    /// A computed container still in `Init` evaluates now, caches the result
    /// and becomes `Ready`.
    pub fn read<T: Clone + 'static>(&mut self, id: CellId) -> Result<T> {
        self.track(id);

        if self.needs_initial_compute(id)? {
            self.recompute(id)?;
        }
        self.value_of(id)
    }

    /// Read without registering a dependency edge
    pub fn read_untracked<T: Clone + 'static>(&mut self, id: CellId) -> Result<T> {
        if self.needs_initial_compute(id)? {
            let saved = self.observer.take();
            let result = self.recompute(id);
            self.observer = saved;
            result?;
        }
        self.value_of(id)
    }

    /// The value a container held before its last change
    pub fn previous<T: Clone + 'static>(&self, id: CellId) -> Result<Option<T>> {
        let node = self.cells.get(id).ok_or(ReactiveError::UnknownCell)?;
        Ok(node
            .previous
            .as_ref()
            .and_then(|v| (**v).as_any().downcast_ref::<T>())
            .cloned())
    }

    /// Write a container. A strictly-equal value is a no-op: no listener
    /// fires. Otherwise every dependent is notified synchronously before
    /// this call returns.
    pub fn write<T: Clone + PartialEq + 'static>(&mut self, id: CellId, value: T) -> Result<()> {
        let node = self.cells.get_mut(id).ok_or(ReactiveError::UnknownCell)?;
        match node.lifecycle {
            Lifecycle::Destroyed => return Err(ReactiveError::Destroyed),
            Lifecycle::Error => return Err(ReactiveError::Errored),
            _ => {}
        }
        if node.value_type != TypeId::of::<T>() {
            return Err(ReactiveError::TypeMismatch(node.field.clone()));
        }
        if let Some(current) = &node.value {
            if (node.eq)((**current).as_any(), &value) {
                return Ok(());
            }
        }
        node.previous = node.value.take();
        node.value = Some(Box::new(value));
        self.notify(id)
    }

    /// Update a container through a closure
    pub fn update<T, F>(&mut self, id: CellId, f: F) -> Result<()>
    where
        T: Clone + PartialEq + 'static,
        F: FnOnce(T) -> T,
    {
        let current = self.read_untracked::<T>(id)?;
        self.write(id, f(current))
    }

    /// Attach a callback listener. Listeners fire in registration order.
    pub fn on<F>(&mut self, cell: CellId, callback: F) -> Result<ListenerId>
    where
        F: FnMut(&mut ReactiveGraph, &ValueChange) + 'static,
    {
        if !self.cells.contains_key(cell) {
            return Err(ReactiveError::UnknownCell);
        }
        let id = self.listeners.insert(ListenerNode {
            cell,
            callback: Some(Box::new(callback)),
        });
        if let Some(node) = self.cells.get_mut(cell) {
            node.listeners.push(Dependent::Callback(id));
        }
        Ok(id)
    }

    /// Detach a callback listener
    pub fn off(&mut self, listener: ListenerId) {
        if let Some(node) = self.listeners.remove(listener) {
            if let Some(cell) = self.cells.get_mut(node.cell) {
                cell.listeners
                    .retain(|d| *d != Dependent::Callback(listener));
            }
        }
    }

    /// Tear a container down. Terminal: further reads and writes fail.
    pub fn destroy_cell(&mut self, id: CellId) {
        let deps = match self.cells.get_mut(id) {
            Some(node) => {
                node.lifecycle = Lifecycle::Destroyed;
                node.value = None;
                node.previous = None;
                node.kind = CellKind::Plain;
                node.listeners.clear();
                std::mem::take(&mut node.dependencies)
            }
            None => return,
        };
        for dep in deps {
            if let Some(source) = self.cells.get_mut(dep) {
                source.listeners.retain(|d| *d != Dependent::Cell(id));
            }
        }
    }

    /// Lifecycle of a container
    pub fn cell_lifecycle(&self, id: CellId) -> Option<Lifecycle> {
        self.cells.get(id).map(|n| n.lifecycle)
    }

    /// Field name of a container
    pub fn cell_field(&self, id: CellId) -> Option<&str> {
        self.cells.get(id).map(|n| n.field.as_str())
    }

    // =========================================================================
    // CORES & HOST REACTIVATION
    // =========================================================================

    /// Wire a [`Model`] into the graph, turning each declared field into a
    /// container under a fresh core.
    ///
    /// Idempotent: a model that already carries a core handle returns it
    /// unchanged. A reserved field name aborts wiring synchronously and
    /// leaves the core in the `Error` state with the already-wired prefix
    /// attached - callers discard and rebuild, never retry in place.
    pub fn reactivate(&mut self, model: &mut Model) -> Result<CoreId> {
        let config = self.config.clone();
        self.reactivate_with(model, &config)
    }

    /// [`reactivate`](Self::reactivate) with an explicit configuration
    pub fn reactivate_with(&mut self, model: &mut Model, config: &ReactiveConfig) -> Result<CoreId> {
        if let Some(core) = model.core {
            return Ok(core);
        }

        let core = self.cores.insert(CoreNode {
            fields: IndexMap::new(),
            lifecycle: Lifecycle::Init,
        });
        model.core = Some(core);

        for (name, def) in model.fields.drain(..) {
            if config.reserved_fields.iter().any(|r| *r == name) {
                if let Some(node) = self.cores.get_mut(core) {
                    node.lifecycle = Lifecycle::Error;
                }
                tracing::debug!(field = %name, "reactivation failed: reserved field");
                return Err(ReactiveError::ReservedField(name));
            }
            let cell = match def {
                FieldDef::Plain(make) => make(self),
                FieldDef::Computed(make) => make(self, core),
            };
            if let Some(node) = self.cores.get_mut(core) {
                node.fields.insert(name, cell);
            }
        }

        if let Some(node) = self.cores.get_mut(core) {
            node.lifecycle = Lifecycle::Ready;
            tracing::debug!(fields = node.fields.len(), "host reactivated");
        }
        Ok(core)
    }

    /// Reactivate a single plain value as a one-field host (field `"v"`)
    pub fn reactivate_value<T>(&mut self, value: T) -> Result<CoreId>
    where
        T: Clone + PartialEq + 'static,
    {
        let mut model = Model::new().field("v", value);
        self.reactivate(&mut model)
    }

    /// Retrieval accessor: the container behind a named field of a core
    pub fn cell_of(&self, core: CoreId, field: &str) -> Result<CellId> {
        let node = self.cores.get(core).ok_or(ReactiveError::UnknownCell)?;
        node.fields
            .get(field)
            .copied()
            .ok_or_else(|| ReactiveError::UnknownField(field.to_string()))
    }

    /// Read a named field of a core
    pub fn read_field<T: Clone + 'static>(&mut self, core: CoreId, field: &str) -> Result<T> {
        let cell = self.cell_of(core, field)?;
        self.read(cell)
    }

    /// Write a named field of a core
    pub fn write_field<T>(&mut self, core: CoreId, field: &str, value: T) -> Result<()>
    where
        T: Clone + PartialEq + 'static,
    {
        let cell = self.cell_of(core, field)?;
        self.write(cell, value)
    }

    /// Lifecycle of a core
    pub fn core_lifecycle(&self, core: CoreId) -> Option<Lifecycle> {
        self.cores.get(core).map(|n| n.lifecycle)
    }

    /// Field names of a core, in declaration order
    pub fn core_fields(&self, core: CoreId) -> Vec<String> {
        self.cores
            .get(core)
            .map(|n| n.fields.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Tear a core and all of its containers down
    pub fn destroy_core(&mut self, core: CoreId) {
        let cells: Vec<CellId> = match self.cores.get_mut(core) {
            Some(node) => {
                node.lifecycle = Lifecycle::Destroyed;
                node.fields.values().copied().collect()
            }
            None => return,
        };
        for cell in cells {
            self.destroy_cell(cell);
        }
        tracing::debug!("core destroyed");
    }

    /// Counts of live graph nodes
    pub fn stats(&self) -> ReactiveStats {
        ReactiveStats {
            cell_count: self.cells.len(),
            core_count: self.cores.len(),
            listener_count: self.listeners.len(),
        }
    }

    // =========================================================================
    // INTERNAL
    // =========================================================================

    /// Register `id` as a dependency of the active observer, if any
    pub(crate) fn track(&mut self, id: CellId) {
        let Some(observer) = self.observer else {
            return;
        };
        if observer == id || !self.cells.contains_key(id) {
            return;
        }
        if let Some(node) = self.cells.get_mut(id) {
            let edge = Dependent::Cell(observer);
            if !node.listeners.contains(&edge) {
                node.listeners.push(edge);
            }
        }
        if let Some(node) = self.cells.get_mut(observer) {
            if !node.dependencies.contains(&id) {
                node.dependencies.push(id);
            }
        }
    }

    /// Anchor cell used by sequences for coarse dependency capture
    pub(crate) fn create_anchor(&mut self, field: &str) -> CellId {
        self.create_cell(field, 0u64)
    }

    /// Bump an anchor, waking everything captured on it
    pub(crate) fn touch(&mut self, id: CellId) -> Result<()> {
        let version = self.read_untracked::<u64>(id)?;
        self.write(id, version.wrapping_add(1))
    }

    /// Drop an anchor from the arena entirely
    pub(crate) fn remove_cell(&mut self, id: CellId) {
        self.destroy_cell(id);
        self.cells.remove(id);
    }

    fn needs_initial_compute(&self, id: CellId) -> Result<bool> {
        let node = self.cells.get(id).ok_or(ReactiveError::UnknownCell)?;
        match node.lifecycle {
            Lifecycle::Destroyed => Err(ReactiveError::Destroyed),
            Lifecycle::Error => Err(ReactiveError::Errored),
            Lifecycle::Init => Ok(matches!(node.kind, CellKind::Computed(_))),
            Lifecycle::Ready => Ok(false),
        }
    }

    fn value_of<T: Clone + 'static>(&self, id: CellId) -> Result<T> {
        let node = self.cells.get(id).ok_or(ReactiveError::UnknownCell)?;
        node.value
            .as_ref()
            .and_then(|v| (**v).as_any().downcast_ref::<T>())
            .cloned()
            .ok_or_else(|| ReactiveError::TypeMismatch(node.field.clone()))
    }

    /// Rerun a computed container, rebuilding its edges. Returns whether the
    /// cached result changed.
    fn recompute(&mut self, id: CellId) -> Result<bool> {
        // Drop the old inbound edges; the rerun collects fresh ones.
        let old_deps = match self.cells.get_mut(id) {
            Some(node) => std::mem::take(&mut node.dependencies),
            None => return Ok(false),
        };
        for dep in old_deps {
            if let Some(source) = self.cells.get_mut(dep) {
                source.listeners.retain(|d| *d != Dependent::Cell(id));
            }
        }

        let field = match self.cells.get(id) {
            Some(node) => node.field.clone(),
            None => return Ok(false),
        };
        let mut compute = match self.cells.get_mut(id) {
            Some(CellNode {
                kind: CellKind::Computed(slot),
                ..
            }) => slot
                .take()
                .ok_or_else(|| ReactiveError::RecomputeCycle(field.clone()))?,
            _ => return Ok(false),
        };

        tracing::trace!(field = %field, "recompute");
        let saved = self.observer.replace(id);
        let result = compute(self);
        self.observer = saved;

        if let Some(CellNode {
            kind: CellKind::Computed(slot),
            ..
        }) = self.cells.get_mut(id)
        {
            *slot = Some(compute);
        }

        let value = result?;
        let node = self.cells.get_mut(id).ok_or(ReactiveError::UnknownCell)?;
        let changed = match &node.value {
            Some(current) => !(node.eq)((**current).as_any(), (*value).as_any()),
            None => true,
        };
        if changed {
            node.previous = node.value.take();
            node.value = Some(value);
        }
        node.lifecycle = Lifecycle::Ready;
        Ok(changed)
    }

    /// Notify the dependents of `id`, depth-first. The dependent set used is
    /// captured at call start; additions mid-cascade wait for the next write.
    fn notify(&mut self, id: CellId) -> Result<()> {
        let (snapshot, change) = match self.cells.get(id) {
            Some(node) => (
                node.listeners.clone(),
                ValueChange {
                    source: id,
                    field: node.field.clone(),
                    previous: node.previous.as_ref().map(|v| (**v).clone_boxed()),
                    current: node.value.as_ref().map(|v| (**v).clone_boxed()),
                },
            ),
            None => return Ok(()),
        };

        for dependent in snapshot {
            match dependent {
                Dependent::Cell(cell) => {
                    // Cascade only when the dependent's result changed.
                    if self.recompute(cell)? {
                        self.notify(cell)?;
                    }
                }
                Dependent::Callback(listener) => {
                    let mut callback = match self.listeners.get_mut(listener) {
                        Some(node) => match node.callback.take() {
                            Some(cb) => cb,
                            None => continue,
                        },
                        None => continue,
                    };
                    callback(self, &change);
                    if let Some(node) = self.listeners.get_mut(listener) {
                        node.callback = Some(callback);
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for ReactiveGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts of live graph nodes
#[derive(Debug, Clone)]
pub struct ReactiveStats {
    pub cell_count: usize,
    pub core_count: usize,
    pub listener_count: usize,
}

// =============================================================================
// MODEL - declarative host description
// =============================================================================

type PlainMake = Box<dyn FnOnce(&mut ReactiveGraph) -> CellId>;
type ComputedMake = Box<dyn FnOnce(&mut ReactiveGraph, CoreId) -> CellId>;

enum FieldDef {
    Plain(PlainMake),
    Computed(ComputedMake),
}

/// A composite host value described field by field, then wired into a graph
/// with [`ReactiveGraph::reactivate`].
///
/// The model keeps the hidden core handle after wiring, which is what makes
/// reactivation idempotent.
pub struct Model {
    fields: Vec<(String, FieldDef)>,
    core: Option<CoreId>,
}

impl Model {
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            core: None,
        }
    }

    /// Declare a plain field
    pub fn field<T>(mut self, name: &str, value: T) -> Self
    where
        T: Clone + PartialEq + 'static,
    {
        let field = name.to_string();
        self.fields.push((
            field.clone(),
            FieldDef::Plain(Box::new(move |g| g.create_cell(&field, value))),
        ));
        self
    }

    /// Declare a computed field. The closure reads sibling fields through the
    /// core handle; whatever it reads becomes a dependency automatically.
    pub fn computed<T, F>(mut self, name: &str, mut f: F) -> Self
    where
        T: Clone + PartialEq + 'static,
        F: FnMut(&mut ReactiveGraph, CoreId) -> T + 'static,
    {
        let field = name.to_string();
        self.fields.push((
            field.clone(),
            FieldDef::Computed(Box::new(move |g, core| {
                g.create_computed(&field, move |g| f(g, core))
            })),
        ));
        self
    }

    /// Fallible variant of [`computed`](Self::computed)
    pub fn try_computed<T, F>(mut self, name: &str, mut f: F) -> Self
    where
        T: Clone + PartialEq + 'static,
        F: FnMut(&mut ReactiveGraph, CoreId) -> Result<T> + 'static,
    {
        let field = name.to_string();
        self.fields.push((
            field.clone(),
            FieldDef::Computed(Box::new(move |g, core| {
                g.create_fallible_computed(&field, move |g| f(g, core))
            })),
        ));
        self
    }

    /// The hidden core handle, once reactivated
    pub fn core(&self) -> Option<CoreId> {
        self.core
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

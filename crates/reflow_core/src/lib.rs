//! Reflow Core Engine
//!
//! This crate provides the primitives of the reflow dataflow engine:
//!
//! - **Reactive Containers**: Typed value cells with implicit dependency
//!   capture, eager synchronous propagation, and host-object reactivation
//! - **Reactive Sequences**: Observable ordered collections broadcasting
//!   structured change records, with map/filter/slice/concat views kept
//!   consistent by record translation and diffing
//! - **Event Streams**: Push-based streams with flat-mapping transform
//!   chains and size-buffered backpressure
//! - **Registry**: Name-based create-or-fetch sharing of instruments
//!
//! # Example
//!
//! ```rust
//! use reflow_core::ReactiveGraph;
//!
//! let mut g = ReactiveGraph::new();
//!
//! // A plain container and a computed one depending on it.
//! let count = g.create_cell("count", 0i64);
//! let doubled = g.create_computed("doubled", move |g| {
//!     g.read::<i64>(count).unwrap_or(0) * 2
//! });
//!
//! assert_eq!(g.read::<i64>(doubled).unwrap(), 0);
//!
//! // Writes propagate before returning.
//! g.write(count, 5i64).unwrap();
//! assert_eq!(g.read::<i64>(doubled).unwrap(), 10);
//! ```

pub mod diff;
pub mod error;
pub mod reactive;
pub mod registry;
pub mod seq;
pub mod stream;

pub use diff::{apply, diff, DiffRun, Patch};
pub use error::{ReactiveError, Result};
pub use reactive::{
    CellId, CloneAny, CoreId, Lifecycle, ListenerId, Model, ReactiveConfig, ReactiveGraph,
    ReactiveStats, ValueChange,
};
pub use registry::Registry;
pub use seq::{ChangeRecord, ReactiveSeq, SeqListenerId, SeqOp};
pub use stream::{Emit, SizeBufferedStream, Stream, StreamListenerId};

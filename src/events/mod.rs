//! # Lifecycle events.
//!
//! The manager publishes a typed [`Event`] for every externally meaningful
//! transition: task state changes, worker connections and removals,
//! resource reports, category updates, and manager start/end. Events go
//! out over a broadcast channel owned by the manager itself; subscribers
//! (see [`crate::subscribers`]) drain it in their own tasks, and a slow
//! consumer lags rather than stalling the wait loop.

mod event;

pub use event::{Event, EventKind};

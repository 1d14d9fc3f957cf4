//! `PatchStore` implementations.
//!
//! Provides concrete backends for the [`PatchStore`](super::PatchStore) trait:
//! [`NullPatchStore`] for disabled persistence, [`MemoryPatchStore`] for tests
//! and simulation, and (with the `postgres` feature) [`PostgresPatchStore`].

mod memory;
mod null;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::{MemoryPatchStore, StoredUsage};
pub use null::NullPatchStore;
#[cfg(feature = "postgres")]
pub use postgres::{PostgresPatchStore, DEFAULT_TABLE};

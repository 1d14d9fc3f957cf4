//! Persistence layer for usage batches.
//!
//! [`PatchStore`] is the seam between the write buffer and the durable store;
//! [`datastores`] holds the concrete backends.

pub mod datastores;
pub mod patch_store;

pub use datastores::*;
pub use patch_store::*;

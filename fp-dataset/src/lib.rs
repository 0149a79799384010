//! Partitioned dataset loader for floor-plan rectification to floor
//! photo translation benchmarks.
//!
//! The dataset lives out of core, split across many on-disk shards
//! ("parts") in two parallel streams (x and y) that must stay in
//! lockstep. [`FloorPhotoDataset`] validates the shard layout at
//! construction, loads one part at a time into caller-owned bundles,
//! and persists a reproducibility session record hashing every shard.

mod common;

pub mod error;
pub use error::*;

pub mod manifest;
pub use manifest::*;

pub mod dataset;
pub use dataset::*;

pub mod resample;
pub use resample::*;

pub mod session;
pub use session::*;

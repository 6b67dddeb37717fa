//! The persistent store: durable per-plan documents and per-node attempt
//! artifacts.
//!
//! Split by concern: [`layout`] owns every path, [`plan_doc`] owns the
//! plan document and the plans index, [`specs`] owns the per-node spec
//! subtree (attempt snapshots, the `current` pointer, file import, legacy
//! migration).

pub mod layout;
pub mod plan_doc;
pub mod specs;

pub use layout::StorageLayout;
pub use plan_doc::{PlanIndexEntry, PlanStore, PlansIndex, StoreError};

//! Storage interface for instance records
//!
//! The lifecycle manager, reconciler, proxy and API only ever talk to the
//! store through [`Registry`]. [`crate::db::Database`] is the SQLite backed
//! implementation.

use crate::instance::{Instance, InstancePatch, InstanceStatus, NewInstance};
use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;

pub trait Registry: Send + Sync {
    /// Look up an instance by id
    fn get(&self, id: &str) -> Result<Option<Instance>>;

    /// Look up an instance by its unique name
    fn find_by_name(&self, name: &str) -> Result<Option<Instance>>;

    /// All instances, oldest first
    fn list(&self) -> Result<Vec<Instance>>;

    /// Insert a new record in `creating` state with a fresh id
    fn create(&self, new: &NewInstance) -> Result<Instance>;

    /// Apply every field of `patch` in one write. Returns `None` for an unknown id.
    fn update(&self, id: &str, patch: &InstancePatch) -> Result<Option<Instance>>;

    /// Set `status` only while the record still carries `handle` and `expected`.
    /// Returns `None` when the record changed in between or no longer exists.
    fn transition_status(
        &self,
        id: &str,
        handle: &str,
        expected: InstanceStatus,
        status: InstanceStatus,
    ) -> Result<Option<Instance>>;

    /// Delete a record. Returns whether it existed.
    fn delete(&self, id: &str) -> Result<bool>;

    /// Ports currently held by any instance
    fn used_ports(&self) -> Result<HashSet<u16>>;
}

pub type SharedRegistry = Arc<dyn Registry>;

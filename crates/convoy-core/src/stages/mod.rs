//! Deployment stages, in the order a run executes them.

pub mod apply;
pub mod cleanup;
pub mod distribute;
pub mod finalize;

pub use apply::{ApplyError, ApplySummary, apply_manifests, drain};
pub use cleanup::remove_stale_manifests;
pub use distribute::{distribute, prepare_hosts};
pub use finalize::check_reboot;

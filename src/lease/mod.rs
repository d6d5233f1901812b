//! Lease-based partition ownership.
//!
//! Each partition of the monitored feed has one lease document in the lease
//! collection. A host owns a partition while its name is in the lease and it
//! keeps refreshing the lease timestamp; any host may take over a lease whose
//! owner stopped renewing for longer than the expiration interval.
//!
//! # Components
//!
//! - [`Lease`]: the persisted ownership record
//! - [`LeaseStore`]: marker and lock documents gating one-time initialization
//! - [`Bootstrapper`]: drives initialization among competing processes
//! - [`LeaseManager`]: acquire, renew, release and checkpoint with
//!   conditional writes
//! - [`LeaseRenewer`]: cancellable background renewal of one owned lease
//!
//! All writes are conditional on the lease's concurrency tag. Losing a race
//! surfaces as [`LeaseOutcome::Lost`], never as an error.

mod bootstrap;
mod document;
mod manager;
mod renewer;
mod store;

pub use bootstrap::{Bootstrapper, LeaseStoreState, PartitionSynchronizer};
pub use document::{lease_id, Lease, LEASE_ID_SEPARATOR};
pub use manager::{LeaseManager, LeaseOutcome};
pub use renewer::{LeaseRenewer, RenewalEnd, SharedLease};
pub use store::LeaseStore;

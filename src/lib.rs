//! Persistent volume orchestration for a container hosting platform.
//!
//! The crate creates, formats, exposes and deletes persistent volumes on
//! three interchangeable storage backends (a clustered block store, a cloud
//! block volume provider and node-local directories). Mutating backend calls
//! are serialised across control-plane workers by TTL-bounded named locks,
//! and deletion is deferred to a reaper that only removes resources no
//! workload still uses.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod drive_name;
pub mod executor;
pub mod lock;
pub mod nodes;
pub mod oplock;
pub mod records;
pub mod tasks;
pub mod test_support;

pub use backend::{BackendError, BackendKind, DriveInfo, StorageBackend, VolumeSpec};
pub use config::{ConfigError, PstorageConfig};
pub use coordinator::{
    CoordinatorSettings, ReapOutcome, ReapSummary, VolumeCoordinator, VolumeError, VolumeRequest,
};
pub use drive_name::DriveName;
pub use executor::{NodeCommandError, RemoteExecutor, Transport};
pub use lock::{LockError, LockGuard, LockManager, LockPayload, NamedLock, RetryPolicy};
pub use nodes::{Node, NodeDirectory, NodeFilter, StaticNodeDirectory};
pub use oplock::{Operation, OperationLockError, OperationLocks};
pub use records::{InMemoryVolumeStore, PersistentVolume, VolumeState, VolumeStore};
pub use tasks::{TaskError, TaskQueue, TaskRef, TokioTaskQueue};

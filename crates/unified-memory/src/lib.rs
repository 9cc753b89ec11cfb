//! Shared development memory for cooperating agent instances.
//!
//! Raw events are classified and stored as typed nodes in a SQLite-backed
//! graph; a relationship engine links them, hybrid search ranks them, and
//! an instance coordinator hands out leases on shared resources.

pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod embedding;
pub mod error;
pub mod memory_db;
pub mod metrics;
pub mod relationship;
pub mod retrieval;
pub mod shared_state;
pub mod telemetry;
pub mod thread_pool;
pub mod utils;
pub mod worker_threads;

#[cfg(feature = "cli")]
pub mod api;
#[cfg(feature = "cli")]
pub mod thread_server;

// Public API exports
pub use classifier::{ClassifiedEvent, Classifier, ClassifierConfig, RawEvent, SourceTag};
pub use config::Config;
pub use coordinator::{CoordinatorConfig, HandoffReceipt, InstanceCoordinator, ReclaimReport};
pub use error::{ErrorKind, MemoryError, Result};
pub use memory_db::{Edge, Lease, LeaseMode, MemoryStore, Node, NodeType, Session, StoreOptions};
pub use relationship::RelationshipEngine;
pub use retrieval::{HybridWeights, NeighborQuery, SearchHit, SearchRequest};
pub use shared_state::{SharedState, UnifiedAppState};

#[cfg(feature = "cli")]
pub use thread_server::{build_compatible_router, run_thread_server};

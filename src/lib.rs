//! # pathkeeper: a hierarchical coordination service
//!
//! pathkeeper is a ZooKeeper-shaped coordination service: a hierarchical
//! namespace of versioned entries, session-scoped ephemeral nodes, and
//! read/write distributed locks, backed by a pluggable compare-and-swap
//! store and fronted by a client-side read cache kept coherent through
//! held read-locks and invalidation callbacks.
//!
//! ## Core Concepts
//!
//! - **Path**: a canonical, escaped `/`-separated key identifying an entry
//! - **Session**: a leased identity with a background renewal loop and an
//!   ephemeral-entry set reaped by the garbage collector on termination
//! - **Lock manager**: write-preferring read/write locks over a strict
//!   path-lexicographic acquisition order
//! - **Coordination service**: `create`/`get`/`set_value`/`delete` composed
//!   from the lock manager, session manager, and invalidation directory
//! - **Backing store**: a CAS-only persistence boundary, with in-memory and
//!   SQLite implementations
//!
//! ## Quick Start
//!
//! ```
//! use pathkeeper::clock::SystemClock;
//! use pathkeeper::config::CoordinationConfig;
//! use pathkeeper::coordination::CoordinationService;
//! use pathkeeper::invalidation::InvalidationDirectory;
//! use pathkeeper::lock::{LockManager, PeerBroadcast};
//! use pathkeeper::model::entry::CreateMode;
//! use pathkeeper::model::path::Path;
//! use pathkeeper::session::SessionManager;
//! use pathkeeper::store::memory::InMemoryStore;
//! use pathkeeper::store::BackingStore;
//! use pathkeeper::wait::WaitDirectory;
//! use pathkeeper::waitmgr::WaitManager;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryStore::new());
//! let clock = Arc::new(SystemClock);
//! let config = CoordinationConfig::default();
//!
//! let sessions = Arc::new(SessionManager::new(
//!     store.clone() as Arc<dyn BackingStore>,
//!     clock.clone() as Arc<dyn pathkeeper::clock::Clock>,
//!     config.clone(),
//! ));
//! let wait_directory = Arc::new(WaitDirectory::new());
//! let wait_manager = Arc::new(WaitManager::new(
//!     store.clone() as Arc<dyn BackingStore>,
//!     sessions.clone(),
//!     wait_directory.clone(),
//!     std::time::Duration::from_millis(50),
//! ));
//! let invalidation_directory = Arc::new(InvalidationDirectory::new());
//! let lock_manager = Arc::new(LockManager::new(
//!     store.clone() as Arc<dyn BackingStore>,
//!     sessions.clone(),
//!     wait_manager,
//!     wait_directory,
//!     invalidation_directory.clone(),
//!     PeerBroadcast::default(),
//!     config.clone(),
//! ));
//! let service = CoordinationService::new(
//!     store.clone() as Arc<dyn BackingStore>,
//!     clock.clone() as Arc<dyn pathkeeper::clock::Clock>,
//!     sessions.clone(),
//!     lock_manager,
//!     invalidation_directory,
//!     config,
//! );
//! service.ensure_root().await?;
//!
//! let owner = sessions.allocate().await?;
//! let cancellation = CancellationToken::new();
//! let path = Path::parse("/widgets")?;
//! service
//!     .create(&path, b"v1".to_vec(), CreateMode::Default, owner.id, &cancellation)
//!     .await?;
//! let entry = service.get(&path, owner.id, &cancellation).await?;
//! assert_eq!(entry.value, b"v1");
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`model`] - Path codec and the stored entry/session types
//! - [`store`] - The CAS backing-store trait and its in-memory/SQLite impls
//! - [`clock`] - The clock capability trait used for lease and timestamp math
//! - [`session`] - Session allocation, lease renewal, and termination
//! - [`wait`] - Per-path-and-session wait directory over `tokio::sync::broadcast`
//! - [`waitmgr`] - Local intent queuing ahead of a lock acquisition
//! - [`lock`] - Read/write lock acquisition and release
//! - [`invalidation`] - The local cache-invalidation callback registry
//! - [`exchange`] - Cross-node wire protocol, transport, and dispatch
//! - [`coordination`] - The `create`/`get`/`set_value`/`delete` facade
//! - [`gc`] - Background reaping of ephemeral entries and session records
//! - [`config`] - Tunable knobs with `dotenvy`-backed environment overrides
//! - [`error`] - The crate's unified error type
//! - [`telemetry`] - Lifecycle event rendering for structured logging

pub mod clock;
pub mod config;
pub mod coordination;
pub mod error;
pub mod exchange;
pub mod gc;
pub mod invalidation;
pub mod lock;
pub mod model;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod wait;
pub mod waitmgr;

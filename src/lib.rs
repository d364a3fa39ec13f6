//! # tcache
//!
//! A tag-aware caching layer with built-in stampede prevention for Rust.
//!
//! ## Features
//!
//! - **Stampede Prevention:** One session rebuilds a missing or stale key;
//!   everyone else is served the stale value or told to come back
//! - **Tag Invalidation:** Invalidate whole groups of keys through shared
//!   tags, with a delay window that tolerates replica lag
//! - **Soft Deletes:** Invalidation bumps version records; payloads are
//!   never destroyed, so stale reads stay possible during rebuilds
//! - **Backend Agnostic:** Any store with `get`/`add`/`cas` works; an
//!   in-memory backend ships for tests and single-process use
//! - **Fail Open:** On repeated connection failure the pool degrades to a
//!   no-op instead of taking the application down
//!
//! ## Quick Start
//!
//! ```ignore
//! use tcache::{backend::InMemoryBackend, CacheItem, Pool, Status};
//! use serde_json::json;
//!
//! let backend = InMemoryBackend::new();
//! let mut pool = Pool::with_backends(backend.clone(), backend).await;
//!
//! match pool.get_item("user_42").await? {
//!     Some(item) => use_value(item.value()),
//!     None if pool.status() == Status::NotExistUnderConstruction
//!         || pool.status() == Status::ExpiredUnderConstruction =>
//!     {
//!         // This session holds the build lock: rebuild and publish.
//!         let item = CacheItem::new("user_42", json!({"name": "x"}),
//!                                   vec!["users".into()], None)?;
//!         pool.save(&item).await?;
//!     }
//!     None => { /* built elsewhere right now; retry later or go without */ }
//! }
//!
//! // Later: drop every key tagged "users" at once.
//! pool.delete_by_tag("users").await?;
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod expire;
pub mod item;
pub mod key;
pub mod serialization;

mod lock;
mod pool;

// Re-exports for convenience
pub use backend::{CacheBackend, CasValue};
pub use config::{CacheServer, PoolConfig};
pub use error::{Error, Result};
pub use expire::EXPIRE_DELAY;
pub use item::CacheItem;
pub use lock::Status;
pub use pool::{Pool, DEFAULT_REBUILD_CHECK_COUNT, DEFAULT_TIME_TO_REBUILD};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! # gwcp-store
//!
//! The persistent store: typed CRUD over an embedded SQLite database in
//! WAL mode, with atomic event-append + organization-state bump.

pub mod error;
pub mod store;

pub use error::{Result, StoreError};
pub use store::{NewEvent, PersistentStore, SqliteStore};

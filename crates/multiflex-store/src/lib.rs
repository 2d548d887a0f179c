//! Multiflex Store - Transactional chunk store
//!
//! This crate persists chunks in a single redb container file:
//! - Table definitions and declarative schema migrations
//! - Data access layer with a scoped transaction guard
//! - Store-local descriptor cache (interning)
//! - The [`Store`] lifecycle and chunk/metadata operations

pub mod cache;
pub mod dao;
pub mod migration;
pub mod store;
pub mod tables;

pub use cache::DescriptorCache;
pub use dao::{BackendError, Dao, Transaction};
pub use migration::{MigrationScript, Statement};
pub use store::{Store, StoreState};

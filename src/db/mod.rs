//! Storage layer
//!
//! - [`queries`]: the per-transaction accessor ([`Queries`]) plus the
//!   [`Transaction`] and [`Backend`] seams
//! - [`postgres`]: sqlx/PostgreSQL backend
//! - [`memory`]: in-process backend with real row locks, used by tests and
//!   the smoke run when no database URL is configured

pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod queries;

pub use error::DbError;
pub use memory::{MemoryBackend, TableCounts};
pub use models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, Entry, NewTask, OutboxTask, Page, TaskStatus,
    Transfer, User,
};
pub use postgres::{IsolationLevel, PgBackend};
pub use queries::{Backend, Queries, Transaction};

//! simplebank - transactional ledger core
//!
//! Accounts, entries, transfers and users on PostgreSQL, with every
//! multi-statement write going through one transaction coordinator.
//!
//! # Modules
//!
//! - [`store`] - Transaction coordinator and the transfer / user-creation orchestrators
//! - [`db`] - Query accessor trait, PostgreSQL and in-process backends, row models
//! - [`service`] - Request validation and entry points
//! - [`worker`] - Outbox dispatcher for tasks committed alongside business rows
//! - [`context`] - Deadlines and cancellation for a unit of work
//! - [`error`] - Classified error type returned by every operation
//! - [`currency`] - Supported currencies
//! - [`validation`] - Validated request fields
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod context;
pub mod currency;
pub mod db;
pub mod error;
pub mod logging;
pub mod service;
pub mod store;
pub mod validation;
pub mod worker;

// Convenient re-exports at crate root
pub use context::{CancelHandle, TxContext};
pub use currency::Currency;
pub use db::{Backend, MemoryBackend, PgBackend, Queries, Transaction};
pub use error::BankError;
pub use service::{BankService, CreateUserRequest, TransferRequest};
pub use store::{Store, TransferTxParams, TransferTxResult};
pub use worker::{OutboxDispatcher, TaskDistributor};

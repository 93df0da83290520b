//! Accessor and transaction seams
//!
//! ```text
//! Backend::begin() ──▶ Transaction ──(&mut dyn Queries)──▶ unit of work
//!                           │
//!                     commit / rollback
//! ```
//!
//! A unit of work only ever sees `&mut dyn Queries`, so it cannot reach the
//! pool and cannot write outside its transaction.

use async_trait::async_trait;

use super::error::DbError;
use crate::context::TxContext;
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, Entry, NewTask, OutboxTask, Page, Transfer, User,
};

/// Typed row operations bound to one open transaction.
#[async_trait]
pub trait Queries: Send {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, DbError>;

    async fn get_account(&mut self, id: i64) -> Result<Account, DbError>;

    /// Read the account and hold its row lock until the transaction ends.
    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, DbError>;

    async fn list_accounts(&mut self, owner: &str, page: Page) -> Result<Vec<Account>, DbError>;

    /// Atomic add-and-return: `balance = balance + amount` in one statement.
    async fn add_account_balance(&mut self, arg: AddAccountBalanceParams)
    -> Result<Account, DbError>;

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, DbError>;

    async fn get_entry(&mut self, id: i64) -> Result<Entry, DbError>;

    async fn list_entries(&mut self, account_id: i64, page: Page) -> Result<Vec<Entry>, DbError>;

    async fn create_transfer(&mut self, arg: CreateTransferParams) -> Result<Transfer, DbError>;

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, DbError>;

    /// Transfers where `account_id` is either side, newest first.
    async fn list_transfers(&mut self, account_id: i64, page: Page)
    -> Result<Vec<Transfer>, DbError>;

    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, DbError>;

    async fn get_user(&mut self, username: &str) -> Result<User, DbError>;

    async fn enqueue_task(&mut self, task: NewTask) -> Result<OutboxTask, DbError>;

    /// Lock up to `limit` pending tasks, skipping rows other transactions hold.
    async fn claim_pending_tasks(&mut self, limit: i64) -> Result<Vec<OutboxTask>, DbError>;

    async fn mark_task_delivered(&mut self, id: i64) -> Result<OutboxTask, DbError>;

    /// Record a failed attempt. The task becomes `Failed` once
    /// `attempts >= max_attempts`, otherwise it stays pending.
    async fn record_task_failure(
        &mut self,
        id: i64,
        error: &str,
        max_attempts: i32,
    ) -> Result<OutboxTask, DbError>;
}

/// An open transaction. Dropping it without commit rolls it back.
#[async_trait]
pub trait Transaction: Queries + Sized + 'static {
    async fn commit(self) -> Result<(), DbError>;

    async fn rollback(self) -> Result<(), DbError>;

    /// Roll back after the unit of work was dropped mid-statement because
    /// its context fired. A backend whose server keeps running the dropped
    /// statement must stop it here, or the rollback queues behind it.
    async fn abort(self) -> Result<(), DbError> {
        self.rollback().await
    }
}

/// A store that can open transactions.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Tx: Transaction;

    fn name(&self) -> &'static str;

    /// Open a transaction. Backends that can bound server-side waits
    /// derive the bound from `ctx`.
    async fn begin(&self, ctx: &TxContext) -> Result<Self::Tx, DbError>;
}

//! Transactional store
//!
//! [`Store::exec_tx`] is the single place where transactions begin, commit
//! and roll back. Orchestrators ([`transfer_tx`], [`create_user_tx`]) build
//! on it; they never see the backend directly.
//!
//! # Guarantees
//!
//! 1. **All-or-nothing**: the unit of work commits only if it returns `Ok`.
//! 2. **At most once**: the unit of work is invoked once per call. Retrying
//!    is the caller's decision, see [`BankError::is_retryable`].
//! 3. **No lost errors**: a failed rollback is reported together with the
//!    error that triggered it.
//! 4. **Bounded**: the unit of work races the [`TxContext`]; when the
//!    context fires first the transaction is aborted, which stops any
//!    statement still running on the server before rolling back.

pub mod create_user_tx;
pub mod transfer_tx;

use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::context::TxContext;
use crate::db::{Account, Backend, Entry, Page, Queries, Transaction, Transfer, User};
use crate::error::BankError;

pub use create_user_tx::{CreateUserOutboxResult, CreateUserTxResult};
pub use transfer_tx::{TransferTxParams, TransferTxResult, lock_order};

/// Ledger store over a [`Backend`]
pub struct Store<B: Backend> {
    backend: Arc<B>,
}

impl<B: Backend> Clone for Store<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
        }
    }
}

impl<B: Backend> Store<B> {
    pub fn new(backend: B) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    pub fn from_arc(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run `f` inside one transaction.
    ///
    /// `f` gets a transaction-scoped accessor and nothing else. Commit and
    /// store errors are returned classified but otherwise unchanged.
    pub async fn exec_tx<T, F>(&self, ctx: &TxContext, f: F) -> Result<T, BankError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut dyn Queries) -> BoxFuture<'c, Result<T, BankError>> + Send,
    {
        ctx.check()?;

        let mut tx = self.backend.begin(ctx).await?;

        let (outcome, interrupted) = {
            let q: &mut dyn Queries = &mut tx;
            let work = f(q);
            tokio::select! {
                biased;
                reason = ctx.done() => (Err(reason), true),
                result = work => (result, false),
            }
        };

        match outcome {
            Ok(value) => {
                if let Err(e) = tx.commit().await {
                    warn!(backend = self.backend.name(), error = %e, "Commit failed");
                    return Err(e.into());
                }
                debug!(backend = self.backend.name(), "Transaction committed");
                Ok(value)
            }
            Err(err) => {
                let rolled_back = if interrupted {
                    tx.abort().await
                } else {
                    tx.rollback().await
                };
                match rolled_back {
                    Ok(()) => {
                        debug!(backend = self.backend.name(), error = %err, "Transaction rolled back");
                        Err(err)
                    }
                    Err(rb_err) => {
                        warn!(
                            backend = self.backend.name(),
                            error = %err,
                            rollback_error = %rb_err,
                            "Rollback failed"
                        );
                        Err(BankError::Rollback {
                            cause: Box::new(err),
                            rollback: rb_err,
                        })
                    }
                }
            }
        }
    }

    // === Single-statement reads ===

    pub async fn get_account(&self, ctx: &TxContext, id: i64) -> Result<Account, BankError> {
        self.exec_tx(ctx, move |q| {
            Box::pin(async move {
                q.get_account(id)
                    .await
                    .map_err(|e| BankError::from_lookup("account", id, e))
            })
        })
        .await
    }

    pub async fn list_accounts(
        &self,
        ctx: &TxContext,
        owner: &str,
        page: Page,
    ) -> Result<Vec<Account>, BankError> {
        let owner = owner.to_string();
        self.exec_tx(ctx, move |q| {
            Box::pin(async move { q.list_accounts(&owner, page).await.map_err(BankError::from) })
        })
        .await
    }

    pub async fn get_entry(&self, ctx: &TxContext, id: i64) -> Result<Entry, BankError> {
        self.exec_tx(ctx, move |q| {
            Box::pin(async move {
                q.get_entry(id)
                    .await
                    .map_err(|e| BankError::from_lookup("entry", id, e))
            })
        })
        .await
    }

    pub async fn list_entries(
        &self,
        ctx: &TxContext,
        account_id: i64,
        page: Page,
    ) -> Result<Vec<Entry>, BankError> {
        self.exec_tx(ctx, move |q| {
            Box::pin(async move {
                q.list_entries(account_id, page)
                    .await
                    .map_err(BankError::from)
            })
        })
        .await
    }

    pub async fn get_transfer(&self, ctx: &TxContext, id: i64) -> Result<Transfer, BankError> {
        self.exec_tx(ctx, move |q| {
            Box::pin(async move {
                q.get_transfer(id)
                    .await
                    .map_err(|e| BankError::from_lookup("transfer", id, e))
            })
        })
        .await
    }

    pub async fn list_transfers(
        &self,
        ctx: &TxContext,
        account_id: i64,
        page: Page,
    ) -> Result<Vec<Transfer>, BankError> {
        self.exec_tx(ctx, move |q| {
            Box::pin(async move {
                q.list_transfers(account_id, page)
                    .await
                    .map_err(BankError::from)
            })
        })
        .await
    }

    pub async fn get_user(&self, ctx: &TxContext, username: &str) -> Result<User, BankError> {
        let username = username.to_string();
        self.exec_tx(ctx, move |q| {
            Box::pin(async move {
                q.get_user(&username)
                    .await
                    .map_err(|e| BankError::from_lookup("user", &username, e))
            })
        })
        .await
    }
}

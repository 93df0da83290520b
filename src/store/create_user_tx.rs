//! User creation with a follow-up side effect
//!
//! [`Store::create_user_tx`] inserts the user and then runs the caller's
//! `after_create` hook inside the same transaction. A failing hook rolls
//! the insert back, so no user exists without the hook having succeeded.
//!
//! The reverse does not hold: if the hook succeeds and the commit then
//! fails, whatever the hook did (e.g. enqueueing an email job elsewhere)
//! has already happened for a user that does not exist. Consumers of such
//! effects must tolerate a missing user.
//!
//! [`Store::create_user_outbox`] closes that gap for effects that can be
//! expressed as a task row: the task is written in the same transaction
//! and delivered later by the outbox dispatcher.

use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{info, warn};

use super::Store;
use crate::context::TxContext;
use crate::db::{Backend, CreateUserParams, NewTask, OutboxTask, Queries, User};
use crate::error::BankError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserTxResult {
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateUserOutboxResult {
    pub user: User,
    pub task: OutboxTask,
}

async fn create_user_in_tx<F, Fut>(
    q: &mut dyn Queries,
    arg: CreateUserParams,
    after_create: F,
) -> Result<CreateUserTxResult, BankError>
where
    F: FnOnce(User) -> Fut + Send,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    let user = q.create_user(arg).await?;

    after_create(user.clone())
        .await
        .map_err(BankError::AfterCreate)?;

    Ok(CreateUserTxResult { user })
}

async fn create_user_with_task<F>(
    q: &mut dyn Queries,
    arg: CreateUserParams,
    make_task: F,
) -> Result<CreateUserOutboxResult, BankError>
where
    F: FnOnce(&User) -> Result<NewTask, BankError> + Send,
{
    let user = q.create_user(arg).await?;
    let task = q.enqueue_task(make_task(&user)?).await?;
    Ok(CreateUserOutboxResult { user, task })
}

impl<B: Backend> Store<B> {
    /// Insert a user and run `after_create` before committing.
    ///
    /// The hook is awaited once, inside the transaction. Its error rolls the
    /// insert back and is returned as [`BankError::AfterCreate`].
    pub async fn create_user_tx<F, Fut>(
        &self,
        ctx: &TxContext,
        arg: CreateUserParams,
        after_create: F,
    ) -> Result<CreateUserTxResult, BankError>
    where
        F: FnOnce(User) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let username = arg.username.clone();

        let result = self
            .exec_tx(ctx, move |q| {
                Box::pin(create_user_in_tx(q, arg, after_create))
            })
            .await;

        match &result {
            Ok(_) => info!(username = %username, "User created"),
            Err(BankError::AfterCreate(e)) => {
                warn!(username = %username, error = %e, "After-create hook failed, user rolled back")
            }
            Err(e) => warn!(username = %username, error = %e, "User creation failed"),
        }
        result
    }

    /// Insert a user together with the task row built by `make_task`.
    ///
    /// Both rows commit or neither does.
    pub async fn create_user_outbox<F>(
        &self,
        ctx: &TxContext,
        arg: CreateUserParams,
        make_task: F,
    ) -> Result<CreateUserOutboxResult, BankError>
    where
        F: FnOnce(&User) -> Result<NewTask, BankError> + Send + 'static,
    {
        let username = arg.username.clone();

        let result = self
            .exec_tx(ctx, move |q| {
                Box::pin(create_user_with_task(q, arg, make_task))
            })
            .await?;

        info!(
            username = %username,
            task_id = result.task.id,
            kind = %result.task.kind,
            "User created with outbox task"
        );
        Ok(result)
    }
}

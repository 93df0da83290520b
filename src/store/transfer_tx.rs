//! Money transfer between two accounts
//!
//! One transaction writes the transfer record, a debit entry, a credit
//! entry and both balance updates. Row locks are always taken in ascending
//! account id order, so two transfers in opposite directions between the
//! same pair queue behind each other instead of deadlocking.
//!
//! Business rules (existence, currency, sufficient funds) are checked
//! after both rows are locked and before the first write, so a rejected
//! transfer leaves no trace.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::Store;
use crate::context::TxContext;
use crate::db::{
    Account, AddAccountBalanceParams, Backend, CreateEntryParams, CreateTransferParams, Entry,
    Queries, Transfer,
};
use crate::error::BankError;
use crate::validation::{ValidationError, validate_amount};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

/// Everything a committed transfer wrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

/// Lock acquisition order for a set of account ids: ascending, no repeats.
pub fn lock_order(ids: &[i64]) -> Vec<i64> {
    let mut ordered = ids.to_vec();
    ordered.sort_unstable();
    ordered.dedup();
    ordered
}

/// Lock every account in `ids` in [`lock_order`]. Missing accounts fail
/// with a typed not-found.
pub async fn lock_accounts(
    q: &mut dyn Queries,
    ids: &[i64],
) -> Result<BTreeMap<i64, Account>, BankError> {
    let mut locked = BTreeMap::new();
    for id in lock_order(ids) {
        let account = q
            .get_account_for_update(id)
            .await
            .map_err(|e| BankError::from_lookup("account", id, e))?;
        locked.insert(id, account);
    }
    Ok(locked)
}

/// Apply balance deltas in ascending account id order. Deltas for the
/// same account are summed first.
pub async fn apply_balance_deltas(
    q: &mut dyn Queries,
    deltas: &[(i64, i64)],
) -> Result<BTreeMap<i64, Account>, BankError> {
    let mut merged: BTreeMap<i64, i64> = BTreeMap::new();
    for &(id, amount) in deltas {
        *merged.entry(id).or_insert(0) += amount;
    }

    let mut updated = BTreeMap::new();
    for (id, amount) in merged {
        let account = q
            .add_account_balance(AddAccountBalanceParams { id, amount })
            .await
            .map_err(|e| BankError::from_lookup("account", id, e))?;
        updated.insert(id, account);
    }
    Ok(updated)
}

fn take_account(
    accounts: &mut BTreeMap<i64, Account>,
    id: i64,
) -> Result<Account, BankError> {
    accounts
        .remove(&id)
        .ok_or_else(|| BankError::not_found("account", id))
}

async fn transfer_in_tx(
    q: &mut dyn Queries,
    arg: TransferTxParams,
) -> Result<TransferTxResult, BankError> {
    let mut locked = lock_accounts(q, &[arg.from_account_id, arg.to_account_id]).await?;
    let from = take_account(&mut locked, arg.from_account_id)?;
    let to = take_account(&mut locked, arg.to_account_id)?;

    if from.currency != to.currency {
        return Err(ValidationError::CurrencyMismatch {
            account_id: to.id,
            expected: from.currency,
            actual: to.currency,
        }
        .into());
    }
    if from.balance < arg.amount {
        return Err(BankError::InsufficientFunds {
            account_id: from.id,
            balance: from.balance,
            amount: arg.amount,
        });
    }

    let transfer = q
        .create_transfer(CreateTransferParams {
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
        })
        .await?;

    let from_entry = q
        .create_entry(CreateEntryParams {
            account_id: arg.from_account_id,
            amount: -arg.amount,
        })
        .await?;

    let to_entry = q
        .create_entry(CreateEntryParams {
            account_id: arg.to_account_id,
            amount: arg.amount,
        })
        .await?;

    let mut updated = apply_balance_deltas(
        q,
        &[
            (arg.from_account_id, -arg.amount),
            (arg.to_account_id, arg.amount),
        ],
    )
    .await?;

    Ok(TransferTxResult {
        transfer,
        from_account: take_account(&mut updated, arg.from_account_id)?,
        to_account: take_account(&mut updated, arg.to_account_id)?,
        from_entry,
        to_entry,
    })
}

impl<B: Backend> Store<B> {
    /// Move `amount` from one account to another in a single transaction.
    pub async fn transfer_tx(
        &self,
        ctx: &TxContext,
        arg: TransferTxParams,
    ) -> Result<TransferTxResult, BankError> {
        validate_amount(arg.amount)?;
        if arg.from_account_id == arg.to_account_id {
            return Err(ValidationError::SameAccount(arg.from_account_id).into());
        }

        debug!(
            from = arg.from_account_id,
            to = arg.to_account_id,
            amount = arg.amount,
            "Transfer started"
        );

        let result = self
            .exec_tx(ctx, move |q| Box::pin(transfer_in_tx(q, arg)))
            .await?;

        info!(
            transfer_id = result.transfer.id,
            from = arg.from_account_id,
            to = arg.to_account_id,
            amount = arg.amount,
            from_balance = result.from_account.balance,
            to_balance = result.to_account.balance,
            "Transfer committed"
        );
        Ok(result)
    }
}

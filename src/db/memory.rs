//! In-process backend
//!
//! Keeps committed rows in memory and gives every transaction a private
//! write overlay, so uncommitted changes are invisible to other
//! transactions (read committed). Row locks are per-row async mutexes held
//! until commit, rollback or drop, which makes lock-ordering bugs show up
//! exactly as they would against PostgreSQL: as a wait that never ends, or
//! as [`DbError::LockNotAvailable`] once the lock timeout expires.
//!
//! Fault switches (`set_fail_*`) let tests force begin/commit/rollback
//! failures.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};
use tracing::debug;

use super::error::{DbError, sqlstate};
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, Entry, NewTask, OutboxTask, Page, TaskStatus,
    Transfer, User,
};
use super::queries::{Backend, Queries, Transaction};
use crate::context::TxContext;

/// Default wait for a row lock before giving up
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Account(i64),
    Task(i64),
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Account(id) => write!(f, "accounts({})", id),
            RowKey::Task(id) => write!(f, "outbox_tasks({})", id),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Tables {
    users: BTreeMap<String, User>,
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
    tasks: BTreeMap<i64, OutboxTask>,
}

/// Row counts of committed data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub users: usize,
    pub accounts: usize,
    pub entries: usize,
    pub transfers: usize,
    pub tasks: usize,
}

/// Non-transactional id sequences, like PostgreSQL `BIGSERIAL`
#[derive(Default)]
struct Sequences {
    accounts: AtomicI64,
    entries: AtomicI64,
    transfers: AtomicI64,
    tasks: AtomicI64,
}

fn next_id(seq: &AtomicI64) -> i64 {
    seq.fetch_add(1, Ordering::SeqCst) + 1
}

#[derive(Default)]
struct Faults {
    fail_begin: AtomicBool,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
}

#[derive(Default)]
struct Stats {
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    aborts: AtomicUsize,
}

struct Shared {
    committed: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<RowMutex<()>>>>,
    sequences: Sequences,
    faults: Faults,
    stats: Stats,
    lock_timeout: Option<Duration>,
}

impl Shared {
    fn committed(&self) -> MutexGuard<'_, Tables> {
        self.committed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_mutex(&self, key: RowKey) -> Arc<RowMutex<()>> {
        let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key).or_default().clone()
    }

    /// Forget row mutexes nobody holds or waits on. Holders and waiters
    /// each keep a clone, so a count of one means only the map refers to it.
    fn prune_row_locks(&self, keys: impl IntoIterator<Item = RowKey>) {
        let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            if locks.get(&key).is_some_and(|m| Arc::strong_count(m) == 1) {
                locks.remove(&key);
            }
        }
    }
}

/// In-memory ledger store
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_lock_timeout(Some(DEFAULT_LOCK_TIMEOUT))
    }

    /// `None` waits for row locks forever.
    pub fn with_lock_timeout(lock_timeout: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                committed: Mutex::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                sequences: Sequences::default(),
                faults: Faults::default(),
                stats: Stats::default(),
                lock_timeout,
            }),
        }
    }

    pub fn set_fail_begin(&self, fail: bool) {
        self.shared.faults.fail_begin.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.shared.faults.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_rollback(&self, fail: bool) {
        self.shared.faults.fail_rollback.store(fail, Ordering::SeqCst);
    }

    pub fn begin_count(&self) -> usize {
        self.shared.stats.begins.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.shared.stats.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.shared.stats.rollbacks.load(Ordering::SeqCst)
    }

    /// Rollbacks that followed an interrupted unit of work
    pub fn abort_count(&self) -> usize {
        self.shared.stats.aborts.load(Ordering::SeqCst)
    }

    /// Row mutexes currently tracked
    pub fn row_lock_count(&self) -> usize {
        self.shared
            .row_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn counts(&self) -> TableCounts {
        let tables = self.shared.committed();
        TableCounts {
            users: tables.users.len(),
            accounts: tables.accounts.len(),
            entries: tables.entries.len(),
            transfers: tables.transfers.len(),
            tasks: tables.tasks.len(),
        }
    }

    /// Sum of committed entry amounts across the whole ledger
    pub fn entry_total(&self) -> i64 {
        self.shared.committed().entries.values().map(|e| e.amount).sum()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    type Tx = MemoryTx;

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self, _ctx: &TxContext) -> Result<MemoryTx, DbError> {
        if self.shared.faults.fail_begin.load(Ordering::SeqCst) {
            return Err(DbError::connection("injected begin failure"));
        }
        self.shared.stats.begins.fetch_add(1, Ordering::SeqCst);

        Ok(MemoryTx {
            shared: self.shared.clone(),
            held: HashMap::new(),
            overlay: Tables::default(),
        })
    }
}

/// Open in-memory transaction
pub struct MemoryTx {
    shared: Arc<Shared>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    /// Rows inserted or modified by this transaction
    overlay: Tables,
}

impl MemoryTx {
    async fn lock_row(&mut self, key: RowKey) -> Result<(), DbError> {
        if self.held.contains_key(&key) {
            return Ok(());
        }

        let mutex = self.shared.row_mutex(key);
        let guard = match self.shared.lock_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, mutex.lock_owned()).await {
                Ok(guard) => guard,
                Err(_) => {
                    self.shared.prune_row_locks([key]);
                    return Err(DbError::LockNotAvailable(format!(
                        "timed out waiting for {}",
                        key
                    )));
                }
            },
            None => mutex.lock_owned().await,
        };

        self.held.insert(key, guard);
        Ok(())
    }

    /// SKIP LOCKED: take the lock only if nobody else holds it.
    fn try_lock_row(&mut self, key: RowKey) -> bool {
        if self.held.contains_key(&key) {
            return true;
        }
        match self.shared.row_mutex(key).try_lock_owned() {
            Ok(guard) => {
                self.held.insert(key, guard);
                true
            }
            Err(_) => false,
        }
    }

    fn account(&self, id: i64) -> Option<Account> {
        self.overlay
            .accounts
            .get(&id)
            .cloned()
            .or_else(|| self.shared.committed().accounts.get(&id).cloned())
    }

    fn task(&self, id: i64) -> Option<OutboxTask> {
        self.overlay
            .tasks
            .get(&id)
            .cloned()
            .or_else(|| self.shared.committed().tasks.get(&id).cloned())
    }

    fn user_conflict(&self, tables: &Tables, username: &str, email: &str) -> Option<DbError> {
        if tables.users.contains_key(username) {
            return Some(DbError::unique(
                "users_pkey",
                format!("duplicate key value (username)=({})", username),
            ));
        }
        if tables.users.values().any(|u| u.email == email) {
            return Some(DbError::unique(
                "users_email_key",
                format!("duplicate key value (email)=({})", email),
            ));
        }
        None
    }

    fn owner_currency_conflict(tables: &Tables, account: &Account) -> Option<DbError> {
        let clash = tables.accounts.values().any(|a| {
            a.id != account.id && a.owner == account.owner && a.currency == account.currency
        });
        clash.then(|| {
            DbError::unique(
                "owner_currency_key",
                format!(
                    "duplicate key value (owner, currency)=({}, {})",
                    account.owner, account.currency
                ),
            )
        })
    }

    fn missing_account(constraint: &str, id: i64) -> DbError {
        DbError::foreign_key(constraint, format!("key (account_id)=({}) is not present", id))
    }

    /// Merge committed rows with this transaction's overlay, overlay wins.
    fn merged<K: Ord + Clone, V: Clone>(
        committed: &BTreeMap<K, V>,
        overlay: &BTreeMap<K, V>,
    ) -> BTreeMap<K, V> {
        let mut rows = committed.clone();
        rows.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
        rows
    }

    fn paginate<T>(rows: impl Iterator<Item = T>, page: Page) -> Vec<T> {
        rows.skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .collect()
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn commit(mut self) -> Result<(), DbError> {
        if self.shared.faults.fail_commit.load(Ordering::SeqCst) {
            debug!("memory store: injected commit failure, discarding writes");
            return Err(DbError::connection("injected commit failure"));
        }

        let overlay = std::mem::take(&mut self.overlay);
        {
            let mut committed = self.shared.committed();

            // Constraints that concurrent transactions could have raced past.
            for user in overlay.users.values() {
                if let Some(err) = self.user_conflict(&committed, &user.username, &user.email) {
                    return Err(err);
                }
            }
            for account in overlay.accounts.values() {
                if !committed.accounts.contains_key(&account.id)
                    && let Some(err) = Self::owner_currency_conflict(&committed, account)
                {
                    return Err(err);
                }
            }

            committed.users.extend(overlay.users);
            committed.accounts.extend(overlay.accounts);
            committed.entries.extend(overlay.entries);
            committed.transfers.extend(overlay.transfers);
            committed.tasks.extend(overlay.tasks);
        }

        self.shared.stats.commits.fetch_add(1, Ordering::SeqCst);
        // Row locks are released when `self.held` drops, after the writes
        // above are visible.
        Ok(())
    }

    async fn rollback(self) -> Result<(), DbError> {
        self.shared.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.shared.faults.fail_rollback.load(Ordering::SeqCst) {
            return Err(DbError::connection("injected rollback failure"));
        }
        Ok(())
    }

    async fn abort(self) -> Result<(), DbError> {
        self.shared.stats.aborts.fetch_add(1, Ordering::SeqCst);
        self.rollback().await
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let keys: Vec<RowKey> = self.held.keys().copied().collect();
        self.held.clear();
        self.shared.prune_row_locks(keys);
    }
}

#[async_trait]
impl Queries for MemoryTx {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, DbError> {
        let account = Account {
            id: next_id(&self.shared.sequences.accounts),
            owner: arg.owner,
            balance: arg.balance,
            currency: arg.currency,
            created_at: Utc::now(),
        };

        {
            let committed = self.shared.committed();
            let owner_exists = committed.users.contains_key(&account.owner)
                || self.overlay.users.contains_key(&account.owner);
            if !owner_exists {
                return Err(DbError::foreign_key(
                    "accounts_owner_fkey",
                    format!("key (owner)=({}) is not present", account.owner),
                ));
            }
            let visible = Self::merged(&committed.accounts, &self.overlay.accounts);
            let tables = Tables {
                accounts: visible,
                ..Tables::default()
            };
            if let Some(err) = Self::owner_currency_conflict(&tables, &account) {
                return Err(err);
            }
        }

        self.overlay.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, DbError> {
        self.account(id).ok_or(DbError::NotFound)
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, DbError> {
        self.lock_row(RowKey::Account(id)).await?;
        self.account(id).ok_or(DbError::NotFound)
    }

    async fn list_accounts(&mut self, owner: &str, page: Page) -> Result<Vec<Account>, DbError> {
        let rows = Self::merged(&self.shared.committed().accounts, &self.overlay.accounts);
        Ok(Self::paginate(
            rows.into_values().filter(|a| a.owner == owner),
            page,
        ))
    }

    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, DbError> {
        self.lock_row(RowKey::Account(arg.id)).await?;

        let mut account = self.account(arg.id).ok_or(DbError::NotFound)?;
        account.balance = account
            .balance
            .checked_add(arg.amount)
            .ok_or_else(|| {
                DbError::other(Some(sqlstate::NUMERIC_VALUE_OUT_OF_RANGE), "bigint out of range")
            })?;

        self.overlay.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, DbError> {
        if self.account(arg.account_id).is_none() {
            return Err(Self::missing_account("entries_account_id_fkey", arg.account_id));
        }

        let entry = Entry {
            id: next_id(&self.shared.sequences.entries),
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.overlay.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, DbError> {
        self.overlay
            .entries
            .get(&id)
            .cloned()
            .or_else(|| self.shared.committed().entries.get(&id).cloned())
            .ok_or(DbError::NotFound)
    }

    async fn list_entries(&mut self, account_id: i64, page: Page) -> Result<Vec<Entry>, DbError> {
        let rows = Self::merged(&self.shared.committed().entries, &self.overlay.entries);
        Ok(Self::paginate(
            rows.into_values().filter(|e| e.account_id == account_id),
            page,
        ))
    }

    async fn create_transfer(&mut self, arg: CreateTransferParams) -> Result<Transfer, DbError> {
        if arg.amount <= 0 {
            return Err(DbError::CheckViolation {
                constraint: "transfers_amount_check".to_string(),
                message: format!("amount {} violates check (amount > 0)", arg.amount),
            });
        }
        for (constraint, id) in [
            ("transfers_from_account_id_fkey", arg.from_account_id),
            ("transfers_to_account_id_fkey", arg.to_account_id),
        ] {
            if self.account(id).is_none() {
                return Err(Self::missing_account(constraint, id));
            }
        }

        let transfer = Transfer {
            id: next_id(&self.shared.sequences.transfers),
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.overlay.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, DbError> {
        self.overlay
            .transfers
            .get(&id)
            .cloned()
            .or_else(|| self.shared.committed().transfers.get(&id).cloned())
            .ok_or(DbError::NotFound)
    }

    async fn list_transfers(
        &mut self,
        account_id: i64,
        page: Page,
    ) -> Result<Vec<Transfer>, DbError> {
        let rows = Self::merged(&self.shared.committed().transfers, &self.overlay.transfers);
        Ok(Self::paginate(
            rows.into_values()
                .rev()
                .filter(|t| t.from_account_id == account_id || t.to_account_id == account_id),
            page,
        ))
    }

    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, DbError> {
        {
            let committed = self.shared.committed();
            let conflict = self
                .user_conflict(&committed, &arg.username, &arg.email)
                .or_else(|| self.user_conflict(&self.overlay, &arg.username, &arg.email));
            if let Some(err) = conflict {
                return Err(err);
            }
        }

        let now = Utc::now();
        let user = User {
            username: arg.username,
            hashed_password: arg.hashed_password,
            full_name: arg.full_name,
            email: arg.email,
            password_changed_at: chrono::DateTime::<Utc>::UNIX_EPOCH,
            created_at: now,
        };
        self.overlay
            .users
            .insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User, DbError> {
        self.overlay
            .users
            .get(username)
            .cloned()
            .or_else(|| self.shared.committed().users.get(username).cloned())
            .ok_or(DbError::NotFound)
    }

    async fn enqueue_task(&mut self, task: NewTask) -> Result<OutboxTask, DbError> {
        let task = OutboxTask {
            id: next_id(&self.shared.sequences.tasks),
            kind: task.kind,
            payload: task.payload,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            delivered_at: None,
        };
        self.overlay.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn claim_pending_tasks(&mut self, limit: i64) -> Result<Vec<OutboxTask>, DbError> {
        let candidates: Vec<i64> = {
            let rows = Self::merged(&self.shared.committed().tasks, &self.overlay.tasks);
            rows.into_values()
                .filter(|t| t.status == TaskStatus::Pending)
                .map(|t| t.id)
                .collect()
        };

        let mut claimed = Vec::new();
        for id in candidates {
            if claimed.len() as i64 >= limit {
                break;
            }
            let key = RowKey::Task(id);
            let already_held = self.held.contains_key(&key);
            if !self.try_lock_row(key) {
                continue;
            }
            // Re-read under the lock: another transaction may have finished
            // the task between the scan and the lock.
            match self.task(id) {
                Some(task) if task.status == TaskStatus::Pending => claimed.push(task),
                _ if !already_held => {
                    self.held.remove(&key);
                }
                _ => {}
            }
        }

        Ok(claimed)
    }

    async fn mark_task_delivered(&mut self, id: i64) -> Result<OutboxTask, DbError> {
        self.lock_row(RowKey::Task(id)).await?;

        let mut task = self.task(id).ok_or(DbError::NotFound)?;
        task.status = TaskStatus::Delivered;
        task.attempts += 1;
        task.last_error = None;
        task.delivered_at = Some(Utc::now());

        self.overlay.tasks.insert(id, task.clone());
        Ok(task)
    }

    async fn record_task_failure(
        &mut self,
        id: i64,
        error: &str,
        max_attempts: i32,
    ) -> Result<OutboxTask, DbError> {
        self.lock_row(RowKey::Task(id)).await?;

        let mut task = self.task(id).ok_or(DbError::NotFound)?;
        task.attempts += 1;
        task.last_error = Some(error.to_string());
        task.status = if task.attempts >= max_attempts {
            TaskStatus::Failed
        } else {
            TaskStatus::Pending
        };

        self.overlay.tasks.insert(id, task.clone());
        Ok(task)
    }
}

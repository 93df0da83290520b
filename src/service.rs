//! Bank service
//!
//! Request-level entry points. Every request is validated here before a
//! transaction is opened; the store orchestrators then enforce the same
//! money rules again under row locks.

use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::debug;

use crate::context::TxContext;
use crate::currency::Currency;
use crate::db::{Account, Backend, CreateAccountParams, CreateUserParams, Entry, Page, Transfer, User};
use crate::error::BankError;
use crate::store::{CreateUserOutboxResult, Store, TransferTxParams, TransferTxResult};
use crate::validation::{Email, FullName, Username, ValidationError, validate_amount};
use crate::worker::PayloadSendVerifyEmail;

/// Transfer request as received from a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
    pub currency: String,
}

/// Sign-up request. The password arrives already hashed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
}

impl CreateUserRequest {
    pub fn validate(self) -> Result<CreateUserParams, ValidationError> {
        let username = Username::new(&self.username)?;
        let full_name = FullName::new(&self.full_name)?;
        let email = Email::new(&self.email)?;
        if self.hashed_password.is_empty() {
            return Err(ValidationError::Required("hashed_password"));
        }

        Ok(CreateUserParams {
            username: username.into_string(),
            hashed_password: self.hashed_password,
            full_name: full_name.into_string(),
            email: email.into_string(),
        })
    }
}

pub struct BankService<B: Backend> {
    store: Store<B>,
}

impl<B: Backend> Clone for BankService<B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<B: Backend> BankService<B> {
    pub fn new(store: Store<B>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store<B> {
        &self.store
    }

    /// Execute a transfer
    pub async fn transfer_money(
        &self,
        ctx: &TxContext,
        req: TransferRequest,
    ) -> Result<TransferTxResult, BankError> {
        // 1. Validation
        let amount = validate_amount(req.amount)?;
        let currency: Currency = req.currency.parse()?;
        if req.from_account_id == req.to_account_id {
            return Err(ValidationError::SameAccount(req.from_account_id).into());
        }

        // 2. Both accounts must exist and be in the requested currency
        self.valid_account(ctx, req.from_account_id, currency).await?;
        self.valid_account(ctx, req.to_account_id, currency).await?;

        // 3. Transaction
        self.store
            .transfer_tx(
                ctx,
                TransferTxParams {
                    from_account_id: req.from_account_id,
                    to_account_id: req.to_account_id,
                    amount,
                },
            )
            .await
    }

    async fn valid_account(
        &self,
        ctx: &TxContext,
        account_id: i64,
        currency: Currency,
    ) -> Result<Account, BankError> {
        let account = self.store.get_account(ctx, account_id).await?;
        if account.currency != currency {
            debug!(
                account_id,
                expected = %currency,
                actual = %account.currency,
                "Currency mismatch"
            );
            return Err(ValidationError::CurrencyMismatch {
                account_id,
                expected: currency,
                actual: account.currency,
            }
            .into());
        }
        Ok(account)
    }

    /// Sign up a user and run `after_create` before the insert commits.
    pub async fn create_user<F, Fut>(
        &self,
        ctx: &TxContext,
        req: CreateUserRequest,
        after_create: F,
    ) -> Result<User, BankError>
    where
        F: FnOnce(User) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let params = req.validate()?;
        let result = self.store.create_user_tx(ctx, params, after_create).await?;
        Ok(result.user)
    }

    /// Sign up a user and queue the verification email in the same commit.
    pub async fn create_user_with_verification(
        &self,
        ctx: &TxContext,
        req: CreateUserRequest,
    ) -> Result<CreateUserOutboxResult, BankError> {
        let params = req.validate()?;
        self.store
            .create_user_outbox(ctx, params, |user| {
                Ok(PayloadSendVerifyEmail {
                    username: user.username.clone(),
                }
                .into_task())
            })
            .await
    }

    pub async fn get_user(&self, ctx: &TxContext, username: &str) -> Result<User, BankError> {
        self.store.get_user(ctx, username).await
    }

    /// Open a zero-balance account. One account per owner and currency.
    pub async fn create_account(
        &self,
        ctx: &TxContext,
        owner: &str,
        currency: &str,
    ) -> Result<Account, BankError> {
        let currency: Currency = currency.parse()?;
        let params = CreateAccountParams {
            owner: owner.to_string(),
            balance: 0,
            currency,
        };
        self.store
            .exec_tx(ctx, move |q| {
                Box::pin(async move { q.create_account(params).await.map_err(BankError::from) })
            })
            .await
    }

    pub async fn get_account(&self, ctx: &TxContext, id: i64) -> Result<Account, BankError> {
        self.store.get_account(ctx, id).await
    }

    pub async fn list_accounts(
        &self,
        ctx: &TxContext,
        owner: &str,
        page: Page,
    ) -> Result<Vec<Account>, BankError> {
        self.store.list_accounts(ctx, owner, page).await
    }

    pub async fn get_transfer(&self, ctx: &TxContext, id: i64) -> Result<Transfer, BankError> {
        self.store.get_transfer(ctx, id).await
    }

    pub async fn list_transfers(
        &self,
        ctx: &TxContext,
        account_id: i64,
        page: Page,
    ) -> Result<Vec<Transfer>, BankError> {
        self.store.list_transfers(ctx, account_id, page).await
    }

    pub async fn list_entries(
        &self,
        ctx: &TxContext,
        account_id: i64,
        page: Page,
    ) -> Result<Vec<Entry>, BankError> {
        self.store.list_entries(ctx, account_id, page).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryBackend;
    use crate::db::{AddAccountBalanceParams, DbError};

    fn sign_up_request(username: &str) -> CreateUserRequest {
        CreateUserRequest {
            username: username.to_string(),
            hashed_password: "$argon2id$v=19$hash".to_string(),
            full_name: "Test User".to_string(),
            email: format!("{}@example.com", username),
        }
    }

    async fn service_with_accounts() -> (MemoryBackend, BankService<MemoryBackend>, Account, Account) {
        let backend = MemoryBackend::new();
        let service = BankService::new(Store::new(backend.clone()));
        let ctx = TxContext::background();

        for name in ["alice", "bob"] {
            service
                .create_user(&ctx, sign_up_request(name), |_| async { Ok(()) })
                .await
                .unwrap();
        }
        let a = service.create_account(&ctx, "alice", "USD").await.unwrap();
        let b = service.create_account(&ctx, "bob", "USD").await.unwrap();

        // Fund the accounts directly.
        let (a_id, b_id) = (a.id, b.id);
        service
            .store()
            .exec_tx(&ctx, move |q| {
                Box::pin(async move {
                    q.add_account_balance(AddAccountBalanceParams { id: a_id, amount: 100 })
                        .await?;
                    q.add_account_balance(AddAccountBalanceParams { id: b_id, amount: 50 })
                        .await?;
                    Ok::<_, BankError>(())
                })
            })
            .await
            .unwrap();

        let a = service.get_account(&ctx, a.id).await.unwrap();
        let b = service.get_account(&ctx, b.id).await.unwrap();
        (backend, service, a, b)
    }

    fn request(from: &Account, to: &Account, amount: i64, currency: &str) -> TransferRequest {
        TransferRequest {
            from_account_id: from.id,
            to_account_id: to.id,
            amount,
            currency: currency.to_string(),
        }
    }

    #[tokio::test]
    async fn test_transfer_money() {
        let (_backend, service, a, b) = service_with_accounts().await;
        let ctx = TxContext::background();

        let result = service
            .transfer_money(&ctx, request(&a, &b, 30, "USD"))
            .await
            .unwrap();
        assert_eq!(result.from_account.balance, 70);
        assert_eq!(result.to_account.balance, 80);

        let entries = service.list_entries(&ctx, a.id, Page::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, -30);
        assert_eq!(
            service.get_transfer(&ctx, result.transfer.id).await.unwrap(),
            result.transfer
        );
    }

    #[tokio::test]
    async fn test_rejected_requests_touch_nothing() {
        let (backend, service, a, b) = service_with_accounts().await;
        let ctx = TxContext::background();
        let before = backend.counts();
        let begins = backend.begin_count();

        let err = service
            .transfer_money(&ctx, request(&a, &b, -5, "USD"))
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::Validation(ValidationError::InvalidAmount(-5))));

        let err = service
            .transfer_money(&ctx, request(&a, &b, 5, "XYZ"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BankError::Validation(ValidationError::UnsupportedCurrency(_))
        ));

        let err = service
            .transfer_money(&ctx, request(&a, &a, 5, "USD"))
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::Validation(ValidationError::SameAccount(_))));

        assert_eq!(backend.begin_count(), begins);
        assert_eq!(backend.counts(), before);
    }

    #[tokio::test]
    async fn test_currency_must_match_request() {
        let (backend, service, a, b) = service_with_accounts().await;
        let before = backend.counts();

        let err = service
            .transfer_money(&TxContext::background(), request(&a, &b, 5, "EUR"))
            .await
            .unwrap_err();

        match err {
            BankError::Validation(ValidationError::CurrencyMismatch {
                account_id,
                expected,
                actual,
            }) => {
                assert_eq!(account_id, a.id);
                assert_eq!(expected, Currency::EUR);
                assert_eq!(actual, Currency::USD);
            }
            other => panic!("expected currency mismatch, got {other:?}"),
        }
        assert_eq!(backend.counts(), before);
    }

    #[tokio::test]
    async fn test_unknown_account_is_not_found() {
        let (_backend, service, a, _b) = service_with_accounts().await;
        let err = service
            .transfer_money(
                &TxContext::background(),
                TransferRequest {
                    from_account_id: a.id,
                    to_account_id: 9_999,
                    amount: 5,
                    currency: "USD".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn test_duplicate_account_currency_conflicts() {
        let (_backend, service, _a, _b) = service_with_accounts().await;
        let err = service
            .create_account(&TxContext::background(), "alice", "USD")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BankError::Conflict(DbError::UniqueViolation { ref constraint, .. }) if constraint == "owner_currency_key"
        ));

        let eur = service
            .create_account(&TxContext::background(), "alice", "EUR")
            .await
            .unwrap();
        let accounts = service
            .list_accounts(&TxContext::background(), "alice", Page::default())
            .await
            .unwrap();
        assert_eq!(accounts.len(), 2);
        assert!(accounts.contains(&eur));
    }

    #[tokio::test]
    async fn test_account_for_unknown_owner_is_conflict() {
        let service = BankService::new(Store::new(MemoryBackend::new()));
        let err = service
            .create_account(&TxContext::background(), "ghost", "USD")
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::Conflict(DbError::ForeignKeyViolation { .. })));
    }

    #[tokio::test]
    async fn test_invalid_sign_up_is_rejected_before_store() {
        let backend = MemoryBackend::new();
        let service = BankService::new(Store::new(backend.clone()));

        let mut req = sign_up_request("alice");
        req.email = "not-an-email".to_string();
        let err = service
            .create_user(&TxContext::background(), req, |_| async { Ok(()) })
            .await
            .unwrap_err();

        assert!(matches!(err, BankError::Validation(ValidationError::InvalidFormat { .. })));
        assert_eq!(backend.begin_count(), 0);
    }

    #[test]
    fn test_missing_password_hash_is_required_field() {
        let mut req = sign_up_request("alice");
        req.hashed_password.clear();

        let err = req.validate().unwrap_err();
        assert_eq!(err, ValidationError::Required("hashed_password"));
        assert_eq!(err.to_string(), "hashed_password is required");
    }

    #[tokio::test]
    async fn test_sign_up_with_verification_queues_task() {
        let backend = MemoryBackend::new();
        let service = BankService::new(Store::new(backend.clone()));

        let result = service
            .create_user_with_verification(&TxContext::background(), sign_up_request("carol"))
            .await
            .unwrap();

        assert_eq!(result.user.username, "carol");
        assert_eq!(result.task.kind, crate::worker::TASK_SEND_VERIFY_EMAIL);
        assert_eq!(
            service
                .get_user(&TxContext::background(), "carol")
                .await
                .unwrap()
                .email,
            "carol@example.com"
        );
    }
}

//! simplebank smoke run
//!
//! Signs up two users, opens and funds one USD account each, then fires
//! the same number of transfers in both directions at once and checks that
//! no money was created or lost. Finishes with one outbox dispatch cycle.
//!
//! ```text
//! cargo run -- --env dev     # in-process store unless DATABASE_URL is set
//! cargo run -- --env ci      # PostgreSQL, serializable isolation
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use simplebank::config::AppConfig;
use simplebank::db::AddAccountBalanceParams;
use simplebank::worker::task_channel;
use simplebank::{
    Backend, BankError, BankService, CreateUserRequest, MemoryBackend, OutboxDispatcher,
    PgBackend, Store, TransferRequest, TransferTxResult, TxContext,
};

/// Attempts after the first for a transfer that failed transiently
const MAX_TRANSFER_RETRIES: u32 = 5;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = simplebank::logging::init_logging(&app_config);

    info!(env = %env, git_hash = env!("GIT_HASH"), "Starting simplebank");

    match app_config.database_url() {
        Some(url) => {
            let backend = PgBackend::connect(&app_config.database, &url).await?;
            backend.health_check().await?;
            smoke_run(Store::new(backend), &app_config).await
        }
        None => {
            info!("No database URL configured, using in-process store");
            smoke_run(Store::new(MemoryBackend::new()), &app_config).await
        }
    }
}

fn sign_up(username: &str, full_name: &str) -> CreateUserRequest {
    CreateUserRequest {
        username: username.to_string(),
        hashed_password: "smoke-run-not-a-real-hash".to_string(),
        full_name: full_name.to_string(),
        email: format!("{}@smoke.simplebank.test", username),
    }
}

/// Re-run a transfer from scratch while it fails with a retryable error.
async fn transfer_with_retry<B: Backend>(
    service: BankService<B>,
    ctx: TxContext,
    req: TransferRequest,
) -> Result<TransferTxResult, BankError> {
    let mut attempt = 0;
    loop {
        match service.transfer_money(&ctx, req.clone()).await {
            Err(e) if e.is_retryable() && attempt < MAX_TRANSFER_RETRIES => {
                attempt += 1;
                warn!(attempt, error = %e, "Transfer failed transiently, retrying");
                tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
            }
            result => return result,
        }
    }
}

async fn smoke_run<B: Backend>(store: Store<B>, config: &AppConfig) -> anyhow::Result<()> {
    let smoke = &config.smoke;
    let service = BankService::new(store.clone());
    let ctx = TxContext::with_timeout(Duration::from_millis(smoke.timeout_ms));

    // Unique names so repeated runs against one database do not collide.
    let run_id = chrono::Utc::now().timestamp_millis();
    let alice_name = format!("smoke_alice_{}", run_id);
    let bob_name = format!("smoke_bob_{}", run_id);

    // 1. Users: one through the outbox, one through the in-transaction hook
    let alice = service
        .create_user_with_verification(&ctx, sign_up(&alice_name, "Smoke Alice"))
        .await?
        .user;
    let bob = service
        .create_user(&ctx, sign_up(&bob_name, "Smoke Bob"), |user| async move {
            info!(username = %user.username, "After-create hook ran");
            Ok(())
        })
        .await?;

    // 2. Accounts with an opening deposit
    let a = service.create_account(&ctx, &alice.username, "USD").await?;
    let b = service.create_account(&ctx, &bob.username, "USD").await?;
    let (a_id, b_id, opening) = (a.id, b.id, smoke.opening_balance);
    store
        .exec_tx(&ctx, move |q| {
            Box::pin(async move {
                for id in [a_id, b_id] {
                    q.add_account_balance(AddAccountBalanceParams {
                        id,
                        amount: opening,
                    })
                    .await
                    .map_err(|e| BankError::from_lookup("account", id, e))?;
                }
                Ok::<_, BankError>(())
            })
        })
        .await?;

    // 3. Opposite-direction transfers, all in flight together
    let n = smoke.transfers_per_direction;
    let mut handles = Vec::with_capacity(2 * n);
    for i in 0..2 * n {
        let (from, to) = if i % 2 == 0 { (a_id, b_id) } else { (b_id, a_id) };
        let req = TransferRequest {
            from_account_id: from,
            to_account_id: to,
            amount: smoke.amount,
            currency: "USD".to_string(),
        };
        handles.push(tokio::spawn(transfer_with_retry(
            service.clone(),
            ctx.clone(),
            req,
        )));
    }

    let mut committed = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => committed += 1,
            Err(e) => {
                warn!(error = %e, "Transfer rejected");
                rejected += 1;
            }
        }
    }

    // 4. Conservation check
    let a = service.get_account(&ctx, a_id).await?;
    let b = service.get_account(&ctx, b_id).await?;
    info!(
        committed,
        rejected,
        alice_balance = a.balance,
        bob_balance = b.balance,
        "Transfers finished"
    );
    anyhow::ensure!(
        a.balance + b.balance == 2 * opening,
        "balance drift: {} + {} != {}",
        a.balance,
        b.balance,
        2 * opening
    );
    anyhow::ensure!(rejected == 0, "{} transfers were rejected", rejected);

    // 5. Deliver the verification email task
    let (distributor, mut receiver) = task_channel(16);
    let dispatcher = OutboxDispatcher::new(store, Arc::new(distributor), config.outbox.clone());
    let stats = dispatcher.run_once(&ctx).await?;
    while let Some(task) = receiver.try_recv() {
        let payload = task.send_verify_email()?;
        info!(task_id = task.task_id, username = %payload.username, "Verification email queued");
    }

    info!(delivered = stats.delivered, "Smoke run passed");
    Ok(())
}

//! Outbox Dispatcher
//!
//! Claims pending outbox tasks, hands them to a [`TaskDistributor`] and
//! records the outcome, all in one transaction per batch. Claimed rows stay
//! locked until that transaction ends, so concurrent dispatchers skip each
//! other's tasks instead of delivering them twice.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{TaskDistributor, TaskMessage};
use crate::config::OutboxConfig;
use crate::context::TxContext;
use crate::db::{Backend, Queries, TaskStatus};
use crate::error::BankError;
use crate::store::Store;

/// Outcome of one dispatch cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub claimed: usize,
    pub delivered: usize,
    /// Failed this time, will be retried
    pub retried: usize,
    /// Failed for the last time
    pub failed: usize,
}

const TASK: &str = "outbox task";

async fn mark_delivered(q: &mut dyn Queries, id: i64) -> Result<(), BankError> {
    q.mark_task_delivered(id)
        .await
        .map_err(|e| BankError::from_lookup(TASK, id, e))?;
    Ok(())
}

async fn dispatch_in_tx(
    q: &mut dyn Queries,
    distributor: Arc<dyn TaskDistributor>,
    batch_size: i64,
    max_attempts: i32,
) -> Result<DispatchStats, BankError> {
    let tasks = q.claim_pending_tasks(batch_size).await?;
    let mut stats = DispatchStats {
        claimed: tasks.len(),
        ..Default::default()
    };

    for task in &tasks {
        let message = TaskMessage::from(task);
        match distributor.distribute(&message).await {
            Ok(()) => {
                mark_delivered(q, task.id).await?;
                stats.delivered += 1;
            }
            Err(e) => {
                let updated = q
                    .record_task_failure(task.id, &e.to_string(), max_attempts)
                    .await
                    .map_err(|err| BankError::from_lookup(TASK, task.id, err))?;
                if updated.status == TaskStatus::Failed {
                    error!(
                        task_id = task.id,
                        kind = %task.kind,
                        attempts = updated.attempts,
                        error = %e,
                        "Task delivery failed permanently"
                    );
                    stats.failed += 1;
                } else {
                    warn!(
                        task_id = task.id,
                        kind = %task.kind,
                        attempts = updated.attempts,
                        error = %e,
                        "Task delivery failed, will retry"
                    );
                    stats.retried += 1;
                }
            }
        }
    }

    Ok(stats)
}

pub struct OutboxDispatcher<B: Backend> {
    store: Store<B>,
    distributor: Arc<dyn TaskDistributor>,
    config: OutboxConfig,
}

impl<B: Backend> OutboxDispatcher<B> {
    pub fn new(store: Store<B>, distributor: Arc<dyn TaskDistributor>, config: OutboxConfig) -> Self {
        Self {
            store,
            distributor,
            config,
        }
    }

    /// Run a single claim/deliver/record cycle
    pub async fn run_once(&self, ctx: &TxContext) -> Result<DispatchStats, BankError> {
        let distributor = self.distributor.clone();
        let batch_size = self.config.batch_size;
        let max_attempts = self.config.max_attempts;

        let stats = self
            .store
            .exec_tx(ctx, move |q| {
                Box::pin(dispatch_in_tx(q, distributor, batch_size, max_attempts))
            })
            .await?;

        if stats.claimed == 0 {
            debug!("No pending tasks");
        } else {
            info!(
                claimed = stats.claimed,
                delivered = stats.delivered,
                retried = stats.retried,
                failed = stats.failed,
                "Dispatched outbox tasks"
            );
        }
        Ok(stats)
    }

    /// Poll until `shutdown` is cancelled.
    ///
    /// A cycle interrupted by shutdown rolls back; its tasks stay pending.
    pub async fn run(&self, shutdown: &TxContext) {
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            max_attempts = self.config.max_attempts,
            "Starting outbox dispatcher"
        );

        while shutdown.check().is_ok() {
            match self.run_once(shutdown).await {
                Ok(_) => {}
                Err(BankError::Cancelled) | Err(BankError::DeadlineExceeded) => break,
                Err(e) => error!(error = %e, "Outbox dispatch failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = shutdown.done() => break,
            }
        }

        info!("Outbox dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CreateUserParams;
    use crate::db::memory::MemoryBackend;
    use crate::worker::PayloadSendVerifyEmail;
    use crate::worker::channel::task_channel;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    fn config(max_attempts: i32) -> OutboxConfig {
        OutboxConfig {
            poll_interval_ms: 10,
            batch_size: 100,
            max_attempts,
        }
    }

    async fn sign_up(store: &Store<MemoryBackend>, username: &str) {
        store
            .create_user_outbox(
                &TxContext::background(),
                CreateUserParams {
                    username: username.to_string(),
                    hashed_password: "hash".to_string(),
                    full_name: "Some One".to_string(),
                    email: format!("{}@example.com", username),
                },
                |user| {
                    Ok(PayloadSendVerifyEmail {
                        username: user.username.clone(),
                    }
                    .into_task())
                },
            )
            .await
            .unwrap();
    }

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<i64>>,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl TaskDistributor for Recording {
        async fn distribute(&self, task: &TaskMessage) -> anyhow::Result<()> {
            tokio::time::sleep(self.delay).await;
            anyhow::ensure!(!self.fail, "mailer down");
            self.seen.lock().unwrap().push(task.task_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_delivers_pending_tasks_once() {
        let store = Store::new(MemoryBackend::new());
        sign_up(&store, "alice").await;
        sign_up(&store, "bob").await;

        let (distributor, mut receiver) = task_channel(16);
        let dispatcher = OutboxDispatcher::new(store, Arc::new(distributor), config(3));

        let stats = dispatcher.run_once(&TxContext::background()).await.unwrap();
        assert_eq!(
            stats,
            DispatchStats {
                claimed: 2,
                delivered: 2,
                retried: 0,
                failed: 0,
            }
        );

        let first = receiver.recv().await.unwrap();
        let second = receiver.recv().await.unwrap();
        let mut names = vec![
            first.send_verify_email().unwrap().username,
            second.send_verify_email().unwrap().username,
        ];
        names.sort();
        assert_eq!(names, vec!["alice", "bob"]);

        let again = dispatcher.run_once(&TxContext::background()).await.unwrap();
        assert_eq!(again.claimed, 0);
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_missing_task_names_the_entity() {
        let store = Store::new(MemoryBackend::new());
        let err = store
            .exec_tx(&TxContext::background(), |q| Box::pin(mark_delivered(q, 9999)))
            .await
            .unwrap_err();

        match err {
            BankError::NotFound { entity, key } => {
                assert_eq!(entity, "outbox task");
                assert_eq!(key, "9999");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_uncommitted_task_is_not_dispatched() {
        use crate::db::{NewTask, Transaction};

        let backend = MemoryBackend::new();
        let store = Store::new(backend.clone());
        let (distributor, mut receiver) = task_channel(4);
        let dispatcher = OutboxDispatcher::new(store, Arc::new(distributor), config(3));

        let mut open = backend.begin(&TxContext::background()).await.unwrap();
        open.enqueue_task(NewTask {
            kind: crate::worker::TASK_SEND_VERIFY_EMAIL.to_string(),
            payload: serde_json::json!({ "username": "alice" }),
        })
        .await
        .unwrap();

        let stats = dispatcher.run_once(&TxContext::background()).await.unwrap();
        assert_eq!(stats.claimed, 0);

        open.commit().await.unwrap();
        let stats = dispatcher.run_once(&TxContext::background()).await.unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(receiver.recv().await.unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_failing_delivery_is_retried_then_parked() {
        let store = Store::new(MemoryBackend::new());
        sign_up(&store, "alice").await;

        let distributor = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let dispatcher = OutboxDispatcher::new(store, distributor, config(2));

        let first = dispatcher.run_once(&TxContext::background()).await.unwrap();
        assert_eq!((first.claimed, first.retried, first.failed), (1, 1, 0));

        let second = dispatcher.run_once(&TxContext::background()).await.unwrap();
        assert_eq!((second.claimed, second.retried, second.failed), (1, 0, 1));

        let third = dispatcher.run_once(&TxContext::background()).await.unwrap();
        assert_eq!(third.claimed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dispatchers_split_the_work() {
        let store = Store::new(MemoryBackend::new());
        for i in 0..6 {
            sign_up(&store, &format!("user_{}", i)).await;
        }

        let distributor = Arc::new(Recording {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let a = Arc::new(OutboxDispatcher::new(store.clone(), distributor.clone(), config(3)));
        let b = Arc::new(OutboxDispatcher::new(store, distributor.clone(), config(3)));

        let (ctx_a, ctx_b) = (TxContext::background(), TxContext::background());
        let (ra, rb) = tokio::join!(a.run_once(&ctx_a), b.run_once(&ctx_b));
        let delivered = ra.unwrap().delivered + rb.unwrap().delivered;
        assert_eq!(delivered, 6);

        let mut seen = distributor.seen.lock().unwrap().clone();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 6);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_keeps_tasks_pending() {
        let store = Store::new(MemoryBackend::new());
        sign_up(&store, "alice").await;

        let slow = Arc::new(Recording {
            delay: Duration::from_secs(30),
            ..Default::default()
        });
        let dispatcher = OutboxDispatcher::new(store.clone(), slow, config(3));
        let err = dispatcher
            .run_once(&TxContext::with_timeout(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::DeadlineExceeded));

        let (distributor, mut receiver) = task_channel(4);
        let retry = OutboxDispatcher::new(store, Arc::new(distributor), config(3));
        assert_eq!(
            retry.run_once(&TxContext::background()).await.unwrap().delivered,
            1
        );
        assert_eq!(receiver.recv().await.unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Store::new(MemoryBackend::new());
        sign_up(&store, "alice").await;

        let (distributor, mut receiver) = task_channel(4);
        let dispatcher = Arc::new(OutboxDispatcher::new(store, Arc::new(distributor), config(3)));
        let (handle, shutdown) = TxContext::with_cancel();

        let worker = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run(&shutdown).await })
        };

        let task = receiver.recv().await.unwrap();
        assert_eq!(task.kind, crate::worker::TASK_SEND_VERIFY_EMAIL);

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
    }
}

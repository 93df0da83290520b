//! Background task delivery
//!
//! Tasks written to the outbox table inside a business transaction are
//! handed to a [`TaskDistributor`] by the [`OutboxDispatcher`]. Delivery is
//! at-least-once: a task whose delivery succeeded but whose status update
//! did not commit is delivered again.

pub mod channel;
pub mod dispatcher;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::{NewTask, OutboxTask};

pub use channel::{ChannelDistributor, TaskReceiver, task_channel};
pub use dispatcher::{DispatchStats, OutboxDispatcher};

/// Task kind for the verification email sent after sign-up
pub const TASK_SEND_VERIFY_EMAIL: &str = "send_verify_email";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub username: String,
}

impl PayloadSendVerifyEmail {
    pub fn into_task(self) -> NewTask {
        NewTask {
            kind: TASK_SEND_VERIFY_EMAIL.to_string(),
            payload: serde_json::json!({ "username": self.username }),
        }
    }
}

/// A task as handed to the distributor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    /// Deliveries attempted before this one
    pub attempts: i32,
}

impl From<&OutboxTask> for TaskMessage {
    fn from(task: &OutboxTask) -> Self {
        Self {
            task_id: task.id,
            kind: task.kind.clone(),
            payload: task.payload.clone(),
            attempts: task.attempts,
        }
    }
}

impl TaskMessage {
    /// Decode the payload of a [`TASK_SEND_VERIFY_EMAIL`] task.
    pub fn send_verify_email(&self) -> anyhow::Result<PayloadSendVerifyEmail> {
        anyhow::ensure!(
            self.kind == TASK_SEND_VERIFY_EMAIL,
            "task {} is {}, not {}",
            self.task_id,
            self.kind,
            TASK_SEND_VERIFY_EMAIL
        );
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Hands tasks to whatever executes them (queue, mailer, channel).
#[async_trait]
pub trait TaskDistributor: Send + Sync {
    async fn distribute(&self, task: &TaskMessage) -> anyhow::Result<()>;
}

//! In-process task channel
//!
//! [`ChannelDistributor`] forwards tasks over a bounded tokio mpsc channel
//! to a consumer holding the [`TaskReceiver`].

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{TaskDistributor, TaskMessage};

/// Sender side, used by the dispatcher
#[derive(Clone)]
pub struct ChannelDistributor {
    tx: mpsc::Sender<TaskMessage>,
}

/// Receiver side, used by the task consumer
pub struct TaskReceiver {
    rx: mpsc::Receiver<TaskMessage>,
}

impl TaskReceiver {
    /// Try to receive a task (non-blocking)
    pub fn try_recv(&mut self) -> Option<TaskMessage> {
        self.rx.try_recv().ok()
    }

    /// Receive a task, waiting until one is available or every sender is gone
    pub async fn recv(&mut self) -> Option<TaskMessage> {
        self.rx.recv().await
    }
}

/// Create a new task channel pair
pub fn task_channel(buffer: usize) -> (ChannelDistributor, TaskReceiver) {
    let (tx, rx) = mpsc::channel(buffer);
    (ChannelDistributor { tx }, TaskReceiver { rx })
}

#[async_trait]
impl TaskDistributor for ChannelDistributor {
    async fn distribute(&self, task: &TaskMessage) -> anyhow::Result<()> {
        self.tx
            .send(task.clone())
            .await
            .map_err(|_| anyhow::anyhow!("Task channel closed"))?;
        debug!(task_id = task.task_id, kind = %task.kind, "Task sent to channel");
        Ok(())
    }
}

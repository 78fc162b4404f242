use futures::future::join_all;
use poise::serenity_prelude::Context;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[async_trait::async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;
    /// How long to wait between runs; `None` ends the task.
    fn schedule(&self) -> Option<Duration>;
    async fn execute(
        &mut self,
        ctx: &Context,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Default)]
pub struct TaskManager {
    tasks: Mutex<Vec<Box<dyn Task>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_task(&self, task: impl Task + 'static) {
        self.tasks.lock().await.push(Box::new(task));
    }

    pub async fn start_tasks(&self, ctx: Context) {
        let mut tasks = self.tasks.lock().await;
        let mut handles = self.handles.lock().await;

        for mut task in tasks.drain(..) {
            let ctx = ctx.clone();
            debug!("Starting task {}", task.name());
            handles.push(tokio::spawn(async move {
                while let Some(interval) = task.schedule() {
                    if let Err(e) = task.execute(&ctx).await {
                        error!("Task {} failed: {}", task.name(), e);
                    }
                    tokio::time::sleep(interval).await;
                }
            }));
        }
    }

    pub async fn shutdown(&self) {
        let mut handles = self.handles.lock().await;
        for handle in handles.iter() {
            handle.abort();
        }
        join_all(handles.drain(..)).await;
    }
}

use super::registry::{GuildRegistry, TenantId};
use crate::tasks::Task;
use async_trait::async_trait;
use poise::serenity_prelude::Context;
use std::{sync::Arc, time::Duration};
use tracing::{error, info};

/// Clears sessions whose server process died without being stopped, so
/// status never reports a dead server as running.
#[derive(Debug, Clone)]
pub struct SessionReaperTask {
    registry: Arc<GuildRegistry>,
}

impl SessionReaperTask {
    pub fn new(registry: Arc<GuildRegistry>) -> Self {
        Self { registry }
    }

    async fn sweep(&self) -> Vec<(TenantId, String)> {
        let mut reaped = Vec::new();
        for id in self.registry.for_each_tenant() {
            match self.registry.sessions(id).await {
                Ok(sessions) => {
                    if let Some(name) = sessions.reap_if_exited().await {
                        reaped.push((id, name));
                    }
                }
                Err(e) => error!("Failed to inspect guild {}: {}", id, e),
            }
        }
        reaped
    }
}

#[async_trait]
impl Task for SessionReaperTask {
    fn name(&self) -> &str {
        "SessionReaper"
    }

    fn schedule(&self) -> Option<Duration> {
        Some(Duration::from_secs(30))
    }

    async fn execute(
        &mut self,
        _ctx: &Context,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let reaped = self.sweep().await;
        if !reaped.is_empty() {
            info!("Reaped {} exited server(s)", reaped.len());
        }
        Ok(())
    }
}

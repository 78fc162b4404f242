use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use poise::serenity_prelude::{Context, FullEvent};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait EventHandler: Send + Sync + Debug {
    fn name(&self) -> &str;
    async fn handle(
        &self,
        ctx: &Context,
        event: &FullEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Fans each gateway event out to every registered handler concurrently.
#[derive(Debug, Default)]
pub struct EventManager {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_handler(&self, handler: impl EventHandler + 'static) {
        self.handlers.write().await.push(Arc::new(handler));
    }

    pub async fn handle_event(&self, ctx: &Context, event: &FullEvent) {
        let handlers = self.handlers.read().await.clone();
        let mut futures = FuturesUnordered::new();

        for handler in handlers {
            let ctx = ctx.clone();
            let event = event.clone();

            futures.push(tokio::spawn(async move {
                if let Err(e) = handler.handle(&ctx, &event).await {
                    tracing::error!("Error in event handler {}: {}", handler.name(), e);
                }
            }));
        }

        while futures.next().await.is_some() {}
    }
}

use crate::{
    events::EventHandler,
    modules::servers::registry::{GuildRegistry, TenantId},
};
use async_trait::async_trait;
use poise::serenity_prelude::{ActivityData, Context, FullEvent, OnlineStatus};
use std::sync::Arc;
use tracing::info;

/// Sets the bot's presence and registers every guild it can see, including
/// ones that only exist as storage directories from an earlier run.
#[derive(Debug, Clone)]
pub struct ReadyHandler {
    registry: Arc<GuildRegistry>,
}

impl ReadyHandler {
    pub fn new(registry: Arc<GuildRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventHandler for ReadyHandler {
    fn name(&self) -> &str {
        "Ready"
    }

    async fn handle(
        &self,
        ctx: &Context,
        event: &FullEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let FullEvent::Ready { data_about_bot } = event {
            ctx.set_presence(
                Some(ActivityData::playing("Minecraft")),
                OnlineStatus::Online,
            );
            info!("Bot ready as {}", data_about_bot.user.name);

            for guild in &data_about_bot.guilds {
                self.registry.get_or_create(TenantId::from(guild.id)).await?;
            }
            for id in self.registry.discover().await? {
                info!("Managing guild {}", id);
            }
        }
        Ok(())
    }
}

/// Registers guilds the bot joins while running.
#[derive(Debug, Clone)]
pub struct GuildJoinHandler {
    registry: Arc<GuildRegistry>,
}

impl GuildJoinHandler {
    pub fn new(registry: Arc<GuildRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventHandler for GuildJoinHandler {
    fn name(&self) -> &str {
        "GuildJoin"
    }

    async fn handle(
        &self,
        _ctx: &Context,
        event: &FullEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let FullEvent::GuildCreate { guild, is_new } = event {
            self.registry.get_or_create(TenantId::from(guild.id)).await?;
            if is_new.unwrap_or(false) {
                info!("Joined guild {} ({})", guild.name, guild.id);
            }
        }
        Ok(())
    }
}

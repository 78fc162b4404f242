use config::Config;
use databases::Databases;
use engine::{JavaEngine, ServerEngine};
use modules::{
    servers::{registry::GuildRegistry, servers, task::SessionReaperTask},
    system::events::{GuildJoinHandler, ReadyHandler},
};
use poise::serenity_prelude::{self as serenity, CreateAllowedMentions};
use std::sync::Arc;
use tasks::TaskManager;
use tracing::{error, info, trace, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod database;
mod databases;
mod engine;
mod events;
mod modules;
mod tasks;
mod utils;

use crate::events::EventManager;

#[derive(Clone)]
pub struct Data {
    pub config: Arc<Config>,
    pub registry: Arc<GuildRegistry>,
    pub task_manager: Arc<TaskManager>,
    pub event_manager: Arc<EventManager>,
}

impl Data {
    pub async fn init_tasks(&self, ctx: &serenity::Context) {
        self.task_manager
            .add_task(SessionReaperTask::new(self.registry.clone()))
            .await;
        self.task_manager.start_tasks(ctx.clone()).await;
    }
}

type Error = Box<dyn std::error::Error + Send + Sync>;
type Context<'a> = poise::Context<'a, Data, Error>;

#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
async fn register(ctx: Context<'_>) -> Result<(), Error> {
    poise::builtins::register_application_commands_buttons(ctx).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!("starting blockhost");

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };

    let dbs = match Databases::open(&config).await {
        Ok(dbs) => dbs,
        Err(e) => {
            error!("Failed to open databases: {}", e);
            return;
        }
    };

    let engine: Arc<dyn ServerEngine> = Arc::new(JavaEngine::new(
        config.java_path.clone(),
        config.server_host.clone(),
    ));
    let registry = Arc::new(GuildRegistry::new(
        config.save_location.clone(),
        config.max_servers,
        dbs.servers.clone(),
        engine,
    ));
    let task_manager = Arc::new(TaskManager::new());
    info!(
        "Saving servers under {} with a default quota of {}",
        config.save_location.display(),
        config.max_servers
    );

    let data = Data {
        config: config.clone(),
        registry: registry.clone(),
        task_manager: task_manager.clone(),
        event_manager: Arc::new(EventManager::new()),
    };

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions::<Data, Error> {
            allowed_mentions: Some(CreateAllowedMentions::new().empty_roles().empty_users()),
            commands: vec![register(), servers()],
            pre_command: |ctx| {
                Box::pin(async move {
                    trace!(
                        "Command {} used by {} in {}",
                        ctx.command().qualified_name,
                        ctx.author().tag(),
                        utils::guild_label(ctx.guild_id())
                    );
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    info!(
                        "Command {} completed for {} in {}",
                        ctx.command().qualified_name,
                        ctx.author().tag(),
                        utils::guild_label(ctx.guild_id())
                    );
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    match error {
                        poise::FrameworkError::Command { error, ctx, .. } => {
                            error!(
                                "Command {} failed for {} in {}: {:?}",
                                ctx.command().qualified_name,
                                ctx.author().tag(),
                                utils::guild_label(ctx.guild_id()),
                                error
                            );
                            ctx.say("❌ Something went wrong, please try again later.")
                                .await
                                .ok();
                        }
                        err => {
                            if let Err(e) = poise::builtins::on_error(err).await {
                                error!("Error while handling error: {}", e);
                            }
                        }
                    }
                })
            },
            event_handler: |ctx, event, _framework, data| {
                Box::pin(async move {
                    data.event_manager.handle_event(ctx, event).await;
                    Ok(())
                })
            },
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                info!("registering commands");
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;

                data.event_manager
                    .add_handler(ReadyHandler::new(data.registry.clone()))
                    .await;
                data.event_manager
                    .add_handler(GuildJoinHandler::new(data.registry.clone()))
                    .await;
                data.init_tasks(ctx).await;

                Ok(data)
            })
        })
        .build();

    let intents = serenity::GatewayIntents::non_privileged();
    let mut client = match serenity::ClientBuilder::new(&config.discord_token, intents)
        .framework(framework)
        .await
    {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to create client: {}", e);
            return;
        }
    };

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Could not listen for shutdown signal");
            return;
        }
        info!("shutting down, stopping running servers");
        registry.shutdown().await;
        task_manager.shutdown().await;
        shard_manager.shutdown_all().await;
    });

    if let Err(e) = client.start().await {
        error!("Client error: {}", e);
    }
}

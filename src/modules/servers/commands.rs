use super::{registry::TenantId, session::SessionState};
use crate::{utils, Context, Error};
use poise::serenity_prelude::{self as serenity, ButtonStyle, CreateActionRow, CreateButton};
use poise::{command, CreateReply};
use std::time::Duration;
use tracing::info;

fn tenant(ctx: &Context<'_>) -> Result<TenantId, Error> {
    ctx.guild_id()
        .map(TenantId::from)
        .ok_or_else(|| "This command only works inside a Discord server".into())
}

async fn autocomplete_server<'a>(
    ctx: Context<'_>,
    partial: &'a str,
) -> impl Iterator<Item = serenity::AutocompleteChoice> {
    let names = match ctx.guild_id() {
        Some(id) => match ctx.data().registry.catalog(id.into()).await {
            Ok(catalog) => catalog.list().await.unwrap_or_default(),
            Err(_) => Vec::new(),
        },
        None => Vec::new(),
    };

    let partial = partial.to_lowercase();
    names
        .into_iter()
        .filter(|name| name.to_lowercase().contains(&partial))
        .map(|name| serenity::AutocompleteChoice::new(name.clone(), name))
        .collect::<Vec<_>>()
        .into_iter()
}

/// Create a new Minecraft server
#[command(slash_command, guild_only)]
pub async fn create(
    ctx: Context<'_>,
    #[description = "Name for the server (letters, digits, - and _)"]
    #[max_length = 32]
    name: String,
    #[description = "Minecraft version (defaults to the latest release)"] version: Option<String>,
) -> Result<(), Error> {
    let tenant = tenant(&ctx)?;
    ctx.defer().await?;

    let catalog = ctx.data().registry.catalog(tenant).await?;
    match catalog.create(&name, version.as_deref()).await {
        Ok(server) => {
            ctx.say(format!(
                "✅ Created **{}** running Minecraft {}!\n> Start it with `/servers start {}`",
                server.name, server.version, server.name
            ))
            .await?;
        }
        Err(e) => {
            ctx.say(format!("❌ {}", e)).await?;
        }
    }

    Ok(())
}

/// List this Discord server's saved Minecraft servers
#[command(slash_command, guild_only)]
pub async fn list(ctx: Context<'_>) -> Result<(), Error> {
    let tenant = tenant(&ctx)?;
    let registry = &ctx.data().registry;

    let names = registry.catalog(tenant).await?.list().await?;
    let status = registry.sessions(tenant).await?.status().await;
    let max = registry.get_or_create(tenant).await?.max_servers().await;

    if names.is_empty() {
        ctx.say("📭 No saved servers yet. Create one with `/servers create`.")
            .await?;
        return Ok(());
    }

    let mut response = format!("📂 **Saved Servers** ({}/{})\n", names.len(), max);
    for name in &names {
        let marker = match &status.server_name {
            Some(active) if active == name => format!(" ({})", status.state),
            _ => String::new(),
        };
        response.push_str(&format!("\n• **{}**{}", name, marker));
    }

    ctx.say(response).await?;
    Ok(())
}

/// Start one of the saved Minecraft servers
#[command(slash_command, guild_only, ephemeral)]
pub async fn start(
    ctx: Context<'_>,
    #[description = "Server to start"]
    #[autocomplete = "autocomplete_server"]
    name: String,
    #[description = "Memory to give the server in GB"]
    #[min = 1]
    memory: Option<u32>,
) -> Result<(), Error> {
    let tenant = tenant(&ctx)?;
    let config = &ctx.data().config;
    let max_memory = config.max_memory_gb;

    let memory = match memory {
        Some(gb) => gb,
        None => ctx
            .data()
            .registry
            .default_memory(tenant)
            .await
            .unwrap_or(config.default_memory_gb),
    };
    if memory > max_memory {
        ctx.say(format!(
            "❌ A server can use at most {} GB of memory.",
            max_memory
        ))
        .await?;
        return Ok(());
    }

    ctx.defer_ephemeral().await?;

    let sessions = ctx.data().registry.sessions(tenant).await?;
    match sessions.start(&name, memory, ctx.author().id.get()).await {
        Ok(started) => {
            ctx.say(format!(
                "✅ **{}** is up at `{}`\n> Secret: ||`{}`||\n> Anyone you give the secret to can stop it with `/servers stop`.",
                started.server_name,
                started.address,
                started.secret.as_str()
            ))
            .await?;

            ctx.channel_id()
                .say(
                    ctx.serenity_context(),
                    format!(
                        "🟢 **{}** is running at `{}` (started by <@{}>)",
                        started.server_name, started.address, started.owner_id
                    ),
                )
                .await?;
        }
        Err(e) => {
            ctx.say(format!("❌ {}", e)).await?;
        }
    }

    Ok(())
}

/// Stop the running Minecraft server
#[command(slash_command, guild_only, ephemeral)]
pub async fn stop(
    ctx: Context<'_>,
    #[description = "Secret from whoever started the server"] secret: Option<String>,
) -> Result<(), Error> {
    let tenant = tenant(&ctx)?;
    ctx.defer_ephemeral().await?;

    let secret = secret.as_deref().map(str::trim);
    let sessions = ctx.data().registry.sessions(tenant).await?;
    match sessions.stop(ctx.author().id.get(), secret).await {
        Ok(name) => {
            ctx.say(format!("✅ Stopped **{}**.", name)).await?;
            ctx.channel_id()
                .say(
                    ctx.serenity_context(),
                    format!("🔴 **{}** was stopped by <@{}>", name, ctx.author().id),
                )
                .await?;
        }
        Err(e) => {
            ctx.say(format!("❌ {}", e)).await?;
        }
    }

    Ok(())
}

/// Show whether a Minecraft server is running
#[command(slash_command, guild_only)]
pub async fn status(ctx: Context<'_>) -> Result<(), Error> {
    let tenant = tenant(&ctx)?;
    let status = ctx.data().registry.sessions(tenant).await?.status().await;

    let name = status.server_name.unwrap_or_default();
    let owner = status.owner_id.unwrap_or_default();
    let since = status.since.map_or_else(String::new, utils::relative_time);

    let msg = match status.state {
        SessionState::Idle => "⚪ No server is running.".to_string(),
        SessionState::Starting => format!(
            "🟡 **{}** is starting (requested by <@{}> {})",
            name, owner, since
        ),
        SessionState::Running => format!(
            "🟢 **{}** is running at `{}`\n> Started by <@{}> {} with {} GB",
            name,
            status.address.unwrap_or_default(),
            owner,
            since,
            status.memory_gb.unwrap_or_default()
        ),
        SessionState::Stopping => format!(
            "🟠 **{}** is stopping. If it stays this way, run `/servers stop` again.",
            name
        ),
    };

    ctx.say(msg).await?;
    Ok(())
}

/// Change a server.properties value
#[command(slash_command, guild_only)]
pub async fn set(
    ctx: Context<'_>,
    #[description = "Server to change"]
    #[autocomplete = "autocomplete_server"]
    name: String,
    #[description = "Property name, e.g. difficulty"] key: String,
    #[description = "New value"] value: String,
) -> Result<(), Error> {
    let tenant = tenant(&ctx)?;
    let catalog = ctx.data().registry.catalog(tenant).await?;

    match catalog.edit_property(&name, &key, &value).await {
        Ok(()) => {
            ctx.say(format!("✅ Set `{}` to `{}` on **{}**.", key, value, name))
                .await?;
        }
        Err(e) => {
            ctx.say(format!("❌ {}", e)).await?;
        }
    }

    Ok(())
}

/// Read a server.properties value
#[command(slash_command, guild_only)]
pub async fn get(
    ctx: Context<'_>,
    #[description = "Server to read"]
    #[autocomplete = "autocomplete_server"]
    name: String,
    #[description = "Property name, e.g. difficulty"] key: String,
) -> Result<(), Error> {
    let tenant = tenant(&ctx)?;
    let catalog = ctx.data().registry.catalog(tenant).await?;

    let msg = match catalog.read_property(&name, &key).await {
        Ok(Some(value)) => format!("⚙️ `{}` on **{}** is `{}`", key, name, value),
        Ok(None) => format!("⚙️ `{}` is not set on **{}**", key, name),
        Err(e) => format!("❌ {}", e),
    };

    ctx.say(msg).await?;
    Ok(())
}

/// Run a console command on the running server
#[command(slash_command, guild_only, ephemeral, rename = "command")]
pub async fn console(
    ctx: Context<'_>,
    #[description = "Console command, e.g. whitelist add Steve"] text: String,
    #[description = "Secret from whoever started the server"] secret: Option<String>,
) -> Result<(), Error> {
    let tenant = tenant(&ctx)?;
    ctx.defer_ephemeral().await?;

    let secret = secret.as_deref().map(str::trim);
    let sessions = ctx.data().registry.sessions(tenant).await?;
    let msg = match sessions
        .command(ctx.author().id.get(), secret, &text)
        .await
    {
        Ok(output) if output.trim().is_empty() => "✅ Sent, the server printed nothing.".to_string(),
        Ok(output) => format!("```\n{}\n```", utils::tail_for_discord(&output)),
        Err(e) => format!("❌ {}", e),
    };

    ctx.say(msg).await?;
    Ok(())
}

/// Permanently delete a saved server
#[command(
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    ephemeral
)]
pub async fn delete(
    ctx: Context<'_>,
    #[description = "Server to delete"]
    #[autocomplete = "autocomplete_server"]
    name: String,
) -> Result<(), Error> {
    let tenant = tenant(&ctx)?;
    let catalog = ctx.data().registry.catalog(tenant).await?;

    if !catalog.exists(&name).await? {
        ctx.say(format!("❌ There is no saved server named `{}`", name))
            .await?;
        return Ok(());
    }

    let button = CreateButton::new("confirm")
        .style(ButtonStyle::Danger)
        .label("Delete Server");

    let reply = CreateReply::default()
        .ephemeral(true)
        .content(format!(
            "🗑️ Are you sure you want to delete **{}**? Its world cannot be recovered.",
            name
        ))
        .components(vec![CreateActionRow::Buttons(vec![button])]);

    let confirm = ctx.send(reply).await?;

    let interaction = confirm
        .message()
        .await?
        .await_component_interaction(ctx.serenity_context())
        .author_id(ctx.author().id)
        .timeout(Duration::from_secs(30))
        .await;

    let Some(interaction) = interaction else {
        let edit = CreateReply::default()
            .content("❌ Operation timed out")
            .components(vec![]);
        confirm.edit(ctx, edit).await?;
        return Ok(());
    };
    interaction.defer(ctx.serenity_context()).await?;

    let content = match catalog.delete(&name).await {
        Ok(()) => format!("✅ Deleted **{}**.", name),
        Err(e) => format!("❌ {}", e),
    };
    confirm
        .edit(ctx, CreateReply::default().content(content).components(vec![]))
        .await?;

    Ok(())
}

/// Show how many servers this Discord server may keep
#[command(slash_command, guild_only)]
pub async fn quota(ctx: Context<'_>) -> Result<(), Error> {
    let tenant = tenant(&ctx)?;
    let registry = &ctx.data().registry;

    let used = registry.catalog(tenant).await?.count().await?;
    let max = registry.get_or_create(tenant).await?.max_servers().await;

    let default = registry.default_max_servers();
    let note = if max == default { " (default)" } else { "" };

    ctx.say(format!("📦 Using {} of {} server slots{}.", used, max, note))
        .await?;
    Ok(())
}

/// Change how many servers this Discord server may keep
#[command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn set_quota(
    ctx: Context<'_>,
    #[description = "Maximum saved servers (leave empty to use the default)"]
    #[min = 1]
    #[max = 100]
    max: Option<u32>,
) -> Result<(), Error> {
    let tenant = tenant(&ctx)?;
    let registry = &ctx.data().registry;

    let effective = registry
        .set_quota(tenant, max.map(|m| m as usize))
        .await?;
    info!(
        "{} set the server quota of guild {} to {}",
        ctx.author().tag(),
        tenant,
        effective
    );

    let msg = match max {
        Some(_) => format!("✅ This Discord server may now keep {} servers.", effective),
        None => format!("✅ Quota reset to the default of {} servers.", effective),
    };
    ctx.say(msg).await?;
    Ok(())
}

/// Change how much memory servers get when started without a size
#[command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn set_memory(
    ctx: Context<'_>,
    #[description = "Memory in GB (leave empty to use the default)"]
    #[min = 1]
    gb: Option<u32>,
) -> Result<(), Error> {
    let tenant = tenant(&ctx)?;
    let config = &ctx.data().config;

    if let Some(gb) = gb.filter(|gb| *gb > config.max_memory_gb) {
        ctx.say(format!(
            "❌ {} GB is above the limit of {} GB.",
            gb, config.max_memory_gb
        ))
        .await?;
        return Ok(());
    }

    ctx.data().registry.set_default_memory(tenant, gb).await?;
    let msg = match gb {
        Some(gb) => format!("✅ Servers now start with {} GB unless told otherwise.", gb),
        None => format!(
            "✅ Servers now start with the default of {} GB.",
            config.default_memory_gb
        ),
    };
    ctx.say(msg).await?;
    Ok(())
}

/// Show the latest Minecraft release
#[command(slash_command, guild_only)]
pub async fn versions(ctx: Context<'_>) -> Result<(), Error> {
    ctx.defer().await?;

    let msg = match ctx.data().registry.engine().resolve_latest_version().await {
        Ok(version) => format!(
            "🧱 The latest Minecraft release is **{}**. New servers use it unless you pick a version.",
            version
        ),
        Err(e) => format!("❌ Could not look up versions: {}", e),
    };

    ctx.say(msg).await?;
    Ok(())
}

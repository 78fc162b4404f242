pub mod catalog;
pub mod commands;
pub mod database;
pub mod error;
pub mod ownership;
pub mod quota;
pub mod registry;
pub mod session;
pub mod task;

use commands::*;
use poise::command;

/// 🧱 Create and run Minecraft servers for this Discord server
#[command(
    slash_command,
    subcommands(
        "create",
        "list",
        "start",
        "stop",
        "status",
        "set",
        "get",
        "console",
        "delete",
        "quota",
        "set_quota",
        "set_memory",
        "versions"
    ),
    guild_only,
    category = "Servers"
)]
pub async fn servers(_ctx: crate::Context<'_>) -> Result<(), crate::Error> {
    Ok(())
}

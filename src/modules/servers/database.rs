use crate::database::Database;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct GuildSettings {
    pub max_servers: Option<usize>,
    /// Memory for `start` when the caller gives none, in GB.
    pub default_memory_gb: Option<u32>,
}

#[derive(Default, Serialize, Deserialize, Clone, Debug)]
pub struct ServersDatabase {
    pub guilds: HashMap<u64, GuildSettings>,
}

impl Database<ServersDatabase> {
    pub async fn get_settings(&self, guild_id: u64) -> GuildSettings {
        self.read(|db| db.guilds.get(&guild_id).cloned().unwrap_or_default())
            .await
    }

    pub async fn set_max_servers(&self, guild_id: u64, max: Option<usize>) -> Result<(), String> {
        self.transaction(|db| {
            db.guilds.entry(guild_id).or_default().max_servers = max;
            Ok(())
        })
        .await
        .map_err(|e| e.to_string())
    }

    pub async fn set_default_memory(&self, guild_id: u64, gb: Option<u32>) -> Result<(), String> {
        self.transaction(|db| {
            db.guilds.entry(guild_id).or_default().default_memory_gb = gb;
            Ok(())
        })
        .await
        .map_err(|e| e.to_string())
    }
}

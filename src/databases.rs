use crate::config::Config;
use crate::database::{Database, DbError};
use crate::modules::servers::database::ServersDatabase;

pub struct Databases {
    pub servers: Database<ServersDatabase>,
}

impl Databases {
    pub async fn open(config: &Config) -> Result<Self, DbError> {
        Ok(Self {
            servers: Database::new(config.settings_db.clone()).await?,
        })
    }
}

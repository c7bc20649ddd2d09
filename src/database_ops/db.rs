use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::util::env::{env_flag, env_parse};

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options =
            PgConnectOptions::from_str(database_url).context("invalid database url")?;

        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .context("connecting to postgres")?;
        info!(max_connections, "connected to db");

        // Off by default: the schema is usually owned by the web application.
        if env_flag("AUTO_MIGRATE", false) {
            info!("running migrations (AUTO_MIGRATE=on)");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("running migrations")?;
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(Self { pool })
    }

    /// Connect using `DB_MAX_CONNECTIONS` (default 5).
    pub async fn connect_from_url(database_url: &str) -> Result<Self> {
        Self::connect(database_url, env_parse("DB_MAX_CONNECTIONS", 5u32)).await
    }
}

//! Server configuration

use std::env;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// Absent means in-memory stores
    pub database_url: Option<String>,
    /// JSON catalog seed used when running without a database
    pub plan_catalog_file: Option<String>,
    pub allowed_origins: Vec<String>,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            database_url: None,
            plan_catalog_file: None,
            allowed_origins: Vec::new(),
            log_json: false,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_address =
            optional("BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
        bind_address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid BIND_ADDRESS {}: {}", bind_address, e))?;

        Ok(Self {
            bind_address,
            database_url: optional("DATABASE_URL"),
            plan_catalog_file: optional("PLAN_CATALOG_FILE"),
            allowed_origins: optional("ALLOWED_ORIGINS")
                .map(|raw| parse_origins(&raw))
                .unwrap_or_default(),
            log_json: optional("LOG_FORMAT")
                .map(|f| f.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|o| o.trim().trim_end_matches('/'))
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}

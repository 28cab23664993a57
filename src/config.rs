use std::env;

pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_REPLAY_WINDOW_SECS: i64 = 180;
pub const DEFAULT_MEMORY_API_URL: &str = "https://api.getzep.com/api/v2";
pub const DEFAULT_SYNC_QUEUE: usize = 256;
pub const DEFAULT_MEMORY_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub dev_mode: bool,
    pub database_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub replay_window_secs: i64,
    pub memory_api_url: String,
    pub memory_api_key: Option<String>,
    pub sync_queue_capacity: usize,
    pub memory_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let dev_mode = env::var("APP_ENV")
            .map(|v| v.trim().eq_ignore_ascii_case("development"))
            .unwrap_or(false);
        let replay_window_secs = env::var("WEBHOOK_REPLAY_WINDOW_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_REPLAY_WINDOW_SECS);
        let sync_queue_capacity = env::var("MEMORY_SYNC_QUEUE")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_SYNC_QUEUE);
        let memory_timeout_secs = env::var("MEMORY_SYNC_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MEMORY_TIMEOUT_SECS);
        let memory_api_url = non_empty_var("ZEP_API_URL")
            .unwrap_or_else(|| DEFAULT_MEMORY_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Self {
            port,
            dev_mode,
            database_url: resolve_database_url(),
            webhook_secret: non_empty_var("HUME_WEBHOOK_SECRET")
                .or_else(|| non_empty_var("HUME_API_KEY")),
            replay_window_secs,
            memory_api_url,
            memory_api_key: non_empty_var("ZEP_API_KEY"),
            sync_queue_capacity,
            memory_timeout_secs,
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `DATABASE_URL` wins; otherwise a URL is assembled from the usual
/// `POSTGRES_*` / `PG*` variables, but only when a host is actually given.
fn resolve_database_url() -> Option<String> {
    if let Some(url) = non_empty_var("DATABASE_URL") {
        return Some(url);
    }
    let host = non_empty_var("POSTGRES_HOST").or_else(|| non_empty_var("PGHOST"))?;
    let port = non_empty_var("POSTGRES_PORT")
        .or_else(|| non_empty_var("PGPORT"))
        .unwrap_or_else(|| "5432".to_string());
    let user = non_empty_var("POSTGRES_USER")
        .or_else(|| non_empty_var("PGUSER"))
        .unwrap_or_else(|| "postgres".to_string());
    let password = non_empty_var("POSTGRES_PASSWORD")
        .or_else(|| non_empty_var("PGPASSWORD"))
        .unwrap_or_default();
    let db = non_empty_var("POSTGRES_DB")
        .or_else(|| non_empty_var("PGDATABASE"))
        .unwrap_or_else(|| "voice_fact_sync".to_string());
    Some(format!("postgres://{user}:{password}@{host}:{port}/{db}"))
}

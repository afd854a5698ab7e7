use std::path::PathBuf;
use std::time::Duration;

use mjf_adapters::{ManfredEndpoints, DEFAULT_DETAIL_PATTERN, DEFAULT_LANDING_URL, DEFAULT_LIST_URL};
use mjf_storage::{BackoffPolicy, HttpClientConfig};

pub const DEFAULT_OFFER_URL_PATTERN: &str = "https://www.getmanfred.com/es/job-offers/{offer_id}/{offer_slug}";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    pub reset_db: bool,
    pub fetch_interval: Duration,
    pub scheduler_enabled: bool,
    pub max_retries: usize,
    pub retry_backoff: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub list_url: String,
    pub detail_pattern: String,
    pub landing_url: String,
    pub offer_url_pattern: String,
    pub discord_webhook_url: Option<String>,
    pub build_id_seed: Option<String>,
    pub detail_concurrency: usize,
    pub notify_batch_size: u32,
    pub notify_delay: Duration,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup; unset or unparsable keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let optional = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(default)
        };

        Self {
            db_path: PathBuf::from(string("DB_PATH", "./data/history.db")),
            reset_db: flag("RESET_DB", false),
            fetch_interval: Duration::from_secs(
                lookup("FETCH_INTERVAL")
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .filter(|secs| *secs > 0)
                    .unwrap_or(3600),
            ),
            scheduler_enabled: flag("SCHEDULER_ENABLED", true),
            max_retries: lookup("MAX_RETRIES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(3),
            retry_backoff: lookup("RETRY_BACKOFF")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .unwrap_or(Duration::from_millis(500)),
            http_timeout_secs: lookup("HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(15),
            user_agent: string("MJF_USER_AGENT", "manfred-job-fetcher/0.1"),
            list_url: string("EXTERNAL_ENDPOINT_URL", DEFAULT_LIST_URL),
            detail_pattern: string("DETAIL_ENDPOINT_PATTERN", DEFAULT_DETAIL_PATTERN),
            landing_url: string("LANDING_PAGE_URL", DEFAULT_LANDING_URL),
            offer_url_pattern: string("OFFER_URL_PATTERN", DEFAULT_OFFER_URL_PATTERN),
            discord_webhook_url: optional("DISCORD_WEBHOOK_URL"),
            build_id_seed: optional("BUILD_ID_HASH"),
            detail_concurrency: lookup("DETAIL_CONCURRENCY")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(4)
                .max(1),
            notify_batch_size: lookup("NOTIFY_BATCH_SIZE")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(25),
            notify_delay: Duration::from_millis(
                lookup("NOTIFY_DELAY_MS")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(1000),
            ),
            web_port: lookup("MJF_WEB_PORT")
                .or_else(|| lookup("PORT"))
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn endpoints(&self) -> ManfredEndpoints {
        ManfredEndpoints {
            list_url: self.list_url.clone(),
            detail_pattern: self.detail_pattern.clone(),
            landing_url: self.landing_url.clone(),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.detail_concurrency + 2,
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                base_delay: self.retry_backoff,
                ..BackoffPolicy::default()
            },
        }
    }
}

pub fn render_offer_url(pattern: &str, offer_id: &str, slug: &str) -> String {
    pattern.replace("{offer_id}", offer_id).replace("{offer_slug}", slug)
}

//! Build-token cache with a single-flight refresh from the upstream landing page.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use chrono::Utc;
use mjf_core::{BuildToken, EndpointKind, FetchOutcome};
use mjf_storage::{HttpFetcher, Store, StorageError};
use regex::Regex;
use scraper::{Html, Selector};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{audit_fetch, Audit};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error("build token pattern not found on {url}")]
    PatternNotFound { url: String },
    #[error("landing page fetch failed: {reason}")]
    Network { reason: String },
    #[error("could not persist build token: {reason}")]
    Storage { reason: String },
}

/// Find the build token in a landing page.
///
/// Tries the `buildId` of the `__NEXT_DATA__` document first, then the raw `"buildId":"…"`
/// text, then the `/_next/static/<token>/_buildManifest.js` asset path.
pub fn extract_build_token(html: &str) -> Option<String> {
    static BUILD_ID: OnceLock<Option<Regex>> = OnceLock::new();
    static MANIFEST: OnceLock<Option<Regex>> = OnceLock::new();

    if let Some(token) = next_data_build_id(html) {
        return Some(token);
    }

    let build_id = BUILD_ID.get_or_init(|| Regex::new(r#""buildId"\s*:\s*"([^"]+)""#).ok());
    let manifest = MANIFEST.get_or_init(|| Regex::new(r"/_next/static/([A-Za-z0-9_-]+)/_buildManifest\.js").ok());

    [build_id, manifest]
        .into_iter()
        .flatten()
        .find_map(|re| re.captures(html))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|token| !token.is_empty())
}

fn next_data_build_id(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("script#__NEXT_DATA__").ok()?;
    let text: String = document.select(&selector).next()?.text().collect();
    let data: serde_json::Value = serde_json::from_str(&text).ok()?;
    data.get("buildId")?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

#[derive(Debug, Default)]
struct RefreshSlot {
    epoch: u64,
    last: Option<Result<BuildToken, RefreshError>>,
}

/// Owns the current build token.
///
/// Reads never touch the network. Refreshes are serialized behind one lock; a caller that
/// queued behind a refresh which completed meanwhile receives that refresh's result instead
/// of issuing its own request.
#[derive(Debug)]
pub struct TokenRefresher {
    http: Arc<HttpFetcher>,
    store: Store,
    landing_url: String,
    current: RwLock<BuildToken>,
    epoch: AtomicU64,
    slot: Mutex<RefreshSlot>,
}

impl TokenRefresher {
    /// Build a refresher primed with the token persisted in `store`.
    pub async fn load(
        http: Arc<HttpFetcher>,
        store: Store,
        landing_url: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let token = store.load_token().await?;
        Ok(Self {
            http,
            store,
            landing_url: landing_url.into(),
            current: RwLock::new(token),
            epoch: AtomicU64::new(0),
            slot: Mutex::new(RefreshSlot::default()),
        })
    }

    pub fn current(&self) -> BuildToken {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Completed network refreshes so far.
    pub fn refresh_count(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Force a refresh, sharing the result with any refresh that finished while waiting.
    pub async fn refresh(&self) -> Result<BuildToken, RefreshError> {
        self.refresh_inner(None).await
    }

    /// Refresh because `stale` was rejected upstream.
    ///
    /// If the cached token already moved past `stale` it is returned without a network call.
    pub async fn refresh_stale(&self, stale: &str) -> Result<BuildToken, RefreshError> {
        self.refresh_inner(Some(stale)).await
    }

    async fn refresh_inner(&self, stale: Option<&str>) -> Result<BuildToken, RefreshError> {
        if let Some(stale) = stale {
            let current = self.current();
            if !current.is_empty() && current.value != stale {
                return Ok(current);
            }
        }

        let observed = self.epoch.load(Ordering::Acquire);
        let mut slot = self.slot.lock().await;

        if slot.epoch != observed {
            if let Some(last) = &slot.last {
                return last.clone();
            }
        }
        if let Some(stale) = stale {
            let current = self.current();
            if !current.is_empty() && current.value != stale {
                return Ok(current);
            }
        }

        let result = self.fetch_and_commit().await;
        slot.epoch += 1;
        slot.last = Some(result.clone());
        self.epoch.store(slot.epoch, Ordering::Release);
        result
    }

    async fn fetch_and_commit(&self) -> Result<BuildToken, RefreshError> {
        let url = self.landing_url.as_str();
        let page = match self.http.get(EndpointKind::Landing.as_str(), url).await {
            Ok(page) => page,
            Err(err) => {
                audit_fetch(&self.store, EndpointKind::Landing, url, Audit::failure(&err)).await;
                warn!(url, error = %err, "landing page fetch failed; keeping prior build token");
                return Err(RefreshError::Network {
                    reason: err.to_string(),
                });
            }
        };

        let html = String::from_utf8_lossy(&page.body);
        let Some(value) = extract_build_token(&html) else {
            let audit = Audit::success(&page).with_outcome(FetchOutcome::Success, "build token pattern not found");
            audit_fetch(&self.store, EndpointKind::Landing, url, audit).await;
            warn!(url, "build token pattern not found; keeping prior build token");
            return Err(RefreshError::PatternNotFound { url: url.to_string() });
        };
        audit_fetch(&self.store, EndpointKind::Landing, url, Audit::success(&page)).await;

        let token = BuildToken::new(value, Utc::now());
        self.store
            .save_token(&token)
            .await
            .map_err(|err| RefreshError::Storage {
                reason: err.to_string(),
            })?;

        let previous = {
            let mut current = self
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *current, token.clone())
        };
        info!(previous = %previous.value, current = %token.value, "build token refreshed");
        Ok(token)
    }
}

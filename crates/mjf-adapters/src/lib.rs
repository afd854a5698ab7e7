//! Manfred upstream adapter: list and detail fetches plus build-token self-healing.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mjf_core::{EndpointKind, FetchLogEntry, FetchOutcome, OfferDetail, OfferSummary};
use mjf_storage::{FetchError, FetchedResponse, HttpFetcher, Store};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod parse;
pub mod token;

pub use parse::{detail_offer, parse_offer_detail, parse_offer_list};
pub use token::{extract_build_token, RefreshError, TokenRefresher};

pub const CRATE_NAME: &str = "mjf-adapters";

pub const DEFAULT_LIST_URL: &str = "https://www.getmanfred.com/api/v2/public/offers?lang=ES&onlyActive=true";
pub const DEFAULT_DETAIL_PATTERN: &str =
    "https://www.getmanfred.com/_next/data/{build_id}/es/job-offers/{offer_id}/{offer_slug}.json";
pub const DEFAULT_LANDING_URL: &str = "https://www.getmanfred.com/es/job-offers";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected payload from {url}: {reason}")]
    Shape { url: String, reason: String },
    #[error("offer {offer_id} still stale after a build token refresh")]
    StaleAfterRefresh { offer_id: String },
    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

/// Source of offers consumed by the cycle pipeline.
#[async_trait]
pub trait OfferSource: Send + Sync {
    /// The complete set of currently active offers.
    async fn list_offers(&self) -> Result<Vec<OfferSummary>, UpstreamError>;

    /// Skills and languages of one offer.
    async fn fetch_detail(&self, offer_id: &str, slug: &str) -> Result<OfferDetail, UpstreamError>;

    /// Force a build token refresh.
    async fn refresh_token(&self) -> Result<mjf_core::BuildToken, UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct ManfredEndpoints {
    pub list_url: String,
    pub detail_pattern: String,
    pub landing_url: String,
}

impl Default for ManfredEndpoints {
    fn default() -> Self {
        Self {
            list_url: DEFAULT_LIST_URL.to_string(),
            detail_pattern: DEFAULT_DETAIL_PATTERN.to_string(),
            landing_url: DEFAULT_LANDING_URL.to_string(),
        }
    }
}

impl ManfredEndpoints {
    pub fn detail_url(&self, build_id: &str, offer_id: &str, slug: &str) -> String {
        self.detail_pattern
            .replace("{build_id}", build_id)
            .replace("{offer_id}", offer_id)
            .replace("{offer_slug}", slug)
    }
}

enum DetailAttempt {
    Found(OfferDetail),
    Stale(String),
}

pub struct ManfredClient {
    http: Arc<HttpFetcher>,
    store: Store,
    endpoints: ManfredEndpoints,
    tokens: Arc<TokenRefresher>,
}

impl ManfredClient {
    pub fn new(
        http: Arc<HttpFetcher>,
        store: Store,
        endpoints: ManfredEndpoints,
        tokens: Arc<TokenRefresher>,
    ) -> Self {
        Self {
            http,
            store,
            endpoints,
            tokens,
        }
    }

    /// Wire up a client and its refresher from a shared fetcher and store.
    pub async fn connect(
        http: Arc<HttpFetcher>,
        store: Store,
        endpoints: ManfredEndpoints,
    ) -> Result<Self, mjf_storage::StorageError> {
        let tokens = TokenRefresher::load(http.clone(), store.clone(), endpoints.landing_url.clone()).await?;
        Ok(Self::new(http, store, endpoints, Arc::new(tokens)))
    }

    pub fn tokens(&self) -> &Arc<TokenRefresher> {
        &self.tokens
    }

    async fn try_detail(&self, token: &str, offer_id: &str, slug: &str) -> Result<DetailAttempt, UpstreamError> {
        let url = self.endpoints.detail_url(token, offer_id, slug);
        debug!(offer_id, url = %url, "fetching offer detail");

        match self.http.get(EndpointKind::Detail.as_str(), &url).await {
            Ok(resp) => {
                let audit = Audit::success(&resp);
                match detail_offer(&resp.body) {
                    Some(offer) => {
                        audit_fetch(&self.store, EndpointKind::Detail, &url, audit).await;
                        Ok(DetailAttempt::Found(parse_offer_detail(&offer)))
                    }
                    None => {
                        let reason = "response has no pageProps.offer object";
                        let audit = audit.with_outcome(FetchOutcome::TokenStale, reason);
                        audit_fetch(&self.store, EndpointKind::Detail, &url, audit).await;
                        Ok(DetailAttempt::Stale(reason.to_string()))
                    }
                }
            }
            Err(err) if err.status() == Some(404) => {
                audit_fetch(&self.store, EndpointKind::Detail, &url, Audit::failure(&err)).await;
                Ok(DetailAttempt::Stale(err.to_string()))
            }
            Err(err) => {
                audit_fetch(&self.store, EndpointKind::Detail, &url, Audit::failure(&err)).await;
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl OfferSource for ManfredClient {
    async fn list_offers(&self) -> Result<Vec<OfferSummary>, UpstreamError> {
        let url = self.endpoints.list_url.as_str();
        let resp = match self.http.get(EndpointKind::List.as_str(), url).await {
            Ok(resp) => resp,
            Err(err) => {
                audit_fetch(&self.store, EndpointKind::List, url, Audit::failure(&err)).await;
                return Err(err.into());
            }
        };
        audit_fetch(&self.store, EndpointKind::List, url, Audit::success(&resp)).await;

        let offers = parse_offer_list(&resp.body).map_err(|reason| UpstreamError::Shape {
            url: url.to_string(),
            reason,
        })?;
        info!(count = offers.len(), "fetched active offers list");
        Ok(offers)
    }

    /// Fetch one offer's detail, healing a stale build token at most once.
    ///
    /// A 404 or a payload without `pageProps.offer` means the token is stale. The first stale
    /// signal triggers a refresh and, if it produced a different token, one more request. An
    /// empty token is refreshed up front and that refresh is the call's only one.
    async fn fetch_detail(&self, offer_id: &str, slug: &str) -> Result<OfferDetail, UpstreamError> {
        let mut token = self.tokens.current();
        let mut refreshed = false;

        if token.is_empty() {
            info!(offer_id, "no build token yet; refreshing before first detail fetch");
            token = self.tokens.refresh_stale(&token.value).await?;
            refreshed = true;
        }

        loop {
            match self.try_detail(&token.value, offer_id, slug).await? {
                DetailAttempt::Found(detail) => return Ok(detail),
                DetailAttempt::Stale(reason) if refreshed => {
                    warn!(offer_id, reason = %reason, "detail still stale after token refresh");
                    return Err(UpstreamError::StaleAfterRefresh {
                        offer_id: offer_id.to_string(),
                    });
                }
                DetailAttempt::Stale(reason) => {
                    info!(offer_id, token = %token.value, reason = %reason, "stale build token signal");
                    refreshed = true;
                    let next = self.tokens.refresh_stale(&token.value).await?;
                    if next.value == token.value {
                        warn!(offer_id, "refresh returned the same build token");
                        return Err(UpstreamError::StaleAfterRefresh {
                            offer_id: offer_id.to_string(),
                        });
                    }
                    token = next;
                }
            }
        }
    }

    async fn refresh_token(&self) -> Result<mjf_core::BuildToken, UpstreamError> {
        Ok(self.tokens.refresh().await?)
    }
}

/// What one upstream request ended as, for the fetch log.
#[derive(Debug, Clone)]
pub(crate) struct Audit {
    attempts: u32,
    outcome: FetchOutcome,
    status_code: Option<u16>,
    error: Option<String>,
}

impl Audit {
    pub(crate) fn success(resp: &FetchedResponse) -> Self {
        Self {
            attempts: resp.attempts,
            outcome: FetchOutcome::Success,
            status_code: Some(resp.status.as_u16()),
            error: None,
        }
    }

    pub(crate) fn with_outcome(mut self, outcome: FetchOutcome, note: &str) -> Self {
        self.outcome = outcome;
        self.error = Some(note.to_string());
        self
    }

    pub(crate) fn failure(err: &FetchError) -> Self {
        let outcome = if err.status() == Some(404) {
            FetchOutcome::TokenStale
        } else if err.is_exhausted() {
            FetchOutcome::Exhausted
        } else {
            FetchOutcome::HttpError
        };
        Self {
            attempts: err.attempts(),
            outcome,
            status_code: err.status(),
            error: Some(err.to_string()),
        }
    }
}

/// Append a fetch-log row. Audit failures are logged and never fail the fetch itself.
pub(crate) async fn audit_fetch(store: &Store, kind: EndpointKind, target: &str, audit: Audit) {
    let entry = FetchLogEntry {
        timestamp: Utc::now(),
        endpoint_kind: kind,
        target: target.to_string(),
        outcome: audit.outcome,
        attempts: audit.attempts,
        status_code: audit.status_code,
        error: audit.error,
    };

    if let Err(err) = store.record_fetch(&entry).await {
        warn!(fetch_target = %target, error = %err, "failed to append fetch log entry");
    }
}

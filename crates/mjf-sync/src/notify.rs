//! Outbound offer announcements.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use mjf_core::{Offer, OfferDetail, Skill, SkillCategory};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

const EMBED_COLOR: u32 = 5_814_783;
const FIELD_LIMIT: usize = 1020;

/// Everything needed to announce one offer.
#[derive(Debug, Clone, Serialize)]
pub struct OfferMessage {
    pub offer: Offer,
    pub detail: OfferDetail,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("webhook answered {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &OfferMessage) -> Result<Delivery, NotifyError>;

    /// Remove a previously delivered message.
    async fn retract(&self, message_id: &str) -> Result<(), NotifyError>;
}

/// Discord webhook delivery. Sends with `wait=true` so the created message id comes back.
#[derive(Debug, Clone)]
pub struct DiscordWebhookNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl DiscordWebhookNotifier {
    pub fn new(webhook_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn execute_url(&self) -> String {
        let sep = if self.webhook_url.contains('?') { '&' } else { '?' };
        format!("{}{sep}wait=true", self.webhook_url)
    }

    fn message_url(&self, message_id: &str) -> String {
        let base = self.webhook_url.split('?').next().unwrap_or(&self.webhook_url);
        format!("{base}/messages/{message_id}")
    }
}

async fn rejected(resp: reqwest::Response) -> NotifyError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    NotifyError::Rejected {
        status,
        body: body.chars().take(200).collect(),
    }
}

#[async_trait]
impl Notifier for DiscordWebhookNotifier {
    async fn send(&self, message: &OfferMessage) -> Result<Delivery, NotifyError> {
        let payload = json!({ "content": "", "embeds": [render_embed(message)] });
        let resp = self.client.post(self.execute_url()).json(&payload).send().await?;
        if !resp.status().is_success() {
            return Err(rejected(resp).await);
        }

        let message_id = resp
            .json::<JsonValue>()
            .await
            .ok()
            .and_then(|body| body.get("id").and_then(JsonValue::as_str).map(ToString::to_string));
        debug!(offer_id = %message.offer.offer_id, ?message_id, "webhook message created");
        Ok(Delivery { message_id })
    }

    async fn retract(&self, message_id: &str) -> Result<(), NotifyError> {
        let resp = self.client.delete(self.message_url(message_id)).send().await?;
        // An already-deleted message is as good as a retracted one.
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(rejected(resp).await)
        }
    }
}

/// `55000` → `55.000`
fn thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push('.');
        }
        out.push(ch);
    }
    if value < 0 {
        out.insert(0, '-');
    }
    out
}

fn salary_text(from: Option<i64>, to: Option<i64>) -> Option<String> {
    match (from.filter(|v| *v > 0), to.filter(|v| *v > 0)) {
        (Some(from), Some(to)) => Some(format!("{}€ - {}€", thousands(from), thousands(to))),
        (Some(from), None) => Some(format!("From {}€", thousands(from))),
        (None, Some(to)) => Some(format!("Up to {}€", thousands(to))),
        (None, None) => None,
    }
}

fn skills_field(skills: &[&Skill]) -> Option<String> {
    let text = skills
        .iter()
        .map(|skill| match skill.level.filter(|l| *l > 0) {
            Some(level) => format!("• {} ({})", skill.name, "★".repeat(level.min(10) as usize)),
            None => format!("• {}", skill.name),
        })
        .collect::<Vec<_>>()
        .join("\n");

    if text.is_empty() {
        None
    } else if text.chars().count() > FIELD_LIMIT {
        Some(format!("{}...", text.chars().take(FIELD_LIMIT).collect::<String>()))
    } else {
        Some(text)
    }
}

/// Build the Discord embed for an offer.
pub fn render_embed(message: &OfferMessage) -> JsonValue {
    let offer = &message.offer;
    let mut fields = Vec::new();

    let mut info = Vec::new();
    if let Some(salary) = salary_text(offer.salary_from, offer.salary_to) {
        info.push(format!("💰 **Salary:** {salary}"));
    }
    if let Some(remote) = offer.remote_percentage {
        info.push(format!("🏠 **Remote:** {remote}% Remote"));
    }
    if let Some(location) = offer.location.as_deref().filter(|l| !l.is_empty()) {
        info.push(format!("📍 **Location:** {location}"));
    }
    if !info.is_empty() {
        fields.push(json!({ "name": "\u{200b}", "value": info.join("\n"), "inline": false }));
    }

    for (category, title) in [
        (SkillCategory::Must, "🔒 Must Have Skills"),
        (SkillCategory::Nice, "✨ Nice to Have Skills"),
        (SkillCategory::Extra, "📚 Extra Skills"),
    ] {
        let skills: Vec<&Skill> = message.detail.skills_in(category).collect();
        if let Some(value) = skills_field(&skills) {
            fields.push(json!({ "name": title, "value": value, "inline": false }));
        }
    }

    let mut embed = json!({
        "title": format!("{} @ {}", offer.title, offer.company),
        "url": message.url,
        "color": EMBED_COLOR,
        "timestamp": Utc::now().to_rfc3339(),
        "footer": { "text": "Via Manfred Job Fetcher" },
        "fields": fields,
    });
    if let Some(logo) = &offer.company_logo_url {
        embed["thumbnail"] = json!({ "url": logo });
    }
    embed
}

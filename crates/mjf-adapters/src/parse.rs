//! Mapping of the upstream list and detail JSON payloads onto domain types.

use mjf_core::{Language, OfferDetail, OfferSummary, Skill, SkillCategory};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

const UNKNOWN_POSITION: &str = "Unknown Position";
const UNKNOWN_COMPANY: &str = "Unknown Company";

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let node = json_at(value, path)?;
    node.as_i64().or_else(|| node.as_f64().map(|f| f.round() as i64))
}

/// Strings and numbers both render as text; anything else is absent.
fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse the active-offers list. The payload must be a JSON array; entries without an id
/// are skipped.
pub fn parse_offer_list(body: &[u8]) -> Result<Vec<OfferSummary>, String> {
    let value: JsonValue = serde_json::from_slice(body).map_err(|err| format!("invalid json: {err}"))?;
    let items = match value {
        JsonValue::Array(items) => items,
        other => return Err(format!("expected a json array, got {}", json_kind(&other))),
    };

    let mut offers = Vec::with_capacity(items.len());
    for item in items {
        let Some(offer_id) = json_text(&item, &["id"]) else {
            warn!("skipping list entry without id");
            continue;
        };

        let locations: Vec<&str> = item
            .get("locations")
            .and_then(JsonValue::as_array)
            .map(|arr| arr.iter().filter_map(JsonValue::as_str).collect())
            .unwrap_or_default();

        offers.push(OfferSummary {
            slug: json_str(&item, &["slug"])
                .and_then(text_or_none)
                .unwrap_or_else(|| format!("job-{offer_id}")),
            title: json_str(&item, &["position"])
                .and_then(text_or_none)
                .unwrap_or_else(|| UNKNOWN_POSITION.to_string()),
            company: json_str(&item, &["company", "name"])
                .and_then(text_or_none)
                .unwrap_or_else(|| UNKNOWN_COMPANY.to_string()),
            company_logo_url: json_str(&item, &["company", "logoDark", "url"]).and_then(text_or_none),
            salary_from: json_i64(&item, &["salaryFrom"]),
            salary_to: json_i64(&item, &["salaryTo"]),
            remote_percentage: json_i64(&item, &["remotePercentage"]),
            location: text_or_none(&locations.join(", ")),
            offer_id,
            raw: item,
        });
    }

    Ok(offers)
}

/// The `pageProps.offer` object of a detail payload, if the payload has that shape.
pub fn detail_offer(body: &[u8]) -> Option<JsonValue> {
    let mut value: JsonValue = serde_json::from_slice(body).ok()?;
    let offer = value.get_mut("pageProps")?.get_mut("offer")?.take();
    offer.is_object().then_some(offer)
}

/// Extract skills and language requirements from a detail `offer` object.
///
/// An offer without a skills section yields an empty detail.
pub fn parse_offer_detail(offer: &JsonValue) -> OfferDetail {
    let section = offer
        .get("skillsSectionData")
        .filter(|v| v.is_object())
        .or_else(|| json_at(offer, &["content", "skills"]).filter(|v| v.is_object()));

    let Some(section) = section else {
        debug!("detail payload has no skills section");
        return OfferDetail::default();
    };

    let skills_data = section.get("skills").or_else(|| {
        SkillCategory::ALL
            .iter()
            .any(|c| section.get(c.as_str()).is_some())
            .then_some(section)
    });

    let mut detail = OfferDetail::default();

    if let Some(data) = skills_data {
        for category in SkillCategory::ALL {
            let Some(entries) = data.get(category.as_str()).and_then(JsonValue::as_array) else {
                continue;
            };
            for entry in entries {
                let Some(name) = json_str(entry, &["skill"]).and_then(text_or_none) else {
                    debug!(%category, "dropping skill without a name");
                    continue;
                };
                detail.skills.push(Skill {
                    category,
                    name,
                    level: json_i64(entry, &["level"]),
                    icon: json_str(entry, &["icon"]).and_then(text_or_none),
                    description: json_str(entry, &["desc"]).and_then(text_or_none),
                });
            }
        }
    }

    let languages = section
        .get("minLanguages")
        .or_else(|| section.get("languages"))
        .and_then(JsonValue::as_array);
    if let Some(languages) = languages {
        detail.languages = languages
            .iter()
            .filter_map(|entry| {
                Some(Language {
                    name: json_str(entry, &["name"]).and_then(text_or_none)?,
                    level: json_text(entry, &["level"]),
                })
            })
            .collect();
    }

    detail
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

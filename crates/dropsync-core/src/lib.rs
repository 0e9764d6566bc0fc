//! Core domain model for dropsync: deals, users and per-user notifications.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "dropsync-core";

/// A single giveaway record as published by the upstream feed.
///
/// Only the fields the sync job reasons about are typed; everything else the
/// feed sends is carried in `extra` so the stored body stays the raw object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    #[serde(deserialize_with = "deserialize_deal_id")]
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_display_text")]
    pub title: String,
    #[serde(default, deserialize_with = "deserialize_display_text")]
    pub worth: String,
    #[serde(default, deserialize_with = "deserialize_display_text")]
    pub platforms: String,
    #[serde(rename = "type", default, deserialize_with = "deserialize_display_text")]
    pub giveaway_type: String,
    #[serde(default, deserialize_with = "deserialize_display_text")]
    pub status: String,
    #[serde(default, deserialize_with = "deserialize_display_text")]
    pub end_date: String,
    #[serde(
        default,
        deserialize_with = "deserialize_optional_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub open_giveaway_url: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_optional_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub gamerpower_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Deal {
    /// Minimal deal with only an id and platform list, mostly useful for fixtures.
    pub fn new(id: impl Into<String>, title: impl Into<String>, platforms: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            worth: String::new(),
            platforms: platforms.into(),
            giveaway_type: String::new(),
            status: String::new(),
            end_date: String::new(),
            open_giveaway_url: None,
            gamerpower_url: None,
            extra: Map::new(),
        }
    }

    /// Platform tags split on `,`, trimmed and lower-cased. Empty tokens are dropped.
    pub fn platform_tags(&self) -> impl Iterator<Item = String> + '_ {
        self.platforms
            .split(',')
            .map(normalize_platform)
            .filter(|tag| !tag.is_empty())
    }

    /// True when at least one of the deal's tags is in `platforms`.
    ///
    /// `platforms` is expected to already be normalized with [`normalize_platform`].
    pub fn targets_any(&self, platforms: &BTreeSet<String>) -> bool {
        self.platform_tags().any(|tag| platforms.contains(&tag))
    }
}

pub fn normalize_platform(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn deserialize_deal_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::Number(n) => Ok(number_text(&n)),
        JsonValue::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        JsonValue::String(_) => Err(serde::de::Error::custom("deal id must not be empty")),
        other => Err(serde::de::Error::custom(format!(
            "deal id must be a number or string, got {other}"
        ))),
    }
}

/// Integral floats print without a fraction, so `3141.0` and `3141` share an id.
fn number_text(n: &serde_json::Number) -> String {
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => (f as i64).to_string(),
        _ => n.to_string(),
    }
}

/// Display fields are loosely typed upstream: `null` reads as empty, scalars as their text.
fn deserialize_display_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_optional_text(deserializer)?.unwrap_or_default())
}

fn deserialize_optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s),
        JsonValue::Number(n) => Some(number_text(&n)),
        other => Some(other.to_string()),
    })
}

/// Directory entry for a person who may receive deal notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub notifications_enabled: bool,
    #[serde(default)]
    pub preferred_game_platforms: Vec<String>,
    #[serde(default)]
    pub notification_tokens: Vec<String>,
}

impl User {
    pub fn normalized_platforms(&self) -> BTreeSet<String> {
        self.preferred_game_platforms
            .iter()
            .map(|p| normalize_platform(p))
            .filter(|p| !p.is_empty())
            .collect()
    }

    /// Opted in and has at least one platform to match against.
    pub fn wants_deal_notifications(&self) -> bool {
        self.notifications_enabled && !self.normalized_platforms().is_empty()
    }
}

/// Per-user copy of a matched deal, keyed by the deal id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(flatten)]
    pub deal: Deal,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl Notification {
    pub fn unread(deal: Deal, received_at: DateTime<Utc>) -> Self {
        Self {
            deal,
            received_at,
            read: false,
        }
    }

    pub fn deal_id(&self) -> &str {
        &self.deal.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn numeric_feed_ids_become_strings_and_extra_fields_survive() {
        let deal: Deal = serde_json::from_value(serde_json::json!({
            "id": 2931,
            "title": "Free Game (Epic Games) Giveaway",
            "worth": "$19.99",
            "platforms": "PC, Epic Games Store",
            "type": "Game",
            "status": "Active",
            "end_date": "N/A",
            "thumbnail": "https://example.test/t.jpg",
            "users": 1200
        }))
        .expect("deal");

        assert_eq!(deal.id, "2931");
        assert_eq!(deal.giveaway_type, "Game");
        assert_eq!(deal.extra.get("users"), Some(&serde_json::json!(1200)));
        assert_eq!(
            deal.extra.get("thumbnail").and_then(|v| v.as_str()),
            Some("https://example.test/t.jpg")
        );
    }

    #[test]
    fn loosely_typed_display_fields_still_decode() {
        let deal: Deal = serde_json::from_value(serde_json::json!({
            "id": 3141.0,
            "title": null,
            "worth": 0,
            "platforms": "pc",
            "type": "Game",
            "end_date": null,
            "open_giveaway_url": null,
            "gamerpower_url": 42
        }))
        .expect("deal");

        assert_eq!(deal.id, "3141");
        assert_eq!(deal.title, "");
        assert_eq!(deal.worth, "0");
        assert_eq!(deal.end_date, "");
        assert_eq!(deal.open_giveaway_url, None);
        assert_eq!(deal.gamerpower_url.as_deref(), Some("42"));
    }

    #[test]
    fn fractional_ids_keep_their_fraction() {
        let deal: Deal = serde_json::from_value(serde_json::json!({ "id": 12.5 })).expect("deal");
        assert_eq!(deal.id, "12.5");

        let nulled: Result<Deal, _> = serde_json::from_value(serde_json::json!({ "id": null }));
        assert!(nulled.is_err());
    }

    #[test]
    fn missing_id_is_rejected() {
        let result: Result<Deal, _> = serde_json::from_value(serde_json::json!({ "title": "x" }));
        assert!(result.is_err());
    }

    #[test]
    fn platform_tags_are_trimmed_lowercased_and_non_empty() {
        let deal = Deal::new("1", "t", " PC,Steam ,, Xbox One ");
        let tags: Vec<_> = deal.platform_tags().collect();
        assert_eq!(tags, vec!["pc", "steam", "xbox one"]);
    }

    #[test]
    fn targets_any_uses_or_semantics() {
        let deal = Deal::new("1", "t", "pc,steam");
        let steam: BTreeSet<String> = ["steam".to_string()].into();
        let xbox: BTreeSet<String> = ["xbox".to_string()].into();
        assert!(deal.targets_any(&steam));
        assert!(!deal.targets_any(&xbox));
    }

    #[test]
    fn user_preferences_are_case_insensitive() {
        let user = User {
            id: "u1".into(),
            notifications_enabled: true,
            preferred_game_platforms: vec!["  Steam".into(), "PC".into(), "".into()],
            notification_tokens: vec![],
        };
        let platforms = user.normalized_platforms();
        assert!(platforms.contains("steam"));
        assert!(platforms.contains("pc"));
        assert_eq!(platforms.len(), 2);
        assert!(user.wants_deal_notifications());
    }

    #[test]
    fn opted_out_or_empty_preferences_do_not_want_notifications() {
        let mut user = User {
            id: "u1".into(),
            notifications_enabled: false,
            preferred_game_platforms: vec!["pc".into()],
            notification_tokens: vec!["tok".into()],
        };
        assert!(!user.wants_deal_notifications());

        user.notifications_enabled = true;
        user.preferred_game_platforms.clear();
        assert!(!user.wants_deal_notifications());
    }

    #[test]
    fn user_documents_use_camel_case_fields() {
        let user: User = serde_json::from_value(serde_json::json!({
            "id": "u1",
            "notificationsEnabled": true,
            "preferredGamePlatforms": ["pc"],
        }))
        .expect("user");
        assert!(user.notifications_enabled);
        assert!(user.notification_tokens.is_empty());
    }

    #[test]
    fn notification_serializes_deal_flat_with_received_at_and_read() {
        let at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        let notification = Notification::unread(Deal::new("7", "Deal", "pc"), at);
        let value = serde_json::to_value(&notification).expect("json");
        assert_eq!(value["id"], "7");
        assert_eq!(value["read"], false);
        assert!(value.get("receivedAt").is_some());

        let back: Notification = serde_json::from_value(value).expect("roundtrip");
        assert_eq!(back.deal_id(), "7");
        assert!(back.deal.extra.is_empty());
    }
}

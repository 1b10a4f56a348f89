//! Registry records and their on-disk shapes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Surface-specific key/value bag (e.g. channel and thread ids).
pub type Extra = BTreeMap<String, String>;

/// Durable routing-key -> session record kept by a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMapping {
    /// Stable identifier of one conversation on the surface.
    pub routing_key: String,
    /// Weak reference to the backend session.
    pub session_id: String,
    pub surface: String,
    pub project_id: String,
    pub description: String,
    /// User id of whoever started the conversation.
    pub created_by: String,
    pub created_at: String,
    pub last_active: String,
    pub is_active: bool,
    pub extra: Extra,
}

/// Fixed-width UTC timestamp (`2026-03-01T09:30:00.000000Z`).
///
/// Fixed width and zero padding make lexicographic order equal time order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// A persisted record in either the current or the legacy chat-bridge shape.
///
/// Legacy records predate routing keys and were keyed by
/// `channel_id` (+ optional `thread_ts`).
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct StoredRecord {
    routing_key: Option<String>,
    session_id: Option<String>,
    surface: Option<String>,
    project_id: Option<String>,
    description: Option<String>,
    created_by: Option<String>,
    created_at: Option<String>,
    last_active: Option<String>,
    is_active: Option<bool>,
    extra: Option<Extra>,
    channel_id: Option<String>,
    thread_ts: Option<String>,
}

impl StoredRecord {
    /// Upgrade to a [`SessionMapping`]. `None` if the record can't be keyed.
    pub(crate) fn into_mapping(self, surface: &str, now: &str) -> Option<SessionMapping> {
        let session_id = self.session_id.filter(|s| !s.is_empty())?;
        let mut extra = self.extra.unwrap_or_default();

        let routing_key = match (self.routing_key, self.channel_id) {
            (Some(key), _) if !key.is_empty() => key,
            (_, Some(channel_id)) if !channel_id.is_empty() => {
                let key = match &self.thread_ts {
                    Some(ts) if !ts.is_empty() => format!("{channel_id}:{ts}"),
                    _ => channel_id.clone(),
                };
                extra.insert("channel_id".to_string(), channel_id);
                if let Some(ts) = self.thread_ts.filter(|ts| !ts.is_empty()) {
                    extra.insert("thread_ts".to_string(), ts);
                }
                key
            }
            _ => return None,
        };

        let created_at = self.created_at.unwrap_or_else(|| now.to_string());
        let last_active = match self.last_active {
            Some(ts) if ts >= created_at => ts,
            _ => created_at.clone(),
        };

        Some(SessionMapping {
            routing_key,
            session_id,
            surface: self.surface.unwrap_or_else(|| surface.to_string()),
            project_id: self.project_id.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            created_by: self.created_by.unwrap_or_default(),
            created_at,
            last_active,
            is_active: self.is_active.unwrap_or(true),
            extra,
        })
    }
}

/// Decode a registry file body, upgrading legacy records.
///
/// Individual records that can't be decoded are skipped with a warning; only
/// a body that isn't a JSON array fails.
pub(crate) fn decode_records(
    json: &str,
    surface: &str,
) -> Result<Vec<SessionMapping>, serde_json::Error> {
    let raw: Vec<serde_json::Value> = serde_json::from_str(json)?;
    let now = now_timestamp();

    let mappings = raw
        .into_iter()
        .enumerate()
        .filter_map(|(i, value)| {
            let record = match serde_json::from_value::<StoredRecord>(value) {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("Skipping malformed registry record #{}: {}", i, e);
                    return None;
                }
            };
            let mapping = record.into_mapping(surface, &now);
            if mapping.is_none() {
                log::warn!(
                    "Skipping registry record #{} without session_id or routing key",
                    i
                );
            }
            mapping
        })
        .collect();

    Ok(mappings)
}

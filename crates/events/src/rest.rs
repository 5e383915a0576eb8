//! PostgREST implementation of [`DecisionSource`].
//!
//! Reads `visitor_logs` joined with `apartments` (for building scope) and
//! `visitors` (for the display name), and `profiles` for resident names,
//! using [`reqwest`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::SecondsFormat;
use porteiro_core::decision::DecisionRecord;
use porteiro_core::types::{EntityId, Timestamp};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::source::{DecisionSource, SourceError, CODE_JWT_EXPIRED};

/// Columns selected for every decision read.
const DECISION_SELECT: &str = "id,visitor_id,notification_status,resident_response_at,\
resident_response_by,visitors(name),apartments!inner(number,building_id)";

/// Connection settings for the REST endpoint.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Project base URL, e.g. `https://xyz.supabase.co`.
    pub base_url: String,
    /// Public API key sent as the `apikey` header.
    pub api_key: String,
    /// User access token. Falls back to the API key when absent.
    pub access_token: Option<String>,
}

pub struct RestDecisionSource {
    client: reqwest::Client,
    config: RestConfig,
}

#[derive(Debug, Deserialize)]
struct ProfileRow {
    id: EntityId,
    #[serde(default)]
    full_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl RestDecisionSource {
    pub fn new(config: RestConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    /// Reuse an existing [`reqwest::Client`] (shared connection pool).
    pub fn with_client(client: reqwest::Client, config: RestConfig) -> Self {
        Self { client, config }
    }

    fn get(&self, table: &str) -> reqwest::RequestBuilder {
        let token = self
            .config
            .access_token
            .as_deref()
            .unwrap_or(&self.config.api_key);
        self.client
            .get(format!(
                "{}/rest/v1/{table}",
                self.config.base_url.trim_end_matches('/')
            ))
            .header("apikey", &self.config.api_key)
            .bearer_auth(token)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, SourceError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error(status.as_u16(), &body));
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| SourceError::Decode(e.to_string()))
    }
}

#[async_trait]
impl DecisionSource for RestDecisionSource {
    async fn decisions_since(
        &self,
        building_id: &str,
        since: Timestamp,
    ) -> Result<Vec<DecisionRecord>, SourceError> {
        let request = self
            .get("visitor_logs")
            .query(&decisions_since_query(building_id, since));
        self.fetch(request).await
    }

    async fn decision_by_id(
        &self,
        building_id: &str,
        id: &str,
    ) -> Result<Option<DecisionRecord>, SourceError> {
        let request = self
            .get("visitor_logs")
            .query(&decision_by_id_query(building_id, id));
        let rows: Vec<DecisionRecord> = self.fetch(request).await?;
        Ok(rows.into_iter().next())
    }

    async fn resident_names(
        &self,
        ids: &[EntityId],
    ) -> Result<HashMap<EntityId, String>, SourceError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let request = self.get("profiles").query(&[
            ("select", "id,full_name".to_string()),
            ("id", format!("in.({})", ids.join(","))),
        ]);
        let rows: Vec<ProfileRow> = self.fetch(request).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.full_name.map(|name| (row.id, name)))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Query and error helpers
// ---------------------------------------------------------------------------

fn decisions_since_query(building_id: &str, since: Timestamp) -> Vec<(&'static str, String)> {
    vec![
        ("select", DECISION_SELECT.to_string()),
        ("apartments.building_id", format!("eq.{building_id}")),
        ("notification_status", "in.(approved,rejected)".to_string()),
        (
            "resident_response_at",
            format!("gte.{}", since.to_rfc3339_opts(SecondsFormat::Millis, true)),
        ),
        ("resident_response_by", "not.is.null".to_string()),
        ("order", "resident_response_at.desc".to_string()),
    ]
}

fn decision_by_id_query(building_id: &str, id: &str) -> Vec<(&'static str, String)> {
    vec![
        ("select", DECISION_SELECT.to_string()),
        ("id", format!("eq.{id}")),
        ("apartments.building_id", format!("eq.{building_id}")),
        ("limit", "1".to_string()),
    ]
}

/// Map a non-2xx PostgREST response to a [`SourceError`].
fn classify_error(status: u16, body: &str) -> SourceError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed.message.unwrap_or_else(|| body.to_string());

    if parsed.code.as_deref() == Some(CODE_JWT_EXPIRED) || message.contains("JWT expired") {
        return SourceError::SessionExpired(message);
    }

    SourceError::Api {
        status,
        code: parsed.code,
        message,
    }
}

//! Demat Social API client
//!
//! GraphQL-over-HTTP client for the démarches platform. One operation:
//! fetch a page of dossiers for the configured démarche, newest API cursor
//! semantics (`first` / `after`), optionally restricted to dossiers updated
//! since a given timestamp.

use serde::{Deserialize, Serialize};
use sirena_common::config::DematSocialSettings;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

const USER_AGENT: &str = concat!("sirena-importer/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT_SECS: u64 = 30;
const RATE_LIMIT_MS: u64 = 500; // 2 requests per second

const DOSSIERS_QUERY: &str = r#"
query getDossiers($demarcheNumber: Int!, $first: Int, $after: String, $updatedSince: ISO8601DateTime) {
  demarche(number: $demarcheNumber) {
    dossiers(first: $first, after: $after, updatedSince: $updatedSince) {
      pageInfo {
        hasNextPage
        endCursor
      }
      nodes {
        number
        state
        dateDepot
        dateDerniereModification
        usager {
          email
        }
        demandeur {
          ... on PersonnePhysique {
            civilite
            nom
            prenom
          }
        }
        champs {
          label
          stringValue
        }
      }
    }
  }
}
"#;

/// Demat Social client errors
#[derive(Debug, Error)]
pub enum DematSocialError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("API error {0}: {1}")]
    ApiError(u16, String),

    #[error("GraphQL error: {0}")]
    GraphQlError(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// One page of dossiers
#[derive(Debug, Clone, Deserialize)]
pub struct DossierPage {
    #[serde(rename = "pageInfo")]
    pub page_info: PageInfo,
    pub nodes: Vec<Dossier>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageInfo {
    #[serde(rename = "hasNextPage")]
    pub has_next_page: bool,
    #[serde(rename = "endCursor")]
    pub end_cursor: Option<String>,
}

/// A dossier as returned by the API
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Dossier {
    /// Dossier number, unique per platform
    pub number: i64,
    /// Dossier state on the platform (en_construction, en_instruction, ...)
    pub state: String,
    #[serde(rename = "dateDepot")]
    pub date_depot: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "dateDerniereModification")]
    pub date_derniere_modification: chrono::DateTime<chrono::Utc>,
    pub usager: Option<Usager>,
    pub demandeur: Option<Demandeur>,
    #[serde(default)]
    pub champs: Vec<Champ>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Usager {
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Demandeur {
    pub civilite: Option<String>,
    pub nom: Option<String>,
    pub prenom: Option<String>,
}

/// A form field: label plus its value rendered as text
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Champ {
    pub label: String,
    #[serde(rename = "stringValue")]
    pub string_value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<ResponseData>,
    #[serde(default)]
    errors: Vec<GraphQlMessage>,
}

#[derive(Debug, Deserialize)]
struct GraphQlMessage {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResponseData {
    demarche: Option<DemarcheData>,
}

#[derive(Debug, Deserialize)]
struct DemarcheData {
    dossiers: DossierPage,
}

/// Minimum spacing between requests
struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval_ms: u64) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval: Duration::from_millis(min_interval_ms),
        }
    }

    /// Wait if necessary to comply with rate limit
    async fn wait(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                tracing::debug!("Rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        *last = Some(Instant::now());
    }
}

/// Demat Social API client
pub struct DematSocialClient {
    settings: DematSocialSettings,
    http_client: reqwest::Client,
    rate_limiter: RateLimiter,
}

impl DematSocialClient {
    pub fn new(settings: DematSocialSettings) -> Result<Self, DematSocialError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| DematSocialError::NetworkError(e.to_string()))?;

        Ok(Self {
            settings,
            http_client,
            rate_limiter: RateLimiter::new(RATE_LIMIT_MS),
        })
    }

    /// Fetch one page of dossiers for the configured démarche
    ///
    /// `after` is the cursor from the previous page's `endCursor`;
    /// `updated_since` (RFC 3339) restricts results to dossiers modified
    /// after that instant.
    pub async fn fetch_dossiers(
        &self,
        first: i64,
        after: Option<&str>,
        updated_since: Option<&str>,
    ) -> Result<DossierPage, DematSocialError> {
        self.rate_limiter.wait().await;

        let payload = serde_json::json!({
            "query": DOSSIERS_QUERY,
            "variables": {
                "demarcheNumber": self.settings.demarche_number,
                "first": first,
                "after": after,
                "updatedSince": updated_since,
            },
        });

        tracing::debug!(
            demarche = self.settings.demarche_number,
            after = after.unwrap_or("-"),
            "Querying Demat Social API"
        );

        let response = self
            .http_client
            .post(&self.settings.api_url)
            .bearer_auth(&self.settings.api_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DematSocialError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(DematSocialError::ApiError(status.as_u16(), error_text));
        }

        let body: GraphQlResponse = response
            .json()
            .await
            .map_err(|e| DematSocialError::ParseError(e.to_string()))?;

        if !body.errors.is_empty() {
            let messages: Vec<String> = body.errors.into_iter().map(|e| e.message).collect();
            return Err(DematSocialError::GraphQlError(messages.join("; ")));
        }

        let page = body
            .data
            .and_then(|d| d.demarche)
            .map(|d| d.dossiers)
            .ok_or_else(|| {
                DematSocialError::GraphQlError(format!(
                    "démarche {} not in response",
                    self.settings.demarche_number
                ))
            })?;

        tracing::debug!(
            dossiers = page.nodes.len(),
            has_next = page.page_info.has_next_page,
            "Retrieved dossier page"
        );

        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> DematSocialSettings {
        DematSocialSettings {
            api_url: "https://demat.example.fr/api/v2/graphql".to_string(),
            api_token: "token".to_string(),
            demarche_number: 77,
        }
    }

    #[test]
    fn test_client_creation() {
        assert!(DematSocialClient::new(test_settings()).is_ok());
    }

    #[tokio::test]
    async fn test_rate_limiter_timing() {
        let limiter = RateLimiter::new(200);

        let start = Instant::now();
        limiter.wait().await;
        let first_elapsed = start.elapsed();

        limiter.wait().await;
        let second_elapsed = start.elapsed();

        assert!(first_elapsed < Duration::from_millis(100));
        assert!(second_elapsed >= Duration::from_millis(180));
    }

    #[test]
    fn test_dossier_page_parses() {
        let raw = r#"
        {
            "data": {
                "demarche": {
                    "dossiers": {
                        "pageInfo": { "hasNextPage": true, "endCursor": "abc" },
                        "nodes": [
                            {
                                "number": 4021,
                                "state": "en_construction",
                                "dateDepot": "2026-03-10T09:15:00+01:00",
                                "dateDerniereModification": "2026-03-11T10:00:00+01:00",
                                "usager": { "email": "jeanne.martin@example.fr" },
                                "demandeur": { "civilite": "Mme", "nom": "Martin", "prenom": "Jeanne" },
                                "champs": [
                                    { "label": "Commune de survenue", "stringValue": "Lyon" },
                                    { "label": "Description des faits", "stringValue": "..." }
                                ]
                            }
                        ]
                    }
                }
            }
        }
        "#;

        let body: GraphQlResponse = serde_json::from_str(raw).unwrap();
        let page = body.data.unwrap().demarche.unwrap().dossiers;

        assert!(page.page_info.has_next_page);
        assert_eq!(page.page_info.end_cursor.as_deref(), Some("abc"));
        assert_eq!(page.nodes.len(), 1);

        let dossier = &page.nodes[0];
        assert_eq!(dossier.number, 4021);
        assert_eq!(
            dossier.usager.as_ref().unwrap().email.as_deref(),
            Some("jeanne.martin@example.fr")
        );
        assert_eq!(dossier.champs[0].label, "Commune de survenue");
    }

    #[test]
    fn test_graphql_errors_detected() {
        let raw = r#"{ "data": null, "errors": [{ "message": "Demarche not found" }] }"#;
        let body: GraphQlResponse = serde_json::from_str(raw).unwrap();

        assert!(body.data.is_none());
        assert_eq!(body.errors.len(), 1);
        assert_eq!(body.errors[0].message, "Demarche not found");
    }

    #[test]
    fn test_missing_optional_fields_tolerated() {
        let raw = r#"
        {
            "number": 1,
            "state": "en_instruction",
            "dateDepot": "2026-01-01T00:00:00Z",
            "dateDerniereModification": "2026-01-01T00:00:00Z",
            "usager": null,
            "demandeur": null
        }
        "#;

        let dossier: Dossier = serde_json::from_str(raw).unwrap();
        assert!(dossier.usager.is_none());
        assert!(dossier.demandeur.is_none());
        assert!(dossier.champs.is_empty());
    }
}

//! Upstream park data source contracts and outbound webhook delivery.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tpa_core::{CatalogEntry, WaittimeRecord};
use tpa_storage::{FetchError, HttpFetcher};
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.wartezeiten.app/v1";
pub const DEFAULT_LANGUAGE: &str = "de";

/// Park listing entry as returned by the upstream `/parks` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamPark {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub land: String,
}

#[async_trait]
pub trait ParkDataSource: Send + Sync {
    async fn fetch_waittimes(&self, park_api_code: &str) -> Result<Vec<WaittimeRecord>, FetchError>;

    /// Attraction catalog of a park. Defaults to projecting the wait-time listing, which
    /// carries every attraction upstream knows about.
    async fn fetch_catalog(&self, park_api_code: &str) -> Result<Vec<CatalogEntry>, FetchError> {
        Ok(self
            .fetch_waittimes(park_api_code)
            .await?
            .into_iter()
            .map(|r| CatalogEntry {
                code: r.code,
                name: r.name,
            })
            .collect())
    }

    async fn fetch_parks(&self) -> Result<Vec<UpstreamPark>, FetchError>;
}

/// api.wartezeiten.app client. Park and language are passed as request headers.
#[derive(Debug, Clone)]
pub struct WartezeitenSource {
    http: Arc<HttpFetcher>,
    base_url: String,
    language: String,
}

impl WartezeitenSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            language: language.into(),
        }
    }

    pub fn waitingtimes_url(&self) -> String {
        format!("{}/waitingtimes", self.base_url)
    }

    pub fn parks_url(&self) -> String {
        format!("{}/parks", self.base_url)
    }
}

#[async_trait]
impl ParkDataSource for WartezeitenSource {
    async fn fetch_waittimes(&self, park_api_code: &str) -> Result<Vec<WaittimeRecord>, FetchError> {
        let url = self.waitingtimes_url();
        let records: Vec<WaittimeRecord> = self
            .http
            .get_json(&url, &[("language", &self.language), ("park", park_api_code)])
            .await?;
        debug!(park = park_api_code, count = records.len(), "fetched waittimes");
        Ok(records)
    }

    async fn fetch_parks(&self) -> Result<Vec<UpstreamPark>, FetchError> {
        let url = self.parks_url();
        self.http
            .get_json(&url, &[("language", &self.language)])
            .await
    }
}

/// ISO code for the German country names used by the upstream park listing.
pub fn country_code_de(land: &str) -> Option<&'static str> {
    let code = match land.trim() {
        "Belgien" => "BE",
        "Deutschland" => "DE",
        "Dänemark" => "DK",
        "Frankreich" => "FR",
        "Großbritannien" => "GB",
        "Italien" => "IT",
        "Niederlande" => "NL",
        "Polen" => "PL",
        "Schweden" => "SE",
        "Schweiz" => "CH",
        "Spanien" => "ES",
        "Vereinigte Staaten" => "US",
        "Vereinigtes Königreich" => "UK",
        "Österreich" => "AT",
        _ => return None,
    };
    Some(code)
}

/// Payload dialect of a notification method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationProvider {
    Discord,
    Slack,
    Ntfy,
    /// Any provider name not in the fixed set; delivered like ntfy.
    PlainText,
}

impl NotificationProvider {
    pub fn from_name(name: &str) -> Self {
        match name {
            "discord" => Self::Discord,
            "slack" => Self::Slack,
            "ntfy" => Self::Ntfy,
            _ => Self::PlainText,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookPayload {
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl WebhookPayload {
    pub fn for_provider(provider: NotificationProvider, message: &str) -> Self {
        match provider {
            NotificationProvider::Discord => {
                Self::json(&serde_json::json!({ "content": message }))
            }
            NotificationProvider::Slack => Self::json(&serde_json::json!({ "text": message })),
            NotificationProvider::Ntfy | NotificationProvider::PlainText => Self {
                content_type: "text/plain; charset=utf-8",
                body: message.as_bytes().to_vec(),
            },
        }
    }

    fn json(value: &serde_json::Value) -> Self {
        Self {
            content_type: "application/json",
            body: value.to_string().into_bytes(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("webhook delivery to {url} failed: {source}")]
    Send {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("webhook delivery to {url} failed: {message}")]
    Rejected { url: String, message: String },
}

#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send(&self, url: &str, payload: &WebhookPayload) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct HttpWebhookSender {
    http: Arc<HttpFetcher>,
}

impl HttpWebhookSender {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn send(&self, url: &str, payload: &WebhookPayload) -> Result<(), DeliveryError> {
        self.http
            .post(url, payload.content_type, payload.body.clone())
            .await
            .map(|_| ())
            .map_err(|source| DeliveryError::Send {
                url: url.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tpa_core::AttractionStatus;

    struct ScriptedSource {
        waittimes: HashMap<String, Vec<WaittimeRecord>>,
    }

    #[async_trait]
    impl ParkDataSource for ScriptedSource {
        async fn fetch_waittimes(
            &self,
            park_api_code: &str,
        ) -> Result<Vec<WaittimeRecord>, FetchError> {
            self.waittimes
                .get(park_api_code)
                .cloned()
                .ok_or_else(|| FetchError::HttpStatus {
                    status: 404,
                    url: park_api_code.to_string(),
                })
        }

        async fn fetch_parks(&self) -> Result<Vec<UpstreamPark>, FetchError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn provider_names_map_to_fixed_set() {
        assert_eq!(NotificationProvider::from_name("discord"), NotificationProvider::Discord);
        assert_eq!(NotificationProvider::from_name("slack"), NotificationProvider::Slack);
        assert_eq!(NotificationProvider::from_name("ntfy"), NotificationProvider::Ntfy);
        assert_eq!(NotificationProvider::from_name("teams"), NotificationProvider::PlainText);
        assert_eq!(NotificationProvider::from_name("Discord"), NotificationProvider::PlainText);
    }

    #[test]
    fn discord_and_slack_payloads_are_json_objects() {
        let msg = "Waittime for Silver Star increased to 40 minutes!";

        let discord = WebhookPayload::for_provider(NotificationProvider::Discord, msg);
        assert_eq!(discord.content_type, "application/json");
        let value: serde_json::Value = serde_json::from_slice(&discord.body).unwrap();
        assert_eq!(value, serde_json::json!({ "content": msg }));

        let slack = WebhookPayload::for_provider(NotificationProvider::Slack, msg);
        let value: serde_json::Value = serde_json::from_slice(&slack.body).unwrap();
        assert_eq!(value, serde_json::json!({ "text": msg }));
    }

    #[test]
    fn ntfy_and_unknown_providers_get_raw_text() {
        let msg = "Waittime for Voltron sank to 5 minutes!";
        for provider in [NotificationProvider::Ntfy, NotificationProvider::PlainText] {
            let payload = WebhookPayload::for_provider(provider, msg);
            assert_eq!(payload.body, msg.as_bytes());
            assert!(payload.content_type.starts_with("text/plain"));
        }
    }

    #[test]
    fn german_country_names_resolve() {
        assert_eq!(country_code_de("Deutschland"), Some("DE"));
        assert_eq!(country_code_de("Österreich"), Some("AT"));
        assert_eq!(country_code_de("Vereinigtes Königreich"), Some("UK"));
        assert_eq!(country_code_de("Atlantis"), None);
    }

    #[tokio::test]
    async fn catalog_defaults_to_waittime_projection() {
        let source = ScriptedSource {
            waittimes: HashMap::from([(
                "europapark".to_string(),
                vec![
                    WaittimeRecord::new("a", "Alpha", 5, AttractionStatus::Opened),
                    WaittimeRecord::new("b", "Beta", 0, AttractionStatus::Closed),
                ],
            )]),
        };
        let catalog = source.fetch_catalog("europapark").await.unwrap();
        assert_eq!(
            catalog,
            vec![
                CatalogEntry { code: "a".into(), name: "Alpha".into() },
                CatalogEntry { code: "b".into(), name: "Beta".into() },
            ]
        );
        assert!(source.fetch_catalog("nowhere").await.is_err());
    }

    #[test]
    fn urls_are_built_from_trimmed_base() {
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let source = WartezeitenSource::new(http, "https://example.test/v1/", "en");
        assert_eq!(source.waitingtimes_url(), "https://example.test/v1/waitingtimes");
        assert_eq!(source.parks_url(), "https://example.test/v1/parks");
    }
}

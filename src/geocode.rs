use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::secrets::{SecretVault, GEOCODE_KEY_ALIAS};

const USER_AGENT: &str = concat!("address-mapper/", env!("CARGO_PKG_VERSION"));

/// Result of one resolution attempt. Expected provider answers are values, not errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeocodeOutcome {
    Resolved {
        latitude: f64,
        longitude: f64,
        formatted_address: String,
    },
    NotFound,
    RateLimited,
    TransientError {
        message: String,
    },
    NoAddressField,
}

#[async_trait]
pub trait GeocodeLookup: Send + Sync {
    async fn geocode(&self, address: &str) -> GeocodeOutcome;
}

pub struct HttpGeocodeClient {
    http: Client,
    endpoint: Url,
    api_key: Option<SecretString>,
}

impl HttpGeocodeClient {
    pub fn new(endpoint: &str, api_key: Option<SecretString>, timeout: Duration) -> AppResult<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| AppError::Config(format!("invalid geocode endpoint: {err}")))?;
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }

    pub fn from_config(config: &AppConfig, api_key: Option<SecretString>) -> AppResult<Self> {
        Self::new(
            &config.geocode_endpoint,
            api_key,
            Duration::from_secs(config.geocode_timeout_secs),
        )
    }

    /// The key parameter is only attached when a credential is configured.
    /// Query values are percent-encoded with spaces as `%20`, never `+`.
    pub fn request_url(&self, address: &str) -> Url {
        let mut url = self.endpoint.clone();
        let mut query = url.query().map(str::to_string).unwrap_or_default();
        let mut append = |name: &str, value: &str| {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(name);
            query.push('=');
            query.extend(utf8_percent_encode(value, QUERY_VALUE));
        };
        append("address", address);
        if let Some(key) = &self.api_key {
            append("key", key.expose_secret());
        }
        url.set_query(Some(&query));
        url
    }
}

/// Characters left bare in a query value: alphanumerics and `-_.!~*'()`.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[async_trait]
impl GeocodeLookup for HttpGeocodeClient {
    async fn geocode(&self, address: &str) -> GeocodeOutcome {
        let query = address.trim();
        if query.is_empty() {
            return GeocodeOutcome::NoAddressField;
        }

        let response = match self.http.get(self.request_url(query)).send().await {
            Ok(response) => response,
            Err(err) => {
                let message = describe_transport_error(err);
                warn!(target: "geocode", address = query, %message, "geocode request failed");
                return GeocodeOutcome::TransientError { message };
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(target: "geocode", address = query, "provider throttled request (HTTP 429)");
            return GeocodeOutcome::RateLimited;
        }
        if !status.is_success() {
            warn!(target: "geocode", address = query, %status, "provider returned error status");
            return GeocodeOutcome::TransientError {
                message: format!("provider responded with HTTP {status}"),
            };
        }

        match response.json::<GeocodeResponse>().await {
            Ok(body) => interpret_response(query, body),
            Err(err) => {
                let message = describe_transport_error(err);
                warn!(target: "geocode", address = query, %message, "unreadable geocode response");
                GeocodeOutcome::TransientError { message }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GeocodeResponse {
    pub status: String,
    #[serde(default)]
    pub results: Vec<GeocodeResult>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GeocodeResult {
    #[serde(default)]
    pub formatted_address: Option<String>,
    pub geometry: Geometry,
}

#[derive(Debug, Deserialize)]
pub struct Geometry {
    pub location: LatLngLiteral,
}

#[derive(Debug, Deserialize)]
pub struct LatLngLiteral {
    pub lat: f64,
    pub lng: f64,
}

/// Maps a provider payload to an outcome. Unknown statuses are non-fatal misses.
pub fn interpret_response(query: &str, body: GeocodeResponse) -> GeocodeOutcome {
    match body.status.as_str() {
        "OK" => match body.results.into_iter().next() {
            Some(first) => {
                let formatted_address = first
                    .formatted_address
                    .filter(|text| !text.trim().is_empty())
                    .unwrap_or_else(|| query.to_string());
                debug!(
                    target: "geocode",
                    address = query,
                    lat = first.geometry.location.lat,
                    lng = first.geometry.location.lng,
                    "geocoded address"
                );
                GeocodeOutcome::Resolved {
                    latitude: first.geometry.location.lat,
                    longitude: first.geometry.location.lng,
                    formatted_address,
                }
            }
            None => GeocodeOutcome::NotFound,
        },
        "ZERO_RESULTS" => {
            debug!(target: "geocode", address = query, "no results for address");
            GeocodeOutcome::NotFound
        }
        "OVER_QUERY_LIMIT" => {
            warn!(target: "geocode", "geocoding query limit exceeded");
            GeocodeOutcome::RateLimited
        }
        other => {
            warn!(
                target: "geocode",
                address = query,
                status = other,
                reason = body.error_message.as_deref().unwrap_or(""),
                "geocoding failed"
            );
            GeocodeOutcome::NotFound
        }
    }
}

fn describe_transport_error(err: reqwest::Error) -> String {
    // Request URLs carry the API key.
    let err = err.without_url();
    if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_decode() {
        format!("invalid response body: {err}")
    } else {
        err.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    Environment,
    Keyring,
    Missing,
}

pub type ClientFactory =
    Box<dyn Fn(&AppConfig, Option<SecretString>) -> AppResult<Arc<dyn GeocodeLookup>> + Send + Sync>;

/// Shared geocoder service. The client is built lazily on first use and cached;
/// a failed build is not cached, so the next `ensure_ready` tries again.
pub struct GeocoderHandle {
    config: AppConfig,
    vault: Option<SecretVault>,
    factory: ClientFactory,
    client: Mutex<Option<Arc<dyn GeocodeLookup>>>,
    credential: Mutex<Option<CredentialSource>>,
    missing_key_reported: AtomicBool,
}

impl GeocoderHandle {
    pub fn new(config: AppConfig, vault: Option<SecretVault>) -> Self {
        Self::with_factory(
            config,
            vault,
            Box::new(|config: &AppConfig, key: Option<SecretString>| {
                let client: Arc<dyn GeocodeLookup> =
                    Arc::new(HttpGeocodeClient::from_config(config, key)?);
                Ok(client)
            }),
        )
    }

    pub fn with_factory(config: AppConfig, vault: Option<SecretVault>, factory: ClientFactory) -> Self {
        Self {
            config,
            vault,
            factory,
            client: Mutex::new(None),
            credential: Mutex::new(None),
            missing_key_reported: AtomicBool::new(false),
        }
    }

    /// Wraps an already-built lookup, e.g. a scripted fake in tests.
    pub fn from_lookup(config: AppConfig, lookup: Arc<dyn GeocodeLookup>) -> Self {
        Self::with_factory(
            config,
            None,
            Box::new(move |_: &AppConfig, _: Option<SecretString>| {
                Ok(Arc::clone(&lookup))
            }),
        )
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn ensure_ready(&self) -> AppResult<Arc<dyn GeocodeLookup>> {
        let mut slot = self.client.lock();
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }

        let (key, source) = self.resolve_credential();
        let client = (self.factory)(&self.config, key).map_err(|err| {
            warn!(?err, "geocoder initialization failed; it will be retried on next use");
            err
        })?;
        info!(credential = ?source, endpoint = %self.config.geocode_endpoint, "geocoder ready");
        *self.credential.lock() = Some(source);
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    pub fn is_ready(&self) -> bool {
        self.client.lock().is_some()
    }

    pub fn credential_source(&self) -> Option<CredentialSource> {
        *self.credential.lock()
    }

    /// Drops the cached client so the next use picks up a changed credential.
    pub fn reset(&self) {
        *self.client.lock() = None;
        *self.credential.lock() = None;
        self.missing_key_reported.store(false, Ordering::SeqCst);
    }

    /// Missing-credential warning, returned only to the first caller after it arises.
    pub fn take_credential_warning(&self) -> Option<AppError> {
        if self.credential_source() != Some(CredentialSource::Missing) {
            return None;
        }
        if self.missing_key_reported.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(AppError::Config(
            "geocoding API key is not configured; set GOOGLE_MAPS_API_KEY or store one with \
             `address-mapper credential set`. Requests will be sent without a key and are \
             expected to fail."
                .into(),
        ))
    }

    fn resolve_credential(&self) -> (Option<SecretString>, CredentialSource) {
        if let Some(key) = self.config.google_maps_api_key.clone() {
            return (Some(key), CredentialSource::Environment);
        }
        if let Some(vault) = &self.vault {
            match vault.read_secret(GEOCODE_KEY_ALIAS) {
                Ok(Some(key)) => return (Some(key), CredentialSource::Keyring),
                Ok(None) => {}
                Err(err) => warn!(?err, "unable to read geocoding key from keyring"),
            }
        }
        warn!("geocoding API key missing; geocoding requests will fail");
        (None, CredentialSource::Missing)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use httptest::matchers::*;
    use httptest::responders::{delay_and_then, json_encoded, status_code};
    use httptest::{all_of, Expectation, Server};
    use serde_json::json;

    use super::*;

    const PATH: &str = "/maps/api/geocode/json";

    fn client_for(server: &Server, key: Option<&str>, timeout: Duration) -> HttpGeocodeClient {
        HttpGeocodeClient::new(
            &server.url(PATH).to_string(),
            key.map(|k| SecretString::new(k.into())),
            timeout,
        )
        .unwrap()
    }

    fn parse(body: serde_json::Value) -> GeocodeResponse {
        serde_json::from_value(body).unwrap()
    }

    struct StaticLookup;

    #[async_trait]
    impl GeocodeLookup for StaticLookup {
        async fn geocode(&self, _address: &str) -> GeocodeOutcome {
            GeocodeOutcome::NotFound
        }
    }

    #[test]
    fn interprets_provider_statuses() {
        let ok = parse(json!({
            "status": "OK",
            "results": [
                {
                    "formatted_address": "1 Infinite Loop, Cupertino, CA 95014, USA",
                    "geometry": { "location": { "lat": 37.3318, "lng": -122.0312 } }
                },
                {
                    "formatted_address": "ignored",
                    "geometry": { "location": { "lat": 0.0, "lng": 0.0 } }
                }
            ]
        }));
        assert_eq!(
            interpret_response("1 infinite loop", ok),
            GeocodeOutcome::Resolved {
                latitude: 37.3318,
                longitude: -122.0312,
                formatted_address: "1 Infinite Loop, Cupertino, CA 95014, USA".into(),
            }
        );

        let empty_ok = parse(json!({ "status": "OK", "results": [] }));
        assert_eq!(interpret_response("x", empty_ok), GeocodeOutcome::NotFound);

        let zero = parse(json!({ "status": "ZERO_RESULTS", "results": [] }));
        assert_eq!(interpret_response("x", zero), GeocodeOutcome::NotFound);

        let limited = parse(json!({ "status": "OVER_QUERY_LIMIT" }));
        assert_eq!(interpret_response("x", limited), GeocodeOutcome::RateLimited);

        let denied = parse(json!({
            "status": "REQUEST_DENIED",
            "error_message": "The provided API key is invalid."
        }));
        assert_eq!(interpret_response("x", denied), GeocodeOutcome::NotFound);
    }

    #[test]
    fn falls_back_to_query_when_formatted_address_missing() {
        let body = parse(json!({
            "status": "OK",
            "results": [{ "geometry": { "location": { "lat": 1.5, "lng": -2.5 } } }]
        }));
        assert_eq!(
            interpret_response("5 Elm St", body),
            GeocodeOutcome::Resolved {
                latitude: 1.5,
                longitude: -2.5,
                formatted_address: "5 Elm St".into(),
            }
        );
    }

    #[test]
    fn builds_request_url_with_optional_key() {
        let with_key = HttpGeocodeClient::new(
            "https://geo.example.com/geocode/json",
            Some(SecretString::new("k3y".into())),
            Duration::from_secs(1),
        )
        .unwrap();
        let url = with_key.request_url("10 Downing St & Co");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("address".to_string(), "10 Downing St & Co".to_string()),
                ("key".to_string(), "k3y".to_string()),
            ]
        );
        assert!(!url.as_str().contains("& Co"));

        let without_key = HttpGeocodeClient::new(
            "https://geo.example.com/geocode/json",
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(!without_key.request_url("x").as_str().contains("key="));
    }

    #[test]
    fn encodes_spaces_in_addresses_as_percent_twenty() {
        let client = HttpGeocodeClient::new(
            "https://geo.example.com/geocode/json?region=us",
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        let url = client.request_url("1 Main St, Springfield (rear) +1");
        assert_eq!(
            url.query(),
            Some("region=us&address=1%20Main%20St%2C%20Springfield%20(rear)%20%2B1")
        );
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[1].1, "1 Main St, Springfield (rear) +1");
    }

    #[test]
    fn rejects_invalid_endpoint() {
        let result = HttpGeocodeClient::new("not a url", None, Duration::from_secs(1));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn resolves_through_http_provider() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", PATH),
                request::query(url_decoded(contains(("address", "1 Infinite Loop, Cupertino")))),
                request::query(url_decoded(contains(("key", "test-key")))),
            ])
            .respond_with(json_encoded(json!({
                "status": "OK",
                "results": [{
                    "formatted_address": "1 Infinite Loop, Cupertino, CA 95014, USA",
                    "geometry": { "location": { "lat": 37.33, "lng": -122.03 } }
                }]
            }))),
        );

        let client = client_for(&server, Some("test-key"), Duration::from_secs(5));
        let outcome = client.geocode("  1 Infinite Loop, Cupertino ").await;
        assert_eq!(
            outcome,
            GeocodeOutcome::Resolved {
                latitude: 37.33,
                longitude: -122.03,
                formatted_address: "1 Infinite Loop, Cupertino, CA 95014, USA".into(),
            }
        );
    }

    #[tokio::test]
    async fn omits_key_when_not_configured() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", PATH),
                request::query(url_decoded(not(contains(key("key"))))),
            ])
            .respond_with(json_encoded(json!({
                "status": "REQUEST_DENIED",
                "error_message": "You must use an API key"
            }))),
        );

        let client = client_for(&server, None, Duration::from_secs(5));
        assert_eq!(client.geocode("Main St").await, GeocodeOutcome::NotFound);
    }

    #[tokio::test]
    async fn classifies_http_failures() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::query(url_decoded(contains(("address", "throttled")))))
                .respond_with(status_code(429)),
        );
        server.expect(
            Expectation::matching(request::query(url_decoded(contains(("address", "broken")))))
                .respond_with(status_code(503)),
        );
        server.expect(
            Expectation::matching(request::query(url_decoded(contains(("address", "garbled")))))
                .respond_with(status_code(200).body("<html>not json</html>")),
        );

        let client = client_for(&server, Some("k"), Duration::from_secs(5));
        assert_eq!(client.geocode("throttled").await, GeocodeOutcome::RateLimited);
        assert!(matches!(
            client.geocode("broken").await,
            GeocodeOutcome::TransientError { .. }
        ));
        assert!(matches!(
            client.geocode("garbled").await,
            GeocodeOutcome::TransientError { .. }
        ));
    }

    #[tokio::test]
    async fn converts_timeout_into_transient_error() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", PATH)).respond_with(delay_and_then(
                Duration::from_millis(500),
                json_encoded(json!({ "status": "ZERO_RESULTS" })),
            )),
        );

        let client = client_for(&server, Some("secret-key"), Duration::from_millis(50));
        match client.geocode("slow street").await {
            GeocodeOutcome::TransientError { message } => {
                assert_eq!(message, "request timed out");
            }
            other => panic!("expected transient error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn blank_address_never_hits_the_network() {
        let client = HttpGeocodeClient::new("http://127.0.0.1:9/unused", None, Duration::from_secs(1))
            .unwrap();
        assert_eq!(client.geocode("   ").await, GeocodeOutcome::NoAddressField);
    }

    #[test]
    fn caches_client_after_first_success() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let mut config = AppConfig::default();
        config.google_maps_api_key = Some(SecretString::new("env-key".into()));
        let handle = GeocoderHandle::with_factory(
            config,
            None,
            Box::new(move |_: &AppConfig, key: Option<SecretString>| {
                assert!(key.is_some());
                counter.fetch_add(1, Ordering::SeqCst);
                let client: Arc<dyn GeocodeLookup> = Arc::new(StaticLookup);
                Ok(client)
            }),
        );

        handle.ensure_ready().unwrap();
        handle.ensure_ready().unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(handle.credential_source(), Some(CredentialSource::Environment));
        assert!(handle.take_credential_warning().is_none());
    }

    #[test]
    fn failed_initialization_is_retryable() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let handle = GeocoderHandle::with_factory(
            AppConfig::default(),
            None,
            Box::new(move |_: &AppConfig, _: Option<SecretString>| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(AppError::Config("transport unavailable".into()));
                }
                let client: Arc<dyn GeocodeLookup> = Arc::new(StaticLookup);
                Ok(client)
            }),
        );

        assert!(handle.ensure_ready().is_err());
        assert!(!handle.is_ready());
        assert!(handle.ensure_ready().is_ok());
        assert!(handle.is_ready());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn falls_back_to_keyring_then_reports_missing_once() {
        let vault = SecretVault::in_memory();
        let handle = GeocoderHandle::with_factory(
            AppConfig::default(),
            Some(vault.clone()),
            Box::new(|_: &AppConfig, _: Option<SecretString>| {
                let client: Arc<dyn GeocodeLookup> = Arc::new(StaticLookup);
                Ok(client)
            }),
        );

        handle.ensure_ready().unwrap();
        assert_eq!(handle.credential_source(), Some(CredentialSource::Missing));
        assert!(matches!(handle.take_credential_warning(), Some(AppError::Config(_))));
        assert!(handle.take_credential_warning().is_none());

        vault
            .write_secret(GEOCODE_KEY_ALIAS, &SecretString::new("stored".into()))
            .unwrap();
        handle.reset();
        handle.ensure_ready().unwrap();
        assert_eq!(handle.credential_source(), Some(CredentialSource::Keyring));
        assert!(handle.take_credential_warning().is_none());
    }
}

//! Peer discovery through the signaling endpoint's listing resource.

use async_trait::async_trait;
use log::{debug, warn};
use mesh_core::{Error, PeerIdentity};
use settings_manager::SignalingSettings;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Source of the identities currently registered with the endpoint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerListing: Send + Sync {
    /// Fetch every registered identity
    async fn list(&self) -> Result<Vec<PeerIdentity>, Error>;
}

/// Listing fetched with `GET` from the endpoint's HTTP API
pub struct HttpPeerListing {
    client: reqwest::Client,
    url: String,
}

impl HttpPeerListing {
    /// Create a listing for the configured endpoint
    pub fn new(settings: &SignalingSettings, request_timeout: Duration) -> Result<Self, Error> {
        Self::with_url(settings.directory_url(), request_timeout)
    }

    /// Create a listing querying an explicit URL
    pub fn with_url(url: impl Into<String>, request_timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Directory(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PeerListing for HttpPeerListing {
    async fn list(&self) -> Result<Vec<PeerIdentity>, Error> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::Directory(format!("Directory request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Directory(format!(
                "Directory returned {}",
                response.status()
            )));
        }

        let ids: Vec<String> = response
            .json()
            .await
            .map_err(|e| Error::Directory(format!("Malformed directory listing: {}", e)))?;
        Ok(ids.into_iter().map(PeerIdentity::new).collect())
    }
}

/// Keep the identities worth calling: inside `namespace`, not ourselves, not
/// already in a session. Order of the listing is preserved and duplicates
/// are dropped.
pub fn filter_candidates<F>(
    listing: Vec<PeerIdentity>,
    namespace: &str,
    self_identity: &PeerIdentity,
    is_present: F,
) -> Vec<PeerIdentity>
where
    F: Fn(&PeerIdentity) -> bool,
{
    let mut seen = HashSet::new();
    listing
        .into_iter()
        .filter(|id| id.in_namespace(namespace))
        .filter(|id| id != self_identity)
        .filter(|id| !is_present(id))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// One-shot discovery of mesh candidates
#[derive(Clone)]
pub struct PeerDirectory {
    listing: Arc<dyn PeerListing>,
    namespace: String,
}

impl PeerDirectory {
    /// Create a new directory over `listing`
    pub fn new(listing: Arc<dyn PeerListing>, namespace: impl Into<String>) -> Self {
        Self {
            listing,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Query the listing once. Failures yield an empty listing.
    pub async fn fetch(&self) -> Vec<PeerIdentity> {
        match self.listing.list().await {
            Ok(ids) => {
                debug!("Directory lists {} peer(s)", ids.len());
                ids
            }
            Err(e) => {
                warn!("Peer discovery failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Apply the candidate filter to a fetched listing
    pub fn filter<F>(
        &self,
        listing: Vec<PeerIdentity>,
        self_identity: &PeerIdentity,
        is_present: F,
    ) -> Vec<PeerIdentity>
    where
        F: Fn(&PeerIdentity) -> bool,
    {
        filter_candidates(listing, &self.namespace, self_identity, is_present)
    }

    /// Fetch and filter in one step
    pub async fn discover<F>(&self, self_identity: &PeerIdentity, is_present: F) -> Vec<PeerIdentity>
    where
        F: Fn(&PeerIdentity) -> bool,
    {
        let listing = self.fetch().await;
        self.filter(listing, self_identity, is_present)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ids(raw: &[&str]) -> Vec<PeerIdentity> {
        raw.iter().map(|s| PeerIdentity::new(*s)).collect()
    }

    #[test]
    fn filter_drops_self_foreign_and_present() {
        let me = PeerIdentity::new("voice-me-1");
        let listing = ids(&[
            "voice-me-1",
            "voice-amy-2",
            "chat-bob-3",
            "voice-cal-4",
            "voice-amy-2",
            "voiceless-5",
        ]);
        let present = PeerIdentity::new("voice-cal-4");

        let candidates = filter_candidates(listing, "voice", &me, |id| *id == present);
        assert_eq!(candidates, ids(&["voice-amy-2"]));
    }

    #[tokio::test]
    async fn discover_uses_listing() {
        let mut listing = MockPeerListing::new();
        listing
            .expect_list()
            .times(1)
            .returning(|| Ok(ids(&["voice-me-1", "voice-amy-2"])));

        let directory = PeerDirectory::new(Arc::new(listing), "voice");
        let found = directory
            .discover(&PeerIdentity::new("voice-me-1"), |_| false)
            .await;
        assert_eq!(found, ids(&["voice-amy-2"]));
    }

    #[tokio::test]
    async fn listing_failure_yields_no_candidates() {
        let mut listing = MockPeerListing::new();
        listing
            .expect_list()
            .returning(|| Err(Error::Directory("unreachable".to_string())));

        let directory = PeerDirectory::new(Arc::new(listing), "voice");
        let found = directory
            .discover(&PeerIdentity::new("voice-me-1"), |_| false)
            .await;
        assert!(found.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn http_listing_parses_json_array() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/peerjs/peers"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!(["voice-amy-2", "voice-bob-3"])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let listing = HttpPeerListing::with_url(
            format!("{}/peerjs/peers", server.uri()),
            Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(listing.list().await.unwrap(), ids(&["voice-amy-2", "voice-bob-3"]));
    }

    #[tokio::test]
    async fn http_error_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let listing =
            HttpPeerListing::with_url(format!("{}/peerjs/peers", server.uri()), Duration::from_secs(2))
                .unwrap();
        assert!(matches!(listing.list().await, Err(Error::Directory(_))));

        let directory = PeerDirectory::new(Arc::new(listing), "voice");
        assert!(directory.fetch().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>nope</html>"))
            .mount(&server)
            .await;

        let listing =
            HttpPeerListing::with_url(format!("{}/peerjs/peers", server.uri()), Duration::from_secs(2))
                .unwrap();
        assert!(matches!(listing.list().await, Err(Error::Directory(_))));
    }

    #[test]
    fn url_follows_settings() {
        let listing = HttpPeerListing::new(&SignalingSettings::default(), Duration::from_secs(1)).unwrap();
        assert_eq!(listing.url(), "http://localhost:9000/peerjs/peers");
    }
}

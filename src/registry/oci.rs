//! OCI distribution API client with bearer-token authentication

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, WWW_AUTHENTICATE};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::registry::client::{ManifestHead, RegistryClient};
use crate::registry::error::RegistryError;
use crate::registry::reference::is_docker_hub;

/// API host serving Docker Hub repositories
const DOCKER_HUB_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// Manifest media types we accept; multi-arch indexes first so their digest is reported
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";

const DIGEST_HEADER: &str = "docker-content-digest";

/// Token lifetime assumed when the auth server omits `expires_in`
const DEFAULT_TOKEN_EXPIRY_SECS: u64 = 60;

/// Tokens are discarded this long before they actually expire
const TOKEN_EXPIRY_SAFETY_MARGIN_SECS: u64 = 10;

/// Basic credentials exchanged for bearer tokens at an endpoint's auth realm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TagListResponse {
    tags: Option<Vec<String>>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
struct TokenCache {
    tokens: HashMap<String, CachedToken>,
}

impl TokenCache {
    fn get(&self, key: &str) -> Option<String> {
        self.tokens
            .get(key)
            .filter(|cached| cached.expires_at > Instant::now())
            .map(|cached| cached.token.clone())
    }

    fn insert(&mut self, key: String, token: String, expires_in_seconds: Option<u64>) {
        let expires_in = expires_in_seconds.unwrap_or(DEFAULT_TOKEN_EXPIRY_SECS);
        let expires_at = Instant::now()
            + Duration::from_secs(expires_in.saturating_sub(TOKEN_EXPIRY_SAFETY_MARGIN_SECS));

        self.tokens.retain(|_, cached| cached.expires_at > Instant::now());
        self.tokens.insert(key, CachedToken { token, expires_at });
    }

    fn clear(&mut self) {
        self.tokens.clear();
    }
}

/// Parameters of a `WWW-Authenticate: Bearer ...` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    /// Parses `Bearer realm="...",service="...",scope="..."`; quoted values may contain commas
    fn parse(header: &str) -> Option<Self> {
        let params = header.trim().strip_prefix("Bearer ")?;

        let mut values: HashMap<String, String> = HashMap::new();
        let mut chars = params.chars().peekable();
        loop {
            while chars.next_if(|c| *c == ',' || c.is_whitespace()).is_some() {}
            let key: String = std::iter::from_fn(|| chars.next_if(|c| *c != '=')).collect();
            if key.is_empty() || chars.next().is_none() {
                break;
            }
            let value: String = if chars.next_if_eq(&'"').is_some() {
                let value: String = std::iter::from_fn(|| chars.next_if(|c| *c != '"')).collect();
                chars.next();
                value
            } else {
                std::iter::from_fn(|| chars.next_if(|c| *c != ',')).collect()
            };
            values.insert(key.trim().to_ascii_lowercase(), value);
        }

        Some(Self {
            realm: values.remove("realm")?,
            service: values.remove("service"),
            scope: values.remove("scope"),
        })
    }
}

/// How a repository answered its first unauthenticated request
#[derive(Debug, Clone)]
enum AuthScheme {
    Anonymous,
    Bearer(BearerChallenge),
}

/// Registry client speaking the OCI distribution API
///
/// Tokens are cached per (endpoint, repository) and owned by this instance.
/// A token handshake only happens when no cached token exists, and only one
/// handshake per repository runs at a time. A 401 received
/// while using a cached token is handed back to the caller, who decides when
/// to call [`RegistryClient::invalidate_auth`].
pub struct OciRegistryClient {
    client: reqwest::Client,
    credentials: HashMap<String, BasicCredentials>,
    tokens: RwLock<TokenCache>,
    schemes: RwLock<HashMap<String, AuthScheme>>,
    handshakes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl OciRegistryClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(concat!("tag-monitor/", env!("CARGO_PKG_VERSION")))
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to create HTTP client"),
            credentials: HashMap::new(),
            tokens: RwLock::new(TokenCache::default()),
            schemes: RwLock::new(HashMap::new()),
            handshakes: Mutex::new(HashMap::new()),
        }
    }

    /// Registers credentials used when requesting tokens for `endpoint`
    pub fn with_credentials(mut self, endpoint: &str, credentials: BasicCredentials) -> Self {
        let key = if is_docker_hub(endpoint) {
            DOCKER_HUB_REGISTRY_URL.to_string()
        } else {
            Self::base_url(endpoint)
        };
        self.credentials.insert(key, credentials);
        self
    }

    /// Resolves the API base URL of an endpoint
    fn base_url(endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.trim_end_matches('/').to_string()
        } else if is_docker_hub(endpoint) {
            DOCKER_HUB_REGISTRY_URL.to_string()
        } else {
            format!("https://{}", endpoint.trim_end_matches('/'))
        }
    }

    fn token_key(base_url: &str, image: &str) -> String {
        format!("{}/{}", base_url, image)
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        accept: Option<&str>,
        token: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method, url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        request
    }

    /// Sends a request, performing the bearer handshake when the registry asks for it
    ///
    /// Handshakes are single-flight per token key: concurrent requests without a
    /// cached token wait for the first one to fetch it and then reuse it.
    async fn send(
        &self,
        method: Method,
        base_url: &str,
        image: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<Response, RegistryError> {
        let key = Self::token_key(base_url, image);

        let cached = self.tokens.read().await.get(&key);
        if let Some(token) = cached {
            return Ok(self.request(method, url, accept, Some(&token)).send().await?);
        }

        if matches!(self.schemes.read().await.get(&key), Some(AuthScheme::Anonymous)) {
            let response = self.request(method.clone(), url, accept, None).send().await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            let Some(challenge) = Self::bearer_challenge(response.headers()) else {
                return Ok(response);
            };
            self.schemes
                .write()
                .await
                .insert(key.clone(), AuthScheme::Bearer(challenge));
        }

        let handshake = self.handshake_lock(&key).await;
        let guard = handshake.lock().await;

        // Another request may have finished the handshake while we waited
        let cached = self.tokens.read().await.get(&key);
        if let Some(token) = cached {
            drop(guard);
            return Ok(self.request(method, url, accept, Some(&token)).send().await?);
        }

        let known = self.schemes.read().await.get(&key).cloned();
        let challenge = match known {
            Some(AuthScheme::Bearer(challenge)) => challenge,
            Some(AuthScheme::Anonymous) => {
                drop(guard);
                return Ok(self.request(method, url, accept, None).send().await?);
            }
            None => {
                let response = self.request(method.clone(), url, accept, None).send().await?;
                if response.status() != StatusCode::UNAUTHORIZED {
                    self.schemes
                        .write()
                        .await
                        .insert(key.clone(), AuthScheme::Anonymous);
                    return Ok(response);
                }
                let Some(challenge) = Self::bearer_challenge(response.headers()) else {
                    debug!("No bearer challenge in 401 response from {}", url);
                    return Ok(response);
                };
                self.schemes
                    .write()
                    .await
                    .insert(key.clone(), AuthScheme::Bearer(challenge.clone()));
                challenge
            }
        };

        let token = match self.fetch_token(base_url, image, &challenge).await {
            Ok(token) => token,
            Err(e) => {
                warn!("Failed to fetch registry token from {}: {}", challenge.realm, e);
                drop(guard);
                return Ok(self.request(method, url, accept, None).send().await?);
            }
        };
        drop(guard);

        Ok(self
            .request(method, url, accept, Some(&token))
            .send()
            .await?)
    }

    /// Per-key lock serializing token handshakes
    async fn handshake_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.handshakes
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn bearer_challenge(headers: &HeaderMap) -> Option<BearerChallenge> {
        headers
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse)
    }

    async fn fetch_token(
        &self,
        base_url: &str,
        image: &str,
        challenge: &BearerChallenge,
    ) -> Result<String, RegistryError> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", image));

        let mut query = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }

        let url = reqwest::Url::parse_with_params(&challenge.realm, &query)
            .map_err(|e| RegistryError::InvalidResponse(format!("invalid realm: {}", e)))?;

        let mut request = self.client.get(url);
        if let Some(credentials) = self.credentials.get(base_url) {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Unauthorized(format!(
                "token endpoint returned status {}",
                status
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::InvalidResponse(e.to_string()))?;

        let token = body.token.or(body.access_token).ok_or_else(|| {
            RegistryError::InvalidResponse("token response without token".to_string())
        })?;

        debug!("Fetched registry token for {}/{}", base_url, image);
        self.tokens.write().await.insert(
            Self::token_key(base_url, image),
            token.clone(),
            body.expires_in,
        );

        Ok(token)
    }
}

impl Default for OciRegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RegistryClient for OciRegistryClient {
    async fn head_manifest(
        &self,
        endpoint: &str,
        image: &str,
        tag: &str,
    ) -> Result<ManifestHead, RegistryError> {
        let base_url = Self::base_url(endpoint);
        let url = format!("{}/v2/{}/manifests/{}", base_url, image, tag);

        let response = self
            .send(Method::HEAD, &base_url, image, &url, Some(MANIFEST_ACCEPT))
            .await?;

        let status = response.status();
        let digest = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if status.is_success() && digest.is_none() {
            warn!("Registry returned no digest header for {}", url);
        }

        Ok(ManifestHead {
            exists: status.is_success(),
            digest,
            status_code: status.as_u16(),
        })
    }

    async fn list_tags(&self, endpoint: &str, image: &str) -> Result<Vec<String>, RegistryError> {
        let base_url = Self::base_url(endpoint);
        let url = format!("{}/v2/{}/tags/list", base_url, image);

        let response = self
            .send(Method::GET, &base_url, image, &url, None)
            .await?;

        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(format!("{}/{}", endpoint, image)));
        }

        if status == StatusCode::UNAUTHORIZED {
            return Err(RegistryError::Unauthorized(format!("{}/{}", endpoint, image)));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(RegistryError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !status.is_success() {
            warn!("Registry returned status {}: {}", status, url);
            return Err(RegistryError::InvalidResponse(format!(
                "Unexpected status: {}",
                status
            )));
        }

        let tag_list: TagListResponse = response.json().await.map_err(|e| {
            warn!("Failed to parse tag list response: {}", e);
            RegistryError::InvalidResponse(e.to_string())
        })?;

        Ok(tag_list.tags.unwrap_or_default())
    }

    async fn invalidate_auth(&self) {
        self.tokens.write().await.clear();
        debug!("Cleared registry token cache");
    }
}

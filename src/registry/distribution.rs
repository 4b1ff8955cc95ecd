//! OCI distribution API over HTTP
//!
//! Implements [`RegistryProtocol`] against `/v2/` endpoints:
//! - manifests: HEAD/GET/PUT `/v2/{name}/manifests/{reference}`
//! - blobs: HEAD/GET `/v2/{name}/blobs/{digest}`, monolithic upload and
//!   cross-repository mount via `/v2/{name}/blobs/uploads/`
//! - tags: GET `/v2/{name}/tags/list`, following `Link` pagination
//!
//! Authentication is driven by `WWW-Authenticate` challenges. Credentials are
//! resolved from the keychain when a challenge arrives; bearer tokens are
//! cached per host and scope until the registry rejects them.
//!
//! Registries marked insecure are tried over https first; once https fails to
//! connect, the host is remembered and spoken to over plain HTTP.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, LINK, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::{RegistryError, Result};
use crate::reference::{Reference, Repository};
use crate::registry::auth::{Credential, CredentialProvider, resolve_in_scope};
use crate::registry::protocol::{Descriptor, Manifest, RegistryProtocol, media_types, sha256_digest};

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
const OCTET_STREAM: &str = "application/octet-stream";
const TOKEN_CLIENT_ID: &str = env!("CARGO_PKG_NAME");

#[derive(Debug, Clone, PartialEq, Eq)]
enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
    },
    Basic,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Access requested for a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Pull,
    Push,
}

impl Access {
    fn scope(self, repository: &Repository) -> String {
        match self {
            Access::Pull => format!("repository:{}:pull", repository.name()),
            Access::Push => format!("repository:{}:pull,push", repository.name()),
        }
    }
}

/// HTTP implementation of [`RegistryProtocol`]
pub struct HttpDistribution {
    client: Client,
    keychain: Arc<dyn CredentialProvider>,
    tokens: RwLock<HashMap<(String, String), String>>,
    plain_http: RwLock<HashSet<String>>,
}

impl HttpDistribution {
    pub fn new(client: Client, keychain: Arc<dyn CredentialProvider>) -> Self {
        Self {
            client,
            keychain,
            tokens: RwLock::new(HashMap::new()),
            plain_http: RwLock::new(HashSet::new()),
        }
    }

    fn manifest_url(reference: &Reference) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            reference.registry().base_url(),
            reference.repository().name(),
            reference.identifier()
        )
    }

    fn blob_url(repository: &Repository, digest: &str) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            repository.registry().base_url(),
            repository.name(),
            digest
        )
    }

    fn uploads_url(repository: &Repository) -> String {
        format!(
            "{}/v2/{}/blobs/uploads/",
            repository.registry().base_url(),
            repository.name()
        )
    }

    fn cached_token(&self, host: &str, scopes: &[String]) -> Option<String> {
        let guard = self.tokens.read().ok()?;
        let token = guard.get(&(host.to_string(), scopes.join(" "))).cloned();
        token
    }

    fn store_token(&self, host: &str, scopes: &[String], token: String) {
        if let Ok(mut guard) = self.tokens.write() {
            guard.insert((host.to_string(), scopes.join(" ")), token);
        }
    }

    /// Send a request, answering one auth challenge if the registry issues it.
    ///
    /// `build` is invoked once per attempt with the URL to use, so bodies can be
    /// re-sent and insecure registries retried over plain HTTP. Registry
    /// credentials only go to the registry's own host; other hosts, such as
    /// upload locations on external storage, get the bare request.
    async fn send<F>(
        &self,
        repository: &Repository,
        scopes: &[String],
        operation: &str,
        url: &str,
        build: F,
    ) -> Result<Response>
    where
        F: Fn(&Client, &str) -> RequestBuilder + Send + Sync,
    {
        let registry = repository.registry();
        let host = registry.host();
        let mut url = self.effective_url(host, url);

        if !same_host(&url, host) {
            debug!(host, url = %url, "request leaves the registry host, sending without credentials");
            return build(&self.client, &url)
                .send()
                .await
                .map_err(|e| NetworkErrorHandler::handle_network_error(e, operation, &url));
        }

        let token = self.cached_token(host, scopes);
        let response = match with_bearer(build(&self.client, &url), token.as_deref()).send().await {
            Ok(response) => response,
            Err(e) if registry.is_insecure() && url.starts_with("https://") => {
                debug!(host, error = %e, "https unreachable on insecure registry, falling back to http");
                self.mark_plain_http(host);
                url = self.effective_url(host, &url);
                with_bearer(build(&self.client, &url), token.as_deref())
                    .send()
                    .await
                    .map_err(|e| NetworkErrorHandler::handle_network_error(e, operation, &url))?
            }
            Err(e) => return Err(NetworkErrorHandler::handle_network_error(e, operation, &url)),
        };

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(challenge) = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge)
        else {
            return Ok(response);
        };
        debug!(host, ?challenge, "registry requested authentication");

        let credential = resolve_in_scope(self.keychain.as_ref(), host).await?;
        let request = match (&challenge, credential) {
            (_, Some(Credential::RegistryToken(token))) => build(&self.client, &url).bearer_auth(token),
            (Challenge::Bearer { realm, service }, credential) => {
                let token = self
                    .fetch_token(realm, service.as_deref(), scopes, credential.as_ref())
                    .await?;
                self.store_token(host, scopes, token.clone());
                build(&self.client, &url).bearer_auth(token)
            }
            (Challenge::Basic, Some(Credential::Basic { username, password })) => {
                build(&self.client, &url).basic_auth(username, Some(password))
            }
            (Challenge::Basic, _) => return Ok(response),
        };

        request
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(e, operation, &url))
    }

    fn mark_plain_http(&self, host: &str) {
        if let Ok(mut hosts) = self.plain_http.write() {
            hosts.insert(host.to_string());
        }
    }

    /// `url`, downgraded to http once `host` is known to serve only plain HTTP
    fn effective_url(&self, host: &str, url: &str) -> String {
        let plain = self
            .plain_http
            .read()
            .map(|hosts| hosts.contains(host))
            .unwrap_or(false);
        match url.strip_prefix("https://") {
            Some(rest) if plain && same_host(url, host) => format!("http://{}", rest),
            _ => url.to_string(),
        }
    }

    async fn fetch_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scopes: &[String],
        credential: Option<&Credential>,
    ) -> Result<String> {
        let mut url = Url::parse(realm).map_err(|e| {
            RegistryError::protocol("Parsing token realm", realm, e.to_string())
        })?;

        let request = match credential {
            Some(Credential::IdentityToken(refresh_token)) => {
                let mut form = vec![
                    ("grant_type", "refresh_token".to_string()),
                    ("refresh_token", refresh_token.clone()),
                    ("client_id", TOKEN_CLIENT_ID.to_string()),
                ];
                form.extend(service.map(|s| ("service", s.to_string())));
                form.push(("scope", scopes.join(" ")));
                self.client.post(url.clone()).form(&form)
            }
            other => {
                {
                    let mut query = url.query_pairs_mut();
                    if let Some(service) = service {
                        query.append_pair("service", service);
                    }
                    for scope in scopes {
                        query.append_pair("scope", scope);
                    }
                }
                let request = self.client.get(url.clone());
                match other {
                    Some(Credential::Basic { username, password }) => {
                        request.basic_auth(username, Some(password))
                    }
                    _ => request,
                }
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(e, "token request", realm))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_auth_error(status, &text, realm));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            RegistryError::protocol("Parsing token response from", realm, e.to_string())
        })?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RegistryError::protocol("Parsing token response from", realm, "no token in response"))
    }

    async fn expect_success(response: Response, operation: &str, target: &str) -> Result<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Err(HttpErrorHandler::handle_registry_error(status, &text, operation, target))
    }

    /// Resolve a possibly relative `Location`/`Link` target against the registry
    fn resolve_location(repository: &Repository, location: &str, operation: &str) -> Result<Url> {
        let base = Url::parse(&repository.registry().base_url()).map_err(|e| {
            RegistryError::protocol(operation, repository.to_string(), e.to_string())
        })?;
        base.join(location).map_err(|e| {
            RegistryError::protocol(operation, repository.to_string(), format!("bad location '{}': {}", location, e))
        })
    }
}

#[async_trait]
impl RegistryProtocol for HttpDistribution {
    async fn head_manifest(&self, reference: &Reference) -> Result<Descriptor> {
        let url = Self::manifest_url(reference);
        let scopes = [Access::Pull.scope(reference.repository())];
        let accept = media_types::ACCEPTED_MANIFESTS.join(", ");

        let response = self
            .send(reference.repository(), &scopes, "HEAD manifest", &url, |c, url| {
                c.head(url).header(ACCEPT, accept.as_str())
            })
            .await?;

        // Some registries reject HEAD or omit the digest header; fall back to GET.
        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            return Ok(self.get_manifest(reference).await?.descriptor());
        }
        let response = Self::expect_success(response, "HEAD manifest", &reference.to_string()).await?;

        let headers = response.headers();
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
        let digest = header(DOCKER_CONTENT_DIGEST);
        let media_type = content_type(headers);
        let size = header(CONTENT_LENGTH.as_str()).and_then(|s| s.parse::<u64>().ok());

        match (digest, media_type, size) {
            (Some(digest), Some(media_type), Some(size)) if media_type != "application/json" => Ok(Descriptor {
                media_type,
                size,
                digest,
                platform: None,
            }),
            _ => Ok(self.get_manifest(reference).await?.descriptor()),
        }
    }

    async fn get_manifest(&self, reference: &Reference) -> Result<Manifest> {
        let url = Self::manifest_url(reference);
        let target = reference.to_string();
        let scopes = [Access::Pull.scope(reference.repository())];
        let accept = media_types::ACCEPTED_MANIFESTS.join(", ");

        let response = self
            .send(reference.repository(), &scopes, "GET manifest", &url, |c, url| {
                c.get(url).header(ACCEPT, accept.as_str())
            })
            .await?;
        let response = Self::expect_success(response, "GET manifest", &target).await?;

        let media_type = content_type(response.headers());
        let data = response
            .bytes()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(e, "reading manifest", &url))?;

        let media_type = match media_type {
            Some(media_type) if media_type != "application/json" => media_type,
            _ => sniff_media_type(&data).ok_or_else(|| {
                RegistryError::protocol("GET manifest", &target, "response has no usable media type")
            })?,
        };

        let manifest = Manifest::new(media_type, data);
        if let Reference::Digest(digest) = reference {
            let actual = manifest.digest();
            if actual != digest.digest() {
                return Err(RegistryError::protocol(
                    "GET manifest",
                    &target,
                    format!("content digest {} does not match", actual),
                ));
            }
        }
        Ok(manifest)
    }

    async fn put_manifest(&self, reference: &Reference, manifest: &Manifest) -> Result<()> {
        let url = Self::manifest_url(reference);
        let scopes = [Access::Push.scope(reference.repository())];

        let response = self
            .send(reference.repository(), &scopes, "PUT manifest", &url, |c, url| {
                c.put(url)
                    .header(CONTENT_TYPE, manifest.media_type.as_str())
                    .body(manifest.data.clone())
            })
            .await?;
        Self::expect_success(response, "PUT manifest", &reference.to_string()).await?;
        debug!(reference = %reference, digest = %manifest.digest(), "manifest uploaded");
        Ok(())
    }

    async fn blob_exists(&self, repository: &Repository, digest: &str) -> Result<bool> {
        let url = Self::blob_url(repository, digest);
        let scopes = [Access::Push.scope(repository)];

        let response = self
            .send(repository, &scopes, "HEAD blob", &url, |c, url| c.head(url))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            _ => {
                let target = format!("{}@{}", repository, digest);
                Self::expect_success(response, "HEAD blob", &target).await.map(|_| true)
            }
        }
    }

    async fn get_blob(&self, repository: &Repository, digest: &str) -> Result<Bytes> {
        let url = Self::blob_url(repository, digest);
        let target = format!("{}@{}", repository, digest);
        let scopes = [Access::Pull.scope(repository)];

        let response = self
            .send(repository, &scopes, "GET blob", &url, |c, url| c.get(url))
            .await?;
        let response = Self::expect_success(response, "GET blob", &target).await?;
        let data = response
            .bytes()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(e, "reading blob", &url))?;

        if digest.starts_with("sha256:") && sha256_digest(&data) != digest {
            return Err(RegistryError::protocol("GET blob", &target, "content does not match digest"));
        }
        Ok(data)
    }

    async fn put_blob(&self, repository: &Repository, digest: &str, data: Bytes) -> Result<()> {
        let target = format!("{}@{}", repository, digest);
        let scopes = [Access::Push.scope(repository)];
        let start_url = Self::uploads_url(repository);

        let response = self
            .send(repository, &scopes, "POST blob upload", &start_url, |c, url| {
                c.post(url).header(CONTENT_LENGTH, "0")
            })
            .await?;
        let response = Self::expect_success(response, "POST blob upload", &target).await?;
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::protocol("POST blob upload", &target, "no Location header in response"))?;

        let mut upload_url = Self::resolve_location(repository, location, "POST blob upload")?;
        upload_url.query_pairs_mut().append_pair("digest", digest);
        let upload_url = upload_url.to_string();

        let response = self
            .send(repository, &scopes, "PUT blob", &upload_url, |c, url| {
                c.put(url)
                    .header(CONTENT_TYPE, OCTET_STREAM)
                    .body(data.clone())
            })
            .await?;
        Self::expect_success(response, "PUT blob", &target).await?;
        debug!(blob = %target, bytes = data.len(), "blob uploaded");
        Ok(())
    }

    async fn mount_blob(&self, repository: &Repository, from: &Repository, digest: &str) -> Result<bool> {
        let target = format!("{}@{}", repository, digest);
        let scopes = [Access::Push.scope(repository), Access::Pull.scope(from)];
        let mut url = Url::parse(&Self::uploads_url(repository))
            .map_err(|e| RegistryError::protocol("POST blob mount", &target, e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("mount", digest)
            .append_pair("from", from.name());
        let url = url.to_string();

        let response = self
            .send(repository, &scopes, "POST blob mount", &url, |c, url| {
                c.post(url).header(CONTENT_LENGTH, "0")
            })
            .await?;
        match response.status() {
            StatusCode::CREATED => Ok(true),
            StatusCode::ACCEPTED => Ok(false),
            _ => Self::expect_success(response, "POST blob mount", &target).await.map(|_| false),
        }
    }

    async fn list_tags(&self, repository: &Repository) -> Result<Vec<String>> {
        let target = repository.to_string();
        let scopes = [Access::Pull.scope(repository)];
        let mut next = Some(format!(
            "{}/v2/{}/tags/list",
            repository.registry().base_url(),
            repository.name()
        ));
        let mut tags = Vec::new();

        while let Some(url) = next.take() {
            let response = self
                .send(repository, &scopes, "GET tags", &url, |c, url| c.get(url))
                .await?;
            let response = Self::expect_success(response, "GET tags", &target).await?;

            let link = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_next_link)
                .map(str::to_string);
            let page: TagList = response
                .json()
                .await
                .map_err(|e| RegistryError::protocol("GET tags", &target, format!("invalid tag list: {}", e)))?;
            tags.extend(page.tags.unwrap_or_default());

            if let Some(link) = link {
                next = Some(Self::resolve_location(repository, &link, "GET tags")?.to_string());
            }
        }

        debug!(repository = %target, count = tags.len(), "listed tags");
        Ok(tags)
    }
}

fn with_bearer(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

/// True when `url` targets `host` (`name[:port]`), default ports included
fn same_host(url: &str, host: &str) -> bool {
    let Ok(url) = Url::parse(url) else {
        return false;
    };
    let Ok(registry) = Url::parse(&format!("{}://{}", url.scheme(), host)) else {
        return false;
    };
    url.host_str().is_some_and(|h| registry.host_str().is_some_and(|r| h.eq_ignore_ascii_case(r)))
        && url.port_or_known_default() == registry.port_or_known_default()
}

/// `Content-Type` without parameters such as `charset`
fn content_type(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    let media_type = value.split(';').next().unwrap_or(value).trim();
    (!media_type.is_empty()).then(|| media_type.to_string())
}

/// Parse a `WWW-Authenticate` value; commas inside quoted values are kept
fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

    if scheme.eq_ignore_ascii_case("basic") {
        return Some(Challenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let params = parse_params(params);
    let realm = params.get("realm")?.to_string();
    Some(Challenge::Bearer {
        realm,
        service: params.get("service").map(|s| s.to_string()),
    })
}

fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after = after.trim_start();

        let (value, remainder) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };

        params.insert(key, value.trim().to_string());
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }
    params
}

/// Target of `rel="next"` in a `Link` header
fn parse_next_link(header: &str) -> Option<&str> {
    header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|p| p.trim().replace(' ', "") == "rel=\"next\"" || p.trim() == "rel=next");
        is_next.then(|| target.trim().trim_start_matches('<').trim_end_matches('>'))
    })
}

/// Media type from the manifest body when the registry does not send one
fn sniff_media_type(data: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Shape {
        media_type: Option<String>,
        manifests: Option<serde_json::Value>,
        config: Option<serde_json::Value>,
    }

    let shape: Shape = serde_json::from_slice(data).ok()?;
    match shape {
        Shape { media_type: Some(mt), .. } => Some(mt),
        Shape { manifests: Some(_), .. } => Some(media_types::OCI_INDEX.to_string()),
        Shape { config: Some(_), .. } => Some(media_types::OCI_MANIFEST.to_string()),
        _ => None,
    }
}

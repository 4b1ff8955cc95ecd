//! Credential resolution for registry hosts
//!
//! A keychain is an ordered list of [`CredentialProvider`]s. The first provider
//! that yields a credential for a host wins; when none does, access is anonymous.
//! The stock chain is the environment-derived source followed by the default
//! source (docker `config.json`, credential helpers, containers `auth.json`).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{RegistryError, Result};
use crate::reference::DEFAULT_REGISTRY;

const DOCKER_HUB_CONFIG_KEY: &str = "https://index.docker.io/v1/";

/// Authentication material for one registry host
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { username: String, password: String },
    /// OAuth2 refresh token exchanged at the registry's token endpoint
    IdentityToken(String),
    /// Bearer token sent to the registry as-is
    RegistryToken(String),
}

impl Credential {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credential::Basic { .. } => "basic",
            Credential::IdentityToken(_) => "identity-token",
            Credential::RegistryToken(_) => "registry-token",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credential::IdentityToken(_) => f.write_str("IdentityToken(<redacted>)"),
            Credential::RegistryToken(_) => f.write_str("RegistryToken(<redacted>)"),
        }
    }
}

/// A source of credentials keyed by registry host (`host[:port]`)
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// `Ok(None)` means this source has nothing for `host`
    async fn resolve(&self, host: &str) -> Result<Option<Credential>>;

    fn name(&self) -> &str;
}

/// Sequential fallback over an ordered list of providers
#[derive(Clone, Default)]
pub struct MultiKeychain {
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl MultiKeychain {
    pub fn new(providers: Vec<Arc<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }

    /// Environment variables for `env_prefix`, then the process-wide default source
    pub fn standard(env_prefix: &str) -> Self {
        let providers: Vec<Arc<dyn CredentialProvider>> =
            vec![Arc::new(EnvKeychain::new(env_prefix)), default_keychain()];
        Self::new(providers)
    }

    pub fn push(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.providers.push(provider);
        self
    }
}

#[async_trait]
impl CredentialProvider for MultiKeychain {
    async fn resolve(&self, host: &str) -> Result<Option<Credential>> {
        for provider in &self.providers {
            if let Some(credential) = provider.resolve(host).await? {
                debug!(host, source = provider.name(), kind = credential.kind(), "resolved registry credentials");
                return Ok(Some(credential));
            }
        }
        debug!(host, "no credentials found, using anonymous access");
        Ok(None)
    }

    fn name(&self) -> &str {
        "multi"
    }
}

type ResolvedCell = Arc<OnceCell<Option<Credential>>>;

tokio::task_local! {
    static OPERATION_CREDENTIALS: CredentialScope;
}

/// Credentials resolved during one client operation, one lookup per host
#[derive(Clone, Default)]
struct CredentialScope {
    hosts: Arc<Mutex<HashMap<String, ResolvedCell>>>,
}

impl CredentialScope {
    fn cell(&self, host: &str) -> ResolvedCell {
        match self.hosts.lock() {
            Ok(mut hosts) => hosts.entry(host.to_string()).or_default().clone(),
            Err(_) => Arc::new(OnceCell::new()),
        }
    }
}

/// Run `operation` so that each registry host is looked up at most once
/// through [`resolve_in_scope`], however many requests it challenges.
pub async fn with_credential_scope<F: Future>(operation: F) -> F::Output {
    OPERATION_CREDENTIALS
        .scope(CredentialScope::default(), operation)
        .await
}

/// Resolve `host` through `provider`, reusing the answer already found in the
/// enclosing [`with_credential_scope`]. Failed lookups are not remembered.
pub async fn resolve_in_scope(provider: &dyn CredentialProvider, host: &str) -> Result<Option<Credential>> {
    match OPERATION_CREDENTIALS.try_with(|scope| scope.cell(host)) {
        Ok(cell) => cell.get_or_try_init(|| provider.resolve(host)).await.cloned(),
        Err(_) => provider.resolve(host).await,
    }
}

/// Credentials from `<PREFIX>_REGISTRY_<HOST>_{USERNAME,PASSWORD,IDENTITY_TOKEN,TOKEN}`.
///
/// `HOST` is the registry host upper-cased with every non-alphanumeric
/// character replaced by `_`, so `my.registry.com:5000` becomes
/// `MY_REGISTRY_COM_5000`.
#[derive(Debug, Clone)]
pub struct EnvKeychain {
    prefix: String,
    vars: Option<HashMap<String, String>>,
}

impl EnvKeychain {
    /// Reads the process environment on every lookup
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            vars: None,
        }
    }

    /// Reads from a fixed variable set instead of the process environment
    pub fn from_vars<I, K, V>(prefix: impl Into<String>, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            prefix: prefix.into(),
            vars: Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
        }
    }

    /// Variable name for `field` (e.g. `USERNAME`) of `host`
    pub fn variable_name(&self, host: &str, field: &str) -> String {
        let host: String = host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        if self.prefix.is_empty() {
            format!("REGISTRY_{}_{}", host, field)
        } else {
            format!("{}_REGISTRY_{}_{}", self.prefix, host, field)
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        let value = match &self.vars {
            Some(vars) => vars.get(name).cloned(),
            None => std::env::var(name).ok(),
        };
        value.filter(|v| !v.is_empty())
    }

    fn lookup(&self, host: &str) -> Result<Option<Credential>> {
        let username_var = self.variable_name(host, "USERNAME");
        let password_var = self.variable_name(host, "PASSWORD");

        match (self.var(&username_var), self.var(&password_var)) {
            (Some(username), Some(password)) => return Ok(Some(Credential::Basic { username, password })),
            (Some(_), None) => {
                return Err(RegistryError::Credentials {
                    host: host.to_string(),
                    message: format!("{} is set but {} is not", username_var, password_var),
                });
            }
            (None, Some(_)) => {
                return Err(RegistryError::Credentials {
                    host: host.to_string(),
                    message: format!("{} is set but {} is not", password_var, username_var),
                });
            }
            (None, None) => {}
        }

        if let Some(token) = self.var(&self.variable_name(host, "IDENTITY_TOKEN")) {
            return Ok(Some(Credential::IdentityToken(token)));
        }
        Ok(self
            .var(&self.variable_name(host, "TOKEN"))
            .map(Credential::RegistryToken))
    }
}

#[async_trait]
impl CredentialProvider for EnvKeychain {
    async fn resolve(&self, host: &str) -> Result<Option<Credential>> {
        self.lookup(host)
    }

    fn name(&self) -> &str {
        "environment"
    }
}

#[derive(Debug, Default, Deserialize)]
struct AuthFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    #[serde(default, rename = "credsStore")]
    creds_store: Option<String>,
    #[serde(default, rename = "credHelpers")]
    cred_helpers: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
    identitytoken: Option<String>,
    registrytoken: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelperResponse {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

/// Locally stored login credentials, as written by `docker login` / `podman login`.
///
/// Files are consulted in order and read on every lookup. A missing file is
/// skipped; a malformed one is an error.
#[derive(Debug, Clone)]
pub struct DockerConfigKeychain {
    paths: Vec<PathBuf>,
}

impl DockerConfigKeychain {
    /// Docker config (`$DOCKER_CONFIG/config.json` or `~/.docker/config.json`),
    /// then `$REGISTRY_AUTH_FILE`, then `$XDG_RUNTIME_DIR/containers/auth.json`
    pub fn from_environment() -> Self {
        let env = |name: &str| std::env::var_os(name).filter(|v| !v.is_empty()).map(PathBuf::from);

        let docker_dir = env("DOCKER_CONFIG").or_else(|| {
            env("HOME")
                .or_else(|| env("USERPROFILE"))
                .map(|home| home.join(".docker"))
        });

        let mut paths = Vec::new();
        paths.extend(docker_dir.map(|dir| dir.join("config.json")));
        paths.extend(env("REGISTRY_AUTH_FILE"));
        paths.extend(env("XDG_RUNTIME_DIR").map(|dir| dir.join("containers").join("auth.json")));
        Self { paths }
    }

    pub fn with_paths(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    async fn read_file(path: &Path) -> Result<Option<AuthFile>> {
        let contents = match tokio::fs::read(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RegistryError::Credentials {
                    host: path.display().to_string(),
                    message: format!("reading auth file: {}", e),
                });
            }
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|e| RegistryError::Credentials {
                host: path.display().to_string(),
                message: format!("parsing auth file: {}", e),
            })
    }

    async fn lookup_file(&self, path: &Path, host: &str) -> Result<Option<Credential>> {
        let Some(file) = Self::read_file(path).await? else {
            return Ok(None);
        };

        let helper = file
            .cred_helpers
            .get(host)
            .or(file.creds_store.as_ref())
            .filter(|helper| !helper.is_empty());
        if let Some(helper) = helper {
            return run_credential_helper(helper, &config_key(host)).await;
        }

        let Some(entry) = find_entry(&file.auths, host) else {
            return Ok(None);
        };
        entry_credential(entry, host)
    }
}

#[async_trait]
impl CredentialProvider for DockerConfigKeychain {
    async fn resolve(&self, host: &str) -> Result<Option<Credential>> {
        for path in &self.paths {
            if let Some(credential) = self.lookup_file(path, host).await? {
                debug!(host, path = %path.display(), "found stored registry login");
                return Ok(Some(credential));
            }
        }
        Ok(None)
    }

    fn name(&self) -> &str {
        "default"
    }
}

/// Process-wide default credential source, built once on first use
pub fn default_keychain() -> Arc<dyn CredentialProvider> {
    static DEFAULT: OnceLock<Arc<DockerConfigKeychain>> = OnceLock::new();
    DEFAULT
        .get_or_init(|| Arc::new(DockerConfigKeychain::from_environment()))
        .clone()
}

/// Docker Hub logins are stored under the legacy v1 index URL
fn config_key(host: &str) -> String {
    if host == DEFAULT_REGISTRY || host == "registry-1.docker.io" {
        DOCKER_HUB_CONFIG_KEY.to_string()
    } else {
        host.to_string()
    }
}

/// Match `host` against keys that may carry a scheme or path
fn find_entry<'a>(auths: &'a HashMap<String, AuthEntry>, host: &str) -> Option<&'a AuthEntry> {
    let wanted = config_key(host);
    if let Some(entry) = auths.get(&wanted) {
        return Some(entry);
    }
    let wanted_host = normalize_key(&wanted);
    auths
        .iter()
        .find(|(key, _)| normalize_key(key) == wanted_host)
        .map(|(_, entry)| entry)
}

fn normalize_key(key: &str) -> &str {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    key.split('/').next().unwrap_or(key)
}

fn entry_credential(entry: &AuthEntry, host: &str) -> Result<Option<Credential>> {
    if let Some(token) = entry.registrytoken.as_ref().filter(|t| !t.is_empty()) {
        return Ok(Some(Credential::RegistryToken(token.clone())));
    }
    if let Some(token) = entry.identitytoken.as_ref().filter(|t| !t.is_empty()) {
        return Ok(Some(Credential::IdentityToken(token.clone())));
    }
    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        if !username.is_empty() {
            return Ok(Some(Credential::basic(username.clone(), password.clone())));
        }
    }

    let Some(auth) = entry.auth.as_ref().filter(|a| !a.is_empty()) else {
        return Ok(None);
    };
    let decoded = STANDARD.decode(auth.trim()).map_err(|e| RegistryError::Credentials {
        host: host.to_string(),
        message: format!("invalid base64 in stored auth: {}", e),
    })?;
    let decoded = String::from_utf8(decoded).map_err(|_| RegistryError::Credentials {
        host: host.to_string(),
        message: "stored auth is not valid UTF-8".to_string(),
    })?;
    match decoded.split_once(':') {
        Some((username, password)) => Ok(Some(Credential::basic(username, password))),
        None => Err(RegistryError::Credentials {
            host: host.to_string(),
            message: "stored auth is not in username:password form".to_string(),
        }),
    }
}

/// Run `docker-credential-<helper> get`, feeding the server URL on stdin
async fn run_credential_helper(helper: &str, server: &str) -> Result<Option<Credential>> {
    let program = format!("docker-credential-{}", helper);
    let helper_error = |message: String| RegistryError::Credentials {
        host: server.to_string(),
        message: format!("{}: {}", program, message),
    };

    let mut child = match tokio::process::Command::new(&program)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(helper = %program, "credential helper not installed");
            return Ok(None);
        }
        Err(e) => return Err(helper_error(e.to_string())),
    };

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(server.as_bytes())
            .await
            .map_err(|e| helper_error(e.to_string()))?;
    }
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| helper_error(e.to_string()))?;

    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.contains("credentials not found") {
            return Ok(None);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(helper_error(format!("exited with {}: {}", output.status, stderr.trim())));
    }

    let response: HelperResponse =
        serde_json::from_slice(&output.stdout).map_err(|e| helper_error(format!("invalid response: {}", e)))?;
    if response.username == "<token>" {
        Ok(Some(Credential::IdentityToken(response.secret)))
    } else {
        Ok(Some(Credential::Basic {
            username: response.username,
            password: response.secret,
        }))
    }
}

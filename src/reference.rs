//! OCI image reference parsing.
//!
//! Handles Docker-style references and normalizes them:
//! - `ubuntu` → `index.docker.io/library/ubuntu:latest`
//! - `ghcr.io/org/app:v1` → `ghcr.io/org/app:v1`
//! - `localhost:5000/app@sha256:…` → digest reference on `localhost:5000`
//!
//! A leading `https://` is accepted and dropped. A leading `http://` marks the
//! registry as plain-HTTP and is rejected unless [`ParseOptions::insecure`] is set.

use std::fmt;
use std::net::IpAddr;

use crate::error::{RegistryError, Result};

pub const DEFAULT_REGISTRY: &str = "index.docker.io";
pub const DEFAULT_TAG: &str = "latest";
const OFFICIAL_REPO_PREFIX: &str = "library";
const MAX_REPOSITORY_LENGTH: usize = 255;
const MAX_TAG_LENGTH: usize = 128;

/// Reference-parsing policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseOptions {
    /// Permit plain-HTTP registries
    pub insecure: bool,
}

/// A registry host, optionally with port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Registry {
    host: String,
    insecure: bool,
    plain_http: bool,
}

impl Registry {
    pub fn parse(input: &str, options: &ParseOptions) -> Result<Self> {
        let (rest, plain_http) = strip_scheme(input, options)?;
        if rest.contains('/') {
            return Err(RegistryError::reference(input, "registry must not contain a path"));
        }
        Self::from_host(input, rest, plain_http, options)
    }

    fn from_host(input: &str, host: &str, plain_http: bool, options: &ParseOptions) -> Result<Self> {
        if host.is_empty() {
            return Err(RegistryError::reference(input, "empty registry host"));
        }
        if !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '[' | ']'))
        {
            return Err(RegistryError::reference(input, format!("invalid registry host '{}'", host)));
        }

        let host = match host {
            "docker.io" => DEFAULT_REGISTRY.to_string(),
            other => other.to_string(),
        };

        Ok(Self {
            host,
            insecure: options.insecure,
            plain_http,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_insecure(&self) -> bool {
        self.insecure
    }

    /// `http` only for insecure registries given as `http://` or living on a local
    /// host; other insecure registries start on https and fall back on connect failure
    pub fn scheme(&self) -> &'static str {
        if self.plain_http || (self.insecure && is_local_host(&self.host)) {
            "http"
        } else {
            "https"
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme(), self.host)
    }
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)
    }
}

/// A repository within a registry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Repository {
    registry: Registry,
    name: String,
}

impl Repository {
    pub fn parse(input: &str, options: &ParseOptions) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.contains('@') {
            return Err(RegistryError::reference(input, "repository must not carry a digest"));
        }
        Self::parse_name(input, trimmed, options)
    }

    fn parse_name(input: &str, name: &str, options: &ParseOptions) -> Result<Self> {
        if name.is_empty() {
            return Err(RegistryError::reference(input, "empty reference"));
        }
        let (rest, plain_http) = strip_scheme(name, options)?;
        let explicit_host = rest.len() != name.len();

        let (registry, path) = match rest.split_once('/') {
            Some((first, path)) if explicit_host || looks_like_host(first) => {
                (Registry::from_host(input, first, plain_http, options)?, path)
            }
            _ if explicit_host => {
                return Err(RegistryError::reference(input, "missing repository name"));
            }
            _ => (
                Registry::from_host(input, DEFAULT_REGISTRY, false, options)?,
                rest,
            ),
        };

        let name = if registry.host == DEFAULT_REGISTRY && !path.contains('/') {
            format!("{}/{}", OFFICIAL_REPO_PREFIX, path)
        } else {
            path.to_string()
        };
        validate_repository_name(input, &name)?;

        Ok(Self { registry, name })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Digest reference within this repository. `digest` is taken as-is.
    pub fn at_digest(&self, digest: &str) -> Digest {
        Digest {
            repository: self.clone(),
            digest: digest.to_string(),
        }
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.name)
    }
}

/// A mutable tag in a repository
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    repository: Repository,
    tag: String,
}

impl Tag {
    pub fn parse(input: &str, options: &ParseOptions) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.contains('@') {
            return Err(RegistryError::reference(input, "tag reference must not carry a digest"));
        }
        let (name, tag) = split_tag(trimmed);
        let tag = tag.unwrap_or(DEFAULT_TAG);
        validate_tag(input, tag)?;

        Ok(Self {
            repository: Repository::parse_name(input, name, options)?,
            tag: tag.to_string(),
        })
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// An immutable, content-addressed reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    repository: Repository,
    digest: String,
}

impl Digest {
    pub fn parse(input: &str, options: &ParseOptions) -> Result<Self> {
        let trimmed = input.trim();
        let Some((name, digest)) = trimmed.split_once('@') else {
            return Err(RegistryError::reference(input, "digest reference must contain '@'"));
        };
        validate_digest(input, digest)?;
        // `repo:tag@digest` is accepted; the digest wins.
        let (name, _) = split_tag(name);

        Ok(Self {
            repository: Repository::parse_name(input, name, options)?,
            digest: digest.to_string(),
        })
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repository, self.digest)
    }
}

/// Tag or digest reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Tag(Tag),
    Digest(Digest),
}

impl Reference {
    pub fn parse(input: &str, options: &ParseOptions) -> Result<Self> {
        if input.contains('@') {
            Digest::parse(input, options).map(Reference::Digest)
        } else {
            Tag::parse(input, options).map(Reference::Tag)
        }
    }

    pub fn repository(&self) -> &Repository {
        match self {
            Reference::Tag(t) => &t.repository,
            Reference::Digest(d) => &d.repository,
        }
    }

    pub fn registry(&self) -> &Registry {
        self.repository().registry()
    }

    /// Tag or digest, as used in `/v2/<name>/manifests/<identifier>`
    pub fn identifier(&self) -> &str {
        match self {
            Reference::Tag(t) => &t.tag,
            Reference::Digest(d) => &d.digest,
        }
    }

    /// Same repository, pinned to `digest`
    pub fn with_digest(&self, digest: &str) -> Digest {
        self.repository().at_digest(digest)
    }
}

impl From<Tag> for Reference {
    fn from(tag: Tag) -> Self {
        Reference::Tag(tag)
    }
}

impl From<Digest> for Reference {
    fn from(digest: Digest) -> Self {
        Reference::Digest(digest)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(t) => t.fmt(f),
            Reference::Digest(d) => d.fmt(f),
        }
    }
}

fn strip_scheme<'a>(input: &'a str, options: &ParseOptions) -> Result<(&'a str, bool)> {
    if let Some(rest) = input.strip_prefix("https://") {
        Ok((rest, false))
    } else if let Some(rest) = input.strip_prefix("http://") {
        if !options.insecure {
            return Err(RegistryError::reference(
                input,
                "plain HTTP registry requires the insecure option",
            ));
        }
        Ok((rest, true))
    } else {
        Ok((input, false))
    }
}

/// Split `name[:tag]`, ignoring a `:` that belongs to a registry port
fn split_tag(name: &str) -> (&str, Option<&str>) {
    let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name[last_slash..].rfind(':') {
        Some(colon) => {
            let at = last_slash + colon;
            (&name[..at], Some(&name[at + 1..]))
        }
        None => (name, None),
    }
}

fn looks_like_host(s: &str) -> bool {
    s.contains('.') || s.contains(':') || s == "localhost"
}

fn is_local_host(host: &str) -> bool {
    let bare = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host)
    };

    if bare == "localhost" || bare.ends_with(".localhost") || bare.ends_with(".local") {
        return true;
    }
    bare.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

fn validate_repository_name(input: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RegistryError::reference(input, "missing repository name"));
    }
    if name.len() > MAX_REPOSITORY_LENGTH {
        return Err(RegistryError::reference(input, "repository name too long"));
    }
    for component in name.split('/') {
        let valid_chars = component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
        let bounded = component
            .chars()
            .next()
            .zip(component.chars().last())
            .map(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric())
            .unwrap_or(false);
        if !valid_chars || !bounded {
            return Err(RegistryError::reference(
                input,
                format!("invalid repository component '{}'", component),
            ));
        }
    }
    Ok(())
}

fn validate_tag(input: &str, tag: &str) -> Result<()> {
    let mut chars = tag.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphanumeric() || c == '_')
        .unwrap_or(false);
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !first_ok || !rest_ok || tag.len() > MAX_TAG_LENGTH {
        return Err(RegistryError::reference(input, format!("invalid tag '{}'", tag)));
    }
    Ok(())
}

/// Accepts `sha256:<64 hex>` and `sha512:<128 hex>`
pub fn validate_digest(input: &str, digest: &str) -> Result<()> {
    let (len, hex) = match digest.split_once(':') {
        Some(("sha256", hex)) => (64, hex),
        Some(("sha512", hex)) => (128, hex),
        _ => {
            return Err(RegistryError::reference(
                input,
                format!("unsupported digest '{}'", digest),
            ));
        }
    };
    if hex.len() != len || !hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
        return Err(RegistryError::reference(input, format!("malformed digest '{}'", digest)));
    }
    Ok(())
}

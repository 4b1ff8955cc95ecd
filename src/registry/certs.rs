//! TLS root-of-trust assembly
//!
//! The pool starts from the TLS backend's system trust store and appends every
//! certificate found in caller-supplied PEM bundles. Loading fails fast on the
//! first unreadable or certificate-free file.

use std::fs;
use std::path::{Path, PathBuf};

use reqwest::{Certificate, ClientBuilder};
use tracing::debug;

use crate::error::{RegistryError, Result};

/// Certificates trusted in addition to (or instead of) the system store
#[derive(Debug, Clone)]
pub struct CertPool {
    system_roots: bool,
    certificates: Vec<Certificate>,
    sources: Vec<PathBuf>,
}

impl CertPool {
    /// Pool seeded from the system store. If the platform store cannot be
    /// loaded the TLS backend proceeds with an empty set.
    pub fn system() -> Self {
        Self {
            system_roots: true,
            certificates: Vec::new(),
            sources: Vec::new(),
        }
    }

    /// Pool that trusts only explicitly added certificates
    pub fn empty() -> Self {
        Self {
            system_roots: false,
            ..Self::system()
        }
    }

    /// System pool with every certificate from `paths` appended, in order
    pub fn from_files<I, P>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut pool = Self::system();
        for path in paths {
            pool.add_pem_file(path.as_ref())?;
        }
        Ok(pool)
    }

    /// Append all certificates in the PEM bundle at `path`, returning how many were added
    pub fn add_pem_file(&mut self, path: &Path) -> Result<usize> {
        let contents = fs::read(path).map_err(|source| RegistryError::ReadCertificates {
            path: path.to_path_buf(),
            source,
        })?;

        let certs = Certificate::from_pem_bundle(&contents).map_err(|e| {
            RegistryError::ParseCertificates {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        if certs.is_empty() {
            return Err(RegistryError::ParseCertificates {
                path: path.to_path_buf(),
                reason: "no PEM certificates found".to_string(),
            });
        }

        let added = certs.len();
        debug!(path = %path.display(), certificates = added, "loaded CA certificates");
        self.certificates.extend(certs);
        self.sources.push(path.to_path_buf());
        Ok(added)
    }

    pub fn uses_system_roots(&self) -> bool {
        self.system_roots
    }

    /// Number of certificates added on top of the system store
    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// Files the added certificates came from
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// Install this pool as the builder's root of trust
    pub fn apply(self, builder: ClientBuilder) -> ClientBuilder {
        self.certificates
            .into_iter()
            .fold(builder.tls_built_in_root_certs(self.system_roots), |builder, cert| {
                builder.add_root_certificate(cert)
            })
    }
}

impl Default for CertPool {
    fn default() -> Self {
        Self::system()
    }
}

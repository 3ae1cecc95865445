//! Server-side TLS credentials.

use crate::{Config, Error, Result};
use rustls::crypto::{CryptoProvider, aws_lc_rs};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Source of server credentials for STARTTLS and implicit TLS.
///
/// Asked once per handshake; a failure aborts that handshake only.
pub trait CredentialProvider: Send + Sync {
    /// Builds an acceptor carrying the current certificate and key.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials are unavailable or invalid.
    fn acceptor(&self) -> Result<TlsAcceptor>;
}

/// Reads a PEM certificate chain and key from disk on every handshake,
/// so renewed certificates are picked up without a restart.
#[derive(Debug, Clone)]
pub struct PemFiles {
    cert_file: PathBuf,
    key_file: PathBuf,
}

impl PemFiles {
    /// Uses the given certificate and key paths.
    #[must_use]
    pub const fn new(cert_file: PathBuf, key_file: PathBuf) -> Self {
        Self {
            cert_file,
            key_file,
        }
    }

    /// Uses the paths from the configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.cert_file.clone(), config.key_file.clone())
    }
}

impl CredentialProvider for PemFiles {
    fn acceptor(&self) -> Result<TlsAcceptor> {
        let certs = load_certs(&self.cert_file)?;
        let key = load_key(&self.key_file)?;
        acceptor_from(certs, key)
    }
}

/// A fixed acceptor, built once.
#[derive(Clone)]
pub struct StaticAcceptor(pub TlsAcceptor);

impl std::fmt::Debug for StaticAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticAcceptor").finish_non_exhaustive()
    }
}

impl CredentialProvider for StaticAcceptor {
    fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(self.0.clone())
    }
}

/// Builds an acceptor restricted to the X25519 and P-256 key exchange
/// groups.
///
/// # Errors
///
/// Returns an error if rustls rejects the certificate or key.
pub fn acceptor_from(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<TlsAcceptor> {
    let provider = CryptoProvider {
        kx_groups: vec![aws_lc_rs::kx_group::X25519, aws_lc_rs::kx_group::SECP256R1],
        ..aws_lc_rs::default_provider()
    };

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::Config(format!("no private key found in {}", path.display())))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_fail() {
        let files = PemFiles::new(
            PathBuf::from("/nonexistent/cert.pem"),
            PathBuf::from("/nonexistent/key.pem"),
        );
        assert!(matches!(files.acceptor(), Err(Error::Io(_))));
    }

    #[test]
    fn test_file_without_certificate_fails() {
        let path = std::env::temp_dir().join(format!("mxrelay-empty-{}.pem", std::process::id()));
        std::fs::write(&path, "not a pem file\n").unwrap();

        let files = PemFiles::new(path.clone(), path.clone());
        assert!(matches!(files.acceptor(), Err(Error::Config(_))));

        std::fs::remove_file(&path).unwrap();
    }
}

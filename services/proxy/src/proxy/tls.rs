//! TLS material loading.
//!
//! Termination is driven purely by file presence: if `fullchain.pem`
//! exists under the configured certificate directory, the proxy runs a
//! TLS-terminating listener on the HTTPS port and a redirect-only
//! listener on the HTTP port. Outbound TLS (scheme-qualified backends)
//! verifies against the platform's native roots.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Once};

use anyhow::{Context, Result};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Certificate chain file name within the certificate directory.
pub const CERT_FILE: &str = "fullchain.pem";

/// Private key file name within the certificate directory.
pub const KEY_FILE: &str = "privkey.pem";

static INIT_CRYPTO: Once = Once::new();

/// Install the ring crypto provider as the process default. Safe to call
/// more than once.
pub fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// Load a TLS acceptor from `cert_dir` if a certificate is present.
///
/// A missing certificate file means "no TLS" and is not an error; a
/// present but unreadable pair is a startup failure.
pub fn load_acceptor(cert_dir: &Path) -> Result<Option<TlsAcceptor>> {
    let cert_path = cert_dir.join(CERT_FILE);
    if !cert_path.is_file() {
        return Ok(None);
    }
    let key_path = cert_dir.join(KEY_FILE);

    let cert_file = File::open(&cert_path)
        .with_context(|| format!("Failed to open certificate {}", cert_path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("Invalid certificate PEM in {}", cert_path.display()))?;

    let key_file = File::open(&key_path)
        .with_context(|| format!("Failed to open private key {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("Invalid private key PEM in {}", key_path.display()))?
        .with_context(|| format!("No private key found in {}", key_path.display()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Certificate/key pair rejected")?;

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

/// Build the TLS connector used for `https` scheme-qualified backends.
pub fn backend_connector() -> TlsConnector {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        root_store.add(cert).ok();
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_certificate_means_no_tls() {
        init_crypto_provider();
        let dir = std::env::temp_dir().join("dockgate-no-such-certs");
        assert!(load_acceptor(&dir).unwrap().is_none());
    }

    #[test]
    fn test_loads_generated_certificate() {
        init_crypto_provider();

        let dir = std::env::temp_dir().join(format!("dockgate-tls-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let cert = rcgen::generate_simple_self_signed(vec!["svc.local".to_string()]).unwrap();
        std::fs::write(dir.join(CERT_FILE), cert.cert.pem()).unwrap();
        std::fs::write(dir.join(KEY_FILE), cert.key_pair.serialize_pem()).unwrap();

        let acceptor = load_acceptor(&dir).unwrap();
        assert!(acceptor.is_some());

        std::fs::remove_dir_all(&dir).ok();
    }
}

//! mTLS material for the admin server and the peer client
//!
//! Both sides use the node certificate and key from the credentials file and
//! trust only the configured root CA. The server requires a client
//! certificate signed by that root.

use crate::credentials::Credentials;
use crate::error::TlsError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = read(path)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read(path)?;
    rustls_pemfile::private_key(&mut BufReader::new(pem.as_slice()))
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

pub fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Server config requiring client certificates from the configured root.
pub fn server_config(credentials: &Credentials) -> Result<ServerConfig, TlsError> {
    let certs = load_certs(&credentials.cert_pem)?;
    let key = load_private_key(&credentials.cert_key)?;
    let roots = load_roots(&credentials.cert_root)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| TlsError::Verifier(e.to_string()))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    info!(
        cert = %credentials.cert_pem.display(),
        root = %credentials.cert_root.display(),
        "Loaded mTLS server configuration"
    );
    Ok(config)
}

/// HTTPS client presenting the node certificate and trusting only the root CA.
pub fn peer_client(credentials: &Credentials, timeout: Duration) -> Result<reqwest::Client, TlsError> {
    let mut identity_pem = read(&credentials.cert_pem)?;
    identity_pem.push(b'\n');
    identity_pem.extend(read(&credentials.cert_key)?);
    let identity = reqwest::Identity::from_pem(&identity_pem)?;

    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .identity(identity)
        .timeout(timeout);

    let roots = read(&credentials.cert_root)?;
    for cert in reqwest::Certificate::from_pem_bundle(&roots)? {
        builder = builder.add_root_certificate(cert);
    }

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_files_are_reported() {
        let creds = Credentials {
            cert_pem: "/nonexistent/node.pem".into(),
            cert_key: "/nonexistent/node.key".into(),
            cert_root: "/nonexistent/root.pem".into(),
            ..Credentials::default()
        };
        assert!(matches!(server_config(&creds), Err(TlsError::Read { .. })));
        assert!(matches!(
            peer_client(&creds, Duration::from_millis(400)),
            Err(TlsError::Read { .. })
        ));
    }

    #[test]
    fn file_without_pem_blocks_has_no_certificates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        assert!(matches!(load_certs(file.path()), Err(TlsError::NoCertificates(_))));
        assert!(matches!(load_private_key(file.path()), Err(TlsError::NoPrivateKey(_))));
    }
}

//! TLS configuration for `wss://` channels.

use crate::connection::TlsClientConfig;
use crate::error::ClientError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Builds a rustls client configuration from the channel's TLS settings.
pub fn create_tls_config(config: &TlsClientConfig) -> Result<Arc<rustls::ClientConfig>, ClientError> {
    if config.insecure {
        tracing::warn!("Using insecure TLS (certificate verification disabled)");
        return create_insecure_tls_config();
    }

    let root_store = if let Some(ref ca_path) = config.ca_cert_path {
        let mut store = RootCertStore::empty();
        for cert in load_certs(ca_path, "CA bundle")? {
            store.add(cert).map_err(|e| {
                ClientError::TlsConfig(format!("CA bundle '{}' rejected: {}", ca_path.display(), e))
            })?;
        }
        store
    } else {
        let mut store = RootCertStore::empty();
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        store
    };

    let builder = config_builder(crypto_provider())?.with_root_certificates(root_store);

    let client_config = if let (Some(cert_path), Some(key_path)) =
        (&config.client_cert_path, &config.client_key_path)
    {
        let certs = load_certs(cert_path, "client certificate")?;
        let key = load_private_key(key_path)?;

        builder.with_client_auth_cert(certs, key).map_err(|e| {
            ClientError::TlsConfig(format!("client certificate and key do not match: {}", e))
        })?
    } else {
        builder.with_no_client_auth()
    };

    Ok(Arc::new(client_config))
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Config builder pinned to the ring crypto provider.
fn config_builder(
    provider: Arc<rustls::crypto::CryptoProvider>,
) -> Result<rustls::ConfigBuilder<rustls::ClientConfig, rustls::WantsVerifier>, ClientError> {
    rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ClientError::TlsConfig(format!("TLS provider rejected protocol versions: {}", e)))
}

/// Accepts any server certificate but still checks handshake signatures
/// with the provider's algorithms.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Builds a configuration that skips certificate verification.
/// Only meant for local HPKV deployments with self-signed certificates.
pub fn create_insecure_tls_config() -> Result<Arc<rustls::ClientConfig>, ClientError> {
    let provider = crypto_provider();
    let verifier = AcceptAnyServerCert {
        algorithms: provider.signature_verification_algorithms,
    };

    let client_config = config_builder(provider)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    Ok(Arc::new(client_config))
}

fn open_pem(path: &Path, what: &str) -> Result<BufReader<File>, ClientError> {
    File::open(path).map(BufReader::new).map_err(|e| {
        ClientError::TlsConfig(format!("{} '{}' is not readable: {}", what, path.display(), e))
    })
}

/// Reads every certificate in a PEM file. A file without any is an error.
fn load_certs(path: &Path, what: &str) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let mut reader = open_pem(path, what)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            ClientError::TlsConfig(format!("{} '{}' is not valid PEM: {}", what, path.display(), e))
        })?;

    if certs.is_empty() {
        return Err(ClientError::TlsConfig(format!(
            "{} '{}' holds no certificates",
            what,
            path.display()
        )));
    }
    Ok(certs)
}

/// Reads the first PKCS#1, PKCS#8 or SEC1 key in a PEM file.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ClientError> {
    let mut reader = open_pem(path, "client key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| {
            ClientError::TlsConfig(format!("client key '{}' is not valid PEM: {}", path.display(), e))
        })?
        .ok_or_else(|| {
            ClientError::TlsConfig(format!("client key '{}' holds no private key", path.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pem_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_cert_file() {
        let err = load_certs(Path::new("/nonexistent/cert.pem"), "CA bundle").unwrap_err();
        assert!(err.to_string().contains("CA bundle '/nonexistent/cert.pem' is not readable"));
    }

    #[test]
    fn test_pem_without_certificates() {
        let file = pem_file("just some text\n");
        let err = load_certs(file.path(), "client certificate").unwrap_err();
        assert!(err.to_string().contains("holds no certificates"));
    }

    #[test]
    fn test_pem_without_private_key() {
        let file = pem_file("");
        let err = load_private_key(file.path()).unwrap_err();
        assert!(err.to_string().contains("holds no private key"));
    }

    #[test]
    fn test_missing_ca_file_fails_config() {
        let config = TlsClientConfig::new().with_ca_cert("/nonexistent/ca.pem");
        let err = create_tls_config(&config).unwrap_err();
        assert!(matches!(err, ClientError::TlsConfig(_)));
    }

    #[test]
    fn test_default_config_uses_webpki_roots() {
        let config = TlsClientConfig::new();
        assert!(create_tls_config(&config).is_ok());
    }

    #[test]
    fn test_insecure_config_builds() {
        let config = TlsClientConfig::new().with_insecure();
        assert!(create_tls_config(&config).is_ok());
    }
}

//! TLS client configuration
//!
//! Certificates are checked against, in order of preference, the PEM file or
//! directory named by `ssl_ca_cert`, or the Mozilla roots compiled into
//! `webpki-roots`. With [`SslVerifyMode::VerifyNone`] the chain is not
//! validated, but the certificate must still name the host being contacted.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::config::{OpenOptions, SslVerifyMode};
use crate::error::{OpenError, Result};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Trust store built from the bundled Mozilla roots
pub fn default_root_store() -> RootCertStore {
    RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

fn read_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            OpenError::Config(format!("unable to decode certificate in {}: {e}", path.display()))
        })?;
    Ok(certs)
}

/// Load a CA bundle file, or every PEM file in a CA directory
pub fn load_ca_certs(path: &Path) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();

    if path.is_dir() {
        let mut entries: Vec<_> = fs::read_dir(path)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        entries.sort();

        for entry in entries {
            match read_pem_certs(&entry) {
                Ok(certs) => {
                    let (added, ignored) = store.add_parsable_certificates(certs);
                    trace!("{}: {added} certificates added, {ignored} ignored", entry.display());
                }
                Err(e) => warn!("Skipping {}: {e}", entry.display()),
            }
        }
    } else {
        let certs = read_pem_certs(path)?;
        let (added, ignored) = store.add_parsable_certificates(certs);
        trace!("{}: {added} certificates added, {ignored} ignored", path.display());
    }

    if store.is_empty() {
        return Err(OpenError::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    debug!("Loaded {} trust anchors from {}", store.len(), path.display());
    Ok(store)
}

/// Build the rustls client configuration for one call
pub fn client_config(options: &OpenOptions) -> Result<Arc<ClientConfig>> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let mut config = match options.ssl_verify_mode {
        SslVerifyMode::Verify => {
            let roots = match &options.ssl_ca_cert {
                Some(path) => load_ca_certs(path)?,
                None => default_root_store(),
            };
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        SslVerifyMode::VerifyNone => {
            debug!("Certificate chain verification disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NameOnlyVerification::new(&provider)))
                .with_no_client_auth()
        }
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Accepts any chain, but still requires the certificate to be for the
/// host we connected to and the handshake signatures to be valid
#[derive(Debug)]
struct NameOnlyVerification {
    algorithms: WebPkiSupportedAlgorithms,
}

impl NameOnlyVerification {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for NameOnlyVerification {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_name(&cert, server_name)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

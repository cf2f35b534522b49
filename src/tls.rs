//! TLS client configuration for the broker sockets.
//!
//! By default the bundled Mozilla roots from `webpki-roots` are trusted. A
//! PEM bundle can be supplied to pin a specific CA instead.

use std::path::Path;

use rustls::ClientConfig;

use crate::{Result, XapiError};

/// Builds a [`ClientConfig`] trusting either the bundled web roots or, when
/// `ca_pem` is given, only the certificates in that PEM file.
///
/// # Errors
///
/// Returns [`XapiError::Tls`] if the PEM file cannot be read, cannot be
/// parsed, or contains no usable certificate.
pub fn build_tls_config(ca_pem: Option<&Path>) -> Result<ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();

    match ca_pem {
        Some(path) => {
            let pem = std::fs::read(path)
                .map_err(|e| XapiError::Tls(format!("failed to read {}: {e}", path.display())))?;
            let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| XapiError::Tls(format!("failed to parse CA PEM: {e}")))?;

            let (added, _ignored) = root_store.add_parsable_certificates(certs);
            if added == 0 {
                return Err(XapiError::Tls(format!(
                    "{} contains no usable CA certificate",
                    path.display()
                )));
            }
        }
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let config = ClientConfig::builder_with_provider(std::sync::Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| XapiError::Tls(e.to_string()))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(config)
}

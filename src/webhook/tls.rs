//! TLS for the webhook server
//!
//! Builds a rustls server configuration (aws-lc-rs provider) from the serving
//! certificate in the webhook certificate directory and the resolved TLS
//! policy. The cipher-suite allow-list uses Go constant names and only
//! restricts TLS 1.2 suites; TLS 1.3 suites are always offered.

use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{CipherSuite, ServerConfig, SupportedCipherSuite, SupportedProtocolVersion};

use crate::config::TlsConfig;
use crate::Error;

/// Certificate file name inside the certificate directory
pub const CERT_FILE: &str = "tls.crt";

/// Key file name inside the certificate directory
pub const KEY_FILE: &str = "tls.key";

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Map a Go cipher-suite name to the rustls identifier
fn cipher_suite_by_name(name: &str) -> Option<CipherSuite> {
    let suite = match name {
        "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256" => {
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
        }
        "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384" => {
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
        }
        "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305"
        | "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256" => {
            CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
        }
        "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256" => CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384" => CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305" | "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256" => {
            CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
        }
        "TLS_AES_128_GCM_SHA256" => CipherSuite::TLS13_AES_128_GCM_SHA256,
        "TLS_AES_256_GCM_SHA384" => CipherSuite::TLS13_AES_256_GCM_SHA384,
        "TLS_CHACHA20_POLY1305_SHA256" => CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
        _ => return None,
    };
    Some(suite)
}

/// Protocol versions enabled for a Go-style minimum version name
pub fn protocol_versions(min_version: &str) -> Result<&'static [&'static SupportedProtocolVersion], Error> {
    match min_version {
        "VersionTLS12" => Ok(rustls::ALL_VERSIONS),
        "VersionTLS13" => Ok(TLS13_ONLY),
        other => Err(Error::webhook(format!("unsupported minimum TLS version {other:?}"))),
    }
}

/// Restrict `available` suites to the allow-list
///
/// An empty allow-list keeps everything. TLS 1.3 suites are never removed.
pub fn select_cipher_suites(
    available: &[SupportedCipherSuite],
    allow_list: &[String],
    min_version: &str,
) -> Result<Vec<SupportedCipherSuite>, Error> {
    if allow_list.is_empty() {
        return Ok(available.to_vec());
    }

    let allowed = allow_list
        .iter()
        .map(|name| {
            cipher_suite_by_name(name)
                .ok_or_else(|| Error::webhook(format!("unknown cipher suite {name:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let selected: Vec<SupportedCipherSuite> = available
        .iter()
        .copied()
        .filter(|s| matches!(s, SupportedCipherSuite::Tls13(_)) || allowed.contains(&s.suite()))
        .collect();

    let has_tls12 = selected
        .iter()
        .any(|s| matches!(s, SupportedCipherSuite::Tls12(_)));
    if min_version == "VersionTLS12" && !has_tls12 {
        return Err(Error::webhook(
            "cipher suite allow-list leaves no usable TLS 1.2 suite",
        ));
    }

    Ok(selected)
}

/// Read the serving certificate chain and key from `cert_dir`
pub fn load_certified_key(
    cert_dir: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
    let cert_path = cert_dir.join(CERT_FILE);
    let key_path = cert_dir.join(KEY_FILE);

    let certs = CertificateDer::pem_file_iter(&cert_path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| Error::webhook(format!("failed to read {}: {e}", cert_path.display())))?;
    if certs.is_empty() {
        return Err(Error::webhook(format!(
            "no certificate found in {}",
            cert_path.display()
        )));
    }

    let key = PrivateKeyDer::from_pem_file(&key_path)
        .map_err(|e| Error::webhook(format!("failed to read {}: {e}", key_path.display())))?;

    Ok((certs, key))
}

/// Build the rustls server configuration for the webhook server
pub fn server_config(tls: &TlsConfig, cert_dir: &Path) -> Result<ServerConfig, Error> {
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    provider.cipher_suites =
        select_cipher_suites(&provider.cipher_suites, &tls.cipher_suites, &tls.min_version)?;
    let versions = protocol_versions(&tls.min_version)?;

    let (certs, key) = load_certified_key(cert_dir)?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(versions)
        .map_err(|e| Error::webhook(format!("invalid TLS policy: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::webhook(format!("invalid serving certificate: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(config)
}

/// axum-server TLS configuration for the webhook listener
pub fn rustls_config(tls: &TlsConfig, cert_dir: &Path) -> Result<RustlsConfig, Error> {
    Ok(RustlsConfig::from_config(Arc::new(server_config(tls, cert_dir)?)))
}

/// Install the process-wide default crypto provider
///
/// Safe to call more than once; later calls are ignored.
pub fn install_crypto_provider() {
    let _ = CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn available() -> Vec<SupportedCipherSuite> {
        rustls::crypto::aws_lc_rs::default_provider().cipher_suites
    }

    fn write_self_signed(dir: &Path) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        std::fs::write(dir.join(CERT_FILE), certified.cert.pem()).unwrap();
        std::fs::write(dir.join(KEY_FILE), certified.key_pair.serialize_pem()).unwrap();
    }

    fn policy(min_version: &str, suites: &[&str]) -> TlsConfig {
        TlsConfig {
            min_version: min_version.to_string(),
            cipher_suites: suites.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_empty_allow_list_keeps_provider_defaults() {
        let selected = select_cipher_suites(&available(), &[], "VersionTLS12").unwrap();
        assert_eq!(selected.len(), available().len());
    }

    #[test]
    fn test_allow_list_restricts_tls12_only() {
        let selected = select_cipher_suites(
            &available(),
            &["TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256".to_string()],
            "VersionTLS12",
        )
        .unwrap();

        let tls12: Vec<CipherSuite> = selected
            .iter()
            .filter(|s| matches!(s, SupportedCipherSuite::Tls12(_)))
            .map(|s| s.suite())
            .collect();
        assert_eq!(tls12, vec![CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256]);
        assert!(selected
            .iter()
            .any(|s| matches!(s, SupportedCipherSuite::Tls13(_))));
    }

    #[test]
    fn test_go_chacha_alias_accepted() {
        let selected = select_cipher_suites(
            &available(),
            &["TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305".to_string()],
            "VersionTLS12",
        )
        .unwrap();
        assert!(selected
            .iter()
            .any(|s| s.suite() == CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256));
    }

    #[test]
    fn test_unknown_suite_rejected() {
        let err = select_cipher_suites(
            &available(),
            &["TLS_RSA_WITH_RC4_128_SHA".to_string()],
            "VersionTLS12",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Webhook(_)));
    }

    #[test]
    fn test_tls13_only_list_needs_tls13_minimum() {
        let list = vec!["TLS_AES_128_GCM_SHA256".to_string()];
        assert!(select_cipher_suites(&available(), &list, "VersionTLS12").is_err());
        assert!(select_cipher_suites(&available(), &list, "VersionTLS13").is_ok());
    }

    #[test]
    fn test_protocol_versions() {
        assert_eq!(protocol_versions("VersionTLS12").unwrap().len(), 2);
        assert_eq!(protocol_versions("VersionTLS13").unwrap().len(), 1);
        assert!(protocol_versions("VersionTLS11").is_err());
    }

    #[test]
    fn test_server_config_from_cert_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_self_signed(dir.path());

        let config = server_config(&policy("VersionTLS13", &[]), dir.path()).unwrap();
        assert_eq!(config.alpn_protocols.len(), 2);
    }

    #[test]
    fn test_missing_certificate_is_webhook_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = server_config(&policy("VersionTLS12", &[]), dir.path()).unwrap_err();
        assert!(err.to_string().contains(CERT_FILE));
    }
}

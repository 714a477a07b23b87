//! Structural validation of the resolved configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::ResolvedConfig;
use crate::telemetry::parse_log_level;
use crate::Error;

/// Longest lease a `coordination.k8s.io/v1` Lease can express (i32 seconds)
pub const MAX_LEASE_SECONDS: u64 = i32::MAX as u64;

/// TLS versions accepted as `tlsOpt.minVersion`
pub const SUPPORTED_TLS_VERSIONS: &[&str] = &["VersionTLS12", "VersionTLS13"];

/// Cipher-suite names (Go constant names) accepted in `tlsOpt.cipherSuites`
pub const SUPPORTED_CIPHER_SUITES: &[&str] = &[
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_AES_128_GCM_SHA256",
    "TLS_AES_256_GCM_SHA384",
    "TLS_CHACHA20_POLY1305_SHA256",
];

/// Parse a Go-style bind address
///
/// An empty host (`:8080`) binds all interfaces; `localhost` is the IPv4
/// loopback; anything else must be an IP literal with a port.
pub fn parse_bind_address(addr: &str) -> Result<SocketAddr, Error> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::config(format!("address {addr:?} is missing a port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::config(format!("address {addr:?} has an invalid port")))?;

    let ip = match host.trim_start_matches('[').trim_end_matches(']') {
        "" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
        other => other
            .parse()
            .map_err(|_| Error::config(format!("address {addr:?} has an invalid host")))?,
    };
    Ok(SocketAddr::new(ip, port))
}

/// Check the configuration and return the first violation found
pub fn validate(cfg: &ResolvedConfig) -> Result<(), Error> {
    for (component, image) in cfg.images.entries() {
        if image.trim().is_empty() {
            return Err(Error::config(format!(
                "default image for {component} must not be empty"
            )));
        }
    }

    if cfg.metrics_addr != "0" {
        parse_bind_address(&cfg.metrics_addr)
            .map_err(|e| Error::config(format!("metricsAddr: {e}")))?;
    }
    parse_bind_address(&cfg.probe_addr)
        .map_err(|e| Error::config(format!("healthProbeAddr: {e}")))?;
    if !cfg.pprof_addr.is_empty() {
        parse_bind_address(&cfg.pprof_addr).map_err(|e| Error::config(format!("pprofAddr: {e}")))?;
    }

    if cfg.webhook_port == 0 {
        return Err(Error::config("webhookPort must be between 1 and 65535"));
    }

    if !SUPPORTED_TLS_VERSIONS.contains(&cfg.tls.min_version.as_str()) {
        return Err(Error::config(format!(
            "unsupported tlsOpt.minVersion {:?}, expected one of {:?}",
            cfg.tls.min_version, SUPPORTED_TLS_VERSIONS
        )));
    }
    if let Some(unknown) = cfg
        .tls
        .cipher_suites
        .iter()
        .find(|s| !SUPPORTED_CIPHER_SUITES.contains(&s.as_str()))
    {
        return Err(Error::config(format!("unsupported cipher suite {unknown:?}")));
    }

    if parse_log_level(&cfg.log_level).is_none() {
        return Err(Error::config(format!("invalid logLevel {:?}", cfg.log_level)));
    }

    if cfg.labels_filter.iter().any(|l| l.trim().is_empty()) {
        return Err(Error::config("labels filter entries must not be empty"));
    }

    if cfg.enable_leader_election {
        let le = &cfg.leader_election;
        if le.id.trim().is_empty() {
            return Err(Error::config("leaderElectionId must not be empty"));
        }
        for (name, value) in [
            ("leaseDuration", le.lease_duration),
            ("renewDeadline", le.renew_deadline),
        ] {
            if value.as_secs() > MAX_LEASE_SECONDS {
                return Err(Error::config(format!(
                    "{name} ({value:?}) exceeds the lease limit of {MAX_LEASE_SECONDS}s"
                )));
            }
        }
        if le.retry_period.is_zero() {
            return Err(Error::config("retryPeriod must be positive"));
        }
        if le.renew_deadline >= le.lease_duration {
            return Err(Error::config(format!(
                "renewDeadline ({:?}) must be shorter than leaseDuration ({:?})",
                le.renew_deadline, le.lease_duration
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::version::Version;

    fn defaults() -> ResolvedConfig {
        ResolvedConfig::defaults(&Version::get())
    }

    #[test]
    fn test_parse_bind_address_forms() {
        assert_eq!(
            parse_bind_address(":8080").unwrap(),
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_bind_address("127.0.0.1:9090").unwrap(),
            "127.0.0.1:9090".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(parse_bind_address("localhost:1").unwrap().ip(), Ipv4Addr::LOCALHOST);
        assert_eq!(parse_bind_address("[::1]:8443").unwrap().port(), 8443);
    }

    #[test]
    fn test_parse_bind_address_rejects_garbage() {
        assert!(parse_bind_address("8080").is_err());
        assert!(parse_bind_address(":http").is_err());
        assert!(parse_bind_address("not a host:80").is_err());
        assert!(parse_bind_address(":70000").is_err());
    }

    #[test]
    fn test_empty_image_rejected() {
        let mut cfg = defaults();
        cfg.images.auto_instrumentation_python = "  ".to_string();
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("auto-instrumentation-python"));
    }

    #[test]
    fn test_first_violation_is_reported() {
        let mut cfg = defaults();
        cfg.images.collector = String::new();
        cfg.webhook_port = 0;
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("collector"));
    }

    #[test]
    fn test_bad_addresses_rejected() {
        let mut cfg = defaults();
        cfg.probe_addr = "nope".to_string();
        assert!(validate(&cfg).unwrap_err().to_string().contains("healthProbeAddr"));

        let mut cfg = defaults();
        cfg.pprof_addr = ":x".to_string();
        assert!(validate(&cfg).unwrap_err().to_string().contains("pprofAddr"));
    }

    #[test]
    fn test_tls_policy_checked() {
        let mut cfg = defaults();
        cfg.tls.min_version = "VersionTLS10".to_string();
        assert!(validate(&cfg).is_err());

        let mut cfg = defaults();
        cfg.tls.cipher_suites = vec!["TLS_RSA_WITH_RC4_128_SHA".to_string()];
        assert!(validate(&cfg).is_err());

        let mut cfg = defaults();
        cfg.tls.min_version = "VersionTLS13".to_string();
        cfg.tls.cipher_suites = vec!["TLS_AES_128_GCM_SHA256".to_string()];
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn test_log_level_checked() {
        let mut cfg = defaults();
        cfg.log_level = "chatty".to_string();
        assert!(validate(&cfg).is_err());
        cfg.log_level = "debug".to_string();
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn test_leader_election_timings_only_checked_when_enabled() {
        let mut cfg = defaults();
        cfg.leader_election.renew_deadline = Duration::from_secs(200);
        assert!(validate(&cfg).is_ok());

        cfg.enable_leader_election = true;
        assert!(validate(&cfg).unwrap_err().to_string().contains("renewDeadline"));
    }

    #[test]
    fn test_lease_longer_than_i32_seconds_rejected() {
        let mut cfg = defaults();
        cfg.enable_leader_election = true;
        cfg.leader_election.lease_duration = Duration::from_secs(3_000_000_000);
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("leaseDuration"));

        cfg.leader_election.lease_duration = Duration::from_secs(MAX_LEASE_SECONDS);
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn test_zero_webhook_port_rejected() {
        let mut cfg = defaults();
        cfg.webhook_port = 0;
        assert!(validate(&cfg).is_err());
    }
}

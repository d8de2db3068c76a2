use crate::error::{Result, UpgradeError};
use std::net::ToSocketAddrs;
use std::time::Duration;
use tracing::debug;

/// Upstream hosts the upgrade cannot proceed without.
pub const REQUIRED_HOSTS: &[&str] = &["deb.debian.org", "security.debian.org"];

const HTTPS_TIMEOUT: Duration = Duration::from_secs(10);

/// Seam over name resolution and HTTPS reachability so preflight is testable
/// offline.
pub trait NetProbe {
    fn resolve(&self, host: &str) -> Result<()>;
    fn https_reachable(&self, host: &str) -> Result<()>;
}

/// Production probe: the system resolver plus a blocking HTTPS HEAD request.
pub struct SystemNet;

impl NetProbe for SystemNet {
    fn resolve(&self, host: &str) -> Result<()> {
        match (host, 443u16).to_socket_addrs() {
            Ok(mut addrs) => {
                if addrs.next().is_some() {
                    debug!(host, "DNS resolution ok");
                    Ok(())
                } else {
                    Err(UpgradeError::DnsFailure {
                        host: host.to_string(),
                        detail: "no addresses returned".to_string(),
                    })
                }
            }
            Err(e) => Err(UpgradeError::DnsFailure {
                host: host.to_string(),
                detail: e.to_string(),
            }),
        }
    }

    fn https_reachable(&self, host: &str) -> Result<()> {
        let url = format!("https://{host}/");
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTPS_TIMEOUT)
            .build()
            .map_err(|e| UpgradeError::HttpsUnreachable {
                url: url.clone(),
                detail: e.to_string(),
            })?;
        // Any HTTP response proves reachability; the status itself is
        // irrelevant here.
        match client.head(&url).send() {
            Ok(resp) => {
                debug!(host, status = %resp.status(), "HTTPS reachability ok");
                Ok(())
            }
            Err(e) => Err(UpgradeError::HttpsUnreachable {
                url,
                detail: e.to_string(),
            }),
        }
    }
}

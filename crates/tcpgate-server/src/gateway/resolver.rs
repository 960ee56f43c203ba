//! DNS resolution via `tokio::net::lookup_host`.
//!
//! Owned by the destination validator: the addresses it returns are the ones
//! checked against policy and later connected to, so nothing downstream
//! performs a second lookup.

use std::net::IpAddr;
use std::time::Duration;
use tokio::net;
use tracing::{debug, warn};

/// Async resolver with a lookup deadline.
#[derive(Debug, Clone)]
pub struct DnsResolver {
    timeout: Duration,
}

impl DnsResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Resolve a hostname to its IP addresses, deduplicated, in the order
    /// the system resolver returned them.
    ///
    /// A dummy port (`:0`) is appended internally because `lookup_host`
    /// requires a `host:port` pair.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` if the lookup fails (e.g. NXDOMAIN), exceeds the
    /// deadline, or yields no addresses.
    pub async fn resolve(&self, name: &str) -> Result<Vec<IpAddr>, String> {
        let lookup_addr = format!("{name}:0");

        let result = match tokio::time::timeout(self.timeout, net::lookup_host(&lookup_addr)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(name = %name, timeout_ms = self.timeout.as_millis() as u64, "DNS resolution timed out");
                return Err(format!(
                    "DNS resolution for {name} timed out after {}ms",
                    self.timeout.as_millis()
                ));
            }
        };

        match result {
            Ok(addrs) => {
                let mut ips: Vec<IpAddr> = Vec::new();
                for addr in addrs {
                    if !ips.contains(&addr.ip()) {
                        ips.push(addr.ip());
                    }
                }
                if ips.is_empty() {
                    debug!(name = %name, "no addresses found");
                    Err(format!("no addresses found for {name}"))
                } else {
                    debug!(name = %name, count = ips.len(), "resolved");
                    Ok(ips)
                }
            }
            Err(e) => {
                warn!(name = %name, error = %e, "DNS resolution failed");
                Err(format!("DNS resolution failed for {name}: {e}"))
            }
        }
    }
}

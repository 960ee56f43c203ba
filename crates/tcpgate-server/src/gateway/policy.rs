//! Destination policy: decides whether a host/port may be contacted at all.
//!
//! The policy layer is split into two types:
//!
//! - [`GatewayPolicy`]: a plain configuration struct (cloneable) holding the
//!   deny ranges, self ranges and the optional port allowlist.
//! - [`DestinationValidator`]: the runtime counterpart that owns the policy
//!   plus its own resolver and produces a [`ValidationVerdict`].
//!
//! # Rules
//!
//! Applied in order, first match wins:
//!
//! 1. port outside 1-65535 (or outside `allowed_ports`), or a host that is
//!    empty, longer than 255 bytes or contains control characters;
//! 2. resolution failure or zero addresses;
//! 3. any resolved address inside a deny range (private, loopback,
//!    link-local, carrier-grade NAT, cloud metadata, IPv6 equivalents);
//! 4. any resolved address inside a configured self range;
//! 5. otherwise allow.
//!
//! An allow verdict carries the resolved socket addresses. The connection
//! manager connects to those literal addresses and never resolves again, so
//! a DNS answer that changes between validation and connect cannot redirect
//! the session.

use super::resolver::DnsResolver;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use tcpgate_core::{Destination, GateError};
use tracing::{debug, warn};

const MAX_HOST_LEN: usize = 255;

/// An IPv4 or IPv6 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, String> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(format!("prefix /{prefix} too long for {addr}"));
        }
        Ok(Self { addr, prefix })
    }

    const fn v4(a: u8, b: u8, c: u8, d: u8, prefix: u8) -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
            prefix,
        }
    }

    const fn v6(segments: [u16; 8], prefix: u8) -> Self {
        let [a, b, c, d, e, f, g, h] = segments;
        Self {
            addr: IpAddr::V6(Ipv6Addr::new(a, b, c, d, e, f, g, h)),
            prefix,
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpNet {
    type Err = String;

    /// Parses `"10.0.0.0/8"`, `"fe80::/10"`, or a bare address (host route).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let prefix = prefix
                    .parse::<u8>()
                    .map_err(|_| format!("invalid prefix length in {s:?}"))?;
                (addr, Some(prefix))
            }
            None => (s, None),
        };
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| format!("invalid network address in {s:?}"))?;
        let prefix = prefix.unwrap_or(if addr.is_ipv4() { 32 } else { 128 });
        Self::new(addr, prefix)
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// A deny range plus the label reported when it matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenyRule {
    pub net: IpNet,
    pub label: String,
}

impl DenyRule {
    pub fn new(net: IpNet, label: impl Into<String>) -> Self {
        Self {
            net,
            label: label.into(),
        }
    }
}

/// Built-in deny ranges. Metadata host routes come before the link-local
/// range that contains them so they report the more specific label.
const BUILTIN_DENY: &[(IpNet, &str)] = &[
    (IpNet::v4(169, 254, 169, 254, 32), "metadata-range"),
    (IpNet::v6([0xfd00, 0xec2, 0, 0, 0, 0, 0, 0x254], 128), "metadata-range"),
    (IpNet::v4(127, 0, 0, 0, 8), "loopback-range"),
    (IpNet::v6([0, 0, 0, 0, 0, 0, 0, 1], 128), "loopback-range"),
    (IpNet::v4(0, 0, 0, 0, 8), "unspecified-range"),
    (IpNet::v6([0, 0, 0, 0, 0, 0, 0, 0], 128), "unspecified-range"),
    (IpNet::v4(10, 0, 0, 0, 8), "private-range"),
    (IpNet::v4(172, 16, 0, 0, 12), "private-range"),
    (IpNet::v4(192, 168, 0, 0, 16), "private-range"),
    (IpNet::v6([0xfc00, 0, 0, 0, 0, 0, 0, 0], 7), "private-range"),
    (IpNet::v6([0xfec0, 0, 0, 0, 0, 0, 0, 0], 10), "private-range"),
    (IpNet::v4(169, 254, 0, 0, 16), "link-local-range"),
    (IpNet::v6([0xfe80, 0, 0, 0, 0, 0, 0, 0], 10), "link-local-range"),
    (IpNet::v4(100, 64, 0, 0, 10), "cgnat-range"),
];

/// Static destination access-control configuration.
#[derive(Debug, Clone)]
pub struct GatewayPolicy {
    /// Ranges no session may reach, checked in order.
    pub deny_ranges: Vec<DenyRule>,
    /// Addresses of the infrastructure fronting this gateway.
    pub self_ranges: Vec<IpNet>,
    /// Ports sessions may use. Empty = every port 1-65535.
    pub allowed_ports: Vec<u16>,
}

impl GatewayPolicy {
    /// The built-in private/loopback/link-local/CGN/metadata deny list.
    pub fn builtin_deny_ranges() -> Vec<DenyRule> {
        BUILTIN_DENY
            .iter()
            .map(|(net, label)| DenyRule::new(*net, *label))
            .collect()
    }
}

/// Default policy: built-in deny ranges, no self ranges, every port.
impl Default for GatewayPolicy {
    fn default() -> Self {
        Self {
            deny_ranges: Self::builtin_deny_ranges(),
            self_ranges: Vec::new(),
            allowed_ports: Vec::new(),
        }
    }
}

/// Why a destination was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    InvalidPort(u16),
    PortNotAllowed(u16),
    InvalidHost(String),
    ResolutionFailed(String),
    Range { label: String, addr: IpAddr },
    SelfRange(IpAddr),
}

impl DenyReason {
    /// Short machine-friendly label, e.g. `metadata-range`.
    pub fn label(&self) -> &str {
        match self {
            Self::InvalidPort(_) => "invalid-port",
            Self::PortNotAllowed(_) => "port-not-allowed",
            Self::InvalidHost(_) => "invalid-host",
            Self::ResolutionFailed(_) => "resolution-failed",
            Self::Range { label, .. } => label,
            Self::SelfRange(_) => "self-range",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPort(p) => write!(f, "invalid-port ({p})"),
            Self::PortNotAllowed(p) => write!(f, "port-not-allowed ({p})"),
            Self::InvalidHost(why) => write!(f, "invalid-host ({why})"),
            Self::ResolutionFailed(why) => f.write_str(why),
            Self::Range { label, addr } => write!(f, "{label} ({addr})"),
            Self::SelfRange(addr) => write!(f, "self-range ({addr})"),
        }
    }
}

impl From<DenyReason> for GateError {
    fn from(reason: DenyReason) -> Self {
        match reason {
            DenyReason::ResolutionFailed(why) => GateError::ResolutionFailed(why),
            other => GateError::ValidationDenied(other.to_string()),
        }
    }
}

/// Proof that a destination passed validation.
///
/// Only [`DestinationValidator::validate`] can build one, which is what lets
/// the connection manager demand it instead of a raw host/port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedDestination {
    destination: Destination,
    addrs: Vec<SocketAddr>,
}

impl AllowedDestination {
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Resolved addresses, all of which passed the range checks.
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }
}

/// Result of validating a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationVerdict {
    Allow(AllowedDestination),
    Deny(DenyReason),
}

impl ValidationVerdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow(_))
    }

    /// Turn a deny into the matching [`GateError`].
    pub fn into_result(self) -> Result<AllowedDestination, GateError> {
        match self {
            Self::Allow(allowed) => Ok(allowed),
            Self::Deny(reason) => Err(reason.into()),
        }
    }
}

/// Runtime destination validator.
pub struct DestinationValidator {
    policy: GatewayPolicy,
    resolver: DnsResolver,
}

impl DestinationValidator {
    pub fn new(policy: GatewayPolicy, resolver: DnsResolver) -> Self {
        Self { policy, resolver }
    }

    pub fn policy(&self) -> &GatewayPolicy {
        &self.policy
    }

    /// Decide whether `host:port` may be contacted.
    ///
    /// Resolves the host itself (literal addresses skip the lookup) and
    /// checks every resolved address, so one bad record in a mixed answer
    /// denies the whole destination.
    pub async fn validate(&self, host: &str, port: u16) -> ValidationVerdict {
        let verdict = self.evaluate(host, port).await;
        match &verdict {
            ValidationVerdict::Allow(allowed) => {
                debug!(host = %host, port, addrs = ?allowed.addrs, "destination allowed");
            }
            ValidationVerdict::Deny(reason) => {
                warn!(host = %host, port, reason = %reason, "destination denied");
            }
        }
        verdict
    }

    async fn evaluate(&self, host: &str, port: u16) -> ValidationVerdict {
        if port == 0 {
            return ValidationVerdict::Deny(DenyReason::InvalidPort(port));
        }
        if !self.policy.allowed_ports.is_empty() && !self.policy.allowed_ports.contains(&port) {
            return ValidationVerdict::Deny(DenyReason::PortNotAllowed(port));
        }
        let host = match check_host_syntax(host) {
            Ok(h) => h,
            Err(why) => return ValidationVerdict::Deny(DenyReason::InvalidHost(why)),
        };

        let ips = match host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => match self.resolver.resolve(host).await {
                Ok(ips) => ips,
                Err(why) => return ValidationVerdict::Deny(DenyReason::ResolutionFailed(why)),
            },
        };
        if ips.is_empty() {
            return ValidationVerdict::Deny(DenyReason::ResolutionFailed(format!(
                "no addresses found for {host}"
            )));
        }

        if let Some(reason) = self.check_ranges(&ips) {
            return ValidationVerdict::Deny(reason);
        }

        ValidationVerdict::Allow(AllowedDestination {
            destination: Destination::new(host, port),
            addrs: ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect(),
        })
    }

    fn check_ranges(&self, ips: &[IpAddr]) -> Option<DenyReason> {
        for &ip in ips {
            let rule = address_forms(ip)
                .find_map(|form| self.policy.deny_ranges.iter().find(|r| r.net.contains(form)));
            if let Some(rule) = rule {
                return Some(DenyReason::Range {
                    label: rule.label.clone(),
                    addr: ip,
                });
            }
        }
        for &ip in ips {
            let in_self = address_forms(ip)
                .any(|form| self.policy.self_ranges.iter().any(|net| net.contains(form)));
            if in_self {
                return Some(DenyReason::SelfRange(ip));
            }
        }
        None
    }
}

/// The address itself plus any IPv4 address it carries, so IPv6 spellings
/// of a denied IPv4 address are denied too.
fn address_forms(ip: IpAddr) -> impl Iterator<Item = IpAddr> {
    let embedded = match ip {
        IpAddr::V6(v6) => embedded_ipv4(v6).map(IpAddr::V4),
        IpAddr::V4(_) => None,
    };
    std::iter::once(ip).chain(embedded)
}

/// IPv4 address embedded in an IPv6 one:
/// - IPv4-mapped `::ffff:a.b.c.d`
/// - NAT64 well-known prefix `64:ff9b::a.b.c.d` (RFC 6052)
/// - 6to4 `2002:AABB:CCDD::/48` (RFC 3056)
/// - IPv4-compatible `::a.b.c.d`, except `::` and `::1`
fn embedded_ipv4(v6: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = v6.to_ipv4_mapped() {
        return Some(v4);
    }
    let seg = v6.segments();
    let low = Ipv4Addr::new(
        (seg[6] >> 8) as u8,
        seg[6] as u8,
        (seg[7] >> 8) as u8,
        seg[7] as u8,
    );
    match seg {
        [0x64, 0xff9b, 0, 0, 0, 0, _, _] => Some(low),
        [0x2002, hi, lo, ..] => Some(Ipv4Addr::new(
            (hi >> 8) as u8,
            hi as u8,
            (lo >> 8) as u8,
            lo as u8,
        )),
        [0, 0, 0, 0, 0, 0, _, _] if u32::from(low) > 1 => Some(low),
        _ => None,
    }
}

/// Syntactic host checks. Strips the brackets of an IPv6 literal.
fn check_host_syntax(host: &str) -> Result<&str, String> {
    if host.is_empty() {
        return Err("empty host".to_string());
    }
    if host.len() > MAX_HOST_LEN {
        return Err(format!("host longer than {MAX_HOST_LEN} bytes"));
    }
    if host.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err("host contains control characters".to_string());
    }
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err("empty host".to_string());
    }
    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tcpgate_core::ErrorKind;

    fn validator(policy: GatewayPolicy) -> DestinationValidator {
        DestinationValidator::new(policy, DnsResolver::new(Duration::from_secs(5)))
    }

    async fn deny_label(v: &DestinationValidator, host: &str, port: u16) -> String {
        match v.validate(host, port).await {
            ValidationVerdict::Deny(reason) => reason.label().to_string(),
            ValidationVerdict::Allow(a) => panic!("{host}:{port} allowed: {a:?}"),
        }
    }

    #[test]
    fn test_cidr_parse_and_contains() {
        let net: IpNet = "172.16.0.0/12".parse().unwrap();
        assert!(net.contains("172.31.255.255".parse().unwrap()));
        assert!(!net.contains("172.32.0.0".parse().unwrap()));
        assert!(!net.contains("::1".parse().unwrap()));

        let host: IpNet = "203.0.113.7".parse().unwrap();
        assert_eq!(host.to_string(), "203.0.113.7/32");

        let all: IpNet = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains("8.8.8.8".parse().unwrap()));

        assert!("10.0.0.0/33".parse::<IpNet>().is_err());
        assert!("fe80::/129".parse::<IpNet>().is_err());
        assert!("not-an-ip/8".parse::<IpNet>().is_err());
    }

    #[tokio::test]
    async fn test_denied_ranges() {
        let v = validator(GatewayPolicy::default());
        let cases = [
            ("169.254.169.254", "metadata-range"),
            ("fd00:ec2::254", "metadata-range"),
            ("127.0.0.1", "loopback-range"),
            ("127.255.0.9", "loopback-range"),
            ("::1", "loopback-range"),
            ("0.0.0.0", "unspecified-range"),
            ("10.1.2.3", "private-range"),
            ("172.16.0.1", "private-range"),
            ("172.31.255.254", "private-range"),
            ("192.168.1.1", "private-range"),
            ("fd12:3456::1", "private-range"),
            ("169.254.10.10", "link-local-range"),
            ("fe80::1", "link-local-range"),
            ("100.64.0.1", "cgnat-range"),
            ("100.127.255.255", "cgnat-range"),
            ("::ffff:10.0.0.1", "private-range"),
            ("::ffff:169.254.169.254", "metadata-range"),
            ("[::1]", "loopback-range"),
            ("64:ff9b::a9fe:a9fe", "metadata-range"),
            ("64:ff9b::a00:1", "private-range"),
            ("2002:a9fe:a9fe::1", "metadata-range"),
            ("2002:c0a8:101::", "private-range"),
            ("::7f00:1", "loopback-range"),
            ("::a00:1", "private-range"),
        ];
        for (host, label) in cases {
            assert_eq!(deny_label(&v, host, 80).await, label, "{host}");
        }
    }

    #[tokio::test]
    async fn test_public_addresses_allowed() {
        let v = validator(GatewayPolicy::default());
        for host in [
            "93.184.216.34",
            "8.8.8.8",
            "172.32.0.1",
            "100.128.0.1",
            "2606:4700::1111",
            "64:ff9b::808:808",
            "2002:5db8:d822::1",
        ] {
            match v.validate(host, 80).await {
                ValidationVerdict::Allow(a) => {
                    assert_eq!(a.addrs().len(), 1);
                    assert_eq!(a.addrs()[0].port(), 80);
                    assert_eq!(a.destination().port, 80);
                }
                ValidationVerdict::Deny(r) => panic!("{host} denied: {r}"),
            }
        }
    }

    #[tokio::test]
    async fn test_syntax_and_port_rules() {
        let v = validator(GatewayPolicy::default());
        assert_eq!(deny_label(&v, "93.184.216.34", 0).await, "invalid-port");
        assert_eq!(deny_label(&v, "", 80).await, "invalid-host");
        assert_eq!(deny_label(&v, "[]", 80).await, "invalid-host");
        assert_eq!(deny_label(&v, "evil\r\nhost", 80).await, "invalid-host");
        assert_eq!(deny_label(&v, &"a".repeat(256), 80).await, "invalid-host");

        let v = validator(GatewayPolicy {
            allowed_ports: vec![7, 79],
            ..GatewayPolicy::default()
        });
        assert_eq!(deny_label(&v, "93.184.216.34", 80).await, "port-not-allowed");
        assert!(v.validate("93.184.216.34", 79).await.is_allow());
    }

    #[tokio::test]
    async fn test_self_range() {
        let v = validator(GatewayPolicy {
            self_ranges: vec!["203.0.113.0/24".parse().unwrap()],
            ..GatewayPolicy::default()
        });
        assert_eq!(deny_label(&v, "203.0.113.10", 443).await, "self-range");
        assert!(v.validate("198.51.100.1", 443).await.is_allow());
    }

    #[tokio::test]
    async fn test_hostname_resolution_is_checked() {
        let v = validator(GatewayPolicy::default());
        // localhost resolves to loopback, which is denied after resolution.
        assert_eq!(deny_label(&v, "localhost", 80).await, "loopback-range");

        let verdict = v.validate("this.host.definitely.does.not.exist.invalid", 80).await;
        let err = verdict.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResolutionFailed);
    }

    #[tokio::test]
    async fn test_deny_maps_to_validation_denied() {
        let v = validator(GatewayPolicy::default());
        let err = v.validate("169.254.169.254", 80).await.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationDenied);
        assert!(err.to_string().contains("metadata-range"));
    }

    #[tokio::test]
    async fn test_empty_deny_list_allows_loopback() {
        let v = validator(GatewayPolicy {
            deny_ranges: Vec::new(),
            ..GatewayPolicy::default()
        });
        let allowed = v.validate("127.0.0.1", 7).await.into_result().unwrap();
        assert_eq!(allowed.addrs(), &["127.0.0.1:7".parse::<SocketAddr>().unwrap()]);
    }
}

//! Gateway configuration: TOML file + CLI overrides.
//!
//! Loaded once at startup into an immutable [`GatewayConfig`] that every
//! session reads through an `Arc`; nothing mutates it afterwards.

use crate::gateway::bridge::READ_CHUNK;
use crate::gateway::policy::{DenyRule, GatewayPolicy, IpNet};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tcpgate_core::{CodecLimits, GateError, GateResult};
use tracing::info;

/// Upper bound on the header and trailer bytes any codec wraps around a
/// payload of `max_frame_size` (RESP `$<len>\r\n` + CRLF, u32 length prefix).
const FRAME_OVERHEAD: usize = 64;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub backpressure: BackpressureSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub protocols: HashMap<String, ProtocolSection>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            cert: None,
            key: None,
            max_sessions: default_max_sessions(),
        }
    }
}

/// `[limits]` section: size caps in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_max_message_hard_cap")]
    pub max_message_hard_cap: usize,
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            max_message_size: default_max_message_size(),
            max_message_hard_cap: default_max_message_hard_cap(),
            max_buffer_size: default_max_buffer_size(),
            max_line_length: default_max_line_length(),
        }
    }
}

/// `[timeouts]` section, all in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,
    #[serde(default = "default_resolve_ms")]
    pub resolve_ms: u64,
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            idle_ms: default_idle_ms(),
            handshake_ms: default_handshake_ms(),
            resolve_ms: default_resolve_ms(),
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

/// `[backpressure]` section, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BackpressureSection {
    #[serde(default = "default_high_water")]
    pub high_water: usize,
    #[serde(default = "default_low_water")]
    pub low_water: usize,
}

impl Default for BackpressureSection {
    fn default() -> Self {
        Self {
            high_water: default_high_water(),
            low_water: default_low_water(),
        }
    }
}

/// `[policy]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicySection {
    /// Keep the built-in private/loopback/link-local/CGN/metadata ranges.
    #[serde(default = "default_true")]
    pub builtin_deny: bool,
    /// Extra CIDRs to deny on top of (or instead of) the built-in list.
    #[serde(default)]
    pub deny_ranges: Vec<String>,
    /// CIDRs of the infrastructure in front of the gateway.
    #[serde(default)]
    pub self_ranges: Vec<String>,
    /// Ports sessions may use; empty allows every port.
    #[serde(default)]
    pub allowed_ports: Vec<u16>,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            builtin_deny: true,
            deny_ranges: Vec::new(),
            self_ranges: Vec::new(),
            allowed_ports: Vec::new(),
        }
    }
}

/// `[protocols.<id>]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProtocolSection {
    #[serde(default)]
    pub default_port: Option<u16>,
}

fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    8470
}
fn default_max_sessions() -> usize {
    256
}
fn default_max_frame_size() -> usize {
    1024 * 1024
}
fn default_max_message_size() -> usize {
    64 * 1024
}
fn default_max_message_hard_cap() -> usize {
    16 * 1024 * 1024
}
fn default_max_buffer_size() -> usize {
    1024 * 1024
}
fn default_max_line_length() -> usize {
    8 * 1024
}
fn default_connect_ms() -> u64 {
    10_000
}
fn default_idle_ms() -> u64 {
    900_000
}
fn default_handshake_ms() -> u64 {
    10_000
}
fn default_resolve_ms() -> u64 {
    5_000
}
fn default_drain_grace_ms() -> u64 {
    2_000
}
fn default_high_water() -> usize {
    1024 * 1024
}
fn default_low_water() -> usize {
    512 * 1024
}
fn default_true() -> bool {
    true
}

/// Values taken from the command line; `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub bind: Option<IpAddr>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub max_sessions: Option<usize>,
    pub connect_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

/// Resolved timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub idle: Duration,
    pub handshake: Duration,
    pub resolve: Duration,
    pub drain_grace: Duration,
}

impl From<TimeoutsSection> for Timeouts {
    fn from(t: TimeoutsSection) -> Self {
        Self {
            connect: Duration::from_millis(t.connect_ms),
            idle: Duration::from_millis(t.idle_ms),
            handshake: Duration::from_millis(t.handshake_ms),
            resolve: Duration::from_millis(t.resolve_ms),
            drain_grace: Duration::from_millis(t.drain_grace_ms),
        }
    }
}

/// Resolved gateway configuration (paths expanded, CLI overrides applied,
/// limits validated).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub max_sessions: usize,
    pub limits: LimitsSection,
    pub timeouts: Timeouts,
    pub backpressure: BackpressureSection,
    pub policy: GatewayPolicy,
    /// Per-protocol default port overrides.
    pub default_ports: HashMap<String, u16>,
}

impl GatewayConfig {
    /// Load config from a TOML file (missing file = defaults), then apply
    /// CLI overrides and validate.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> GateResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| GateError::config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::from_file(file_config, cli)
    }

    /// Merge CLI overrides into a parsed file and validate the result.
    pub fn from_file(file: ConfigFile, cli: CliOverrides) -> GateResult<Self> {
        let mut timeouts = file.timeouts;
        if let Some(ms) = cli.connect_timeout_ms {
            timeouts.connect_ms = ms;
        }
        if let Some(ms) = cli.idle_timeout_ms {
            timeouts.idle_ms = ms;
        }

        let cert = cli.cert.or(file.server.cert);
        let key = cli.key.or(file.server.key);

        let config = Self {
            bind: cli.bind.unwrap_or(file.server.bind),
            port: cli.port.unwrap_or(file.server.port),
            cert_path: cert.as_deref().map(expand_tilde_str),
            key_path: key.as_deref().map(expand_tilde_str),
            max_sessions: cli.max_sessions.unwrap_or(file.server.max_sessions),
            limits: file.limits,
            timeouts: timeouts.into(),
            backpressure: file.backpressure,
            policy: build_policy(&file.policy)?,
            default_ports: file
                .protocols
                .into_iter()
                .filter_map(|(id, section)| section.default_port.map(|p| (id, p)))
                .collect(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> GateResult<()> {
        let l = &self.limits;
        let bp = &self.backpressure;
        if bp.low_water == 0 || bp.low_water >= bp.high_water {
            return Err(GateError::config(format!(
                "backpressure.low_water ({}) must be between 1 and high_water ({})",
                bp.low_water, bp.high_water
            )));
        }
        if l.max_message_size == 0 || l.max_message_size > bp.high_water {
            return Err(GateError::config(format!(
                "limits.max_message_size ({}) must be between 1 and backpressure.high_water ({})",
                l.max_message_size, bp.high_water
            )));
        }
        if l.max_message_size > l.max_message_hard_cap {
            return Err(GateError::config(format!(
                "limits.max_message_size ({}) exceeds max_message_hard_cap ({})",
                l.max_message_size, l.max_message_hard_cap
            )));
        }
        if l.max_line_length == 0 || l.max_frame_size == 0 || l.max_buffer_size == 0 {
            return Err(GateError::config("size limits must be non-zero"));
        }
        if self.max_sessions == 0 {
            return Err(GateError::config("server.max_sessions must be non-zero"));
        }
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(GateError::config("cert and key must be given together"));
        }
        for (id, port) in &self.default_ports {
            if *port == 0 {
                return Err(GateError::config(format!("protocols.{id}.default_port must be non-zero")));
            }
        }
        Ok(())
    }

    /// Accumulation buffer size for one session.
    ///
    /// Never smaller than a frame at `max_frame_size` plus its framing and the
    /// backend read that may arrive behind it, so a frame at the cap decodes.
    pub fn session_buffer_size(&self) -> usize {
        let frame = self
            .limits
            .max_frame_size
            .saturating_add(FRAME_OVERHEAD)
            .saturating_add(READ_CHUNK);
        self.limits.max_buffer_size.max(frame)
    }

    pub fn codec_limits(&self) -> CodecLimits {
        CodecLimits {
            max_frame_size: self.limits.max_frame_size,
            max_line_length: self.limits.max_line_length,
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            cert_path: None,
            key_path: None,
            max_sessions: default_max_sessions(),
            limits: LimitsSection::default(),
            timeouts: TimeoutsSection::default().into(),
            backpressure: BackpressureSection::default(),
            policy: GatewayPolicy::default(),
            default_ports: HashMap::new(),
        }
    }
}

fn build_policy(section: &PolicySection) -> GateResult<GatewayPolicy> {
    let parse = |s: &String| {
        s.parse::<IpNet>()
            .map_err(|e| GateError::config(format!("policy range: {e}")))
    };
    let mut deny_ranges = if section.builtin_deny {
        GatewayPolicy::builtin_deny_ranges()
    } else {
        Vec::new()
    };
    for cidr in &section.deny_ranges {
        deny_ranges.push(DenyRule::new(parse(cidr)?, "denied-range"));
    }
    let self_ranges = section.self_ranges.iter().map(parse).collect::<GateResult<Vec<_>>>()?;
    if section.allowed_ports.contains(&0) {
        return Err(GateError::config("policy.allowed_ports must not contain 0"));
    }
    Ok(GatewayPolicy {
        deny_ranges,
        self_ranges,
        allowed_ports: section.allowed_ports.clone(),
    })
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = GatewayConfig::from_file(ConfigFile::default(), CliOverrides::default()).unwrap();
        assert_eq!(cfg.port, 8470);
        assert_eq!(cfg.max_sessions, 256);
        assert_eq!(cfg.timeouts.idle, Duration::from_secs(900));
        assert_eq!(cfg.timeouts.connect, Duration::from_secs(10));
        assert_eq!(cfg.backpressure.high_water, 1024 * 1024);
        assert_eq!(cfg.backpressure.low_water, 512 * 1024);
        assert_eq!(cfg.limits.max_message_size, 64 * 1024);
        assert!(!cfg.tls_enabled());
        assert_eq!(cfg.policy.deny_ranges.len(), GatewayPolicy::builtin_deny_ranges().len());
    }

    #[test]
    fn test_load_file_with_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
port = 9000
max_sessions = 8

[timeouts]
idle_ms = 5000
handshake_ms = 250

[policy]
builtin_deny = false
deny_ranges = ["198.51.100.0/24"]
self_ranges = ["203.0.113.5"]
allowed_ports = [7, 79, 110]

[protocols.pop3]
default_port = 1110
"#
        )
        .unwrap();

        let cli = CliOverrides {
            port: Some(9100),
            idle_timeout_ms: Some(1234),
            ..CliOverrides::default()
        };
        let cfg = GatewayConfig::load(Some(file.path()), cli).unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.max_sessions, 8);
        assert_eq!(cfg.timeouts.idle, Duration::from_millis(1234));
        assert_eq!(cfg.timeouts.handshake, Duration::from_millis(250));
        assert_eq!(cfg.policy.deny_ranges.len(), 1);
        assert_eq!(cfg.policy.deny_ranges[0].label, "denied-range");
        assert_eq!(cfg.policy.self_ranges.len(), 1);
        assert_eq!(cfg.policy.allowed_ports, vec![7, 79, 110]);
        assert_eq!(cfg.default_ports.get("pop3"), Some(&1110));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = GatewayConfig::load(Some(&dir.path().join("absent.toml")), CliOverrides::default())
            .unwrap();
        assert_eq!(cfg.port, 8470);
    }

    #[test]
    fn test_rejects_inverted_water_marks() {
        let file: ConfigFile = toml::from_str(
            r#"
[backpressure]
high_water = 1000
low_water = 1000
"#,
        )
        .unwrap();
        assert!(GatewayConfig::from_file(file, CliOverrides::default()).is_err());
    }

    #[test]
    fn test_rejects_zero_low_water() {
        let file: ConfigFile = toml::from_str(
            r#"
[backpressure]
high_water = 100
low_water = 0
"#,
        )
        .unwrap();
        let err = GatewayConfig::from_file(file, CliOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("low_water"), "{err}");
    }

    #[test]
    fn test_buffer_fits_frame_at_cap() {
        let mut cfg = GatewayConfig::default();
        cfg.limits.max_frame_size = 4096;
        cfg.limits.max_buffer_size = 4096;
        assert!(cfg.session_buffer_size() >= 4096 + 4 + READ_CHUNK);

        cfg.limits.max_buffer_size = 8 * 1024 * 1024;
        assert_eq!(cfg.session_buffer_size(), 8 * 1024 * 1024);
    }

    #[test]
    fn test_rejects_message_size_above_high_water() {
        let file: ConfigFile = toml::from_str(
            r#"
[limits]
max_message_size = 4096
[backpressure]
high_water = 2048
low_water = 1024
"#,
        )
        .unwrap();
        assert!(GatewayConfig::from_file(file, CliOverrides::default()).is_err());
    }

    #[test]
    fn test_rejects_bad_cidr_and_unknown_keys() {
        let file: ConfigFile = toml::from_str("[policy]\nself_ranges = [\"10.0.0.0/40\"]\n").unwrap();
        assert!(GatewayConfig::from_file(file, CliOverrides::default()).is_err());
        assert!(toml::from_str::<ConfigFile>("[nonsense]\nx = 1\n").is_err());
    }

    #[test]
    fn test_cert_without_key_rejected() {
        let cli = CliOverrides {
            cert: Some("/tmp/cert.pem".into()),
            ..CliOverrides::default()
        };
        assert!(GatewayConfig::from_file(ConfigFile::default(), cli).is_err());
    }
}

//! Typed values decoded from control replies.
//!
//! Circuit and stream status lines are parsed best-effort: a line that is
//! too short or carries a non-numeric identifier yields `None` and is
//! skipped by the caller.

use crate::error::Error;
use std::fmt;
use std::str::FromStr;

/// A circuit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitId(pub u64);

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CircuitId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CircuitId(s.parse()?))
    }
}

/// A stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(StreamId(s.parse()?))
    }
}

/// A relay fingerprint (40 hex characters), stored upper-case without `$`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Get the fingerprint as a string (without `$` prefix).
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_start_matches('$');
        if s.len() != 40 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::protocol(
                "parse_fingerprint",
                format!("invalid fingerprint '{}': must be 40 hex characters", s),
            ));
        }
        Ok(Fingerprint(s.to_uppercase()))
    }
}

/// A hop in a circuit path: nickname, fingerprint, or both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerSpec {
    /// Just a nickname.
    Nickname(String),
    /// Just a fingerprint.
    Fingerprint(Fingerprint),
    /// Fingerprint with associated nickname.
    LongName {
        /// The relay fingerprint.
        fingerprint: Fingerprint,
        /// The relay nickname.
        nickname: String,
    },
}

impl fmt::Display for ServerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerSpec::Nickname(n) => write!(f, "{}", n),
            ServerSpec::Fingerprint(fp) => write!(f, "${}", fp),
            ServerSpec::LongName {
                fingerprint,
                nickname,
            } => write!(f, "${}~{}", fingerprint, nickname),
        }
    }
}

impl FromStr for ServerSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(rest) = s.strip_prefix('$') else {
            return Ok(ServerSpec::Nickname(s.to_string()));
        };
        match rest.find(['~', '=']) {
            Some(sep) => Ok(ServerSpec::LongName {
                fingerprint: rest[..sep].parse()?,
                nickname: rest[sep + 1..].to_string(),
            }),
            None => Ok(ServerSpec::Fingerprint(rest.parse()?)),
        }
    }
}

/// Status of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    /// Circuit ID assigned to new circuit.
    Launched,
    /// All hops finished, can now accept streams.
    Built,
    /// Built, waiting to see if a circuit with a better guard will be usable.
    GuardWait,
    /// One more hop has been completed.
    Extended,
    /// Circuit closed (was not built).
    Failed,
    /// Circuit closed (was built).
    Closed,
    /// Unknown status.
    Unknown,
}

impl CircuitStatus {
    fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "LAUNCHED" => CircuitStatus::Launched,
            "BUILT" => CircuitStatus::Built,
            "GUARD_WAIT" => CircuitStatus::GuardWait,
            "EXTENDED" => CircuitStatus::Extended,
            "FAILED" => CircuitStatus::Failed,
            "CLOSED" => CircuitStatus::Closed,
            _ => CircuitStatus::Unknown,
        }
    }
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitStatus::Launched => "LAUNCHED",
            CircuitStatus::Built => "BUILT",
            CircuitStatus::GuardWait => "GUARD_WAIT",
            CircuitStatus::Extended => "EXTENDED",
            CircuitStatus::Failed => "FAILED",
            CircuitStatus::Closed => "CLOSED",
            CircuitStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Purpose of a circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitPurpose {
    /// General circuit for AP and/or directory request streams.
    General,
    /// Hidden service client-side introduction-point circuit.
    HsClientIntro,
    /// Hidden service client-side rendezvous circuit.
    HsClientRend,
    /// Hidden service service-side introduction-point circuit.
    HsServiceIntro,
    /// Hidden service service-side rendezvous circuit.
    HsServiceRend,
    /// Reachability-testing circuit.
    Testing,
    /// Circuit built by a controller.
    Controller,
    /// Circuit being kept around to see how long it takes.
    MeasureTimeout,
    /// Circuit created ahead of time for HS vanguards.
    HsVanguards,
    /// Any other purpose, kept verbatim.
    Other(String),
}

impl CircuitPurpose {
    fn parse(s: &str) -> Self {
        match s {
            "GENERAL" => CircuitPurpose::General,
            "HS_CLIENT_INTRO" => CircuitPurpose::HsClientIntro,
            "HS_CLIENT_REND" => CircuitPurpose::HsClientRend,
            "HS_SERVICE_INTRO" => CircuitPurpose::HsServiceIntro,
            "HS_SERVICE_REND" => CircuitPurpose::HsServiceRend,
            "TESTING" => CircuitPurpose::Testing,
            "CONTROLLER" => CircuitPurpose::Controller,
            "MEASURE_TIMEOUT" => CircuitPurpose::MeasureTimeout,
            "HS_VANGUARDS" => CircuitPurpose::HsVanguards,
            other => CircuitPurpose::Other(other.to_string()),
        }
    }
}

/// Status of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// New request to connect.
    New,
    /// New request to resolve an address.
    NewResolve,
    /// Address re-mapped to another.
    Remap,
    /// Sent a connect message along a circuit.
    SentConnect,
    /// Sent a resolve message along a circuit.
    SentResolve,
    /// Received a reply; stream established.
    Succeeded,
    /// Stream failed and not retriable.
    Failed,
    /// Stream closed.
    Closed,
    /// Detached from circuit; still retriable.
    Detached,
    /// Waiting for a controller to attach the stream.
    ControllerWait,
    /// Unknown status.
    Unknown,
}

impl StreamStatus {
    fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "NEW" => StreamStatus::New,
            "NEWRESOLVE" => StreamStatus::NewResolve,
            "REMAP" => StreamStatus::Remap,
            "SENTCONNECT" => StreamStatus::SentConnect,
            "SENTRESOLVE" => StreamStatus::SentResolve,
            "SUCCEEDED" => StreamStatus::Succeeded,
            "FAILED" => StreamStatus::Failed,
            "CLOSED" => StreamStatus::Closed,
            "DETACHED" => StreamStatus::Detached,
            "CONTROLLER_WAIT" => StreamStatus::ControllerWait,
            _ => StreamStatus::Unknown,
        }
    }
}

/// A signal sent with the `SIGNAL` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Reload configuration.
    Reload,
    /// Controlled shutdown.
    Shutdown,
    /// Dump stats.
    Dump,
    /// Switch all open logs to debug.
    Debug,
    /// Immediate shutdown.
    Halt,
    /// Switch to clean circuits for new streams.
    NewNym,
    /// Forget client-side cached IPs.
    ClearDnsCache,
    /// Log an unscheduled heartbeat.
    Heartbeat,
    /// Become dormant.
    Dormant,
    /// Stop being dormant.
    Active,
}

impl Signal {
    /// Get the signal name as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Reload => "RELOAD",
            Signal::Shutdown => "SHUTDOWN",
            Signal::Dump => "DUMP",
            Signal::Debug => "DEBUG",
            Signal::Halt => "HALT",
            Signal::NewNym => "NEWNYM",
            Signal::ClearDnsCache => "CLEARDNSCACHE",
            Signal::Heartbeat => "HEARTBEAT",
            Signal::Dormant => "DORMANT",
            Signal::Active => "ACTIVE",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The daemon's version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorVersion {
    /// The full version string.
    pub version_string: String,
    /// Major version number.
    pub major: u32,
    /// Minor version number.
    pub minor: u32,
    /// Micro version number.
    pub micro: u32,
    /// Patch version number.
    pub patch: u32,
}

impl FromStr for TorVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "0.4.8.10", "Tor 0.4.8.10" or "0.4.8.10-dev (git-...)"
        let numeric = s
            .strip_prefix("Tor ")
            .unwrap_or(s)
            .split(|c: char| !c.is_ascii_digit() && c != '.')
            .next()
            .unwrap_or("");

        let mut parts = numeric.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
        Ok(TorVersion {
            version_string: s.to_string(),
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            micro: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
        })
    }
}

impl fmt::Display for TorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.version_string)
    }
}

/// Onion service address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OnionAddress {
    service_id: String,
}

impl OnionAddress {
    /// Create an address from a service ID, with or without `.onion`.
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        let service_id = address
            .strip_suffix(".onion")
            .map(str::to_string)
            .unwrap_or(address);
        OnionAddress { service_id }
    }

    /// The service ID (address without `.onion`).
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// The full address with `.onion`.
    pub fn full_address(&self) -> String {
        format!("{}.onion", self.service_id)
    }

    /// Check if this is a v3 onion address (56 characters).
    pub fn is_v3(&self) -> bool {
        self.service_id.len() == 56
    }
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.onion", self.service_id)
    }
}

/// One line of `GETINFO circuit-status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitInfo {
    /// Circuit ID.
    pub id: CircuitId,
    /// Circuit status.
    pub status: CircuitStatus,
    /// Path of relays, empty while launching.
    pub path: Vec<ServerSpec>,
    /// `BUILD_FLAGS=` entries.
    pub build_flags: Vec<String>,
    /// `PURPOSE=` value.
    pub purpose: Option<CircuitPurpose>,
    /// `TIME_CREATED=` value, as sent.
    pub time_created: Option<String>,
}

/// One line of `GETINFO stream-status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Stream ID.
    pub id: StreamId,
    /// Stream status.
    pub status: StreamStatus,
    /// Circuit the stream is attached to (0 when detached).
    pub circuit_id: CircuitId,
    /// Target address:port.
    pub target: String,
    /// `PURPOSE=` value.
    pub purpose: Option<String>,
}

fn is_keyword_token(token: &str) -> bool {
    match token.find('=') {
        Some(pos) if pos > 0 => token[..pos]
            .chars()
            .all(|c| c.is_ascii_uppercase() || c == '_'),
        _ => false,
    }
}

/// Parse one circuit-status line: `ID STATUS [PATH] [KEY=value ...]`.
pub fn parse_circuit_line(line: &str) -> Option<CircuitInfo> {
    let mut tokens = line.split_whitespace();
    let id = tokens.next()?.parse().ok()?;
    let status = CircuitStatus::parse(tokens.next()?);

    let mut info = CircuitInfo {
        id,
        status,
        path: Vec::new(),
        build_flags: Vec::new(),
        purpose: None,
        time_created: None,
    };

    for (i, token) in tokens.enumerate() {
        if i == 0 && !is_keyword_token(token) {
            info.path = token
                .split(',')
                .filter_map(|hop| hop.parse().ok())
                .collect();
        } else if let Some(flags) = token.strip_prefix("BUILD_FLAGS=") {
            info.build_flags = flags.split(',').map(str::to_string).collect();
        } else if let Some(purpose) = token.strip_prefix("PURPOSE=") {
            info.purpose = Some(CircuitPurpose::parse(purpose));
        } else if let Some(created) = token.strip_prefix("TIME_CREATED=") {
            info.time_created = Some(created.to_string());
        }
    }

    Some(info)
}

/// Parse one stream-status line: `ID STATUS CIRCID TARGET [PURPOSE=value ...]`.
pub fn parse_stream_line(line: &str) -> Option<StreamInfo> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 4 {
        return None;
    }

    Some(StreamInfo {
        id: tokens[0].parse().ok()?,
        status: StreamStatus::parse(tokens[1]),
        circuit_id: tokens[2].parse().ok()?,
        target: tokens[3].to_string(),
        purpose: tokens[4..]
            .iter()
            .find_map(|t| t.strip_prefix("PURPOSE="))
            .map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP_A: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

    #[test]
    fn test_server_spec_parsing() {
        assert!(matches!(
            "MyRelay".parse::<ServerSpec>().unwrap(),
            ServerSpec::Nickname(_)
        ));
        assert!(matches!(
            format!("${}", FP_A).parse::<ServerSpec>().unwrap(),
            ServerSpec::Fingerprint(_)
        ));

        let long: ServerSpec = format!("${}=Guard", FP_A.to_lowercase()).parse().unwrap();
        assert_eq!(long.to_string(), format!("${}~Guard", FP_A));
        assert!("$tooshort".parse::<ServerSpec>().is_err());
    }

    #[test]
    fn test_circuit_line_full() {
        let line = format!(
            "7 BUILT ${fp}~Guard,${fp}~Middle BUILD_FLAGS=IS_INTERNAL,NEED_CAPACITY PURPOSE=HS_CLIENT_REND TIME_CREATED=2024-01-01T00:00:00.000000",
            fp = FP_A
        );
        let info = parse_circuit_line(&line).unwrap();
        assert_eq!(info.id, CircuitId(7));
        assert_eq!(info.status, CircuitStatus::Built);
        assert_eq!(info.path.len(), 2);
        assert_eq!(info.build_flags, ["IS_INTERNAL", "NEED_CAPACITY"]);
        assert_eq!(info.purpose, Some(CircuitPurpose::HsClientRend));
        assert_eq!(
            info.time_created.as_deref(),
            Some("2024-01-01T00:00:00.000000")
        );
    }

    #[test]
    fn test_circuit_line_without_path() {
        let info = parse_circuit_line("3 LAUNCHED BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL").unwrap();
        assert!(info.path.is_empty());
        assert_eq!(info.build_flags, ["NEED_CAPACITY"]);
        assert_eq!(info.purpose, Some(CircuitPurpose::General));
    }

    #[test]
    fn test_malformed_circuit_lines() {
        assert!(parse_circuit_line("").is_none());
        assert!(parse_circuit_line("12").is_none());
        assert!(parse_circuit_line("abc BUILT").is_none());
    }

    #[test]
    fn test_stream_line() {
        let info =
            parse_stream_line("21 SUCCEEDED 7 example.com:443 SOURCE_ADDR=127.0.0.1:5000 PURPOSE=USER")
                .unwrap();
        assert_eq!(info.id, StreamId(21));
        assert_eq!(info.status, StreamStatus::Succeeded);
        assert_eq!(info.circuit_id, CircuitId(7));
        assert_eq!(info.target, "example.com:443");
        assert_eq!(info.purpose.as_deref(), Some("USER"));

        assert!(parse_stream_line("21 SUCCEEDED 7").is_none());
    }

    #[test]
    fn test_tor_version_parsing() {
        let v: TorVersion = "0.4.8.10".parse().unwrap();
        assert_eq!((v.major, v.minor, v.micro, v.patch), (0, 4, 8, 10));

        let v: TorVersion = "Tor 0.4.7.1-alpha".parse().unwrap();
        assert_eq!((v.minor, v.patch), (4, 1));
        assert_eq!(v.to_string(), "Tor 0.4.7.1-alpha");
    }

    #[test]
    fn test_onion_address() {
        let addr = OnionAddress::new("abc123.onion");
        assert_eq!(addr.service_id(), "abc123");
        assert_eq!(addr.full_address(), "abc123.onion");
        assert_eq!(addr.to_string(), "abc123.onion");
        assert!(!addr.is_v3());
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(Signal::NewNym.as_str(), "NEWNYM");
        assert_eq!(Signal::ClearDnsCache.to_string(), "CLEARDNSCACHE");
    }
}

//! Authentication material and token derivation for the control port.
//!
//! [`AuthMaterial`] holds up to three credentials; the first non-empty one
//! in priority order (password, cookie file, raw cookie bytes) derives the
//! token sent with `AUTHENTICATE`. SAFECOOKIE helpers are provided for
//! daemons that only accept the challenge/response flow.

use crate::error::{Error, Result};
use crate::protocol::{parse_key_value_pairs, quote_string};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::path::{Path, PathBuf};

type HmacSha256 = Hmac<Sha256>;

/// Length of the daemon's authentication cookie.
pub const COOKIE_LEN: usize = 32;

/// Credentials used to derive the `AUTHENTICATE` token.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthMaterial {
    password: Option<String>,
    cookie_path: Option<PathBuf>,
    cookie: Option<Vec<u8>>,
}

impl AuthMaterial {
    /// No credentials; authenticates with an empty token.
    pub fn none() -> Self {
        Self::default()
    }

    /// Password credentials.
    pub fn password(password: impl Into<String>) -> Self {
        Self::default().with_password(password)
    }

    /// Cookie file credentials.
    pub fn cookie_file(path: impl Into<PathBuf>) -> Self {
        Self::default().with_cookie_file(path)
    }

    /// Raw cookie bytes.
    pub fn cookie(bytes: impl Into<Vec<u8>>) -> Self {
        Self::default().with_cookie(bytes)
    }

    /// Add a password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Add a cookie file path.
    pub fn with_cookie_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cookie_path = Some(path.into());
        self
    }

    /// Add raw cookie bytes.
    pub fn with_cookie(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.cookie = Some(bytes.into());
        self
    }

    /// Whether no credential is set.
    pub fn is_empty(&self) -> bool {
        self.active() == Credential::None
    }

    fn active(&self) -> Credential<'_> {
        if let Some(p) = self.password.as_deref().filter(|p| !p.is_empty()) {
            return Credential::Password(p);
        }
        if let Some(path) = self
            .cookie_path
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
        {
            return Credential::CookieFile(path);
        }
        if let Some(bytes) = self.cookie.as_deref().filter(|b| !b.is_empty()) {
            return Credential::Cookie(bytes);
        }
        Credential::None
    }

    /// Derive the `AUTHENTICATE` argument.
    ///
    /// Returns a quoted password, a hex-encoded cookie, or `None` when no
    /// credential is set. Reading the cookie file happens here, once.
    pub fn token(&self) -> Result<Option<String>> {
        match self.active() {
            Credential::Password(p) => Ok(Some(quote_string(p))),
            Credential::CookieFile(path) => {
                let cookie = read_cookie_file(path)?;
                Ok(Some(format_cookie_hex(&cookie)))
            }
            Credential::Cookie(bytes) => Ok(Some(format_cookie_hex(bytes))),
            Credential::None => Ok(None),
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthMaterial")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("cookie_path", &self.cookie_path)
            .field("cookie", &self.cookie.as_ref().map(|c| c.len()))
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Credential<'a> {
    Password(&'a str),
    CookieFile(&'a Path),
    Cookie(&'a [u8]),
    None,
}

/// Authentication methods advertised by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication required.
    Null,
    /// Password authentication.
    HashedPassword,
    /// Cookie file authentication.
    Cookie,
    /// Safe cookie authentication (HMAC-based).
    SafeCookie,
}

impl AuthMethod {
    /// Parse an auth method from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NULL" => Some(AuthMethod::Null),
            "HASHEDPASSWORD" => Some(AuthMethod::HashedPassword),
            "COOKIE" => Some(AuthMethod::Cookie),
            "SAFECOOKIE" => Some(AuthMethod::SafeCookie),
            _ => None,
        }
    }
}

/// Information retrieved from the `PROTOCOLINFO` command.
#[derive(Debug, Clone, Default)]
pub struct ProtocolInfo {
    /// Protocol version (currently always 1).
    pub protocol_version: u32,
    /// Daemon version string.
    pub tor_version: String,
    /// Supported authentication methods.
    pub auth_methods: Vec<AuthMethod>,
    /// Path to the cookie file, if advertised.
    pub cookie_file: Option<PathBuf>,
}

impl ProtocolInfo {
    /// Parse `PROTOCOLINFO` reply lines.
    pub fn parse(lines: &[String]) -> Self {
        let mut info = ProtocolInfo {
            protocol_version: 1,
            ..Default::default()
        };

        for line in lines {
            let line = line.trim();

            if let Some(rest) = line.strip_prefix("PROTOCOLINFO ") {
                info.protocol_version = rest.trim().parse().unwrap_or(1);
            } else if let Some(rest) = line.strip_prefix("AUTH ") {
                let pairs = parse_key_value_pairs(rest);
                if let Some(methods) = pairs.get("METHODS") {
                    info.auth_methods = methods.split(',').filter_map(AuthMethod::parse).collect();
                }
                info.cookie_file = pairs
                    .get("COOKIEFILE")
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from);
            } else if let Some(rest) = line.strip_prefix("VERSION ") {
                if let Some(ver) = parse_key_value_pairs(rest).remove("Tor") {
                    info.tor_version = ver;
                }
            }
        }

        info
    }

    /// Check if NULL authentication is supported.
    pub fn supports_null(&self) -> bool {
        self.auth_methods.contains(&AuthMethod::Null)
    }

    /// Check if cookie authentication is supported.
    pub fn supports_cookie(&self) -> bool {
        self.auth_methods.contains(&AuthMethod::Cookie)
    }

    /// Check if safe cookie authentication is supported.
    pub fn supports_safe_cookie(&self) -> bool {
        self.auth_methods.contains(&AuthMethod::SafeCookie)
    }
}

/// Read the authentication cookie from a file.
pub fn read_cookie_file(path: &Path) -> Result<Vec<u8>> {
    let data = std::fs::read(path).map_err(|e| {
        Error::auth(
            "read_cookie",
            format!("failed to read cookie file '{}'", path.display()),
        )
        .with_source(e)
    })?;

    if data.len() != COOKIE_LEN {
        return Err(Error::auth(
            "read_cookie",
            format!(
                "cookie file has invalid length {} (expected {})",
                data.len(),
                COOKIE_LEN
            ),
        ));
    }

    Ok(data)
}

/// Format cookie data as hex for the `AUTHENTICATE` command.
pub fn format_cookie_hex(cookie: &[u8]) -> String {
    hex::encode_upper(cookie)
}

/// Generate a random client nonce for SAFECOOKIE authentication.
pub fn generate_client_nonce() -> [u8; 32] {
    use rand::Rng;
    let mut nonce = [0u8; 32];
    rand::rng().fill(&mut nonce);
    nonce
}

fn safe_cookie_hmac(key: &[u8], cookie: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key length should be valid");
    mac.update(cookie);
    mac.update(client_nonce);
    mac.update(server_nonce);

    let mut hash = [0u8; 32];
    hash.copy_from_slice(&mac.finalize().into_bytes());
    hash
}

/// Compute the server hash for SAFECOOKIE authentication.
pub fn compute_server_hash(cookie: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> [u8; 32] {
    safe_cookie_hmac(
        b"Tor safe cookie authentication server-to-controller hash",
        cookie,
        client_nonce,
        server_nonce,
    )
}

/// Compute the client hash for SAFECOOKIE authentication.
pub fn compute_client_hash(cookie: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> [u8; 32] {
    safe_cookie_hmac(
        b"Tor safe cookie authentication controller-to-server hash",
        cookie,
        client_nonce,
        server_nonce,
    )
}

/// Parse the `AUTHCHALLENGE` response into (server hash, server nonce).
pub fn parse_authchallenge_response(text: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let pairs = parse_key_value_pairs(text);
    let decode = |key: &str| -> Result<Vec<u8>> {
        let value = pairs
            .get(key)
            .ok_or_else(|| Error::protocol("authchallenge", format!("missing {}", key)))?;
        let bytes = hex::decode(value).map_err(|e| {
            Error::protocol("authchallenge", format!("invalid {} hex", key)).with_source(e)
        })?;
        if bytes.len() != 32 {
            return Err(Error::protocol(
                "authchallenge",
                format!("invalid {} length: {}", key, bytes.len()),
            ));
        }
        Ok(bytes)
    };

    Ok((decode("SERVERHASH")?, decode("SERVERNONCE")?))
}

/// Verify the server's response in SAFECOOKIE authentication.
pub fn verify_server_hash(
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
    expected_hash: &[u8],
) -> bool {
    let computed = compute_server_hash(cookie, client_nonce, server_nonce);
    constant_time_compare(&computed, expected_hash)
}

fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;

    #[test]
    fn test_token_priority() {
        let material = AuthMaterial::cookie(vec![0xAB; 4])
            .with_password("secret")
            .with_cookie_file("/nonexistent");
        assert_eq!(material.token().unwrap(), Some("\"secret\"".to_string()));

        let material = AuthMaterial::cookie(vec![0xAB, 0x01]).with_password("");
        assert_eq!(material.token().unwrap(), Some("AB01".to_string()));

        assert_eq!(AuthMaterial::none().token().unwrap(), None);
        assert!(AuthMaterial::none().is_empty());
    }

    #[test]
    fn test_token_from_cookie_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x11; COOKIE_LEN]).unwrap();

        let material = AuthMaterial::cookie_file(file.path()).with_cookie(vec![0xFF]);
        assert_eq!(material.token().unwrap(), Some("11".repeat(COOKIE_LEN)));
    }

    #[test]
    fn test_unreadable_cookie_is_auth_error() {
        let err = AuthMaterial::cookie_file("/definitely/not/here")
            .token()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        assert!(read_cookie_file(file.path()).is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let shown = format!("{:?}", AuthMaterial::password("hunter2"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_protocol_info_parsing() {
        let lines = vec![
            "PROTOCOLINFO 1".to_string(),
            "AUTH METHODS=NULL,COOKIE,SAFECOOKIE COOKIEFILE=\"/var/lib/tor/control auth cookie\""
                .to_string(),
            "VERSION Tor=\"0.4.8.10\"".to_string(),
        ];

        let info = ProtocolInfo::parse(&lines);
        assert_eq!(info.protocol_version, 1);
        assert_eq!(info.tor_version, "0.4.8.10");
        assert!(info.supports_null());
        assert!(info.supports_cookie());
        assert!(info.supports_safe_cookie());
        assert_eq!(
            info.cookie_file,
            Some(PathBuf::from("/var/lib/tor/control auth cookie"))
        );
    }

    #[test]
    fn test_client_nonce_generation() {
        assert_ne!(generate_client_nonce(), generate_client_nonce());
    }

    #[test]
    fn test_hmac_computation() {
        let cookie = [0u8; 32];
        let client_nonce = [1u8; 32];
        let server_nonce = [2u8; 32];

        let server_hash = compute_server_hash(&cookie, &client_nonce, &server_nonce);
        let client_hash = compute_client_hash(&cookie, &client_nonce, &server_nonce);
        assert_ne!(server_hash, client_hash);

        assert!(verify_server_hash(&cookie, &client_nonce, &server_nonce, &server_hash));
        assert!(!verify_server_hash(&cookie, &client_nonce, &server_nonce, &client_hash));
    }

    #[test]
    fn test_authchallenge_parsing() {
        let text = format!(
            "AUTHCHALLENGE SERVERHASH={} SERVERNONCE={}",
            "AA".repeat(32),
            "BB".repeat(32)
        );
        let (hash, nonce) = parse_authchallenge_response(&text).unwrap();
        assert_eq!(hash, vec![0xAA; 32]);
        assert_eq!(nonce, vec![0xBB; 32]);

        assert!(parse_authchallenge_response("AUTHCHALLENGE SERVERHASH=00").is_err());
    }
}

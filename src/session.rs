//! Control-port session.
//!
//! A [`ControlSession`] owns one connection to the control endpoint. The
//! protocol has no request identifiers, so every command/reply cycle runs
//! under a single lock; concurrent callers queue and execute strictly one at
//! a time. Privileged commands authenticate lazily, once, inside the same
//! lock.
//!
//! [`CookieDiscovery`] locates and validates the authentication cookie while
//! the daemon is still starting up.

use crate::auth::{
    compute_client_hash, format_cookie_hex, generate_client_nonce, parse_authchallenge_response,
    read_cookie_file, verify_server_hash, AuthMaterial, ProtocolInfo,
};
use crate::connector::{Connector, TcpConnector};
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{command_keyword, format_command, quote_string, read_reply, Reply};
use crate::types::{
    parse_circuit_line, parse_stream_line, CircuitInfo, Signal, StreamInfo, TorVersion,
};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{
    split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Default per-command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

struct Channel<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: BufWriter<WriteHalf<S>>,
    authenticated: bool,
    // Set from the first byte written until the reply is fully read.
    in_flight: bool,
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn round_trip(&mut self, command: &str, op: &'static str) -> Result<Reply> {
        match command_keyword(command) {
            "AUTHENTICATE" | "AUTHCHALLENGE" | "ADD_ONION" => {
                trace!("Sending command: {} <redacted>", command_keyword(command))
            }
            _ => trace!("Sending command: {}", command.trim_end()),
        }

        self.in_flight = true;
        self.writer
            .write_all(command.as_bytes())
            .await
            .map_err(|e| Error::io(op, e))?;
        self.writer.flush().await.map_err(|e| Error::io(op, e))?;

        let result = read_reply(&mut self.reader, op).await;
        match &result {
            Ok(_) => self.in_flight = false,
            // Error replies are read to their end line too.
            Err(e) if matches!(e.kind(), ErrorKind::Command { .. }) => self.in_flight = false,
            Err(_) => {}
        }
        result
    }

    async fn authenticate(&mut self, auth: &AuthMaterial) -> Result<()> {
        let command = match auth.token()? {
            Some(token) => format_command("AUTHENTICATE", &[&token]),
            None => format_command("AUTHENTICATE", &[]),
        };
        self.round_trip(&command, "authenticate")
            .await
            .map_err(auth_failure)?;
        self.authenticated = true;
        Ok(())
    }
}

fn auth_failure(err: Error) -> Error {
    match err.kind() {
        ErrorKind::Command { .. } => {
            Error::auth("authenticate", err.message().to_string()).with_source(err)
        }
        _ => err,
    }
}

/// The channel in `slot`, unless a previous cycle was abandoned mid-reply;
/// such a channel is dropped since its next read would return a stale reply.
fn live_channel<'a, S>(
    slot: &'a mut Option<Channel<S>>,
    op: &'static str,
) -> Result<&'a mut Channel<S>> {
    if slot.as_ref().is_some_and(|c| c.in_flight) {
        warn!(op, "previous command abandoned mid-reply, dropping control connection");
        *slot = None;
    }
    slot.as_mut()
        .ok_or_else(|| Error::new(ErrorKind::Io, op, "session is closed"))
}

/// Drop the channel if the cycle behind `result` stopped mid-reply.
fn settle<S, T>(slot: &mut Option<Channel<S>>, op: &'static str, result: &Result<T>) {
    if slot.as_ref().is_some_and(|c| c.in_flight) {
        if let Err(e) = result {
            warn!(op, error = %e, "dropping control connection");
        }
        *slot = None;
    }
}

fn terminate(command: &str) -> String {
    if command.ends_with("\r\n") {
        command.to_string()
    } else {
        format!("{}\r\n", command.trim_end_matches(['\r', '\n']))
    }
}

/// An authenticated, serialized control-port session.
pub struct ControlSession<S = TcpStream> {
    channel: Mutex<Option<Channel<S>>>,
    auth: AuthMaterial,
    timeout: Duration,
    skipped: AtomicUsize,
}

impl ControlSession<TcpStream> {
    /// Connect over TCP to a control endpoint.
    pub async fn connect(addr: &str, auth: AuthMaterial, timeout: Duration) -> Result<Self> {
        Self::connect_with(&TcpConnector, addr, auth, timeout).await
    }
}

impl<S> ControlSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Connect to a control endpoint through `connector`.
    pub async fn connect_with<C>(
        connector: &C,
        addr: &str,
        auth: AuthMaterial,
        timeout: Duration,
    ) -> Result<Self>
    where
        C: Connector<Stream = S>,
    {
        let stream = connector
            .connect(addr, Instant::now() + timeout)
            .await
            .map_err(|e| e.in_op("connect_control"))?;
        debug!(addr, "connected to control endpoint");
        Ok(Self::from_stream(stream, auth, timeout))
    }

    /// Wrap an already-connected stream.
    pub fn from_stream(stream: S, auth: AuthMaterial, timeout: Duration) -> Self {
        let (read_half, write_half) = split(stream);
        Self {
            channel: Mutex::new(Some(Channel {
                reader: BufReader::new(read_half),
                writer: BufWriter::new(write_half),
                authenticated: false,
                in_flight: false,
            })),
            auth,
            timeout,
            skipped: AtomicUsize::new(0),
        }
    }

    /// The configured per-command timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of malformed reply or status lines skipped so far.
    pub fn skipped_lines(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Whether the session has authenticated.
    pub async fn is_authenticated(&self) -> bool {
        self.channel
            .lock()
            .await
            .as_ref()
            .map(|c| c.authenticated)
            .unwrap_or(false)
    }

    /// Whether the session has been closed, explicitly, after a transport
    /// failure, or because a caller abandoned a command mid-reply.
    pub async fn is_closed(&self) -> bool {
        self.channel
            .lock()
            .await
            .as_ref()
            .map_or(true, |c| c.in_flight)
    }

    async fn run(
        &self,
        op: &'static str,
        command: &str,
        privileged: bool,
        deadline: Option<Instant>,
    ) -> Result<Reply> {
        let command = terminate(command);
        let mut guard = self.channel.lock().await;
        let channel = live_channel(&mut *guard, op)?;

        let session_deadline = Instant::now() + self.timeout;
        let deadline = deadline.map_or(session_deadline, |d| d.min(session_deadline));

        let cycle = async {
            if privileged && !channel.authenticated {
                channel.authenticate(&self.auth).await?;
                info!("authenticated with control port");
            }
            channel.round_trip(&command, op).await
        };

        let result = match tokio::time::timeout_at(deadline, cycle).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(op)),
        };

        if let Ok(reply) = &result {
            self.skipped.fetch_add(reply.skipped(), Ordering::Relaxed);
        }
        settle(&mut *guard, op, &result);
        result
    }

    /// Execute a command, authenticating first if needed.
    pub async fn execute(&self, command: &str) -> Result<Reply> {
        self.run("execute", command, true, None).await
    }

    /// Execute a command with a caller deadline.
    ///
    /// The effective deadline is the earlier of `deadline` and the session
    /// timeout.
    pub async fn execute_until(&self, command: &str, deadline: Instant) -> Result<Reply> {
        self.run("execute", command, true, Some(deadline)).await
    }

    /// Execute a command without authenticating first.
    pub async fn execute_unauthenticated(&self, command: &str) -> Result<Reply> {
        self.run("execute", command, false, None).await
    }

    /// Authenticate using the session's [`AuthMaterial`].
    pub async fn authenticate(&self) -> Result<()> {
        let mut guard = self.channel.lock().await;
        let channel = live_channel(&mut *guard, "authenticate")?;
        let deadline = Instant::now() + self.timeout;

        let attempt = tokio::time::timeout_at(deadline, channel.authenticate(&self.auth)).await;
        let result = match attempt {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("authenticate")),
        };
        settle(&mut *guard, "authenticate", &result);
        result?;
        info!("authenticated with control port");
        Ok(())
    }

    /// Authenticate with the SAFECOOKIE challenge/response flow.
    pub async fn authenticate_safe_cookie(&self, cookie_path: &Path) -> Result<()> {
        let cookie = read_cookie_file(cookie_path)?;
        let client_nonce = generate_client_nonce();

        let challenge = format_command(
            "AUTHCHALLENGE",
            &["SAFECOOKIE", &hex::encode_upper(client_nonce)],
        );
        let reply = self
            .run("authchallenge", &challenge, false, None)
            .await
            .map_err(auth_failure)?;
        let (server_hash, server_nonce) = parse_authchallenge_response(reply.first_line())?;

        if !verify_server_hash(&cookie, &client_nonce, &server_nonce, &server_hash) {
            return Err(Error::auth(
                "authenticate",
                "server hash verification failed",
            ));
        }

        let client_hash = compute_client_hash(&cookie, &client_nonce, &server_nonce);
        let command = format_command("AUTHENTICATE", &[&hex::encode_upper(client_hash)]);
        self.run("authenticate", &command, false, None)
            .await
            .map_err(auth_failure)?;

        if let Some(channel) = self.channel.lock().await.as_mut() {
            channel.authenticated = true;
        }
        info!("authenticated with control port using SAFECOOKIE");
        Ok(())
    }

    /// Query `PROTOCOLINFO`. Allowed before authentication.
    pub async fn protocol_info(&self) -> Result<ProtocolInfo> {
        let reply = self
            .run("protocol_info", "PROTOCOLINFO 1", false, None)
            .await?;
        Ok(ProtocolInfo::parse(reply.lines()))
    }

    /// Get an information value (`GETINFO`).
    pub async fn get_info(&self, key: &str) -> Result<String> {
        let reply = self
            .run("get_info", &format_command("GETINFO", &[key]), true, None)
            .await?;
        reply
            .value(key)
            .ok_or_else(|| Error::not_found("get_info", format!("key '{}' not in reply", key)))
    }

    /// Get a configuration value (`GETCONF`).
    ///
    /// Returns `None` when the option is set to its default or empty.
    pub async fn get_conf(&self, key: &str) -> Result<Option<String>> {
        let reply = self
            .run("get_conf", &format_command("GETCONF", &[key]), true, None)
            .await?;

        for line in reply.lines() {
            match line.split_once('=') {
                Some((k, v)) if k.eq_ignore_ascii_case(key) => return Ok(Some(v.to_string())),
                None if line.eq_ignore_ascii_case(key) => return Ok(None),
                _ => {}
            }
        }
        Err(Error::not_found(
            "get_conf",
            format!("option '{}' not in reply", key),
        ))
    }

    /// Set a configuration value (`SETCONF`). The value is always quoted.
    pub async fn set_conf(&self, key: &str, value: &str) -> Result<()> {
        let arg = format!("{}={}", key, quote_string(value));
        self.run("set_conf", &format_command("SETCONF", &[&arg]), true, None)
            .await?;
        Ok(())
    }

    /// Reset a configuration value to its default (`RESETCONF`).
    pub async fn reset_conf(&self, key: &str) -> Result<()> {
        self.run("reset_conf", &format_command("RESETCONF", &[key]), true, None)
            .await?;
        Ok(())
    }

    /// Persist the running configuration (`SAVECONF`).
    pub async fn save_conf(&self, force: bool) -> Result<()> {
        let args: &[&str] = if force { &["FORCE"] } else { &[] };
        self.run("save_conf", &format_command("SAVECONF", args), true, None)
            .await?;
        Ok(())
    }

    /// Send a signal (`SIGNAL`).
    pub async fn signal(&self, signal: Signal) -> Result<()> {
        self.run(
            "signal",
            &format_command("SIGNAL", &[signal.as_str()]),
            true,
            None,
        )
        .await?;
        Ok(())
    }

    /// Request new circuits for future streams (`SIGNAL NEWNYM`).
    ///
    /// The daemon rate-limits this itself, typically to once every ten
    /// seconds; extra requests are accepted and coalesced.
    pub async fn new_identity(&self) -> Result<()> {
        self.run(
            "new_identity",
            &format_command("SIGNAL", &[Signal::NewNym.as_str()]),
            true,
            None,
        )
        .await?;
        debug!("new identity requested");
        Ok(())
    }

    /// Map one address to another (`MAPADDRESS`).
    ///
    /// Returns the mapping the daemon installed as `(from, to)`; `from` may
    /// differ from the request when a wildcard address like `0.0.0.0` was
    /// used.
    pub async fn map_address(&self, from: &str, to: &str) -> Result<(String, String)> {
        let arg = format!("{}={}", from, to);
        let reply = self
            .run("map_address", &format_command("MAPADDRESS", &[&arg]), true, None)
            .await?;
        reply
            .lines()
            .iter()
            .find_map(|l| l.split_once('='))
            .map(|(f, t)| (f.to_string(), t.to_string()))
            .ok_or_else(|| Error::not_found("map_address", "no mapping in reply"))
    }

    /// List circuits (`GETINFO circuit-status`).
    pub async fn circuit_status(&self) -> Result<Vec<CircuitInfo>> {
        let status = self
            .get_info("circuit-status")
            .await
            .map_err(|e| e.in_op("circuit_status"))?;
        Ok(self.parse_status(&status, parse_circuit_line))
    }

    /// List streams (`GETINFO stream-status`).
    pub async fn stream_status(&self) -> Result<Vec<StreamInfo>> {
        let status = self
            .get_info("stream-status")
            .await
            .map_err(|e| e.in_op("stream_status"))?;
        Ok(self.parse_status(&status, parse_stream_line))
    }

    fn parse_status<T>(&self, text: &str, parse: fn(&str) -> Option<T>) -> Vec<T> {
        let mut items = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match parse(line) {
                Some(item) => items.push(item),
                None => {
                    debug!(line, "skipping malformed status line");
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        items
    }

    /// Get the daemon version.
    pub async fn get_version(&self) -> Result<TorVersion> {
        self.get_info("version").await?.parse()
    }

    /// Close the session. Idempotent.
    pub async fn close(&self) {
        let Some(mut channel) = self.channel.lock().await.take() else {
            return;
        };

        let deadline = Instant::now() + Duration::from_secs(1).min(self.timeout);
        let _ = tokio::time::timeout_at(deadline, async {
            channel.writer.write_all(b"QUIT\r\n").await?;
            channel.writer.flush().await?;
            channel.writer.shutdown().await
        })
        .await;
        debug!("control session closed");
    }
}

/// Locates the daemon's authentication cookie and proves it works.
///
/// Each attempt opens a short-lived connection, asks `PROTOCOLINFO` for the
/// cookie path, reads the file and authenticates with it. Any failure is
/// treated as transient and the whole sequence is retried on a fixed
/// interval until the overall timeout.
pub struct CookieDiscovery<C = TcpConnector> {
    connector: C,
    addr: String,
    interval: Duration,
    timeout: Duration,
    attempt_timeout: Duration,
}

impl CookieDiscovery<TcpConnector> {
    /// Discover over TCP.
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_connector(TcpConnector, addr)
    }
}

impl<C: Connector> CookieDiscovery<C> {
    /// Discover through a custom connector.
    pub fn with_connector(connector: C, addr: impl Into<String>) -> Self {
        Self {
            connector,
            addr: addr.into(),
            interval: Duration::from_millis(250),
            timeout: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    /// Delay between attempts.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Overall time budget.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Time budget for a single attempt.
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    async fn attempt(&self, deadline: Instant) -> Result<(PathBuf, Vec<u8>)> {
        let attempt_deadline = deadline.min(Instant::now() + self.attempt_timeout);
        let stream = self.connector.connect(&self.addr, attempt_deadline).await?;
        let probe = ControlSession::from_stream(
            stream,
            AuthMaterial::none(),
            attempt_deadline.saturating_duration_since(Instant::now()),
        );

        let result = async {
            let info = probe.protocol_info().await?;
            let path = info.cookie_file.ok_or_else(|| {
                Error::not_found("discover_cookie", "PROTOCOLINFO did not name a COOKIEFILE")
            })?;
            let cookie = read_cookie_file(&path)?;

            let command = format_command("AUTHENTICATE", &[&format_cookie_hex(&cookie)]);
            probe
                .execute_unauthenticated(&command)
                .await
                .map_err(auth_failure)?;
            Ok((path, cookie))
        }
        .await;

        probe.close().await;
        result
    }

    /// Run discovery until a cookie authenticates, the timeout elapses, or
    /// `cancel` fires.
    pub async fn discover(&self, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let err = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::cancelled("discover_cookie")),
                result = self.attempt(deadline) => match result {
                    Ok((path, cookie)) => {
                        info!(path = %path.display(), attempts, "control cookie validated");
                        return Ok(cookie);
                    }
                    Err(e) => e,
                },
            };
            debug!(attempts, error = %err, "cookie discovery attempt failed");

            let next = Instant::now() + self.interval;
            if next >= deadline {
                return Err(Error::new(
                    ErrorKind::Timeout,
                    "discover_cookie",
                    format!("no usable cookie after {} attempts", attempts),
                )
                .with_source(err));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::cancelled("discover_cookie")),
                _ = tokio::time::sleep_until(next) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fixtures, script, MockReply};
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, DuplexStream};

    fn session(
        exchanges: Vec<(&'static str, String)>,
        auth: AuthMaterial,
    ) -> ControlSession<DuplexStream> {
        ControlSession::from_stream(script(exchanges), auth, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_get_info_authenticates_lazily_once() {
        let s = session(
            vec![
                ("AUTHENTICATE \"pw\"", fixtures::ok()),
                ("GETINFO version", fixtures::version()),
                ("GETINFO net/listeners/socks", "250-net/listeners/socks=\"127.0.0.1:9050\"\r\n250 OK\r\n".into()),
            ],
            AuthMaterial::password("pw"),
        );

        assert!(!s.is_authenticated().await);
        let version = s.get_version().await.unwrap();
        assert_eq!(version.minor, 4);
        assert!(s.is_authenticated().await);
        assert_eq!(
            s.get_info("net/listeners/socks").await.unwrap(),
            "\"127.0.0.1:9050\""
        );
    }

    #[tokio::test]
    async fn test_get_info_missing_key_is_not_found() {
        let s = session(
            vec![
                ("AUTHENTICATE", fixtures::ok()),
                ("GETINFO SocksPort", fixtures::ok()),
            ],
            AuthMaterial::none(),
        );
        let err = s.get_info("SocksPort").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_bad_authentication_is_auth_error() {
        let s = session(
            vec![(
                "AUTHENTICATE \"wrong\"",
                "515 Authentication failed: Password did not match\r\n".into(),
            )],
            AuthMaterial::password("wrong"),
        );
        let err = s.new_identity().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert!(err.message().starts_with("515"));
        assert!(!s.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_set_conf_quotes_value() {
        let s = session(
            vec![
                ("AUTHENTICATE", fixtures::ok()),
                (r#"SETCONF ContactInfo="a \"b\" c\\d""#, fixtures::ok()),
                ("GETCONF contactinfo", "250 ContactInfo=a \"b\" c\\d\r\n".into()),
                ("GETCONF HiddenServiceDir", "250 HiddenServiceDir\r\n".into()),
            ],
            AuthMaterial::none(),
        );
        s.set_conf("ContactInfo", r#"a "b" c\d"#).await.unwrap();
        assert_eq!(
            s.get_conf("contactinfo").await.unwrap().as_deref(),
            Some(r#"a "b" c\d"#)
        );
        assert_eq!(s.get_conf("HiddenServiceDir").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_command_error_keeps_session_usable() {
        let s = session(
            vec![
                ("AUTHENTICATE", fixtures::ok()),
                ("RESETCONF Bogus", "552 Unrecognized option: Unknown option 'Bogus'\r\n".into()),
                ("SAVECONF FORCE", fixtures::ok()),
            ],
            AuthMaterial::none(),
        );
        let err = s.reset_conf("Bogus").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Command { code: 552 });
        assert_eq!(err.op(), "reset_conf");
        s.save_conf(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_multi_line_error_does_not_leak_into_next_reply() {
        let s = session(
            vec![
                ("AUTHENTICATE", fixtures::ok()),
                ("RESETCONF Bogus", "552-Unrecognized option\r\n552 details\r\n".into()),
                ("SAVECONF", fixtures::ok()),
                ("FROB", fixtures::unrecognized("FROB")),
                ("GETINFO version", fixtures::version()),
            ],
            AuthMaterial::none(),
        );
        let err = s.reset_conf("Bogus").await.unwrap_err();
        assert_eq!(err.message(), "552-Unrecognized option");
        s.save_conf(false).await.unwrap();

        let err = s.execute("FROB").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Command { code: 510 });
        assert_eq!(s.get_version().await.unwrap().minor, 4);
        assert!(!s.is_closed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_command_discards_connection() {
        let (client, server) = tokio::io::duplex(4096);
        let s = ControlSession::from_stream(client, AuthMaterial::none(), Duration::from_secs(30));

        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(server);
            let mut lines = tokio::io::BufReader::new(read_half).lines();
            let _ = lines.next_line().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = write_half.write_all(fixtures::version().as_bytes()).await;
            let _ = lines.next_line().await;
            let _ = write_half.write_all(fixtures::ok().as_bytes()).await;
        });

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            s.execute_unauthenticated("GETINFO version"),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(s.is_closed().await);

        let err = s.get_info("config-file").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[tokio::test]
    async fn test_circuit_and_stream_status_skip_malformed() {
        let circuits = "250+circuit-status=\r\n\
            1 BUILT $AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA~a PURPOSE=GENERAL\r\n\
            garbage\r\n\
            2 LAUNCHED BUILD_FLAGS=NEED_CAPACITY\r\n\
            .\r\n250 OK\r\n";
        let streams = "250-stream-status=5 SUCCEEDED 1 example.com:80 PURPOSE=USER\r\n250 OK\r\n";
        let s = session(
            vec![
                ("AUTHENTICATE", fixtures::ok()),
                ("GETINFO circuit-status", circuits.into()),
                ("GETINFO stream-status", streams.into()),
            ],
            AuthMaterial::none(),
        );

        let list = s.circuit_status().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(s.skipped_lines(), 1);

        let list = s.stream_status().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].purpose.as_deref(), Some("USER"));
    }

    #[tokio::test]
    async fn test_map_address() {
        let s = session(
            vec![
                ("AUTHENTICATE", fixtures::ok()),
                (
                    "MAPADDRESS 0.0.0.0=example.com",
                    MockReply::new().end("250 127.192.10.10=example.com"),
                ),
            ],
            AuthMaterial::none(),
        );
        let (from, to) = s.map_address("0.0.0.0", "example.com").await.unwrap();
        assert_eq!(from, "127.192.10.10");
        assert_eq!(to, "example.com");
    }

    #[tokio::test]
    async fn test_concurrent_commands_do_not_interleave() {
        let mut exchanges = vec![("AUTHENTICATE", fixtures::ok())];
        for _ in 0..8 {
            exchanges.push(("SIGNAL NEWNYM", fixtures::ok()));
        }
        let s = Arc::new(session(exchanges, AuthMaterial::none()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&s);
                tokio::spawn(async move { s.new_identity().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_drops_connection() {
        let (client, _server) = tokio::io::duplex(1024);
        let s = ControlSession::from_stream(client, AuthMaterial::none(), Duration::from_secs(2));

        let err = s.execute_unauthenticated("GETINFO version").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(s.is_closed().await);

        let err = s.execute("GETINFO version").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_deadline_wins_when_earlier() {
        let (client, _server) = tokio::io::duplex(1024);
        let s = ControlSession::from_stream(client, AuthMaterial::none(), Duration::from_secs(60));

        let start = Instant::now();
        let err = s
            .execute_until("GETINFO version", start + Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(err.is_terminal());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_safe_cookie_handshake() {
        use crate::auth::compute_server_hash;

        let cookie = [7u8; 32];
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, &cookie).unwrap();

        let (client, server) = tokio::io::duplex(4096);
        let peer = tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(server);
            let mut lines = tokio::io::BufReader::new(read_half).lines();

            let challenge = lines.next_line().await.unwrap().unwrap();
            let nonce = challenge
                .strip_prefix("AUTHCHALLENGE SAFECOOKIE ")
                .unwrap();
            let client_nonce = hex::decode(nonce).unwrap();
            let server_nonce = [9u8; 32];
            let server_hash = compute_server_hash(&cookie, &client_nonce, &server_nonce);
            let reply = format!(
                "250 AUTHCHALLENGE SERVERHASH={} SERVERNONCE={}\r\n",
                hex::encode_upper(server_hash),
                hex::encode_upper(server_nonce)
            );
            write_half.write_all(reply.as_bytes()).await.unwrap();

            let expected = compute_client_hash(&cookie, &client_nonce, &server_nonce);
            let auth = lines.next_line().await.unwrap().unwrap();
            assert_eq!(auth, format!("AUTHENTICATE {}", hex::encode_upper(expected)));
            write_half.write_all(b"250 OK\r\n").await.unwrap();
        });

        let s = ControlSession::from_stream(client, AuthMaterial::none(), Duration::from_secs(5));
        s.authenticate_safe_cookie(file.path()).await.unwrap();
        assert!(s.is_authenticated().await);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_protocol_info_before_auth() {
        let s = session(
            vec![("PROTOCOLINFO 1", fixtures::protocolinfo("/run/tor/cookie"))],
            AuthMaterial::none(),
        );
        let info = s.protocol_info().await.unwrap();
        assert!(info.supports_safe_cookie());
        assert_eq!(info.cookie_file, Some(PathBuf::from("/run/tor/cookie")));
        assert!(!s.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_cookie_discovery_cancelled() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = CookieDiscovery::new(addr)
            .interval(Duration::from_millis(10))
            .discover(&cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_sends_quit() {
        let (client, server) = tokio::io::duplex(1024);
        let s = ControlSession::from_stream(client, AuthMaterial::none(), Duration::from_secs(5));

        s.close().await;
        s.close().await;
        assert!(s.is_closed().await);

        let mut lines = tokio::io::BufReader::new(server).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("QUIT"));
    }
}

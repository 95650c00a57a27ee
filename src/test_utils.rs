//! Test helpers: canned control replies, a reply builder, and a scripted
//! in-memory control peer.

use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

/// Spawn a scripted control peer and return the client end.
///
/// For each `(expected, reply)` pair the peer reads one command line,
/// asserts it equals `expected` and writes `reply`. When the script runs
/// out the peer hangs up, so an unexpected command surfaces as a closed
/// connection on the client side.
pub fn script(exchanges: Vec<(&'static str, String)>) -> DuplexStream {
    let (client, server) = duplex(64 * 1024);
    tokio::spawn(async move {
        let (read_half, mut write_half) = tokio::io::split(server);
        let mut lines = BufReader::new(read_half).lines();
        for (expected, reply) in exchanges {
            let Ok(Some(line)) = lines.next_line().await else {
                return;
            };
            assert_eq!(line, expected, "unexpected command");
            if write_half.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    });
    client
}

/// Canned control replies.
pub mod fixtures {
    /// A bare success.
    pub fn ok() -> String {
        "250 OK\r\n".to_string()
    }

    /// `PROTOCOLINFO 1` reply naming `cookie_path`.
    pub fn protocolinfo(cookie_path: &str) -> String {
        format!(
            "250-PROTOCOLINFO 1\r\n\
             250-AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE=\"{}\"\r\n\
             250-VERSION Tor=\"0.4.8.12\"\r\n\
             250 OK\r\n",
            cookie_path
        )
    }

    /// `GETINFO version` reply.
    pub fn version() -> String {
        "250-version=0.4.8.12 (git-abc123)\r\n250 OK\r\n".to_string()
    }

    /// `ADD_ONION` reply with a generated key.
    pub fn add_onion(service_id: &str, key: &str) -> String {
        format!(
            "250-ServiceID={}\r\n250-PrivateKey={}\r\n250 OK\r\n",
            service_id, key
        )
    }

    /// `GETINFO onions/current` reply as a data block.
    pub fn onions_current(ids: &[&str]) -> String {
        let mut reply = String::from("250+onions/current=\r\n");
        for id in ids {
            reply.push_str(id);
            reply.push_str("\r\n");
        }
        reply.push_str(".\r\n250 OK\r\n");
        reply
    }

    /// Command rejected.
    pub fn unrecognized(keyword: &str) -> String {
        format!("510 Unrecognized command \"{}\"\r\n", keyword)
    }
}

/// Builder for multi-line control replies.
#[derive(Debug, Clone, Default)]
pub struct MockReply {
    lines: Vec<String>,
}

impl MockReply {
    /// An empty reply.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `250-` continuation line.
    pub fn line(mut self, text: &str) -> Self {
        self.lines.push(format!("250-{}", text));
        self
    }

    /// Add a `250+` data block terminated by `.`.
    pub fn block(mut self, header: &str, body: &[&str]) -> Self {
        self.lines.push(format!("250+{}", header));
        self.lines.extend(body.iter().map(|l| l.to_string()));
        self.lines.push(".".to_string());
        self
    }

    /// Add an asynchronous `650` notification.
    pub fn event(mut self, text: &str) -> Self {
        self.lines.push(format!("650 {}", text));
        self
    }

    /// Finish with `250 OK`.
    pub fn ok(mut self) -> String {
        self.lines.push("250 OK".to_string());
        self.build()
    }

    /// Finish with an arbitrary final line.
    pub fn end(mut self, line: &str) -> String {
        self.lines.push(line.to_string());
        self.build()
    }

    fn build(&self) -> String {
        self.lines.iter().map(|l| format!("{}\r\n", l)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_reply_with_block_and_event() {
        let reply = MockReply::new()
            .line("version=0.4.8.12")
            .event("BW 1024 2048")
            .block("onions/current=", &["abc"])
            .ok();

        assert_eq!(
            reply,
            "250-version=0.4.8.12\r\n650 BW 1024 2048\r\n250+onions/current=\r\nabc\r\n.\r\n250 OK\r\n"
        );
    }

    #[test]
    fn test_onions_current_fixture() {
        assert_eq!(
            fixtures::onions_current(&["a", "b"]),
            MockReply::new().block("onions/current=", &["a", "b"]).ok()
        );
    }
}

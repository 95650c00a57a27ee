//! Control protocol message framing and formatting.
//!
//! Replies are decoded by [`read_reply`] following the control-port reply
//! grammar:
//!
//! - `250-text` continues the reply,
//! - `250+text` opens a data block terminated by a lone `.` line whose
//!   contents are appended verbatim,
//! - `250 text` ends the reply (the text is kept unless the line is exactly
//!   `250 OK`),
//! - a status of 400 or above fails the command with the first error line,
//!   once the rest of the reply has been consumed,
//! - asynchronous notifications (6xx) and malformed lines are skipped.

use crate::error::{Error, Result, StatusCode};
use std::collections::HashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::{trace, warn};

/// A raw reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    /// The 3-digit status code.
    pub code: u16,
    /// The separator character: '-' for mid-reply, '+' for data, ' ' for end.
    pub separator: char,
    /// The text content of the line.
    pub text: String,
}

impl ReplyLine {
    /// Parse a reply line from a string without its CRLF terminator.
    pub fn parse(line: &str) -> Result<Self> {
        if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
            return Err(Error::protocol(
                "parse_reply_line",
                format!("reply line too short: '{}'", line),
            ));
        }

        let code: u16 = line[..3].parse().map_err(|_| {
            Error::protocol(
                "parse_reply_line",
                format!("invalid status code in: '{}'", line),
            )
        })?;

        let separator = line[3..4].chars().next().unwrap_or('?');
        if !matches!(separator, ' ' | '-' | '+') {
            return Err(Error::protocol(
                "parse_reply_line",
                format!("invalid separator '{}' in: '{}'", separator, line),
            ));
        }

        Ok(ReplyLine {
            code,
            separator,
            text: line[4..].to_string(),
        })
    }

    /// Check if this is the final line of a reply.
    pub fn is_end(&self) -> bool {
        self.separator == ' '
    }

    /// Check if this line opens a data block.
    pub fn is_data(&self) -> bool {
        self.separator == '+'
    }

    /// Check if this is a mid-reply line.
    pub fn is_mid(&self) -> bool {
        self.separator == '-'
    }
}

/// A data block opened by a `+` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    /// Text of the opening line, e.g. `onions/current=`.
    pub header: String,
    /// Block contents, verbatim.
    pub lines: Vec<String>,
}

impl DataBlock {
    /// The keyword the block answers, i.e. the header without its `=`.
    pub fn key(&self) -> &str {
        self.header.split('=').next().unwrap_or("")
    }
}

/// The decoded reply to one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    lines: Vec<String>,
    blocks: Vec<DataBlock>,
    skipped: usize,
}

impl Reply {
    /// Content lines in arrival order, including data-block contents.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Data blocks carried by this reply.
    pub fn blocks(&self) -> &[DataBlock] {
        &self.blocks
    }

    /// Number of malformed lines skipped while decoding.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Whether the reply carried no content beyond its final `250 OK`.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Look up the value the daemon returned for `key`.
    ///
    /// A data block for the key wins over an inline `key=value` line; block
    /// contents are joined with `\n`.
    pub fn value(&self, key: &str) -> Option<String> {
        if let Some(block) = self.blocks.iter().find(|b| b.key() == key) {
            return Some(block.lines.join("\n"));
        }
        let prefix = format!("{}=", key);
        self.lines
            .iter()
            .find_map(|l| l.strip_prefix(&prefix).map(str::to_string))
    }

    /// All values returned for `key` in arrival order.
    pub fn values(&self, key: &str) -> Vec<String> {
        let prefix = format!("{}=", key);
        self.lines
            .iter()
            .filter_map(|l| l.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    /// The first content line, or the empty string.
    pub fn first_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("")
    }
}

/// Longest reply line accepted, terminator included.
pub const MAX_LINE_LEN: u64 = 64 * 1024;

async fn next_line<R>(reader: &mut R, buf: &mut String, op: &'static str) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN)
        .read_line(buf)
        .await
        .map_err(|e| Error::io(op, e))?;
    if n == 0 {
        return Err(Error::new(
            crate::error::ErrorKind::Io,
            op,
            "connection closed unexpectedly",
        ));
    }
    if n as u64 >= MAX_LINE_LEN && !buf.ends_with('\n') {
        return Err(Error::protocol(
            op,
            format!("reply line exceeds {} bytes", MAX_LINE_LEN),
        ));
    }
    Ok(())
}

async fn read_block<R>(reader: &mut R, buf: &mut String, op: &'static str) -> Result<Vec<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut block = Vec::new();
    loop {
        next_line(reader, buf, op).await?;
        let data = buf.trim_end_matches(['\r', '\n']);
        if data == "." {
            return Ok(block);
        }
        block.push(data.to_string());
    }
}

/// Read one complete reply from `reader`.
///
/// The reply is always consumed up to its end line, so an error reply
/// leaves the stream positioned at the next reply. The first `4xx`/`5xx`
/// line becomes the error message.
pub async fn read_reply<R>(reader: &mut R, op: &'static str) -> Result<Reply>
where
    R: AsyncBufRead + Unpin,
{
    let mut reply = Reply::default();
    let mut failure: Option<(u16, String)> = None;
    let mut buf = String::new();

    loop {
        next_line(reader, &mut buf, op).await?;
        let raw = buf.trim_end_matches(['\r', '\n']).to_string();
        trace!("Received line: {}", raw);

        let line = match ReplyLine::parse(&raw) {
            Ok(line) => line,
            Err(_) => {
                warn!(line = %raw, "skipping malformed reply line");
                reply.skipped += 1;
                continue;
            }
        };

        let block = if line.is_data() {
            Some(read_block(reader, &mut buf, op).await?)
        } else {
            None
        };

        // Asynchronous notifications are complete in themselves.
        if StatusCode::is_async(line.code) {
            continue;
        }
        if (400..600).contains(&line.code) && failure.is_none() {
            failure = Some((line.code, raw.clone()));
        }
        if line.is_end() {
            if let Some((code, message)) = failure {
                return Err(Error::command(op, code, message));
            }
            if (200..300).contains(&line.code) {
                if raw != "250 OK" {
                    reply.lines.push(line.text);
                }
                return Ok(reply);
            }
            continue;
        }
        if failure.is_some() || !(200..300).contains(&line.code) {
            continue;
        }

        match block {
            Some(block) => {
                reply.lines.push(line.text.clone());
                reply.lines.extend(block.iter().cloned());
                reply.blocks.push(DataBlock {
                    header: line.text,
                    lines: block,
                });
            }
            None => reply.lines.push(line.text),
        }
    }
}

/// Parse keyword=value pairs from a reply line.
pub fn parse_key_value_pairs(text: &str) -> HashMap<String, String> {
    let mut result = HashMap::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        remaining = remaining.trim_start();
        if remaining.is_empty() {
            break;
        }

        let token_end = remaining.find(' ').unwrap_or(remaining.len());
        let key_end = match remaining[..token_end].find('=') {
            Some(pos) => pos,
            None => {
                // Bare word, e.g. the "AUTH" in "AUTH METHODS=...".
                remaining = &remaining[token_end..];
                continue;
            }
        };

        let key = remaining[..key_end].to_string();
        remaining = &remaining[key_end + 1..];

        let (value, rest) = if remaining.starts_with('"') {
            parse_quoted_string(remaining)
        } else {
            let end = remaining.find(' ').unwrap_or(remaining.len());
            (remaining[..end].to_string(), &remaining[end..])
        };

        result.insert(key, value);
        remaining = rest;
    }

    result
}

/// Parse a quoted string, handling escape sequences.
fn parse_quoted_string(s: &str) -> (String, &str) {
    if !s.starts_with('"') {
        return (String::new(), s);
    }

    let mut result = String::new();
    let mut chars = s[1..].chars().peekable();
    let mut consumed = 1;

    while let Some(c) = chars.next() {
        consumed += c.len_utf8();
        if c == '"' {
            break;
        } else if c == '\\' {
            if let Some(&next) = chars.peek() {
                consumed += next.len_utf8();
                chars.next();
                match next {
                    'n' => result.push('\n'),
                    'r' => result.push('\r'),
                    't' => result.push('\t'),
                    _ => result.push(next),
                }
            }
        } else {
            result.push(c);
        }
    }

    (result, &s[consumed..])
}

/// Quote a value for use in a control command.
///
/// The result is always wrapped in double quotes; quotes, backslashes and
/// control characters are backslash-escaped.
pub fn quote_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    result.push('"');

    for c in s.chars() {
        match c {
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            _ => result.push(c),
        }
    }

    result.push('"');
    result
}

/// Format a command with arguments, CRLF-terminated.
pub fn format_command(keyword: &str, args: &[&str]) -> String {
    let mut cmd = keyword.to_string();
    for arg in args {
        cmd.push(' ');
        cmd.push_str(arg);
    }
    cmd.push_str("\r\n");
    cmd
}

/// The keyword of a command, used when the arguments must not be logged.
pub(crate) fn command_keyword(command: &str) -> &str {
    command
        .split([' ', '\r', '\n'])
        .next()
        .unwrap_or(command)
}

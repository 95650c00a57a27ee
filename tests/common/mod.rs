//! Loopback mock servers for the control and SOCKS endpoints.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// One scripted command and the reply to send for it.
pub type Exchange = (String, String);

pub fn exchange(command: impl Into<String>, reply: impl Into<String>) -> Exchange {
    (command.into(), reply.into())
}

pub fn ok() -> String {
    "250 OK\r\n".to_string()
}

/// Control endpoint that plays one script per accepted connection.
///
/// Every received line is recorded. A command that does not match the
/// script gets a `510` reply and ends the script for that connection; the
/// connection is then drained until the client hangs up.
pub struct MockControl {
    pub addr: String,
    received: Arc<Mutex<Vec<String>>>,
}

impl MockControl {
    pub async fn start(scripts: Vec<Vec<Exchange>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&received);
        tokio::spawn(async move {
            for script in scripts {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_control(stream, script, Arc::clone(&log)));
            }
        });

        Self { addr, received }
    }

    /// Every line received so far, across connections.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.received().iter().filter(|c| *c == command).count()
    }
}

async fn serve_control(stream: TcpStream, script: Vec<Exchange>, log: Arc<Mutex<Vec<String>>>) {
    // An empty script models a daemon that is not ready yet.
    if script.is_empty() {
        return;
    }
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let mut script = script.into_iter();
    let mut playing = true;
    while let Ok(Some(line)) = lines.next_line().await {
        log.lock().unwrap().push(line.clone());
        if !playing {
            continue;
        }
        let reply = match script.next() {
            Some((expected, reply)) if expected == line => reply,
            Some(_) => {
                playing = false;
                "510 Unexpected command\r\n".to_string()
            }
            None => {
                // Script done: let the client hang up.
                playing = false;
                continue;
            }
        };
        if write_half.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// SOCKS5 endpoint that answers every CONNECT with `reply_code` and, on
/// success, echoes the tunnelled bytes back.
pub struct MockSocks {
    pub addr: String,
    targets: Arc<Mutex<Vec<String>>>,
}

impl MockSocks {
    pub async fn start(reply_code: u8) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let targets = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&targets);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_socks(stream, reply_code, Arc::clone(&log)));
            }
        });

        Self { addr, targets }
    }

    /// `host:port` of every CONNECT received.
    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().unwrap().clone()
    }
}

async fn serve_socks(mut stream: TcpStream, reply_code: u8, log: Arc<Mutex<Vec<String>>>) {
    let mut greeting = [0u8; 3];
    if stream.read_exact(&mut greeting).await.is_err() {
        return;
    }
    stream.write_all(&[0x05, 0x00]).await.unwrap();

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.unwrap();
    let host = match head[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await.unwrap();
            std::net::Ipv4Addr::from(ip).to_string()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await.unwrap();
            std::net::Ipv6Addr::from(ip).to_string()
        }
        _ => {
            let len = stream.read_u8().await.unwrap();
            let mut name = vec![0u8; len as usize];
            stream.read_exact(&mut name).await.unwrap();
            String::from_utf8(name).unwrap()
        }
    };
    let port = stream.read_u16().await.unwrap();
    log.lock().unwrap().push(format!("{}:{}", host, port));

    stream
        .write_all(&[0x05, reply_code, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90])
        .await
        .unwrap();
    if reply_code != 0 {
        return;
    }

    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}

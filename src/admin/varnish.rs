//! Varnish CLI client.
//!
//! Every response is framed as `<status:3> <length:8>\n<body>\n`. A fresh
//! connection opens with a banner: status 107 carries an authentication
//! challenge, status 200 means no authentication is required.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use super::{AdminConnector, AdminSession, ConfigState};
use crate::error::AdminError;

const HEADER_LEN: usize = 13;

/// Largest response body accepted. varnishd truncates at `cli_limit`,
/// 48 KiB by default.
pub const MAX_BODY_LEN: usize = 1024 * 1024;

pub mod status {
    pub const SYNTAX: u16 = 100;
    pub const UNKNOWN: u16 = 101;
    pub const PARAM: u16 = 106;
    pub const AUTH: u16 = 107;
    pub const OK: u16 = 200;
    pub const CANT: u16 = 300;
}

/// One decoded CLI response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliResponse {
    pub status: u16,
    pub body: String,
}

impl CliResponse {
    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }
}

/// Dials the CLI port over TCP
#[derive(Debug, Clone)]
pub struct VarnishConnector {
    connect_timeout: Duration,
}

impl Default for VarnishConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl VarnishConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl AdminConnector for VarnishConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn AdminSession>, AdminError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| AdminError::Io(format!("connecting to {address} timed out")))??;
        stream.set_nodelay(true)?;

        let session = VarnishSession::handshake(stream).await?;
        debug!(%address, auth_required = session.challenge.is_some(), "admin session opened");
        Ok(Box::new(session))
    }
}

/// An open CLI session over any byte stream
#[derive(Debug)]
pub struct VarnishSession<S> {
    stream: BufReader<S>,
    /// Pending challenge from the banner; `None` once authenticated
    challenge: Option<String>,
}

impl<S> VarnishSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Read the banner and remember the challenge, if any.
    pub async fn handshake(stream: S) -> Result<Self, AdminError> {
        let mut session = Self {
            stream: BufReader::new(stream),
            challenge: None,
        };

        let banner = session.read_response().await?;
        match banner.status {
            status::AUTH => {
                let challenge = banner.body.lines().next().unwrap_or_default().to_string();
                if challenge.is_empty() {
                    return Err(AdminError::Malformed("empty authentication challenge".into()));
                }
                session.challenge = Some(challenge);
            }
            status::OK => {}
            other => {
                return Err(AdminError::Command {
                    command: "banner".into(),
                    status: other,
                    message: banner.body,
                })
            }
        }
        Ok(session)
    }

    pub fn requires_auth(&self) -> bool {
        self.challenge.is_some()
    }

    /// Send one command line and read its response, whatever the status.
    pub async fn send_command(&mut self, command: &str) -> Result<CliResponse, AdminError> {
        let stream = self.stream.get_mut();
        stream.write_all(command.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        self.read_response().await
    }

    pub async fn ping(&mut self) -> Result<(), AdminError> {
        self.expect_ok("ping").await.map(|_| ())
    }

    async fn expect_ok(&mut self, command: &str) -> Result<CliResponse, AdminError> {
        let response = self.send_command(command).await?;
        if response.is_ok() {
            return Ok(response);
        }
        Err(AdminError::Command {
            command: command_verb(command).to_string(),
            status: response.status,
            message: response.body,
        })
    }

    async fn read_response(&mut self) -> Result<CliResponse, AdminError> {
        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header).await?;

        let (status, length) = parse_header(&header)?;

        // body plus the trailing newline
        let mut body = vec![0u8; length + 1];
        self.stream.read_exact(&mut body).await?;
        body.pop();

        Ok(CliResponse {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

#[async_trait]
impl<S> AdminSession for VarnishSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn authenticate(&mut self, secret: &[u8]) -> Result<(), AdminError> {
        let Some(challenge) = self.challenge.as_deref() else {
            return Ok(());
        };

        let command = format!("auth {}", auth_response(challenge, secret));
        let response = self.send_command(&command).await?;
        if !response.is_ok() {
            return Err(AdminError::AuthFailed(format!(
                "status {}: {}",
                response.status, response.body
            )));
        }

        self.challenge = None;
        Ok(())
    }

    async fn define_config(
        &mut self,
        name: &str,
        source: &[u8],
        state: ConfigState,
    ) -> Result<(), AdminError> {
        let command = format!(
            "vcl.inline {name} {} {state}",
            quote(&String::from_utf8_lossy(source))
        );
        let response = self.send_command(&command).await?;

        match response.status {
            status::OK => Ok(()),
            status::PARAM => Err(AdminError::Compile {
                name: name.to_string(),
                message: response.body,
            }),
            other => Err(AdminError::Command {
                command: "vcl.inline".into(),
                status: other,
                message: response.body,
            }),
        }
    }

    async fn activate_config(&mut self, name: &str) -> Result<(), AdminError> {
        self.expect_ok(&format!("vcl.use {name}")).await.map(|_| ())
    }

    async fn set_config_state(&mut self, name: &str, state: ConfigState) -> Result<(), AdminError> {
        self.expect_ok(&format!("vcl.state {name} {state}"))
            .await
            .map(|_| ())
    }
}

fn command_verb(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or(command)
}

fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(u16, usize), AdminError> {
    let malformed = || AdminError::Malformed(String::from_utf8_lossy(header).into_owned());

    if header[3] != b' ' || header[HEADER_LEN - 1] != b'\n' {
        return Err(malformed());
    }
    let text = std::str::from_utf8(header).map_err(|_| malformed())?;
    let status = text[0..3].parse::<u16>().map_err(|_| malformed())?;
    let length = text[4..12].trim().parse::<usize>().map_err(|_| malformed())?;
    if length > MAX_BODY_LEN {
        return Err(AdminError::Malformed(format!(
            "response body of {length} bytes exceeds {MAX_BODY_LEN}"
        )));
    }
    Ok((status, length))
}

/// `hex(sha256(challenge "\n" secret challenge "\n"))`
pub fn auth_response(challenge: &str, secret: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(challenge.as_bytes());
    hasher.update(b"\n");
    hasher.update(secret);
    hasher.update(challenge.as_bytes());
    hasher.update(b"\n");
    hex::encode(hasher.finalize())
}

/// Quote an argument for the CLI tokenizer.
pub fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

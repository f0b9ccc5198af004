//! The upstream `guacd` connection.
//!
//! The session engine never touches a raw socket directly; it speaks to
//! `guacd` through the [`GuacdWriter`]/[`GuacdReader`] traits, so tests
//! can substitute in-memory fakes instead of a real TCP connection, and
//! so the live reader task can read concurrently with whichever actor
//! currently holds write access — no shared lock required, the same way
//! `tokio::net::TcpStream::into_split` gives independent halves.

use std::fmt;

use async_trait::async_trait;
use bytes::BytesMut;
use serde::Deserialize;
use serde_json::Value;
use smart_default::SmartDefault;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::codec::{self, GuacamoleInstruction};
use crate::config::{GuacdConf, SessionConf};
use crate::error::{CodecError, HandshakeError};

/// Connection parameters accepted in a `guacg.connect` instruction's JSON
/// payload, merged over the compiled-in/configured defaults.
///
/// Matches §6's `connect` JSON argument keys exactly; unknown extra keys
/// in the browser's payload are simply ignored by `serde` rather than
/// rejected, matching the "extra keys pass through" rule in spirit (the
/// keys Guacamole itself cares about are all named fields here).
#[derive(Debug, Clone, Deserialize, SmartDefault)]
#[serde(default)]
pub struct ConnectArgs {
    #[default(_code = "\"rdp\".to_string()")]
    pub protocol: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub domain: String,
    pub security: String,
    #[serde(rename = "remote_app")]
    pub remote_app: String,
    #[default(1024)]
    pub width: u32,
    #[default(768)]
    pub height: u32,
    #[default(96)]
    pub dpi: u32,
    pub audio: Vec<String>,
    pub video: Vec<String>,

    // Session-control keys, consumed by SessionHandler, never forwarded
    // to guacd.
    #[default(false)]
    pub guest: bool,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    #[default(false)]
    pub resume: bool,
}

/// The three mutually-exclusive modes implied by a `connect` payload, per
/// §6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMode {
    NewMaster,
    Guest { session_id: String },
    Resume { session_id: String },
}

/// Error returned when a `connect` payload implies zero or more than one
/// mode (e.g. both `guest` and `resume` set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidConnectArgs;

impl ConnectArgs {
    /// Parse from a `guacg.connect` payload, applying [`SessionConf`]'s
    /// defaults for anything the browser didn't specify.
    pub fn from_json(
        payload: &Value,
        defaults: &SessionConf,
    ) -> Result<Self, CodecError> {
        let mut args: Self = serde_json::from_value(payload.clone())?;
        if !payload
            .get("protocol")
            .map(|v| v.is_string())
            .unwrap_or(false)
        {
            args.protocol = defaults.default_protocol.clone();
        }
        if payload.get("width").is_none() {
            args.width = defaults.default_width;
        }
        if payload.get("height").is_none() {
            args.height = defaults.default_height;
        }
        if payload.get("dpi").is_none() {
            args.dpi = defaults.default_dpi;
        }
        Ok(args)
    }

    /// Determine which of the three connect modes this payload implies.
    pub fn mode(&self) -> Result<ConnectMode, InvalidConnectArgs> {
        match (self.guest, self.resume, &self.session_id) {
            (false, false, _) => Ok(ConnectMode::NewMaster),
            (true, false, Some(id)) => Ok(ConnectMode::Guest {
                session_id: id.clone(),
            }),
            (false, true, Some(id)) => Ok(ConnectMode::Resume {
                session_id: id.clone(),
            }),
            _ => Err(InvalidConnectArgs),
        }
    }
}

/// Write half of a `guacd` connection.
#[async_trait]
pub trait GuacdWriter: Send + fmt::Debug {
    /// Write one already-framed instruction to `guacd`.
    async fn send(&mut self, instruction: &str) -> Result<(), HandshakeError>;
}

/// Read half of a `guacd` connection.
#[async_trait]
pub trait GuacdReader: Send + fmt::Debug {
    /// Read one complete instruction from `guacd`, awaiting until a full
    /// frame is available.
    async fn receive(
        &mut self,
    ) -> Result<GuacamoleInstruction, HandshakeError>;
}

/// A freshly-established, handshaken `guacd` connection, before it is
/// split into independent read/write halves for the active session (or
/// kept whole for parking, where one task needs both to answer `sync`).
pub struct GuacdConnection {
    writer: Box<dyn GuacdWriter>,
    reader: Box<dyn GuacdReader>,
}

impl GuacdConnection {
    /// Connect to `guacd` at the configured host/port and perform the
    /// standard handshake (`select`, `size`/`audio`/`video`/`image`,
    /// `connect`).
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Connect`] if the TCP connection cannot
    /// be established, or [`HandshakeError::Rejected`] if `guacd` refuses
    /// the `connect`.
    pub async fn establish(
        conf: &GuacdConf,
        args: &ConnectArgs,
    ) -> Result<Self, HandshakeError> {
        let addr = format!("{}:{}", conf.host, conf.port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| HandshakeError::Connect(e.to_string()))?;
        let (read_half, write_half) = stream.into_split();

        let mut conn = Self {
            writer: Box::new(TcpGuacdWriter { half: write_half }),
            reader: Box::new(TcpGuacdReader {
                half: read_half,
                buf: BytesMut::with_capacity(4096),
            }),
        };
        conn.handshake(args).await?;
        Ok(conn)
    }

    async fn handshake(
        &mut self,
        args: &ConnectArgs,
    ) -> Result<(), HandshakeError> {
        self.writer
            .send(&codec::encode("select", &[args.protocol.as_str()]))
            .await?;

        // guacd replies with `args` listing the protocol's accepted
        // connect parameters; we don't need to inspect them since we
        // always send the full fixed set below.
        let _args_reply = self.reader.receive().await?;

        let width = args.width.to_string();
        let height = args.height.to_string();
        let dpi = args.dpi.to_string();
        self.writer
            .send(&codec::encode(
                "size",
                &[width.as_str(), height.as_str(), dpi.as_str()],
            ))
            .await?;
        self.writer
            .send(&codec::encode(
                "audio",
                &args.audio.iter().map(String::as_str).collect::<Vec<_>>(),
            ))
            .await?;
        self.writer
            .send(&codec::encode(
                "video",
                &args.video.iter().map(String::as_str).collect::<Vec<_>>(),
            ))
            .await?;
        self.writer.send(&codec::encode("image", &[])).await?;

        let port = args.port.to_string();
        let connect_args = [
            args.protocol.as_str(),
            args.hostname.as_str(),
            port.as_str(),
            args.username.as_str(),
            args.password.as_str(),
            args.domain.as_str(),
            args.security.as_str(),
            args.remote_app.as_str(),
        ];
        self.writer
            .send(&codec::encode("connect", &connect_args))
            .await?;

        let reply = self.reader.receive().await?;
        if reply.opcode == "error" {
            return Err(HandshakeError::Rejected(reply.args.join(",")));
        }

        Ok(())
    }

    /// Split into independent read/write halves, handed respectively to
    /// the reader task and the controlling handler.
    #[must_use]
    pub fn split(self) -> (Box<dyn GuacdWriter>, Box<dyn GuacdReader>) {
        (self.writer, self.reader)
    }

    /// Reassemble a connection from its two halves, e.g. when popping an
    /// entry out of the [`crate::parking::ParkingLot`].
    #[must_use]
    pub fn from_halves(
        writer: Box<dyn GuacdWriter>,
        reader: Box<dyn GuacdReader>,
    ) -> Self {
        Self { writer, reader }
    }
}

struct TcpGuacdWriter {
    half: OwnedWriteHalf,
}

impl fmt::Debug for TcpGuacdWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpGuacdWriter").finish()
    }
}

#[async_trait]
impl GuacdWriter for TcpGuacdWriter {
    async fn send(
        &mut self,
        instruction: &str,
    ) -> Result<(), HandshakeError> {
        self.half
            .write_all(instruction.as_bytes())
            .await
            .map_err(|e| HandshakeError::Rejected(e.to_string()))
    }
}

struct TcpGuacdReader {
    half: OwnedReadHalf,
    buf: BytesMut,
}

impl fmt::Debug for TcpGuacdReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpGuacdReader").finish()
    }
}

#[async_trait]
impl GuacdReader for TcpGuacdReader {
    async fn receive(
        &mut self,
    ) -> Result<GuacamoleInstruction, HandshakeError> {
        loop {
            if let Some(inst) = codec::parse_one(&mut self.buf)? {
                return Ok(inst);
            }
            let mut chunk = [0u8; 4096];
            let n = self
                .half
                .read(&mut chunk)
                .await
                .map_err(|e| HandshakeError::Rejected(e.to_string()))?;
            if n == 0 {
                return Err(HandshakeError::Rejected(
                    "guacd closed the connection".into(),
                ));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

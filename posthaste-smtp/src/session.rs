//! An outbound SMTP session: TCP connect from a chosen source address,
//! implicit TLS or opportunistic STARTTLS, optional AUTH, and a streaming
//! DATA phase.
//!
//! Certificate validation is disabled throughout. TLS here is opportunistic
//! encryption against passive observers, not authentication; a server with a
//! broken certificate still gets the mail.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use posthaste_common::config::{AuthConfig, AuthMethod, SmtpTimeouts};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
    time::timeout,
};
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{
        self, ClientConfig, DigitallySignedStruct, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};
use tracing::{debug, trace};

use crate::{
    error::{ClientError, Result},
    response::Reply,
    stuffing::DotStuffer,
};

/// Initial size of the read buffer for SMTP replies.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Everything needed to establish one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Source address to bind; `None` lets the OS pick.
    pub local_addr: Option<IpAddr>,
    /// Name presented in EHLO.
    pub helo_name: String,
    /// The exchange hostname, used for SNI.
    pub server_name: String,
    /// Implicit TLS from the first byte.
    pub secure: bool,
    /// Attempt STARTTLS when the server offers it.
    pub use_starttls: bool,
    pub auth: Option<AuthConfig>,
    pub timeouts: SmtpTimeouts,
}

/// The sender, recipients, and advertised size of one message.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Envelope sender; empty for null-return messages.
    pub from: String,
    pub to: Vec<String>,
    /// Exact byte count of the message as it will go over the wire,
    /// before transparency encoding.
    pub size: u64,
}

/// What the server offered in its EHLO response.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub starttls: bool,
    /// `Some` when SIZE was offered; the value is the server's limit,
    /// 0 when it did not state one.
    pub size: Option<u64>,
    pub eight_bit_mime: bool,
    pub auth: Vec<String>,
}

impl Capabilities {
    fn parse(reply: &Reply) -> Self {
        let mut caps = Self::default();
        // The first line is the server identity.
        for line in reply.lines.iter().skip(1) {
            let mut words = line.split_whitespace();
            match words.next().map(str::to_ascii_uppercase).as_deref() {
                Some("STARTTLS") => caps.starttls = true,
                Some("SIZE") => {
                    caps.size = Some(words.next().and_then(|v| v.parse().ok()).unwrap_or(0));
                }
                Some("8BITMIME") => caps.eight_bit_mime = true,
                Some("AUTH") => caps.auth = words.map(str::to_string).collect(),
                _ => {}
            }
        }
        caps
    }
}

/// A connection that is either plain TCP or TLS-wrapped.
enum Connection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Connection {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn shutdown(&mut self) {
        let _ = match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
        };
    }

    /// Wrap a plain connection in TLS. Validation is disabled by design.
    async fn upgrade(self, server_name: &str) -> Result<Self> {
        match self {
            Self::Plain(stream) => {
                let config = ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth();

                let connector = TlsConnector::from(Arc::new(config));
                let name = ServerName::try_from(server_name.to_string())
                    .map_err(|e| ClientError::Tls(format!("invalid server name: {e}")))?;

                let tls = connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| ClientError::Tls(e.to_string()))?;

                Ok(Self::Tls(Box::new(tls)))
            }
            Self::Tls(_) => Err(ClientError::Tls(String::from("connection is already TLS"))),
        }
    }
}

/// A certificate verifier that accepts everything.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// A live SMTP session. Sessions are never reused across deliveries: one
/// connect, one send, one close.
pub struct Session {
    conn: Option<Connection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    capabilities: Capabilities,
    tls: bool,
    timeouts: SmtpTimeouts,
    remote: SocketAddr,
}

impl Session {
    /// Establish a session: connect, greeting, EHLO, then TLS and AUTH as
    /// the configuration asks. Every step is abortive on error.
    pub async fn connect(config: &SessionConfig, ip: IpAddr, port: u16) -> Result<Self> {
        let remote = SocketAddr::new(ip, port);

        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(local) = config.local_addr {
            socket.bind(SocketAddr::new(local, 0))?;
        }

        let stream = timeout(
            Duration::from_secs(config.timeouts.connect_secs),
            socket.connect(remote),
        )
        .await
        .map_err(|_| ClientError::Timeout("connect"))??;

        debug!(%remote, helo = %config.helo_name, secure = config.secure, "connected");

        let conn = if config.secure {
            timeout(
                Duration::from_secs(config.timeouts.starttls_secs),
                Connection::Plain(stream).upgrade(&config.server_name),
            )
            .await
            .map_err(|_| ClientError::Tls(String::from("TLS handshake timed out")))??
        } else {
            Connection::Plain(stream)
        };

        let mut session = Self {
            conn: Some(conn),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            capabilities: Capabilities::default(),
            tls: config.secure,
            timeouts: config.timeouts.clone(),
            remote,
        };

        let greeting = session
            .read_reply(config.timeouts.greeting_secs, "greeting")
            .await?;
        if !greeting.is_positive() {
            return Err(ClientError::Rejected {
                command: "connect",
                reply: greeting,
            });
        }

        session.ehlo(&config.helo_name).await?;

        if !session.tls && config.use_starttls && session.capabilities.starttls {
            session.starttls(config).await?;
        }

        if let Some(auth) = &config.auth {
            session.authenticate(auth).await?;
        }

        Ok(session)
    }

    /// Whether the session ended up TLS-protected.
    pub const fn is_tls(&self) -> bool {
        self.tls
    }

    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub const fn remote(&self) -> SocketAddr {
        self.remote
    }

    async fn ehlo(&mut self, helo_name: &str) -> Result<()> {
        let secs = self.timeouts.ehlo_secs;
        let reply = self.command(&format!("EHLO {helo_name}"), secs, "EHLO").await?;
        if !reply.is_positive() {
            return Err(ClientError::Rejected {
                command: "EHLO",
                reply,
            });
        }
        self.capabilities = Capabilities::parse(&reply);
        Ok(())
    }

    async fn starttls(&mut self, config: &SessionConfig) -> Result<()> {
        let secs = self.timeouts.starttls_secs;
        let reply = self.command("STARTTLS", secs, "STARTTLS").await?;
        if !reply.is_positive() {
            // The server advertised STARTTLS but refused it; carry on in
            // plaintext rather than lose the delivery.
            debug!(remote = %self.remote, %reply, "STARTTLS refused, staying plaintext");
            return Ok(());
        }

        let conn = self.conn.take().ok_or(ClientError::ConnectionClosed)?;
        let upgraded = timeout(
            Duration::from_secs(secs),
            conn.upgrade(&config.server_name),
        )
        .await
        .map_err(|_| ClientError::Tls(String::from("TLS handshake timed out")))??;
        self.conn = Some(upgraded);
        self.tls = true;
        // Anything buffered belongs to the plaintext phase.
        self.buffer_pos = 0;

        // RFC 3207: the client must discard its knowledge of the server and
        // re-issue EHLO after the handshake.
        self.ehlo(&config.helo_name).await
    }

    async fn authenticate(&mut self, auth: &AuthConfig) -> Result<()> {
        let secs = self.timeouts.auth_secs;
        match auth.method {
            AuthMethod::Plain => {
                let token = BASE64.encode(format!("\0{}\0{}", auth.user, auth.pass));
                let reply = self
                    .exchange(&format!("AUTH PLAIN {token}"), "AUTH PLAIN *", secs, "AUTH")
                    .await?;
                if reply.is_positive() {
                    Ok(())
                } else {
                    Err(ClientError::Rejected {
                        command: "AUTH",
                        reply,
                    })
                }
            }
            AuthMethod::Login => {
                let reply = self.command("AUTH LOGIN", secs, "AUTH").await?;
                if !reply.is_intermediate() {
                    return Err(ClientError::Rejected {
                        command: "AUTH",
                        reply,
                    });
                }
                let reply = self
                    .exchange(&BASE64.encode(&auth.user), "*", secs, "AUTH")
                    .await?;
                if !reply.is_intermediate() {
                    return Err(ClientError::Rejected {
                        command: "AUTH",
                        reply,
                    });
                }
                let reply = self
                    .exchange(&BASE64.encode(&auth.pass), "*", secs, "AUTH")
                    .await?;
                if reply.is_positive() {
                    Ok(())
                } else {
                    Err(ClientError::Rejected {
                        command: "AUTH",
                        reply,
                    })
                }
            }
        }
    }

    /// Transmit the message: envelope, DATA, then the header block followed
    /// by the body stream, transparency-encoded as it flows. A negative
    /// reply at any step is returned for classification; only transport
    /// failures are errors.
    pub async fn send<S>(&mut self, envelope: &Envelope, headers: &[u8], mut body: S) -> Result<Reply>
    where
        S: Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin + Send,
    {
        let mail = if self.capabilities.size.is_some() {
            format!("MAIL FROM:<{}> SIZE={}", envelope.from, envelope.size)
        } else {
            format!("MAIL FROM:<{}>", envelope.from)
        };
        let reply = self.command(&mail, self.timeouts.mail_secs, "MAIL FROM").await?;
        if !reply.is_positive() {
            return Ok(reply);
        }

        for rcpt in &envelope.to {
            let reply = self
                .command(&format!("RCPT TO:<{rcpt}>"), self.timeouts.rcpt_secs, "RCPT TO")
                .await?;
            if !reply.is_positive() {
                return Ok(reply);
            }
        }

        let reply = self.command("DATA", self.timeouts.data_secs, "DATA").await?;
        if !reply.is_intermediate() {
            return Ok(reply);
        }

        let mut stuffer = DotStuffer::default();
        let mut encoded = Vec::with_capacity(headers.len() + 64);
        stuffer.escape(headers, &mut encoded);
        self.write_chunk(&encoded).await?;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            encoded.clear();
            stuffer.escape(&chunk, &mut encoded);
            if !encoded.is_empty() {
                self.write_chunk(&encoded).await?;
            }
        }

        encoded.clear();
        stuffer.finish(&mut encoded);
        encoded.extend_from_slice(b".\r\n");
        self.write_chunk(&encoded).await?;

        self.read_reply(self.timeouts.data_secs, "end of DATA").await
    }

    /// Close the session: best-effort QUIT, then tear the socket down.
    pub async fn close(mut self) {
        let secs = self.timeouts.quit_secs;
        if let Some(conn) = self.conn.as_mut() {
            let _ = timeout(Duration::from_secs(secs), conn.write_all(b"QUIT\r\n")).await;
            let _ = timeout(Duration::from_secs(secs), conn.shutdown()).await;
        }
    }

    async fn command(&mut self, line: &str, secs: u64, what: &'static str) -> Result<Reply> {
        let log = line.to_string();
        self.exchange(line, &log, secs, what).await
    }

    async fn exchange(
        &mut self,
        line: &str,
        log: &str,
        secs: u64,
        what: &'static str,
    ) -> Result<Reply> {
        trace!(remote = %self.remote, ">>> {log}");
        let data = format!("{line}\r\n");
        let conn = self.conn.as_mut().ok_or(ClientError::ConnectionClosed)?;
        timeout(Duration::from_secs(secs), conn.write_all(data.as_bytes()))
            .await
            .map_err(|_| ClientError::Timeout(what))??;
        self.read_reply(secs, what).await
    }

    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let secs = self.timeouts.data_secs;
        let conn = self.conn.as_mut().ok_or(ClientError::ConnectionClosed)?;
        timeout(Duration::from_secs(secs), conn.write_all(data))
            .await
            .map_err(|_| ClientError::Timeout("DATA stream"))??;
        Ok(())
    }

    async fn read_reply(&mut self, secs: u64, what: &'static str) -> Result<Reply> {
        let reply = timeout(Duration::from_secs(secs), self.read_reply_inner())
            .await
            .map_err(|_| ClientError::Timeout(what))??;
        trace!(remote = %self.remote, "<<< {reply}");
        Ok(reply)
    }

    async fn read_reply_inner(&mut self) -> Result<Reply> {
        loop {
            if let Some((reply, consumed)) = Reply::parse_reply(&self.buffer[..self.buffer_pos])? {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;
                return Ok(reply);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::Parse(format!(
                        "reply exceeds {MAX_BUFFER_SIZE} bytes"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let conn = self.conn.as_mut().ok_or(ClientError::ConnectionClosed)?;
            let n = conn.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

//! Mock SMTP server for exercising delivery scenarios: scripted responses,
//! command capture, and STARTTLS failure injection.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};

#[derive(Clone)]
struct MockServerConfig {
    greeting: (u16, String),
    /// Extra EHLO capability lines, e.g. `SIZE 10485760`, `STARTTLS`.
    capabilities: Vec<String>,
    mail_response: (u16, String),
    rcpt_response: (u16, String),
    data_response: (u16, String),
    data_end_response: (u16, String),
    /// Accept STARTTLS with 220 and then drop the connection, so the
    /// client's TLS handshake dies. Used to drive the plaintext downgrade.
    close_after_starttls: bool,
}

pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

impl Default for MockSmtpServerBuilder {
    fn default() -> Self {
        Self {
            config: MockServerConfig {
                greeting: (220, String::from("mock.test ESMTP ready")),
                capabilities: vec![String::from("SIZE 10485760")],
                mail_response: (250, String::from("2.1.0 sender ok")),
                rcpt_response: (250, String::from("2.1.5 recipient ok")),
                data_response: (354, String::from("go ahead")),
                data_end_response: (250, String::from("2.0.0 OK queued")),
                close_after_starttls: false,
            },
        }
    }
}

impl MockSmtpServerBuilder {
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.config.capabilities = capabilities.iter().map(ToString::to_string).collect();
        self
    }

    pub fn with_rcpt_response(mut self, code: u16, message: &str) -> Self {
        self.config.rcpt_response = (code, message.to_string());
        self
    }

    pub fn with_data_end_response(mut self, code: u16, message: &str) -> Self {
        self.config.data_end_response = (code, message.to_string());
        self
    }

    pub fn close_after_starttls(mut self) -> Self {
        self.config.close_after_starttls = true;
        self
    }

    pub async fn build(self) -> MockSmtpServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = MockSmtpServer {
            addr,
            commands: Arc::new(Mutex::new(Vec::new())),
            messages: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
        };

        let commands = server.commands.clone();
        let messages = server.messages.clone();
        let connections = server.connections.clone();
        let config = self.config;

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                connections.fetch_add(1, Ordering::SeqCst);
                let config = config.clone();
                let commands = commands.clone();
                let messages = messages.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, config, commands, messages).await;
                });
            }
        });

        server
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    /// Every command line received, in order, across all connections.
    pub commands: Arc<Mutex<Vec<String>>>,
    /// Every DATA payload received, terminator excluded.
    pub messages: Arc<Mutex<Vec<Vec<u8>>>>,
    pub connections: Arc<AtomicUsize>,
}

impl MockSmtpServer {
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::default()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// The first command line matching `prefix`, case-insensitively.
    pub fn command_starting_with(&self, prefix: &str) -> Option<String> {
        let prefix = prefix.to_ascii_uppercase();
        self.commands
            .lock()
            .iter()
            .find(|line| line.to_ascii_uppercase().starts_with(&prefix))
            .cloned()
    }
}

async fn handle_connection(
    stream: TcpStream,
    config: MockServerConfig,
    commands: Arc<Mutex<Vec<String>>>,
    messages: Arc<Mutex<Vec<Vec<u8>>>>,
) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let (code, message) = &config.greeting;
    write
        .write_all(format!("{code} {message}\r\n").as_bytes())
        .await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end().to_string();
        commands.lock().push(command.clone());
        let upper = command.to_ascii_uppercase();

        if upper.starts_with("EHLO") || upper.starts_with("HELO") {
            let mut response = String::new();
            if config.capabilities.is_empty() {
                response.push_str("250 mock.test greets you\r\n");
            } else {
                response.push_str("250-mock.test greets you\r\n");
                for (index, capability) in config.capabilities.iter().enumerate() {
                    let separator = if index + 1 == config.capabilities.len() {
                        ' '
                    } else {
                        '-'
                    };
                    response.push_str(&format!("250{separator}{capability}\r\n"));
                }
            }
            write.write_all(response.as_bytes()).await?;
        } else if upper.starts_with("STARTTLS") {
            write.write_all(b"220 ready to start TLS\r\n").await?;
            if config.close_after_starttls {
                return Ok(());
            }
        } else if upper.starts_with("MAIL") {
            let (code, message) = &config.mail_response;
            write
                .write_all(format!("{code} {message}\r\n").as_bytes())
                .await?;
        } else if upper.starts_with("RCPT") {
            let (code, message) = &config.rcpt_response;
            write
                .write_all(format!("{code} {message}\r\n").as_bytes())
                .await?;
        } else if upper == "DATA" {
            let (code, message) = &config.data_response;
            write
                .write_all(format!("{code} {message}\r\n").as_bytes())
                .await?;
            if *code == 354 {
                let mut payload = Vec::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await? == 0 {
                        return Ok(());
                    }
                    if line == ".\r\n" {
                        break;
                    }
                    payload.extend_from_slice(line.as_bytes());
                }
                messages.lock().push(payload);
                let (code, message) = &config.data_end_response;
                write
                    .write_all(format!("{code} {message}\r\n").as_bytes())
                    .await?;
            }
        } else if upper == "QUIT" {
            write.write_all(b"221 2.0.0 bye\r\n").await?;
            return Ok(());
        } else {
            write.write_all(b"250 2.0.0 ok\r\n").await?;
        }
    }
}

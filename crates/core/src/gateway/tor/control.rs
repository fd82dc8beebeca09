use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use torfluxdb_common::GatewayError;
use tracing::trace;

/// Reply code for a successful command
const OK: u16 = 250;

/// Reply code of asynchronous events
const EVENT: u16 = 650;

/// A complete control port reply
///
/// `lines` holds the text after the status code of every reply line. Data
/// blocks (`250+key=` followed by dot-terminated lines) are flattened into
/// the same list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.code == OK
    }

    /// Value of the first `key=value` line with the given key
    pub fn value(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }

    fn message(&self) -> String {
        self.lines.join(" ")
    }
}

/// Client side of the Tor control protocol
///
/// Commands are strictly request/reply. Asynchronous events arriving while a
/// reply is read are queued and handed out by [`ControlConnection::next_event`].
pub struct ControlConnection<S> {
    stream: BufReader<S>,
    events: VecDeque<Reply>,
}

impl<S> ControlConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            events: VecDeque::new(),
        }
    }

    /// Send a command and wait for its reply, failing on any non-250 code
    pub async fn send(&mut self, command: &str) -> Result<Reply, GatewayError> {
        let reply = self.request(command).await?;
        if !reply.is_ok() {
            return Err(GatewayError::Protocol {
                code: reply.code,
                message: reply.message(),
            });
        }
        Ok(reply)
    }

    /// Send a command and return its reply whatever the status code
    pub async fn request(&mut self, command: &str) -> Result<Reply, GatewayError> {
        // Only log the verb, arguments may carry key material
        trace!(
            "Control command {}",
            command.split_whitespace().next().unwrap_or_default()
        );
        let stream = self.stream.get_mut();
        stream.write_all(command.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await?;

        loop {
            let reply = self.read_reply().await?;
            if reply.code == EVENT {
                self.events.push_back(reply);
                continue;
            }
            return Ok(reply);
        }
    }

    /// Wait for the next asynchronous event
    pub async fn next_event(&mut self) -> Result<Reply, GatewayError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        loop {
            let reply = self.read_reply().await?;
            if reply.code == EVENT {
                return Ok(reply);
            }
            trace!("Dropping unsolicited reply {}", reply.code);
        }
    }

    /// Authenticate with the contents of Tor's cookie file
    pub async fn authenticate(&mut self, cookie: &[u8]) -> Result<(), GatewayError> {
        let command = format!("AUTHENTICATE {}", hex::encode(cookie));
        match self.send(&command).await {
            Ok(_) => Ok(()),
            Err(GatewayError::Protocol { code, message }) => Err(GatewayError::Authentication(
                format!("{code} {message}"),
            )),
            Err(e) => Err(e),
        }
    }

    async fn read_reply(&mut self) -> Result<Reply, GatewayError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            let (code, separator, rest) = split_reply_line(&line)?;
            lines.push(rest.to_string());

            match separator {
                ' ' => return Ok(Reply { code, lines }),
                '-' => continue,
                '+' => loop {
                    let data = self.read_line().await?;
                    if data == "." {
                        break;
                    }
                    let data = data.strip_prefix('.').unwrap_or(&data);
                    lines.push(data.to_string());
                },
                other => {
                    return Err(GatewayError::control_port(format!(
                        "malformed reply separator {other:?}"
                    )))
                }
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, GatewayError> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(GatewayError::control_port("connection closed"));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        Ok(line)
    }
}

fn split_reply_line(line: &str) -> Result<(u16, char, &str), GatewayError> {
    let malformed = || GatewayError::control_port(format!("malformed reply line {line:?}"));

    if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
        return Err(malformed());
    }
    let code = line[..3].parse::<u16>().map_err(|_| malformed())?;
    let separator = line[3..4].chars().next().ok_or_else(malformed)?;
    Ok((code, separator, &line[4..]))
}

/// Parse the file written by `ControlPortWriteToFile`, e.g. `PORT=127.0.0.1:9051`
pub fn parse_port_file(contents: &str) -> Option<SocketAddr> {
    contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("PORT="))
        .and_then(|addr| addr.parse().ok())
}

/// Extract the `PROGRESS=` percentage from a `status/bootstrap-phase` value
pub fn bootstrap_progress(phase: &str) -> Option<u8> {
    phase
        .split_whitespace()
        .find_map(|field| field.strip_prefix("PROGRESS="))
        .and_then(|value| value.parse().ok())
}

/// Descriptor publication state carried by an `HS_DESC` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorEvent {
    Uploaded(String),
    Failed(String),
    Other,
}

/// Classify an `HS_DESC` event line such as `HS_DESC UPLOADED <id> ...`
pub fn descriptor_event(line: &str) -> DescriptorEvent {
    let mut fields = line.split_whitespace();
    if fields.next() != Some("HS_DESC") {
        return DescriptorEvent::Other;
    }
    match (fields.next(), fields.next()) {
        (Some("UPLOADED"), Some(id)) => DescriptorEvent::Uploaded(id.to_string()),
        (Some("FAILED"), Some(id)) => DescriptorEvent::Failed(id.to_string()),
        _ => DescriptorEvent::Other,
    }
}

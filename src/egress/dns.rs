//! Filtering DNS resolver behind the DNS redirect.
//!
//! Every query arriving on the redirect port is checked against the egress
//! policy. Denied names are answered `REFUSED` locally; allowed queries are
//! relayed verbatim to the upstream resolver and its answer is returned
//! unchanged. Upstream sockets carry the firewall mark so the redirect lets
//! them through.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use super::engine::match_domain;
use super::policy::{Action, PolicyDocument};

const HEADER_LEN: usize = 12;
const MAX_NAME_LEN: usize = 255;
const MAX_UDP_MESSAGE: usize = 65_535;
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub const RCODE_FORMERR: u8 = 1;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_REFUSED: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Query name, lowercased, without the root dot.
    pub name: String,
    /// Offset just past the question section.
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Too short to even echo the ID back.
    Truncated,
    Malformed(&'static str),
}

/// Parse the single question of a DNS query.
pub fn parse_question(msg: &[u8]) -> Result<Question, ParseError> {
    if msg.len() < HEADER_LEN {
        return Err(ParseError::Truncated);
    }
    if msg[2] & 0x80 != 0 {
        return Err(ParseError::Malformed("not a query"));
    }
    let qdcount = u16::from_be_bytes([msg[4], msg[5]]);
    if qdcount != 1 {
        return Err(ParseError::Malformed("expected exactly one question"));
    }

    let mut labels: Vec<String> = Vec::new();
    let mut name_len = 0;
    let mut pos = HEADER_LEN;
    loop {
        let len = *msg.get(pos).ok_or(ParseError::Malformed("name runs past end"))? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        if len & 0xC0 != 0 {
            return Err(ParseError::Malformed("compressed or extended label in question"));
        }
        let label = msg
            .get(pos..pos + len)
            .ok_or(ParseError::Malformed("label runs past end"))?;
        name_len += len + 1;
        if name_len > MAX_NAME_LEN {
            return Err(ParseError::Malformed("name too long"));
        }
        // The dotted name we evaluate must be the name the upstream resolves.
        if !label.iter().all(|&b| is_hostname_byte(b)) {
            return Err(ParseError::Malformed("label has characters outside letters, digits, '-' and '_'"));
        }
        labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
        pos += len;
    }

    let end = pos + 4;
    if msg.len() < end {
        return Err(ParseError::Malformed("missing qtype/qclass"));
    }

    Ok(Question {
        name: labels.join("."),
        end,
    })
}

fn is_hostname_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

/// Build an answerless reply to `query` with the given RCODE. With
/// `question_end` the question is echoed back; without it the reply carries
/// only the header.
pub fn error_reply(query: &[u8], question_end: Option<usize>, rcode: u8) -> Vec<u8> {
    let end = question_end.unwrap_or(HEADER_LEN);
    let mut reply = query[..end].to_vec();
    let opcode = query[2] & 0x78;
    let rd = query[2] & 0x01;
    reply[2] = 0x80 | opcode | rd;
    reply[3] = 0x80 | (rcode & 0x0F);
    if question_end.is_none() {
        reply[4..6].fill(0);
    }
    reply[6..HEADER_LEN].fill(0);
    reply
}

pub struct DnsFilter {
    policy: Option<Arc<PolicyDocument>>,
    upstream: SocketAddr,
    mark: u32,
    timeout: Duration,
}

impl DnsFilter {
    pub fn new(
        policy: Option<Arc<PolicyDocument>>,
        upstream: SocketAddr,
        mark: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            policy,
            upstream,
            mark,
            timeout,
        }
    }

    /// Answer one query. `None` means the message is dropped.
    pub async fn handle_query(&self, query: &[u8], transport: Transport) -> Option<Vec<u8>> {
        let question = match parse_question(query) {
            Ok(question) => question,
            Err(ParseError::Truncated) => {
                debug!("Dropping truncated DNS message ({} bytes)", query.len());
                return None;
            }
            Err(ParseError::Malformed(reason)) => {
                debug!("Malformed DNS query: {}", reason);
                return Some(error_reply(query, None, RCODE_FORMERR));
            }
        };

        let decision = match_domain(self.policy.as_deref(), &question.name);
        if decision.action == Action::Deny {
            info!(
                domain = %question.name,
                rule = ?decision.rule,
                "egress denied"
            );
            return Some(error_reply(query, Some(question.end), RCODE_REFUSED));
        }
        debug!(domain = %question.name, rule = ?decision.rule, "egress allowed");

        let forwarded = match transport {
            Transport::Udp => self.forward_udp(query).await,
            Transport::Tcp => self.forward_tcp(query).await,
        };
        match forwarded {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!("Upstream DNS for {} failed: {:#}", question.name, e);
                Some(error_reply(query, Some(question.end), RCODE_SERVFAIL))
            }
        }
    }

    async fn forward_udp(&self, query: &[u8]) -> Result<Vec<u8>> {
        let bind: SocketAddr = if self.upstream.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let socket = UdpSocket::bind(bind).await?;
        apply_mark(&socket, self.mark).context("setting firewall mark")?;
        socket.connect(self.upstream).await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; MAX_UDP_MESSAGE];
        loop {
            let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
                .await
                .context("upstream timed out")??;
            // Ignore stray datagrams whose ID does not match.
            if len >= 2 && buf[..2] == query[..2] {
                buf.truncate(len);
                return Ok(buf);
            }
        }
    }

    async fn forward_tcp(&self, query: &[u8]) -> Result<Vec<u8>> {
        let socket = if self.upstream.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        apply_mark(&socket, self.mark).context("setting firewall mark")?;

        tokio::time::timeout(self.timeout, async {
            let mut stream = socket.connect(self.upstream).await?;
            write_frame(&mut stream, query).await?;
            read_frame(&mut stream).await
        })
        .await
        .context("upstream timed out")?
        .map_err(Into::into)
    }

    pub async fn serve_udp(self: Arc<Self>, socket: UdpSocket) -> Result<()> {
        let socket = Arc::new(socket);
        info!("DNS filter listening on udp://{}", socket.local_addr()?);

        let mut buf = vec![0u8; MAX_UDP_MESSAGE];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("DNS receive failed: {}", e);
                    continue;
                }
            };
            let query = buf[..len].to_vec();
            let filter = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                if let Some(reply) = filter.handle_query(&query, Transport::Udp).await
                    && let Err(e) = socket.send_to(&reply, peer).await
                {
                    debug!("Failed to answer {}: {}", peer, e);
                }
            });
        }
    }

    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("DNS filter listening on tcp://{}", listener.local_addr()?);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("DNS accept failed: {}", e);
                    continue;
                }
            };
            let filter = self.clone();
            tokio::spawn(async move {
                if let Err(e) = filter.serve_tcp_connection(stream).await {
                    debug!("DNS connection from {} closed: {}", peer, e);
                }
            });
        }
    }

    async fn serve_tcp_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        loop {
            let query = match tokio::time::timeout(TCP_IDLE_TIMEOUT, read_frame(&mut stream)).await {
                Ok(Ok(query)) => query,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(()),
            };
            match self.handle_query(&query, Transport::Tcp).await {
                Some(reply) => write_frame(&mut stream, &reply).await?,
                None => return Ok(()),
            }
        }
    }
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u16().await? as usize;
    let mut msg = vec![0u8; len];
    stream.read_exact(&mut msg).await?;
    Ok(msg)
}

async fn write_frame(stream: &mut TcpStream, msg: &[u8]) -> std::io::Result<()> {
    let len = u16::try_from(msg.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "DNS message too large"))?;
    stream.write_u16(len).await?;
    stream.write_all(msg).await?;
    stream.flush().await
}

#[cfg(target_os = "linux")]
fn apply_mark<F: std::os::fd::AsFd>(socket: &F, mark: u32) -> std::io::Result<()> {
    if mark != 0 {
        nix::sys::socket::setsockopt(socket, nix::sys::socket::sockopt::Mark, &mark)?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn apply_mark<F>(_socket: &F, _mark: u32) -> std::io::Result<()> {
    Ok(())
}

/// First `nameserver` entry of a resolv.conf, on port 53.
pub fn upstream_from_resolv_conf(contents: &str) -> Option<SocketAddr> {
    contents.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next()? != "nameserver" {
            return None;
        }
        let ip: std::net::IpAddr = fields.next()?.split('%').next()?.parse().ok()?;
        Some(SocketAddr::new(ip, super::redirect::DNS_PORT))
    })
}

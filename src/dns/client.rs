//! client for sending DNS queries to upstream servers

use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use derive_more::{Display, Error, From};
use openssl::ssl::{SslConnector, SslMethod};
use rand::random;
use serde_derive::{Deserialize, Serialize};

use crate::dns::buffer::{BytePacketBuffer, PacketBuffer, StreamPacketBuffer, VectorPacketBuffer};
use crate::dns::netutil::{read_packet_length, write_packet_length};
use crate::dns::protocol::DnsPacket;

#[derive(Debug, Display, From, Error)]
pub enum ClientError {
    Protocol(crate::dns::protocol::ProtocolError),
    Buffer(crate::dns::buffer::BufferError),
    Io(std::io::Error),
    Tls(openssl::error::ErrorStack),
    TlsHandshake,
    InvalidTarget,
    NoResponse,
}

type Result<T> = std::result::Result<T, ClientError>;

/// Transport used for one upstream exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
    TcpTls,
}

impl Protocol {
    /// Parse the configuration string form; the empty string selects udp.
    pub fn from_config(value: &str) -> Option<Protocol> {
        match value {
            "" | "udp" => Some(Protocol::Udp),
            "tcp" => Some(Protocol::Tcp),
            "tcp-tls" => Some(Protocol::TcpTls),
            _ => None,
        }
    }
}

/// Shared upstream settings: an ordered target list plus the transport and
/// timeout applied to each attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub upstreams: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

pub const DEFAULT_UPSTREAMS: [&str; 2] = ["8.8.8.8:53", "1.1.1.1:53"];
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

impl UpstreamConfig {
    /// The stock resolver targets used when a config leaves the list empty.
    pub fn default_targets() -> Vec<String> {
        DEFAULT_UPSTREAMS.iter().map(|s| s.to_string()).collect()
    }

    /// Resolve the configured timeout, falling back to the 5 second
    /// default. An unparseable duration string is a configuration error.
    pub fn resolved_timeout(&self) -> std::result::Result<Duration, String> {
        match self.timeout.as_deref() {
            None | Some("") => Ok(DEFAULT_TIMEOUT),
            Some(text) => {
                parse_duration(text).ok_or_else(|| format!("invalid timeout duration: {}", text))
            }
        }
    }

    /// Resolve the configured protocol, defaulting to udp.
    pub fn resolved_protocol(&self) -> std::result::Result<Protocol, String> {
        let text = self.protocol.as_deref().unwrap_or("");
        Protocol::from_config(text).ok_or_else(|| format!("unsupported protocol: {}", text))
    }

    /// Check every target has host:port form. Called at provisioning so
    /// malformed targets never reach the request path.
    pub fn validate_targets(&self) -> std::result::Result<(), String> {
        for target in &self.upstreams {
            if split_host_port(target).is_none() {
                return Err(format!("invalid upstream address: {}", target));
            }
        }
        Ok(())
    }
}

/// Parse a duration of the form `<digits><unit>` with units ms, s, m or h,
/// optionally repeated (`"1m30s"`).
pub fn parse_duration(text: &str) -> Option<Duration> {
    if text.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    let mut rest = text;

    while !rest.is_empty() {
        let digits_end = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits_end == 0 {
            return None;
        }

        let value: u64 = rest[..digits_end].parse().ok()?;
        rest = &rest[digits_end..];

        let (unit_len, unit) = if rest.starts_with("ms") {
            (2, Duration::from_millis(value))
        } else if rest.starts_with('s') {
            (1, Duration::from_secs(value))
        } else if rest.starts_with('m') {
            (1, Duration::from_secs(value * 60))
        } else if rest.starts_with('h') {
            (1, Duration::from_secs(value * 3600))
        } else {
            return None;
        };

        total += unit;
        rest = &rest[unit_len..];
    }

    Some(total)
}

/// Split a `host:port` target into its parts. Handles bracketed IPv6
/// literals (`[::1]:53`).
pub fn split_host_port(target: &str) -> Option<(&str, u16)> {
    let idx = target.rfind(':')?;
    let (host, port) = (&target[..idx], &target[idx + 1..]);
    let port: u16 = port.parse().ok()?;

    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if host.is_empty() {
        return None;
    }

    Some((host, port))
}

/// A single request/response exchange against one upstream target.
///
/// This seam exists so the forwarding modules can be exercised without a
/// network; the production implementation opens one socket per exchange,
/// which keeps every in flight query's state on its own stack.
pub trait UpstreamExchanger: Send + Sync {
    fn exchange(&self, request: &DnsPacket, target: &str, timeout: Duration) -> Result<DnsPacket>;
}

/// Production exchanger speaking the configured transport.
pub struct NetworkExchanger {
    protocol: Protocol,
}

impl NetworkExchanger {
    pub fn new(protocol: Protocol) -> NetworkExchanger {
        NetworkExchanger { protocol }
    }

    fn resolve_target(target: &str) -> Result<SocketAddr> {
        target
            .to_socket_addrs()
            .map_err(|_| ClientError::InvalidTarget)?
            .next()
            .ok_or(ClientError::InvalidTarget)
    }

    fn exchange_udp(
        &self,
        request: &mut DnsPacket,
        target: SocketAddr,
        timeout: Duration,
    ) -> Result<DnsPacket> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_read_timeout(Some(timeout))?;

        let mut req_buffer = VectorPacketBuffer::new();
        request.write(&mut req_buffer, 512)?;
        let len = req_buffer.pos();
        socket.send_to(req_buffer.get_range(0, len)?, target)?;

        // Responses from earlier, timed out exchanges can still arrive on a
        // fresh ephemeral port; discard anything whose id does not match.
        loop {
            let mut res_buffer = BytePacketBuffer::new();
            let (_, src) = socket.recv_from(&mut res_buffer.buf)?;
            if src != target {
                continue;
            }

            let response = DnsPacket::from_buffer(&mut res_buffer)?;
            if response.header.id == request.header.id {
                return Ok(response);
            }
        }
    }

    fn exchange_tcp(
        &self,
        request: &mut DnsPacket,
        target: SocketAddr,
        timeout: Duration,
    ) -> Result<DnsPacket> {
        let stream = TcpStream::connect_timeout(&target, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let mut stream = stream;
        self.framed_exchange(request, &mut stream)
    }

    fn exchange_tls(
        &self,
        request: &mut DnsPacket,
        host: &str,
        target: SocketAddr,
        timeout: Duration,
    ) -> Result<DnsPacket> {
        let stream = TcpStream::connect_timeout(&target, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let connector = SslConnector::builder(SslMethod::tls())?.build();
        let mut tls_stream = connector.connect(host, stream).map_err(|e| match e {
            openssl::ssl::HandshakeError::SetupFailure(stack) => ClientError::Tls(stack),
            _ => ClientError::TlsHandshake,
        })?;

        self.framed_exchange(request, &mut tls_stream)
    }

    /// Write the request and read the response over a stream transport
    /// with two byte length framing.
    fn framed_exchange<S: std::io::Read + Write>(
        &self,
        request: &mut DnsPacket,
        stream: &mut S,
    ) -> Result<DnsPacket> {
        let mut req_buffer = VectorPacketBuffer::new();
        request.write(&mut req_buffer, 0xFFFF)?;

        let len = req_buffer.pos();
        write_packet_length(stream, len)?;
        stream.write_all(req_buffer.get_range(0, len)?)?;
        stream.flush()?;

        let _ = read_packet_length(stream)?;
        let mut stream_buffer = StreamPacketBuffer::new(stream);
        let response = DnsPacket::from_buffer(&mut stream_buffer)?;

        Ok(response)
    }
}

impl UpstreamExchanger for NetworkExchanger {
    fn exchange(&self, request: &DnsPacket, target: &str, timeout: Duration) -> Result<DnsPacket> {
        let (host, _) = split_host_port(target).ok_or(ClientError::InvalidTarget)?;
        let addr = Self::resolve_target(target)?;

        // Queries carry a fresh transaction id on the wire; the client's
        // original id is restored on the response before returning.
        let mut outbound = request.clone();
        outbound.header.id = random::<u16>();

        let result = match self.protocol {
            Protocol::Udp => self.exchange_udp(&mut outbound, addr, timeout),
            Protocol::Tcp => self.exchange_tcp(&mut outbound, addr, timeout),
            Protocol::TcpTls => self.exchange_tls(&mut outbound, host, addr, timeout),
        };

        result.map(|mut response| {
            response.header.id = request.header.id;
            response
        })
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::dns::protocol::ResultCode;
    use parking_lot::Mutex;

    pub type StubCallback =
        dyn Fn(&DnsPacket, &str) -> Result<DnsPacket> + Send + Sync;

    /// Scripted exchanger for tests: answers are produced by a callback and
    /// every attempted target is recorded.
    pub struct StubExchanger {
        callback: Box<StubCallback>,
        pub attempts: Mutex<Vec<String>>,
    }

    impl StubExchanger {
        pub fn new(callback: Box<StubCallback>) -> StubExchanger {
            StubExchanger {
                callback,
                attempts: Mutex::new(Vec::new()),
            }
        }
    }

    impl UpstreamExchanger for StubExchanger {
        fn exchange(
            &self,
            request: &DnsPacket,
            target: &str,
            _timeout: Duration,
        ) -> Result<DnsPacket> {
            self.attempts.lock().push(target.to_string());
            (self.callback)(request, target)
        }
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(Some(Duration::from_secs(5)), parse_duration("5s"));
        assert_eq!(Some(Duration::from_millis(250)), parse_duration("250ms"));
        assert_eq!(Some(Duration::from_secs(120)), parse_duration("2m"));
        assert_eq!(Some(Duration::from_secs(3600)), parse_duration("1h"));
        assert_eq!(Some(Duration::from_secs(90)), parse_duration("1m30s"));
        assert_eq!(None, parse_duration(""));
        assert_eq!(None, parse_duration("5"));
        assert_eq!(None, parse_duration("fast"));
        assert_eq!(None, parse_duration("5x"));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(Some(("8.8.8.8", 53)), split_host_port("8.8.8.8:53"));
        assert_eq!(Some(("dns.example", 853)), split_host_port("dns.example:853"));
        assert_eq!(Some(("::1", 53)), split_host_port("[::1]:53"));
        assert_eq!(None, split_host_port("8.8.8.8"));
        assert_eq!(None, split_host_port(":53"));
        assert_eq!(None, split_host_port("8.8.8.8:"));
        assert_eq!(None, split_host_port("8.8.8.8:port"));
    }

    #[test]
    fn test_upstream_config_defaults() {
        let config = UpstreamConfig::default();
        assert_eq!(DEFAULT_TIMEOUT, config.resolved_timeout().unwrap());
        assert_eq!(Protocol::Udp, config.resolved_protocol().unwrap());
        assert!(config.validate_targets().is_ok());
    }

    #[test]
    fn test_upstream_config_validation() {
        let config = UpstreamConfig {
            upstreams: vec!["8.8.8.8:53".to_string(), "bad-target".to_string()],
            timeout: None,
            protocol: None,
        };
        assert!(config.validate_targets().is_err());

        let config = UpstreamConfig {
            upstreams: vec![],
            timeout: Some("nope".to_string()),
            protocol: None,
        };
        assert!(config.resolved_timeout().is_err());

        let config = UpstreamConfig {
            upstreams: vec![],
            timeout: None,
            protocol: Some("quic".to_string()),
        };
        assert!(config.resolved_protocol().is_err());
    }

    #[test]
    fn test_stub_exchanger_restores_nothing_by_itself() {
        let stub = StubExchanger::new(Box::new(|request, _| {
            let mut reply = DnsPacket::reply_to(request);
            reply.header.rescode = ResultCode::NOERROR;
            Ok(reply)
        }));

        let mut request = DnsPacket::new();
        request.header.id = 99;

        let response = stub
            .exchange(&request, "192.0.2.1:53", Duration::from_secs(1))
            .unwrap();
        assert_eq!(99, response.header.id);
        assert_eq!(vec!["192.0.2.1:53".to_string()], *stub.attempts.lock());
    }
}

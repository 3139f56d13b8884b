//! the dns app: listener sockets feeding the handler tree
//!
//! One app owns any number of named servers; each server binds its listen
//! addresses for the configured protocols and pushes every parsed message
//! through its handler subtree. Handler errors never kill a listener loop,
//! they are logged and answered with SERVFAIL.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde_derive::Deserialize;
use serde_json::Value;

use crate::dns::buffer::{BytePacketBuffer, PacketBuffer, StreamPacketBuffer, VectorPacketBuffer};
use crate::dns::netutil::{read_packet_length, write_packet_length};
use crate::dns::protocol::{DnsPacket, ResultCode};
use crate::module::{
    App, HandlerResult, LoadContext, Module, ModuleError, ModuleInfo, RequestContext,
    ResponseWriter,
};

pub fn module_info() -> ModuleInfo {
    ModuleInfo {
        id: "dns",
        new: || Box::new(DnsApp::default()),
    }
}

const UDP_WORKER_THREADS: usize = 4;
const UDP_PACKET_SIZE_LIMIT: usize = 512;
// listener loops poll the shutdown flag at this interval
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(250);
const TCP_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// The `dns` app: a set of named servers.
#[derive(Default, Deserialize)]
pub struct DnsApp {
    #[serde(default)]
    servers: HashMap<String, ServerConfig>,
}

impl DnsApp {
    /// Addresses the servers actually bound, in no particular order.
    /// Useful when listening on ephemeral ports.
    pub fn bound_addresses(&self) -> Vec<SocketAddr> {
        self.servers
            .values()
            .flat_map(|server| server.runtime.bound.lock().clone())
            .collect()
    }
}

impl Module for DnsApp {
    fn hydrate(&mut self, raw: &Value) -> crate::module::Result<()> {
        *self = serde_json::from_value(raw.clone()).map_err(|e| ModuleError::Hydrate {
            id: "dns".to_string(),
            source: e,
        })?;
        Ok(())
    }

    fn provision(&mut self, ctx: &LoadContext) -> crate::module::Result<()> {
        for (name, server) in self.servers.iter_mut() {
            server.provision(&ctx.child(name)).map_err(|e| {
                ModuleError::InvalidConfig(format!("failed to provision server {}: {}", name, e))
            })?;
        }
        Ok(())
    }

    fn cleanup(&self) -> crate::module::Result<()> {
        App::stop(self)?;

        for (name, server) in &self.servers {
            if let Some(handler) = &server.runtime.handler {
                if let Err(err) = handler.cleanup() {
                    log::error!(
                        "error cleaning up handler tree server={} error={}",
                        name,
                        err
                    );
                }
            }
        }

        Ok(())
    }

    fn as_app(&self) -> Option<&dyn App> {
        Some(self)
    }
}

impl App for DnsApp {
    fn start(&self) -> crate::module::Result<()> {
        for (name, server) in &self.servers {
            server.start(name).map_err(|e| {
                ModuleError::InvalidConfig(format!("failed to start server {}: {}", name, e))
            })?;
            log::info!(
                "DNS server started server={} listeners={:?} protocols={:?}",
                name,
                server.listen,
                server.protocol
            );
        }
        Ok(())
    }

    fn stop(&self) -> crate::module::Result<()> {
        for (name, server) in &self.servers {
            server.stop();
            log::info!("DNS server stopped server={}", name);
        }
        Ok(())
    }
}

type RequestQueue = Arc<(Mutex<VecDeque<(SocketAddr, DnsPacket)>>, Condvar)>;

#[derive(Default)]
struct ServerRuntime {
    handler: Option<Arc<dyn Module>>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    bound: Mutex<Vec<SocketAddr>>,
}

/// One named server: listen addresses, protocols and a handler subtree.
#[derive(Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    listen: Vec<String>,
    #[serde(default)]
    protocol: Vec<String>,
    #[serde(default)]
    handler: Value,

    #[serde(skip)]
    runtime: ServerRuntime,
}

/// Turn a listen string into a socket address; a bare `:port` binds all
/// interfaces.
fn parse_listen_addr(listen: &str) -> crate::module::Result<SocketAddr> {
    let expanded = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    };

    expanded
        .parse()
        .map_err(|_| ModuleError::InvalidConfig(format!("invalid listen address: {}", listen)))
}

impl ServerConfig {
    fn provision(&mut self, ctx: &LoadContext) -> crate::module::Result<()> {
        if self.listen.is_empty() {
            self.listen = vec![":53".to_string()];
        }
        if self.protocol.is_empty() {
            self.protocol = vec!["udp".to_string(), "tcp".to_string()];
        }

        for listen in &self.listen {
            parse_listen_addr(listen)?;
        }
        for protocol in &self.protocol {
            if protocol != "udp" && protocol != "tcp" {
                return Err(ModuleError::InvalidConfig(format!(
                    "unsupported server protocol: {}",
                    protocol
                )));
            }
        }

        if self.handler.is_null() {
            return Err(ModuleError::InvalidConfig(
                "server must configure a handler".to_string(),
            ));
        }

        let handler = ctx.load_child(&self.handler)?;
        if handler.as_handler().is_none() {
            let id = self
                .handler
                .get("handler")
                .and_then(Value::as_str)
                .unwrap_or("<unknown>");
            return Err(ModuleError::InvalidConfig(format!(
                "module {} does not implement a DNS handler",
                id
            )));
        }
        self.runtime.handler = Some(handler);

        Ok(())
    }

    fn start(&self, name: &str) -> crate::module::Result<()> {
        let handler = self
            .runtime
            .handler
            .clone()
            .ok_or_else(|| ModuleError::InvalidConfig("no handler configured".to_string()))?;

        self.runtime.shutdown.store(false, Ordering::Release);

        for listen in &self.listen {
            let addr = parse_listen_addr(listen)?;
            for protocol in &self.protocol {
                let result = match protocol.as_str() {
                    "udp" => self.start_udp(name, addr, handler.clone()),
                    "tcp" => self.start_tcp(name, addr, handler.clone()),
                    _ => unreachable!("protocols validated at provisioning"),
                };
                result.map_err(|e| {
                    ModuleError::InvalidConfig(format!(
                        "binding {}/{}: {}",
                        listen, protocol, e
                    ))
                })?;
            }
        }

        Ok(())
    }

    fn start_udp(
        &self,
        name: &str,
        addr: SocketAddr,
        handler: Arc<dyn Module>,
    ) -> std::io::Result<()> {
        let socket = Arc::new(UdpSocket::bind(addr)?);
        socket.set_read_timeout(Some(SOCKET_POLL_INTERVAL))?;
        self.runtime.bound.lock().push(socket.local_addr()?);

        log::info!("starting DNS listener addr={} protocol=udp", addr);

        let queue: RequestQueue = Arc::new((Mutex::new(VecDeque::new()), Condvar::new()));
        let mut threads = self.runtime.threads.lock();

        for thread_id in 0..UDP_WORKER_THREADS {
            let socket = socket.clone();
            let handler = handler.clone();
            let queue = queue.clone();
            let shutdown = self.runtime.shutdown.clone();

            let thread = Builder::new()
                .name(format!("dns-udp-{}-request-{}", name, thread_id))
                .spawn(move || loop {
                    let item = {
                        let (lock, condvar) = &*queue;
                        let mut pending = lock.lock();
                        loop {
                            if let Some(item) = pending.pop_front() {
                                break Some(item);
                            }
                            if shutdown.load(Ordering::Acquire) {
                                break None;
                            }
                            condvar.wait_for(&mut pending, SOCKET_POLL_INTERVAL);
                        }
                    };

                    match item {
                        Some((src, request)) => {
                            let mut writer = UdpResponseWriter {
                                socket: &socket,
                                src,
                            };
                            dispatch_query(&handler, &mut writer, &request, src);
                        }
                        None => return,
                    }
                })?;
            threads.push(thread);
        }

        let shutdown = self.runtime.shutdown.clone();
        let thread = Builder::new()
            .name(format!("dns-udp-{}-incoming", name))
            .spawn(move || loop {
                if shutdown.load(Ordering::Acquire) {
                    return;
                }

                let mut req_buffer = BytePacketBuffer::new();
                let src = match socket.recv_from(&mut req_buffer.buf) {
                    Ok((_, src)) => src,
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(e) => {
                        log::warn!("failed to read from UDP socket: {}", e);
                        continue;
                    }
                };

                match DnsPacket::from_buffer(&mut req_buffer) {
                    Ok(request) => {
                        let (lock, condvar) = &*queue;
                        lock.lock().push_back((src, request));
                        condvar.notify_one();
                    }
                    Err(e) => {
                        log::debug!("failed to parse UDP query packet from {}: {}", src, e);
                    }
                }
            })?;
        threads.push(thread);

        Ok(())
    }

    fn start_tcp(
        &self,
        name: &str,
        addr: SocketAddr,
        handler: Arc<dyn Module>,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        self.runtime.bound.lock().push(listener.local_addr()?);

        log::info!("starting DNS listener addr={} protocol=tcp", addr);

        let shutdown = self.runtime.shutdown.clone();
        let thread = Builder::new()
            .name(format!("dns-tcp-{}-incoming", name))
            .spawn(move || loop {
                if shutdown.load(Ordering::Acquire) {
                    return;
                }

                match listener.accept() {
                    Ok((stream, peer)) => {
                        let handler = handler.clone();
                        let spawned = Builder::new()
                            .name("dns-tcp-connection".to_string())
                            .spawn(move || serve_tcp_connection(handler, stream, peer));
                        if let Err(e) = spawned {
                            log::warn!("failed to spawn TCP connection thread: {}", e);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(SOCKET_POLL_INTERVAL);
                    }
                    Err(e) => {
                        log::warn!("failed to accept TCP connection: {}", e);
                        std::thread::sleep(SOCKET_POLL_INTERVAL);
                    }
                }
            })?;
        self.runtime.threads.lock().push(thread);

        Ok(())
    }

    fn stop(&self) {
        self.runtime.shutdown.store(true, Ordering::Release);

        let threads: Vec<JoinHandle<()>> = self.runtime.threads.lock().drain(..).collect();
        for thread in threads {
            if thread.join().is_err() {
                log::error!("listener thread panicked during shutdown");
            }
        }

        self.runtime.bound.lock().clear();
    }
}

/// Serve requests arriving on one TCP connection until the peer goes away.
fn serve_tcp_connection(handler: Arc<dyn Module>, mut stream: TcpStream, peer: SocketAddr) {
    if stream.set_read_timeout(Some(TCP_READ_TIMEOUT)).is_err() {
        return;
    }

    loop {
        if read_packet_length(&mut stream).is_err() {
            return;
        }

        let request = {
            let mut stream_buffer = StreamPacketBuffer::new(&mut stream);
            match DnsPacket::from_buffer(&mut stream_buffer) {
                Ok(request) => request,
                Err(e) => {
                    log::debug!("failed to parse TCP query packet from {}: {}", peer, e);
                    return;
                }
            }
        };

        let mut writer = TcpResponseWriter {
            stream: &mut stream,
            peer,
        };
        dispatch_query(&handler, &mut writer, &request, peer);
    }
}

/// Hand one request to the handler tree with a fresh context. Any handler
/// error is answered with SERVFAIL.
fn dispatch_query(
    handler: &Arc<dyn Module>,
    writer: &mut dyn ResponseWriter,
    request: &DnsPacket,
    src: SocketAddr,
) {
    let ctx = RequestContext::new();

    let served = match handler.as_handler() {
        Some(h) => h.serve_dns(&ctx, writer, request),
        None => {
            log::error!("no handler available for DNS request");
            Err(crate::module::HandlerError::NotAHandler("dns".to_string()))
        }
    };

    if let Err(err) = served {
        let (qname, qtype) = match request.questions.first() {
            Some(q) => (q.name.as_str(), format!("{:?}", q.qtype)),
            None => ("", String::new()),
        };
        log::error!(
            "handler error query_id={} qname={} qtype={} client_ip={} error={}",
            request.header.id,
            qname,
            qtype,
            src.ip(),
            err
        );

        let mut servfail = DnsPacket::reply_to(request);
        servfail.header.rescode = ResultCode::SERVFAIL;
        if let Err(write_err) = writer.write_packet(&mut servfail) {
            log::error!("failed to write DNS response: {}", write_err);
        }
    }
}

struct UdpResponseWriter<'a> {
    socket: &'a UdpSocket,
    src: SocketAddr,
}

impl ResponseWriter for UdpResponseWriter<'_> {
    fn remote_addr(&self) -> SocketAddr {
        self.src
    }

    fn write_packet(&mut self, packet: &mut DnsPacket) -> HandlerResult<()> {
        let mut res_buffer = VectorPacketBuffer::new();
        packet.write(&mut res_buffer, UDP_PACKET_SIZE_LIMIT)?;

        let len = res_buffer.pos();
        let data = res_buffer
            .get_range(0, len)
            .map_err(crate::dns::protocol::ProtocolError::Buffer)?;
        self.socket.send_to(data, self.src)?;

        Ok(())
    }
}

struct TcpResponseWriter<'a> {
    stream: &'a mut TcpStream,
    peer: SocketAddr,
}

impl ResponseWriter for TcpResponseWriter<'_> {
    fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    fn write_packet(&mut self, packet: &mut DnsPacket) -> HandlerResult<()> {
        let mut res_buffer = VectorPacketBuffer::new();
        packet.write(&mut res_buffer, 0xFFFF)?;

        let len = res_buffer.pos();
        write_packet_length(self.stream, len)?;
        let data = res_buffer
            .get_range(0, len)
            .map_err(crate::dns::protocol::ProtocolError::Buffer)?;
        self.stream.write_all(data)?;
        self.stream.flush()?;

        Ok(())
    }
}

//! DNS listeners
//!
//! Every routed name resolves to the router itself: the external listener
//! answers with the backend's external IP, the internal listener with its
//! internal IP. Names without targets are relayed untouched to an upstream
//! resolver.

use crate::error::RouteError;
use crate::router::Router;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const ANSWER_TTL: u32 = 60;
const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_PACKET: usize = 4096;
const FALLBACK_UPSTREAM: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53);

/// Answers single DNS queries against the router
pub struct DnsResolver {
    router: Arc<Router>,
    internal: bool,
    upstream: SocketAddr,
    forward_timeout: Duration,
}

impl DnsResolver {
    pub fn new(router: Arc<Router>, internal: bool, upstream: SocketAddr) -> Self {
        Self {
            router,
            internal,
            upstream,
            forward_timeout: FORWARD_TIMEOUT,
        }
    }

    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = timeout;
        self
    }

    /// Build the reply for one query packet; `None` means drop it
    pub async fn resolve(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(packet) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, len = packet.len(), "Malformed DNS query");
                let id = u16::from_be_bytes([*packet.first()?, *packet.get(1)?]);
                return encode(&Message::error_msg(id, OpCode::Query, ResponseCode::FormErr));
            }
        };

        if request.message_type() != MessageType::Query {
            return None;
        }

        let Some(query) = request.queries().first().cloned() else {
            return encode(&error_reply(&request, ResponseCode::FormErr));
        };

        let name = query.name().to_ascii();
        let host = name.trim_end_matches('.');

        match self.router.route(host).await {
            Ok(_) => {
                let mut reply = error_reply(&request, ResponseCode::NoError);
                reply.set_authoritative(true);

                let ip = self.router.router_ip(self.internal);
                let rdata = match (query.query_type(), ip) {
                    (RecordType::A, IpAddr::V4(v4)) => Some(RData::A(A::from(v4))),
                    (RecordType::AAAA, IpAddr::V6(v6)) => Some(RData::AAAA(AAAA::from(v6))),
                    _ => None,
                };
                if let Some(rdata) = rdata {
                    reply.add_answer(Record::from_rdata(query.name().clone(), ANSWER_TTL, rdata));
                }

                debug!(host, qtype = %query.query_type(), internal = self.internal, "Answered DNS query");
                encode(&reply)
            }
            Err(RouteError::NoBackends) => match self.forward(packet).await {
                Ok(reply) => Some(reply),
                Err(e) => {
                    warn!(host, upstream = %self.upstream, error = %e, "DNS forward failed");
                    encode(&error_reply(&request, ResponseCode::ServFail))
                }
            },
            Err(e @ RouteError::Unreachable(_)) => {
                warn!(host, error = %e, "DNS routing failed");
                encode(&error_reply(&request, ResponseCode::ServFail))
            }
        }
    }

    /// Relay the raw query to the upstream resolver and return its reply
    async fn forward(&self, packet: &[u8]) -> anyhow::Result<Vec<u8>> {
        let bind: SocketAddr = if self.upstream.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.upstream).await?;
        socket.send(packet).await?;

        let mut buf = vec![0u8; MAX_PACKET];
        let len = tokio::time::timeout(self.forward_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| anyhow::anyhow!("upstream timed out"))??;
        buf.truncate(len);
        Ok(buf)
    }
}

/// One UDP listener feeding a [`DnsResolver`]
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    resolver: Arc<DnsResolver>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DnsServer {
    pub fn new(socket: UdpSocket, resolver: DnsResolver, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            socket: Arc::new(socket),
            resolver: Arc::new(resolver),
            shutdown_rx,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.socket.local_addr()?;
        let kind = if self.resolver.internal { "internal" } else { "external" };
        info!(addr = %addr, kind, "DNS server listening");

        let mut shutdown_rx = self.shutdown_rx;
        let mut buf = vec![0u8; MAX_PACKET];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match result {
                        Ok(received) => received,
                        Err(e) => {
                            warn!(kind, error = %e, "DNS receive failed");
                            continue;
                        }
                    };

                    let packet = buf[..len].to_vec();
                    let socket = self.socket.clone();
                    let resolver = self.resolver.clone();
                    tokio::spawn(async move {
                        if let Some(reply) = resolver.resolve(&packet).await {
                            if let Err(e) = socket.send_to(&reply, peer).await {
                                debug!(peer = %peer, error = %e, "DNS reply failed");
                            }
                        }
                    });
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!(kind, "DNS server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// First nameserver from the system resolver configuration, else 1.1.1.1:53
pub fn system_upstream() -> SocketAddr {
    match hickory_resolver::system_conf::read_system_conf() {
        Ok((config, _)) => config
            .name_servers()
            .first()
            .map(|ns| ns.socket_addr)
            .unwrap_or(FALLBACK_UPSTREAM),
        Err(e) => {
            warn!(error = %e, fallback = %FALLBACK_UPSTREAM, "Cannot read system resolver configuration");
            FALLBACK_UPSTREAM
        }
    }
}

fn error_reply(request: &Message, code: ResponseCode) -> Message {
    let mut reply = Message::error_msg(request.id(), request.op_code(), code);
    reply.set_recursion_desired(request.recursion_desired());
    reply.add_queries(request.queries().to_vec());
    reply
}

fn encode(message: &Message) -> Option<Vec<u8>> {
    match message.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(error = %e, "Failed to encode DNS reply");
            None
        }
    }
}

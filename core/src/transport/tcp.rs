//! Direct transport over TCP, negotiated with ICE-TCP conventions
//!
//! The caller gathers an `active` host candidate (port 9, it never listens);
//! the callee listens and gathers a `passive` one. Once the caller knows the
//! remote description it dials each passive candidate it is given. The first
//! connection whose ufrag check passes becomes the channel:
//!
//! ```text
//! dialer   -> "<acceptor ufrag>:<dialer ufrag>"
//! acceptor -> "ok"
//! ```
//!
//! Every frame, handshake included, is a big-endian u32 length followed by
//! that many bytes.

use super::{PeerTransport, Role, TransportError, TransportEvent, TransportFactory};
use crate::relay::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const ACTIVE_DISCARD_PORT: u16 = 9;
const PASSIVE_PRIORITY: u32 = 2_105_524_479;
const ACTIVE_PRIORITY: u32 = 2_105_458_943;
const HANDSHAKE_OK: &[u8] = b"ok";
const UFRAG_ATTRIBUTE: &str = "a=ice-ufrag:";

#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Address the callee listens on
    pub bind_ip: IpAddr,
    /// Address put into the callee's passive candidate
    pub advertise_ip: IpAddr,
    pub connect_timeout: Duration,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TcpTransportConfig {
    /// Bind and advertise loopback only
    pub fn loopback() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TcpTransportFactory {
    config: TcpTransportConfig,
}

impl TcpTransportFactory {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for TcpTransportFactory {
    fn create(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn PeerTransport> {
        Box::new(TcpTransport::new(role, self.config.clone(), events))
    }
}

/// Candidate type as carried in the `tcptype` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpType {
    Active,
    Passive,
}

/// The parts of a candidate line this transport uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpCandidate {
    pub addr: SocketAddr,
    pub tcp_type: TcpType,
}

impl TcpCandidate {
    pub fn to_candidate_line(&self) -> String {
        let (priority, tcp_type) = match self.tcp_type {
            TcpType::Active => (ACTIVE_PRIORITY, "active"),
            TcpType::Passive => (PASSIVE_PRIORITY, "passive"),
        };
        format!(
            "candidate:1 1 tcp {} {} {} typ host tcptype {}",
            priority,
            self.addr.ip(),
            self.addr.port(),
            tcp_type
        )
    }

    /// Parse `candidate:<foundation> <component> tcp <priority> <ip> <port> typ <type> ... tcptype <t>`
    pub fn parse(line: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidCandidate(line.to_string());
        let line = line.strip_prefix("a=").unwrap_or(line);
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 || !fields[0].starts_with("candidate:") || fields[6] != "typ" {
            return Err(invalid());
        }
        if !fields[2].eq_ignore_ascii_case("tcp") {
            return Err(invalid());
        }

        let ip: IpAddr = fields[4].parse().map_err(|_| invalid())?;
        let port: u16 = fields[5].parse().map_err(|_| invalid())?;
        let tcp_type = fields
            .windows(2)
            .find(|pair| pair[0] == "tcptype")
            .map(|pair| pair[1])
            .ok_or_else(invalid)?;
        let tcp_type = match tcp_type {
            "active" => TcpType::Active,
            "passive" => TcpType::Passive,
            _ => return Err(invalid()),
        };

        Ok(Self {
            addr: SocketAddr::new(ip, port),
            tcp_type,
        })
    }
}

fn build_sdp(ufrag: &str, role: Role) -> String {
    let session_id = rand::random::<u32>();
    let setup = match role {
        Role::Controlling => "active",
        Role::Controlled => "passive",
    };
    [
        "v=0".to_string(),
        format!("o=- {session_id} 2 IN IP4 127.0.0.1"),
        "s=-".to_string(),
        "t=0 0".to_string(),
        "m=application 9 TCP tandem".to_string(),
        "c=IN IP4 0.0.0.0".to_string(),
        format!("{UFRAG_ATTRIBUTE}{ufrag}"),
        format!("a=setup:{setup}"),
        "a=mid:0".to_string(),
    ]
    .join("\r\n")
        + "\r\n"
}

/// The `a=ice-ufrag` value of a session description
pub fn sdp_ufrag(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix(UFRAG_ATTRIBUTE))
        .map(str::trim)
        .filter(|ufrag| !ufrag.is_empty())
}

fn random_ufrag() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::MessageTooLarge(payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::MessageTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// State reachable from the background accept, dial and read tasks
struct Shared {
    events: mpsc::UnboundedSender<TransportEvent>,
    opened: AtomicBool,
    closing: AtomicBool,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    /// Make `stream` the channel unless another connection won first
    async fn install(self: &Arc<Self>, stream: TcpStream) {
        if self.opened.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().ok();
        let (mut reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);

        let shared = self.clone();
        self.track(tokio::spawn(async move {
            let reason = loop {
                match read_frame(&mut reader).await {
                    Ok(frame) => {
                        let _ = shared.events.send(TransportEvent::Message(frame));
                    }
                    Err(e) => break e.to_string(),
                }
            };
            if !shared.closing.load(Ordering::SeqCst) {
                let _ = shared.events.send(TransportEvent::Closed { reason });
            }
        }));

        tracing::debug!("Direct channel established with {:?}", peer);
        let _ = self.events.send(TransportEvent::Open);
    }
}

/// A [`PeerTransport`] over a single TCP connection
pub struct TcpTransport {
    role: Role,
    config: TcpTransportConfig,
    local_ufrag: String,
    remote_ufrag: Option<String>,
    local_description: Option<SessionDescription>,
    shared: Arc<Shared>,
}

impl TcpTransport {
    pub fn new(
        role: Role,
        config: TcpTransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            role,
            config,
            local_ufrag: random_ufrag(),
            remote_ufrag: None,
            local_description: None,
            shared: Arc::new(Shared {
                events,
                opened: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                writer: tokio::sync::Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    fn emit_candidate(&self, candidate: TcpCandidate) {
        let _ = self
            .shared
            .events
            .send(TransportEvent::LocalCandidate(IceCandidate::new(
                candidate.to_candidate_line(),
            )));
    }

    fn spawn_dial(&self, addr: SocketAddr, remote_ufrag: String) {
        let shared = self.shared.clone();
        let greeting = format!("{}:{}", remote_ufrag, self.local_ufrag);
        let timeout = self.config.connect_timeout;

        self.shared.track(tokio::spawn(async move {
            let attempt = async {
                let mut stream = TcpStream::connect(addr).await?;
                write_frame(&mut stream, greeting.as_bytes()).await?;
                if read_frame(&mut stream).await? != HANDSHAKE_OK {
                    return Err(TransportError::Io("handshake refused".to_string()));
                }
                Ok::<_, TransportError>(stream)
            };
            match tokio::time::timeout(timeout, attempt).await {
                Ok(Ok(stream)) => shared.install(stream).await,
                Ok(Err(e)) => tracing::debug!("Candidate {} failed: {}", addr, e),
                Err(_) => tracing::debug!("Candidate {} timed out", addr),
            }
        }));
    }

    fn spawn_accept(&self, listener: TcpListener, expected: String) {
        let shared = self.shared.clone();
        let timeout = self.config.connect_timeout;
        self.shared.track(tokio::spawn(async move {
            while !shared.opened.load(Ordering::SeqCst) {
                let Ok((stream, from)) = listener.accept().await else {
                    break;
                };
                // A connector that never greets must not stall the listener
                let handshake = shared.clone();
                let expected = expected.clone();
                shared.track(tokio::spawn(async move {
                    match tokio::time::timeout(timeout, accept_handshake(stream, &expected)).await {
                        Ok(Ok(stream)) => handshake.install(stream).await,
                        Ok(Err(e)) => tracing::debug!("Handshake with {} failed: {}", from, e),
                        Err(_) => tracing::debug!("Handshake with {} timed out", from),
                    }
                }));
            }
        }));
    }
}

async fn accept_handshake(mut stream: TcpStream, expected: &str) -> Result<TcpStream, TransportError> {
    let greeting = read_frame(&mut stream).await?;
    if greeting != expected.as_bytes() {
        tracing::warn!("Rejected connection: ufrag mismatch");
        return Err(TransportError::Io("ufrag mismatch".to_string()));
    }
    write_frame(&mut stream, HANDSHAKE_OK).await?;
    Ok(stream)
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        let offer = SessionDescription::offer(build_sdp(&self.local_ufrag, self.role));
        self.local_description = Some(offer.clone());
        self.emit_candidate(TcpCandidate {
            addr: SocketAddr::new(self.config.advertise_ip, ACTIVE_DISCARD_PORT),
            tcp_type: TcpType::Active,
        });
        Ok(offer)
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        let remote_ufrag = self
            .remote_ufrag
            .clone()
            .ok_or(TransportError::NoRemoteDescription)?;

        let listener = TcpListener::bind(SocketAddr::new(self.config.bind_ip, 0)).await?;
        let port = listener.local_addr()?.port();
        self.spawn_accept(listener, format!("{}:{}", self.local_ufrag, remote_ufrag));

        let answer = SessionDescription::answer(build_sdp(&self.local_ufrag, self.role));
        self.local_description = Some(answer.clone());
        self.emit_candidate(TcpCandidate {
            addr: SocketAddr::new(self.config.advertise_ip, port),
            tcp_type: TcpType::Passive,
        });
        Ok(answer)
    }

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        let expected = match self.role {
            Role::Controlling => SdpType::Answer,
            Role::Controlled => SdpType::Offer,
        };
        if description.kind != expected {
            return Err(TransportError::InvalidDescription(format!(
                "{} side cannot apply a remote {:?}",
                self.role, description.kind
            )));
        }
        let ufrag = sdp_ufrag(&description.sdp)
            .ok_or_else(|| TransportError::InvalidDescription("missing ice-ufrag".to_string()))?;
        self.remote_ufrag = Some(ufrag.to_string());
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let remote_ufrag = self
            .remote_ufrag
            .clone()
            .ok_or(TransportError::NoRemoteDescription)?;
        // An empty candidate marks end-of-candidates
        if candidate.candidate.trim().is_empty() {
            return Ok(());
        }

        let parsed = TcpCandidate::parse(&candidate.candidate)?;
        match (self.role, parsed.tcp_type) {
            (Role::Controlling, TcpType::Passive) => {
                if !self.shared.opened.load(Ordering::SeqCst) {
                    self.spawn_dial(parsed.addr, remote_ufrag);
                }
            }
            // Active candidates only tell us the peer will dial
            _ => tracing::trace!("Ignoring {:?} candidate {}", parsed.tcp_type, parsed.addr),
        }
        Ok(())
    }

    async fn send(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
        let mut writer = self.shared.writer.lock().await;
        let writer = writer.as_mut().ok_or(TransportError::NotOpen)?;
        write_frame(writer, &data).await
    }

    async fn close(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        let tasks: Vec<JoinHandle<()>> = self.shared.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    async fn next_candidate(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> IceCandidate {
        match next_event(rx).await {
            TransportEvent::LocalCandidate(candidate) => candidate,
            other => panic!("expected candidate, got {:?}", other),
        }
    }

    fn pair() -> (
        TcpTransport,
        mpsc::UnboundedReceiver<TransportEvent>,
        TcpTransport,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (caller_tx, caller_rx) = mpsc::unbounded_channel();
        let (callee_tx, callee_rx) = mpsc::unbounded_channel();
        (
            TcpTransport::new(Role::Controlling, TcpTransportConfig::loopback(), caller_tx),
            caller_rx,
            TcpTransport::new(Role::Controlled, TcpTransportConfig::loopback(), callee_tx),
            callee_rx,
        )
    }

    #[test]
    fn test_candidate_line_roundtrip() {
        let candidate = TcpCandidate {
            addr: "192.168.1.20:50000".parse().unwrap(),
            tcp_type: TcpType::Passive,
        };
        let line = candidate.to_candidate_line();
        assert_eq!(
            line,
            "candidate:1 1 tcp 2105524479 192.168.1.20 50000 typ host tcptype passive"
        );
        assert_eq!(TcpCandidate::parse(&line).unwrap(), candidate);
        assert_eq!(TcpCandidate::parse(&format!("a={line}")).unwrap(), candidate);
    }

    #[test]
    fn test_candidate_parse_rejects_garbage() {
        for line in [
            "",
            "candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host",
            "candidate:1 1 tcp 1 not-an-ip 5000 typ host tcptype passive",
            "candidate:1 1 tcp 1 10.0.0.1 99999 typ host tcptype passive",
            "candidate:1 1 tcp 1 10.0.0.1 5000 typ host",
            "candidate:1 1 tcp 1 10.0.0.1 5000 typ host tcptype so",
        ] {
            assert!(TcpCandidate::parse(line).is_err(), "accepted {line:?}");
        }
    }

    #[test]
    fn test_sdp_ufrag() {
        let sdp = build_sdp("abcd1234", Role::Controlling);
        assert_eq!(sdp_ufrag(&sdp), Some("abcd1234"));
        assert!(sdp.contains("a=setup:active"));
        assert_eq!(sdp_ufrag("v=0\r\ns=-\r\n"), None);
        assert_eq!(sdp_ufrag("a=ice-ufrag:\r\n"), None);
    }

    #[tokio::test]
    async fn test_description_rules() {
        let (mut caller, _caller_rx, mut callee, _callee_rx) = pair();

        assert_eq!(
            callee.create_answer().await,
            Err(TransportError::NoRemoteDescription)
        );
        assert_eq!(
            caller.add_ice_candidate(&IceCandidate::new("candidate:x")).await,
            Err(TransportError::NoRemoteDescription)
        );

        let offer = caller.create_offer().await.unwrap();
        assert!(matches!(
            caller.set_remote_description(&offer).await,
            Err(TransportError::InvalidDescription(_))
        ));
        assert!(matches!(
            callee
                .set_remote_description(&SessionDescription::offer("v=0"))
                .await,
            Err(TransportError::InvalidDescription(_))
        ));
        assert!(callee.set_remote_description(&offer).await.is_ok());
    }

    #[tokio::test]
    async fn test_channel_opens_and_carries_messages() {
        let (mut caller, mut caller_rx, mut callee, mut callee_rx) = pair();

        let offer = caller.create_offer().await.unwrap();
        let active = next_candidate(&mut caller_rx).await;
        assert!(active.candidate.contains("tcptype active"));

        callee.set_remote_description(&offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        let passive = next_candidate(&mut callee_rx).await;
        callee.add_ice_candidate(&active).await.unwrap();

        caller.set_remote_description(&answer).await.unwrap();
        caller.add_ice_candidate(&passive).await.unwrap();

        assert_eq!(next_event(&mut caller_rx).await, TransportEvent::Open);
        assert_eq!(next_event(&mut callee_rx).await, TransportEvent::Open);

        caller.send(b"hello bob".to_vec()).await.unwrap();
        callee.send(b"hello alice".to_vec()).await.unwrap();
        assert_eq!(
            next_event(&mut callee_rx).await,
            TransportEvent::Message(b"hello bob".to_vec())
        );
        assert_eq!(
            next_event(&mut caller_rx).await,
            TransportEvent::Message(b"hello alice".to_vec())
        );

        caller.close().await;
        assert!(matches!(
            next_event(&mut callee_rx).await,
            TransportEvent::Closed { .. }
        ));
        assert_eq!(caller.send(b"late".to_vec()).await, Err(TransportError::NotOpen));
    }

    #[tokio::test]
    async fn test_ufrag_mismatch_never_opens() {
        let (mut caller, _caller_rx, mut callee, mut callee_rx) = pair();

        let offer = caller.create_offer().await.unwrap();
        callee.set_remote_description(&offer).await.unwrap();
        let _answer = callee.create_answer().await.unwrap();
        let passive = next_candidate(&mut callee_rx).await;

        // Caller believes the callee's ufrag is something else
        let forged = SessionDescription::answer(build_sdp("deadbeef", Role::Controlled));
        caller.set_remote_description(&forged).await.unwrap();
        caller.add_ice_candidate(&passive).await.unwrap();

        assert!(timeout(Duration::from_millis(300), callee_rx.recv()).await.is_err());
        assert_eq!(caller.send(b"x".to_vec()).await, Err(TransportError::NotOpen));
    }

    #[tokio::test]
    async fn test_silent_connection_does_not_block_caller() {
        let (mut caller, mut caller_rx, mut callee, mut callee_rx) = pair();

        let offer = caller.create_offer().await.unwrap();
        callee.set_remote_description(&offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        let passive = next_candidate(&mut callee_rx).await;

        // Connects to the passive candidate and never sends a greeting
        let addr = TcpCandidate::parse(&passive.candidate).unwrap().addr;
        let _silent = TcpStream::connect(addr).await.unwrap();

        caller.set_remote_description(&answer).await.unwrap();
        caller.add_ice_candidate(&passive).await.unwrap();

        let _active = next_candidate(&mut caller_rx).await;
        assert_eq!(next_event(&mut caller_rx).await, TransportEvent::Open);
        assert_eq!(next_event(&mut callee_rx).await, TransportEvent::Open);
    }

    #[tokio::test]
    async fn test_send_before_open() {
        let (mut caller, _rx, _callee, _callee_rx) = pair();
        assert_eq!(caller.send(b"x".to_vec()).await, Err(TransportError::NotOpen));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut sink = Vec::new();
        let payload = vec![0u8; MAX_FRAME_LEN + 1];
        assert_eq!(
            write_frame(&mut sink, &payload).await,
            Err(TransportError::MessageTooLarge(MAX_FRAME_LEN + 1))
        );
        assert!(sink.is_empty());
    }
}

//! Stealth bridge: UDP-over-TLS relay.
//!
//! Restrictive networks drop or throttle raw UDP. The bridge binds a
//! local UDP socket the tunnel engine is pointed at, opens one TLS
//! stream to the remote relay on port 443, and shuttles datagrams as
//! length-prefixed frames so the flow looks like ordinary HTTPS.
//!
//! Frame format: 2-byte big-endian payload length, then the payload.
//! The uplink task records the engine's source address on every
//! datagram; the downlink task replies to whatever address was seen
//! last, so an engine restart rebinding its socket heals on the next
//! outbound packet.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Largest datagram a 2-byte length prefix can carry.
pub const MAX_FRAME_LEN: usize = 65535;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to bind local UDP port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },
    #[error("failed to connect to relay {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },
    #[error("TLS handshake with relay failed: {0}")]
    Tls(String),
    #[error("relay I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Prefix `payload` with its big-endian length. The payload must fit
/// the 2-byte prefix, i.e. be at most [`MAX_FRAME_LEN`] bytes.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_FRAME_LEN, "frame payload too large");
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(payload)).await?;
    writer.flush().await
}

/// Read one length-prefixed frame. A zero-length frame yields an empty
/// payload; EOF mid-frame surfaces as an error.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;
    let len = u16::from_be_bytes(header) as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// The relay. `start` is idempotent while running; `stop` tears both
/// pump tasks down and may be called from any state.
pub struct StealthBridge {
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    accept_invalid_certs: bool,
    running: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl StealthBridge {
    pub fn new(
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
        accept_invalid_certs: bool,
    ) -> Self {
        Self {
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            accept_invalid_certs,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Vec::new(),
        }
    }

    /// Local endpoint the tunnel engine should be pointed at.
    pub fn local_endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.local_port)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn start(&mut self) -> Result<(), BridgeError> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Bridge already running");
            return Ok(());
        }

        let bind_addr = format!("127.0.0.1:{}", self.local_port);
        let udp = match UdpSocket::bind(&bind_addr).await {
            Ok(socket) => Arc::new(socket),
            Err(source) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(BridgeError::Bind {
                    port: self.local_port,
                    source,
                });
            }
        };

        let endpoint = format!("{}:{}", self.remote_host, self.remote_port);
        let tls = match self.connect_relay(&endpoint).await {
            Ok(stream) => stream,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        info!("Stealth bridge up: {bind_addr} -> {endpoint}");

        let (read_half, write_half) = tokio::io::split(tls);

        // Uplink records the engine's address so downlink knows where
        // replies go; the engine always transmits first (handshake).
        let (peer_tx, peer_rx) = watch::channel(None::<SocketAddr>);

        self.tasks.push(tokio::spawn(uplink(
            Arc::clone(&udp),
            write_half,
            peer_tx,
            Arc::clone(&self.running),
        )));
        self.tasks.push(tokio::spawn(downlink(
            udp,
            read_half,
            peer_rx,
            Arc::clone(&self.running),
        )));

        Ok(())
    }

    pub fn stop(&mut self) {
        // Reap both tasks even if a pump failure already cleared the
        // flag, or the surviving side lingers until Drop.
        let was_running = self.running.swap(false, Ordering::SeqCst);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if was_running {
            info!("Stealth bridge stopped");
        }
    }

    async fn connect_relay(
        &self,
        endpoint: &str,
    ) -> Result<tokio_native_tls::TlsStream<TcpStream>, BridgeError> {
        let tcp = TcpStream::connect(endpoint)
            .await
            .map_err(|source| BridgeError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;
        tcp.set_nodelay(true)?;

        // Middleboxes kill idle flows; keepalive holds the NAT binding
        // between tunnel keepalives.
        let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_INTERVAL);
        socket2::SockRef::from(&tcp).set_tcp_keepalive(&keepalive)?;

        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .danger_accept_invalid_hostnames(self.accept_invalid_certs)
            .build()
            .map_err(|e| BridgeError::Tls(e.to_string()))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        connector
            .connect(&self.remote_host, tcp)
            .await
            .map_err(|e| BridgeError::Tls(e.to_string()))
    }
}

impl Drop for StealthBridge {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Datagrams from the local engine, framed onto the TLS stream.
async fn uplink<W>(
    udp: Arc<UdpSocket>,
    mut tls: W,
    peer: watch::Sender<Option<SocketAddr>>,
    running: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_FRAME_LEN];
    while running.load(Ordering::SeqCst) {
        let (len, from) = match udp.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("Bridge uplink UDP receive failed: {e}");
                break;
            }
        };
        peer.send_replace(Some(from));

        if let Err(e) = write_frame(&mut tls, &buf[..len]).await {
            warn!("Bridge uplink write failed: {e}");
            break;
        }
    }
    running.store(false, Ordering::SeqCst);
    debug!("Bridge uplink task exiting");
}

/// Frames from the TLS stream, unwrapped back to the engine's last
/// known address.
async fn downlink<R>(
    udp: Arc<UdpSocket>,
    mut tls: R,
    peer: watch::Receiver<Option<SocketAddr>>,
    running: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    while running.load(Ordering::SeqCst) {
        let payload = match read_frame(&mut tls).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Bridge downlink read failed: {e}");
                break;
            }
        };

        let Some(target) = *peer.borrow() else {
            // Nothing has transmitted yet, so there is nowhere to
            // deliver this frame.
            debug!("Dropping {} relay bytes, no local peer yet", payload.len());
            continue;
        };
        if let Err(e) = udp.send_to(&payload, target).await {
            warn!("Bridge downlink UDP send failed: {e}");
            break;
        }
    }
    running.store(false, Ordering::SeqCst);
    debug!("Bridge downlink task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        write_frame(&mut a, &[0xAB; 300]).await.unwrap();

        assert_eq!(read_frame(&mut b).await.unwrap(), b"hello");
        assert_eq!(read_frame(&mut b).await.unwrap(), b"");
        assert_eq!(read_frame(&mut b).await.unwrap(), vec![0xAB; 300]);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&encode_frame(b"partial")[..4]).await.unwrap();
        drop(a);
        assert!(read_frame(&mut b).await.is_err());
    }

    #[test]
    fn test_encode_frame_header() {
        let frame = encode_frame(&[1, 2, 3]);
        assert_eq!(frame, vec![0, 3, 1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "frame payload too large")]
    fn test_encode_frame_rejects_oversized_payload() {
        encode_frame(&vec![0u8; MAX_FRAME_LEN + 1]);
    }

    #[tokio::test]
    async fn test_pumps_relay_datagrams_and_replace_peer() {
        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let relay_addr = udp.local_addr().unwrap();
        let running = Arc::new(AtomicBool::new(true));

        let (local_stream, remote_stream) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(local_stream);
        let (peer_tx, peer_rx) = watch::channel(None);

        let up = tokio::spawn(uplink(
            Arc::clone(&udp),
            write_half,
            peer_tx,
            Arc::clone(&running),
        ));
        let down = tokio::spawn(downlink(
            Arc::clone(&udp),
            read_half,
            peer_rx,
            Arc::clone(&running),
        ));
        let (mut far_read, mut far_write) = tokio::io::split(remote_stream);

        // Datagram in, frame out, reply frame back to the sender.
        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        first.send_to(b"ping", relay_addr).await.unwrap();
        assert_eq!(read_frame(&mut far_read).await.unwrap(), b"ping");

        write_frame(&mut far_write, b"pong").await.unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = first.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"pong");
        assert_eq!(from, relay_addr);

        // A newer local sender replaces the first; replies now go to it.
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        second.send_to(b"ping2", relay_addr).await.unwrap();
        assert_eq!(read_frame(&mut far_read).await.unwrap(), b"ping2");

        write_frame(&mut far_write, b"pong2").await.unwrap();
        let (len, _) = second.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"pong2");

        running.store(false, Ordering::SeqCst);
        up.abort();
        down.abort();
    }

    #[tokio::test]
    async fn test_start_fails_when_relay_unreachable() {
        // Bind then drop a listener so the port is known-closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut bridge = StealthBridge::new(0, "127.0.0.1", port, true);
        let result = bridge.start().await;
        assert!(matches!(result, Err(BridgeError::Connect { .. })));
        assert!(!bridge.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut bridge = StealthBridge::new(0, "127.0.0.1", 1, true);
        bridge.stop();
        bridge.stop();
        assert!(!bridge.is_running());
    }

    #[tokio::test]
    async fn test_stop_reaps_tasks_after_pump_failure() {
        let mut bridge = StealthBridge::new(0, "127.0.0.1", 1, true);
        // One pump died and cleared the flag; its counterpart is still
        // parked on a blocked receive.
        bridge.tasks.push(tokio::spawn(std::future::pending::<()>()));
        bridge.running.store(false, Ordering::SeqCst);

        bridge.stop();
        assert!(bridge.tasks.is_empty());
    }
}

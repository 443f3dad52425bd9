//! The framed transport. Frames go over TCP as a big-endian u32 length
//! prefix followed by the message bytes; the reserved header at the front of
//! every message carries the sender's logical endpoint id, so receivers know
//! who is talking without a handshake. Outbound connections are created on
//! demand, one writer task per peer, and dropped on error -- the nonce-based
//! resend machinery upstream makes redelivery someone else's problem.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use geokv::config::Configuration;
use geokv::ids::CommId;
use geokv::kvs::daemon::KvsDaemon;
use geokv::storage::cask::Cask;
use geokv::txman::daemon::TxmanDaemon;
use geokv::wire::{Envelope, Message, Outbox, HEADER_SIZE};

/// Frames larger than this are treated as corruption.
const MAX_FRAME: u32 = 64 * 1024 * 1024;

/// The daemon behind this listener.
pub enum Daemon {
    Txman(Arc<TxmanDaemon>),
    Kvs(Arc<KvsDaemon<Cask>>),
}

impl Daemon {
    fn handle(&self, from: CommId, msg: Message, now: Instant, out: &mut Outbox) {
        let result = match self {
            Daemon::Txman(d) => d.handle(from, msg, now, out),
            Daemon::Kvs(d) => d.handle(from, msg, now, out),
        };
        if let Err(err) = result {
            // Protocol violations are logged and dropped; the connection
            // stays up.
            warn!("dropping frame from {}: {}", from, err);
        }
    }

    fn pump(&self, now: Instant, out: &mut Outbox) {
        match self {
            Daemon::Txman(d) => d.pump(now, out),
            Daemon::Kvs(d) => d.pump(now, out),
        }
    }

    fn debug_dump(&self) {
        match self {
            Daemon::Txman(d) => d.debug_dump(),
            Daemon::Kvs(d) => d.debug_dump(),
        }
    }
}

async fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> std::io::Result<()> {
    stream.write_u32(frame.len() as u32).await?;
    stream.write_all(frame).await?;
    stream.flush().await
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds the transport maximum", len),
        ));
    }
    let mut frame = vec![0; len as usize];
    stream.read_exact(&mut frame).await?;
    Ok(frame)
}

pub struct Transport {
    us: CommId,
    config: Arc<Configuration>,
    peers: Mutex<HashMap<CommId, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Transport {
    pub fn new(us: CommId, config: Arc<Configuration>) -> Arc<Self> {
        Arc::new(Transport { us, config, peers: Mutex::new(HashMap::new()) })
    }

    /// Stamps the sender id into the reserved header and queues the frame
    /// for the peer's writer, connecting first if necessary.
    pub async fn deliver(self: &Arc<Self>, env: Envelope) {
        let mut frame = env.msg.encode();
        frame[..HEADER_SIZE].copy_from_slice(&self.us.0.to_be_bytes());

        let mut peers = self.peers.lock().await;
        if let Some(writer) = peers.get(&env.to) {
            if writer.send(frame.clone()).is_ok() {
                return;
            }
            peers.remove(&env.to);
        }
        let addr = match self.config.address(env.to) {
            Some(addr) => addr.to_owned(),
            None => {
                warn!("no address for {}; dropping frame", env.to);
                return;
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        peers.insert(env.to, tx.clone());
        drop(peers);
        tokio::spawn(write_peer(env.to, addr, rx));
        let _ = tx.send(frame);
    }

    pub async fn deliver_all(self: &Arc<Self>, out: Outbox) {
        for env in out {
            self.deliver(env).await;
        }
    }
}

async fn write_peer(peer: CommId, addr: String, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    let mut stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!("connect to {} ({}) failed: {}", peer, addr, err);
            return; // the channel drops; resends reconnect
        }
    };
    while let Some(frame) = rx.recv().await {
        if let Err(err) = write_frame(&mut stream, &frame).await {
            warn!("send to {} ({}) failed: {}", peer, addr, err);
            return;
        }
    }
}

/// Accepts connections and feeds inbound frames to the daemon; responses go
/// back out through the transport.
pub async fn serve(
    listener: TcpListener,
    daemon: Arc<Daemon>,
    transport: Arc<Transport>,
) -> Result<()> {
    loop {
        let (mut stream, peer_addr) = listener.accept().await.context("accept")?;
        let daemon = daemon.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            loop {
                let frame = match read_frame(&mut stream).await {
                    Ok(frame) => frame,
                    Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(err) => {
                        warn!("read from {} failed: {}", peer_addr, err);
                        break;
                    }
                };
                if frame.len() < HEADER_SIZE {
                    warn!("runt frame from {}; dropping", peer_addr);
                    continue;
                }
                let mut sender = [0u8; HEADER_SIZE];
                sender.copy_from_slice(&frame[..HEADER_SIZE]);
                let from = CommId(u64::from_be_bytes(sender));
                let msg = match Message::decode(&frame) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!("corrupt frame from {} ({}): {}", from, peer_addr, err);
                        continue;
                    }
                };
                let mut out = Outbox::new();
                daemon.handle(from, msg, Instant::now(), &mut out);
                transport.deliver_all(out).await;
            }
        });
    }
}

/// Drives the daemon's periodic work: resends, deadlines, and sweeps.
pub async fn pump_loop(daemon: Arc<Daemon>, transport: Arc<Transport>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut ticks: u64 = 0;
    loop {
        ticker.tick().await;
        let mut out = Outbox::new();
        daemon.pump(Instant::now(), &mut out);
        transport.deliver_all(out).await;
        ticks += 1;
        if ticks % 300 == 0 {
            daemon.debug_dump();
        }
    }
}

/// Fetches the cluster configuration from the coordinator, which publishes
/// it as a single wire-encoded frame on connect.
pub async fn fetch_configuration(coordinator: &str) -> Result<Configuration> {
    let mut stream = TcpStream::connect(coordinator)
        .await
        .with_context(|| format!("connect to coordinator {}", coordinator))?;
    let frame = read_frame(&mut stream)
        .await
        .map_err(|err| anyhow!("read configuration from {}: {}", coordinator, err))?;
    let config = Configuration::decode(&frame)
        .map_err(|err| anyhow!("decode configuration: {}", err))?;
    info!("fetched configuration:\n{}", config);
    Ok(config)
}

//! Peer-to-peer gossip and chain synchronization.
//!
//! Peers speak length-prefixed JSON over TCP: a 4-byte big-endian frame
//! length followed by one serialized [`Message`]. Every connection is
//! symmetric once established; both sides open by asking for the peer's
//! advertised address, its tip, and its peer list, then react to whatever
//! arrives. The address handshake closes duplicate connections that were
//! opened from both sides at once.
//!
//! Chain reconciliation follows a three-branch rule. When a peer's latest
//! block extends our tip it is appended and re-broadcast. When it is ahead
//! but does not attach and the peer sent only that single block, we ask for
//! its full chain. When a full chain arrives that is strictly longer and
//! valid from genesis, it replaces ours and its tip is re-broadcast.
//! Anything at or below our height is ignored.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use pyrite_chain::{ChainError, ChainEvent, ChainManager};
use pyrite_codec::Block;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::addrbook::AddressBook;

/// Hard cap on a single wire frame.
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// Most blocks accepted in one `ResponseBlockchain`.
pub const MAX_BLOCKS_PER_MESSAGE: usize = 100_000;

/// Most addresses accepted in one `ResponsePeers`.
pub const MAX_ADDRS_PER_MESSAGE: usize = 1000;

/// How often the dialer retries known-but-unconnected addresses.
const DIAL_INTERVAL_SECS: u64 = 10;

/// How often we re-ask connected peers for their address lists.
const ASK_PEERS_INTERVAL_SECS: u64 = 600;

/// Anti-entropy: how often we re-query every peer's tip.
const ANTI_ENTROPY_INTERVAL_SECS: u64 = 60;

/// Keep-alive cadence; also flushes out dead sockets via send failures.
const KEEP_ALIVE_INTERVAL_SECS: u64 = 30;

const WRITE_TIMEOUT_SECS: u64 = 30;

/// Reaps peers that go silent. Live peers send `KeepAlive` every
/// [`KEEP_ALIVE_INTERVAL_SECS`], so a read stalling this long means the
/// socket is dead even if our sends still succeed.
const READ_TIMEOUT_SECS: u64 = 3 * KEEP_ALIVE_INTERVAL_SECS;

#[derive(Debug, thiserror::Error)]
pub enum P2pError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid message json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(usize),
    #[error("message rejected: {0}")]
    Rejected(&'static str),
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("peer table lock poisoned")]
    Lock,
}

/// Wire messages, tagged JSON on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    QueryLatest,
    QueryAll,
    ResponseBlockchain(Vec<Block>),
    QueryPeers,
    ResponsePeers(Vec<String>),
    QueryPeerAddress,
    ResponsePeerAddress(String),
    KeepAlive,
}

/// Outcome of handling a `ResponseBlockchain`.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// The block was adopted and should be gossiped onward.
    Broadcast(Block),
    /// The peer is ahead of us; its full chain is needed.
    QueryAll,
    /// Nothing to do.
    Ignored,
}

/// Applies a peer's `ResponseBlockchain` payload to the local chain and
/// says what, if anything, to send next.
pub fn reconcile(chain: &ChainManager, received: Vec<Block>) -> Result<Reconciliation, P2pError> {
    let Some(latest_received) = received.last().cloned() else {
        debug!("peer sent an empty blockchain response");
        return Ok(Reconciliation::Ignored);
    };
    let latest_held = chain.latest_block()?;
    if latest_received.index <= latest_held.index {
        return Ok(Reconciliation::Ignored);
    }
    if latest_received.previous_hash == latest_held.hash {
        if chain.add_block(latest_received.clone())? {
            info!(index = latest_received.index, "appended block from peer");
            return Ok(Reconciliation::Broadcast(latest_received));
        }
        return Ok(Reconciliation::Ignored);
    }
    if received.len() == 1 {
        debug!(
            peer_index = latest_received.index,
            held_index = latest_held.index,
            "peer is ahead, requesting full chain"
        );
        return Ok(Reconciliation::QueryAll);
    }
    if chain.replace_chain(received)? {
        info!(tip = latest_received.index, "adopted longer chain from peer");
        return Ok(Reconciliation::Broadcast(latest_received));
    }
    Ok(Reconciliation::Ignored)
}

/// Serializes a message into a ready-to-write frame.
fn frame(msg: &Message) -> Result<Vec<u8>, P2pError> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_MESSAGE_BYTES {
        return Err(P2pError::FrameTooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Applies the write and read deadlines every peer socket runs under.
fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_write_timeout(Some(Duration::from_secs(WRITE_TIMEOUT_SECS)))?;
    stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)))
}

fn read_message(stream: &mut TcpStream) -> Result<Message, P2pError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(P2pError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    parse_message_bytes(&body)
}

/// Parses and sanity-checks one frame body. Split out so it can be fuzzed
/// without a socket.
pub fn parse_message_bytes(body: &[u8]) -> Result<Message, P2pError> {
    let msg: Message = serde_json::from_slice(body)?;
    validate_message(&msg)?;
    Ok(msg)
}

fn validate_message(msg: &Message) -> Result<(), P2pError> {
    match msg {
        Message::ResponseBlockchain(blocks) if blocks.len() > MAX_BLOCKS_PER_MESSAGE => {
            Err(P2pError::Rejected("too many blocks in response"))
        }
        Message::ResponsePeers(addrs) if addrs.len() > MAX_ADDRS_PER_MESSAGE => {
            Err(P2pError::Rejected("too many addresses in response"))
        }
        _ => Ok(()),
    }
}

/// One live connection. The reader half lives on the peer thread; the
/// writer half is shared so any thread can send.
struct PeerHandle {
    id: Uuid,
    /// Remote address as a display label. For outbound peers this is the
    /// dialed address; for inbound peers it is the ephemeral socket addr.
    label: String,
    /// Set only for outbound connections, used to suppress re-dialing.
    dialed: Option<String>,
    /// The listen address the peer reported for itself, once known.
    advertised: Mutex<Option<String>>,
    writer: Mutex<TcpStream>,
}

impl PeerHandle {
    fn send_bytes(&self, payload: &[u8]) -> Result<(), P2pError> {
        let mut stream = self.writer.lock().map_err(|_| P2pError::Lock)?;
        stream.write_all(payload)?;
        Ok(())
    }

    fn send(&self, msg: &Message) -> Result<(), P2pError> {
        self.send_bytes(&frame(msg)?)
    }

    fn advertised_addr(&self) -> Option<String> {
        self.advertised.lock().ok().and_then(|slot| slot.clone())
    }

    fn set_advertised(&self, addr: String) {
        if let Ok(mut slot) = self.advertised.lock() {
            *slot = Some(addr);
        }
    }
}

pub struct SyncEngine {
    chain: Arc<ChainManager>,
    peers: Mutex<HashMap<Uuid, Arc<PeerHandle>>>,
    addrs: Mutex<AddressBook>,
    /// This node's externally visible P2P address, if configured.
    advertise: Option<String>,
}

impl SyncEngine {
    pub fn new(
        chain: Arc<ChainManager>,
        addrs: AddressBook,
        advertise: Option<String>,
    ) -> Arc<Self> {
        Arc::new(SyncEngine {
            chain,
            peers: Mutex::new(HashMap::new()),
            addrs: Mutex::new(addrs),
            advertise,
        })
    }

    /// Binds the P2P listener, dials all known addresses, and starts the
    /// background dialer and address-refresh timers.
    pub fn start(self: &Arc<Self>, listen: &str) -> Result<(), P2pError> {
        let listener = TcpListener::bind(listen)?;
        info!(addr = %listen, "p2p listening");

        let engine = Arc::clone(self);
        thread::spawn(move || engine.accept_loop(listener));

        for addr in self.known_addresses() {
            self.connect(addr);
        }

        let engine = Arc::clone(self);
        thread::spawn(move || loop {
            thread::sleep(Duration::from_secs(DIAL_INTERVAL_SECS));
            engine.dial_missing();
        });

        let engine = Arc::clone(self);
        thread::spawn(move || loop {
            thread::sleep(Duration::from_secs(ASK_PEERS_INTERVAL_SECS));
            engine.broadcast(&Message::QueryPeers);
        });

        let engine = Arc::clone(self);
        thread::spawn(move || loop {
            thread::sleep(Duration::from_secs(ANTI_ENTROPY_INTERVAL_SECS));
            engine.broadcast(&Message::QueryLatest);
        });

        let engine = Arc::clone(self);
        thread::spawn(move || loop {
            thread::sleep(Duration::from_secs(KEEP_ALIVE_INTERVAL_SECS));
            engine.broadcast(&Message::KeepAlive);
        });

        Ok(())
    }

    /// Drains chain events on a dedicated thread, gossiping every locally
    /// generated block.
    pub fn pump_events(self: &Arc<Self>, events: std::sync::mpsc::Receiver<ChainEvent>) {
        let engine = Arc::clone(self);
        thread::spawn(move || {
            while let Ok(event) = events.recv() {
                match event {
                    ChainEvent::BlockGenerated(block) => {
                        engine.broadcast(&Message::ResponseBlockchain(vec![block]));
                    }
                }
            }
        });
    }

    /// Dials `addr` on a background thread and records it in the address
    /// book. Dialing our own advertised address or an endpoint that is
    /// already connected is a no-op.
    pub fn connect(self: &Arc<Self>, addr: String) {
        if self.advertise.as_deref() == Some(addr.as_str()) {
            debug!(peer = %addr, "not dialing own address");
            return;
        }
        if self.is_dialed(&addr) {
            debug!(peer = %addr, "already connected");
            return;
        }
        self.add_address(&addr);
        let engine = Arc::clone(self);
        thread::spawn(move || match TcpStream::connect(&addr) {
            Ok(stream) => engine.run_peer(stream, addr.clone(), Some(addr)),
            Err(err) => debug!(peer = %addr, error = %err, "dial failed"),
        });
    }

    fn is_dialed(&self, addr: &str) -> bool {
        self.peers
            .lock()
            .map(|peers| peers.values().any(|p| p.dialed.as_deref() == Some(addr)))
            .unwrap_or(false)
    }

    pub fn add_address(&self, addr: &str) -> bool {
        match self.addrs.lock() {
            Ok(mut book) => book.insert(addr),
            Err(_) => false,
        }
    }

    pub fn known_addresses(&self) -> Vec<String> {
        self.addrs
            .lock()
            .map(|book| book.list())
            .unwrap_or_default()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().map(|peers| peers.len()).unwrap_or(0)
    }

    /// Labels of the currently connected peers.
    pub fn peer_labels(&self) -> Vec<String> {
        self.peers
            .lock()
            .map(|peers| peers.values().map(|p| p.label.clone()).collect())
            .unwrap_or_default()
    }

    /// Sends one message to every connected peer, dropping peers whose
    /// sockets fail.
    pub fn broadcast(&self, msg: &Message) {
        let payload = match frame(msg) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode broadcast");
                return;
            }
        };
        let handles: Vec<Arc<PeerHandle>> = match self.peers.lock() {
            Ok(peers) => peers.values().cloned().collect(),
            Err(_) => return,
        };
        for handle in handles {
            if let Err(err) = handle.send_bytes(&payload) {
                warn!(peer = %handle.label, error = %err, "dropping peer after failed send");
                self.remove_peer(handle.id);
            }
        }
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        for incoming in listener.incoming() {
            match incoming {
                Ok(stream) => {
                    let label = stream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| "unknown".to_string());
                    let engine = Arc::clone(&self);
                    thread::spawn(move || engine.run_peer(stream, label, None));
                }
                Err(err) => warn!(error = %err, "failed to accept connection"),
            }
        }
    }

    /// Owns one peer connection from registration to teardown.
    fn run_peer(self: Arc<Self>, stream: TcpStream, label: String, dialed: Option<String>) {
        if let Err(err) = configure_stream(&stream) {
            warn!(peer = %label, error = %err, "failed to set socket timeouts");
            return;
        }
        let mut reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(err) => {
                warn!(peer = %label, error = %err, "failed to clone peer socket");
                return;
            }
        };
        let handle = Arc::new(PeerHandle {
            id: Uuid::new_v4(),
            label: label.clone(),
            dialed,
            advertised: Mutex::new(None),
            writer: Mutex::new(stream),
        });
        if !self.register(Arc::clone(&handle)) {
            return;
        }
        info!(peer = %label, peers = self.peer_count(), "peer connected");

        let result = self.serve_peer(&handle, &mut reader);
        self.remove_peer(handle.id);
        match result {
            Err(P2pError::Io(err)) => {
                debug!(peer = %label, error = %err, "peer disconnected")
            }
            Err(err) => warn!(peer = %label, error = %err, "peer dropped"),
            Ok(()) => {}
        }
    }

    fn serve_peer(
        self: &Arc<Self>,
        handle: &Arc<PeerHandle>,
        reader: &mut TcpStream,
    ) -> Result<(), P2pError> {
        // Open the conversation: who are you, where is your tip, and who
        // else is out there.
        handle.send(&Message::QueryPeerAddress)?;
        handle.send(&Message::QueryLatest)?;
        handle.send(&Message::QueryPeers)?;
        loop {
            // A malformed frame costs the message, not the connection.
            let msg = match read_message(reader) {
                Ok(msg) => msg,
                Err(err @ (P2pError::Json(_) | P2pError::Rejected(_))) => {
                    warn!(peer = %handle.label, error = %err, "dropping malformed message");
                    continue;
                }
                Err(err) => return Err(err),
            };
            self.dispatch(handle, msg)?;
        }
    }

    fn register(&self, handle: Arc<PeerHandle>) -> bool {
        match self.peers.lock() {
            Ok(mut peers) => {
                peers.insert(handle.id, handle);
                true
            }
            Err(_) => false,
        }
    }

    fn remove_peer(&self, id: Uuid) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(&id);
        }
    }

    fn dispatch(self: &Arc<Self>, handle: &PeerHandle, msg: Message) -> Result<(), P2pError> {
        match msg {
            Message::QueryLatest => {
                let latest = self.chain.latest_block()?;
                handle.send(&Message::ResponseBlockchain(vec![latest]))
            }
            Message::QueryAll => {
                let blocks = self.chain.chain()?;
                handle.send(&Message::ResponseBlockchain(blocks))
            }
            Message::ResponseBlockchain(blocks) => {
                match reconcile(&self.chain, blocks)? {
                    Reconciliation::Broadcast(block) => {
                        self.broadcast(&Message::ResponseBlockchain(vec![block]));
                    }
                    Reconciliation::QueryAll => handle.send(&Message::QueryAll)?,
                    Reconciliation::Ignored => {}
                }
                Ok(())
            }
            Message::QueryPeers => {
                let known = self.known_addresses();
                handle.send(&Message::ResponsePeers(known))
            }
            Message::ResponsePeers(addrs) => {
                for addr in addrs {
                    if self.add_address(&addr) {
                        debug!(peer = %addr, "learned new address");
                        self.connect(addr);
                    }
                }
                Ok(())
            }
            Message::QueryPeerAddress => match self.advertise {
                Some(ref addr) => handle.send(&Message::ResponsePeerAddress(addr.clone())),
                None => Ok(()),
            },
            Message::ResponsePeerAddress(addr) => {
                if self.advertise.as_deref() == Some(addr.as_str()) {
                    return Err(P2pError::Rejected("connected to self"));
                }
                if self.has_other_connection_to(handle, &addr) {
                    return Err(P2pError::Rejected("duplicate connection"));
                }
                handle.set_advertised(addr.clone());
                self.add_address(&addr);
                Ok(())
            }
            Message::KeepAlive => Ok(()),
        }
    }

    /// True when some other live connection already resolves to `addr`.
    fn has_other_connection_to(&self, handle: &PeerHandle, addr: &str) -> bool {
        self.peers
            .lock()
            .map(|peers| {
                peers.values().any(|p| {
                    p.id != handle.id
                        && (p.dialed.as_deref() == Some(addr)
                            || p.advertised_addr().as_deref() == Some(addr))
                })
            })
            .unwrap_or(false)
    }

    /// Dials every known address that has no live outbound connection.
    /// `connect` itself skips endpoints that are already dialed.
    fn dial_missing(self: &Arc<Self>) {
        for addr in self.known_addresses() {
            self.connect(addr);
        }
    }
}

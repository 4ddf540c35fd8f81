//! Relay implementation.
//!
//! A minimal room server for the sync envelope. It supports:
//! - `hello{game}`: join the first non-full session of that game, reply
//!   `welcome`, announce `peer_joined` to the others
//! - `event`: forwarded verbatim to the other members of the session
//! - `leave` / socket close: `peer_left` to the others
//! - anything else: `error` reply
//!
//! Each client is served by one task; room membership lives behind a mutex
//! that is never held across an await.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use sync_shared::{config::RelayConfig, wire::Envelope};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Outbox = mpsc::UnboundedSender<Message>;

struct Member {
    net_id: String,
    tx: Outbox,
}

struct Room {
    id: String,
    game: String,
    members: Vec<Member>,
}

impl Room {
    fn broadcast_except(&self, net_id: &str, text: &str) {
        for m in self.members.iter().filter(|m| m.net_id != net_id) {
            // A closed outbox means that member is on its way out.
            let _ = m.tx.send(Message::Text(text.to_string()));
        }
    }
}

/// Where a connected client sits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub session_id: String,
    pub net_id: String,
}

/// All sessions on this relay.
pub struct Rooms {
    capacity: u32,
    next_peer: u64,
    next_room: u64,
    rooms: Vec<Room>,
}

impl Rooms {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity: capacity.max(1),
            next_peer: 0,
            next_room: 0,
            rooms: Vec::new(),
        }
    }

    /// Places a client in the first session of `game` with a free seat,
    /// opening a new one if none has room.
    pub fn join(&mut self, game: &str, tx: &Outbox) -> Membership {
        self.next_peer += 1;
        let net_id = format!("p{}", self.next_peer);
        let capacity = self.capacity;

        let idx = match self
            .rooms
            .iter()
            .position(|r| r.game == game && (r.members.len() as u32) < capacity)
        {
            Some(idx) => idx,
            None => {
                self.next_room += 1;
                self.rooms.push(Room {
                    id: format!("s{}", self.next_room),
                    game: game.to_string(),
                    members: Vec::new(),
                });
                self.rooms.len() - 1
            }
        };
        let room = &mut self.rooms[idx];

        let joined = Envelope::PeerJoined {
            net_id: net_id.clone(),
        }
        .encode();
        room.broadcast_except(&net_id, &joined);
        room.members.push(Member {
            net_id: net_id.clone(),
            tx: tx.clone(),
        });

        let welcome = Envelope::Welcome {
            net_id: net_id.clone(),
            session_id: room.id.clone(),
            game: room.game.clone(),
            capacity,
            session_size: room.members.len() as u32,
        }
        .encode();
        let _ = tx.send(Message::Text(welcome));

        info!(net_id = %net_id, session = %room.id, game = %room.game, size = room.members.len(), "Client joined");
        Membership {
            session_id: room.id.clone(),
            net_id,
        }
    }

    /// Relays a frame to everyone else in the sender's session.
    pub fn forward(&self, from: &Membership, text: &str) {
        if let Some(room) = self.rooms.iter().find(|r| r.id == from.session_id) {
            room.broadcast_except(&from.net_id, text);
        }
    }

    /// Removes a client and tells the rest. Empty sessions are dropped.
    pub fn leave(&mut self, who: &Membership) {
        let Some(idx) = self.rooms.iter().position(|r| r.id == who.session_id) else {
            return;
        };
        let room = &mut self.rooms[idx];
        room.members.retain(|m| m.net_id != who.net_id);
        let left = Envelope::PeerLeft {
            net_id: who.net_id.clone(),
        }
        .encode();
        room.broadcast_except(&who.net_id, &left);
        info!(net_id = %who.net_id, session = %room.id, size = room.members.len(), "Client left");
        if room.members.is_empty() {
            debug!(session = %room.id, "Closing empty session");
            self.rooms.remove(idx);
        }
    }

    pub fn session_count(&self) -> usize {
        self.rooms.len()
    }

    /// Members of a session, in join order.
    pub fn members(&self, session_id: &str) -> Vec<String> {
        self.rooms
            .iter()
            .find(|r| r.id == session_id)
            .map(|r| r.members.iter().map(|m| m.net_id.clone()).collect())
            .unwrap_or_default()
    }
}

type SharedRooms = Arc<Mutex<Rooms>>;

fn lock(rooms: &SharedRooms) -> MutexGuard<'_, Rooms> {
    rooms.lock().unwrap_or_else(PoisonError::into_inner)
}

/// WebSocket relay server.
pub struct RelayServer {
    pub cfg: RelayConfig,
    listener: TcpListener,
    rooms: SharedRooms,
    shutdown: CancellationToken,
}

impl RelayServer {
    /// Binds the listen socket.
    pub async fn bind(cfg: RelayConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.listen_addr.parse().context("parse listen_addr")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        Ok(Self {
            rooms: Arc::new(Mutex::new(Rooms::new(cfg.capacity))),
            cfg,
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("local_addr")
    }

    /// `ws://` URL clients should connect to.
    pub fn url(&self) -> anyhow::Result<String> {
        Ok(format!("ws://{}", self.local_addr()?))
    }

    /// Cancelling this token stops the accept loop and closes every client.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accepts clients until shut down.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, capacity = self.cfg.capacity, "Relay listening");
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = self.listener.accept() => res.context("accept")?,
            };
            debug!(%peer, "TCP connection");
            let rooms = Arc::clone(&self.rooms);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_client(stream, peer, rooms, shutdown).await {
                    warn!(%peer, error = ?e, "Client connection ended with error");
                }
            });
        }
        info!("Relay stopped");
        Ok(())
    }
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    rooms: SharedRooms,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let ws = accept_async(stream).await.context("websocket handshake")?;
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let mut membership: Option<Membership> = None;

    let result: anyhow::Result<()> = async {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.close().await;
                    break;
                }
                out = rx.recv() => match out {
                    Some(msg) => sink.send(msg).await.context("send")?,
                    None => break,
                },
                msg = source.next() => match msg {
                    Some(Ok(Message::Text(text))) => handle_text(&rooms, &tx, &mut membership, &text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => handle_text(&rooms, &tx, &mut membership, &text),
                        Err(_) => warn!(%peer, "Dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("receive"),
                },
            }
        }
        Ok(())
    }
    .await;

    if let Some(m) = membership.take() {
        lock(&rooms).leave(&m);
    }
    debug!(%peer, "Connection closed");
    result
}

fn handle_text(rooms: &SharedRooms, tx: &Outbox, membership: &mut Option<Membership>, text: &str) {
    let reply_error = |message: &str| {
        let frame = Envelope::Error {
            message: message.to_string(),
        }
        .encode();
        let _ = tx.send(Message::Text(frame));
    };

    match Envelope::decode(text) {
        Envelope::Hello { game } => {
            if membership.is_some() {
                reply_error("already in a session");
                return;
            }
            *membership = Some(lock(rooms).join(&game, tx));
        }
        Envelope::Event { .. } => match membership {
            Some(m) => lock(rooms).forward(m, text),
            None => reply_error("send hello first"),
        },
        Envelope::Leave => {
            if let Some(m) = membership.take() {
                lock(rooms).leave(&m);
            }
        }
        Envelope::Info { kind } => debug!(kind = %kind, "Ignoring informational message"),
        Envelope::Unknown { kind } => reply_error(&format!("unknown message type '{kind}'")),
        other => {
            debug!(?other, "Unexpected message from client");
            reply_error("unexpected message type");
        }
    }
}

/// Test helper: binds a relay to an ephemeral loopback port.
pub async fn bind_ephemeral(capacity: u32) -> anyhow::Result<(RelayServer, String)> {
    let cfg = RelayConfig {
        listen_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        capacity,
    };
    let server = RelayServer::bind(cfg).await?;
    let url = server.url()?;
    Ok((server, url))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox() -> (Outbox, mpsc::UnboundedReceiver<Message>) {
        mpsc::unbounded_channel()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(Message::Text(t)) = rx.try_recv() {
            out.push(Envelope::decode(&t));
        }
        out
    }

    #[test]
    fn second_client_fills_session() {
        let mut rooms = Rooms::new(2);
        let (a_tx, mut a_rx) = outbox();
        let (b_tx, mut b_rx) = outbox();

        let a = rooms.join("race", &a_tx);
        let b = rooms.join("race", &b_tx);
        assert_eq!(a.session_id, b.session_id);
        assert_eq!(rooms.members(&a.session_id), vec!["p1", "p2"]);

        let a_msgs = drain(&mut a_rx);
        assert!(matches!(&a_msgs[0], Envelope::Welcome { net_id, session_size: 1, capacity: 2, .. } if net_id == "p1"));
        assert_eq!(a_msgs[1], Envelope::PeerJoined { net_id: "p2".into() });

        let b_msgs = drain(&mut b_rx);
        assert_eq!(b_msgs.len(), 1);
        assert!(matches!(&b_msgs[0], Envelope::Welcome { net_id, session_size: 2, .. } if net_id == "p2"));
    }

    #[test]
    fn full_session_opens_another_and_games_are_separate() {
        let mut rooms = Rooms::new(2);
        let (tx, _rx) = outbox();
        let a = rooms.join("race", &tx);
        rooms.join("race", &tx);
        let c = rooms.join("race", &tx);
        let d = rooms.join("derby", &tx);
        assert_ne!(a.session_id, c.session_id);
        assert_ne!(c.session_id, d.session_id);
        assert_eq!(rooms.session_count(), 3);
    }

    #[test]
    fn forward_skips_sender_and_leave_notifies() {
        let mut rooms = Rooms::new(2);
        let (a_tx, mut a_rx) = outbox();
        let (b_tx, mut b_rx) = outbox();
        let a = rooms.join("race", &a_tx);
        let b = rooms.join("race", &b_tx);
        drain(&mut a_rx);
        drain(&mut b_rx);

        let frame = r#"{"type":"event","payload":{"carId":"p1"}}"#;
        rooms.forward(&a, frame);
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(drain(&mut b_rx).len(), 1);

        rooms.leave(&b);
        assert_eq!(drain(&mut a_rx), vec![Envelope::PeerLeft { net_id: "p2".into() }]);
        rooms.leave(&a);
        assert_eq!(rooms.session_count(), 0);
    }

    #[test]
    fn unknown_and_premature_messages_get_errors() {
        let rooms: SharedRooms = Arc::new(Mutex::new(Rooms::new(2)));
        let (tx, mut rx) = outbox();
        let mut membership = None;

        handle_text(&rooms, &tx, &mut membership, r#"{"type":"event","payload":{}}"#);
        handle_text(&rooms, &tx, &mut membership, r#"{"type":"dance"}"#);
        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 2);
        assert!(msgs.iter().all(|m| matches!(m, Envelope::Error { .. })));

        handle_text(&rooms, &tx, &mut membership, r#"{"type":"hello","game":"race"}"#);
        assert!(membership.is_some());
        handle_text(&rooms, &tx, &mut membership, r#"{"type":"leave"}"#);
        assert!(membership.is_none());
        assert_eq!(lock(&rooms).session_count(), 0);
    }

    #[tokio::test]
    async fn bind_ephemeral_reports_ws_url() -> anyhow::Result<()> {
        let (server, url) = bind_ephemeral(2).await?;
        assert!(url.starts_with("ws://127.0.0.1:"));
        assert_ne!(server.local_addr()?.port(), 0);
        Ok(())
    }
}

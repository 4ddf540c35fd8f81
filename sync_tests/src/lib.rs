//! Helpers shared by the integration tests: relay lifecycle, client setup,
//! and a tick pump that drives contexts until a condition holds.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::Context;
use sync_client::{router::SessionEvent, SyncContext};
use sync_relay::server::{bind_ephemeral, RelayServer};
use sync_shared::{
    body::{KinematicBody, KinematicFactory},
    config::{RelayConfig, SyncConfig},
    entity::BodyState,
    math::{Quat, Vec3},
};
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// A relay running in the background.
pub struct RelayHandle {
    pub url: String,
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl RelayHandle {
    /// Stops accepting, closes every client and waits for the accept loop.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        self.task.await.context("join relay task")?
    }
}

fn spawn(server: RelayServer) -> anyhow::Result<RelayHandle> {
    let url = server.url()?;
    let addr = server.local_addr()?;
    let shutdown = server.shutdown_token();
    let task = tokio::spawn(server.run());
    info!(url = %url, "Test relay started");
    Ok(RelayHandle {
        url,
        addr,
        shutdown,
        task,
    })
}

/// Starts a relay on an ephemeral loopback port.
pub async fn start_relay(capacity: u32) -> anyhow::Result<RelayHandle> {
    let (server, _url) = bind_ephemeral(capacity).await?;
    spawn(server)
}

/// Starts a relay on a specific address (e.g. to bring one back).
pub async fn start_relay_at(addr: SocketAddr, capacity: u32) -> anyhow::Result<RelayHandle> {
    let server = RelayServer::bind(RelayConfig {
        listen_addr: addr.to_string(),
        capacity,
    })
    .await?;
    spawn(server)
}

/// Client config with short timers.
pub fn client_config(url: &str) -> SyncConfig {
    SyncConfig {
        server_url: url.to_string(),
        game: "race".to_string(),
        reconnect_delay_ms: 300,
        close_timeout_ms: 200,
        ..SyncConfig::default()
    }
}

/// WebSocket client context with a parked local vehicle at `at`.
pub fn client_at(cfg: SyncConfig, at: Vec3) -> SyncContext {
    let mut ctx = SyncContext::websocket(Handle::current(), cfg, Box::new(KinematicFactory));
    ctx.attach_local(Box::new(KinematicBody::new(BodyState::at(at, Quat::IDENTITY))));
    ctx
}

/// Records every session event published by `ctx`.
pub fn record_events(ctx: &mut SyncContext) -> Arc<Mutex<Vec<SessionEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    ctx.subscribe(move |e| {
        if let Ok(mut log) = log.lock() {
            log.push(e.clone());
        }
    });
    seen
}

pub fn count(seen: &Arc<Mutex<Vec<SessionEvent>>>, pred: impl Fn(&SessionEvent) -> bool) -> usize {
    seen.lock().map(|v| v.iter().filter(|e| pred(e)).count()).unwrap_or(0)
}

/// Ticks every context every 10 ms until `done` holds or `timeout` passes.
pub async fn tick_until<F>(ctxs: &mut [&mut SyncContext], timeout: Duration, mut done: F) -> bool
where
    F: FnMut(&[&mut SyncContext]) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        for ctx in ctxs.iter_mut() {
            ctx.tick_now();
        }
        if done(ctxs) {
            return true;
        }
        if Instant::now() >= deadline {
            warn!(?timeout, "Condition not met before timeout");
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Ticks every context for `span` regardless of state.
pub async fn tick_for(ctxs: &mut [&mut SyncContext], span: Duration) {
    let deadline = Instant::now() + span;
    while Instant::now() < deadline {
        for ctx in ctxs.iter_mut() {
            ctx.tick_now();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

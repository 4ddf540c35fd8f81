//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p sync_client -- [--config client.json] [--url ws://127.0.0.1:8080]
//!                               [--game race] [--local] [--seconds 30]
//!
//! Drives one local vehicle around a circle once the race starts, replicates
//! it through the relay, and logs the remote vehicles it sees.

use std::{
    env,
    time::{Duration, Instant},
};

use anyhow::Context;
use sync_client::{router::SessionEvent, transport::ConnectionState, SyncContext};
use sync_shared::{
    body::{EntityBody, KinematicFactory},
    config::SyncConfig,
    entity::BodyState,
    math::{Quat, Vec3},
};
use tracing::info;

struct Args {
    cfg: SyncConfig,
    local: bool,
    seconds: u64,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();

    let cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => SyncConfig::load(&args[i + 1])?,
        _ => SyncConfig::default(),
    };
    let mut out = Args {
        cfg,
        local: false,
        seconds: 0,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--url" if i + 1 < args.len() => {
                out.cfg.server_url = args[i + 1].clone();
                i += 2;
            }
            "--game" if i + 1 < args.len() => {
                out.cfg.game = args[i + 1].clone();
                i += 2;
            }
            "--seconds" if i + 1 < args.len() => {
                out.seconds = args[i + 1].parse().unwrap_or(0);
                i += 2;
            }
            "--local" => {
                out.local = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(out)
}

/// Local vehicle that laps a circle while input is enabled.
struct DemoCar {
    center: Vec3,
    radius: f32,
    /// Radians per second.
    rate: f32,
    started: Option<Instant>,
}

impl EntityBody for DemoCar {
    fn local_state_snapshot(&self) -> BodyState {
        let a = self
            .started
            .map(|t| t.elapsed().as_secs_f32() * self.rate)
            .unwrap_or(0.0);
        let offset = Vec3::new(a.cos() * self.radius, 0.0, a.sin() * self.radius);
        let tangent = Vec3::new(-a.sin(), 0.0, a.cos());
        BodyState {
            position: self.center + offset,
            rotation: Quat::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), -a),
            velocity: if self.started.is_some() {
                tangent * (self.radius * self.rate)
            } else {
                Vec3::ZERO
            },
        }
    }

    fn apply_remote_state(&mut self, _state: &BodyState) {}

    fn set_input_enabled(&mut self, enabled: bool) {
        self.started = match (enabled, self.started) {
            (true, None) => Some(Instant::now()),
            (true, s) => s,
            (false, _) => None,
        };
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    let cfg = args.cfg;
    info!(url = %cfg.server_url, game = %cfg.game, local = args.local, "Starting client");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    let mut ctx = SyncContext::websocket(runtime.handle().clone(), cfg, Box::new(KinematicFactory));
    ctx.subscribe(|event| match event {
        SessionEvent::EntityUpdate(_) => {}
        other => info!(event = ?other, "Session event"),
    });

    let car = DemoCar {
        center: Vec3::ZERO,
        radius: 20.0,
        rate: 0.5,
        started: None,
    };
    let local_id = ctx.attach_local(Box::new(car)).context("register local vehicle")?;
    info!(id = %local_id, "Local vehicle attached");

    if args.local {
        ctx.start_local();
    } else {
        ctx.start_online();
    }

    let tick_interval = ctx.config().tick_interval();
    let deadline = (args.seconds > 0).then(|| Instant::now() + Duration::from_secs(args.seconds));
    let mut next_status = Instant::now();
    loop {
        ctx.tick_now();

        let now = Instant::now();
        if now >= next_status {
            next_status = now + Duration::from_secs(2);
            let session = ctx.session();
            info!(
                state = ?session.connection_state(),
                attempts = session.transport().connect_attempts(),
                local_id = %session.local_id(),
                slot = session.slot(),
                size = session.session().current_size,
                entities = ?ctx.registry().ids(),
                "Status"
            );
        }

        if deadline.is_some_and(|d| now >= d) {
            break;
        }
        std::thread::sleep(tick_interval);
    }

    ctx.leave();
    ctx.tick_now();
    ctx.shutdown();
    let close_timeout = ctx.config().close_timeout();
    let close_deadline = Instant::now() + close_timeout;
    while ctx.session().connection_state() != ConnectionState::Closed && Instant::now() < close_deadline {
        ctx.tick_now();
        std::thread::sleep(tick_interval);
    }
    drop(ctx);
    runtime.shutdown_timeout(close_timeout);
    info!("Client stopped");
    Ok(())
}

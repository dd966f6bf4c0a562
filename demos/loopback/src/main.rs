//! Primary and two secondaries exchanging events in one process.
//!
//! Run with: cargo run -p loopback-demo
//!
//! Set `CROSS_RELAY_CONFIG` to a JSON file to override the relay config,
//! and `CROSS_RELAY_LISTEN` (e.g. `127.0.0.1:3000`) to keep serving
//! out-of-process secondaries on `/relay` afterwards.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use axum::Router;
use cross_relay::{
    PrimaryRelay, SecondaryRelay, SendOptions,
    logs::{LOG_ADDED, forward_logs},
};
use cross_relay_core::{OutboundPayload, RelayConfig, SnapshotProvider};
use cross_relay_transport::{PrimaryEndpoint, websocket::create_ws_router};
use futures::StreamExt;
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONFIG_ENV: &str = "CROSS_RELAY_CONFIG";
const LISTEN_ENV: &str = "CROSS_RELAY_LISTEN";
const DOMAINS: [&str; 2] = ["a.com", "b.com"];

/// Globals reported by each secondary.
struct DemoGlobals {
    domain: &'static str,
}

impl SnapshotProvider for DemoGlobals {
    fn config(&self) -> Value {
        json!({"baseUrl": format!("http://{}", self.domain)})
    }

    fn env(&self) -> Value {
        json!({"demo": true})
    }
}

fn load_config() -> anyhow::Result<RelayConfig> {
    let Ok(path) = std::env::var(CONFIG_ENV) else {
        return Ok(RelayConfig::default());
    };
    let json = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let config = RelayConfig::from_json_str(&json).with_context(|| format!("parsing {path}"))?;
    config.validate()?;
    tracing::info!("Loaded relay config from {path}");
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = load_config()?;
    let primary = Arc::new(PrimaryRelay::new(config.clone())?);
    let boundary = PrimaryEndpoint::new();

    let (_, mut handshakes) = primary.emitter().stream(&config.handshake_event);
    let (_, mut pongs) = primary.emitter().stream("pong");
    primary.on(&config.sync_globals_event, |e| {
        tracing::info!(domain = ?e.domain, globals = %e.data.data, "Globals synced");
    });
    primary.on(LOG_ADDED, |e| {
        tracing::info!(domain = ?e.domain, log = %e.data.data, "Log forwarded");
    });

    let mut pumps = Vec::new();
    let mut secondaries = Vec::new();
    for domain in DOMAINS {
        let endpoint = boundary.connect();
        let relay = Arc::new(
            SecondaryRelay::new(domain, endpoint.parent(), config.clone())?
                .with_snapshot_provider(Arc::new(DemoGlobals { domain })),
        );
        forward_logs(&relay);

        let weak = Arc::downgrade(&relay);
        relay.on("ping", move |data| {
            let Some(relay) = weak.upgrade() else {
                return;
            };
            relay.emit(LOG_ADDED, &json!({"name": "ping", "domain": relay.domain()}));
            let pong = OutboundPayload::from(data.clone()).subject(relay.domain().to_string());
            if let Err(e) = relay.send_to_primary("pong", pong, SendOptions::sync_globals()) {
                tracing::error!("Failed to answer ping: {e}");
            }
        });

        pumps.push(endpoint.spawn_pump(Arc::clone(&relay)));
        secondaries.push(relay);
    }
    pumps.push(boundary.spawn_pump(Arc::clone(&primary)));

    for relay in &secondaries {
        relay.ready()?;
    }
    for _ in DOMAINS {
        let event = tokio::time::timeout(Duration::from_secs(1), handshakes.next())
            .await
            .context("waiting for handshake")?;
        let Some(event) = event else {
            bail!("primary emitter closed");
        };
        tracing::info!(domain = ?event.domain, "Secondary ready");
    }

    let sent = primary.send_to_all("ping", json!({"seq": 1}))?;
    tracing::info!("Ping sent to {sent} secondaries");
    for _ in 0..sent {
        let Some(pong) = tokio::time::timeout(Duration::from_secs(1), pongs.next())
            .await
            .context("waiting for pong")?
        else {
            bail!("primary emitter closed");
        };
        tracing::info!(domain = ?pong.domain, subject = ?pong.data.subject(), "Pong");
    }

    if let Ok(listen) = std::env::var(LISTEN_ENV) {
        let addr: SocketAddr = listen.parse().with_context(|| format!("parsing {LISTEN_ENV}"))?;
        let app = Router::new()
            .merge(create_ws_router(Arc::clone(&primary)))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive());

        tracing::info!("Relay listening on ws://{addr}/relay");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
    }

    for pump in pumps {
        pump.abort();
    }
    Ok(())
}

//! archipeld — Archipel LAN peer daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use archipel_core::config::ArchipelConfig;
use archipel_core::{short_id, Identity};
use archipel_services::{Event, JsonPersistence};
use archipeld::{command_channel, Node};
use tokio::sync::mpsc;

mod console;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    match ArchipelConfig::write_default_if_missing() {
        Ok(path) => tracing::debug!(path = %path.display(), "config file"),
        Err(e) => tracing::warn!(error = %e, "failed to write default config"),
    }
    let config = ArchipelConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ArchipelConfig::default()
    });

    // Identity
    let identity = Identity::load_or_generate(&config.identity.dir, &config.identity.node_name)
        .with_context(|| format!("failed to load identity from {}", config.identity.dir.display()))?;
    tracing::info!(
        node_id = identity.node_id_hex(),
        fingerprint = identity.fingerprint(),
        "identity ready"
    );

    // Persistence
    let persistence = Arc::new(
        JsonPersistence::new(&config.storage.data_dir)
            .with_context(|| format!("failed to open data dir {}", config.storage.data_dir.display()))?,
    );

    let (node, events) = Node::start(config, identity, persistence).await?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    {
        let node = node.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            node.shutdown();
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let (commands, command_rx) = command_channel();
    let command_task = tokio::spawn(node.clone().serve_commands(command_rx));
    let console_task = tokio::spawn(console::run(node.clone(), commands));
    let event_task = tokio::spawn(log_events(events));

    let status_printer = {
        let node = node.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let status = node.status();
                tracing::info!(
                    sessions = status.sessions.len(),
                    peers = status.peers_known,
                    manifests = status.manifests,
                    transfers = status.active_transfers,
                    "status snapshot"
                );
                for s in &status.sessions {
                    tracing::debug!(peer = %s.peer, addr = %s.remote_addr, rtt_ms = ?s.rtt_ms, "  session");
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = node.subscribe_shutdown();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = command_task        => tracing::error!("command loop exited: {:?}", r),
        r = event_task          => tracing::error!("event log exited: {:?}", r),
        r = status_printer      => tracing::error!("status printer exited: {:?}", r),
        r = console_task        => {
            tracing::info!("stdin closed: {:?}", r);
            // Keep serving without a console.
            let _ = shutdown_rx.recv().await;
        }
    }

    node.shutdown();
    Ok(())
}

/// Print events for an operator watching the log.
async fn log_events(mut events: mpsc::Receiver<Event>) {
    while let Some(event) = events.recv().await {
        match event {
            Event::PeerDiscovered { peer } => tracing::info!(peer = short_id(&peer), "peer discovered"),
            Event::PeerStateChanged { peer, from, to } => {
                tracing::info!(peer = short_id(&peer), ?from, ?to, "peer state changed")
            }
            Event::PeerExpired { peer } => tracing::info!(peer = short_id(&peer), "peer expired"),
            Event::ManifestAnnounced { peer, content_hash } => tracing::info!(
                peer = short_id(&peer),
                content = hex::encode(content_hash),
                "manifest announced"
            ),
            Event::MessageReceived { peer, text, .. } => {
                println!("[{}] {text}", short_id(&peer));
            }
            Event::TransferProgress {
                content_hash,
                progress,
            } => tracing::info!(
                content = short_id(&content_hash),
                status = console::describe(&archipeld::TransferStatus::Running(progress)),
                "transfer progress"
            ),
            Event::TransferCompleted { content_hash } => {
                tracing::info!(content = short_id(&content_hash), "transfer completed")
            }
            Event::TransferFailed {
                content_hash,
                reason,
            } => tracing::warn!(content = short_id(&content_hash), %reason, "transfer failed"),
            Event::SecurityAlert { peer, alert } => {
                tracing::warn!(peer = short_id(&peer), ?alert, "security alert")
            }
        }
    }
}

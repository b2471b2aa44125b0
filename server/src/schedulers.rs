//! Background schedulers
//!
//! The daily purge and the public-key announcement run on their own tasks
//! and stop with the node. The purge tick is jittered by up to 30 seconds
//! so a fleet of replicas does not hit the store at the same instant.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use strand_relay_core::{PublicKeyAnnouncement, RelayContext};

const PURGE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// Purge stale registry rows once a day
pub async fn run_purge_scheduler(ctx: Arc<RelayContext>) {
    let mut shutdown = ctx.shutdown.listener();
    loop {
        let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..=30));
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(PURGE_INTERVAL + jitter) => {}
        }
        match ctx.registry.purge_stale().await {
            Ok(0) => {}
            Ok(purged) => info!(purged, "purged stale registry rows"),
            Err(e) => warn!(error = %e, "registry purge failed"),
        }
    }
}

/// Announce this node's public key on the bus, at startup and then on a
/// two-day cadence; best-effort
pub async fn run_key_announcer(ctx: Arc<RelayContext>) {
    let mut shutdown = ctx.shutdown.listener();
    loop {
        announce(&ctx).await;
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(ANNOUNCE_INTERVAL) => {}
        }
    }
}

async fn announce(ctx: &Arc<RelayContext>) {
    let pem = match ctx.keys.public_key_pem() {
        Ok(pem) => pem,
        Err(e) => {
            warn!(error = %e, "public key encoding failed");
            return;
        }
    };
    let announcement = PublicKeyAnnouncement {
        hash: ctx.keys.fingerprint().to_string(),
        pem,
        instance_name: ctx.instance_id().to_string(),
        expires: ctx.config.identity.key_expires_on,
    };
    if let Err(e) = ctx.bus.publish_public_key(announcement).await {
        warn!(error = %e, "public key announcement failed");
    }
}

use alloy_primitives::Address;
use anyhow::Context;
use serde_json::Value;
use sliptrack::config::Config;
use sliptrack::decode::PushEvent;
use sliptrack::enrichment::EnrichmentClient;
use sliptrack::poll::PollingSupplement;
use sliptrack::slips::{SlipSignal, SlipTracker, TrackerEvent};
use sliptrack::ws::registry::{Subscription, TopicRegistry};
use sliptrack::ws::transport::{ChannelTransport, TransportConfig};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Decode-and-merge handler shared by every push topic.
fn push_handler(tracker: SlipTracker, topic: String) -> impl Fn(&Value) + Send + Sync {
    move |data| match PushEvent::from_topic(&topic, data) {
        Ok(event) => tracker.merge(SlipSignal::Push(event)),
        Err(e) => warn!(topic = %topic, error = %e, "undecodable push event dropped"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = if Path::new("sliptrack.toml").exists() {
        Config::load(Path::new("sliptrack.toml"))?
    } else {
        Config::from_env()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("sliptrack v{} starting", env!("CARGO_PKG_VERSION"));

    if config.tracking.user_address.is_empty() {
        anyhow::bail!("no wallet to track - set tracking.user_address or SLIPTRACK_USER");
    }
    let user: Address = config
        .tracking
        .user_address
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid tracking.user_address: {e}"))?;
    let addr = format!("{:#x}", user);

    // --- Channel transport + topic registry ---
    let transport = ChannelTransport::new(
        &config.channel.ws_url,
        TransportConfig {
            base_delay: Duration::from_secs(config.channel.reconnect_base_secs),
            max_reconnect_attempts: config.channel.max_reconnect_attempts,
            keepalive: Duration::from_secs(config.channel.keepalive_secs),
        },
    )?;
    let transport_events = transport
        .events()
        .context("transport event stream already taken")?;
    let registry = TopicRegistry::new(Arc::new(transport.clone()));
    let _dispatch = registry.spawn_dispatch(transport_events);

    // --- Slip tracker ---
    let (tracker_tx, mut tracker_rx) = mpsc::unbounded_channel::<TrackerEvent>();
    let tracker = SlipTracker::new(tracker_tx);

    // Per-user topics; cycle, evaluation, and fixture topics are wired as
    // slips show up.
    let user_topics = [
        format!("slip:placed:user:{}", addr),
        format!("slip:evaluated:user:{}", addr),
        format!("slip:prize_claimed:user:{}", addr),
    ];
    let _user_subs: Vec<Subscription> = user_topics
        .iter()
        .map(|topic| registry.subscribe(topic, push_handler(tracker.clone(), topic.clone())))
        .collect();
    info!(user = %addr, url = %config.channel.ws_url, "tracking slips");

    // --- Polling supplement ---
    let enrichment = EnrichmentClient::new(config.enrichment.base_url.clone());
    let poller = PollingSupplement::new(
        tracker.clone(),
        enrichment,
        None,
        user,
        Duration::from_secs(config.enrichment.poll_interval_secs),
    );
    let _poll = poller.start();
    info!(
        interval_secs = config.enrichment.poll_interval_secs,
        url = %config.enrichment.base_url,
        "polling enrichment API"
    );

    // --- Main event loop ---
    let mut cycle_subs: HashMap<u64, Subscription> = HashMap::new();
    let mut eval_subs: HashMap<u64, Subscription> = HashMap::new();
    let mut fixture_subs: HashMap<u64, Subscription> = HashMap::new();

    loop {
        tokio::select! {
            Some(event) = tracker_rx.recv() => match event {
                TrackerEvent::SlipUpdated { slip_id, status } => {
                    info!(slip = slip_id, status = %status, "slip status");

                    let Some(view) = tracker.slip(slip_id) else { continue };

                    if view.cycle_id > 0 {
                        cycle_subs.entry(view.cycle_id).or_insert_with(|| {
                            let topic = format!("oddyssey:cycle:{}", view.cycle_id);
                            registry.subscribe(&topic, push_handler(tracker.clone(), topic.clone()))
                        });
                    }

                    if view.is_evaluated_onchain {
                        // Settled: the evaluation topic has nothing more to say.
                        eval_subs.remove(&slip_id);
                    } else {
                        eval_subs.entry(slip_id).or_insert_with(|| {
                            let topic = format!("oddyssey:slip:{}:evaluation", slip_id);
                            registry.subscribe(&topic, push_handler(tracker.clone(), topic.clone()))
                        });
                    }

                    for match_id in view.match_ids() {
                        fixture_subs.entry(match_id).or_insert_with(|| {
                            let topic = format!("fixture:{}", match_id);
                            registry.subscribe(&topic, push_handler(tracker.clone(), topic.clone()))
                        });
                    }
                }
                TrackerEvent::CycleUpdated { cycle_id, resolved, prize_pool_wei } => {
                    info!(
                        cycle = cycle_id,
                        resolved = resolved,
                        pool = ?prize_pool_wei,
                        "cycle update"
                    );
                }
                TrackerEvent::PrizeClaimed { slip_id, amount_wei } => {
                    info!(slip = slip_id, amount = ?amount_wei, "prize claimed");
                }
                TrackerEvent::CycleRollover(record) => {
                    info!(
                        cycle = record.cycle_id,
                        previous_pool = %record.previous_prize_pool,
                        had_winner = record.had_winner,
                        rollover = %record.rollover_amount,
                        "prize pool rollover"
                    );
                }
            },

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down...");
                transport.close();
                break;
            }
        }
    }

    Ok(())
}

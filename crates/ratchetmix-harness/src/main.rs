//! Ratchetmix simulation binary.
//!
//! Runs two in-process partners over the loopback network, exchanging
//! messages through several rekey cycles, and reports what happened.
//!
//! # Usage
//!
//! ```bash
//! # Small pools so rekeys happen quickly
//! ratchetmix-sim --seed 7 --messages 500 --min-keys 20 --max-keys 30
//!
//! # Lossy network
//! ratchetmix-sim --drop-rate 0.2 --log-level debug
//! ```

use std::{collections::HashSet, time::Duration};

use clap::Parser;
use ratchetmix_client::DriverConfig;
use ratchetmix_core::SessionParams;
use ratchetmix_harness::{InvariantRegistry, SimClient, SimPair};
use ratchetmix_proto::{PartnerId, SessionId};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Ratchetmix two-partner simulation
#[derive(Parser, Debug)]
#[command(name = "ratchetmix-sim")]
#[command(about = "Simulate two ratchetmix partners through repeated rekeys")]
#[command(version)]
struct Args {
    /// Seed for every random choice in the run
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Messages each partner sends
    #[arg(short, long, default_value = "500")]
    messages: u32,

    /// Lower bound of the rekey threshold sample
    #[arg(long, default_value = "20")]
    min_keys: u32,

    /// Upper bound (exclusive) of the rekey threshold sample
    #[arg(long, default_value = "30")]
    max_keys: u32,

    /// Pool size as a multiple of the rekey threshold
    #[arg(long, default_value = "2.0")]
    ttl_scalar: f64,

    /// Keys per session held back for key-exchange messages
    #[arg(long, default_value = "4")]
    num_rekeys: u32,

    /// Probability that the network loses a message
    #[arg(long, default_value = "0.0")]
    drop_rate: f64,

    /// Negotiation check interval in milliseconds
    #[arg(long, default_value = "5")]
    check_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Default)]
struct Report {
    sent: u64,
    stalled: u64,
    delivered: u64,
    sessions: HashSet<SessionId>,
    confirmed: HashSet<SessionId>,
}

impl Report {
    fn observe<S: ratchetmix_core::Storage>(
        &mut self,
        client: &SimClient<S>,
        partner: &PartnerId,
    ) -> Result<(), ratchetmix_core::RatchetError> {
        for session in client.manager(partner)?.send_relationship().sessions() {
            self.sessions.insert(session.id());
            if session.is_confirmed() {
                self.confirmed.insert(session.id());
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let params = SessionParams {
        min_keys: args.min_keys,
        max_keys: args.max_keys,
        num_rekeys: args.num_rekeys,
        ttl_scalar: args.ttl_scalar,
        min_num_keys: args.min_keys,
        ..SessionParams::default()
    };
    params.validate()?;

    let mut pair = SimPair::in_memory(args.seed, params)?;
    pair.network.set_drop_rate(args.drop_rate.clamp(0.0, 1.0));

    let config = DriverConfig {
        check_interval: Duration::from_millis(args.check_interval_ms.max(1)),
        round_timeout: Duration::from_secs(1),
        ..DriverConfig::default()
    };
    pair.start(&config);

    tracing::info!(seed = args.seed, messages = args.messages, "simulation starting");

    let (alice_id, bob_id) = (pair.alice.id(), pair.bob.id());
    let mut report = Report::default();

    for i in 0..args.messages {
        for (client, partner) in [(&pair.alice, bob_id), (&pair.bob, alice_id)] {
            match client.send_text(partner, format!("message {i}").as_bytes()).await {
                Ok(_) => report.sent += 1,
                Err(e) if e.is_retryable() => {
                    report.stalled += 1;
                    tracing::debug!(client = %client.id(), error = %e, "send stalled");
                },
                Err(e) => return Err(e.into()),
            }
        }

        tokio::time::sleep(config.check_interval).await;

        for client in [&mut pair.alice, &mut pair.bob] {
            while client.next_delivered(Duration::ZERO).await.is_some() {
                report.delivered += 1;
            }
            client.resend_critical(config.round_timeout).await;
        }

        report.observe(&pair.alice, &bob_id)?;
        report.observe(&pair.bob, &alice_id)?;
    }

    pair.shutdown().await?;

    let registry = InvariantRegistry::standard();
    for (name, client) in [("alice", &pair.alice), ("bob", &pair.bob)] {
        if let Err(violations) = registry.check_all(&client.snapshot()) {
            for violation in &violations {
                tracing::error!(client = name, %violation, "invariant violated");
            }
            return Err(format!("{} invariant violations on {name}", violations.len()).into());
        }
    }

    let stats = pair.network.stats();
    tracing::info!(
        sessions_created = report.sessions.len().saturating_sub(2),
        sessions_confirmed = report.confirmed.len(),
        messages_sent = report.sent,
        messages_stalled = report.stalled,
        messages_delivered = report.delivered,
        network_dropped = stats.dropped,
        "simulation finished"
    );

    Ok(())
}

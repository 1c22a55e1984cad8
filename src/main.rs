use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use meshcast::phonebook::DEFAULT_DNS_REFRESH_INTERVAL;
use meshcast::{
    DnsPhonebook, ForwardingPolicy, MultiPhonebook, Network, NetworkConfig, StaticPhonebook,
    TaggedMessageHandler, tags,
};

#[derive(Parser, Debug)]
#[command(name = "meshcast")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Genesis id of the network to join.
    #[arg(short, long, default_value = "meshcast-devnet")]
    genesis: String,

    /// Address to accept peers on. Without it the node only dials out.
    #[arg(short, long)]
    listen: Option<String>,

    /// Static peer address (repeatable).
    #[arg(short = 'p', long = "peer", value_name = "ADDR")]
    peers: Vec<String>,

    /// DNS name whose records list relay addresses (repeatable).
    #[arg(long = "dns-bootstrap", value_name = "NAME")]
    dns_bootstrap: Vec<String>,

    #[arg(long, default_value_t = meshcast::config::DEFAULT_GOSSIP_FANOUT)]
    fanout: usize,

    /// Relay messages even without a listen address.
    #[arg(long)]
    force_relay: bool,

    #[arg(short, long, default_value = "60")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = NetworkConfig {
        listen_address: args.listen.clone(),
        gossip_fanout: args.fanout,
        force_relay_messages: args.force_relay,
        ..Default::default()
    };

    let phonebook = Arc::new(MultiPhonebook::new());
    phonebook.add_phonebook(Arc::new(StaticPhonebook::new(args.peers.iter().cloned())));

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut refresh = None;
    if !args.dns_bootstrap.is_empty() {
        let dns = Arc::new(DnsPhonebook::new(args.dns_bootstrap.clone()));
        if let Err(e) = dns.refresh().await {
            warn!(error = %e, "initial DNS bootstrap failed");
        }
        phonebook.add_phonebook(dns.clone());
        refresh = Some(dns.spawn_refresh(DEFAULT_DNS_REFRESH_INTERVAL, stop_rx));
    }

    // Relay everything; this binary is a plain gossip relay.
    let relay_all = [tags::AGREEMENT_VOTE, tags::PROPOSAL_PAYLOAD, tags::VOTE_BUNDLE, tags::TXN]
        .into_iter()
        .map(|tag| TaggedMessageHandler::from_fn(tag, |_| ForwardingPolicy::Broadcast));

    let network = Network::builder(args.genesis.clone())
        .config(config)
        .phonebook(phonebook)
        .handlers(relay_all)
        .build()
        .context("invalid network configuration")?;
    network.start().await.context("failed to start network")?;
    match network.address() {
        Some(addr) => info!(address = %addr, genesis = %args.genesis, "node started"),
        None => info!(genesis = %args.genesis, "node started without listener"),
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let m = network.metrics().snapshot();
                info!(
                    peers = network.peers(&[meshcast::PeerOption::ConnectedIn, meshcast::PeerOption::ConnectedOut]).len(),
                    sent = m.messages_sent,
                    received = m.messages_received,
                    duplicates = m.duplicate_messages_received,
                    filtered = m.outgoing_messages_filtered,
                    stale = m.stale_messages_dropped,
                    slow_evicted = m.slow_peers_disconnected,
                    "telemetry snapshot"
                );
            }
        }
    }

    let _ = stop_tx.send(true);
    network.stop().await;
    if let Some(handle) = refresh {
        let _ = handle.await;
    }
    Ok(())
}

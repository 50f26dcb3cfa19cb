use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use clap::Parser;
use ephemeral_dht::Dht;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(author, version, about = "Run an ephemeral DHT node", long_about = None)]
struct Cli {
    /// Port to listen on, OS assigned if omitted
    #[arg(long)]
    port: Option<u16>,
    /// Peers to bootstrap from, e.g. `--initial-peers 127.0.0.1:6881`
    #[arg(long, value_delimiter = ',')]
    initial_peers: Vec<SocketAddrV4>,
    /// Stop after this many seconds, run until Ctrl+C if omitted
    #[arg(long)]
    lifetime_seconds: Option<u64>,
    /// Seconds between two status reports
    #[arg(long, default_value_t = 30)]
    report_interval: u64,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    let (stop_sender, stop_receiver) = flume::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_sender.try_send(());
    })
    .expect("Error setting Ctrl-C handler");

    let mut builder = Dht::builder();
    builder.initial_peers(&cli.initial_peers);
    if let Some(port) = cli.port {
        builder.port(port);
    }

    let mut dht = builder.build().expect("Failed to create DHT node");

    if dht.bootstrapped().unwrap_or(false) {
        info!("Bootstrap complete!");
    } else {
        warn!("Running without any reachable initial peer");
    }

    let deadline = cli
        .lifetime_seconds
        .map(|seconds| Instant::now() + Duration::from_secs(seconds));
    let interval = Duration::from_secs(cli.report_interval.max(1));

    loop {
        let timeout = match deadline {
            Some(deadline) => interval.min(deadline.saturating_duration_since(Instant::now())),
            None => interval,
        };

        if stop_receiver.recv_timeout(timeout).is_ok() {
            info!("Received Ctrl+C");
            break;
        }

        if let Ok(info) = dht.info() {
            info!(
                id = %info.id(),
                address = %info.local_addr(),
                routing_table_size = info.routing_table_size(),
                stored_values = info.stored_values(),
                "Node status"
            );
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            info!("Lifetime is over");
            break;
        }
    }

    dht.shutdown();
}

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use bitlurker::cli::Cli;
use bitlurker::coordinator::{Coordinator, CoordinatorConfig};
use bitlurker::dht::Node;
use bitlurker::queue::DEFAULT_CAPACITY;
use bitlurker::store::{CatalogStore, ChannelCountPublisher, CountPublisher, MemoryStore};
use bitlurker::tracker::Scraper;

fn main() {
    let cli = Cli::parse();

    std::env::set_var("RUST_LOG", if cli.verbose { "debug" } else { "info" });
    pretty_env_logger::init();

    ctrlc::set_handler(|| {
        log::info!("received shutdown signal, exiting");
        std::process::exit(0);
    })
    .expect("failed to install signal handler");

    if let Err(err) = run(cli) {
        log::error!("fatal startup error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let listen_addr = cli.listen_addr();
    log::info!("starting bitlurker on {listen_addr}");

    // §6: the catalog store and the live-count broadcaster are external
    // collaborators (§1); `MemoryStore` stands in for the embedded SQL
    // database, and the publisher's receiver would feed a WebSocket
    // broadcaster that doesn't exist in this core.
    let store: Arc<dyn CatalogStore> = Arc::new(MemoryStore::new());
    let (publisher, _count_receiver) = ChannelCountPublisher::new();
    let publisher: Option<Arc<dyn CountPublisher>> = Some(Arc::new(publisher));

    let scraper = Arc::new(Scraper::empty());
    scraper.refresh();
    scraper.clone().spawn_refresh_loop();

    let node = Node::spawn(&listen_addr, cli.friends, DEFAULT_CAPACITY)?;
    log::info!("dht node listening on {listen_addr}, bootstrapping...");

    let config = CoordinatorConfig {
        max_peers: cli.peers,
        max_retries: cli.max_retries,
        fetch_timeout: Duration::from_secs(cli.timeout),
    };
    let coordinator = Coordinator::new(config, store, scraper, publisher);

    if cli.http_port != 0 || cli.enable_http_port_mapping {
        log::info!(
            "http query surface / UPnP port mapping requested (port={}, upnp={}) but are external collaborators not built into this core",
            cli.http_port,
            cli.enable_http_port_mapping
        );
    }

    // §4.7: runs until the DHT node's socket dies fatally, at which point
    // the error surfaces here and ends the crawl (§7 "C6 errors that
    // close the UDP socket are fatal").
    Err(coordinator.run(&node))
}

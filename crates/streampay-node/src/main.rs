use clap::{App, Arg};
use std::path::Path;
use streampay_node::{Config, StreampayNode};
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let matches = App::new("streampay-node")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Interledger payment processing engine")
        .arg(
            Arg::with_name("config")
                .long("config")
                .short("c")
                .takes_value(true)
                .help("Path to a config file (json, toml or yaml)"),
        )
        .get_matches();

    let config = match Config::load(matches.value_of("config").map(Path::new)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = StreampayNode::new(config).serve().await {
        eprintln!("Node error: {}", err);
        std::process::exit(1);
    }
}

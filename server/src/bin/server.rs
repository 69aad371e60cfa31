//! Shoal cache server binary.

use clap::Parser;
use std::path::PathBuf;

use shoal_cache::HashCache;
use shoal_server::{logging, Config, Server};

#[derive(Parser)]
#[command(name = "shoal-server")]
#[command(about = "Memcache-compatible cache server")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    logging::init(&args.log_level);

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            eprintln!("No config file specified. Use <path> or --print-config");
            std::process::exit(1);
        }
    };

    let cache = HashCache::builder()
        .max_items(config.cache.max_items)
        .data_size(config.cache.data_size)
        .build();

    let server = Server::new(config, cache);
    if let Err(e) = server.serve().await {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}

fn print_default_config() {
    let config = r#"# Shoal Server Configuration

# Address to listen on
listen_addr = "0.0.0.0:11211"

# Per-connection buffered I/O sizes in bytes
read_buffer_size = 4096
write_buffer_size = 4096

[cache]
# Maximum number of items held at once
max_items = 1000000

# Total key+value byte budget
data_size = 67108864
"#;
    print!("{}", config);
}

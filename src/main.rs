use clap::Parser;

use webtty::cli::{debug_level_filter, Cli};
use webtty::config::Config;
use webtty::server::Server;

/// Exit codes, matching spec.md §6's table: `0` normal, `1` library
/// init/spawn failure, `2` bad CLI (clap already exits with this on parse
/// errors, so it never reaches here).
const EXIT_FAILURE: i32 = 1;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(debug_level_filter(cli.debug))
        .init();

    if cli.browser {
        log::info!("-B/--browser is accepted for compatibility but is a no-op on this build");
    }

    let config = match Config::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("webtty: {e}");
            std::process::exit(EXIT_FAILURE);
        }
    };

    let server = Server::new(config);
    if let Err(e) = server.run().await {
        log::error!("fatal: {e}");
        std::process::exit(EXIT_FAILURE);
    }
}

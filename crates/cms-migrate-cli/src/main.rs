#![forbid(unsafe_code)]

use tracing_subscriber::EnvFilter;

fn main() {
    // Logs go to stderr; stdout carries only action responses.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    std::process::exit(cms_migrate_cli::run());
}

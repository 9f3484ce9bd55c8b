use benchfleet::cli::{self, Cli};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    cli::init_tracing(cli.verbose);

    if let Err(err) = cli::run(cli).await {
        eprintln!("benchfleet: {err:#}");
        std::process::exit(1);
    }
}

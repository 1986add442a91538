use clap::Parser;
use hostman::{Cli, logging, run};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::install(&cli.log);

    if let Err(err) = run(cli).await {
        tracing::error!("{err}");
        std::process::exit(1);
    }
}

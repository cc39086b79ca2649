use clap::Parser;

mod cli;

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();
    cli::init_logging(args.debug);

    if let Err(e) = cli::run_command(args).await {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

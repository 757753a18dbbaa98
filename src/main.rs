mod app;
mod cli;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = cli::Cli::parse();
    match cli.command {
        cli::Command::Start(args) => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(async {
                let application = app::Application::build(&args)?;
                application.serve().await
            })
        }
    }
}

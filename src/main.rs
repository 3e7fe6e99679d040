mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, CrdAction};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => commands::version::run()?,
        Commands::Check {
            bus_url,
            input_stream,
            consumer,
            output_stream,
        } => {
            commands::check::run(&bus_url, &input_stream, &consumer, &output_stream).await?;
        }
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },
        Commands::Serve(args) => {
            commands::serve::run(args).await?;
        }
    }

    Ok(())
}

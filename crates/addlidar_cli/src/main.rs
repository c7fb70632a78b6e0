//! `addlidar`: runs the job server, or talks to one.

mod commands;
mod serve;

use addlidar_client::AddLidarClient;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "addlidar", version)]
#[command(about = "Point cloud processing jobs on a container orchestrator", long_about = None)]
struct Cli {
    /// Server URL for the client commands.
    #[arg(long, env = "ADDLIDAR_URL", default_value = "http://localhost:3000", global = true)]
    url: String,

    /// Bearer token sent with every client request.
    #[arg(long, env = "ADDLIDAR_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server.
    Serve(serve::ServeArgs),
    #[command(flatten)]
    Client(commands::ClientCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve::run(args).await,
        Command::Client(command) => {
            let client = AddLidarClient::new(cli.url, cli.token);
            commands::run(&client, command).await
        }
    }
}

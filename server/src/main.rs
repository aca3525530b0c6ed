use clap::Parser;
use log::{error, info};
use server::network::Server;
use shared::DEFAULT_MAX_PLAYERS;

#[derive(Parser, Debug)]
#[command(author, version, about = "Signaling server for peer-to-peer game rooms")]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Maximum number of players per room
    #[arg(short, long, default_value_t = DEFAULT_MAX_PLAYERS)]
    max_players: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);

    info!(
        "Starting signaling server on {} (max {} players per room)",
        address, args.max_players
    );

    let mut server = Server::bind(&address, args.max_players).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}

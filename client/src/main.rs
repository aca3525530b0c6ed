use clap::Parser;
use client::transport::webrtc::WebRtcTransport;
use client::{MeshConfig, PeerMesh, SignalingChannel, TcpSignaling};
use log::{info, warn};
use serde::Serialize;
use shared::timestamp_ms;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Peer mesh demo client", long_about = None)]
struct Args {
    /// Signaling server address
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Player name shown to the other room members
    #[arg(short = 'n', long, default_value = "player")]
    name: String,

    /// Create a room with this name
    #[arg(long, conflicts_with = "join")]
    create: Option<String>,

    /// Join the room with this id
    #[arg(long)]
    join: Option<String>,

    /// Start the game once in the room (master only)
    #[arg(long)]
    start: bool,

    /// STUN server URL, may be repeated
    #[arg(long = "stun")]
    stun: Vec<String>,

    /// Link statistics sampling interval
    #[arg(long, default_value = "2000")]
    stats_interval_ms: u64,

    /// Heartbeat broadcast interval
    #[arg(long, default_value = "1000")]
    broadcast_interval_ms: u64,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Announcement<'a> {
    Hello { name: &'a str },
    Bye { id: &'a str },
    Heartbeat { name: &'a str, tick: u64, sent_at: u64 },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config =
        MeshConfig::default().with_stats_interval(Duration::from_millis(args.stats_interval_ms));
    if !args.stun.is_empty() {
        config = config.with_ice_servers(args.stun.clone());
    }

    let signaling = Arc::new(TcpSignaling::connect(&args.server).await?);
    let transport = Arc::new(WebRtcTransport::new(&config)?);
    let mesh = PeerMesh::new(signaling.clone(), transport, config);
    let local_id = signaling.local_id();

    let weak = mesh.downgrade();
    let name = args.name.clone();
    mesh.set_on_connected_callback(move |peer| {
        info!("Channel to {} is up", peer);
        if let Some(mesh) = weak.upgrade() {
            mesh.broadcast_game_state(&Announcement::Hello { name: &name });
        }
    });

    let weak = mesh.downgrade();
    mesh.set_before_destroy_callback(move |id| {
        if let Some(mesh) = weak.upgrade() {
            mesh.broadcast_game_state(&Announcement::Bye { id: id.as_str() });
        }
    });

    mesh.set_state_update_callback(|state| info!("Peer state: {}", state));

    match (&args.create, &args.join) {
        (Some(room_name), _) => signaling.create_room(room_name, &args.name)?,
        (None, Some(room_id)) => signaling.join_room(room_id, &args.name)?,
        (None, None) => {
            let mut rooms = signaling.rooms();
            signaling.list_rooms()?;
            let _ = tokio::time::timeout(Duration::from_secs(2), rooms.changed()).await;
            for room in rooms.borrow().iter() {
                info!(
                    "Room {} '{}' ({}/{} players{})",
                    room.id,
                    room.name,
                    room.players.len(),
                    room.max_players,
                    if room.is_game_started { ", started" } else { "" }
                );
            }
            eprintln!("Pass --create <name> or --join <room id> to enter a room");
            return Ok(());
        }
    }

    let room = signaling.wait_for_room(|_| true).await?;
    info!(
        "In room {} '{}' as {} ({} players)",
        room.id,
        room.name,
        local_id,
        room.players.len()
    );

    if args.start {
        if room.is_master(&local_id) {
            signaling.start_game()?;
        } else {
            warn!("Only the room master can start the game");
        }
    }

    let mut heartbeat = tokio::time::interval(Duration::from_millis(args.broadcast_interval_ms));
    let mut report = tokio::time::interval(Duration::from_millis(args.stats_interval_ms));
    let mut tick = 0u64;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                tick += 1;
                mesh.broadcast_game_state(&Announcement::Heartbeat {
                    name: &args.name,
                    tick,
                    sent_at: timestamp_ms(),
                });
            }
            _ = report.tick() => {
                for peer in mesh.peers() {
                    match mesh.peer_stats(&peer) {
                        Some(stats) => info!(
                            "{}: rtt {:.1}ms, lost {}, quality {}",
                            peer,
                            stats.rtt_ms,
                            stats.packets_lost,
                            stats.quality()
                        ),
                        None => info!("{}: {:?}, no stats yet", peer, mesh.link_state(&peer)),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving room...");
                mesh.destroy();
                if let Err(e) = signaling.leave_room() {
                    warn!("Failed to leave room: {}", e);
                }
                // Let the goodbye and the leave frame go out
                tokio::time::sleep(Duration::from_millis(300)).await;
                break;
            }
        }

        if !signaling.is_connected() {
            warn!("Lost connection to the signaling server");
            break;
        }
    }

    Ok(())
}

//! Server binary: argument parsing and the async transport shell around the
//! synchronous tick loop.

use clap::Parser;
use log::{error, info, warn};
use server::server::{ChannelTransport, ServerCore, ServerEvent, TransportCommand};
use server::settings::ServerSettings;
use server::world::HeadlessWorld;
use shared::ClientPacket;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "27015")]
    port: u16,
    /// Tick rate (updates per second)
    #[clap(short, long, default_value = "20")]
    tick_rate: u32,
    /// Server name shown in the lobby
    #[clap(short, long, default_value = "Abysswatch Server")]
    name: String,
    /// Directory for ban list, whitelist and permission files
    #[clap(short, long, default_value = "Data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    std::fs::create_dir_all(&args.data_dir)?;
    let settings = ServerSettings {
        name: args.name,
        update_interval_seconds: 1.0 / args.tick_rate as f32,
        data_dir: args.data_dir,
        ..ServerSettings::default()
    };

    let address = format!("{}:{}", args.host, args.port);
    let socket = Arc::new(UdpSocket::bind(&address).await?);
    info!("Server listening on {}", address);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let (send_tx, mut send_rx) = mpsc::unbounded_channel::<TransportCommand>();

    // receiver task: decode datagrams and hand them to the tick loop
    {
        let socket = Arc::clone(&socket);
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            let mut buffer = [0u8; 4096];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        match bincode::deserialize::<ClientPacket>(&buffer[..len]) {
                            Ok(packet) => {
                                if event_tx
                                    .send(ServerEvent::PacketReceived { packet, addr })
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(_) => warn!("Failed to decode packet from {}", addr),
                        }
                    }
                    Err(err) => {
                        error!("Error receiving packet: {}", err);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    // sender task: fire-and-forget datagrams; delivery classes are the
    // transport layer's concern and the plain UDP adapter treats them all
    // as single datagrams
    {
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            while let Some(TransportCommand::Send { addr, bytes, .. }) = send_rx.recv().await {
                if let Err(err) = socket.send_to(&bytes, addr).await {
                    error!("Failed to send packet to {}: {}", addr, err);
                }
            }
        });
    }

    let update_interval = settings.update_interval_seconds;
    let mut core = ServerCore::new(
        settings,
        Box::new(HeadlessWorld::default()),
        ChannelTransport::new(send_tx),
    );

    let mut tick_interval = interval(Duration::from_secs_f32(update_interval));
    tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_tick = Instant::now();

    info!("Server started successfully");

    loop {
        tokio::select! {
            _ = tick_interval.tick() => {
                let now = Instant::now();
                let dt = now.duration_since(last_tick).as_secs_f32();
                last_tick = now;

                // drain everything that arrived since the last tick
                let mut inbound = Vec::new();
                let mut shutdown = false;
                while let Ok(event) = event_rx.try_recv() {
                    match event {
                        ServerEvent::PacketReceived { packet, addr } => {
                            inbound.push((addr, packet));
                        }
                        ServerEvent::Shutdown => shutdown = true,
                    }
                }
                if shutdown {
                    info!("Server shutting down");
                    break;
                }

                core.tick(inbound, dt);
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    Ok(())
}

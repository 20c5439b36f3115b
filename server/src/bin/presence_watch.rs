//! Connects to a presence store as a throwaway observer and prints every snapshot it receives.

use bincode::{deserialize, serialize};
use clap::Parser;
use rand::Rng;
use shared::{now_millis, Packet, RecordFilter, HEARTBEAT_INTERVAL, MAX_DATAGRAM, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, timeout};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Presence store address
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Include offline records
    #[arg(long)]
    all: bool,

    /// Stop after this many seconds (0 runs until interrupted)
    #[arg(short, long, default_value = "0")]
    duration: u64,
}

async fn send(
    socket: &UdpSocket,
    packet: &Packet,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    socket.send_to(&serialize(packet)?, addr).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let server_addr: SocketAddr = args.server.parse()?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Watcher socket bound to {}", socket.local_addr()?);

    let watcher_id = format!("watcher-{:08x}", rand::thread_rng().gen::<u32>());
    send(
        &socket,
        &Packet::Hello {
            protocol_version: PROTOCOL_VERSION,
            player_id: watcher_id.clone(),
        },
        server_addr,
    )
    .await?;

    let mut buffer = vec![0u8; MAX_DATAGRAM];
    let (len, _) = timeout(Duration::from_secs(3), socket.recv_from(&mut buffer)).await??;
    match deserialize::<Packet>(&buffer[..len])? {
        Packet::Welcome { server_time } => {
            println!("Connected as {} (server time {})", watcher_id, server_time)
        }
        other => {
            println!("Expected Welcome but got: {:?}", other);
            return Ok(());
        }
    }

    let filter = if args.all {
        RecordFilter::default()
    } else {
        RecordFilter::online()
    };
    send(&socket, &Packet::Subscribe { token: 1, filter }, server_addr).await?;

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    let deadline = tokio::time::sleep(if args.duration == 0 {
        Duration::from_secs(60 * 60 * 24 * 365)
    } else {
        Duration::from_secs(args.duration)
    });
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buffer) => {
                let (len, _) = result?;
                match deserialize::<Packet>(&buffer[..len]) {
                    Ok(Packet::Snapshot(snapshot)) => {
                        let count = snapshot.records.len();
                        println!("Snapshot #{} with {} records", snapshot.seq, count);
                        for record in snapshot.records {
                            let position = record
                                .position
                                .map(|p| format!("({:.1}, {:.1})", p.x, p.y))
                                .unwrap_or_else(|| "-".to_string());
                            println!(
                                "  {} {:?} avatar={} at {} facing {:?} online={}",
                                record.id,
                                record.display_name.unwrap_or_default(),
                                record.avatar_id.unwrap_or_default(),
                                position,
                                record.facing.unwrap_or_default(),
                                record.online.unwrap_or(false)
                            );
                        }
                    }
                    Ok(other) => println!("Unexpected packet: {:?}", other),
                    Err(e) => println!("Failed to deserialize packet: {}", e),
                }
            }
            _ = heartbeat.tick() => {
                send(&socket, &Packet::Heartbeat { timestamp: now_millis() }, server_addr).await?;
            }
            _ = &mut deadline => break,
        }
    }

    send(&socket, &Packet::Disconnect, server_addr).await?;
    println!("Watcher finished");
    Ok(())
}

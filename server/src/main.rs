use clap::Parser;
use log::info;
use server::network::{Server, ServerConfig};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Snapshot pushes per second
    #[arg(short, long, default_value = "20")]
    tick_rate: u32,

    /// Seconds of silence before a client counts as disconnected
    #[arg(long, default_value = "5")]
    timeout: u64,

    /// Maximum number of concurrent connections
    #[arg(short, long, default_value = "64")]
    max_clients: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let tick_rate = args.tick_rate.max(1);
    let config = ServerConfig {
        tick_duration: Duration::from_secs_f64(1.0 / tick_rate as f64),
        max_clients: args.max_clients,
        client_timeout: Duration::from_secs(args.timeout.max(1)),
    };

    let address = format!("{}:{}", args.host, args.port);
    info!(
        "Starting presence store on {} at {}Hz (timeout {}s, max {} clients)",
        address,
        tick_rate,
        config.client_timeout.as_secs(),
        config.max_clients
    );

    let mut server = Server::new(&address, config).await?;
    let control = server.control();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
            let _ = control.send(server::network::ServerMessage::Shutdown);
        }
    });

    server.run().await?;

    Ok(())
}

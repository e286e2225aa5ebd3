use std::{net::Ipv4Addr, path::PathBuf};
use clap::Parser;
use leech::{Config, TorrentStatus};

#[derive(Parser)]
#[command(name = "leech", about = "A single-file BitTorrent leech/seed client")]
struct Args {

    #[arg(short, long, help = "Path to torrent file")]
    torrent: PathBuf,

    #[arg(short, long, default_value = "downloads", help = "Directory to store the download in")]
    output: PathBuf,

    #[arg(short, long, default_value_t = 6881, help = "TCP port to listen on for peer connections")]
    port: u16,

    #[arg(short, long, default_value_t = 128 * 1024, help = "Upload budget per peer in bytes per second")]
    upload_bps: u64,

    #[arg(short, long, help = "Verbose output")]
    verbose: bool,

}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {

    let args = Args::parse();

    // Set up logging.
    let level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let sub = tracing_subscriber::fmt()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(sub)?;

    let config = Config {
        dir: args.output,
        listen_address: (Ipv4Addr::UNSPECIFIED, args.port).into(),
        upload_bps: args.upload_bps,
        ..Config::default()
    };

    let mut handle = leech::download(&args.torrent, config)?;
    match handle.wait().await {
        TorrentStatus::Complete => {
            tracing::info!("download complete");
            Ok(())
        }
        TorrentStatus::Stopped => {
            tracing::info!("stopped before completion");
            Ok(())
        }
        TorrentStatus::Failed(reason) => Err(reason.into()),
    }
}

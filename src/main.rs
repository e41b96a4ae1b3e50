use std::path::PathBuf;
use clap::Parser;
use leechy::{Supervisor, TorrentConfig};

/// A minimal BitTorrent leech client: downloads every piece of a torrent
/// from the peers its tracker hands out, then exits.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the .torrent metainfo file.
    metainfo: PathBuf,

    /// Directory to write downloaded files into.
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let supervisor = match Supervisor::new(TorrentConfig {
        metainfo_path: args.metainfo,
        output_dir: args.output,
    }) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            tracing::error!("failed to start torrent: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = supervisor.run().await {
        tracing::error!("torrent run failed: {}", e);
        std::process::exit(1);
    }
}

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use sbt::{
    conf::Conf, generate_peer_id, metainfo::Metainfo, orchestrator, piece_store::PieceStore,
    tracker::TrackerClient,
};

/// A minimal leech-only BitTorrent client: downloads a single torrent from
/// the peers its tracker hands back, then exits.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the .torrent metainfo file.
    torrent: PathBuf,

    /// Directory the downloaded files are written into.
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// TCP port advertised to the tracker. This client never accepts
    /// inbound connections, so the value only affects what the tracker
    /// tells other clients, never this client's own behavior.
    #[arg(short, long, default_value_t = 6881)]
    port: u16,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        log::error!("{}", err);
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> sbt::error::Result<()> {
    let bytes = std::fs::read(&cli.torrent)?;
    let metainfo = Metainfo::from_bytes(&bytes)?;
    let announce = metainfo.announce.clone();
    let torrent_info = Arc::new(metainfo.into_torrent_info(cli.output.clone())?);

    log::info!(
        "{} piece(s), {} byte(s) total",
        torrent_info.total_pieces(),
        torrent_info.download_len
    );

    let conf = Arc::new(Conf::new(cli.output));
    let peer_id = generate_peer_id();

    let tracker = TrackerClient::new(announce, conf.connect_timeout)?;
    let peers = tracker
        .announce(torrent_info.info_hash, peer_id, cli.port, torrent_info.download_len)
        .await?;
    log::info!("tracker returned {} peer(s)", peers.len());

    let piece_store = Arc::new(PieceStore::new(torrent_info.total_pieces()));

    orchestrator::run_download(
        peers,
        peer_id,
        Arc::clone(&conf),
        Arc::clone(&torrent_info),
        Arc::clone(&piece_store),
    )
    .await?;

    sbt::disk::write_to_disk(torrent_info, piece_store).await?;
    log::info!("download complete");

    Ok(())
}

mod args;
mod logging;
mod stats;

use anyhow::Context;
use args::Arguments;
use clap::Parser;
use ferrobit_lib::{SessionRegistry, TorrentMeta};
use stats::ProgressPrinter;
use tokio::sync::oneshot;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::setup_logger()?;

    let args = Arguments::parse();

    let torrent_file = tokio::fs::read(&args.torrent)
        .await
        .with_context(|| format!("failed to read the torrent file: {:?}", args.torrent))?;
    let meta = TorrentMeta::from_bytes(&torrent_file).context("failed to decode the torrent file")?;

    let registry = SessionRegistry::new(args.session_config());
    let record = registry.register(meta, &args.output_dir)?;
    tracing::info!(
        "downloading '{}' ({} bytes, {} pieces) to {:?}",
        record.name,
        record.total_length,
        record.pieces,
        record.output_path
    );

    let session = registry
        .get(&record.info_hash)
        .context("bug: a registered torrent is missing?")?;
    let progress_rx = session.subscribe();
    let download = registry.start_download(&record.info_hash)?;

    let printer = ProgressPrinter::new(args.progress_interval(), args.json);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let printer_handle = tokio::spawn(printer.handle(progress_rx, cancel_rx));

    let result = download.await.context("failed to execute the download task")?;
    if cancel_tx.send(()).is_err() {
        tracing::error!("bug: printer exited too early?");
    }
    printer_handle.await.context("progress printer task")?;

    let summary = result.context("error while downloading the torrent")?;
    tracing::info!(
        resumed_pieces = summary.resumed_pieces,
        "saved {} pieces to {:?}",
        summary.pieces,
        summary.path
    );

    Ok(())
}

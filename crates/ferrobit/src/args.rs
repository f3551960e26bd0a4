use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use ferrobit_lib::SessionConfig;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Arguments {
    /// Torrent file to use
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent: PathBuf,
    /// Where to save the downloaded torrents
    #[arg(short, long, value_name = "OUTPUT_DIR", default_value = Path::new("./downloads").to_path_buf().into_os_string())]
    pub output_dir: PathBuf,
    /// Port reported to the tracker
    #[arg(long, default_value_t = 6881)]
    pub port: u16,
    /// Maximum number of concurrent peer connections
    #[arg(long, value_name = "N", default_value_t = 50, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_peers: u64,
    /// Seconds between two progress reports
    #[arg(long, value_name = "SECS", default_value_t = 2, value_parser = clap::value_parser!(u64).range(1..))]
    pub progress_interval: u64,
    /// Print progress as JSON lines on stdout
    #[arg(long)]
    pub json: bool,
}

impl Arguments {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            listen_port: self.port,
            max_peers: self.max_peers as usize,
            ..SessionConfig::default()
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval)
    }
}

use std::ops::Deref;
use std::time::{Duration, Instant};

use ferrobit_lib::Progress;
use serde::Serialize;
use tokio::sync::{oneshot, watch};

/// Fixed-size buffer that overwrites its oldest entry once full
pub struct CircularBuffer<T> {
    pos: usize,
    inner: Vec<T>,
    capacity: usize,
}

impl<T> CircularBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        CircularBuffer {
            pos: 0,
            inner: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push_back(&mut self, item: T) {
        if self.inner.len() < self.capacity {
            self.inner.push(item);
        } else {
            self.inner[self.pos] = item;
        }
        self.pos = (self.pos + 1) % self.capacity;
    }

    /// The entry pushed before all others still in the buffer
    pub fn oldest(&self) -> Option<&T> {
        if self.inner.len() < self.capacity {
            self.inner.first()
        } else {
            self.inner.get(self.pos)
        }
    }

    /// The entry pushed last
    pub fn newest(&self) -> Option<&T> {
        let last = (self.pos + self.capacity - 1) % self.capacity;
        self.inner.get(last)
    }
}

impl<T> Deref for CircularBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Download speed over the last few progress samples
pub struct SpeedWindow {
    samples: CircularBuffer<(Instant, u64)>,
}

impl SpeedWindow {
    const DEFAULT_SAMPLES: usize = 10;

    pub fn new() -> Self {
        SpeedWindow {
            samples: CircularBuffer::new(Self::DEFAULT_SAMPLES),
        }
    }

    pub fn record(&mut self, at: Instant, downloaded_bytes: u64) {
        self.samples.push_back((at, downloaded_bytes));
    }

    pub fn bytes_per_sec(&self) -> f64 {
        let (Some((first_at, first)), Some((last_at, last))) = (self.samples.oldest(), self.samples.newest()) else {
            return 0.;
        };
        let elapsed = last_at.duration_since(*first_at).as_secs_f64();
        if elapsed == 0. {
            return 0.;
        }
        last.saturating_sub(*first) as f64 / elapsed
    }
}

#[derive(Serialize)]
struct ProgressLine<'a> {
    #[serde(flatten)]
    progress: &'a Progress,
    live_peers: usize,
    bytes_per_sec: f64,
}

pub fn format_progress(progress: &Progress, bytes_per_sec: f64) -> String {
    let left = progress.total_bytes - progress.downloaded_bytes;
    let eta = if bytes_per_sec > 0. {
        format!("{:.0} s", left as f64 / bytes_per_sec)
    } else if left == 0 {
        "0 s".to_string()
    } else {
        "unknown".to_string()
    };

    format!(
        "ETA: {} - {:.2}% ({}/{} pieces) - ↓{:.1} MiB/s - peers: {}",
        eta,
        progress.percent(),
        progress.downloaded_pieces,
        progress.total_pieces,
        bytes_per_sec / 1024. / 1024.,
        progress.live_peers()
    )
}

pub struct ProgressPrinter {
    interval: Duration,
    json: bool,
    speed: SpeedWindow,
}

impl ProgressPrinter {
    pub fn new(interval: Duration, json: bool) -> Self {
        ProgressPrinter {
            interval,
            json,
            speed: SpeedWindow::new(),
        }
    }

    /// Prints the latest progress every interval, and once more when cancelled
    pub async fn handle(mut self, progress_rx: watch::Receiver<Progress>, mut cancellation: oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.print(&progress_rx),
                _ = &mut cancellation => {
                    self.print(&progress_rx);
                    break;
                }
            }
        }
    }

    fn print(&mut self, progress_rx: &watch::Receiver<Progress>) {
        let progress = progress_rx.borrow().clone();
        self.speed.record(Instant::now(), progress.downloaded_bytes);
        let bytes_per_sec = self.speed.bytes_per_sec();

        if self.json {
            let line = ProgressLine {
                progress: &progress,
                live_peers: progress.live_peers(),
                bytes_per_sec,
            };
            match serde_json::to_string(&line) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::error!("failed to serialize progress: {}", e),
            }
        } else {
            tracing::info!("{}", format_progress(&progress, bytes_per_sec));
        }
    }
}

#[cfg(test)]
mod tests {
    use ferrobit_lib::SessionState;

    use super::*;

    fn progress(downloaded_bytes: u64) -> Progress {
        Progress {
            state: SessionState::Downloading,
            downloaded_pieces: 1,
            total_pieces: 4,
            downloaded_bytes,
            total_bytes: 4 * 1024 * 1024,
            peers: Vec::new(),
        }
    }

    #[test]
    fn circular_buffer_overwrites_the_oldest_entry() {
        let mut buffer = CircularBuffer::new(3);
        for item in 1..=5 {
            buffer.push_back(item);
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.oldest(), Some(&3));
        assert_eq!(buffer.newest(), Some(&5));
    }

    #[test]
    fn speed_covers_the_whole_window() {
        let start = Instant::now();
        let mut speed = SpeedWindow::new();
        assert_eq!(speed.bytes_per_sec(), 0.);

        speed.record(start, 0);
        speed.record(start + Duration::from_secs(1), 1000);
        speed.record(start + Duration::from_secs(4), 2000);
        assert_eq!(speed.bytes_per_sec(), 500.);
    }

    #[test]
    fn progress_line_mentions_eta_and_pieces() {
        let line = format_progress(&progress(1024 * 1024), 1024. * 1024.);
        assert_eq!(line, "ETA: 3 s - 25.00% (1/4 pieces) - ↓1.0 MiB/s - peers: 0");

        let stalled = format_progress(&progress(1024 * 1024), 0.);
        assert!(stalled.starts_with("ETA: unknown"));
    }

    #[test]
    fn json_line_flattens_the_progress() {
        let progress = progress(10);
        let line = ProgressLine {
            progress: &progress,
            live_peers: 0,
            bytes_per_sec: 2.5,
        };

        let json = serde_json::to_value(&line).expect("failed to serialize a progress line");
        assert_eq!(json["state"], "downloading");
        assert_eq!(json["downloaded_bytes"], 10);
        assert_eq!(json["bytes_per_sec"], 2.5);
    }
}

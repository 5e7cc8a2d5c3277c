//! Tails one server's log, local or remote, emitting whole lines as they
//! land. Thread-per-source, polling on a fixed cadence rather than a
//! filesystem-notify crate — mirrors the command client's own
//! poll-and-sleep connection loop so the two supervised component kinds
//! read the same way side by side.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::state::config::LogSourceConfig;

#[derive(Debug, thiserror::Error)]
pub enum LogSourceError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("remote log transfer is not configured with a fetcher")]
    NoFetcher,
}

/// Identifies a specific file incarnation so rotation (log rolled to a new
/// inode, or truncated in place) can be detected across polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Fingerprint {
    #[cfg(unix)]
    dev: u64,
    #[cfg(unix)]
    ino: u64,
    len: u64,
}

#[cfg(unix)]
fn fingerprint(meta: &std::fs::Metadata) -> Fingerprint {
    use std::os::unix::fs::MetadataExt;
    Fingerprint {
        dev: meta.dev(),
        ino: meta.ino(),
        len: meta.len(),
    }
}

#[cfg(not(unix))]
fn fingerprint(meta: &std::fs::Metadata) -> Fingerprint {
    Fingerprint { len: meta.len() }
}

fn same_incarnation(a: &Fingerprint, b: &Fingerprint) -> bool {
    #[cfg(unix)]
    {
        a.dev == b.dev && a.ino == b.ino
    }
    #[cfg(not(unix))]
    {
        // Without an inode to key on, a shrinking file is the only local
        // rotation signal available.
        b.len >= a.len
    }
}

/// External collaborator for `RemoteFileTransfer` sources: whatever
/// transport (SFTP, a sidecar agent, object storage) actually moves the
/// remote file's bytes locally. The log source only ever calls this trait.
pub trait RemoteFetcher: Send + Sync {
    /// Return bytes appended since `known_len`, and the file's new total
    /// length.
    fn fetch_tail(&self, host: &str, path: &str, known_len: u64) -> Result<(Vec<u8>, u64), LogSourceError>;
}

pub struct LogSource {
    shutdown: Arc<AtomicBool>,
}

impl LogSource {
    /// Spawn the tailing thread. Whole lines (newline-stripped) are sent to
    /// `lines_tx` in order; a trailing partial line is carried over across
    /// polls rather than emitted early.
    pub fn start(
        config: LogSourceConfig,
        lines_tx: UnboundedSender<String>,
        fetcher: Option<Arc<dyn RemoteFetcher>>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name("log-source".to_string())
            .spawn(move || run(config, lines_tx, fetcher, thread_shutdown))
            .expect("failed to spawn log source thread");
        Self { shutdown }
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

fn run(
    config: LogSourceConfig,
    lines_tx: UnboundedSender<String>,
    fetcher: Option<Arc<dyn RemoteFetcher>>,
    shutdown: Arc<AtomicBool>,
) {
    let poll_interval = Duration::from_secs(config.poll_interval_secs().clamp(1, 300));
    match config {
        LogSourceConfig::LocalFile { path, read_from_start, .. } => {
            run_local(PathBuf::from(path), read_from_start, poll_interval, lines_tx, shutdown)
        }
        LogSourceConfig::RemoteFileTransfer { host, path, .. } => {
            run_remote(host, path, poll_interval, lines_tx, fetcher, shutdown)
        }
    }
}

fn run_local(
    path: PathBuf,
    read_from_start: bool,
    poll_interval: Duration,
    lines_tx: UnboundedSender<String>,
    shutdown: Arc<AtomicBool>,
) {
    let mut offset: u64 = 0;
    let mut known_fp: Option<Fingerprint> = None;
    let mut partial = String::new();
    let mut started = false;

    while !shutdown.load(Ordering::Relaxed) {
        match File::open(&path).and_then(|f| f.metadata().map(|m| (f, m))) {
            Ok((mut file, meta)) => {
                let fp = fingerprint(&meta);
                let rotated = known_fp.is_some_and(|known| !same_incarnation(&known, &fp));
                let truncated = fp.len < offset;
                if rotated || truncated || !started {
                    offset = if started || read_from_start { 0 } else { fp.len };
                    partial.clear();
                }
                started = true;
                known_fp = Some(fp);

                if fp.len > offset {
                    if file.seek(SeekFrom::Start(offset)).is_err() {
                        std::thread::sleep(poll_interval);
                        continue;
                    }
                    let mut reader = BufReader::new(&mut file);
                    let mut chunk = String::new();
                    match std::io::Read::read_to_string(&mut reader, &mut chunk) {
                        Ok(_) => {
                            offset = fp.len;
                            partial.push_str(&chunk);
                            emit_complete_lines(&mut partial, &lines_tx);
                        }
                        Err(_) => {
                            // Non-UTF8 tail; fall back to lossy byte-by-byte lines.
                            let mut raw = Vec::new();
                            let _ = file.seek(SeekFrom::Start(offset));
                            if std::io::Read::read_to_end(&mut BufReader::new(&mut file), &mut raw).is_ok() {
                                offset = fp.len;
                                partial.push_str(&String::from_utf8_lossy(&raw));
                                emit_complete_lines(&mut partial, &lines_tx);
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!("log source {}: {e}", path.display());
            }
        }
        std::thread::sleep(poll_interval);
    }
}

fn run_remote(
    host: String,
    path: String,
    poll_interval: Duration,
    lines_tx: UnboundedSender<String>,
    fetcher: Option<Arc<dyn RemoteFetcher>>,
    shutdown: Arc<AtomicBool>,
) {
    let Some(fetcher) = fetcher else {
        tracing::warn!("remote log source {host}:{path} has no fetcher configured, idling");
        return;
    };
    let mut known_len: u64 = 0;
    let mut partial = String::new();

    while !shutdown.load(Ordering::Relaxed) {
        match fetcher.fetch_tail(&host, &path, known_len) {
            Ok((bytes, new_len)) => {
                if new_len < known_len {
                    // Remote file rotated; restart from the new beginning.
                    known_len = 0;
                    partial.clear();
                }
                known_len = new_len;
                partial.push_str(&String::from_utf8_lossy(&bytes));
                emit_complete_lines(&mut partial, &lines_tx);
            }
            Err(e) => tracing::debug!("remote log source {host}:{path}: {e}"),
        }
        std::thread::sleep(poll_interval);
    }
}

fn emit_complete_lines(buf: &mut String, lines_tx: &UnboundedSender<String>) {
    while let Some(pos) = buf.find('\n') {
        let line: String = buf.drain(..=pos).collect();
        let line = line.trim_end_matches(['\n', '\r']);
        if lines_tx.send(line.to_string()).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn emits_complete_lines_and_carries_partial() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut buf = String::from("line one\nline two\npartial");
        emit_complete_lines(&mut buf, &tx);
        assert_eq!(buf, "partial");
        assert_eq!(rx.try_recv().unwrap(), "line one");
        assert_eq!(rx.try_recv().unwrap(), "line two");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn local_file_tail_reads_appended_content() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("aegis-logsrc-test-{}.log", uuid::Uuid::new_v4()));
        std::fs::write(&path, "first line\n").unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let path_clone = path.clone();
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || {
            run_local(path_clone, true, Duration::from_millis(20), tx, thread_shutdown)
        });

        std::thread::sleep(Duration::from_millis(60));
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "second line").unwrap();
        }
        std::thread::sleep(Duration::from_millis(80));
        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        let mut seen = Vec::new();
        while let Ok(line) = rx.try_recv() {
            seen.push(line);
        }
        assert!(seen.contains(&"first line".to_string()));
        assert!(seen.contains(&"second line".to_string()));
        std::fs::remove_file(&path).ok();
    }
}

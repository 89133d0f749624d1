//! Ledger of finished upload units, for resuming an interrupted upload.
//!
//! Stored as JSON lines in `upload.state` inside the local backup directory. The
//! first line records the parameters of the run that created the ledger;
//! every other line is one finished unit (remote key and size). A ledger
//! created with different parameters is discarded.
//!
//! Marks are buffered and reach the disk at most `flush_interval` apart,
//! either on the next mark or from the background flusher.

use crate::utils::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const STATE_FILE_NAME: &str = "upload.state";

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Line {
    Header { params: Value },
    Done { key: String, size: u64 },
}

struct Writer {
    file: BufWriter<File>,
    last_flush: Instant,
    dirty: bool,
}

pub struct ResumableState {
    path: PathBuf,
    done: RwLock<HashMap<String, u64>>,
    writer: Mutex<Writer>,
    flush_interval: Duration,
}

impl ResumableState {
    /// Open (or create) the ledger in `backup_dir`.
    pub async fn open(backup_dir: &Path, params: Value, flush_interval: Duration) -> Result<Self> {
        let path = backup_dir.join(STATE_FILE_NAME);
        let mut done = HashMap::new();
        let mut reuse = false;
        let mut torn = false;

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let mut lines = content.lines();
                match lines.next().map(serde_json::from_str::<Line>) {
                    Some(Ok(Line::Header { params: stored })) if stored == params => {
                        reuse = true;
                        torn = !content.ends_with('\n');
                        for line in lines {
                            // a crash can leave a torn last line
                            if let Ok(Line::Done { key, size }) = serde_json::from_str(line) {
                                done.insert(key, size);
                            }
                        }
                        info!("Resuming upload, {} units already done", done.len());
                    }
                    _ => warn!(
                        "{} was written with different parameters, starting over",
                        path.display()
                    ),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let file = if reuse {
            OpenOptions::new().append(true).open(&path).await?
        } else {
            tokio::fs::create_dir_all(backup_dir).await?;
            File::create(&path).await?
        };
        let mut writer = Writer {
            file: BufWriter::new(file),
            last_flush: Instant::now(),
            dirty: false,
        };
        if !reuse {
            write_line(&mut writer.file, &Line::Header { params }).await?;
            writer.file.flush().await?;
        } else if torn {
            writer.file.write_all(b"\n").await?;
            writer.file.flush().await?;
        }

        Ok(Self {
            path,
            done: RwLock::new(done),
            writer: Mutex::new(writer),
            flush_interval,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size recorded for `key` when it is already done.
    pub async fn is_done(&self, key: &str) -> Option<u64> {
        self.done.read().await.get(key).copied()
    }

    pub async fn done_count(&self) -> usize {
        self.done.read().await.len()
    }

    /// Record `key` as done. Must only be called after the remote store
    /// confirmed the write.
    pub async fn mark_done(&self, key: &str, size: u64) -> Result<()> {
        self.done.write().await.insert(key.to_string(), size);

        let mut writer = self.writer.lock().await;
        write_line(
            &mut writer.file,
            &Line::Done {
                key: key.to_string(),
                size,
            },
        )
        .await?;
        writer.dirty = true;
        if writer.last_flush.elapsed() >= self.flush_interval {
            sync(&mut writer).await?;
        }
        Ok(())
    }

    /// Push buffered marks to disk.
    pub async fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        sync(&mut writer).await
    }

    /// Flush buffered marks every `flush_interval` until `stop` is cancelled
    /// or the state is dropped. Nothing is spawned for a zero interval, since
    /// every mark is then flushed immediately.
    pub fn spawn_flusher(self: &Arc<Self>, stop: CancellationToken) -> Option<JoinHandle<()>> {
        if self.flush_interval.is_zero() {
            return None;
        }
        let state: Weak<Self> = Arc::downgrade(self);
        let period = self.flush_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(state) = state.upgrade() else {
                    break;
                };
                if let Err(e) = state.flush().await {
                    warn!("can't flush {}: {}", state.path.display(), e);
                }
            }
        }))
    }

    /// Flush outstanding marks. The ledger is removed when the backup is
    /// `complete` remotely and kept for the next attempt otherwise.
    pub async fn close(self, complete: bool) -> Result<()> {
        let mut writer = self.writer.into_inner();
        sync(&mut writer).await?;
        drop(writer);
        if complete {
            tokio::fs::remove_file(&self.path).await?;
            debug!("removed {}", self.path.display());
        }
        Ok(())
    }
}

async fn write_line(file: &mut BufWriter<File>, line: &Line) -> Result<()> {
    let mut buf = serde_json::to_vec(line)?;
    buf.push(b'\n');
    file.write_all(&buf).await?;
    Ok(())
}

async fn sync(writer: &mut Writer) -> Result<()> {
    if writer.dirty {
        writer.file.flush().await?;
        writer.file.get_ref().sync_data().await?;
        writer.dirty = false;
    }
    writer.last_flush = Instant::now();
    Ok(())
}

// ===============================
// src/recorder.rs
// ===============================
//
// JSONL recorder untuk listing events:
// - Subscriber bus biasa; handler hanya mengantre ke channel, file I/O di task sendiri.
// - Bufer dengan BufWriter agar hemat syscall.
// - Flush periodik tiap 1s dan/atau tiap 1000 event.
// - Jika open/tulis gagal, event di-drop dan file dicoba dibuka lagi di event berikutnya.
//
// ENV: set `RECORD_FILE=/path/to/events.jsonl` agar aktif.
//
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::bus::Handler;
use crate::domain::ListingEvent;

const FLUSH_EVERY_N_EVENTS: u32 = 1000;

async fn open_writer(path: &str) -> Option<BufWriter<File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "recorder: create_dir_all failed");
            }
        }
    }
    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(BufWriter::new(file)),
        Err(e) => {
            error!(?e, %path, "recorder: open failed");
            None
        }
    }
}

/// Bus handler: never blocks the bus, drops when the writer lags far behind.
pub struct RecorderHandler {
    tx: mpsc::Sender<Arc<ListingEvent>>,
}

#[async_trait]
impl Handler for RecorderHandler {
    async fn handle(&self, event: Arc<ListingEvent>) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "recorder: queue full, event not recorded");
        }
    }
}

/// Returns the handler to subscribe and the writer task to spawn.
pub fn recorder(path: String, queue: usize) -> (RecorderHandler, impl std::future::Future<Output = ()>) {
    let (tx, rx) = mpsc::channel(queue.max(1));
    (RecorderHandler { tx }, run(rx, path))
}

pub async fn run(mut rx: mpsc::Receiver<Arc<ListingEvent>>, path: String) {
    info!(%path, "recorder: started");
    let mut writer = open_writer(&path).await;

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    if let Some(w) = writer.as_mut() {
                        let _ = w.flush().await;
                    }
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let mut line = match serde_json::to_string(ev.as_ref()) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };
                line.push('\n');

                if writer.is_none() {
                    writer = open_writer(&path).await;
                }
                let Some(w) = writer.as_mut() else {
                    continue;
                };
                if let Err(e) = w.write_all(line.as_bytes()).await {
                    error!(?e, event = ev.id, "recorder: write failed, reopening");
                    writer = open_writer(&path).await;
                    if let Some(w) = writer.as_mut() {
                        if let Err(e2) = w.write_all(line.as_bytes()).await {
                            error!(?e2, "recorder: write failed again after reopen, drop event");
                            continue;
                        }
                    }
                }

                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    if let Some(w) = writer.as_mut() {
                        let _ = w.flush().await;
                    }
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                if let Some(w) = writer.as_mut() {
                    let _ = w.flush().await;
                }
                since_last_flush = 0;
            }
        }
    }
}

//! Background maintenance: indexing, compression and retention.
//!
//! The worker owns one thread that wakes on a tick interval, indexes
//! sealed chunks that have no indexes yet, optionally compresses them,
//! applies the retention policy and deletes the flagged chunks. All of
//! it also runs synchronously through [`run_maintenance`] for callers
//! that schedule their own work.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Error;
use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, info, warn};

use crate::error::StoreError;
use crate::index::{build_chunk_indexes, IndexConfig, TOKEN_INDEX_NAME};

use super::chunk_store::ChunkStore;
use super::retention::{NeverRetain, RetentionPolicy};

pub struct MaintenanceConfig {
    pub interval: Duration,
    pub retention: Box<dyn RetentionPolicy>,
    pub index: IndexConfig,
    pub compress_sealed: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            retention: Box::new(NeverRetain),
            index: IndexConfig::default(),
            compress_sealed: false,
        }
    }
}

/// One maintenance pass: index, compress, retain.
pub fn run_maintenance(store: &ChunkStore, config: &MaintenanceConfig) -> Result<(), Error> {
    for meta in store.store_state().chunks {
        let dir = store.chunk_dir(meta.id);
        if !dir.join(TOKEN_INDEX_NAME).exists() {
            if let Err(err) = build_chunk_indexes(store, meta.id, &config.index) {
                warn!("indexing chunk {} failed - {}", meta.id, err);
                continue;
            }
        }
        if config.compress_sealed && !meta.compressed {
            if let Err(err) = store.compress_chunk(meta.id) {
                warn!("compressing chunk {} failed - {}", meta.id, err);
            }
        }
    }

    let state = store.store_state();
    for id in config.retention.apply(&state) {
        match store.delete(id) {
            Ok(()) => info!("retention deleted chunk {}", id),
            Err(err) => {
                // busy chunks are retried on the next pass
                if matches!(StoreError::from_err(&err), Some(StoreError::ResourceBusy(_))) {
                    debug!("retention skipping busy chunk {}", id);
                } else {
                    warn!("retention delete of {} failed - {}", id, err);
                }
            }
        }
    }

    Ok(())
}

pub struct MaintenanceWorker {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    pub fn spawn(store: Arc<ChunkStore>, config: MaintenanceConfig) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::spawn(move || {
            let ticker = tick(config.interval);
            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        if let Err(err) = run_maintenance(&store, &config) {
                            warn!("maintenance pass failed - {}", err);
                        }
                    }
                }
            }
        });
        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Signal the worker and wait for it to finish.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

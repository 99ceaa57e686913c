use crate::backend::{FifoBackend, LogBackend, OrderedOmapBackend};
use async_trait::async_trait;
use gwtypes::{GwError, GwResult};
use objstore::{ObjectId, ObjectStore, Op};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

const MAX_RETRIES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogType {
    OrderedOmap,
    Fifo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub gen_id: u64,
    pub log_type: LogType,
    pub empty: bool,
}

/// Invoked when the generations manager observes a change to the
/// persisted generation list, whether made locally or learned via
/// watch/notify from a peer (§4.2). The Data-Change Log is the primary
/// implementor: a new generation means future pushes target it, and a
/// new tail means peers have caught up past the old one.
#[async_trait]
pub trait GenerationsObserver: Send + Sync {
    async fn handle_init(&self, non_empty: Vec<GenerationRecord>);
    async fn handle_new_gens(&self, new: Vec<GenerationRecord>);
    async fn handle_empty_to(&self, new_tail: u64);
}

#[derive(Serialize, Deserialize, Default)]
struct Metadata {
    generations: Vec<GenerationRecord>,
}

/// Tracks the totally ordered sequence of log generations for one data
/// log (§4.2). Persisted as a single metadata object; generation ids are
/// monotonic and dense from 0, and at least one generation is always
/// non-empty.
pub struct GenerationsManager {
    store: Arc<dyn ObjectStore>,
    pool: String,
    prefix: String,
    num_shards: u32,
    metadata_id: ObjectId,
    generations: RwLock<Vec<GenerationRecord>>,
}

impl GenerationsManager {
    /// Reads the metadata object (creating generation 0 with
    /// `default_log_type` if it does not yet exist — §9's "default
    /// log_type wins if scan finds nothing"), and invokes
    /// `observer.handle_init`.
    pub async fn load_or_init(
        store: Arc<dyn ObjectStore>,
        pool: impl Into<String>,
        prefix: impl Into<String>,
        num_shards: u32,
        default_log_type: LogType,
        observer: &(dyn GenerationsObserver),
    ) -> GwResult<Self> {
        let pool = pool.into();
        let prefix = prefix.into();
        let metadata_id = ObjectId::new(pool.clone(), format!("{prefix}.generations_metadata"));

        let generations = match store.read_full(&metadata_id).await {
            Ok(bytes) => {
                let meta: Metadata = serde_json::from_slice(&bytes).map_err(GwError::fatal)?;
                meta.generations
            }
            Err(e) if e.is_not_found() => {
                let initial = vec![GenerationRecord {
                    gen_id: 0,
                    log_type: default_log_type,
                    empty: false,
                }];
                let bytes = serde_json::to_vec(&Metadata {
                    generations: initial.clone(),
                })
                .map_err(GwError::fatal)?;
                store
                    .operate(&metadata_id, vec![Op::CreateExclusive, Op::WriteFull(bytes)])
                    .await?;
                initial
            }
            Err(e) => return Err(e),
        };

        let non_empty: Vec<_> = generations.iter().filter(|g| !g.empty).cloned().collect();
        observer.handle_init(non_empty).await;

        Ok(Self {
            store,
            pool,
            prefix,
            num_shards,
            metadata_id,
            generations: RwLock::new(generations),
        })
    }

    fn backend_for(&self, gen_id: u64, log_type: LogType) -> Box<dyn LogBackend> {
        match log_type {
            LogType::OrderedOmap => Box::new(OrderedOmapBackend::new(
                self.store.clone(),
                self.pool.clone(),
                self.prefix.clone(),
                gen_id,
            )),
            LogType::Fifo => Box::new(FifoBackend::new(
                self.store.clone(),
                self.pool.clone(),
                self.prefix.clone(),
                gen_id,
            )),
        }
    }

    /// The backend for the newest (current) generation — where new
    /// entries are pushed.
    pub fn current_backend(&self) -> Box<dyn LogBackend> {
        let gens = self.generations.read().unwrap();
        let latest = gens.last().expect("at least one generation always present");
        self.backend_for(latest.gen_id, latest.log_type)
    }

    pub fn current_gen_id(&self) -> u64 {
        self.generations.read().unwrap().last().map(|g| g.gen_id).unwrap_or(0)
    }

    /// All non-empty generations, oldest first — used by listing paths
    /// that must span every generation a peer might still be reading.
    pub fn non_empty_generations(&self) -> Vec<GenerationRecord> {
        self.generations.read().unwrap().iter().filter(|g| !g.empty).cloned().collect()
    }

    async fn read_current(&self) -> GwResult<(u64, Vec<GenerationRecord>)> {
        let version = self.store.operate(&self.metadata_id, vec![]).await?;
        let bytes = self.store.read_full(&self.metadata_id).await?;
        let meta: Metadata = serde_json::from_slice(&bytes).map_err(GwError::fatal)?;
        Ok((version, meta.generations))
    }

    /// Atomically appends a new generation with the next gen_id,
    /// retrying on CAS conflict (§4.2 "new_backing").
    pub async fn new_backing(&self, log_type: LogType, observer: &(dyn GenerationsObserver)) -> GwResult<u64> {
        for attempt in 0..MAX_RETRIES {
            let (version, mut gens) = self.read_current().await?;
            let next_gen = gens.last().map(|g| g.gen_id + 1).unwrap_or(0);
            gens.push(GenerationRecord {
                gen_id: next_gen,
                log_type,
                empty: false,
            });
            let bytes = serde_json::to_vec(&Metadata { generations: gens.clone() }).map_err(GwError::fatal)?;

            match self
                .store
                .operate(&self.metadata_id, vec![Op::AssertVersion(version), Op::WriteFull(bytes)])
                .await
            {
                Ok(_) => {
                    *self.generations.write().unwrap() = gens.clone();
                    let _ = self.store.notify(&self.metadata_id, next_gen.to_string().into_bytes()).await;
                    observer.handle_new_gens(gens).await;
                    return Ok(next_gen);
                }
                Err(e) if e.is_retryable() && attempt + 1 < MAX_RETRIES => continue,
                Err(e) => return Err(e),
            }
        }
        Err(GwError::Canceled(format!(
            "{}: exhausted {MAX_RETRIES} retries in new_backing",
            self.metadata_id
        )))
    }

    /// Marks all generations `gen <= gen_id` empty (§4.2 "empty_to").
    /// Never empties the last remaining generation — callers must call
    /// `new_backing` first if they intend to retire the current tail.
    pub async fn empty_to(&self, gen_id: u64, observer: &(dyn GenerationsObserver)) -> GwResult<()> {
        for attempt in 0..MAX_RETRIES {
            let (version, mut gens) = self.read_current().await?;
            for g in gens.iter_mut() {
                if g.gen_id <= gen_id {
                    g.empty = true;
                }
            }
            if gens.iter().all(|g| g.empty) {
                return Err(GwError::fatal("empty_to would leave no non-empty generation"));
            }
            let bytes = serde_json::to_vec(&Metadata { generations: gens.clone() }).map_err(GwError::fatal)?;

            match self
                .store
                .operate(&self.metadata_id, vec![Op::AssertVersion(version), Op::WriteFull(bytes)])
                .await
            {
                Ok(_) => {
                    *self.generations.write().unwrap() = gens.clone();
                    let new_tail = gens.iter().find(|g| !g.empty).map(|g| g.gen_id).unwrap_or(gen_id + 1);
                    let _ = self.store.notify(&self.metadata_id, new_tail.to_string().into_bytes()).await;
                    observer.handle_empty_to(new_tail).await;
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt + 1 < MAX_RETRIES => continue,
                Err(e) => return Err(e),
            }
        }
        Err(GwError::Canceled(format!(
            "{}: exhausted {MAX_RETRIES} retries in empty_to",
            self.metadata_id
        )))
    }

    /// Deletes the log shard objects of fully-empty leading generations
    /// and drops their metadata records (§4.2 "remove_empty").
    pub async fn remove_empty(&self) -> GwResult<()> {
        for attempt in 0..MAX_RETRIES {
            let (version, gens) = self.read_current().await?;
            let mut split_at = 0;
            for g in &gens {
                if g.empty {
                    split_at += 1;
                } else {
                    break;
                }
            }
            if split_at == 0 {
                return Ok(());
            }
            let (removable, remaining) = gens.split_at(split_at);
            for g in removable {
                let backend = self.backend_for(g.gen_id, g.log_type);
                for shard in 0..self.num_shards {
                    // Best-effort: a shard object that was never written
                    // simply isn't present.
                    let _ = backend.trim(shard, &backend.max_marker()).await;
                }
            }
            let remaining = remaining.to_vec();
            let bytes = serde_json::to_vec(&Metadata {
                generations: remaining.clone(),
            })
            .map_err(GwError::fatal)?;

            match self
                .store
                .operate(&self.metadata_id, vec![Op::AssertVersion(version), Op::WriteFull(bytes)])
                .await
            {
                Ok(_) => {
                    *self.generations.write().unwrap() = remaining;
                    debug!(removed = split_at, "pruned empty leading generations");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt + 1 < MAX_RETRIES => continue,
                Err(e) => return Err(e),
            }
        }
        Err(GwError::Canceled(format!(
            "{}: exhausted {MAX_RETRIES} retries in remove_empty",
            self.metadata_id
        )))
    }

    /// Re-establishes the watch on the metadata object and re-reads it on
    /// every notification, forwarding generation changes to `observer`
    /// (§4.2 "watch/notify errors ... trigger a re-read + re-watch
    /// loop"). Runs until the store tears the watch down permanently.
    pub async fn run_watch_loop(self: &Arc<Self>, observer: Arc<dyn GenerationsObserver>) {
        loop {
            let mut handle = match self.store.watch(&self.metadata_id).await {
                Ok(h) => h,
                Err(e) => {
                    warn!(error = %e, "failed to establish generations watch, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };
            while let Some(_notification) = handle.recv().await {
                match self.read_current().await {
                    Ok((_, gens)) => {
                        *self.generations.write().unwrap() = gens.clone();
                        let non_empty: Vec<_> = gens.iter().filter(|g| !g.empty).collect();
                        if let Some(tail) = non_empty.first() {
                            observer.handle_empty_to(tail.gen_id).await;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to re-read generations metadata after notify"),
                }
            }
            debug!("generations watch torn down, re-establishing");
        }
    }
}

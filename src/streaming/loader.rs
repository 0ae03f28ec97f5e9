//! Brick decoding on a worker pool
//!
//! Decode is the first half of a two-phase load. The render thread hands a
//! [`LoadTicket`] to the [`BrickLoader`], a worker decodes it into a
//! [`VoxelBuffer`], and the result travels back over a channel carrying
//! ownership of the buffer. Upload happens later on the render thread.

use crate::core::types::{BitDepth, BrickKey, Result, UVec3};
use crate::volume::buffer::VoxelBuffer;
use crate::volume::catalog::StateTag;
use crate::volume::pyramid::{PyramidDescriptor, SourceLocator};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

/// Turns a brick locator into voxels. Called on worker threads.
pub trait BrickDecoder: Send + Sync + 'static {
    fn decode(&self, key: BrickKey, locator: &SourceLocator) -> Result<VoxelBuffer>;
}

impl<F> BrickDecoder for F
where
    F: Fn(BrickKey, &SourceLocator) -> Result<VoxelBuffer> + Send + Sync + 'static,
{
    fn decode(&self, key: BrickKey, locator: &SourceLocator) -> Result<VoxelBuffer> {
        self(key, locator)
    }
}

/// Decoder slicing bricks out of in-memory level buffers
pub struct MemoryDecoder {
    levels: Vec<Arc<VoxelBuffer>>,
    desc: PyramidDescriptor,
}

impl MemoryDecoder {
    /// Build every level of `desc` from the full-resolution buffer by
    /// repeated 2x downsampling
    pub fn new(full: VoxelBuffer, desc: PyramidDescriptor) -> Self {
        let mut levels = Vec::with_capacity(desc.levels.len());
        let mut current = full;
        for l in 0..desc.levels.len() {
            if l > 0 {
                current = current.downsample_2x();
            }
            levels.push(Arc::new(current.clone()));
        }
        Self { levels, desc }
    }

    pub fn descriptor(&self) -> &PyramidDescriptor {
        &self.desc
    }
}

impl BrickDecoder for MemoryDecoder {
    fn decode(&self, key: BrickKey, locator: &SourceLocator) -> Result<VoxelBuffer> {
        let SourceLocator::Memory { origin } = locator else {
            return Err(crate::core::error::Error::BrickDecodeFailed {
                key,
                reason: "locator is not in memory".into(),
            });
        };
        let (Some(level), Some(dims), Some(spacing)) = (
            self.levels.get(key.level as usize),
            self.desc.brick_dims(key),
            self.desc.level_spacing(key.level),
        ) else {
            return Err(crate::core::error::Error::OutOfRangeKey(key));
        };
        let mut brick = level.copy_region(*origin, dims);
        brick.set_spacing(spacing);
        Ok(brick)
    }
}

/// One admitted load, shared between the render thread and a worker
#[derive(Clone, Debug)]
pub struct LoadTicket {
    pub key: BrickKey,
    pub generation: u64,
    pub locator: SourceLocator,
    /// Lower = start first
    pub priority: f32,
    pub expected_dims: UVec3,
    pub depth: BitDepth,
    pub(crate) tag: StateTag,
}

impl LoadTicket {
    /// The catalog still wants this exact load
    pub fn is_current(&self) -> bool {
        self.tag.is_current(self.generation)
    }
}

/// What a worker produced for a ticket
#[derive(Debug)]
pub enum LoadOutcome {
    Decoded(VoxelBuffer),
    /// The ticket was no longer wanted when the worker picked it up
    Cancelled,
    Failed(String),
}

/// Result of a brick decode
#[derive(Debug)]
pub struct LoadResult {
    pub key: BrickKey,
    pub generation: u64,
    pub outcome: LoadOutcome,
    /// Wall time spent decoding
    pub decode_ms: f32,
}

/// Decode one ticket and check the buffer against the expected layout.
///
/// Shared by the worker pool and callers that decode inline.
pub fn decode_ticket(decoder: &dyn BrickDecoder, ticket: &LoadTicket) -> LoadResult {
    let mut result = LoadResult {
        key: ticket.key,
        generation: ticket.generation,
        outcome: LoadOutcome::Cancelled,
        decode_ms: 0.0,
    };
    if !ticket.is_current() {
        log::trace!("{} skipped, no longer wanted", ticket.key);
        return result;
    }

    let start = Instant::now();
    let decoded = decoder.decode(ticket.key, &ticket.locator);
    result.decode_ms = start.elapsed().as_secs_f32() * 1000.0;

    result.outcome = match decoded {
        Ok(buffer) if buffer.dims() != ticket.expected_dims => LoadOutcome::Failed(format!(
            "short buffer: got {:?}, expected {:?}",
            buffer.dims(),
            ticket.expected_dims
        )),
        Ok(buffer) if buffer.depth() != ticket.depth => LoadOutcome::Failed(format!(
            "wrong bit depth: got {:?}, expected {:?}",
            buffer.depth(),
            ticket.depth
        )),
        Ok(buffer) => LoadOutcome::Decoded(buffer),
        Err(e) => LoadOutcome::Failed(e.to_string()),
    };
    result
}

/// Concurrent brick decoder with a dedicated tokio runtime
pub struct BrickLoader {
    /// Channel for sending tickets to the worker loop
    request_tx: mpsc::UnboundedSender<LoadTicket>,
    /// Channel for receiving decode results
    result_rx: mpsc::UnboundedReceiver<LoadResult>,
    /// Tickets submitted and not yet returned, by key
    pending: HashMap<BrickKey, u64>,
    runtime: Option<Runtime>,
}

impl BrickLoader {
    /// Create a loader
    ///
    /// # Arguments
    /// * `decoder` - Reader collaborator called on worker threads
    /// * `max_concurrent` - Maximum number of decodes in flight
    pub fn new(decoder: Arc<dyn BrickDecoder>, max_concurrent: usize) -> Result<Self> {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<LoadTicket>();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<LoadResult>();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_concurrent.max(1))
            .thread_name("brick-decode")
            .enable_all()
            .build()?;

        let max_concurrent = max_concurrent.max(1);
        runtime.spawn(async move {
            Self::worker_loop(decoder, max_concurrent, &mut request_rx, result_tx).await;
        });

        Ok(Self {
            request_tx,
            result_rx,
            pending: HashMap::new(),
            runtime: Some(runtime),
        })
    }

    /// Worker loop that runs decodes with concurrency control
    async fn worker_loop(
        decoder: Arc<dyn BrickDecoder>,
        max_concurrent: usize,
        request_rx: &mut mpsc::UnboundedReceiver<LoadTicket>,
        result_tx: mpsc::UnboundedSender<LoadResult>,
    ) {
        use tokio::task::JoinSet;

        let mut active_tasks = JoinSet::new();
        let mut queued: Vec<LoadTicket> = Vec::new();

        loop {
            tokio::select! {
                Some(ticket) = request_rx.recv() => {
                    queued.push(ticket);
                }

                Some(joined) = active_tasks.join_next(), if !active_tasks.is_empty() => {
                    match joined {
                        Ok(result) => {
                            if result_tx.send(result).is_err() {
                                log::debug!("Brick loader result channel closed");
                                break;
                            }
                        }
                        Err(e) => {
                            log::error!("Brick decode task panicked: {}", e);
                        }
                    }
                }

                else => {
                    if queued.is_empty() && active_tasks.is_empty() {
                        break;
                    }
                }
            }

            while active_tasks.len() < max_concurrent && !queued.is_empty() {
                // Most urgent (lowest value) last so pop is O(1)
                queued.sort_by(|a, b| b.priority.total_cmp(&a.priority));
                let Some(ticket) = queued.pop() else { break };
                let decoder = Arc::clone(&decoder);
                active_tasks.spawn(async move {
                    let key = ticket.key;
                    let generation = ticket.generation;
                    tokio::task::spawn_blocking(move || decode_ticket(decoder.as_ref(), &ticket))
                        .await
                        .unwrap_or_else(|e| LoadResult {
                            key,
                            generation,
                            outcome: LoadOutcome::Failed(format!("decode task failed: {e}")),
                            decode_ms: 0.0,
                        })
                });
            }
        }
    }

    /// Queue a ticket for decoding
    ///
    /// Returns `false` if this exact load is already pending or the worker
    /// has shut down.
    pub fn submit(&mut self, ticket: LoadTicket) -> bool {
        if self.pending.get(&ticket.key) == Some(&ticket.generation) {
            return false;
        }
        let (key, generation) = (ticket.key, ticket.generation);
        if self.request_tx.send(ticket).is_err() {
            log::error!("Brick loader worker is gone, dropping {}", key);
            return false;
        }
        self.pending.insert(key, generation);
        true
    }

    /// Poll for completed decodes (non-blocking)
    pub fn poll_results(&mut self) -> Vec<LoadResult> {
        let mut results = Vec::new();
        while let Ok(result) = self.result_rx.try_recv() {
            if self.pending.get(&result.key) == Some(&result.generation) {
                self.pending.remove(&result.key);
            }
            results.push(result);
        }
        results
    }

    /// Block until `count` results arrived or `timeout` elapsed
    pub fn wait_for_results(&mut self, count: usize, timeout: Duration) -> Vec<LoadResult> {
        let deadline = Instant::now() + timeout;
        let mut results = self.poll_results();
        while results.len() < count && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
            results.extend(self.poll_results());
        }
        results
    }

    /// Get the number of pending decodes
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, key: BrickKey) -> bool {
        self.pending.contains_key(&key)
    }

    /// Forget a pending decode (best effort)
    ///
    /// A decode already running is not interrupted; its result still
    /// arrives and is discarded by the resident set.
    pub fn cancel(&mut self, key: BrickKey) {
        self.pending.remove(&key);
    }
}

impl Drop for BrickLoader {
    fn drop(&mut self) {
        // Running decodes are left to finish on their own threads
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use render_buffers::RenderBuffer;
use render_model::TileRect;
use trace_protocol::{
    CancelToken, DeviceKind, QueueId, RenderOutcome, RenderStatistics, ShadingCallable, WorkTile,
};

use crate::{
    CompletionSender, DeviceWorkQueue, ShadeLayout, SubmitError, TileAssignment, TileCompletion,
    active_pixel_count, shade_region,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuQueueConfig {
    /// Worker lanes in the pool; each lane carries its own shading
    /// context.
    pub lanes: usize,
    /// Rows per dispatched chunk. Also the cancellation polling
    /// granularity: coarser chunks mean less dispatch overhead and slower
    /// cancellation latency.
    pub rows_per_chunk: u32,
}

impl Default for CpuQueueConfig {
    fn default() -> Self {
        Self {
            lanes: 4,
            rows_per_chunk: 2,
        }
    }
}

struct ChunkJob {
    rect: TileRect,
    start_sample: u32,
    num_samples: u32,
    layout: ShadeLayout,
    /// Whole-tile activity mask; this chunk's pixels start at
    /// `mask_offset`.
    active: Option<Arc<[bool]>>,
    mask_offset: usize,
    cancel: CancelToken,
    result_sender: Sender<ChunkResult>,
}

struct ChunkResult {
    rect: TileRect,
    contributions: Vec<f32>,
    pixel_samples: u64,
    /// False when the lane saw the cancel token and skipped the chunk.
    shaded: bool,
}

/// CPU work queue: a persistent pool of worker lanes fed row chunks of
/// one tile at a time. Lanes accumulate into chunk-local scratch; the
/// dispatcher write-combines finished chunks into the tile buffer, so the
/// shared buffer sees one bulk add per chunk.
pub struct CpuWorkQueue {
    queue_id: QueueId,
    assignment_sender: Option<Sender<TileAssignment>>,
    in_flight: Arc<AtomicUsize>,
    dispatcher: Option<JoinHandle<()>>,
    lanes: Vec<JoinHandle<()>>,
}

impl CpuWorkQueue {
    pub fn spawn<S>(
        queue_id: QueueId,
        config: CpuQueueConfig,
        callable: Arc<S>,
        cancel: CancelToken,
        completions: CompletionSender,
    ) -> Self
    where
        S: ShadingCallable + 'static,
    {
        if config.lanes == 0 || config.rows_per_chunk == 0 {
            panic!(
                "invalid cpu queue config: lanes ({}) and rows_per_chunk ({}) must be positive",
                config.lanes, config.rows_per_chunk
            );
        }

        let (chunk_sender, chunk_receiver) = unbounded::<ChunkJob>();
        let mut lanes = Vec::with_capacity(config.lanes);
        for lane_index in 0..config.lanes {
            let receiver = chunk_receiver.clone();
            let lane_callable = callable.clone();
            lanes.push(std::thread::spawn(move || {
                lane_worker(lane_index, lane_callable, receiver);
            }));
        }
        drop(chunk_receiver);

        // Depth one: the dispatcher processes a single tile at a time and
        // submit reports full until its completion notice is sent.
        let (assignment_sender, assignment_receiver) = bounded::<TileAssignment>(1);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let dispatcher_in_flight = in_flight.clone();
        let dispatcher = std::thread::spawn(move || {
            dispatcher_worker(
                queue_id,
                config,
                assignment_receiver,
                chunk_sender,
                cancel,
                completions,
                dispatcher_in_flight,
            );
        });

        Self {
            queue_id,
            assignment_sender: Some(assignment_sender),
            in_flight,
            dispatcher: Some(dispatcher),
            lanes,
        }
    }
}

impl DeviceWorkQueue for CpuWorkQueue {
    fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn has_capacity(&self) -> bool {
        self.in_flight() == 0
    }

    fn submit(&mut self, assignment: TileAssignment) -> Result<(), SubmitError> {
        if !self.has_capacity() {
            return Err(SubmitError::QueueFull {
                queue_id: self.queue_id,
            });
        }
        let Some(sender) = &self.assignment_sender else {
            return Err(SubmitError::QueueShutDown {
                queue_id: self.queue_id,
            });
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if sender.send(assignment).is_err() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(SubmitError::QueueShutDown {
                queue_id: self.queue_id,
            });
        }
        Ok(())
    }
}

impl Drop for CpuWorkQueue {
    fn drop(&mut self) {
        self.assignment_sender.take();
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                log::error!("{} dispatcher panicked during shutdown", self.queue_id);
            }
        }
        for lane in self.lanes.drain(..) {
            if lane.join().is_err() {
                log::error!("{} lane panicked during shutdown", self.queue_id);
            }
        }
    }
}

fn lane_worker<S: ShadingCallable>(
    lane_index: usize,
    callable: Arc<S>,
    jobs: Receiver<ChunkJob>,
) {
    let mut context = callable.create_lane_context(lane_index);
    while let Ok(job) = jobs.recv() {
        // Chunk-granular cancellation: every queued chunk passes through
        // this check before any shading happens.
        if job.cancel.is_cancelled() {
            let _ = job.result_sender.send(ChunkResult {
                rect: job.rect,
                contributions: Vec::new(),
                pixel_samples: 0,
                shaded: false,
            });
            continue;
        }
        let active = job
            .active
            .as_deref()
            .map(|mask| &mask[job.mask_offset..job.mask_offset + job.rect.pixel_count()]);
        let contributions = shade_region(
            callable.as_ref(),
            &mut context,
            job.rect,
            job.start_sample,
            job.num_samples,
            job.layout,
            active,
        );
        let result = ChunkResult {
            rect: job.rect,
            contributions,
            pixel_samples: active_pixel_count(job.rect, active) as u64 * job.num_samples as u64,
            shaded: true,
        };
        // A dropped dispatcher means shutdown mid-tile; nothing to do.
        let _ = job.result_sender.send(result);
    }
}

fn split_rows(rect: TileRect, rows_per_chunk: u32) -> Vec<TileRect> {
    let mut chunks = Vec::with_capacity(rect.height.div_ceil(rows_per_chunk) as usize);
    let mut y = rect.y;
    while y < rect.bottom() {
        let height = rows_per_chunk.min(rect.bottom() - y);
        chunks.push(TileRect {
            x: rect.x,
            y,
            width: rect.width,
            height,
        });
        y += height;
    }
    chunks
}

fn dispatcher_worker(
    queue_id: QueueId,
    config: CpuQueueConfig,
    assignments: Receiver<TileAssignment>,
    chunk_sender: Sender<ChunkJob>,
    cancel: CancelToken,
    completions: CompletionSender,
    in_flight: Arc<AtomicUsize>,
) {
    while let Ok(assignment) = assignments.recv() {
        let TileAssignment {
            work,
            mut buffer,
            active,
        } = assignment;
        let layout = ShadeLayout::from_pass_layout(buffer.layout());
        let chunks = split_rows(work.rect, config.rows_per_chunk);

        let (result_sender, result_receiver) = bounded(chunks.len());
        let mut dispatched = 0;
        for chunk in &chunks {
            // The lanes re-check the token per chunk; skipping the
            // remaining dispatches here just saves queue traffic.
            if cancel.is_cancelled() {
                break;
            }
            let job = ChunkJob {
                rect: *chunk,
                start_sample: work.start_sample,
                num_samples: work.num_samples,
                layout,
                active: active.clone(),
                mask_offset: (chunk.y - work.rect.y) as usize * work.rect.width as usize,
                cancel: cancel.clone(),
                result_sender: result_sender.clone(),
            };
            if chunk_sender.send(job).is_err() {
                log::error!("{queue_id} lane pool disconnected mid-tile");
                break;
            }
            dispatched += 1;
        }
        drop(result_sender);

        let mut shaded = Vec::with_capacity(dispatched);
        for _ in 0..dispatched {
            let Ok(result) = result_receiver.recv() else {
                break;
            };
            if result.shaded {
                shaded.push(result);
            }
        }

        let statistics = if shaded.len() == chunks.len() {
            finish_batch(queue_id, &work, &mut buffer, active.as_deref(), shaded)
        } else {
            // The sample counter is uniform per tile, so a batch that was
            // only partly shaded is dropped whole: counting it would
            // permanently under-weight the rows that never ran.
            RenderStatistics {
                queue_id,
                device_kind: DeviceKind::Cpu,
                outcome: RenderOutcome::Cancelled,
                pixel_samples_rendered: 0,
                samples_accumulated: 0,
            }
        };

        in_flight.fetch_sub(1, Ordering::AcqRel);
        let notice = TileCompletion {
            work,
            buffer,
            statistics,
        };
        if completions.send(notice).is_err() {
            // Scheduler went away; stop accepting work.
            return;
        }
    }
}

/// Fold a fully shaded batch into the tile buffer and build its
/// statistics. Pixels the mask skipped are rescaled so the counter
/// advance leaves their normalized values unchanged.
fn finish_batch(
    queue_id: QueueId,
    work: &WorkTile,
    buffer: &mut RenderBuffer,
    active: Option<&[bool]>,
    shaded: Vec<ChunkResult>,
) -> RenderStatistics {
    let mut pixel_samples = 0u64;
    for result in &shaded {
        if buffer.accumulate(result.rect, &result.contributions).is_err() {
            return RenderStatistics {
                queue_id,
                device_kind: DeviceKind::Cpu,
                outcome: RenderOutcome::LaunchFailed {
                    message: format!("{queue_id} chunk write-combine rejected by buffer"),
                },
                pixel_samples_rendered: 0,
                samples_accumulated: 0,
            };
        }
        pixel_samples += result.pixel_samples;
    }
    if let Some(mask) = active {
        let before = buffer.samples_rendered();
        if before > 0 {
            let factor = (before + work.num_samples) as f32 / before as f32;
            if buffer.scale_inactive(work.rect, mask, factor).is_err() {
                log::error!("{queue_id} skipped-pixel rescale rejected for {}", work.tile_id);
            }
        }
    }
    buffer.advance_samples(work.num_samples);
    RenderStatistics {
        queue_id,
        device_kind: DeviceKind::Cpu,
        outcome: RenderOutcome::Completed,
        pixel_samples_rendered: pixel_samples,
        samples_accumulated: work.num_samples,
    }
}

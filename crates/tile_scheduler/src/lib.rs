//! Tile ownership, work distribution, and progressive refinement.
//!
//! The scheduler partitions the frame into tiles, hands each tile's
//! render buffer to exactly one device queue at a time, and folds
//! completion notices back into convergence state and display updates.
//! Buffer ownership moves with the assignment and returns with the
//! completion, so there is never a second writer to exclude.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use convergence::{ConvergenceConfig, ConvergenceError, ConvergenceTracker};
use device_queue::{
    CompletionReceiver, DeviceWorkQueue, SubmitError, TileAssignment, TileCompletion,
};
use output_sink::BufferPassReader;
use render_buffers::{COMBINED_PASS, RegionError, RenderBuffer};
use render_model::{FrameDimensions, FramePartitionError, PassLayout, TileRect, partition_frame};
use trace_protocol::{
    CancelToken, DeviceKind, DisplayTarget, OutputSink, RenderOutcome, TileDescriptor, TileId,
    TilePixels, WorkTile,
};

mod session;
pub use session::{RenderSession, SessionConfig, SessionReport};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// Upper bound on tile edge lengths; edge tiles may be smaller.
    pub tile_limit_x: u32,
    pub tile_limit_y: u32,
    /// Relative-error threshold for adaptive sampling. Zero keeps every
    /// pixel active for the whole session.
    pub noise_threshold: f32,
    pub convergence: ConvergenceConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tile_limit_x: 64,
            tile_limit_y: 64,
            noise_threshold: 0.01,
            convergence: ConvergenceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Pending,
    Assigned,
    Accumulating,
    ReadyForDisplay,
    Done,
}

#[derive(Debug)]
struct TileSlot {
    rect: TileRect,
    state: TileState,
    /// `None` exactly while a device queue owns the buffer.
    buffer: Option<RenderBuffer>,
    start_sample: u32,
    affinity: Option<DeviceKind>,
}

impl TileSlot {
    fn new(rect: TileRect, layout: &PassLayout) -> Self {
        Self {
            rect,
            state: TileState::Pending,
            buffer: Some(RenderBuffer::new(rect, layout.clone())),
            start_sample: 0,
            affinity: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerError {
    Partition(FramePartitionError),
    Buffer(RegionError),
    Convergence(ConvergenceError),
    Submit(SubmitError),
    NoQueues,
    /// A tile render failed with no CPU queue left to retry it on.
    TileFailed { tile: TileId, message: String },
    /// A queue dropped its completion sender while work was outstanding.
    CompletionChannelClosed,
    UnknownTile { tile: TileId },
    /// The tile's buffer is out with a device queue.
    TileInFlight { tile: TileId },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::Partition(error) => write!(f, "frame partition failed: {error}"),
            SchedulerError::Buffer(error) => write!(f, "buffer operation failed: {error}"),
            SchedulerError::Convergence(error) => write!(f, "convergence update failed: {error}"),
            SchedulerError::Submit(error) => write!(f, "tile submission failed: {error}"),
            SchedulerError::NoQueues => write!(f, "scheduler constructed without device queues"),
            SchedulerError::TileFailed { tile, message } => {
                write!(f, "{tile} failed with no cpu fallback: {message}")
            }
            SchedulerError::CompletionChannelClosed => {
                write!(f, "completion channel closed with work outstanding")
            }
            SchedulerError::UnknownTile { tile } => write!(f, "completion for unknown {tile}"),
            SchedulerError::TileInFlight { tile } => {
                write!(f, "{tile} buffer is held by a device queue")
            }
        }
    }
}

impl From<FramePartitionError> for SchedulerError {
    fn from(error: FramePartitionError) -> Self {
        SchedulerError::Partition(error)
    }
}

impl From<RegionError> for SchedulerError {
    fn from(error: RegionError) -> Self {
        SchedulerError::Buffer(error)
    }
}

impl From<ConvergenceError> for SchedulerError {
    fn from(error: ConvergenceError) -> Self {
        SchedulerError::Convergence(error)
    }
}

/// Counters for one `render_pass` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub tiles_scheduled: usize,
    pub tiles_completed: usize,
    pub tiles_cancelled: usize,
    /// Accelerator launch failures re-pended onto a CPU queue.
    pub tiles_retried: usize,
    pub pixel_samples_rendered: u64,
}

pub struct TileScheduler {
    frame: FrameDimensions,
    layout: PassLayout,
    config: SchedulerConfig,
    tiles: Vec<TileSlot>,
    tracker: ConvergenceTracker,
    queues: Vec<Box<dyn DeviceWorkQueue>>,
    completions: CompletionReceiver,
    cancel: CancelToken,
    round_robin_cursor: usize,
}

impl TileScheduler {
    pub fn new(
        frame: FrameDimensions,
        layout: PassLayout,
        config: SchedulerConfig,
        queues: Vec<Box<dyn DeviceWorkQueue>>,
        completions: CompletionReceiver,
        cancel: CancelToken,
    ) -> Result<Self, SchedulerError> {
        if queues.is_empty() {
            return Err(SchedulerError::NoQueues);
        }
        let rects = partition_frame(frame, config.tile_limit_x, config.tile_limit_y)?;
        let tiles = rects
            .into_iter()
            .map(|rect| TileSlot::new(rect, &layout))
            .collect();
        let tracker = ConvergenceTracker::new(frame, config.convergence);
        Ok(Self {
            frame,
            layout,
            config,
            tiles,
            tracker,
            queues,
            completions,
            cancel,
            round_robin_cursor: 0,
        })
    }

    pub fn frame(&self) -> FrameDimensions {
        self.frame
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn tile_rect(&self, tile_id: TileId) -> Option<TileRect> {
        self.tiles.get(tile_id.0 as usize).map(|slot| slot.rect)
    }

    pub fn tile_state(&self, tile_id: TileId) -> Option<TileState> {
        self.tiles.get(tile_id.0 as usize).map(|slot| slot.state)
    }

    /// Samples accumulated so far for one tile, or `None` while its
    /// buffer is out with a queue.
    pub fn tile_samples(&self, tile_id: TileId) -> Option<u32> {
        self.tiles
            .get(tile_id.0 as usize)
            .and_then(|slot| slot.buffer.as_ref())
            .map(RenderBuffer::samples_rendered)
    }

    pub fn is_complete(&self) -> bool {
        self.tiles.iter().all(|slot| slot.state == TileState::Done)
    }

    pub fn converged_pixels(&self) -> usize {
        self.tracker.converged_count()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Offer every tile to the output sink for auxiliary pass injection.
    /// Must run before the first `render_pass`; injected passes overwrite
    /// buffer contents, so accumulation must not have started.
    pub fn inject_auxiliary(&mut self, sink: &mut dyn OutputSink) -> Result<(), SchedulerError> {
        for index in 0..self.tiles.len() {
            let descriptor = self.descriptor(index);
            let Some(injection) = sink.read_tile(&descriptor) else {
                continue;
            };
            let slot = &mut self.tiles[index];
            let buffer = slot
                .buffer
                .as_mut()
                .ok_or(SchedulerError::TileInFlight { tile: descriptor.tile_id })?;
            match buffer.inject_pass(slot.rect, &injection.pass_name, &injection.pixels) {
                Ok(()) => {}
                Err(RegionError::PassNotFound { name }) => {
                    log::warn!("skipping injection for {}: pass {name:?} not in layout", descriptor.tile_id);
                }
                Err(error) => return Err(SchedulerError::Buffer(error)),
            }
        }
        Ok(())
    }

    /// Render `num_samples` more samples for every tile that still has
    /// active pixels; converged pixels inside an active tile are masked
    /// out of the batch. Blocks until all issued assignments complete,
    /// then returns; a cancelled batch is dropped whole, so every buffer
    /// holds only fully accumulated batches.
    pub fn render_pass(
        &mut self,
        num_samples: u32,
        display: &mut dyn DisplayTarget,
    ) -> Result<PassReport, SchedulerError> {
        let mut report = PassReport::default();
        if num_samples == 0 {
            return Ok(report);
        }

        let mut pending = VecDeque::new();
        for index in 0..self.tiles.len() {
            let slot = &mut self.tiles[index];
            debug_assert!(
                matches!(slot.state, TileState::Pending | TileState::Done),
                "tile in transient state between passes"
            );
            if slot.state == TileState::Done {
                continue;
            }
            if !self.tracker.tile_has_active(slot.rect)? {
                slot.state = TileState::Done;
                continue;
            }
            pending.push_back(TileId(index as u32));
        }

        let mut outstanding = 0usize;
        loop {
            self.assign_pending(&mut pending, num_samples, &mut outstanding, &mut report)?;
            if outstanding == 0 {
                break;
            }
            let notice = self
                .completions
                .recv()
                .map_err(|_| SchedulerError::CompletionChannelClosed)?;
            outstanding -= 1;
            self.handle_completion(notice, display, &mut pending, &mut report)?;
        }
        Ok(report)
    }

    /// Re-evaluate one tile's pixels against an explicit threshold,
    /// outside the per-pass filtering. `reset` reactivates the tile's
    /// pixels first (threshold change, tile edit).
    pub fn filter_tile(
        &mut self,
        tile_id: TileId,
        threshold: f32,
        reset: bool,
    ) -> Result<usize, SchedulerError> {
        let index = tile_id.0 as usize;
        let slot = self
            .tiles
            .get(index)
            .ok_or(SchedulerError::UnknownTile { tile: tile_id })?;
        let rect = slot.rect;
        let buffer = slot
            .buffer
            .as_ref()
            .ok_or(SchedulerError::TileInFlight { tile: tile_id })?;
        let active = self.tracker.filter_converged(buffer, rect, threshold, reset)?;
        let slot = &mut self.tiles[index];
        slot.state = if active == 0 {
            TileState::Done
        } else {
            TileState::Pending
        };
        Ok(active)
    }

    /// Hand every tile's resolved passes to the output sink.
    pub fn write_output(&self, sink: &mut dyn OutputSink) {
        for index in 0..self.tiles.len() {
            let Some(buffer) = self.tiles[index].buffer.as_ref() else {
                log::warn!("skipping output for tile {index}: buffer in flight");
                continue;
            };
            let descriptor = self.descriptor(index);
            sink.write_tile(&descriptor, &BufferPassReader::new(buffer));
        }
    }

    /// Drop all progress and re-partition for a new frame size. Queues
    /// are kept; convergence state and buffers start from scratch.
    pub fn restart(&mut self, frame: FrameDimensions) -> Result<(), SchedulerError> {
        let rects = partition_frame(frame, self.config.tile_limit_x, self.config.tile_limit_y)?;
        self.frame = frame;
        self.tiles = rects
            .into_iter()
            .map(|rect| TileSlot::new(rect, &self.layout))
            .collect();
        self.tracker = ConvergenceTracker::new(frame, self.config.convergence);
        self.round_robin_cursor = 0;
        Ok(())
    }

    fn descriptor(&self, index: usize) -> TileDescriptor {
        let slot = &self.tiles[index];
        TileDescriptor {
            tile_id: TileId(index as u32),
            rect: slot.rect,
            samples_rendered: slot
                .buffer
                .as_ref()
                .map(RenderBuffer::samples_rendered)
                .unwrap_or(slot.start_sample),
        }
    }

    fn has_cpu_queue(&self) -> bool {
        self.queues
            .iter()
            .any(|queue| queue.device_kind() == DeviceKind::Cpu)
    }

    /// Round-robin pick of an idle queue compatible with `affinity`.
    fn find_idle_queue(&mut self, affinity: Option<DeviceKind>) -> Option<usize> {
        let count = self.queues.len();
        for offset in 0..count {
            let index = (self.round_robin_cursor + offset) % count;
            let queue = &self.queues[index];
            if !queue.has_capacity() {
                continue;
            }
            if let Some(kind) = affinity {
                if queue.device_kind() != kind {
                    continue;
                }
            }
            self.round_robin_cursor = (index + 1) % count;
            return Some(index);
        }
        None
    }

    fn assign_pending(
        &mut self,
        pending: &mut VecDeque<TileId>,
        num_samples: u32,
        outstanding: &mut usize,
        report: &mut PassReport,
    ) -> Result<(), SchedulerError> {
        let mut position = 0;
        while position < pending.len() {
            // Issue nothing new once cancellation is requested; in-flight
            // tiles drain through the completion channel.
            if self.cancel.is_cancelled() {
                break;
            }
            if !self.queues.iter().any(|queue| queue.has_capacity()) {
                break;
            }
            let tile_id = pending[position];
            let index = tile_id.0 as usize;
            let (rect, start_sample, affinity) = {
                let slot = &self.tiles[index];
                (slot.rect, slot.start_sample, slot.affinity)
            };
            let Some(queue_index) = self.find_idle_queue(affinity) else {
                // Affinity-bound tile with no matching idle queue; let
                // unconstrained tiles behind it proceed.
                position += 1;
                continue;
            };
            pending.remove(position);
            // Tiles with a converged subset carry a mask so those pixels
            // receive no further samples.
            let active = self.tracker.tile_active_mask(rect)?.map(Arc::<[bool]>::from);
            let slot = &mut self.tiles[index];
            slot.state = TileState::Assigned;
            let buffer = slot
                .buffer
                .take()
                .expect("pending tile owns its buffer");
            let work = WorkTile {
                tile_id,
                rect,
                start_sample,
                num_samples,
                device_affinity: affinity,
            };
            match self.queues[queue_index].submit(TileAssignment {
                work,
                buffer,
                active,
            }) {
                Ok(()) => {
                    self.tiles[index].state = TileState::Accumulating;
                    *outstanding += 1;
                    report.tiles_scheduled += 1;
                    log::debug!(
                        "{tile_id} -> {} ({} samples from {start_sample})",
                        self.queues[queue_index].queue_id(),
                        num_samples
                    );
                }
                Err(error) => return Err(SchedulerError::Submit(error)),
            }
        }
        Ok(())
    }

    fn handle_completion(
        &mut self,
        notice: TileCompletion,
        display: &mut dyn DisplayTarget,
        pending: &mut VecDeque<TileId>,
        report: &mut PassReport,
    ) -> Result<(), SchedulerError> {
        let TileCompletion {
            work,
            mut buffer,
            statistics,
        } = notice;
        let index = work.tile_id.0 as usize;
        if index >= self.tiles.len() {
            return Err(SchedulerError::UnknownTile { tile: work.tile_id });
        }
        debug_assert_eq!(self.tiles[index].rect, work.rect);
        report.pixel_samples_rendered += statistics.pixel_samples_rendered;

        match statistics.outcome {
            RenderOutcome::Completed => {
                self.tiles[index].state = TileState::ReadyForDisplay;
                // No queue holds the buffer anymore, but the mark still
                // documents the read phase and trips on double handling.
                buffer.mark_finalizing(work.rect)?;
                let active = self.tracker.filter_converged(
                    &buffer,
                    work.rect,
                    self.config.noise_threshold,
                    false,
                )?;
                Self::push_display(&buffer, work.rect, display);
                buffer.clear_finalizing(work.rect);

                let slot = &mut self.tiles[index];
                slot.start_sample += statistics.samples_accumulated;
                slot.affinity = None;
                slot.buffer = Some(buffer);
                slot.state = if active == 0 {
                    TileState::Done
                } else {
                    TileState::Pending
                };
                report.tiles_completed += 1;
            }
            RenderOutcome::Cancelled => {
                // The queues drop cancelled batches whole; the buffer
                // still holds every earlier batch unchanged, so there is
                // nothing new to display or count.
                let slot = &mut self.tiles[index];
                slot.buffer = Some(buffer);
                slot.state = TileState::Pending;
                report.tiles_cancelled += 1;
            }
            RenderOutcome::LaunchFailed { message } => {
                let slot = &mut self.tiles[index];
                slot.buffer = Some(buffer);
                slot.state = TileState::Pending;
                let retryable = statistics.device_kind == DeviceKind::Accelerator
                    && self.has_cpu_queue();
                if !retryable {
                    return Err(SchedulerError::TileFailed {
                        tile: work.tile_id,
                        message,
                    });
                }
                log::warn!(
                    "{} launch failed for {}, retrying on cpu: {message}",
                    statistics.queue_id,
                    work.tile_id
                );
                self.tiles[index].affinity = Some(DeviceKind::Cpu);
                pending.push_back(work.tile_id);
                report.tiles_retried += 1;
            }
        }
        Ok(())
    }

    /// Push the tile's resolved combined pass to the display. Display is
    /// best-effort; a missing combined pass is logged and skipped.
    fn push_display(buffer: &RenderBuffer, rect: TileRect, display: &mut dyn DisplayTarget) {
        match buffer.copy_out(rect, COMBINED_PASS) {
            Ok(mut pixels) => {
                let samples = buffer.samples_rendered().max(1) as f32;
                for value in &mut pixels {
                    *value /= samples;
                }
                let channels = buffer
                    .layout()
                    .find_pass(COMBINED_PASS)
                    .map(|pass| pass.channels)
                    .unwrap_or(0);
                display.update_tile(&TilePixels::host(rect, channels, pixels));
            }
            Err(error) => {
                log::warn!("display update skipped for {rect:?}: {error}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use device_queue::testing::{
        AlternatingShader, CheckerShader, HalfNoisyShader, RejectingLauncher, test_pass_layout,
    };
    use device_queue::{
        AcceleratorQueueConfig, AcceleratorWorkQueue, CompletionSender, CpuQueueConfig,
        CpuWorkQueue, ShadeLayout, completion_channel, shade_region,
    };
    use trace_protocol::{QueueId, RenderStatistics, ShadingCallable};

    #[derive(Default)]
    struct CollectingDisplay {
        updates: Vec<TilePixels>,
    }

    impl DisplayTarget for CollectingDisplay {
        fn update_tile(&mut self, pixels: &TilePixels) {
            self.updates.push(pixels.clone());
        }
    }

    fn cpu_queues<S: ShadingCallable + 'static>(
        count: u32,
        callable: Arc<S>,
        cancel: &CancelToken,
        completions: &CompletionSender,
    ) -> Vec<Box<dyn DeviceWorkQueue>> {
        (0..count)
            .map(|index| {
                Box::new(CpuWorkQueue::spawn(
                    QueueId(index),
                    CpuQueueConfig::default(),
                    callable.clone(),
                    cancel.clone(),
                    completions.clone(),
                )) as Box<dyn DeviceWorkQueue>
            })
            .collect()
    }

    fn config(noise_threshold: f32, min_samples: u32) -> SchedulerConfig {
        SchedulerConfig {
            tile_limit_x: 16,
            tile_limit_y: 16,
            noise_threshold,
            convergence: ConvergenceConfig { min_samples },
        }
    }

    #[test]
    fn one_pass_renders_every_tile_and_reassembles_the_frame() {
        let frame = FrameDimensions::new(64, 64);
        let cancel = CancelToken::new();
        let (sender, receiver) = completion_channel();
        let queues = cpu_queues(4, Arc::new(CheckerShader), &cancel, &sender);
        let mut scheduler = TileScheduler::new(
            frame,
            test_pass_layout(),
            config(0.0, 8),
            queues,
            receiver,
            cancel,
        )
        .expect("build scheduler");
        assert_eq!(scheduler.tile_count(), 16);

        let mut display = CollectingDisplay::default();
        let report = scheduler
            .render_pass(4, &mut display)
            .expect("render one pass");

        assert_eq!(report.tiles_scheduled, 16);
        assert_eq!(report.tiles_completed, 16);
        assert_eq!(report.tiles_cancelled, 0);
        assert_eq!(report.pixel_samples_rendered, 64 * 64 * 4);
        for index in 0..scheduler.tile_count() {
            assert_eq!(scheduler.tile_samples(TileId(index as u32)), Some(4));
            assert_eq!(scheduler.tile_state(TileId(index as u32)), Some(TileState::Pending));
        }

        // One display update per tile, rects disjoint, values normalized.
        assert_eq!(display.updates.len(), 16);
        for (index, update) in display.updates.iter().enumerate() {
            for other in &display.updates[index + 1..] {
                assert!(!update.rect.overlaps(other.rect));
            }
            let expected = CheckerShader::pixel_value(update.rect.x, update.rect.y);
            assert!((update.pixels[0] - expected).abs() < 1e-5);
        }

        let mut sink = output_sink::MemoryOutputSink::new(
            frame,
            vec![(COMBINED_PASS.to_string(), 3)],
        );
        scheduler.write_output(&mut sink);
        assert_eq!(sink.tiles_written(), 16);
        let plane = sink.pass_plane(COMBINED_PASS).expect("combined plane");
        for y in [0u32, 17, 40, 63] {
            for x in [0u32, 5, 31, 63] {
                let base = (y as usize * 64 + x as usize) * 3;
                let expected = CheckerShader::pixel_value(x, y);
                assert!(
                    (plane[base] - expected).abs() < 1e-5,
                    "pixel ({x},{y}): {} vs {expected}",
                    plane[base]
                );
            }
        }
    }

    #[test]
    fn generous_threshold_converges_all_tiles_in_one_pass() {
        let frame = FrameDimensions::new(32, 32);
        let cancel = CancelToken::new();
        let (sender, receiver) = completion_channel();
        let queues = cpu_queues(2, Arc::new(AlternatingShader), &cancel, &sender);
        let mut scheduler = TileScheduler::new(
            frame,
            test_pass_layout(),
            config(1.0, 4),
            queues,
            receiver,
            cancel,
        )
        .expect("build scheduler");

        let mut display = CollectingDisplay::default();
        // Alternating 0.9/0.1 samples give a relative error around 0.46,
        // inside the generous threshold once the sample floor is met.
        let report = scheduler
            .render_pass(4, &mut display)
            .expect("render one pass");
        assert_eq!(report.tiles_completed, 4);
        assert!(scheduler.is_complete());
        assert_eq!(scheduler.converged_pixels(), frame.pixel_count());

        let report = scheduler
            .render_pass(4, &mut display)
            .expect("pass over converged frame");
        assert_eq!(report.tiles_scheduled, 0);
    }

    #[test]
    fn tight_threshold_keeps_noisy_tiles_active_until_refiltered() {
        let frame = FrameDimensions::new(32, 32);
        let cancel = CancelToken::new();
        let (sender, receiver) = completion_channel();
        let queues = cpu_queues(2, Arc::new(AlternatingShader), &cancel, &sender);
        let mut scheduler = TileScheduler::new(
            frame,
            test_pass_layout(),
            config(1e-4, 4),
            queues,
            receiver,
            cancel,
        )
        .expect("build scheduler");

        let mut display = CollectingDisplay::default();
        scheduler
            .render_pass(4, &mut display)
            .expect("render one pass");
        assert_eq!(scheduler.converged_pixels(), 0);
        assert!(!scheduler.is_complete());

        // Relaxing the threshold out of band retires the tiles without
        // another accumulation batch.
        for index in 0..scheduler.tile_count() {
            let active = scheduler
                .filter_tile(TileId(index as u32), f32::INFINITY, false)
                .expect("refilter tile");
            assert_eq!(active, 0);
        }
        assert!(scheduler.is_complete());
    }

    #[test]
    fn converged_pixels_receive_no_further_samples() {
        let frame = FrameDimensions::new(16, 16);
        let cancel = CancelToken::new();
        let (sender, receiver) = completion_channel();
        let queues = cpu_queues(1, Arc::new(HalfNoisyShader { split_x: 8 }), &cancel, &sender);
        let mut scheduler = TileScheduler::new(
            frame,
            test_pass_layout(),
            config(0.05, 2),
            queues,
            receiver,
            cancel,
        )
        .expect("build scheduler");

        let mut display = CollectingDisplay::default();
        let first = scheduler.render_pass(2, &mut display).expect("first pass");
        assert_eq!(first.pixel_samples_rendered, 16 * 16 * 2);
        // The noise-free left half converges at the sample floor.
        assert_eq!(scheduler.converged_pixels(), 8 * 16);
        assert!(!scheduler.is_complete());

        let second = scheduler.render_pass(2, &mut display).expect("second pass");
        // The second batch shades only the noisy right half.
        assert_eq!(second.pixel_samples_rendered, 8 * 16 * 2);
        assert_eq!(scheduler.tile_samples(TileId(0)), Some(4));

        // A converged pixel keeps its displayed mean across the batch it
        // sat out.
        let last = display.updates.last().expect("display update");
        assert!((last.pixels[0] - 0.5).abs() < 1e-5);
    }

    /// Completes synchronously inside `submit` and trips the cancel
    /// token after a fixed number of assignments.
    struct CountingQueue {
        queue_id: QueueId,
        completions: CompletionSender,
        cancel: CancelToken,
        cancel_after: usize,
        submitted: usize,
        layout: ShadeLayout,
    }

    impl DeviceWorkQueue for CountingQueue {
        fn queue_id(&self) -> QueueId {
            self.queue_id
        }

        fn device_kind(&self) -> DeviceKind {
            DeviceKind::Cpu
        }

        fn in_flight(&self) -> usize {
            0
        }

        fn has_capacity(&self) -> bool {
            true
        }

        fn submit(&mut self, assignment: TileAssignment) -> Result<(), SubmitError> {
            let TileAssignment {
                work, mut buffer, ..
            } = assignment;
            let callable = CheckerShader;
            let mut context = callable.create_lane_context(0);
            let contributions = shade_region(
                &callable,
                &mut context,
                work.rect,
                work.start_sample,
                work.num_samples,
                self.layout,
                None,
            );
            buffer
                .accumulate(work.rect, &contributions)
                .expect("accumulate shaded tile");
            buffer.advance_samples(work.num_samples);
            let statistics = RenderStatistics {
                queue_id: self.queue_id,
                device_kind: DeviceKind::Cpu,
                outcome: RenderOutcome::Completed,
                pixel_samples_rendered: work.rect.pixel_count() as u64 * work.num_samples as u64,
                samples_accumulated: work.num_samples,
            };
            self.completions
                .send(TileCompletion {
                    work,
                    buffer,
                    statistics,
                })
                .expect("completion receiver alive");
            self.submitted += 1;
            if self.submitted == self.cancel_after {
                self.cancel.cancel();
            }
            Ok(())
        }
    }

    #[test]
    fn cancellation_stops_new_assignments_and_keeps_partial_results() {
        let frame = FrameDimensions::new(64, 64);
        let cancel = CancelToken::new();
        let (sender, receiver) = completion_channel();
        let queue = CountingQueue {
            queue_id: QueueId(0),
            completions: sender,
            cancel: cancel.clone(),
            cancel_after: 5,
            submitted: 0,
            layout: ShadeLayout::from_pass_layout(&test_pass_layout()),
        };
        let mut scheduler = TileScheduler::new(
            frame,
            test_pass_layout(),
            config(0.0, 8),
            vec![Box::new(queue)],
            receiver,
            cancel.clone(),
        )
        .expect("build scheduler");

        let mut display = CollectingDisplay::default();
        let report = scheduler
            .render_pass(4, &mut display)
            .expect("cancelled pass");

        assert!(cancel.is_cancelled());
        assert_eq!(report.tiles_scheduled, 5);
        assert_eq!(report.tiles_completed, 5);
        assert_eq!(display.updates.len(), 5);
        for (index, update) in display.updates.iter().enumerate() {
            for other in &display.updates[index + 1..] {
                assert!(!update.rect.overlaps(other.rect));
            }
        }
        let rendered = (0..scheduler.tile_count())
            .filter(|index| scheduler.tile_samples(TileId(*index as u32)) == Some(4))
            .count();
        assert_eq!(rendered, 5);
    }

    #[test]
    fn accelerator_launch_failure_falls_back_to_cpu() {
        let frame = FrameDimensions::new(32, 32);
        let cancel = CancelToken::new();
        let (sender, receiver) = completion_channel();
        let mut queues: Vec<Box<dyn DeviceWorkQueue>> = vec![Box::new(
            AcceleratorWorkQueue::spawn(
                QueueId(0),
                AcceleratorQueueConfig::default(),
                RejectingLauncher::new("device lost"),
                sender.clone(),
            ),
        )];
        queues.extend(cpu_queues(1, Arc::new(CheckerShader), &cancel, &sender));
        let mut scheduler = TileScheduler::new(
            frame,
            test_pass_layout(),
            config(0.5, 4),
            queues,
            receiver,
            cancel,
        )
        .expect("build scheduler");

        let mut display = CollectingDisplay::default();
        let report = scheduler
            .render_pass(4, &mut display)
            .expect("pass with failing accelerator");

        assert!(report.tiles_retried >= 1);
        assert_eq!(report.tiles_completed, 4);
        assert!(scheduler.is_complete());
        for index in 0..scheduler.tile_count() {
            assert_eq!(scheduler.tile_samples(TileId(index as u32)), Some(4));
        }
    }

    /// Reports a launch failure from a CPU queue, which has no fallback.
    struct FailingQueue {
        queue_id: QueueId,
        completions: CompletionSender,
    }

    impl DeviceWorkQueue for FailingQueue {
        fn queue_id(&self) -> QueueId {
            self.queue_id
        }

        fn device_kind(&self) -> DeviceKind {
            DeviceKind::Cpu
        }

        fn in_flight(&self) -> usize {
            0
        }

        fn has_capacity(&self) -> bool {
            true
        }

        fn submit(&mut self, assignment: TileAssignment) -> Result<(), SubmitError> {
            let TileAssignment { work, buffer, .. } = assignment;
            let statistics = RenderStatistics {
                queue_id: self.queue_id,
                device_kind: DeviceKind::Cpu,
                outcome: RenderOutcome::LaunchFailed {
                    message: "worker pool exhausted".to_string(),
                },
                pixel_samples_rendered: 0,
                samples_accumulated: 0,
            };
            self.completions
                .send(TileCompletion {
                    work,
                    buffer,
                    statistics,
                })
                .expect("completion receiver alive");
            Ok(())
        }
    }

    #[test]
    fn cpu_failure_without_fallback_is_terminal() {
        let frame = FrameDimensions::new(16, 16);
        let cancel = CancelToken::new();
        let (sender, receiver) = completion_channel();
        let queue = FailingQueue {
            queue_id: QueueId(0),
            completions: sender,
        };
        let mut scheduler = TileScheduler::new(
            frame,
            test_pass_layout(),
            config(0.0, 8),
            vec![Box::new(queue)],
            receiver,
            cancel,
        )
        .expect("build scheduler");

        let mut display = CollectingDisplay::default();
        let error = scheduler
            .render_pass(4, &mut display)
            .expect_err("cpu failure must surface");
        assert!(matches!(error, SchedulerError::TileFailed { .. }));
        // The tile's buffer came back with the failure notice.
        assert_eq!(scheduler.tile_samples(TileId(0)), Some(0));
    }

    #[test]
    fn restart_repartitions_and_clears_convergence() {
        let frame = FrameDimensions::new(32, 32);
        let cancel = CancelToken::new();
        let (sender, receiver) = completion_channel();
        let queues = cpu_queues(2, Arc::new(CheckerShader), &cancel, &sender);
        let mut scheduler = TileScheduler::new(
            frame,
            test_pass_layout(),
            config(0.5, 4),
            queues,
            receiver,
            cancel,
        )
        .expect("build scheduler");

        let mut display = CollectingDisplay::default();
        scheduler
            .render_pass(4, &mut display)
            .expect("converge the first frame");
        assert!(scheduler.is_complete());

        scheduler
            .restart(FrameDimensions::new(48, 16))
            .expect("restart at new resolution");
        assert_eq!(scheduler.tile_count(), 3);
        assert_eq!(scheduler.converged_pixels(), 0);
        assert!(!scheduler.is_complete());
        assert_eq!(scheduler.tile_samples(TileId(0)), Some(0));

        let report = scheduler
            .render_pass(4, &mut display)
            .expect("render the resized frame");
        assert_eq!(report.tiles_scheduled, 3);
    }

    #[test]
    fn scheduler_requires_at_least_one_queue() {
        let (_, receiver) = completion_channel();
        let result = TileScheduler::new(
            FrameDimensions::new(8, 8),
            test_pass_layout(),
            SchedulerConfig::default(),
            Vec::new(),
            receiver,
            CancelToken::new(),
        );
        assert!(matches!(result, Err(SchedulerError::NoQueues)));
    }
}

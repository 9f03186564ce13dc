use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded, select};
use trace_protocol::{DeviceKind, QueueId, RenderOutcome, RenderStatistics, WorkTile};

use render_buffers::RenderBuffer;

use crate::{
    CompletionSender, DeviceWorkQueue, ShadeLayout, SubmitError, TileAssignment, TileCompletion,
};

/// One kernel-launch request: shade all samples of `work` and return the
/// full contribution block (`rect.pixel_count() * pass_stride` floats,
/// including any auxiliary channels the layout carries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelWorkItem {
    pub work: WorkTile,
    pub layout: ShadeLayout,
    /// Rect-local row-major activity mask; pixels it marks inactive must
    /// come back with zeroed contribution slots.
    pub active: Option<Arc<[bool]>>,
}

/// Delivered over the launch fence when the device finishes a work item.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelLaunchResult {
    Finished {
        contributions: Vec<f32>,
        pixel_samples: u64,
    },
    Faulted {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRejected {
    pub message: String,
}

impl fmt::Display for LaunchRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kernel launch rejected: {}", self.message)
    }
}

/// The device-specific launch seam. `launch` must not block on device
/// completion; the returned receiver is the fence that yields exactly one
/// result. Launches on one launcher complete in launch order, like work
/// items on one command queue.
pub trait KernelLauncher: Send + 'static {
    fn launch(
        &mut self,
        item: KernelWorkItem,
    ) -> Result<Receiver<KernelLaunchResult>, LaunchRejected>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceleratorQueueConfig {
    /// Maximum concurrent in-flight kernel launches. Supplied by the
    /// device capability source, not probed here.
    pub queue_depth: usize,
}

impl Default for AcceleratorQueueConfig {
    fn default() -> Self {
        Self { queue_depth: 2 }
    }
}

/// Accelerator work queue: enqueues one kernel launch per tile, keeps up
/// to `queue_depth` launches in flight, and retires them in launch order
/// while new assignments keep arriving. Host-side bookkeeping of a
/// finished tile overlaps the latency of the launches behind it.
pub struct AcceleratorWorkQueue {
    queue_id: QueueId,
    queue_depth: usize,
    assignment_sender: Option<Sender<TileAssignment>>,
    in_flight: Arc<AtomicUsize>,
    dispatcher: Option<JoinHandle<()>>,
}

impl AcceleratorWorkQueue {
    pub fn spawn<L: KernelLauncher>(
        queue_id: QueueId,
        config: AcceleratorQueueConfig,
        launcher: L,
        completions: CompletionSender,
    ) -> Self {
        if config.queue_depth == 0 {
            panic!("invalid accelerator queue config: queue_depth must be positive");
        }
        let (assignment_sender, assignment_receiver) = bounded(config.queue_depth);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let dispatcher_in_flight = in_flight.clone();
        let dispatcher = std::thread::spawn(move || {
            dispatcher_worker(
                queue_id,
                config,
                launcher,
                assignment_receiver,
                completions,
                dispatcher_in_flight,
            );
        });
        Self {
            queue_id,
            queue_depth: config.queue_depth,
            assignment_sender: Some(assignment_sender),
            in_flight,
            dispatcher: Some(dispatcher),
        }
    }
}

impl DeviceWorkQueue for AcceleratorWorkQueue {
    fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Accelerator
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn has_capacity(&self) -> bool {
        self.in_flight() < self.queue_depth
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

impl Drop for AcceleratorWorkQueue {
    fn drop(&mut self) {
        self.assignment_sender.take();
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                log::error!("{} dispatcher panicked during shutdown", self.queue_id);
            }
        }
    }
}

struct InFlightLaunch {
    work: WorkTile,
    buffer: RenderBuffer,
    active: Option<Arc<[bool]>>,
    fence: Receiver<KernelLaunchResult>,
}

fn dispatcher_worker<L: KernelLauncher>(
    queue_id: QueueId,
    config: AcceleratorQueueConfig,
    mut launcher: L,
    assignments: Receiver<TileAssignment>,
    completions: CompletionSender,
    in_flight_count: Arc<AtomicUsize>,
) {
    let mut in_flight: VecDeque<InFlightLaunch> = VecDeque::new();
    let mut accepting = true;

    loop {
        if in_flight.is_empty() {
            if !accepting {
                return;
            }
            match assignments.recv() {
                Ok(assignment) => launch_one(
                    queue_id,
                    &mut launcher,
                    assignment,
                    &mut in_flight,
                    &completions,
                    &in_flight_count,
                ),
                Err(_) => return,
            }
            continue;
        }

        if accepting && in_flight.len() < config.queue_depth {
            // Clone of the head fence so the in-flight deque stays
            // mutable inside the select arms.
            let head_fence = in_flight.front().expect("in-flight is non-empty").fence.clone();
            select! {
                recv(assignments) -> message => match message {
                    Ok(assignment) => launch_one(
                        queue_id,
                        &mut launcher,
                        assignment,
                        &mut in_flight,
                        &completions,
                        &in_flight_count,
                    ),
                    Err(_) => accepting = false,
                },
                recv(head_fence) -> result => {
                    let head = in_flight.pop_front().expect("in-flight is non-empty");
                    retire_head(queue_id, head, result.ok(), &completions, &in_flight_count);
                }
            }
        } else {
            let head = in_flight.pop_front().expect("in-flight is non-empty");
            let result = head.fence.recv().ok();
            retire_head(queue_id, head, result, &completions, &in_flight_count);
        }
    }
}

fn launch_one<L: KernelLauncher>(
    queue_id: QueueId,
    launcher: &mut L,
    assignment: TileAssignment,
    in_flight: &mut VecDeque<InFlightLaunch>,
    completions: &CompletionSender,
    in_flight_count: &Arc<AtomicUsize>,
) {
    let TileAssignment {
        work,
        buffer,
        active,
    } = assignment;
    let item = KernelWorkItem {
        work,
        layout: ShadeLayout::from_pass_layout(buffer.layout()),
        active: active.clone(),
    };
    match launcher.launch(item) {
        Ok(fence) => in_flight.push_back(InFlightLaunch {
            work,
            buffer,
            active,
            fence,
        }),
        Err(rejected) => {
            log::warn!("{queue_id} rejected work item for {}: {rejected}", work.tile_id);
            let statistics = RenderStatistics {
                queue_id,
                device_kind: DeviceKind::Accelerator,
                outcome: RenderOutcome::LaunchFailed {
                    message: rejected.message,
                },
                pixel_samples_rendered: 0,
                samples_accumulated: 0,
            };
            in_flight_count.fetch_sub(1, Ordering::AcqRel);
            let _ = completions.send(TileCompletion {
                work,
                buffer,
                statistics,
            });
        }
    }
}

fn retire_head(
    queue_id: QueueId,
    head: InFlightLaunch,
    result: Option<KernelLaunchResult>,
    completions: &CompletionSender,
    in_flight_count: &Arc<AtomicUsize>,
) {
    let InFlightLaunch {
        work,
        mut buffer,
        active,
        ..
    } = head;
    let statistics = match result {
        Some(KernelLaunchResult::Finished {
            contributions,
            pixel_samples,
        }) => match buffer.accumulate(work.rect, &contributions) {
            Ok(()) => {
                if let Some(mask) = active.as_deref() {
                    // Skipped pixels scale with the counter advance so
                    // their normalized values stay put.
                    let before = buffer.samples_rendered();
                    if before > 0 {
                        let factor = (before + work.num_samples) as f32 / before as f32;
                        if buffer.scale_inactive(work.rect, mask, factor).is_err() {
                            log::error!(
                                "{queue_id} skipped-pixel rescale rejected for {}",
                                work.tile_id
                            );
                        }
                    }
                }
                buffer.advance_samples(work.num_samples);
                RenderStatistics {
                    queue_id,
                    device_kind: DeviceKind::Accelerator,
                    outcome: RenderOutcome::Completed,
                    pixel_samples_rendered: pixel_samples,
                    samples_accumulated: work.num_samples,
                }
            }
            Err(error) => RenderStatistics {
                queue_id,
                device_kind: DeviceKind::Accelerator,
                outcome: RenderOutcome::LaunchFailed {
                    message: format!("kernel result rejected by buffer: {error}"),
                },
                pixel_samples_rendered: 0,
                samples_accumulated: 0,
            },
        },
        Some(KernelLaunchResult::Faulted { message }) => {
            log::warn!("{queue_id} work item faulted for {}: {message}", work.tile_id);
            RenderStatistics {
                queue_id,
                device_kind: DeviceKind::Accelerator,
                outcome: RenderOutcome::LaunchFailed { message },
                pixel_samples_rendered: 0,
                samples_accumulated: 0,
            }
        }
        None => RenderStatistics {
            queue_id,
            device_kind: DeviceKind::Accelerator,
            outcome: RenderOutcome::LaunchFailed {
                message: "launch fence dropped without a result".to_string(),
            },
            pixel_samples_rendered: 0,
            samples_accumulated: 0,
        },
    };
    in_flight_count.fetch_sub(1, Ordering::AcqRel);
    let _ = completions.send(TileCompletion {
        work,
        buffer,
        statistics,
    });
}

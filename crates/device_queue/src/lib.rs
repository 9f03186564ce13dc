use std::fmt;
use std::sync::Arc;

use render_buffers::{COMBINED_PASS, RenderBuffer, SAMPLE_SQ_SUM_PASS};
use render_model::{PassLayout, TileRect};
use trace_protocol::{
    DeviceKind, PixelSampleContext, QueueId, RenderStatistics, ShadingCallable, WorkTile,
};

mod accelerator;
mod cpu;
#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

pub use accelerator::{
    AcceleratorQueueConfig, AcceleratorWorkQueue, KernelLaunchResult, KernelLauncher,
    KernelWorkItem, LaunchRejected,
};
pub use cpu::{CpuQueueConfig, CpuWorkQueue};

/// A tile assignment moves the tile's render buffer into the queue; the
/// buffer comes back with the completion notice. Exactly one queue owns a
/// buffer at any time, by construction.
#[derive(Debug)]
pub struct TileAssignment {
    pub work: WorkTile,
    pub buffer: RenderBuffer,
    /// Rect-local row-major mask of pixels still active; `None` shades
    /// every pixel. Converged pixels are skipped by the shade loop and
    /// rescaled with the sample counter instead.
    pub active: Option<Arc<[bool]>>,
}

/// Sent to the scheduling thread when a queue finishes (or fails) a tile.
/// The channel transfer is the visibility barrier: once the notice is
/// received, every buffer write the queue performed is visible.
#[derive(Debug)]
pub struct TileCompletion {
    pub work: WorkTile,
    pub buffer: RenderBuffer,
    pub statistics: RenderStatistics,
}

pub type CompletionSender = crossbeam_channel::Sender<TileCompletion>;
pub type CompletionReceiver = crossbeam_channel::Receiver<TileCompletion>;

pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    crossbeam_channel::unbounded()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    QueueFull { queue_id: QueueId },
    QueueShutDown { queue_id: QueueId },
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::QueueFull { queue_id } => {
                write!(f, "{queue_id} is at its in-flight capacity")
            }
            SubmitError::QueueShutDown { queue_id } => {
                write!(f, "{queue_id} worker has shut down")
            }
        }
    }
}

/// Common contract for the CPU and accelerator queue variants.
///
/// `submit` is non-blocking; completions arrive on the completion channel
/// the queue was constructed with. Submitting the same `WorkTile` twice
/// double-accumulates; that bookkeeping belongs to the caller.
pub trait DeviceWorkQueue: Send {
    fn queue_id(&self) -> QueueId;
    fn device_kind(&self) -> DeviceKind;
    fn in_flight(&self) -> usize;
    fn has_capacity(&self) -> bool;
    fn submit(&mut self, assignment: TileAssignment) -> Result<(), SubmitError>;
}

/// Channel offsets a device needs to accumulate one sample into the flat
/// per-pixel contribution slice: where the combined pass lives and where
/// the adaptive-sampling squared-luminance channel goes, if present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadeLayout {
    pub pass_stride: usize,
    pub combined_offset: usize,
    pub combined_channels: usize,
    pub sq_sum_offset: Option<usize>,
}

impl ShadeLayout {
    pub fn from_pass_layout(layout: &PassLayout) -> Self {
        let combined = layout.find_pass(COMBINED_PASS);
        Self {
            pass_stride: layout.pass_stride() as usize,
            combined_offset: combined.map(|pass| pass.offset as usize).unwrap_or(0),
            combined_channels: combined.map(|pass| pass.channels as usize).unwrap_or(0),
            sq_sum_offset: layout
                .find_pass(SAMPLE_SQ_SUM_PASS)
                .map(|pass| pass.offset as usize),
        }
    }
}

/// Pixels a batch will shade: all of `rect`, or the mask's true entries.
pub fn active_pixel_count(rect: TileRect, active: Option<&[bool]>) -> usize {
    match active {
        Some(mask) => mask.iter().filter(|pixel| **pixel).count(),
        None => rect.pixel_count(),
    }
}

/// Shade every active pixel of `rect` for `num_samples` samples starting
/// at `start_sample`, into a freshly allocated contribution block of
/// `rect.pixel_count() * pass_stride` floats.
///
/// This is the host-side execution of the opaque shading callable, shared
/// by the CPU lanes and host-emulated kernel launchers. `active`, when
/// present, is a rect-local row-major mask; pixels it marks inactive are
/// never shaded and their contribution slots stay zero. The squared
/// luminance of each sample's combined contribution is folded into the
/// adaptive-sampling channel when the layout carries one.
pub fn shade_region<S: ShadingCallable>(
    callable: &S,
    context: &mut S::LaneContext,
    rect: TileRect,
    start_sample: u32,
    num_samples: u32,
    layout: ShadeLayout,
    active: Option<&[bool]>,
) -> Vec<f32> {
    let stride = layout.pass_stride;
    let mut contributions = vec![0.0f32; rect.pixel_count() * stride];
    let mut scratch = vec![0.0f32; stride];
    let mut pixel = 0;
    for y in rect.y..rect.bottom() {
        for x in rect.x..rect.right() {
            if let Some(mask) = active {
                if !mask[pixel] {
                    pixel += 1;
                    continue;
                }
            }
            let base = pixel * stride;
            for sample_index in start_sample..start_sample + num_samples {
                scratch.fill(0.0);
                callable.shade(
                    context,
                    PixelSampleContext { x, y, sample_index },
                    &mut scratch,
                );
                for channel in 0..stride {
                    contributions[base + channel] += scratch[channel];
                }
                if let Some(sq_offset) = layout.sq_sum_offset {
                    let color_channels = layout.combined_channels.min(3).max(1);
                    let luminance: f32 = scratch
                        [layout.combined_offset..layout.combined_offset + color_channels]
                        .iter()
                        .sum::<f32>()
                        / color_channels as f32;
                    contributions[base + sq_offset] += luminance * luminance;
                }
            }
            pixel += 1;
        }
    }
    contributions
}

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use render_model::TileRect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Accelerator,
}

/// One unit of work: render `num_samples` samples, starting at sample
/// offset `start_sample`, for every pixel of `rect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkTile {
    pub tile_id: TileId,
    pub rect: TileRect,
    pub start_sample: u32,
    pub num_samples: u32,
    pub device_affinity: Option<DeviceKind>,
}

/// Outcome of one `render_tile` call. A launch failure leaves the tile
/// buffer untouched; cancellation drops the batch whole, so the buffer
/// keeps only fully accumulated earlier batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    Completed,
    Cancelled,
    LaunchFailed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderStatistics {
    pub queue_id: QueueId,
    pub device_kind: DeviceKind,
    pub outcome: RenderOutcome,
    /// Pixel-samples actually shaded and accumulated by this call.
    pub pixel_samples_rendered: u64,
    /// Samples the tile's counter advanced by: the requested
    /// `num_samples` on completion, zero when the batch was dropped on
    /// cancellation or failure.
    pub samples_accumulated: u32,
}

impl RenderStatistics {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, RenderOutcome::LaunchFailed { .. })
    }
}

/// Shared cancellation flag, polled at tile-assignment and chunk
/// granularity. Setting it is sticky for the render session.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Which memory space a pixel payload currently lives in. The display
/// bridge transfers between domains internally; callers never branch on
/// this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryDomain {
    Host,
    Device,
}

/// Per-pixel payload handed from the scheduler to display/output, tagged
/// with its memory domain.
#[derive(Debug, Clone, PartialEq)]
pub struct TilePixels {
    pub rect: TileRect,
    pub channels: u32,
    pub domain: MemoryDomain,
    pub pixels: Vec<f32>,
}

impl TilePixels {
    pub fn host(rect: TileRect, channels: u32, pixels: Vec<f32>) -> Self {
        Self {
            rect,
            channels,
            domain: MemoryDomain::Host,
            pixels,
        }
    }
}

/// Progressive display seam: the scheduler pushes finished (or partial)
/// tile pixels here as completions arrive. Implementations own the
/// presentation surface; tiles carry disjoint rectangles, so later
/// updates never clobber other tiles' regions.
pub trait DisplayTarget {
    fn update_tile(&mut self, pixels: &TilePixels);
}

/// Identifies one finished tile when pulling pixels for persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileDescriptor {
    pub tile_id: TileId,
    pub rect: TileRect,
    pub samples_rendered: u32,
}

/// Read-only view over a finished tile's passes, offered to the output
/// sink. Returns false when the requested pass does not exist in the
/// buffer layout (non-fatal; the sink logs and continues).
pub trait PassReader {
    fn get_pass_pixels(&self, pass_name: &str, channels: u32, destination: &mut Vec<f32>) -> bool;
}

/// Externally supplied per-pixel auxiliary data fed into a tile buffer
/// before its first accumulation.
#[derive(Debug, Clone, PartialEq)]
pub struct PassInjection {
    pub pass_name: String,
    pub pixels: Vec<f32>,
}

/// Pull-based persistence seam, invoked once per finished tile.
pub trait OutputSink {
    fn write_tile(&mut self, descriptor: &TileDescriptor, reader: &dyn PassReader);

    /// Optional reverse direction: auxiliary data to inject before the
    /// tile's first accumulation. Never interleaved with accumulation.
    fn read_tile(&mut self, descriptor: &TileDescriptor) -> Option<PassInjection> {
        let _ = descriptor;
        None
    }
}

/// One stochastic shading evaluation request for a pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelSampleContext {
    pub x: u32,
    pub y: u32,
    pub sample_index: u32,
}

/// The opaque per-sample compute callable supplied by the shading layer.
///
/// Lane contexts replace hidden thread-local shading state: the device
/// queue constructs one context per worker lane up front and threads it
/// through every `shade` call on that lane, so the callable itself stays
/// shared and immutable.
///
/// `shade` must be deterministic given its inputs. `contribution` arrives
/// zeroed with one slot per pass channel (`pass_stride` floats); the
/// callable adds this sample's radiance into the passes it fills and
/// leaves the rest untouched.
pub trait ShadingCallable: Send + Sync {
    type LaneContext: Send;

    fn create_lane_context(&self, lane_index: usize) -> Self::LaneContext;

    fn shade(
        &self,
        context: &mut Self::LaneContext,
        sample: PixelSampleContext,
        contribution: &mut [f32],
    );
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tile#{}", self.0)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue#{}", self.0)
    }
}

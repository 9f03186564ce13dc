//! Progressive display surfaces fed by the tile scheduler.
//!
//! The render resolution and the display resolution are independent;
//! tile updates arrive in render-space coordinates and are resampled
//! (nearest neighbor) onto the display grid. The host surface keeps the
//! pixels in a plain RGBA float plane; the GPU surface uploads them into
//! a texture for presentation.

use std::fmt;

use render_model::{FrameDimensions, TileRect};
use trace_protocol::{DisplayTarget, MemoryDomain, TilePixels};

#[cfg(feature = "display-gpu")]
mod gpu;
#[cfg(feature = "display-gpu")]
pub use gpu::GpuDisplaySurface;

/// All display surfaces store RGBA.
pub const DISPLAY_CHANNELS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayError {
    EmptySurface,
    TextureLimitExceeded { edge: u32, limit: u32 },
}

impl fmt::Display for DisplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayError::EmptySurface => write!(f, "surface has zero width or height"),
            DisplayError::TextureLimitExceeded { edge, limit } => {
                write!(f, "surface edge {edge} exceeds device texture limit {limit}")
            }
        }
    }
}

/// Map a render-space tile onto the display grid.
///
/// Tile edges map through floor division, so the target rects of a full
/// frame partition stay disjoint and covering at any scale. Returns
/// `None` when downscaling collapses the tile to zero display pixels.
/// Color widens to RGBA: missing color channels replicate the first
/// channel, missing alpha becomes opaque.
pub fn resample_tile_rgba(
    update: &TilePixels,
    source: FrameDimensions,
    target: FrameDimensions,
) -> Option<(TileRect, Vec<f32>)> {
    let rect = update.rect;
    let channels = update.channels as usize;
    let pixels = transfer_to_host(update);
    if channels == 0 || pixels.len() != rect.pixel_count() * channels {
        log::warn!(
            "malformed tile update for {rect:?}: {} floats for {} channels",
            pixels.len(),
            update.channels
        );
        return None;
    }

    let scale_x = |value: u32| (value as u64 * target.width as u64 / source.width as u64) as u32;
    let scale_y = |value: u32| (value as u64 * target.height as u64 / source.height as u64) as u32;
    let x0 = scale_x(rect.x);
    let x1 = scale_x(rect.right());
    let y0 = scale_y(rect.y);
    let y1 = scale_y(rect.bottom());
    if x1 == x0 || y1 == y0 {
        return None;
    }

    let out_rect = TileRect {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
    };
    let mut out = Vec::with_capacity(out_rect.pixel_count() * DISPLAY_CHANNELS);
    for ty in y0..y1 {
        let sy = (ty as u64 * source.height as u64 / target.height as u64) as u32;
        let sy = sy.clamp(rect.y, rect.bottom() - 1);
        for tx in x0..x1 {
            let sx = (tx as u64 * source.width as u64 / target.width as u64) as u32;
            let sx = sx.clamp(rect.x, rect.right() - 1);
            let base =
                ((sy - rect.y) as usize * rect.width as usize + (sx - rect.x) as usize) * channels;
            let pixel = &pixels[base..base + channels];
            for channel in 0..3 {
                out.push(pixel[channel.min(channels - 1)]);
            }
            out.push(if channels >= 4 { pixel[3] } else { 1.0 });
        }
    }
    Some((out_rect, out))
}

/// Resolve a tile payload to host-addressable floats, transferring out of
/// device memory when required. Device-resident payloads in this
/// subsystem are staged host-side by the queue that produced them, so the
/// transfer is a borrow today; consumers never branch on the domain tag.
fn transfer_to_host(update: &TilePixels) -> &[f32] {
    match update.domain {
        MemoryDomain::Host | MemoryDomain::Device => &update.pixels,
    }
}

/// CPU-resident display surface: one RGBA float plane at display
/// resolution.
///
/// `map_for_write` hands out the raw plane for a presentation layer to
/// copy from; tile updates while the plane is mapped are a caller bug
/// and trip a debug assertion. Tile payloads are host-addressable for
/// either memory domain, so updates never branch on the domain tag.
pub struct HostDisplaySurface {
    source: FrameDimensions,
    target: FrameDimensions,
    pixels: Vec<f32>,
    mapped: bool,
}

impl HostDisplaySurface {
    pub fn new(source: FrameDimensions, target: FrameDimensions) -> Result<Self, DisplayError> {
        if source.pixel_count() == 0 || target.pixel_count() == 0 {
            return Err(DisplayError::EmptySurface);
        }
        Ok(Self {
            source,
            target,
            pixels: vec![0.0; target.pixel_count() * DISPLAY_CHANNELS],
            mapped: false,
        })
    }

    pub fn source(&self) -> FrameDimensions {
        self.source
    }

    pub fn target(&self) -> FrameDimensions {
        self.target
    }

    /// Reallocate for new render and display resolutions. All pixels
    /// reset to zero; stale content from the old resolution never shows.
    pub fn resize(
        &mut self,
        source: FrameDimensions,
        target: FrameDimensions,
    ) -> Result<(), DisplayError> {
        debug_assert!(!self.mapped, "resize while surface is mapped");
        if source.pixel_count() == 0 || target.pixel_count() == 0 {
            return Err(DisplayError::EmptySurface);
        }
        self.source = source;
        self.target = target;
        self.pixels = vec![0.0; target.pixel_count() * DISPLAY_CHANNELS];
        Ok(())
    }

    pub fn zero(&mut self) {
        debug_assert!(!self.mapped, "zero while surface is mapped");
        self.pixels.fill(0.0);
    }

    pub fn map_for_write(&mut self) -> &mut [f32] {
        debug_assert!(!self.mapped, "surface mapped twice without unmap");
        self.mapped = true;
        &mut self.pixels
    }

    pub fn unmap(&mut self) {
        debug_assert!(self.mapped, "unmap without a matching map_for_write");
        self.mapped = false;
    }

    pub fn pixel(&self, x: u32, y: u32) -> [f32; 4] {
        let base = (y as usize * self.target.width as usize + x as usize) * DISPLAY_CHANNELS;
        [
            self.pixels[base],
            self.pixels[base + 1],
            self.pixels[base + 2],
            self.pixels[base + 3],
        ]
    }
}

impl DisplayTarget for HostDisplaySurface {
    fn update_tile(&mut self, update: &TilePixels) {
        debug_assert!(!self.mapped, "tile update while surface is mapped");
        if !self.source.as_rect().contains(update.rect) {
            log::warn!(
                "tile update {:?} outside render frame {:?}",
                update.rect,
                self.source
            );
            return;
        }
        let Some((rect, rgba)) = resample_tile_rgba(update, self.source, self.target) else {
            return;
        };
        let target_row = self.target.width as usize * DISPLAY_CHANNELS;
        let tile_row = rect.width as usize * DISPLAY_CHANNELS;
        for row in 0..rect.height as usize {
            let from = row * tile_row;
            let to = (rect.y as usize + row) * target_row + rect.x as usize * DISPLAY_CHANNELS;
            self.pixels[to..to + tile_row].copy_from_slice(&rgba[from..from + tile_row]);
        }
    }
}

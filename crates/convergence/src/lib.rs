use std::fmt;

use bitvec::prelude::{BitVec, Lsb0};
use render_buffers::{COMBINED_PASS, RegionError, RenderBuffer, SAMPLE_SQ_SUM_PASS};
use render_model::{FrameDimensions, TileRect};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceConfig {
    /// Minimum samples per pixel before a pixel may converge. Prevents
    /// premature termination from a lucky first few samples.
    pub min_samples: u32,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self { min_samples: 8 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceError {
    TileOutOfFrame { tile: TileRect },
    Buffer(RegionError),
}

impl fmt::Display for ConvergenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceError::TileOutOfFrame { tile } => {
                write!(f, "tile {tile:?} outside the tracked frame")
            }
            ConvergenceError::Buffer(error) => write!(f, "buffer read failed: {error}"),
        }
    }
}

impl From<RegionError> for ConvergenceError {
    fn from(error: RegionError) -> Self {
        ConvergenceError::Buffer(error)
    }
}

/// Per-pixel adaptive-sampling state. A pixel is either active or
/// converged; converged is terminal within a session unless the caller
/// resets (threshold change, buffer zero, resolution change).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceTracker {
    frame: FrameDimensions,
    config: ConvergenceConfig,
    converged: BitVec<usize, Lsb0>,
    converged_count: usize,
}

// Mean below this is treated as black for the relative error divide.
const LUMINANCE_EPSILON: f32 = 1e-4;

impl ConvergenceTracker {
    pub fn new(frame: FrameDimensions, config: ConvergenceConfig) -> Self {
        Self {
            frame,
            config,
            converged: BitVec::repeat(false, frame.pixel_count()),
            converged_count: 0,
        }
    }

    pub fn frame(&self) -> FrameDimensions {
        self.frame
    }

    pub fn converged_count(&self) -> usize {
        self.converged_count
    }

    /// Forget all convergence state, e.g. after `zero()` or a resolution
    /// change.
    pub fn reset_all(&mut self) {
        self.converged.fill(false);
        self.converged_count = 0;
    }

    fn check_tile(&self, tile: TileRect) -> Result<(), ConvergenceError> {
        if self.frame.as_rect().contains(tile) {
            Ok(())
        } else {
            Err(ConvergenceError::TileOutOfFrame { tile })
        }
    }

    fn pixel_index(&self, x: u32, y: u32) -> usize {
        y as usize * self.frame.width as usize + x as usize
    }

    /// Count of pixels in `tile` still active. Lets the scheduler skip
    /// fully converged tiles without touching any buffer.
    pub fn tile_active_count(&self, tile: TileRect) -> Result<usize, ConvergenceError> {
        self.check_tile(tile)?;
        let mut active = 0;
        for y in tile.y..tile.bottom() {
            for x in tile.x..tile.right() {
                active += !self.converged[self.pixel_index(x, y)] as usize;
            }
        }
        Ok(active)
    }

    pub fn tile_has_active(&self, tile: TileRect) -> Result<bool, ConvergenceError> {
        Ok(self.tile_active_count(tile)? > 0)
    }

    /// Rect-local row-major activity mask for `tile`, or `None` while
    /// every pixel is still active (the common case early in a session).
    /// Converged pixels must receive no further samples; the scheduler
    /// hands this mask to the device queue with each assignment.
    pub fn tile_active_mask(&self, tile: TileRect) -> Result<Option<Vec<bool>>, ConvergenceError> {
        self.check_tile(tile)?;
        let mut mask = Vec::with_capacity(tile.pixel_count());
        let mut any_converged = false;
        for y in tile.y..tile.bottom() {
            for x in tile.x..tile.right() {
                let converged = self.converged[self.pixel_index(x, y)];
                any_converged |= converged;
                mask.push(!converged);
            }
        }
        Ok(any_converged.then_some(mask))
    }

    /// Re-evaluate every pixel of `tile` against `threshold` after a
    /// completed accumulation batch. `reset` forces all tile pixels back
    /// to active first (threshold changed, or the tile was edited).
    ///
    /// Must only run between a tile's accumulation phase and its next
    /// scheduling decision; the scheduler's tile ownership excludes
    /// concurrent calls for the same tile.
    ///
    /// Returns the count of pixels still active.
    pub fn filter_converged(
        &mut self,
        buffer: &RenderBuffer,
        tile: TileRect,
        threshold: f32,
        reset: bool,
    ) -> Result<usize, ConvergenceError> {
        self.check_tile(tile)?;
        if reset {
            for y in tile.y..tile.bottom() {
                for x in tile.x..tile.right() {
                    let index = self.pixel_index(x, y);
                    if self.converged[index] {
                        self.converged.set(index, false);
                        self.converged_count -= 1;
                    }
                }
            }
        }

        let samples = buffer.samples_rendered();
        if samples == 0 {
            return self.tile_active_count(tile);
        }

        let combined = buffer.copy_out(tile, COMBINED_PASS)?;
        let sq_sums = buffer.copy_out(tile, SAMPLE_SQ_SUM_PASS)?;
        let combined_channels = buffer
            .layout()
            .find_pass(COMBINED_PASS)
            .map(|pass| pass.channels as usize)
            .unwrap_or(0);
        debug_assert!(combined_channels >= 1);

        let n = samples as f32;
        let mut active = 0;
        let mut tile_pixel = 0;
        for y in tile.y..tile.bottom() {
            for x in tile.x..tile.right() {
                let index = self.pixel_index(x, y);
                if self.converged[index] {
                    tile_pixel += 1;
                    continue;
                }
                // Luminance proxy: mean of the color channels of the
                // accumulated combined sum.
                let base = tile_pixel * combined_channels;
                let color_channels = combined_channels.min(3);
                let sum: f32 = combined[base..base + color_channels].iter().sum::<f32>()
                    / color_channels as f32;
                let sq_sum = sq_sums[tile_pixel];
                tile_pixel += 1;

                if samples < self.config.min_samples {
                    active += 1;
                    continue;
                }
                let mean = sum / n;
                let variance = if samples > 1 {
                    ((sq_sum - sum * sum / n) / (n - 1.0)).max(0.0)
                } else {
                    f32::INFINITY
                };
                let standard_error = (variance / n).sqrt();
                let relative_error = standard_error / mean.abs().max(LUMINANCE_EPSILON);
                if relative_error < threshold {
                    self.converged.set(index, true);
                    self.converged_count += 1;
                } else {
                    active += 1;
                }
            }
        }
        Ok(active)
    }
}

use std::fmt;

use render_model::{PassLayout, TileRect};

/// Pass name conventions shared with the scene/compile layer. The layout
/// itself stays opaque; these are the two passes this core reads back.
pub const COMBINED_PASS: &str = "combined";
/// Auxiliary adaptive-sampling pass: accumulated squared luminance per
/// sample, one channel.
pub const SAMPLE_SQ_SUM_PASS: &str = "sample_sq_sum";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionError {
    /// Out-of-bounds region request. Scheduler bug; fatal in debug builds.
    InvalidRegion { region: TileRect, bounds: TileRect },
    /// Accumulation into a region marked finalizing. Scheduler bug; fatal
    /// in debug builds.
    RegionBusy { region: TileRect },
    /// Contribution slice length does not match the region and stride.
    ContributionSizeMismatch { expected: usize, actual: usize },
    /// Requested pass is absent from this buffer's layout. Non-fatal.
    PassNotFound { name: String },
    /// Auxiliary data injection attempted after accumulation started.
    InjectionAfterAccumulation,
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionError::InvalidRegion { region, bounds } => {
                write!(f, "region {region:?} outside buffer bounds {bounds:?}")
            }
            RegionError::RegionBusy { region } => {
                write!(f, "region {region:?} is marked finalizing")
            }
            RegionError::ContributionSizeMismatch { expected, actual } => {
                write!(f, "contribution slice has {actual} floats, expected {expected}")
            }
            RegionError::PassNotFound { name } => {
                write!(f, "pass {name:?} not present in buffer layout")
            }
            RegionError::InjectionAfterAccumulation => {
                write!(f, "pass injection after accumulation started")
            }
        }
    }
}

/// Per-pixel pass storage for one tile (or a whole frame), with
/// accumulation-additive write semantics.
///
/// The buffer trusts its caller for write exclusivity: the scheduler moves
/// a buffer into exactly one tile assignment at a time. The finalizing
/// marks exist to trip on scheduler bugs, not to synchronize.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderBuffer {
    rect: TileRect,
    layout: PassLayout,
    data: Vec<f32>,
    samples_rendered: u32,
    has_accumulated: bool,
    finalizing: Vec<TileRect>,
}

impl RenderBuffer {
    pub fn new(rect: TileRect, layout: PassLayout) -> Self {
        let data = vec![0.0; rect.pixel_count() * layout.pass_stride() as usize];
        Self {
            rect,
            layout,
            data,
            samples_rendered: 0,
            has_accumulated: false,
            finalizing: Vec::new(),
        }
    }

    pub fn rect(&self) -> TileRect {
        self.rect
    }

    pub fn layout(&self) -> &PassLayout {
        &self.layout
    }

    pub fn samples_rendered(&self) -> u32 {
        self.samples_rendered
    }

    fn check_bounds(&self, region: TileRect) -> Result<(), RegionError> {
        if self.rect.contains(region) {
            return Ok(());
        }
        debug_assert!(
            false,
            "render buffer region out of bounds: {region:?} not within {:?}",
            self.rect
        );
        log::error!(
            "render buffer region out of bounds: {region:?} not within {:?}",
            self.rect
        );
        Err(RegionError::InvalidRegion {
            region,
            bounds: self.rect,
        })
    }

    fn check_not_finalizing(&self, region: TileRect) -> Result<(), RegionError> {
        if let Some(busy) = self.finalizing.iter().find(|mark| mark.overlaps(region)) {
            debug_assert!(
                false,
                "accumulate into finalizing region: {region:?} overlaps {busy:?}"
            );
            log::error!("accumulate into finalizing region: {region:?} overlaps {busy:?}");
            return Err(RegionError::RegionBusy { region });
        }
        Ok(())
    }

    /// Iterate over `(pixel_base, row_len)` spans of `region` within the
    /// flat storage, one span per pixel row.
    fn region_rows(&self, region: TileRect) -> impl Iterator<Item = (usize, usize)> + '_ {
        let stride = self.layout.pass_stride() as usize;
        let buffer_row = self.rect.width as usize * stride;
        let row_len = region.width as usize * stride;
        let local_x = (region.x - self.rect.x) as usize;
        let local_y = (region.y - self.rect.y) as usize;
        (0..region.height as usize).map(move |row| {
            let base = (local_y + row) * buffer_row + local_x * stride;
            (base, row_len)
        })
    }

    /// Reset every channel of `region` to zero and the sample counter to
    /// zero. Only valid while no device queue holds the region.
    pub fn zero(&mut self, region: TileRect) -> Result<(), RegionError> {
        self.check_bounds(region)?;
        self.check_not_finalizing(region)?;
        let rows: Vec<_> = self.region_rows(region).collect();
        for (base, len) in rows {
            self.data[base..base + len].fill(0.0);
        }
        self.samples_rendered = 0;
        self.has_accumulated = false;
        Ok(())
    }

    /// Bulk-add `contributions` into `region`. The slice holds
    /// `region.pixel_count() * pass_stride` floats in row-major pixel
    /// order. The sample counter is advanced separately via
    /// `advance_samples`, once per tile batch, so a batch write-combined
    /// as several chunk regions still counts once.
    pub fn accumulate(
        &mut self,
        region: TileRect,
        contributions: &[f32],
    ) -> Result<(), RegionError> {
        self.check_bounds(region)?;
        self.check_not_finalizing(region)?;
        let expected = region.pixel_count() * self.layout.pass_stride() as usize;
        if contributions.len() != expected {
            debug_assert!(
                false,
                "contribution slice has {} floats, expected {expected}",
                contributions.len()
            );
            return Err(RegionError::ContributionSizeMismatch {
                expected,
                actual: contributions.len(),
            });
        }
        let rows: Vec<_> = self.region_rows(region).collect();
        let mut source = 0;
        for (base, len) in rows {
            let destination = &mut self.data[base..base + len];
            for (slot, value) in destination.iter_mut().zip(&contributions[source..source + len]) {
                *slot += value;
            }
            source += len;
        }
        self.has_accumulated = true;
        Ok(())
    }

    /// Advance the uniform per-pixel sample counter after a completed
    /// accumulation batch.
    pub fn advance_samples(&mut self, samples: u32) {
        self.samples_rendered += samples;
    }

    /// Multiply every pass channel of the region's pixels whose `active`
    /// entry is false by `factor`. Pixels skipped during a batch scale
    /// with the uniform sample counter this way, so their normalized
    /// values are unchanged by counter advances they took no part in.
    pub fn scale_inactive(
        &mut self,
        region: TileRect,
        active: &[bool],
        factor: f32,
    ) -> Result<(), RegionError> {
        self.check_bounds(region)?;
        self.check_not_finalizing(region)?;
        if active.len() != region.pixel_count() {
            debug_assert!(
                false,
                "active mask has {} entries, expected {}",
                active.len(),
                region.pixel_count()
            );
            return Err(RegionError::ContributionSizeMismatch {
                expected: region.pixel_count(),
                actual: active.len(),
            });
        }
        let stride = self.layout.pass_stride() as usize;
        let rows: Vec<_> = self.region_rows(region).collect();
        let mut pixel = 0;
        for (base, len) in rows {
            for pixel_base in (base..base + len).step_by(stride) {
                if !active[pixel] {
                    for slot in &mut self.data[pixel_base..pixel_base + stride] {
                        *slot *= factor;
                    }
                }
                pixel += 1;
            }
        }
        Ok(())
    }

    /// Read-only snapshot of one pass over `region`, row-major, raw
    /// accumulated values (no sample normalization).
    pub fn copy_out(&self, region: TileRect, pass_name: &str) -> Result<Vec<f32>, RegionError> {
        self.check_bounds(region)?;
        let Some(pass) = self.layout.find_pass(pass_name) else {
            return Err(RegionError::PassNotFound {
                name: pass_name.to_string(),
            });
        };
        let stride = self.layout.pass_stride() as usize;
        let channels = pass.channels as usize;
        let offset = pass.offset as usize;
        let mut out = Vec::with_capacity(region.pixel_count() * channels);
        for (base, len) in self.region_rows(region) {
            for pixel_base in (base..base + len).step_by(stride) {
                out.extend_from_slice(&self.data[pixel_base + offset..pixel_base + offset + channels]);
            }
        }
        Ok(out)
    }

    /// Overwrite one pass of `region` with externally supplied per-pixel
    /// data. Used for auxiliary parameter injection; must happen before
    /// the first accumulation into this buffer.
    pub fn inject_pass(
        &mut self,
        region: TileRect,
        pass_name: &str,
        pixels: &[f32],
    ) -> Result<(), RegionError> {
        self.check_bounds(region)?;
        if self.has_accumulated {
            return Err(RegionError::InjectionAfterAccumulation);
        }
        let Some(pass) = self.layout.find_pass(pass_name) else {
            return Err(RegionError::PassNotFound {
                name: pass_name.to_string(),
            });
        };
        let channels = pass.channels as usize;
        let offset = pass.offset as usize;
        let expected = region.pixel_count() * channels;
        if pixels.len() != expected {
            return Err(RegionError::ContributionSizeMismatch {
                expected,
                actual: pixels.len(),
            });
        }
        let stride = self.layout.pass_stride() as usize;
        let rows: Vec<_> = self.region_rows(region).collect();
        let mut source = 0;
        for (base, len) in rows {
            for pixel_base in (base..base + len).step_by(stride) {
                self.data[pixel_base + offset..pixel_base + offset + channels]
                    .copy_from_slice(&pixels[source..source + channels]);
                source += channels;
            }
        }
        Ok(())
    }

    /// Mark `region` as finalizing: accumulation into it is a scheduler
    /// bug until the mark is cleared.
    pub fn mark_finalizing(&mut self, region: TileRect) -> Result<(), RegionError> {
        self.check_bounds(region)?;
        self.finalizing.push(region);
        Ok(())
    }

    pub fn clear_finalizing(&mut self, region: TileRect) {
        self.finalizing.retain(|mark| *mark != region);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use render_model::PassLayout;

    fn test_layout() -> PassLayout {
        PassLayout::new([
            (COMBINED_PASS.to_string(), 3),
            (SAMPLE_SQ_SUM_PASS.to_string(), 1),
        ])
        .expect("build test layout")
    }

    fn tile(x: u32, y: u32, width: u32, height: u32) -> TileRect {
        TileRect {
            x,
            y,
            width,
            height,
        }
    }

    #[test]
    fn zero_then_copy_out_returns_all_zero_regardless_of_prior_content() {
        let rect = tile(4, 4, 2, 2);
        let mut buffer = RenderBuffer::new(rect, test_layout());
        let contributions = vec![1.5; rect.pixel_count() * 4];
        buffer
            .accumulate(rect, &contributions)
            .expect("accumulate before zero");
        buffer.advance_samples(1);

        buffer.zero(rect).expect("zero whole buffer");
        let pixels = buffer.copy_out(rect, COMBINED_PASS).expect("copy out combined");
        assert!(pixels.iter().all(|value| *value == 0.0));
        assert_eq!(buffer.samples_rendered(), 0);
    }

    #[test]
    fn accumulation_is_linear_across_batches() {
        let rect = tile(0, 0, 3, 2);
        let layout = test_layout();
        let mut split = RenderBuffer::new(rect, layout.clone());
        let mut single = RenderBuffer::new(rect, layout);

        let batch_one: Vec<f32> = (0..rect.pixel_count() * 4).map(|i| i as f32 * 0.25).collect();
        let batch_two: Vec<f32> = (0..rect.pixel_count() * 4).map(|i| i as f32 * 0.5).collect();
        let combined: Vec<f32> = batch_one
            .iter()
            .zip(&batch_two)
            .map(|(a, b)| a + b)
            .collect();

        split.accumulate(rect, &batch_one).expect("first batch");
        split.advance_samples(2);
        split.accumulate(rect, &batch_two).expect("second batch");
        split.advance_samples(3);
        single.accumulate(rect, &combined).expect("single batch");
        single.advance_samples(5);

        assert_eq!(split.samples_rendered(), 5);
        assert_eq!(single.samples_rendered(), 5);
        let from_split = split.copy_out(rect, COMBINED_PASS).expect("split combined");
        let from_single = single.copy_out(rect, COMBINED_PASS).expect("single combined");
        for (a, b) in from_split.iter().zip(&from_single) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn scale_inactive_touches_only_masked_out_pixels() {
        let rect = tile(0, 0, 2, 2);
        let mut buffer = RenderBuffer::new(rect, test_layout());
        buffer
            .accumulate(rect, &vec![1.0; rect.pixel_count() * 4])
            .expect("accumulate one sample");
        buffer.advance_samples(1);

        // Pixels 0 and 3 sat out the next batch of one sample.
        let active = [false, true, true, false];
        buffer
            .scale_inactive(rect, &active, 2.0)
            .expect("rescale skipped pixels");
        buffer
            .accumulate(
                rect,
                &[
                    0.0, 0.0, 0.0, 0.0, // skipped
                    1.0, 1.0, 1.0, 1.0, // shaded
                    1.0, 1.0, 1.0, 1.0, // shaded
                    0.0, 0.0, 0.0, 0.0, // skipped
                ],
            )
            .expect("accumulate second sample");
        buffer.advance_samples(1);

        // Every pixel normalizes to the same per-sample mean.
        let combined = buffer.copy_out(rect, COMBINED_PASS).expect("read combined");
        let samples = buffer.samples_rendered() as f32;
        for pixel in 0..rect.pixel_count() {
            assert!((combined[pixel * 3] / samples - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    #[should_panic(expected = "active mask has 3 entries")]
    fn wrong_sized_mask_is_fatal_in_debug() {
        let rect = tile(0, 0, 2, 2);
        let mut buffer = RenderBuffer::new(rect, test_layout());
        let _ = buffer.scale_inactive(rect, &[true; 3], 2.0);
    }

    #[test]
    fn copy_out_extracts_a_sub_region_of_one_pass() {
        let rect = tile(0, 0, 4, 4);
        let mut buffer = RenderBuffer::new(rect, test_layout());
        let mut contributions = vec![0.0; rect.pixel_count() * 4];
        // Tag every pixel's first combined channel with its index.
        for pixel in 0..rect.pixel_count() {
            contributions[pixel * 4] = pixel as f32;
        }
        buffer.accumulate(rect, &contributions).expect("accumulate");

        let inner = tile(1, 2, 2, 1);
        let pixels = buffer.copy_out(inner, COMBINED_PASS).expect("copy inner");
        assert_eq!(pixels.len(), 2 * 3);
        assert_eq!(pixels[0], 9.0);
        assert_eq!(pixels[3], 10.0);
    }

    #[test]
    fn copy_out_unknown_pass_reports_pass_not_found() {
        let rect = tile(0, 0, 2, 2);
        let buffer = RenderBuffer::new(rect, test_layout());
        let error = buffer
            .copy_out(rect, "cryptomatte")
            .expect_err("missing pass must not silently succeed");
        assert_eq!(
            error,
            RegionError::PassNotFound {
                name: "cryptomatte".to_string()
            }
        );
    }

    #[test]
    #[should_panic(expected = "render buffer region out of bounds")]
    fn out_of_bounds_accumulate_is_fatal_in_debug() {
        let rect = tile(0, 0, 2, 2);
        let mut buffer = RenderBuffer::new(rect, test_layout());
        let _ = buffer.accumulate(tile(1, 1, 4, 4), &[0.0; 64]);
    }

    #[test]
    #[should_panic(expected = "accumulate into finalizing region")]
    fn accumulate_into_finalizing_region_is_fatal_in_debug() {
        let rect = tile(0, 0, 2, 2);
        let mut buffer = RenderBuffer::new(rect, test_layout());
        buffer.mark_finalizing(rect).expect("mark finalizing");
        let _ = buffer.accumulate(rect, &vec![0.0; rect.pixel_count() * 4]);
    }

    #[test]
    fn clearing_the_finalizing_mark_reopens_the_region() {
        let rect = tile(0, 0, 2, 2);
        let mut buffer = RenderBuffer::new(rect, test_layout());
        buffer.mark_finalizing(rect).expect("mark finalizing");
        buffer.clear_finalizing(rect);
        buffer
            .accumulate(rect, &vec![0.5; rect.pixel_count() * 4])
            .expect("accumulate after clearing mark");
    }

    #[test]
    fn inject_pass_rejects_writes_after_accumulation() {
        let rect = tile(0, 0, 2, 1);
        let mut buffer = RenderBuffer::new(rect, test_layout());
        buffer
            .inject_pass(rect, SAMPLE_SQ_SUM_PASS, &[0.25, 0.75])
            .expect("inject before accumulation");
        let aux = buffer
            .copy_out(rect, SAMPLE_SQ_SUM_PASS)
            .expect("read injected pass");
        assert_eq!(aux, vec![0.25, 0.75]);

        buffer
            .accumulate(rect, &vec![0.0; rect.pixel_count() * 4])
            .expect("accumulate");
        let error = buffer
            .inject_pass(rect, SAMPLE_SQ_SUM_PASS, &[0.0, 0.0])
            .expect_err("late injection must fail");
        assert_eq!(error, RegionError::InjectionAfterAccumulation);
    }
}

//! Progressive render loop over the tile scheduler: repeat sample
//! batches until the frame converges, the sample budget is spent, or
//! cancellation is requested, then flush tiles to the output sink.

use trace_protocol::{DisplayTarget, OutputSink};

use crate::{SchedulerError, TileScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Samples accumulated per tile per pass.
    pub samples_per_pass: u32,
    /// Per-pixel sample budget across the whole session.
    pub max_samples: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            samples_per_pass: 8,
            max_samples: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub passes_run: u32,
    /// Samples offered to every still-active tile; converged tiles stop
    /// earlier.
    pub samples_reached: u32,
    pub cancelled: bool,
    pub converged_pixels: usize,
}

pub struct RenderSession {
    scheduler: TileScheduler,
    config: SessionConfig,
}

impl RenderSession {
    pub fn new(scheduler: TileScheduler, config: SessionConfig) -> Self {
        if config.samples_per_pass == 0 || config.max_samples == 0 {
            panic!(
                "invalid session config: samples_per_pass ({}) and max_samples ({}) must be positive",
                config.samples_per_pass, config.max_samples
            );
        }
        Self { scheduler, config }
    }

    pub fn scheduler(&self) -> &TileScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut TileScheduler {
        &mut self.scheduler
    }

    pub fn run(
        &mut self,
        display: &mut dyn DisplayTarget,
        sink: &mut dyn OutputSink,
    ) -> Result<SessionReport, SchedulerError> {
        self.scheduler.inject_auxiliary(sink)?;

        let mut passes_run = 0;
        let mut samples_reached = 0;
        while samples_reached < self.config.max_samples
            && !self.scheduler.is_complete()
            && !self.scheduler.cancel_requested()
        {
            let batch = self
                .config
                .samples_per_pass
                .min(self.config.max_samples - samples_reached);
            let report = self.scheduler.render_pass(batch, display)?;
            passes_run += 1;
            samples_reached += batch;
            log::info!(
                "pass {passes_run}: {} tiles scheduled, {} of {} pixels converged",
                report.tiles_scheduled,
                self.scheduler.converged_pixels(),
                self.scheduler.frame().pixel_count()
            );
            if report.tiles_scheduled == 0 {
                break;
            }
        }

        self.scheduler.write_output(sink);
        Ok(SessionReport {
            passes_run,
            samples_reached,
            cancelled: self.scheduler.cancel_requested(),
            converged_pixels: self.scheduler.converged_pixels(),
        })
    }
}

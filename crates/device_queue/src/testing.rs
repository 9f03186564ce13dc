//! Deterministic shading callables and host-emulated kernel launchers
//! shared by the queue and scheduler tests.

use std::sync::Arc;

use crossbeam_channel::{Receiver, bounded};
use render_buffers::{COMBINED_PASS, SAMPLE_SQ_SUM_PASS};
use render_model::PassLayout;
use trace_protocol::{PixelSampleContext, ShadingCallable};

use crate::{
    KernelLaunchResult, KernelLauncher, KernelWorkItem, LaunchRejected, active_pixel_count,
    shade_region,
};

pub fn test_pass_layout() -> PassLayout {
    PassLayout::new([
        (COMBINED_PASS.to_string(), 3),
        (SAMPLE_SQ_SUM_PASS.to_string(), 1),
    ])
    .expect("build test pass layout")
}

#[derive(Debug, Default)]
pub struct CheckerLaneContext {
    pub samples_shaded: u64,
}

/// Deterministic, noise-free callable: every sample of a pixel
/// contributes the same checkerboard value, so accumulation results are
/// exactly predictable and per-pixel variance is zero.
#[derive(Debug, Clone, Default)]
pub struct CheckerShader;

impl CheckerShader {
    pub fn pixel_value(x: u32, y: u32) -> f32 {
        if (x + y) % 2 == 0 { 0.75 } else { 0.25 }
    }
}

impl ShadingCallable for CheckerShader {
    type LaneContext = CheckerLaneContext;

    fn create_lane_context(&self, _lane_index: usize) -> CheckerLaneContext {
        CheckerLaneContext::default()
    }

    fn shade(
        &self,
        context: &mut CheckerLaneContext,
        sample: PixelSampleContext,
        contribution: &mut [f32],
    ) {
        context.samples_shaded += 1;
        let value = Self::pixel_value(sample.x, sample.y);
        // Test convention: combined pass sits at channel offset zero.
        contribution[0] += value;
        contribution[1] += value;
        contribution[2] += value;
    }
}

/// Deterministic but noisy callable: sample values alternate between
/// bright and dark, so every pixel carries a large known variance.
#[derive(Debug, Clone, Default)]
pub struct AlternatingShader;

impl AlternatingShader {
    pub fn sample_value(sample_index: u32) -> f32 {
        if sample_index % 2 == 0 { 0.9 } else { 0.1 }
    }
}

impl ShadingCallable for AlternatingShader {
    type LaneContext = ();

    fn create_lane_context(&self, _lane_index: usize) {}

    fn shade(
        &self,
        _context: &mut (),
        sample: PixelSampleContext,
        contribution: &mut [f32],
    ) {
        let value = Self::sample_value(sample.sample_index);
        contribution[0] += value;
        contribution[1] += value;
        contribution[2] += value;
    }
}

/// Noise-free on one side of a vertical split, noisy on the other:
/// pixels left of `split_x` always contribute 0.5 and converge as soon as
/// the minimum sample count allows, pixels at or right of it alternate
/// like `AlternatingShader` and stay active.
#[derive(Debug, Clone)]
pub struct HalfNoisyShader {
    pub split_x: u32,
}

impl ShadingCallable for HalfNoisyShader {
    type LaneContext = ();

    fn create_lane_context(&self, _lane_index: usize) {}

    fn shade(
        &self,
        _context: &mut (),
        sample: PixelSampleContext,
        contribution: &mut [f32],
    ) {
        let value = if sample.x < self.split_x {
            0.5
        } else {
            AlternatingShader::sample_value(sample.sample_index)
        };
        contribution[0] += value;
        contribution[1] += value;
        contribution[2] += value;
    }
}

/// Runs kernel work items on host threads through `shade_region`, one
/// thread per launch, delivering results over the fence the way a real
/// launcher signals device completion.
pub struct HostEmulationLauncher<S: ShadingCallable> {
    callable: Arc<S>,
    launches: u64,
}

impl<S: ShadingCallable> HostEmulationLauncher<S> {
    pub fn new(callable: Arc<S>) -> Self {
        Self {
            callable,
            launches: 0,
        }
    }
}

impl<S: ShadingCallable + 'static> KernelLauncher for HostEmulationLauncher<S> {
    fn launch(
        &mut self,
        item: KernelWorkItem,
    ) -> Result<Receiver<KernelLaunchResult>, LaunchRejected> {
        self.launches += 1;
        let lane_index = self.launches as usize;
        let callable = self.callable.clone();
        let (result_sender, fence) = bounded(1);
        std::thread::spawn(move || {
            let mut context = callable.create_lane_context(lane_index);
            let contributions = shade_region(
                callable.as_ref(),
                &mut context,
                item.work.rect,
                item.work.start_sample,
                item.work.num_samples,
                item.layout,
                item.active.as_deref(),
            );
            let pixel_samples = active_pixel_count(item.work.rect, item.active.as_deref())
                as u64
                * item.work.num_samples as u64;
            let _ = result_sender.send(KernelLaunchResult::Finished {
                contributions,
                pixel_samples,
            });
        });
        Ok(fence)
    }
}

/// Refuses every launch at enqueue time.
pub struct RejectingLauncher {
    message: &'static str,
}

impl RejectingLauncher {
    pub fn new(message: &'static str) -> Self {
        Self { message }
    }
}

impl KernelLauncher for RejectingLauncher {
    fn launch(
        &mut self,
        _item: KernelWorkItem,
    ) -> Result<Receiver<KernelLaunchResult>, LaunchRejected> {
        Err(LaunchRejected {
            message: self.message.to_string(),
        })
    }
}

/// Accepts every launch, then faults the work item at the fence.
pub struct FaultingLauncher {
    message: &'static str,
}

impl FaultingLauncher {
    pub fn new(message: &'static str) -> Self {
        Self { message }
    }
}

impl KernelLauncher for FaultingLauncher {
    fn launch(
        &mut self,
        _item: KernelWorkItem,
    ) -> Result<Receiver<KernelLaunchResult>, LaunchRejected> {
        let (result_sender, fence) = bounded(1);
        let message = self.message.to_string();
        let _ = result_sender.send(KernelLaunchResult::Faulted { message });
        Ok(fence)
    }
}

//! Demo renderer: progressively traces a procedural test frame across
//! CPU (and optionally host-emulated accelerator) work queues, then
//! writes the converged result as a PNG.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use anyhow::{Context, Result};
use clap::Parser;
use convergence::ConvergenceConfig;
use crossbeam_channel::{Receiver, bounded};
use device_queue::{
    AcceleratorQueueConfig, AcceleratorWorkQueue, CpuQueueConfig, CpuWorkQueue, DeviceWorkQueue,
    KernelLaunchResult, KernelLauncher, KernelWorkItem, LaunchRejected, active_pixel_count,
    completion_channel, shade_region,
};
use display_bridge::HostDisplaySurface;
use output_sink::MemoryOutputSink;
use render_buffers::{COMBINED_PASS, SAMPLE_SQ_SUM_PASS};
use render_model::{FrameDimensions, PassLayout};
use tile_scheduler::{RenderSession, SchedulerConfig, SessionConfig, TileScheduler};
use trace_protocol::{CancelToken, PixelSampleContext, QueueId, ShadingCallable};

#[derive(Parser)]
#[command(author, version, about = "Progressive tile renderer for a procedural test frame")]
struct Arguments {
    #[arg(long, default_value_t = 512)]
    width: u32,
    #[arg(long, default_value_t = 512)]
    height: u32,
    /// Tile edge length in pixels.
    #[arg(long, default_value_t = 64)]
    tile_size: u32,
    /// Samples accumulated per tile per pass.
    #[arg(long, default_value_t = 8)]
    samples_per_pass: u32,
    /// Per-pixel sample budget.
    #[arg(long, default_value_t = 256)]
    max_samples: u32,
    /// Adaptive sampling relative-error threshold. Zero disables the
    /// early out and renders the full budget everywhere.
    #[arg(long, default_value_t = 0.02)]
    noise_threshold: f32,
    /// Samples per pixel before convergence may trigger.
    #[arg(long, default_value_t = 16)]
    min_samples: u32,
    /// CPU work queues to spawn.
    #[arg(long, default_value_t = 2)]
    cpu_queues: u32,
    /// Worker lanes per CPU queue.
    #[arg(long, default_value_t = 4)]
    lanes: usize,
    /// Add a host-emulated accelerator queue alongside the CPU queues.
    #[arg(long)]
    emulated_accelerator: bool,
    /// Output image path.
    #[arg(long, short = 'o', default_value = "lumen.png")]
    output: PathBuf,
    /// Log filter in env_logger syntax. RUST_LOG wins when set.
    #[arg(long)]
    log: Option<String>,
}

static INIT_LOGGING: Once = Once::new();

fn init_logging(filter: Option<&str>) {
    INIT_LOGGING.call_once(|| {
        let mut builder = env_logger::Builder::new();
        if let Ok(env_filter) = std::env::var("RUST_LOG") {
            builder.parse_filters(&env_filter);
        } else if let Some(filter) = filter {
            builder.parse_filters(filter);
        } else {
            builder.filter_level(log::LevelFilter::Info);
        }
        builder.init();
    });
}

fn lowbias32(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846ca68b);
    x ^= x >> 16;
    x
}

fn sample_unit(x: u32, y: u32, sample_index: u32, salt: u32) -> f32 {
    let seed = lowbias32(
        x.wrapping_mul(0x9e37_79b9)
            ^ y.wrapping_mul(0x85eb_ca6b)
            ^ sample_index.wrapping_mul(0xc2b2_ae35)
            ^ salt,
    );
    seed as f32 / u32::MAX as f32
}

#[derive(Debug, Default)]
struct DemoLane {
    samples_shaded: u64,
}

/// Procedural scene: a soft ring over a color gradient, with sample
/// noise concentrated on the ring so the adaptive sampler has an edge
/// worth refining.
struct DemoShader {
    frame: FrameDimensions,
}

impl ShadingCallable for DemoShader {
    type LaneContext = DemoLane;

    fn create_lane_context(&self, _lane_index: usize) -> DemoLane {
        DemoLane::default()
    }

    fn shade(
        &self,
        lane: &mut DemoLane,
        sample: PixelSampleContext,
        contribution: &mut [f32],
    ) {
        lane.samples_shaded += 1;
        let u = (sample.x as f32 + 0.5) / self.frame.width as f32;
        let v = (sample.y as f32 + 0.5) / self.frame.height as f32;
        let dx = u - 0.5;
        let dy = v - 0.5;
        let radius = (dx * dx + dy * dy).sqrt();
        let ring = (1.0 - (radius - 0.3).abs() * 8.0).clamp(0.0, 1.0);

        let base = [0.15 + 0.7 * u, 0.1 + 0.6 * v, 0.3 + 0.5 * ring];
        let noise_scale = 0.05 + 0.6 * ring;
        for channel in 0..3 {
            let jitter =
                (sample_unit(sample.x, sample.y, sample.sample_index, channel as u32) - 0.5) * 2.0;
            contribution[channel] += (base[channel] + jitter * noise_scale).max(0.0);
        }
    }
}

/// Drives kernel work items on host threads, one per launch, signalling
/// completion over the fence the way a device driver would.
struct EmulatedKernelLauncher {
    callable: Arc<DemoShader>,
    launches: u64,
}

impl EmulatedKernelLauncher {
    fn new(callable: Arc<DemoShader>) -> Self {
        Self {
            callable,
            launches: 0,
        }
    }
}

impl KernelLauncher for EmulatedKernelLauncher {
    fn launch(
        &mut self,
        item: KernelWorkItem,
    ) -> Result<Receiver<KernelLaunchResult>, LaunchRejected> {
        self.launches += 1;
        let lane_index = self.launches as usize;
        let callable = self.callable.clone();
        let (result_sender, fence) = bounded(1);
        std::thread::spawn(move || {
            let mut lane = callable.create_lane_context(lane_index);
            let contributions = shade_region(
                callable.as_ref(),
                &mut lane,
                item.work.rect,
                item.work.start_sample,
                item.work.num_samples,
                item.layout,
                item.active.as_deref(),
            );
            let pixel_samples = active_pixel_count(item.work.rect, item.active.as_deref()) as u64
                * item.work.num_samples as u64;
            let _ = result_sender.send(KernelLaunchResult::Finished {
                contributions,
                pixel_samples,
            });
        });
        Ok(fence)
    }
}

fn save_png(path: &Path, frame: FrameDimensions, plane: &[f32]) -> Result<()> {
    let mut data = Vec::with_capacity(frame.pixel_count() * 3);
    for value in plane {
        // Gamma 2.2 for display-referred output.
        let encoded = value.max(0.0).powf(1.0 / 2.2).min(1.0);
        data.push((encoded * 255.0 + 0.5) as u8);
    }
    let image =
        image::RgbImage::from_raw(frame.width, frame.height, data).context("assemble output image")?;
    image
        .save(path)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn main() -> Result<()> {
    let arguments = Arguments::parse();
    init_logging(arguments.log.as_deref());

    let frame = FrameDimensions::new(arguments.width, arguments.height);
    let layout = PassLayout::new([
        (COMBINED_PASS.to_string(), 3),
        (SAMPLE_SQ_SUM_PASS.to_string(), 1),
    ])
    .map_err(|error| anyhow::anyhow!("build pass layout: {error}"))?;

    let callable = Arc::new(DemoShader { frame });
    let cancel = CancelToken::new();
    let (completion_sender, completion_receiver) = completion_channel();

    let mut queues: Vec<Box<dyn DeviceWorkQueue>> = Vec::new();
    for index in 0..arguments.cpu_queues {
        queues.push(Box::new(CpuWorkQueue::spawn(
            QueueId(index),
            CpuQueueConfig {
                lanes: arguments.lanes,
                ..CpuQueueConfig::default()
            },
            callable.clone(),
            cancel.clone(),
            completion_sender.clone(),
        )));
    }
    if arguments.emulated_accelerator {
        queues.push(Box::new(AcceleratorWorkQueue::spawn(
            QueueId(arguments.cpu_queues),
            AcceleratorQueueConfig::default(),
            EmulatedKernelLauncher::new(callable.clone()),
            completion_sender.clone(),
        )));
    }

    let scheduler = TileScheduler::new(
        frame,
        layout,
        SchedulerConfig {
            tile_limit_x: arguments.tile_size,
            tile_limit_y: arguments.tile_size,
            noise_threshold: arguments.noise_threshold,
            convergence: ConvergenceConfig {
                min_samples: arguments.min_samples,
            },
        },
        queues,
        completion_receiver,
        cancel,
    )
    .map_err(|error| anyhow::anyhow!("build scheduler: {error}"))?;
    let mut session = RenderSession::new(
        scheduler,
        SessionConfig {
            samples_per_pass: arguments.samples_per_pass,
            max_samples: arguments.max_samples,
        },
    );

    let mut display = HostDisplaySurface::new(frame, frame)
        .map_err(|error| anyhow::anyhow!("build display surface: {error}"))?;
    let mut sink = MemoryOutputSink::new(frame, vec![(COMBINED_PASS.to_string(), 3)]);

    let started = std::time::Instant::now();
    let report = session
        .run(&mut display, &mut sink)
        .map_err(|error| anyhow::anyhow!("render session failed: {error}"))?;
    log::info!(
        "{} passes, {} samples offered, {}/{} pixels converged in {:.2?}",
        report.passes_run,
        report.samples_reached,
        report.converged_pixels,
        frame.pixel_count(),
        started.elapsed()
    );

    let plane = sink
        .pass_plane(COMBINED_PASS)
        .context("combined pass missing from sink")?;
    save_png(&arguments.output, frame, plane)?;
    log::info!("wrote {}", arguments.output.display());
    Ok(())
}

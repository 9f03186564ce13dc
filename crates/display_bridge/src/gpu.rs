use render_model::FrameDimensions;
use trace_protocol::{DisplayTarget, TilePixels};

use crate::{DISPLAY_CHANNELS, DisplayError, resample_tile_rgba};

const TEXEL_BYTES: u32 = (DISPLAY_CHANNELS * size_of::<f32>()) as u32;

/// GPU-resident display surface: tile updates are resampled on the host
/// and uploaded straight into an `Rgba32Float` texture a presentation
/// layer can sample.
pub struct GpuDisplaySurface {
    device: wgpu::Device,
    queue: wgpu::Queue,
    texture: wgpu::Texture,
    source: FrameDimensions,
    target: FrameDimensions,
}

impl GpuDisplaySurface {
    pub fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        source: FrameDimensions,
        target: FrameDimensions,
    ) -> Result<Self, DisplayError> {
        validate_surface_dimensions(&device, source, target)?;
        let texture = create_surface_texture(&device, target);
        Ok(Self {
            device,
            queue,
            texture,
            source,
            target,
        })
    }

    pub fn source(&self) -> FrameDimensions {
        self.source
    }

    pub fn target(&self) -> FrameDimensions {
        self.target
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    /// Recreate the texture for new render and display resolutions. The
    /// fresh texture starts zeroed; stale content never shows.
    pub fn resize(
        &mut self,
        source: FrameDimensions,
        target: FrameDimensions,
    ) -> Result<(), DisplayError> {
        validate_surface_dimensions(&self.device, source, target)?;
        self.source = source;
        self.target = target;
        self.texture = create_surface_texture(&self.device, target);
        Ok(())
    }

    /// Reset every texel to zero, like a host surface between sessions.
    pub fn zero(&mut self) {
        let plane =
            vec![0.0f32; self.target.pixel_count() * DISPLAY_CHANNELS];
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&plane),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(self.target.width * TEXEL_BYTES),
                rows_per_image: Some(self.target.height),
            },
            wgpu::Extent3d {
                width: self.target.width,
                height: self.target.height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Give queued uploads a chance to progress without blocking.
    pub fn flush(&self) {
        let _ = self.device.poll(wgpu::PollType::Poll);
    }
}

impl DisplayTarget for GpuDisplaySurface {
    fn update_tile(&mut self, update: &TilePixels) {
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
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: rect.x,
                    y: rect.y,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&rgba),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(rect.width * TEXEL_BYTES),
                rows_per_image: Some(rect.height),
            },
            wgpu::Extent3d {
                width: rect.width,
                height: rect.height,
                depth_or_array_layers: 1,
            },
        );
    }
}

fn validate_surface_dimensions(
    device: &wgpu::Device,
    source: FrameDimensions,
    target: FrameDimensions,
) -> Result<(), DisplayError> {
    if source.pixel_count() == 0 || target.pixel_count() == 0 {
        return Err(DisplayError::EmptySurface);
    }
    let limit = device.limits().max_texture_dimension_2d;
    let edge = target.width.max(target.height);
    if edge > limit {
        return Err(DisplayError::TextureLimitExceeded { edge, limit });
    }
    Ok(())
}

fn create_surface_texture(device: &wgpu::Device, target: FrameDimensions) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some("display_bridge.surface"),
        size: wgpu::Extent3d {
            width: target.width,
            height: target.height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba32Float,
        usage: wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use render_model::TileRect;

    fn create_device_queue() -> Option<(wgpu::Device, wgpu::Queue)> {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });
            let Ok(adapter) = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::LowPower,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
            else {
                return None;
            };
            adapter
                .request_device(&wgpu::DeviceDescriptor {
                    label: Some("display_bridge tests"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    experimental_features: wgpu::ExperimentalFeatures::disabled(),
                    memory_hints: wgpu::MemoryHints::Performance,
                    trace: wgpu::Trace::Off,
                })
                .await
                .ok()
        })
    }

    fn read_surface_rgba(surface: &GpuDisplaySurface, device: &wgpu::Device) -> Vec<f32> {
        let target = surface.target();
        let bytes_per_row = target.width * TEXEL_BYTES;
        assert_eq!(bytes_per_row % 256, 0, "readback rows must be aligned");
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("display_bridge.tests.readback"),
            size: bytes_per_row as u64 * target.height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("display_bridge.tests.readback"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: surface.texture(),
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(target.height),
                },
            },
            wgpu::Extent3d {
                width: target.width,
                height: target.height,
                depth_or_array_layers: 1,
            },
        );
        surface.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            sender.send(result).expect("map callback send");
        });
        device
            .poll(wgpu::PollType::wait_indefinitely())
            .expect("device poll");
        receiver
            .recv()
            .expect("map callback recv")
            .expect("map surface readback");
        let mapped = slice.get_mapped_range();
        let pixels = bytemuck::cast_slice::<u8, f32>(&mapped).to_vec();
        drop(mapped);
        buffer.unmap();
        pixels
    }

    #[test]
    fn uploaded_tile_reads_back_from_the_texture() {
        let Some((device, queue)) = create_device_queue() else {
            eprintln!("skipping gpu display test: no adapter available");
            return;
        };
        let frame = FrameDimensions::new(16, 16);
        let mut surface = GpuDisplaySurface::new(device.clone(), queue, frame, frame)
            .expect("build gpu surface");

        let rect = TileRect {
            x: 0,
            y: 0,
            width: 16,
            height: 8,
        };
        let update = TilePixels::host(rect, 3, vec![0.5; rect.pixel_count() * 3]);
        surface.update_tile(&update);

        let pixels = read_surface_rgba(&surface, &device);
        assert_eq!(pixels.len(), frame.pixel_count() * DISPLAY_CHANNELS);
        // Inside the tile: the uploaded gray, opaque.
        assert_eq!(pixels[0], 0.5);
        assert_eq!(pixels[3], 1.0);
        // Below the tile: untouched texture zeros.
        let below = (8 * 16) * DISPLAY_CHANNELS;
        assert_eq!(pixels[below], 0.0);
    }

    #[test]
    fn zero_clears_previous_uploads() {
        let Some((device, queue)) = create_device_queue() else {
            eprintln!("skipping gpu display test: no adapter available");
            return;
        };
        let frame = FrameDimensions::new(16, 16);
        let mut surface = GpuDisplaySurface::new(device.clone(), queue, frame, frame)
            .expect("build gpu surface");

        let rect = frame.as_rect();
        let update = TilePixels::host(rect, 3, vec![0.5; rect.pixel_count() * 3]);
        surface.update_tile(&update);
        surface.zero();

        let pixels = read_surface_rgba(&surface, &device);
        assert_eq!(pixels.len(), frame.pixel_count() * DISPLAY_CHANNELS);
        assert!(pixels.iter().all(|value| *value == 0.0));
    }

    #[test]
    fn zero_sized_surface_is_rejected() {
        let Some((device, queue)) = create_device_queue() else {
            eprintln!("skipping gpu display test: no adapter available");
            return;
        };
        let result = GpuDisplaySurface::new(
            device,
            queue,
            FrameDimensions::new(0, 4),
            FrameDimensions::new(4, 4),
        );
        assert_eq!(result.err(), Some(DisplayError::EmptySurface));
    }
}

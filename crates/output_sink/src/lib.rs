use std::collections::HashMap;

use render_buffers::RenderBuffer;
use render_model::FrameDimensions;
use trace_protocol::{OutputSink, PassInjection, PassReader, TileDescriptor, TileId};

/// `PassReader` over a tile's render buffer. Pass values are normalized
/// by the tile's sample count, so readers see resolved radiance rather
/// than raw accumulation sums.
pub struct BufferPassReader<'a> {
    buffer: &'a RenderBuffer,
}

impl<'a> BufferPassReader<'a> {
    pub fn new(buffer: &'a RenderBuffer) -> Self {
        Self { buffer }
    }
}

impl PassReader for BufferPassReader<'_> {
    fn get_pass_pixels(&self, pass_name: &str, channels: u32, destination: &mut Vec<f32>) -> bool {
        let Some(pass) = self.buffer.layout().find_pass(pass_name) else {
            return false;
        };
        if pass.channels != channels {
            log::warn!(
                "pass {pass_name:?} has {} channels, reader asked for {channels}",
                pass.channels
            );
            return false;
        }
        let Ok(pixels) = self.buffer.copy_out(self.buffer.rect(), pass_name) else {
            return false;
        };
        let samples = self.buffer.samples_rendered().max(1) as f32;
        destination.clear();
        destination.extend(pixels.iter().map(|value| value / samples));
        true
    }
}

/// In-memory sink assembling finished tiles into whole-frame pass
/// planes. Used by tests and the demo; a persistence layer would write
/// files here instead.
pub struct MemoryOutputSink {
    frame: FrameDimensions,
    passes: Vec<(String, u32)>,
    planes: HashMap<String, Vec<f32>>,
    injections: HashMap<TileId, PassInjection>,
    tiles_written: usize,
}

impl MemoryOutputSink {
    pub fn new(frame: FrameDimensions, passes: Vec<(String, u32)>) -> Self {
        let planes = passes
            .iter()
            .map(|(name, channels)| {
                (
                    name.clone(),
                    vec![0.0; frame.pixel_count() * *channels as usize],
                )
            })
            .collect();
        Self {
            frame,
            passes,
            planes,
            injections: HashMap::new(),
            tiles_written: 0,
        }
    }

    /// Register auxiliary data handed back through `read_tile` for one
    /// tile, before rendering starts.
    pub fn stage_injection(&mut self, tile_id: TileId, injection: PassInjection) {
        self.injections.insert(tile_id, injection);
    }

    pub fn tiles_written(&self) -> usize {
        self.tiles_written
    }

    pub fn pass_plane(&self, pass_name: &str) -> Option<&[f32]> {
        self.planes.get(pass_name).map(Vec::as_slice)
    }
}

impl OutputSink for MemoryOutputSink {
    fn write_tile(&mut self, descriptor: &TileDescriptor, reader: &dyn PassReader) {
        let mut scratch = Vec::new();
        for (name, channels) in &self.passes {
            if !reader.get_pass_pixels(name, *channels, &mut scratch) {
                log::warn!("skipping pass {name:?} for {}: not in buffer", descriptor.tile_id);
                continue;
            }
            let plane = self
                .planes
                .get_mut(name)
                .expect("plane exists for every declared pass");
            let channels = *channels as usize;
            let rect = descriptor.rect;
            let frame_row = self.frame.width as usize * channels;
            let tile_row = rect.width as usize * channels;
            for row in 0..rect.height as usize {
                let source = row * tile_row;
                let target = (rect.y as usize + row) * frame_row + rect.x as usize * channels;
                plane[target..target + tile_row].copy_from_slice(&scratch[source..source + tile_row]);
            }
        }
        self.tiles_written += 1;
    }

    fn read_tile(&mut self, descriptor: &TileDescriptor) -> Option<PassInjection> {
        self.injections.remove(&descriptor.tile_id)
    }
}

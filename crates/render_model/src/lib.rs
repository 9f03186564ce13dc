use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameDimensions {
    pub width: u32,
    pub height: u32,
}

impl FrameDimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn pixel_count(self) -> usize {
        self.width as usize * self.height as usize
    }

    pub const fn as_rect(self) -> TileRect {
        TileRect {
            x: 0,
            y: 0,
            width: self.width,
            height: self.height,
        }
    }
}

/// A rectangular, disjoint sub-region of the frame scheduled as one unit
/// of work. Coordinates are frame-absolute pixels.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TileRect {
    pub const fn pixel_count(self) -> usize {
        self.width as usize * self.height as usize
    }

    pub const fn right(self) -> u32 {
        self.x + self.width
    }

    pub const fn bottom(self) -> u32 {
        self.y + self.height
    }

    pub fn contains(self, other: TileRect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn overlaps(self, other: TileRect) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePartitionError {
    EmptyFrame,
    ZeroTileLimit,
}

impl fmt::Display for FramePartitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramePartitionError::EmptyFrame => write!(f, "frame has zero width or height"),
            FramePartitionError::ZeroTileLimit => write!(f, "tile size limit has a zero edge"),
        }
    }
}

/// Partition the frame into tiles no larger than `tile_limit` per edge.
///
/// The tiles exactly cover the frame rectangle with no overlaps; edge tiles
/// absorb the remainder and may be smaller than the limit. Tiles are emitted
/// in row-major order.
pub fn partition_frame(
    frame: FrameDimensions,
    tile_limit_x: u32,
    tile_limit_y: u32,
) -> Result<Vec<TileRect>, FramePartitionError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(FramePartitionError::EmptyFrame);
    }
    if tile_limit_x == 0 || tile_limit_y == 0 {
        return Err(FramePartitionError::ZeroTileLimit);
    }

    let tiles_per_row = frame.width.div_ceil(tile_limit_x);
    let tiles_per_column = frame.height.div_ceil(tile_limit_y);
    let mut tiles = Vec::with_capacity(tiles_per_row as usize * tiles_per_column as usize);
    for tile_y in 0..tiles_per_column {
        let y = tile_y * tile_limit_y;
        let height = tile_limit_y.min(frame.height - y);
        for tile_x in 0..tiles_per_row {
            let x = tile_x * tile_limit_x;
            let width = tile_limit_x.min(frame.width - x);
            tiles.push(TileRect {
                x,
                y,
                width,
                height,
            });
        }
    }
    Ok(tiles)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassDesc {
    pub name: String,
    pub channels: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassLayoutError {
    EmptyLayout,
    ZeroChannelPass,
    DuplicatePassName,
}

impl fmt::Display for PassLayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassLayoutError::EmptyLayout => write!(f, "pass layout declares no passes"),
            PassLayoutError::ZeroChannelPass => write!(f, "pass declares zero channels"),
            PassLayoutError::DuplicatePassName => write!(f, "pass name declared twice"),
        }
    }
}

/// Opaque channel-layout descriptor negotiated with the scene/compile
/// layer. The buffer core only needs pass offsets and the total stride.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassLayout {
    passes: Vec<PassDesc>,
    pass_stride: u32,
}

impl PassLayout {
    pub fn new(
        declared: impl IntoIterator<Item = (String, u32)>,
    ) -> Result<Self, PassLayoutError> {
        let mut passes = Vec::new();
        let mut offset = 0;
        for (name, channels) in declared {
            if channels == 0 {
                return Err(PassLayoutError::ZeroChannelPass);
            }
            if passes.iter().any(|pass: &PassDesc| pass.name == name) {
                return Err(PassLayoutError::DuplicatePassName);
            }
            passes.push(PassDesc {
                name,
                channels,
                offset,
            });
            offset += channels;
        }
        if passes.is_empty() {
            return Err(PassLayoutError::EmptyLayout);
        }
        Ok(Self {
            passes,
            pass_stride: offset,
        })
    }

    pub const fn pass_stride(&self) -> u32 {
        self.pass_stride
    }

    pub fn passes(&self) -> &[PassDesc] {
        &self.passes
    }

    pub fn find_pass(&self, name: &str) -> Option<&PassDesc> {
        self.passes.iter().find(|pass| pass.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covered_pixels(tiles: &[TileRect]) -> usize {
        tiles.iter().map(|tile| tile.pixel_count()).sum()
    }

    #[test]
    fn partition_exactly_covers_frame_without_overlap() {
        let frame = FrameDimensions::new(64, 64);
        let tiles = partition_frame(frame, 16, 16).expect("partition 64x64 frame");

        assert_eq!(tiles.len(), 16);
        assert_eq!(covered_pixels(&tiles), frame.pixel_count());
        for (index, tile) in tiles.iter().enumerate() {
            assert!(frame.as_rect().contains(*tile));
            for other in &tiles[index + 1..] {
                assert!(
                    !tile.overlaps(*other),
                    "tiles {tile:?} and {other:?} overlap"
                );
            }
        }
    }

    #[test]
    fn partition_absorbs_remainder_on_frame_edges() {
        let frame = FrameDimensions::new(70, 33);
        let tiles = partition_frame(frame, 32, 32).expect("partition 70x33 frame");

        assert_eq!(tiles.len(), 6);
        assert_eq!(covered_pixels(&tiles), frame.pixel_count());
        let last = tiles.last().expect("at least one tile");
        assert_eq!(last.width, 6);
        assert_eq!(last.height, 1);
    }

    #[test]
    fn partition_with_limit_larger_than_frame_yields_single_tile() {
        let frame = FrameDimensions::new(17, 9);
        let tiles = partition_frame(frame, 256, 256).expect("partition small frame");
        assert_eq!(tiles, vec![frame.as_rect()]);
    }

    #[test]
    fn partition_rejects_degenerate_inputs() {
        assert_eq!(
            partition_frame(FrameDimensions::new(0, 8), 16, 16),
            Err(FramePartitionError::EmptyFrame)
        );
        assert_eq!(
            partition_frame(FrameDimensions::new(8, 8), 0, 16),
            Err(FramePartitionError::ZeroTileLimit)
        );
    }

    #[test]
    fn pass_layout_assigns_sequential_offsets() {
        let layout = PassLayout::new([
            ("combined".to_string(), 4),
            ("depth".to_string(), 1),
            ("sample_sq_sum".to_string(), 1),
        ])
        .expect("build pass layout");

        assert_eq!(layout.pass_stride(), 6);
        let depth = layout.find_pass("depth").expect("depth pass exists");
        assert_eq!(depth.offset, 4);
        assert_eq!(depth.channels, 1);
        assert!(layout.find_pass("normal").is_none());
    }

    #[test]
    fn pass_layout_rejects_duplicate_names() {
        let result = PassLayout::new([("combined".to_string(), 4), ("combined".to_string(), 1)]);
        assert_eq!(result, Err(PassLayoutError::DuplicatePassName));
    }
}

/// `GL_TEXTURE_2D`, the only texture target the interop path imports as a 2D image.
pub const GL_TEXTURE_2D: u32 = 0x0DE1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOrder {
    R,
    Rg,
    Rgba,
    Bgra,
}

impl ChannelOrder {
    pub fn channels(self) -> usize {
        match self {
            ChannelOrder::R => 1,
            ChannelOrder::Rg => 2,
            ChannelOrder::Rgba | ChannelOrder::Bgra => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    UnormInt8,
    UnsignedInt8,
    UnsignedInt16,
    UnsignedInt32,
    HalfFloat,
    Float,
}

impl ChannelType {
    pub fn size(self) -> usize {
        match self {
            ChannelType::UnormInt8 | ChannelType::UnsignedInt8 => 1,
            ChannelType::UnsignedInt16 | ChannelType::HalfFloat => 2,
            ChannelType::UnsignedInt32 | ChannelType::Float => 4,
        }
    }
}

/// Pixel layout of an image: channel order plus per-channel storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageFormat {
    pub order: ChannelOrder,
    pub data_type: ChannelType,
}

impl ImageFormat {
    pub const RGBA8: ImageFormat = ImageFormat::new(ChannelOrder::Rgba, ChannelType::UnormInt8);
    pub const BGRA8: ImageFormat = ImageFormat::new(ChannelOrder::Bgra, ChannelType::UnormInt8);
    pub const R32F: ImageFormat = ImageFormat::new(ChannelOrder::R, ChannelType::Float);
    pub const RGBA32F: ImageFormat = ImageFormat::new(ChannelOrder::Rgba, ChannelType::Float);

    pub const fn new(order: ChannelOrder, data_type: ChannelType) -> Self {
        Self { order, data_type }
    }

    pub fn bytes_per_pixel(self) -> usize {
        self.order.channels() * self.data_type.size()
    }

    /// Bytes needed for a tightly packed `width` x `height` region, or `None` on overflow.
    pub fn region_len(self, width: usize, height: usize) -> Option<usize> {
        width
            .checked_mul(height)?
            .checked_mul(self.bytes_per_pixel())
    }
}

/// Shape of a 2D image object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDesc {
    pub format: ImageFormat,
    pub width: usize,
    pub height: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlObjectKind {
    Buffer,
    Texture,
}

/// Capability token naming an object owned by the graphics subsystem.
///
/// The fields are passed to the backend verbatim; only the backend interprets them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlObjectToken {
    pub kind: GlObjectKind,
    pub name: u32,
    pub target: u32,
    pub mip_level: i32,
}

impl GlObjectToken {
    pub fn buffer(name: u32) -> Self {
        Self {
            kind: GlObjectKind::Buffer,
            name,
            target: 0,
            mip_level: 0,
        }
    }

    pub fn texture_2d(name: u32, mip_level: i32) -> Self {
        Self {
            kind: GlObjectKind::Texture,
            name,
            target: GL_TEXTURE_2D,
            mip_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_sizes() {
        assert_eq!(ImageFormat::RGBA8.bytes_per_pixel(), 4);
        assert_eq!(ImageFormat::RGBA32F.bytes_per_pixel(), 16);
        assert_eq!(
            ImageFormat::new(ChannelOrder::Rg, ChannelType::HalfFloat).bytes_per_pixel(),
            4
        );
        assert_eq!(ImageFormat::R32F.region_len(3, 2), Some(24));
        assert_eq!(ImageFormat::R32F.region_len(usize::MAX, 2), None);
    }
}

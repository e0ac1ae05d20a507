//! A fake graphics share group.
//!
//! Stands in for the graphics subsystem in interop tests: objects are plain byte arrays named by
//! integer ids, and a context created with [`SHARE_GROUP`] may import them. Acquire copies the
//! graphics contents into the compute object and release writes them back, which makes
//! ownership mistakes observable.

use std::collections::HashMap;

use accel_sys::{GlObjectKind, GlObjectToken, ImageFormat, Status, GL_TEXTURE_2D};

/// The only share group the reference runtime knows.
pub(crate) const SHARE_GROUP: u64 = 0x0061_CC51;

pub(crate) struct GlTexture {
    pub format: ImageFormat,
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

/// What a token resolves to when imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GlShape {
    Buffer { size: usize },
    Texture2d {
        format: ImageFormat,
        width: usize,
        height: usize,
    },
}

#[derive(Default)]
pub(crate) struct GlObjects {
    next_name: u32,
    textures: HashMap<u32, GlTexture>,
    buffers: HashMap<u32, Vec<u8>>,
}

impl GlObjects {
    fn alloc_name(&mut self) -> u32 {
        self.next_name += 1;
        self.next_name
    }

    pub fn create_texture(
        &mut self,
        format: ImageFormat,
        width: usize,
        height: usize,
        pixels: &[u8],
    ) -> Result<GlObjectToken, Status> {
        if width == 0 || height == 0 {
            return Err(Status::INVALID_IMAGE_SIZE);
        }
        if format.region_len(width, height) != Some(pixels.len()) {
            return Err(Status::INVALID_VALUE);
        }
        let name = self.alloc_name();
        self.textures.insert(
            name,
            GlTexture {
                format,
                width,
                height,
                pixels: pixels.to_vec(),
            },
        );
        Ok(GlObjectToken::texture_2d(name, 0))
    }

    pub fn create_buffer(&mut self, data: &[u8]) -> GlObjectToken {
        let name = self.alloc_name();
        self.buffers.insert(name, data.to_vec());
        GlObjectToken::buffer(name)
    }

    pub fn texture(&self, name: u32) -> Option<&GlTexture> {
        self.textures.get(&name)
    }

    pub fn buffer(&self, name: u32) -> Option<&[u8]> {
        self.buffers.get(&name).map(Vec::as_slice)
    }

    /// Validates an import request.
    pub fn describe(&self, token: GlObjectToken) -> Result<GlShape, Status> {
        match token.kind {
            GlObjectKind::Buffer => self
                .buffers
                .get(&token.name)
                .map(|data| GlShape::Buffer { size: data.len() })
                .ok_or(Status::INVALID_GL_OBJECT),
            GlObjectKind::Texture => {
                if token.target != GL_TEXTURE_2D {
                    return Err(Status::INVALID_VALUE);
                }
                if token.mip_level != 0 {
                    return Err(Status::INVALID_MIP_LEVEL);
                }
                self.textures
                    .get(&token.name)
                    .map(|t| GlShape::Texture2d {
                        format: t.format,
                        width: t.width,
                        height: t.height,
                    })
                    .ok_or(Status::INVALID_GL_OBJECT)
            }
        }
    }

    pub fn contents(&self, token: GlObjectToken) -> Result<&[u8], Status> {
        match token.kind {
            GlObjectKind::Buffer => self.buffer(token.name),
            GlObjectKind::Texture => self.texture(token.name).map(|t| t.pixels.as_slice()),
        }
        .ok_or(Status::INVALID_GL_OBJECT)
    }

    /// Overwrites the whole object. The length must not change.
    pub fn store(&mut self, token: GlObjectToken, data: &[u8]) -> Result<(), Status> {
        let dst = match token.kind {
            GlObjectKind::Buffer => self.buffers.get_mut(&token.name),
            GlObjectKind::Texture => self.textures.get_mut(&token.name).map(|t| &mut t.pixels),
        }
        .ok_or(Status::INVALID_GL_OBJECT)?;
        if dst.len() != data.len() {
            return Err(Status::INVALID_VALUE);
        }
        dst.copy_from_slice(data);
        Ok(())
    }
}

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use accel_sys::{GlObjectKind, GlObjectToken, HostBytes, ImageFormat, MemFlags, MemParam, RawMem};
use tracing::debug;

use crate::context::Context;
use crate::error::{Error, Request, Result};
use crate::handle::{Handle, MemKind};
use crate::query::{fetch_bytes, InfoValue};

/// Whether interop acquire/release discipline is tracked host-side.
const CHECKED: bool = cfg!(any(debug_assertions, feature = "checked"));

/// How kernels may access a memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemAccess {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

impl MemAccess {
    pub(crate) fn flags(self, mappable: bool) -> MemFlags {
        let access = match self {
            MemAccess::ReadWrite => MemFlags::READ_WRITE,
            MemAccess::ReadOnly => MemFlags::READ_ONLY,
            MemAccess::WriteOnly => MemFlags::WRITE_ONLY,
        };
        if mappable {
            access | MemFlags::ALLOC_HOST_PTR
        } else {
            access
        }
    }
}

/// Ownership of a graphics-interop object between the graphics API and the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteropState {
    /// Owned by the graphics API; device commands must not touch it.
    Released,
    /// Acquired for device use by an enqueued acquire.
    Acquired,
}

/// State shared by every memory object kind.
#[derive(Clone)]
pub struct MemCore {
    handle: Handle<MemKind>,
    context: Context,
    size: usize,
    access: MemAccess,
    mappable: bool,
    /// `Some` for graphics-interop objects; set while acquired.
    acquired: Option<Arc<AtomicBool>>,
}

impl MemCore {
    fn adopt(context: &Context, raw: RawMem, size: usize, access: MemAccess) -> Self {
        Self {
            handle: Handle::adopt(context.backend().clone(), raw),
            context: context.clone(),
            size,
            access,
            mappable: false,
            acquired: None,
        }
    }

    fn import_gl(
        op: &'static str,
        context: &Context,
        access: MemAccess,
        token: GlObjectToken,
    ) -> Result<Self> {
        context.ensure_alive(op)?;
        if context.gl_share_group().is_none() {
            return Err(Error::configuration(
                op,
                "context was created without a graphics share group",
            ));
        }
        let result = context
            .backend()
            .create_from_gl(context.raw(), access.flags(false), token);
        let raw = context.check(op, result)?;
        let mut core = Self::adopt(context, raw, 0, access);
        let size = fetch_bytes(op, |out| {
            context.backend().mem_info(raw, MemParam::Size, out)
        })?;
        core.size = usize::decode(op, &size)?;
        core.acquired = Some(Arc::new(AtomicBool::new(false)));
        debug!(%raw, ?token, size = core.size, "imported graphics object");
        Ok(core)
    }

    pub(crate) fn interop_state(&self) -> Option<InteropState> {
        self.acquired.as_ref().map(|flag| {
            if flag.load(Ordering::Acquire) {
                InteropState::Acquired
            } else {
                InteropState::Released
            }
        })
    }

    /// Rejects device use of a released interop object in checked builds.
    pub(crate) fn ensure_usable(&self, op: &'static str) -> Result<()> {
        if CHECKED && self.interop_state() == Some(InteropState::Released) {
            return Err(Error::configuration(
                op,
                format!(
                    "graphics object {} used by the device while released",
                    self.handle.raw()
                ),
            ));
        }
        Ok(())
    }

    /// Checks an acquire or release is legal: the object must be an interop object and, in
    /// checked builds, currently in `expected`.
    pub(crate) fn expect_interop(&self, op: &'static str, expected: InteropState) -> Result<()> {
        match self.interop_state() {
            None => Err(Error::configuration(
                op,
                format!("{} is not a graphics interop object", self.handle.raw()),
            )),
            Some(state) if CHECKED && state != expected => Err(Error::configuration(
                op,
                format!(
                    "graphics object {} is {}",
                    self.handle.raw(),
                    match state {
                        InteropState::Acquired => "already acquired",
                        InteropState::Released => "not acquired",
                    }
                ),
            )),
            Some(_) => Ok(()),
        }
    }

    pub(crate) fn set_interop_state(&self, state: InteropState) {
        if let Some(flag) = &self.acquired {
            flag.store(state == InteropState::Acquired, Ordering::Release);
        }
    }
}

/// Crate-internal access to the shared state behind a memory object.
pub(crate) fn core_of<M: MemoryObject + ?Sized>(object: &M) -> &MemCore {
    object.core()
}

mod sealed {
    pub trait Sealed {
        fn core(&self) -> &super::MemCore;
    }
}

/// Common view of buffers and images.
pub trait MemoryObject: sealed::Sealed {
    fn raw(&self) -> RawMem {
        self.core().handle.raw()
    }

    fn context(&self) -> &Context {
        &self.core().context
    }

    /// Size in bytes.
    fn size(&self) -> usize {
        self.core().size
    }

    fn access(&self) -> MemAccess {
        self.core().access
    }

    /// Whether the object was imported from the graphics API.
    fn is_interop(&self) -> bool {
        self.core().acquired.is_some()
    }

    /// `None` unless the object was imported from the graphics API.
    fn interop_state(&self) -> Option<InteropState> {
        self.core().interop_state()
    }

    fn reference_count(&self) -> Result<u32> {
        self.core().handle.reference_count()
    }
}

impl<T: sealed::Sealed> MemoryObject for T {}

/// A linear device allocation.
#[derive(Clone)]
pub struct Buffer {
    core: MemCore,
}

impl Buffer {
    pub fn new(context: &Context, size: usize, access: MemAccess) -> Result<Self> {
        Self::create("Buffer::new", context, size, access, false, None)
    }

    /// A buffer the backend allocates in host-accessible memory.
    pub fn new_mappable(context: &Context, size: usize, access: MemAccess) -> Result<Self> {
        Self::create("Buffer::new", context, size, access, true, None)
    }

    /// A buffer initialized with a copy of `data`.
    pub fn with_data(context: &Context, access: MemAccess, data: &[u8]) -> Result<Self> {
        Self::create(
            "Buffer::with_data",
            context,
            data.len(),
            access,
            false,
            Some(HostBytes::from(data)),
        )
    }

    /// A mappable buffer initialized with a copy of `data`.
    pub fn with_data_mappable(context: &Context, access: MemAccess, data: &[u8]) -> Result<Self> {
        Self::create(
            "Buffer::with_data",
            context,
            data.len(),
            access,
            true,
            Some(HostBytes::from(data)),
        )
    }

    /// Imports a graphics buffer. The context must have been built with a share group.
    pub fn from_gl_buffer(context: &Context, access: MemAccess, token: GlObjectToken) -> Result<Self> {
        const OP: &str = "Buffer::from_gl_buffer";
        if token.kind != GlObjectKind::Buffer {
            return Err(Error::configuration(OP, "token does not name a graphics buffer"));
        }
        Ok(Self {
            core: MemCore::import_gl(OP, context, access, token)?,
        })
    }

    fn create(
        op: &'static str,
        context: &Context,
        size: usize,
        access: MemAccess,
        mappable: bool,
        init: Option<HostBytes>,
    ) -> Result<Self> {
        context.ensure_alive(op)?;
        let mut flags = access.flags(mappable);
        if init.is_some() {
            flags |= MemFlags::COPY_HOST_PTR;
        }
        let result = context
            .backend()
            .create_buffer(context.raw(), flags, size, init);
        let raw = context
            .check(op, result)
            .map_err(|e| e.with_request(Request::Bytes(size)))?;
        let mut core = MemCore::adopt(context, raw, size, access);
        core.mappable = mappable;
        Ok(Self { core })
    }

    pub fn is_mappable(&self) -> bool {
        self.core.mappable
    }
}

impl sealed::Sealed for Buffer {
    fn core(&self) -> &MemCore {
        &self.core
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("raw", &self.raw())
            .field("size", &self.core.size)
            .field("access", &self.core.access)
            .finish()
    }
}

/// A two-dimensional image.
#[derive(Clone)]
pub struct Image2D {
    core: MemCore,
    format: ImageFormat,
    width: usize,
    height: usize,
}

impl Image2D {
    pub fn new(
        context: &Context,
        format: ImageFormat,
        width: usize,
        height: usize,
        access: MemAccess,
    ) -> Result<Self> {
        Self::create("Image2D::new", context, format, width, height, access, None)
    }

    /// An image initialized from tightly packed rows of pixels.
    pub fn with_data(
        context: &Context,
        format: ImageFormat,
        width: usize,
        height: usize,
        access: MemAccess,
        data: &[u8],
    ) -> Result<Self> {
        Self::create(
            "Image2D::with_data",
            context,
            format,
            width,
            height,
            access,
            Some(data),
        )
    }

    /// Imports level `mip_level` of a graphics 2D texture.
    pub fn from_gl_texture(
        context: &Context,
        access: MemAccess,
        token: GlObjectToken,
    ) -> Result<Self> {
        const OP: &str = "Image2D::from_gl_texture";
        if token.kind != GlObjectKind::Texture {
            return Err(Error::configuration(OP, "token does not name a texture"));
        }
        let core = MemCore::import_gl(OP, context, access, token)?;
        let result = context.backend().image_desc(core.handle.raw());
        let desc = context.check(OP, result)?;
        Ok(Self {
            core,
            format: desc.format,
            width: desc.width,
            height: desc.height,
        })
    }

    fn create(
        op: &'static str,
        context: &Context,
        format: ImageFormat,
        width: usize,
        height: usize,
        access: MemAccess,
        data: Option<&[u8]>,
    ) -> Result<Self> {
        context.ensure_alive(op)?;
        if width == 0 || height == 0 {
            return Err(Error::configuration(
                op,
                format!("image dimensions {width}x{height} must be non-zero"),
            ));
        }
        let size = format
            .region_len(width, height)
            .ok_or_else(|| Error::configuration(op, "image size overflows"))?;
        if let Some(data) = data {
            if data.len() != size {
                return Err(Error::configuration(
                    op,
                    format!("{} bytes of pixels for a {size} byte image", data.len()),
                ));
            }
        }
        for device in context.devices() {
            let (max_width, max_height) = device.image2d_max_size()?;
            if width > max_width || height > max_height {
                return Err(Error::configuration(
                    op,
                    format!(
                        "{width}x{height} exceeds the {max_width}x{max_height} limit of device {}",
                        device.raw()
                    ),
                ));
            }
        }
        if !context.supported_image_formats(access)?.contains(&format) {
            return Err(Error::configuration(
                op,
                format!("unsupported image format {format:?}"),
            ));
        }

        let mut flags = access.flags(false);
        if data.is_some() {
            flags |= MemFlags::COPY_HOST_PTR;
        }
        let result = context.backend().create_image2d(
            context.raw(),
            flags,
            format,
            width,
            height,
            data.map(HostBytes::from),
        );
        let raw = context.check(op, result).map_err(|e| {
            e.with_request(Request::Image {
                format,
                width,
                height,
            })
        })?;
        Ok(Self {
            core: MemCore::adopt(context, raw, size, access),
            format,
            width,
            height,
        })
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Bytes per tightly packed row.
    pub fn row_pitch(&self) -> usize {
        self.width * self.format.bytes_per_pixel()
    }
}

impl sealed::Sealed for Image2D {
    fn core(&self) -> &MemCore {
        &self.core
    }
}

impl fmt::Debug for Image2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image2D")
            .field("raw", &self.raw())
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

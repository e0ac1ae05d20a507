//! Native call surface for `accel` compute backends.
//!
//! Everything a backend exposes is reached through the object-safe [`Backend`] trait. Objects are
//! named by opaque non-zero ids ([`RawHandle`] and its typed wrappers), every call reports a native
//! [`Status`], and host memory crosses the boundary only as owned values ([`HostBytes`] /
//! [`HostSink`]), so no call on this surface needs `unsafe`.
//!
//! This crate deliberately carries no policy: reference counting, error classification and
//! ordering guarantees live in `accel-cl`; `accel-soft` provides an in-process implementation.

#![forbid(unsafe_code)]

mod backend;
mod flags;
mod handle;
mod host;
mod image;
mod info;
mod status;

pub use backend::{
    Backend, CommandType, ContextDesc, EventStatus, KernelArgValue, NdRangeDesc, NotifyFn,
};
pub use flags::{DeviceType, MemFlags, QueueProperties};
pub use handle::{
    ObjectKind, RawContext, RawDevice, RawEvent, RawHandle, RawKernel, RawMem, RawPlatform,
    RawProgram, RawQueue,
};
pub use host::{HostBytes, HostSink};
pub use image::{
    ChannelOrder, ChannelType, GlObjectKind, GlObjectToken, ImageDesc, ImageFormat, GL_TEXTURE_2D,
};
pub use info::{
    BuildStatus, DeviceParam, KernelParam, KernelWorkGroupParam, MemParam, PlatformParam,
    ProfilingParam, ProgramBuildParam, ProgramParam,
};
pub use status::Status;

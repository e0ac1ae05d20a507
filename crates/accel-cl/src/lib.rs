//! Safe host API for `accel` compute backends.
//!
//! Every native object is owned by a reference-counted handle: cloning retains, dropping
//! releases, and objects keep the context they were created from alive. Failures surface as
//! [`Error`] values classified by [`ErrorKind`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use accel_cl::{
//!     get_platforms, Buffer, CommandQueue, Context, MemAccess, NdRange, Program, QueueOptions,
//! };
//! use accel_soft::{SoftConfig, SoftRuntime};
//!
//! # fn main() -> accel_cl::Result<()> {
//! let runtime = SoftRuntime::new(SoftConfig::default()).unwrap();
//! runtime.register_kernel("twice", |launch| {
//!     for i in 0..launch.global_size(0) {
//!         let x: u32 = launch.load(0, i)?;
//!         launch.store(0, i, x * 2)?;
//!     }
//!     Ok(())
//! });
//! let backend: Arc<dyn accel_cl::Backend> = runtime;
//!
//! let platform = get_platforms(&backend)?.remove(0);
//! let devices = platform.get_devices()?;
//! let context = Context::new(&platform, &devices)?;
//! let queue = CommandQueue::new(&context, &devices[0], QueueOptions::default())?;
//!
//! let program = Program::with_source(&context, "__kernel void twice(__global uint *v) {}")?;
//! program.build("")?;
//! let kernel = program.get_kernel("twice")?;
//!
//! let input: Vec<u8> = (0..64u32).flat_map(u32::to_ne_bytes).collect();
//! let buffer = Buffer::with_data(&context, MemAccess::ReadWrite, &input)?;
//! kernel.set_arg(0, &buffer)?;
//! let done = queue.run_kernel(&kernel, &NdRange::linear(64), &[])?;
//!
//! let mut output = vec![0u8; input.len()];
//! queue.read_buffer(&buffer, 0, &mut output, false, &[done])?.wait()?;
//! # Ok(())
//! # }
//! ```

mod context;
mod device;
pub mod device_info;
mod error;
mod event;
mod handle;
mod kernel;
mod memory;
mod platform;
mod program;
mod query;
mod queue;

pub use context::{Context, ContextBuilder};
pub use device::{Device, DeviceInfo};
pub use error::{BuildLog, Error, ErrorKind, Request, Result, StatusExt};
pub use event::{Event, Profiling};
pub use kernel::{Kernel, KernelArg};
pub use memory::{Buffer, Image2D, InteropState, MemAccess, MemoryObject};
pub use platform::{get_platforms, Platform};
pub use program::Program;
pub use query::InfoValue;
pub use queue::{CommandQueue, NdRange, Pending, QueueOptions};

pub use accel_sys::{
    Backend, BuildStatus, ChannelOrder, ChannelType, CommandType, DeviceType, EventStatus,
    GlObjectToken, ImageFormat, Status,
};

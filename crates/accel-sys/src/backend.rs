use std::fmt;
use std::sync::Arc;

use crate::{
    DeviceParam, DeviceType, GlObjectToken, HostBytes, HostSink, ImageDesc, ImageFormat,
    KernelParam, KernelWorkGroupParam, MemFlags, MemParam, ObjectKind, PlatformParam,
    ProfilingParam, ProgramBuildParam, ProgramParam, QueueProperties, RawContext, RawDevice,
    RawEvent, RawHandle, RawKernel, RawMem, RawPlatform, RawProgram, RawQueue, Status,
};

/// Asynchronous context error notification: a message plus backend-private diagnostic bytes.
///
/// Backends may invoke it from any thread, but never while holding their own internal locks.
pub type NotifyFn = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct ContextDesc<'a> {
    pub platform: RawPlatform,
    pub devices: &'a [RawDevice],
    /// Graphics share group the context may import objects from.
    pub gl_share_group: Option<u64>,
}

/// A kernel argument as the backend receives it.
#[derive(Debug, Clone, Copy)]
pub enum KernelArgValue<'a> {
    /// A by-value argument, passed as an opaque sized blob.
    Bytes(&'a [u8]),
    Mem(RawMem),
    /// Size in bytes of a `__local` allocation.
    Local(usize),
}

/// An N-dimensional launch. Only the first `work_dim` entries of each array are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRangeDesc {
    pub work_dim: u32,
    pub global_offset: [usize; 3],
    pub global: [usize; 3],
    pub local: Option<[usize; 3]>,
}

/// Execution state of the command behind an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    /// Terminated abnormally with the given status.
    Error(Status),
}

impl EventStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Complete | EventStatus::Error(_))
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventStatus::Queued => f.write_str("queued"),
            EventStatus::Submitted => f.write_str("submitted"),
            EventStatus::Running => f.write_str("running"),
            EventStatus::Complete => f.write_str("complete"),
            EventStatus::Error(status) => write!(f, "error: {status}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    ReadBuffer,
    WriteBuffer,
    CopyBuffer,
    ReadImage,
    WriteImage,
    NdRangeKernel,
    AcquireGlObjects,
    ReleaseGlObjects,
    Marker,
}

/// The native compute API.
///
/// Reference counting is explicit: every `create_*` and every `enqueue_*` returns an object
/// holding one reference owned by the caller, [`Backend::retain`] adds one, and
/// [`Backend::release`] drops one. Objects may outlive the caller's references while the backend
/// still needs them internally (e.g. memory used by an in-flight command).
///
/// All `enqueue_*` calls return as soon as the command is recorded unless `blocking` is set.
pub trait Backend: Send + Sync {
    fn platform_ids(&self, out: Option<&mut [RawPlatform]>) -> Result<usize, Status>;

    fn platform_info(
        &self,
        platform: RawPlatform,
        param: PlatformParam,
        out: Option<&mut [u8]>,
    ) -> Result<usize, Status>;

    fn device_ids(
        &self,
        platform: RawPlatform,
        device_type: DeviceType,
        out: Option<&mut [RawDevice]>,
    ) -> Result<usize, Status>;

    fn device_info(
        &self,
        device: RawDevice,
        param: DeviceParam,
        out: Option<&mut [u8]>,
    ) -> Result<usize, Status>;

    fn retain(&self, kind: ObjectKind, handle: RawHandle) -> Result<(), Status>;

    fn release(&self, kind: ObjectKind, handle: RawHandle) -> Result<(), Status>;

    fn reference_count(&self, kind: ObjectKind, handle: RawHandle) -> Result<u32, Status>;

    fn create_context(
        &self,
        desc: &ContextDesc<'_>,
        notify: Option<NotifyFn>,
    ) -> Result<RawContext, Status>;

    fn supported_image_formats(
        &self,
        context: RawContext,
        flags: MemFlags,
    ) -> Result<Vec<ImageFormat>, Status>;

    fn create_queue(
        &self,
        context: RawContext,
        device: RawDevice,
        properties: QueueProperties,
    ) -> Result<RawQueue, Status>;

    fn flush(&self, queue: RawQueue) -> Result<(), Status>;

    fn finish(&self, queue: RawQueue) -> Result<(), Status>;

    fn create_buffer(
        &self,
        context: RawContext,
        flags: MemFlags,
        size: usize,
        init: Option<HostBytes>,
    ) -> Result<RawMem, Status>;

    fn create_image2d(
        &self,
        context: RawContext,
        flags: MemFlags,
        format: ImageFormat,
        width: usize,
        height: usize,
        init: Option<HostBytes>,
    ) -> Result<RawMem, Status>;

    fn create_from_gl(
        &self,
        context: RawContext,
        flags: MemFlags,
        token: GlObjectToken,
    ) -> Result<RawMem, Status>;

    fn mem_info(
        &self,
        mem: RawMem,
        param: MemParam,
        out: Option<&mut [u8]>,
    ) -> Result<usize, Status>;

    /// Fails with `INVALID_MEM_OBJECT` for buffers.
    fn image_desc(&self, image: RawMem) -> Result<ImageDesc, Status>;

    fn create_program(&self, context: RawContext, sources: &[&str]) -> Result<RawProgram, Status>;

    /// Builds for `devices`, or for every device of the program's context when empty.
    fn build_program(
        &self,
        program: RawProgram,
        devices: &[RawDevice],
        options: &str,
    ) -> Result<(), Status>;

    fn program_info(
        &self,
        program: RawProgram,
        param: ProgramParam,
        out: Option<&mut [u8]>,
    ) -> Result<usize, Status>;

    fn program_build_info(
        &self,
        program: RawProgram,
        device: RawDevice,
        param: ProgramBuildParam,
        out: Option<&mut [u8]>,
    ) -> Result<usize, Status>;

    fn create_kernel(&self, program: RawProgram, name: &str) -> Result<RawKernel, Status>;

    fn kernel_info(
        &self,
        kernel: RawKernel,
        param: KernelParam,
        out: Option<&mut [u8]>,
    ) -> Result<usize, Status>;

    fn set_kernel_arg(
        &self,
        kernel: RawKernel,
        index: u32,
        value: KernelArgValue<'_>,
    ) -> Result<(), Status>;

    fn kernel_work_group_info(
        &self,
        kernel: RawKernel,
        device: RawDevice,
        param: KernelWorkGroupParam,
        out: Option<&mut [u8]>,
    ) -> Result<usize, Status>;

    #[allow(clippy::too_many_arguments)]
    fn enqueue_read_buffer(
        &self,
        queue: RawQueue,
        mem: RawMem,
        blocking: bool,
        offset: usize,
        dst: HostSink,
        wait: &[RawEvent],
    ) -> Result<RawEvent, Status>;

    fn enqueue_write_buffer(
        &self,
        queue: RawQueue,
        mem: RawMem,
        blocking: bool,
        offset: usize,
        src: HostBytes,
        wait: &[RawEvent],
    ) -> Result<RawEvent, Status>;

    #[allow(clippy::too_many_arguments)]
    fn enqueue_copy_buffer(
        &self,
        queue: RawQueue,
        src: RawMem,
        dst: RawMem,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
        wait: &[RawEvent],
    ) -> Result<RawEvent, Status>;

    #[allow(clippy::too_many_arguments)]
    fn enqueue_read_image(
        &self,
        queue: RawQueue,
        image: RawMem,
        blocking: bool,
        origin: [usize; 2],
        region: [usize; 2],
        dst: HostSink,
        wait: &[RawEvent],
    ) -> Result<RawEvent, Status>;

    #[allow(clippy::too_many_arguments)]
    fn enqueue_write_image(
        &self,
        queue: RawQueue,
        image: RawMem,
        blocking: bool,
        origin: [usize; 2],
        region: [usize; 2],
        src: HostBytes,
        wait: &[RawEvent],
    ) -> Result<RawEvent, Status>;

    fn enqueue_nd_range(
        &self,
        queue: RawQueue,
        kernel: RawKernel,
        range: &NdRangeDesc,
        wait: &[RawEvent],
    ) -> Result<RawEvent, Status>;

    fn enqueue_acquire_gl(
        &self,
        queue: RawQueue,
        objects: &[RawMem],
        wait: &[RawEvent],
    ) -> Result<RawEvent, Status>;

    fn enqueue_release_gl(
        &self,
        queue: RawQueue,
        objects: &[RawMem],
        wait: &[RawEvent],
    ) -> Result<RawEvent, Status>;

    fn enqueue_marker(&self, queue: RawQueue, wait: &[RawEvent]) -> Result<RawEvent, Status>;

    fn event_status(&self, event: RawEvent) -> Result<EventStatus, Status>;

    fn event_command_type(&self, event: RawEvent) -> Result<CommandType, Status>;

    /// Device timestamp in nanoseconds. Only available for events of profiling-enabled queues
    /// once the corresponding state has been reached.
    fn event_profiling(&self, event: RawEvent, param: ProfilingParam) -> Result<u64, Status>;

    /// Blocks until every event is terminal. Fails with
    /// [`Status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST`] if any of them ended in error.
    fn wait_for_events(&self, events: &[RawEvent]) -> Result<(), Status>;
}

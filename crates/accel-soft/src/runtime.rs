use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use accel_sys::{
    Backend, BuildStatus, CommandType, ContextDesc, DeviceParam, DeviceType, EventStatus,
    GlObjectToken, HostBytes, HostSink, ImageDesc, ImageFormat, KernelArgValue, KernelParam,
    KernelWorkGroupParam, MemFlags, MemParam, NdRangeDesc, NotifyFn, ObjectKind, PlatformParam,
    ProfilingParam, ProgramBuildParam, ProgramParam, QueueProperties, RawContext, RawDevice,
    RawEvent, RawHandle, RawKernel, RawMem, RawPlatform, RawProgram, RawQueue, Status,
};
use tracing::{debug, error, info};

use crate::compiler::{self, ParamKind};
use crate::config::{ConfigError, SoftConfig, SoftDeviceKind};
use crate::gl::{GlShape, SHARE_GROUP};
use crate::launch::SoftLaunch;
use crate::ledger::{Ledger, LedgerSnapshot};
use crate::objects::{
    BoundArg, BuildRecord, ContextObj, KernelObj, MemObj, MemShape, Object, ProgramObj, QueueObj,
};
use crate::reply::{reply, reply_ids};
use crate::scheduler::{self, image_rows, CommandKind, Transition};
use crate::state::{DeviceSlot, Shared, State};

/// Image formats every image-capable device accepts.
const SUPPORTED_FORMATS: &[ImageFormat] = &[
    ImageFormat::RGBA8,
    ImageFormat::BGRA8,
    ImageFormat::R32F,
    ImageFormat::RGBA32F,
];

const MAX_CONSTANT_BUFFER_BYTES: u64 = 64 * 1024;

/// In-process reference device.
///
/// Commands execute on a dedicated scheduler thread in dependency order; kernel bodies are host
/// closures registered with [`SoftRuntime::register_kernel`]. Besides implementing [`Backend`]
/// it exposes the hooks tests need: the call [`Ledger`], the event transition timeline,
/// scheduling control and fault injection.
pub struct SoftRuntime {
    shared: Arc<Shared>,
    ledger: Arc<Ledger>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SoftRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftRuntime")
            .field("ledger", &self.ledger.snapshot())
            .finish_non_exhaustive()
    }
}

impl SoftRuntime {
    pub fn new(config: SoftConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        info!(
            platform = %config.platform_name,
            devices = config.devices.len(),
            "starting soft runtime"
        );

        let ledger = Arc::new(Ledger::default());
        let shared = Arc::new(Shared::new(State::new(config, ledger.clone())));
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("accel-soft-scheduler".to_owned())
            .spawn(move || scheduler::run(worker))?;

        Ok(Arc::new(Self {
            shared,
            ledger,
            scheduler: Mutex::new(Some(handle)),
        }))
    }

    pub fn platform(&self) -> RawPlatform {
        self.shared.lock().platform
    }

    pub fn devices(&self) -> Vec<RawDevice> {
        self.shared.lock().devices.iter().map(|d| d.id).collect()
    }

    /// Registers the body run for entry points named `name`. Replaces any previous body.
    pub fn register_kernel<F>(&self, name: impl Into<String>, body: F)
    where
        F: Fn(&mut SoftLaunch<'_>) -> Result<(), Status> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(kernel = %name, "registered kernel body");
        self.shared.lock().kernels.insert(name, Arc::new(body));
    }

    pub fn ledger(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }

    /// Every event state change recorded so far, in order.
    pub fn timeline(&self) -> Vec<Transition> {
        self.shared.lock().timeline.clone()
    }

    /// Stops the scheduler from submitting or running commands. Blocking calls made while
    /// paused only return once another thread calls [`SoftRuntime::resume`].
    pub fn pause(&self) {
        self.shared.lock().paused = true;
    }

    pub fn resume(&self) {
        self.shared.lock().paused = false;
        self.shared.cond.notify_all();
    }

    /// Simulates an unrecoverable device fault: pending commands on the device fail with
    /// `DEVICE_LOST`, contexts containing it are notified, and further work on them is refused.
    pub fn lose_device(&self, device: RawDevice) -> Result<(), Status> {
        let mut state = self.shared.lock();
        let slot = state
            .devices
            .iter_mut()
            .find(|slot| slot.id == device)
            .ok_or(Status::INVALID_DEVICE)?;
        if slot.lost {
            return Ok(());
        }
        slot.lost = true;
        error!(%device, "device lost");

        for context in state.contexts_of(device) {
            state.notify(context, format!("device {device} lost"));
        }
        state.fail_lost();
        let notifications = std::mem::take(&mut state.notifications);
        drop(state);
        self.shared.cond.notify_all();
        Shared::deliver(notifications);
        Ok(())
    }

    /// Makes the next buffer or image allocation fail with `MEM_OBJECT_ALLOCATION_FAILURE`.
    pub fn fail_next_allocation(&self) {
        self.shared.lock().fail_next_allocation = true;
    }

    /// Makes the next `count` size queries of platform or device info under-report by one
    /// byte, as if the value changed between the two calls.
    pub fn inject_info_size_race(&self, count: u32) {
        self.shared.lock().size_races = count;
    }

    /// Share group id to pass when creating an interop context.
    pub fn gl_share_group(&self) -> u64 {
        SHARE_GROUP
    }

    pub fn gl_create_texture(
        &self,
        format: ImageFormat,
        width: usize,
        height: usize,
        pixels: &[u8],
    ) -> Result<GlObjectToken, Status> {
        self.shared
            .lock()
            .gl
            .create_texture(format, width, height, pixels)
    }

    pub fn gl_create_buffer(&self, data: &[u8]) -> GlObjectToken {
        self.shared.lock().gl.create_buffer(data)
    }

    /// Current graphics-side contents of a texture or buffer.
    pub fn gl_contents(&self, token: GlObjectToken) -> Option<Vec<u8>> {
        self.shared
            .lock()
            .gl
            .contents(token)
            .ok()
            .map(<[u8]>::to_vec)
    }

    /// Overwrites a graphics object from the graphics side.
    pub fn gl_write(&self, token: GlObjectToken, data: &[u8]) -> Result<(), Status> {
        self.shared.lock().gl.store(token, data)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.lock()
    }

    /// Wakes the scheduler and, for blocking calls, waits for the event to finish. A blocking
    /// call whose command failed drops the event and reports the failure instead.
    fn submitted(
        &self,
        mut state: MutexGuard<'_, State>,
        event: RawEvent,
        blocking: bool,
    ) -> Result<RawEvent, Status> {
        self.shared.cond.notify_all();
        if !blocking {
            return Ok(event);
        }
        loop {
            let status = state.event(event)?.status;
            match status {
                EventStatus::Complete => return Ok(event),
                EventStatus::Error(status) => {
                    state.release_host(ObjectKind::Event, event.handle())?;
                    return Err(status);
                }
                _ => state = self.shared.wait(state),
            }
        }
    }
}

impl Drop for SoftRuntime {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.cond.notify_all();
        let handle = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("soft runtime scheduler thread panicked");
            }
        }
    }
}

fn check_range(offset: usize, len: usize, size: usize) -> Result<(), Status> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Status::INVALID_VALUE),
    }
}

fn check_host_data(flags: MemFlags, init: Option<&HostBytes>, size: usize) -> Result<(), Status> {
    let from_host = flags.intersects(MemFlags::COPY_HOST_PTR | MemFlags::USE_HOST_PTR);
    match (init, from_host) {
        (None, false) => Ok(()),
        (Some(bytes), true) if bytes.len() == size => Ok(()),
        (Some(_), true) => Err(Status::INVALID_VALUE),
        _ => Err(Status::INVALID_HOST_PTR),
    }
}

/// Picks a work-group size dividing `global` within the device limits.
fn default_local(
    global: &[usize; 3],
    work_dim: usize,
    max_items: &[usize; 3],
    max_group: usize,
) -> [usize; 3] {
    let mut local = [1; 3];
    let mut budget = max_group;
    for dim in 0..work_dim {
        let cap = max_items[dim].min(budget).max(1);
        local[dim] = (1..=cap)
            .rev()
            .find(|l| global[dim] % l == 0)
            .unwrap_or(1);
        budget /= local[dim];
    }
    local
}

impl State {
    /// Common enqueue checks. Returns the queue's context.
    fn begin_enqueue(&self, queue: RawQueue, wait: &[RawEvent]) -> Result<RawContext, Status> {
        let context = self.queue(queue)?.context;
        self.check_alive(context)?;
        for &event in wait {
            let event = self
                .event(event)
                .map_err(|_| Status::INVALID_EVENT_WAIT_LIST)?;
            if event.context != context {
                return Err(Status::INVALID_CONTEXT);
            }
        }
        Ok(context)
    }

    fn context_mem(&self, mem: RawMem, context: RawContext) -> Result<&MemObj, Status> {
        let obj = self.mem(mem)?;
        if obj.context != context {
            return Err(Status::INVALID_CONTEXT);
        }
        Ok(obj)
    }

    fn context_buffer(&self, mem: RawMem, context: RawContext) -> Result<&MemObj, Status> {
        let obj = self.context_mem(mem, context)?;
        match obj.shape {
            MemShape::Buffer => Ok(obj),
            MemShape::Image { .. } => Err(Status::INVALID_MEM_OBJECT),
        }
    }

    fn context_devices(&self, context: RawContext) -> Result<Vec<&DeviceSlot>, Status> {
        let devices = &self.context(context)?.devices;
        devices.iter().map(|&d| self.device(d)).collect()
    }

    /// Charges an allocation of `size` bytes to `context`.
    fn allocate(&mut self, context: RawContext, size: usize) -> Result<(), Status> {
        if std::mem::take(&mut self.fail_next_allocation) {
            return Err(Status::MEM_OBJECT_ALLOCATION_FAILURE);
        }
        let limit = self
            .context_devices(context)?
            .iter()
            .map(|d| d.config.global_mem_bytes)
            .min()
            .unwrap_or(0);
        let ctx = self.context_mut(context)?;
        let total = ctx.allocated.saturating_add(size as u64);
        if total > limit {
            return Err(Status::MEM_OBJECT_ALLOCATION_FAILURE);
        }
        ctx.allocated = total;
        Ok(())
    }

    fn max_alloc(&self, context: RawContext) -> Result<u64, Status> {
        Ok(self
            .context_devices(context)?
            .iter()
            .map(|d| d.config.max_alloc_bytes)
            .min()
            .unwrap_or(0))
    }

    fn insert_mem(&mut self, mem: MemObj) -> Result<RawMem, Status> {
        self.allocate(mem.context, mem.size)?;
        Ok(RawMem(self.insert(Object::Mem(mem))))
    }

    /// Applies a pending size race to the size half of a two-call query.
    fn race(&mut self, size_query: bool, len: usize) -> usize {
        if size_query && self.size_races > 0 {
            self.size_races -= 1;
            len.saturating_sub(1)
        } else {
            len
        }
    }

    fn bind_arg(
        &self,
        context: RawContext,
        kind: &ParamKind,
        value: KernelArgValue<'_>,
    ) -> Result<BoundArg, Status> {
        let mem_shape = |mem: RawMem| match self.mem(mem) {
            Ok(obj) if obj.context == context => Ok(obj.shape),
            _ => Err(Status::INVALID_ARG_VALUE),
        };
        match (kind, value) {
            (ParamKind::GlobalPtr, KernelArgValue::Mem(mem)) => match mem_shape(mem)? {
                MemShape::Buffer => Ok(BoundArg::Mem(mem)),
                MemShape::Image { .. } => Err(Status::INVALID_ARG_VALUE),
            },
            (ParamKind::Image2d, KernelArgValue::Mem(mem)) => match mem_shape(mem)? {
                MemShape::Image { .. } => Ok(BoundArg::Mem(mem)),
                MemShape::Buffer => Err(Status::INVALID_ARG_VALUE),
            },
            (ParamKind::LocalPtr, KernelArgValue::Local(0)) => Err(Status::INVALID_ARG_SIZE),
            (ParamKind::LocalPtr, KernelArgValue::Local(len)) => Ok(BoundArg::Local(len)),
            (ParamKind::Scalar { size, .. }, KernelArgValue::Bytes(bytes)) => match size {
                Some(size) if *size != bytes.len() => Err(Status::INVALID_ARG_SIZE),
                None if bytes.is_empty() => Err(Status::INVALID_ARG_SIZE),
                _ => Ok(BoundArg::Bytes(bytes.to_vec())),
            },
            (_, KernelArgValue::Local(_)) => Err(Status::INVALID_ARG_SIZE),
            _ => Err(Status::INVALID_ARG_VALUE),
        }
    }

    /// Validates a launch and resolves the work-group size.
    fn check_launch(
        &self,
        queue: RawQueue,
        kernel: &KernelObj,
        range: &NdRangeDesc,
    ) -> Result<[usize; 3], Status> {
        if !self.kernels.contains_key(&kernel.entry.name) {
            return Err(Status::INVALID_KERNEL);
        }
        let work_dim = range.work_dim as usize;
        if !(1..=3).contains(&work_dim) {
            return Err(Status::INVALID_WORK_DIMENSION);
        }
        for dim in 0..work_dim {
            if range.global[dim] == 0 {
                return Err(Status::INVALID_GLOBAL_WORK_SIZE);
            }
            if range.global_offset[dim].checked_add(range.global[dim]).is_none() {
                return Err(Status::INVALID_GLOBAL_OFFSET);
            }
        }

        let device = self.queue(queue)?.device;
        let built = self
            .program(kernel.program)?
            .executable_for(device)
            .map_or(false, |entries| entries.iter().any(|e| e.name == kernel.entry.name));
        if !built {
            return Err(Status::INVALID_PROGRAM_EXECUTABLE);
        }

        let device = &self.device(device)?.config;
        let reqd = kernel.entry.reqd_work_group_size;
        let local = match (range.local, reqd) {
            (Some(local), _) => {
                for dim in 0..work_dim {
                    if local[dim] == 0 || range.global[dim] % local[dim] != 0 {
                        return Err(Status::INVALID_WORK_GROUP_SIZE);
                    }
                    if local[dim] > device.max_work_item_sizes[dim] {
                        return Err(Status::INVALID_WORK_ITEM_SIZE);
                    }
                }
                let mut local = local;
                local[work_dim..].fill(1);
                if let Some(reqd) = reqd {
                    if reqd != local {
                        return Err(Status::INVALID_WORK_GROUP_SIZE);
                    }
                }
                local
            }
            (None, Some(reqd)) => {
                if (0..work_dim).any(|dim| range.global[dim] % reqd[dim] != 0) {
                    return Err(Status::INVALID_WORK_GROUP_SIZE);
                }
                reqd
            }
            (None, None) => default_local(
                &range.global,
                work_dim,
                &device.max_work_item_sizes,
                device.max_work_group_size,
            ),
        };
        if local.iter().product::<usize>() > device.max_work_group_size {
            return Err(Status::INVALID_WORK_GROUP_SIZE);
        }

        let local_mem: usize = kernel
            .args
            .iter()
            .filter_map(|arg| match arg {
                Some(BoundArg::Local(len)) => Some(*len),
                _ => None,
            })
            .sum();
        if local_mem as u64 > device.local_mem_bytes {
            return Err(Status::OUT_OF_RESOURCES);
        }
        Ok(local)
    }

    fn check_gl_objects(&self, context: RawContext, objects: &[RawMem]) -> Result<(), Status> {
        if objects.is_empty() {
            return Err(Status::INVALID_VALUE);
        }
        for &mem in objects {
            if self.context_mem(mem, context)?.gl.is_none() {
                return Err(Status::INVALID_GL_OBJECT);
            }
        }
        Ok(())
    }
}

impl Backend for SoftRuntime {
    fn platform_ids(&self, out: Option<&mut [RawPlatform]>) -> Result<usize, Status> {
        let platform = self.lock().platform;
        reply_ids(&[platform], out)
    }

    fn platform_info(
        &self,
        platform: RawPlatform,
        param: PlatformParam,
        out: Option<&mut [u8]>,
    ) -> Result<usize, Status> {
        let mut state = self.lock();
        state.check_platform(platform)?;
        let size_query = out.is_none();
        let config = &state.config;
        let len = match param {
            PlatformParam::Profile => reply(&config.profile, out),
            PlatformParam::Version => reply(&config.version, out),
            PlatformParam::Name => reply(&config.platform_name, out),
            PlatformParam::Vendor => reply(&config.vendor, out),
            PlatformParam::Extensions => reply(&config.extensions.join(" "), out),
        }?;
        Ok(state.race(size_query, len))
    }

    fn device_ids(
        &self,
        platform: RawPlatform,
        device_type: DeviceType,
        out: Option<&mut [RawDevice]>,
    ) -> Result<usize, Status> {
        let state = self.lock();
        state.check_platform(platform)?;
        if device_type.is_empty() {
            return Err(Status::INVALID_DEVICE_TYPE);
        }
        let ids: Vec<RawDevice> = if device_type == DeviceType::DEFAULT {
            state.devices.iter().take(1).map(|d| d.id).collect()
        } else {
            state
                .devices
                .iter()
                .filter(|d| device_type.intersects(d.config.kind.device_type()))
                .map(|d| d.id)
                .collect()
        };
        if ids.is_empty() {
            return Err(Status::DEVICE_NOT_FOUND);
        }
        reply_ids(&ids, out)
    }

    fn device_info(
        &self,
        device: RawDevice,
        param: DeviceParam,
        out: Option<&mut [u8]>,
    ) -> Result<usize, Status> {
        let mut state = self.lock();
        let size_query = out.is_none();
        let slot = state.device(device)?;
        let c = &slot.config;
        let len = match param {
            DeviceParam::Type => reply(&c.kind.device_type().bits(), out),
            DeviceParam::Name => reply(&c.name, out),
            DeviceParam::Vendor => reply(&state.config.vendor, out),
            DeviceParam::Version => reply(&state.config.version, out),
            DeviceParam::DriverVersion => reply(env!("CARGO_PKG_VERSION"), out),
            DeviceParam::Extensions => reply(&c.extensions.join(" "), out),
            DeviceParam::Platform => reply(&state.platform.handle().0, out),
            DeviceParam::MaxComputeUnits => reply(&c.compute_units, out),
            DeviceParam::MaxWorkItemDimensions => reply(&3u32, out),
            DeviceParam::MaxWorkItemSizes => reply(&c.max_work_item_sizes, out),
            DeviceParam::MaxWorkGroupSize => reply(&c.max_work_group_size, out),
            DeviceParam::MaxClockFrequency => reply(&c.clock_mhz, out),
            DeviceParam::AddressBits => reply(&usize::BITS, out),
            DeviceParam::GlobalMemSize => reply(&c.global_mem_bytes, out),
            DeviceParam::LocalMemSize => reply(&c.local_mem_bytes, out),
            DeviceParam::MaxMemAllocSize => reply(&c.max_alloc_bytes, out),
            DeviceParam::MaxConstantBufferSize => reply(&MAX_CONSTANT_BUFFER_BYTES, out),
            DeviceParam::ImageSupport => reply(&c.image_support, out),
            DeviceParam::Image2dMaxWidth => reply(&c.image2d_max_width, out),
            DeviceParam::Image2dMaxHeight => reply(&c.image2d_max_height, out),
            DeviceParam::Available => reply(&!slot.lost, out),
            DeviceParam::CompilerAvailable => reply(&true, out),
            DeviceParam::ProfilingTimerResolution => reply(&1usize, out),
        }?;
        Ok(state.race(size_query, len))
    }

    fn retain(&self, kind: ObjectKind, handle: RawHandle) -> Result<(), Status> {
        self.lock().retain_host(kind, handle)
    }

    fn release(&self, kind: ObjectKind, handle: RawHandle) -> Result<(), Status> {
        self.lock().release_host(kind, handle)
    }

    fn reference_count(&self, kind: ObjectKind, handle: RawHandle) -> Result<u32, Status> {
        self.lock().reference_count(kind, handle)
    }

    fn create_context(
        &self,
        desc: &ContextDesc<'_>,
        notify: Option<NotifyFn>,
    ) -> Result<RawContext, Status> {
        let mut state = self.lock();
        state.check_platform(desc.platform)?;
        if desc.devices.is_empty() {
            return Err(Status::INVALID_VALUE);
        }
        for (i, &device) in desc.devices.iter().enumerate() {
            if state.device(device)?.lost {
                return Err(Status::DEVICE_NOT_AVAILABLE);
            }
            if desc.devices[..i].contains(&device) {
                return Err(Status::INVALID_DEVICE);
            }
        }
        if desc.gl_share_group.is_some_and(|group| group != SHARE_GROUP) {
            return Err(Status::INVALID_GL_SHAREGROUP_REFERENCE);
        }

        let context = state.insert(Object::Context(ContextObj {
            devices: desc.devices.to_vec(),
            gl_share_group: desc.gl_share_group,
            notify,
            allocated: 0,
        }));
        Ok(RawContext(context))
    }

    fn supported_image_formats(
        &self,
        context: RawContext,
        flags: MemFlags,
    ) -> Result<Vec<ImageFormat>, Status> {
        let state = self.lock();
        if !flags.is_valid_access() {
            return Err(Status::INVALID_VALUE);
        }
        let images = state
            .context_devices(context)?
            .iter()
            .any(|d| d.config.image_support);
        Ok(if images {
            SUPPORTED_FORMATS.to_vec()
        } else {
            Vec::new()
        })
    }

    fn create_queue(
        &self,
        context: RawContext,
        device: RawDevice,
        properties: QueueProperties,
    ) -> Result<RawQueue, Status> {
        let mut state = self.lock();
        state.check_alive(context)?;
        if !state.context(context)?.devices.contains(&device) {
            return Err(Status::INVALID_DEVICE);
        }
        let queue = state.insert(Object::Queue(QueueObj {
            context,
            device,
            properties,
            last: None,
        }));
        Ok(RawQueue(queue))
    }

    fn flush(&self, queue: RawQueue) -> Result<(), Status> {
        let state = self.lock();
        state.check_alive(state.queue(queue)?.context)?;
        self.shared.cond.notify_all();
        Ok(())
    }

    fn finish(&self, queue: RawQueue) -> Result<(), Status> {
        let mut state = self.lock();
        state.check_alive(state.queue(queue)?.context)?;
        self.shared.cond.notify_all();
        while state.has_pending_on(queue) {
            state = self.shared.wait(state);
        }
        state.check_alive(state.queue(queue)?.context)
    }

    fn create_buffer(
        &self,
        context: RawContext,
        flags: MemFlags,
        size: usize,
        init: Option<HostBytes>,
    ) -> Result<RawMem, Status> {
        let mut state = self.lock();
        state.check_alive(context)?;
        if !flags.is_valid_access() {
            return Err(Status::INVALID_VALUE);
        }
        if size == 0 || size as u64 > state.max_alloc(context)? {
            return Err(Status::INVALID_BUFFER_SIZE);
        }
        check_host_data(flags, init.as_ref(), size)?;

        let data = init.map_or_else(|| vec![0; size], |bytes| bytes.to_vec());
        state.insert_mem(MemObj {
            context,
            flags,
            shape: MemShape::Buffer,
            size,
            data,
            gl: None,
        })
    }

    fn create_image2d(
        &self,
        context: RawContext,
        flags: MemFlags,
        format: ImageFormat,
        width: usize,
        height: usize,
        init: Option<HostBytes>,
    ) -> Result<RawMem, Status> {
        let mut state = self.lock();
        state.check_alive(context)?;
        if !flags.is_valid_access() {
            return Err(Status::INVALID_VALUE);
        }
        let devices = state.context_devices(context)?;
        if !devices.iter().any(|d| d.config.image_support) {
            return Err(Status::INVALID_OPERATION);
        }
        if !SUPPORTED_FORMATS.contains(&format) {
            return Err(Status::IMAGE_FORMAT_NOT_SUPPORTED);
        }
        let max_width = devices.iter().map(|d| d.config.image2d_max_width).min().unwrap_or(0);
        let max_height = devices.iter().map(|d| d.config.image2d_max_height).min().unwrap_or(0);
        if width == 0 || height == 0 || width > max_width || height > max_height {
            return Err(Status::INVALID_IMAGE_SIZE);
        }
        let size = format
            .region_len(width, height)
            .filter(|&size| size as u64 <= state.max_alloc(context).unwrap_or(0))
            .ok_or(Status::INVALID_IMAGE_SIZE)?;
        check_host_data(flags, init.as_ref(), size)?;

        let data = init.map_or_else(|| vec![0; size], |bytes| bytes.to_vec());
        state.insert_mem(MemObj {
            context,
            flags,
            shape: MemShape::Image {
                format,
                width,
                height,
            },
            size,
            data,
            gl: None,
        })
    }

    fn create_from_gl(
        &self,
        context: RawContext,
        flags: MemFlags,
        token: GlObjectToken,
    ) -> Result<RawMem, Status> {
        let mut state = self.lock();
        state.check_alive(context)?;
        if state.context(context)?.gl_share_group.is_none() {
            return Err(Status::INVALID_CONTEXT);
        }
        if !flags.is_valid_access() {
            return Err(Status::INVALID_VALUE);
        }
        let (shape, size) = match state.gl.describe(token)? {
            GlShape::Buffer { size } => (MemShape::Buffer, size),
            GlShape::Texture2d {
                format,
                width,
                height,
            } => (
                MemShape::Image {
                    format,
                    width,
                    height,
                },
                format
                    .region_len(width, height)
                    .ok_or(Status::INVALID_GL_OBJECT)?,
            ),
        };
        state.insert_mem(MemObj {
            context,
            flags,
            shape,
            size,
            data: vec![0; size],
            gl: Some(token),
        })
    }

    fn mem_info(
        &self,
        mem: RawMem,
        param: MemParam,
        out: Option<&mut [u8]>,
    ) -> Result<usize, Status> {
        let state = self.lock();
        let mem = state.mem(mem)?;
        match param {
            MemParam::Size => reply(&mem.size, out),
            MemParam::Flags => reply(&mem.flags.bits(), out),
        }
    }

    fn image_desc(&self, image: RawMem) -> Result<ImageDesc, Status> {
        match self.lock().mem(image)?.shape {
            MemShape::Image {
                format,
                width,
                height,
            } => Ok(ImageDesc {
                format,
                width,
                height,
            }),
            MemShape::Buffer => Err(Status::INVALID_MEM_OBJECT),
        }
    }

    fn create_program(&self, context: RawContext, sources: &[&str]) -> Result<RawProgram, Status> {
        let mut state = self.lock();
        state.check_alive(context)?;
        if sources.is_empty() || sources.iter().any(|s| s.is_empty()) {
            return Err(Status::INVALID_VALUE);
        }
        let program = state.insert(Object::Program(ProgramObj {
            context,
            source: sources.join("\n"),
            builds: HashMap::new(),
            attached_kernels: 0,
        }));
        Ok(RawProgram(program))
    }

    fn build_program(
        &self,
        program: RawProgram,
        devices: &[RawDevice],
        options: &str,
    ) -> Result<(), Status> {
        let mut state = self.lock();
        let (context, attached) = {
            let p = state.program(program)?;
            (p.context, p.attached_kernels)
        };
        state.check_alive(context)?;
        if attached > 0 {
            return Err(Status::INVALID_OPERATION);
        }
        let context_devices = state.context(context)?.devices.clone();
        let targets = if devices.is_empty() {
            context_devices
        } else {
            if devices.iter().any(|d| !context_devices.contains(d)) {
                return Err(Status::INVALID_DEVICE);
            }
            devices.to_vec()
        };

        let outcome = match compiler::parse_options(options) {
            Ok(parsed) => {
                let source = &state.program(program)?.source;
                compiler::compile(source, &parsed, |name| state.kernels.contains_key(name))
                    .map_err(|log| (Status::BUILD_PROGRAM_FAILURE, log))
            }
            Err(message) => Err((
                Status::INVALID_BUILD_OPTIONS,
                format!("<options>: error: {message}\n"),
            )),
        };

        // Devices outside `targets` keep whatever they were built with before.
        let (status, log, entry_points, result) = match outcome {
            Ok(compiled) => (
                BuildStatus::Success,
                compiled.log,
                Some(compiled.entry_points),
                Ok(()),
            ),
            Err((failure, log)) => (BuildStatus::Error, log, None, Err(failure)),
        };
        let p = state.program_mut(program)?;
        for device in targets {
            p.builds.insert(
                device,
                BuildRecord {
                    status,
                    options: options.to_owned(),
                    log: log.clone(),
                    entry_points: entry_points.clone(),
                },
            );
        }
        debug!(%program, ?status, "program built");
        result
    }

    fn program_info(
        &self,
        program: RawProgram,
        param: ProgramParam,
        out: Option<&mut [u8]>,
    ) -> Result<usize, Status> {
        let state = self.lock();
        let p = state.program(program)?;
        let devices = &state.context(p.context)?.devices;
        let entry_points = || {
            p.executable(devices)
                .ok_or(Status::INVALID_PROGRAM_EXECUTABLE)
        };
        match param {
            ProgramParam::NumKernels => reply(&entry_points()?.len(), out),
            ProgramParam::KernelNames => {
                let names: Vec<&str> = entry_points()?.iter().map(|e| e.name.as_str()).collect();
                reply(&names.join(";"), out)
            }
            ProgramParam::Source => reply(&p.source, out),
        }
    }

    fn program_build_info(
        &self,
        program: RawProgram,
        device: RawDevice,
        param: ProgramBuildParam,
        out: Option<&mut [u8]>,
    ) -> Result<usize, Status> {
        let state = self.lock();
        let p = state.program(program)?;
        if !state.context(p.context)?.devices.contains(&device) {
            return Err(Status::INVALID_DEVICE);
        }
        let record = p.builds.get(&device);
        match param {
            ProgramBuildParam::Status => {
                let status = record.map_or(BuildStatus::None, |r| r.status);
                reply(&status.code(), out)
            }
            ProgramBuildParam::Options => reply(record.map_or("", |r| r.options.as_str()), out),
            ProgramBuildParam::Log => reply(record.map_or("", |r| r.log.as_str()), out),
        }
    }

    fn create_kernel(&self, program: RawProgram, name: &str) -> Result<RawKernel, Status> {
        let mut state = self.lock();
        let p = state.program(program)?;
        let context = p.context;
        state.check_alive(context)?;
        let entry = p
            .executable(&state.context(context)?.devices)
            .ok_or(Status::INVALID_PROGRAM_EXECUTABLE)?
            .iter()
            .find(|e| e.name == name)
            .cloned()
            .ok_or(Status::INVALID_KERNEL_NAME)?;

        let args = vec![None; entry.params.len()];
        let kernel = state.insert(Object::Kernel(KernelObj {
            program,
            context,
            entry,
            args,
        }));
        state.program_mut(program)?.attached_kernels += 1;
        Ok(RawKernel(kernel))
    }

    fn kernel_info(
        &self,
        kernel: RawKernel,
        param: KernelParam,
        out: Option<&mut [u8]>,
    ) -> Result<usize, Status> {
        let state = self.lock();
        let k = state.kernel(kernel)?;
        match param {
            KernelParam::FunctionName => reply(&k.entry.name, out),
            KernelParam::NumArgs => reply(&(k.entry.params.len() as u32), out),
        }
    }

    fn set_kernel_arg(
        &self,
        kernel: RawKernel,
        index: u32,
        value: KernelArgValue<'_>,
    ) -> Result<(), Status> {
        let mut state = self.lock();
        let k = state.kernel(kernel)?;
        let context = k.context;
        state.check_alive(context)?;
        let param = k
            .entry
            .params
            .get(index as usize)
            .ok_or(Status::INVALID_ARG_INDEX)?;
        let bound = state.bind_arg(context, &param.kind, value)?;

        if let BoundArg::Mem(mem) = &bound {
            state.add_ref(mem.handle());
        }
        let previous = std::mem::replace(
            &mut state.kernel_mut(kernel)?.args[index as usize],
            Some(bound),
        );
        if let Some(BoundArg::Mem(mem)) = previous {
            state.drop_ref(mem.handle());
        }
        Ok(())
    }

    fn kernel_work_group_info(
        &self,
        kernel: RawKernel,
        device: RawDevice,
        param: KernelWorkGroupParam,
        out: Option<&mut [u8]>,
    ) -> Result<usize, Status> {
        let state = self.lock();
        let k = state.kernel(kernel)?;
        if !state.context(k.context)?.devices.contains(&device) {
            return Err(Status::INVALID_DEVICE);
        }
        let config = &state.device(device)?.config;
        match param {
            KernelWorkGroupParam::WorkGroupSize => reply(&config.max_work_group_size, out),
            KernelWorkGroupParam::CompileWorkGroupSize => {
                reply(&k.entry.reqd_work_group_size.unwrap_or([0; 3]), out)
            }
            KernelWorkGroupParam::LocalMemSize => {
                let local: usize = k
                    .args
                    .iter()
                    .filter_map(|arg| match arg {
                        Some(BoundArg::Local(len)) => Some(*len),
                        _ => None,
                    })
                    .sum();
                reply(&(local as u64), out)
            }
            KernelWorkGroupParam::PreferredWorkGroupSizeMultiple => {
                let multiple: usize = match config.kind {
                    SoftDeviceKind::Cpu => 1,
                    SoftDeviceKind::Gpu | SoftDeviceKind::Accelerator => 32,
                };
                reply(&multiple, out)
            }
            KernelWorkGroupParam::PrivateMemSize => reply(&0u64, out),
        }
    }

    fn enqueue_read_buffer(
        &self,
        queue: RawQueue,
        mem: RawMem,
        blocking: bool,
        offset: usize,
        dst: HostSink,
        wait: &[RawEvent],
    ) -> Result<RawEvent, Status> {
        let mut state = self.lock();
        let context = state.begin_enqueue(queue, wait)?;
        check_range(offset, dst.len(), state.context_buffer(mem, context)?.size)?;
        let event = state.push_command(queue, wait, CommandKind::ReadBuffer { mem, offset, dst })?;
        self.submitted(state, event, blocking)
    }

    fn enqueue_write_buffer(
        &self,
        queue: RawQueue,
        mem: RawMem,
        blocking: bool,
        offset: usize,
        src: HostBytes,
        wait: &[RawEvent],
    ) -> Result<RawEvent, Status> {
        let mut state = self.lock();
        let context = state.begin_enqueue(queue, wait)?;
        check_range(offset, src.len(), state.context_buffer(mem, context)?.size)?;
        let event = state.push_command(queue, wait, CommandKind::WriteBuffer { mem, offset, src })?;
        self.submitted(state, event, blocking)
    }

    fn enqueue_copy_buffer(
        &self,
        queue: RawQueue,
        src: RawMem,
        dst: RawMem,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
        wait: &[RawEvent],
    ) -> Result<RawEvent, Status> {
        let mut state = self.lock();
        let context = state.begin_enqueue(queue, wait)?;
        check_range(src_offset, size, state.context_buffer(src, context)?.size)?;
        check_range(dst_offset, size, state.context_buffer(dst, context)?.size)?;
        if src == dst && src_offset < dst_offset + size && dst_offset < src_offset + size {
            return Err(Status::MEM_COPY_OVERLAP);
        }
        let event = state.push_command(
            queue,
            wait,
            CommandKind::CopyBuffer {
                src,
                dst,
                src_offset,
                dst_offset,
                size,
            },
        )?;
        self.submitted(state, event, false)
    }

    fn enqueue_read_image(
        &self,
        queue: RawQueue,
        image: RawMem,
        blocking: bool,
        origin: [usize; 2],
        region: [usize; 2],
        dst: HostSink,
        wait: &[RawEvent],
    ) -> Result<RawEvent, Status> {
        let mut state = self.lock();
        let context = state.begin_enqueue(queue, wait)?;
        let shape = state.context_mem(image, context)?.shape;
        let (row_len, _) = image_rows(shape, origin, region)?;
        if region.contains(&0) || row_len * region[1] != dst.len() {
            return Err(Status::INVALID_VALUE);
        }
        let event = state.push_command(
            queue,
            wait,
            CommandKind::ReadImage {
                mem: image,
                origin,
                region,
                dst,
            },
        )?;
        self.submitted(state, event, blocking)
    }

    fn enqueue_write_image(
        &self,
        queue: RawQueue,
        image: RawMem,
        blocking: bool,
        origin: [usize; 2],
        region: [usize; 2],
        src: HostBytes,
        wait: &[RawEvent],
    ) -> Result<RawEvent, Status> {
        let mut state = self.lock();
        let context = state.begin_enqueue(queue, wait)?;
        let shape = state.context_mem(image, context)?.shape;
        let (row_len, _) = image_rows(shape, origin, region)?;
        if region.contains(&0) || row_len * region[1] != src.len() {
            return Err(Status::INVALID_VALUE);
        }
        let event = state.push_command(
            queue,
            wait,
            CommandKind::WriteImage {
                mem: image,
                origin,
                region,
                src,
            },
        )?;
        self.submitted(state, event, blocking)
    }

    fn enqueue_nd_range(
        &self,
        queue: RawQueue,
        kernel: RawKernel,
        range: &NdRangeDesc,
        wait: &[RawEvent],
    ) -> Result<RawEvent, Status> {
        let mut state = self.lock();
        let context = state.begin_enqueue(queue, wait)?;
        let k = state.kernel(kernel)?;
        if k.context != context {
            return Err(Status::INVALID_CONTEXT);
        }
        let args = k
            .args
            .iter()
            .cloned()
            .collect::<Option<Vec<BoundArg>>>()
            .ok_or(Status::INVALID_KERNEL_ARGS)?;
        let local = state.check_launch(queue, k, range)?;

        let event = state.push_command(
            queue,
            wait,
            CommandKind::NdRange {
                kernel,
                range: *range,
                local,
                args,
            },
        )?;
        self.submitted(state, event, false)
    }

    fn enqueue_acquire_gl(
        &self,
        queue: RawQueue,
        objects: &[RawMem],
        wait: &[RawEvent],
    ) -> Result<RawEvent, Status> {
        let mut state = self.lock();
        let context = state.begin_enqueue(queue, wait)?;
        state.check_gl_objects(context, objects)?;
        let event = state.push_command(
            queue,
            wait,
            CommandKind::AcquireGl {
                mems: objects.to_vec(),
            },
        )?;
        self.submitted(state, event, false)
    }

    fn enqueue_release_gl(
        &self,
        queue: RawQueue,
        objects: &[RawMem],
        wait: &[RawEvent],
    ) -> Result<RawEvent, Status> {
        let mut state = self.lock();
        let context = state.begin_enqueue(queue, wait)?;
        state.check_gl_objects(context, objects)?;
        let event = state.push_command(
            queue,
            wait,
            CommandKind::ReleaseGl {
                mems: objects.to_vec(),
            },
        )?;
        self.submitted(state, event, false)
    }

    fn enqueue_marker(&self, queue: RawQueue, wait: &[RawEvent]) -> Result<RawEvent, Status> {
        let mut state = self.lock();
        state.begin_enqueue(queue, wait)?;
        let event = state.push_command(queue, wait, CommandKind::Marker)?;
        self.submitted(state, event, false)
    }

    fn event_status(&self, event: RawEvent) -> Result<EventStatus, Status> {
        Ok(self.lock().event(event)?.status)
    }

    fn event_command_type(&self, event: RawEvent) -> Result<CommandType, Status> {
        Ok(self.lock().event(event)?.command_type)
    }

    fn event_profiling(&self, event: RawEvent, param: ProfilingParam) -> Result<u64, Status> {
        let state = self.lock();
        let e = state.event(event)?;
        if !e.profiling {
            return Err(Status::PROFILING_INFO_NOT_AVAILABLE);
        }
        e.time(param).ok_or(Status::PROFILING_INFO_NOT_AVAILABLE)
    }

    fn wait_for_events(&self, events: &[RawEvent]) -> Result<(), Status> {
        let mut state = self.lock();
        let Some(&first) = events.first() else {
            return Err(Status::INVALID_VALUE);
        };
        let context = state.event(first)?.context;
        for &event in events {
            if state.event(event)?.context != context {
                return Err(Status::INVALID_CONTEXT);
            }
        }
        loop {
            let mut failed = false;
            let mut done = true;
            for &event in events {
                let status = state.event(event)?.status;
                match status {
                    EventStatus::Complete => {}
                    EventStatus::Error(_) => failed = true,
                    _ => done = false,
                }
            }
            if done {
                return if failed {
                    Err(Status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST)
                } else {
                    Ok(())
                };
            }
            state = self.shared.wait(state);
        }
    }
}

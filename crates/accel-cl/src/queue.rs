use std::fmt;

use accel_sys::{HostBytes, HostSink, NdRangeDesc, QueueProperties, RawEvent, RawMem, RawQueue};
use tracing::{trace, warn};

use crate::context::Context;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::handle::{Handle, QueueKind};
use crate::kernel::Kernel;
use crate::memory::{core_of, Buffer, Image2D, InteropState, MemoryObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct QueueOptions {
    /// Let commands without explicit dependencies run in any order.
    pub out_of_order: bool,
    /// Record device timestamps on every event.
    pub profiling: bool,
}

impl QueueOptions {
    fn properties(self) -> QueueProperties {
        let mut properties = QueueProperties::empty();
        properties.set(QueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE, self.out_of_order);
        properties.set(QueueProperties::PROFILING_ENABLE, self.profiling);
        properties
    }
}

/// Launch geometry: up to three dimensions of global size, optional work-group size and
/// global offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NdRange {
    work_dim: u32,
    global: [usize; 3],
    local: Option<[usize; 3]>,
    offset: [usize; 3],
}

impl NdRange {
    pub fn linear(global: usize) -> Self {
        Self {
            work_dim: 1,
            global: [global, 1, 1],
            local: None,
            offset: [0; 3],
        }
    }

    /// `global` gives one size per dimension, one to three of them.
    pub fn new(global: &[usize]) -> Result<Self> {
        if !(1..=3).contains(&global.len()) {
            return Err(Error::configuration(
                "NdRange::new",
                format!("{} dimensions; expected 1 to 3", global.len()),
            ));
        }
        let mut sizes = [1; 3];
        sizes[..global.len()].copy_from_slice(global);
        Ok(Self {
            work_dim: global.len() as u32,
            global: sizes,
            local: None,
            offset: [0; 3],
        })
    }

    /// Fixes the work-group size. It must evenly divide the global size in every dimension.
    pub fn with_local(mut self, local: &[usize]) -> Result<Self> {
        const OP: &str = "NdRange::with_local";
        let sizes = self.fill(OP, local, 1)?;
        for (d, (&g, &l)) in self.global.iter().zip(&sizes).enumerate() {
            if l == 0 || g % l != 0 {
                return Err(Error::configuration(
                    OP,
                    format!("work-group size {l} does not divide global size {g} in dimension {d}"),
                ));
            }
        }
        self.local = Some(sizes);
        Ok(self)
    }

    pub fn with_offset(mut self, offset: &[usize]) -> Result<Self> {
        self.offset = self.fill("NdRange::with_offset", offset, 0)?;
        Ok(self)
    }

    fn fill(&self, op: &'static str, values: &[usize], pad: usize) -> Result<[usize; 3]> {
        if values.len() != self.work_dim as usize {
            return Err(Error::configuration(
                op,
                format!(
                    "{} dimensions for a {}-dimensional range",
                    values.len(),
                    self.work_dim
                ),
            ));
        }
        let mut out = [pad; 3];
        out[..values.len()].copy_from_slice(values);
        Ok(out)
    }

    pub fn work_dim(&self) -> u32 {
        self.work_dim
    }

    pub fn global(&self) -> &[usize] {
        &self.global[..self.work_dim as usize]
    }

    pub fn local(&self) -> Option<&[usize]> {
        self.local.as_ref().map(|l| &l[..self.work_dim as usize])
    }

    pub fn offset(&self) -> &[usize] {
        &self.offset[..self.work_dim as usize]
    }

    /// Total number of work-items.
    pub fn len(&self) -> usize {
        self.global().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn desc(&self) -> NdRangeDesc {
        NdRangeDesc {
            work_dim: self.work_dim,
            global_offset: self.offset,
            global: self.global,
            local: self.local,
        }
    }
}

/// A non-blocking device-to-host read in flight.
///
/// The destination stays borrowed until the read is observed complete: [`Pending::wait`] waits
/// and copies the data in. Dropping the guard does the same, logging any failure.
pub struct Pending<'a> {
    event: Event,
    sink: HostSink,
    dst: Option<&'a mut [u8]>,
}

impl<'a> Pending<'a> {
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Waits for the read and fills the destination.
    pub fn wait(mut self) -> Result<Event> {
        self.complete()?;
        Ok(self.event.clone())
    }

    fn complete(&mut self) -> Result<()> {
        let Some(dst) = self.dst.take() else {
            return Ok(());
        };
        self.event.wait()?;
        if !self.sink.copy_to(dst) {
            return Err(Error::structural(
                "Pending::wait",
                accel_sys::Status::SUCCESS,
                "read produced a different number of bytes than requested",
            ));
        }
        Ok(())
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.complete() {
            warn!(event = %self.event.raw(), %err, "pending read failed");
        }
    }
}

impl fmt::Debug for Pending<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("event", &self.event)
            .field("done", &self.dst.is_none())
            .finish()
    }
}

/// An ordered (or, with [`QueueOptions::out_of_order`], dependency-ordered) stream of
/// commands for one device.
///
/// Every enqueue returns the command's [`Event`]. Wait lists must come from the queue's
/// context; all objects a command uses stay alive until it completes even if the caller drops
/// its handles.
#[derive(Clone)]
pub struct CommandQueue {
    handle: Handle<QueueKind>,
    context: Context,
    device: Device,
    options: QueueOptions,
}

impl CommandQueue {
    pub fn new(context: &Context, device: &Device, options: QueueOptions) -> Result<Self> {
        const OP: &str = "CommandQueue::new";
        context.ensure_alive(OP)?;
        if !context.contains(device) {
            return Err(Error::configuration(
                OP,
                format!("device {} is not part of the context", device.raw()),
            ));
        }
        let result =
            context
                .backend()
                .create_queue(context.raw(), device.raw(), options.properties());
        let raw = context.check(OP, result)?;
        Ok(Self {
            handle: Handle::adopt(context.backend().clone(), raw),
            context: context.clone(),
            device: device.clone(),
            options,
        })
    }

    pub fn raw(&self) -> RawQueue {
        self.handle.raw()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn options(&self) -> QueueOptions {
        self.options
    }

    pub fn reference_count(&self) -> Result<u32> {
        self.handle.reference_count()
    }

    /// Copies `data` into `buffer` at `offset`. The bytes are staged, so `data` may be reused
    /// as soon as this returns.
    pub fn write_buffer(
        &self,
        buffer: &Buffer,
        offset: usize,
        data: &[u8],
        blocking: bool,
        wait: &[Event],
    ) -> Result<Event> {
        const OP: &str = "CommandQueue::write_buffer";
        self.context.ensure_alive(OP)?;
        self.check_mem(OP, buffer)?;
        check_range(OP, offset, data.len(), buffer.size())?;
        let wait = self.wait_list(OP, wait)?;
        if data.is_empty() {
            return self.no_op(OP, &wait);
        }
        trace!(mem = %buffer.raw(), offset, len = data.len(), blocking, "write buffer");
        let result = self.context.backend().enqueue_write_buffer(
            self.raw(),
            buffer.raw(),
            blocking,
            offset,
            HostBytes::from(data),
            &wait,
        );
        self.event(OP, result)
    }

    /// Reads `dst.len()` bytes from `buffer` at `offset`.
    ///
    /// A blocking read has filled `dst` by the time this returns; otherwise `dst` is filled
    /// when the returned guard is waited on or dropped.
    pub fn read_buffer<'a>(
        &self,
        buffer: &Buffer,
        offset: usize,
        dst: &'a mut [u8],
        blocking: bool,
        wait: &[Event],
    ) -> Result<Pending<'a>> {
        const OP: &str = "CommandQueue::read_buffer";
        self.context.ensure_alive(OP)?;
        self.check_mem(OP, buffer)?;
        check_range(OP, offset, dst.len(), buffer.size())?;
        let wait = self.wait_list(OP, wait)?;
        let sink = HostSink::with_len(dst.len());
        let event = if dst.is_empty() {
            self.no_op(OP, &wait)?
        } else {
            trace!(mem = %buffer.raw(), offset, len = dst.len(), blocking, "read buffer");
            let result = self.context.backend().enqueue_read_buffer(
                self.raw(),
                buffer.raw(),
                blocking,
                offset,
                sink.clone(),
                &wait,
            );
            self.event(OP, result)?
        };
        self.pending(event, sink, dst, blocking)
    }

    /// Device-side copy of `size` bytes from `src_offset` in `src` to `dst_offset` in `dst`.
    /// Copying a region onto an overlapping region of the same buffer is rejected.
    pub fn copy_buffer(
        &self,
        src: &Buffer,
        dst: &Buffer,
        size: usize,
        src_offset: usize,
        dst_offset: usize,
        wait: &[Event],
    ) -> Result<Event> {
        const OP: &str = "CommandQueue::copy_buffer";
        self.context.ensure_alive(OP)?;
        self.check_mem(OP, src)?;
        self.check_mem(OP, dst)?;
        check_range(OP, src_offset, size, src.size())?;
        check_range(OP, dst_offset, size, dst.size())?;
        let wait = self.wait_list(OP, wait)?;
        if size == 0 {
            return self.no_op(OP, &wait);
        }
        let result = self.context.backend().enqueue_copy_buffer(
            self.raw(),
            src.raw(),
            dst.raw(),
            src_offset,
            dst_offset,
            size,
            &wait,
        );
        self.event(OP, result)
    }

    /// Writes tightly packed pixels into the `region` (width, height) at `origin` (x, y).
    pub fn write_image2d(
        &self,
        image: &Image2D,
        origin: [usize; 2],
        region: [usize; 2],
        data: &[u8],
        blocking: bool,
        wait: &[Event],
    ) -> Result<Event> {
        const OP: &str = "CommandQueue::write_image2d";
        self.context.ensure_alive(OP)?;
        self.check_mem(OP, image)?;
        check_region(OP, image, origin, region, data.len())?;
        let wait = self.wait_list(OP, wait)?;
        if data.is_empty() {
            return self.no_op(OP, &wait);
        }
        let result = self.context.backend().enqueue_write_image(
            self.raw(),
            image.raw(),
            blocking,
            origin,
            region,
            HostBytes::from(data),
            &wait,
        );
        self.event(OP, result)
    }

    /// Reads the `region` at `origin` as tightly packed pixels. See [`Self::read_buffer`].
    pub fn read_image2d<'a>(
        &self,
        image: &Image2D,
        origin: [usize; 2],
        region: [usize; 2],
        dst: &'a mut [u8],
        blocking: bool,
        wait: &[Event],
    ) -> Result<Pending<'a>> {
        const OP: &str = "CommandQueue::read_image2d";
        self.context.ensure_alive(OP)?;
        self.check_mem(OP, image)?;
        check_region(OP, image, origin, region, dst.len())?;
        let wait = self.wait_list(OP, wait)?;
        let sink = HostSink::with_len(dst.len());
        let event = if dst.is_empty() {
            self.no_op(OP, &wait)?
        } else {
            let result = self.context.backend().enqueue_read_image(
                self.raw(),
                image.raw(),
                blocking,
                origin,
                region,
                sink.clone(),
                &wait,
            );
            self.event(OP, result)?
        };
        self.pending(event, sink, dst, blocking)
    }

    /// Launches `kernel` with its recorded arguments.
    pub fn run_kernel(&self, kernel: &Kernel, range: &NdRange, wait: &[Event]) -> Result<Event> {
        const OP: &str = "CommandQueue::run_kernel";
        self.context.ensure_alive(OP)?;
        if !kernel.program().context().same(&self.context) {
            return Err(Error::configuration(
                OP,
                format!("kernel '{}' belongs to another context", kernel.name()),
            ));
        }
        let wait = self.wait_list(OP, wait)?;
        let raw = kernel.launch(OP, |args| {
            for memory in args.iter().flatten().filter_map(|arg| arg.memory()) {
                core_of(memory).ensure_usable(OP)?;
            }
            trace!(kernel = kernel.name(), ?range, "run kernel");
            let result = self.context.backend().enqueue_nd_range(
                self.raw(),
                kernel.raw(),
                &range.desc(),
                &wait,
            );
            self.context
                .check(OP, result)
                .map_err(|e| e.with_argument(kernel.name(), None))
        })?;
        Ok(Event::adopt(&self.context, raw))
    }

    /// Hands graphics objects to the device. They must currently be released.
    pub fn acquire_gl_objects(
        &self,
        objects: &[&dyn MemoryObject],
        wait: &[Event],
    ) -> Result<Event> {
        self.interop("CommandQueue::acquire_gl_objects", objects, wait, true)
    }

    /// Returns graphics objects to the graphics API. They must currently be acquired.
    pub fn release_gl_objects(
        &self,
        objects: &[&dyn MemoryObject],
        wait: &[Event],
    ) -> Result<Event> {
        self.interop("CommandQueue::release_gl_objects", objects, wait, false)
    }

    fn interop(
        &self,
        op: &'static str,
        objects: &[&dyn MemoryObject],
        wait: &[Event],
        acquire: bool,
    ) -> Result<Event> {
        self.context.ensure_alive(op)?;
        if objects.is_empty() {
            return Err(Error::configuration(op, "no graphics objects given"));
        }
        let expected = if acquire {
            InteropState::Released
        } else {
            InteropState::Acquired
        };
        for object in objects {
            if !object.context().same(&self.context) {
                return Err(Error::configuration(
                    op,
                    format!("{} belongs to another context", object.raw()),
                ));
            }
            core_of(*object).expect_interop(op, expected)?;
        }
        let raw: Vec<RawMem> = objects.iter().map(|o| o.raw()).collect();
        let wait = self.wait_list(op, wait)?;
        let backend = self.context.backend();
        let result = if acquire {
            backend.enqueue_acquire_gl(self.raw(), &raw, &wait)
        } else {
            backend.enqueue_release_gl(self.raw(), &raw, &wait)
        };
        let event = self.event(op, result)?;
        let next = if acquire {
            InteropState::Acquired
        } else {
            InteropState::Released
        };
        for object in objects {
            core_of(*object).set_interop_state(next);
        }
        Ok(event)
    }

    /// A command that completes once everything in `wait` has, or, with an empty list, once
    /// every earlier command of an in-order queue has.
    pub fn marker(&self, wait: &[Event]) -> Result<Event> {
        const OP: &str = "CommandQueue::marker";
        self.context.ensure_alive(OP)?;
        let wait = self.wait_list(OP, wait)?;
        self.no_op(OP, &wait)
    }

    /// Submits everything queued so far without waiting.
    pub fn flush(&self) -> Result<()> {
        const OP: &str = "CommandQueue::flush";
        self.context.ensure_alive(OP)?;
        let result = self.context.backend().flush(self.raw());
        self.context.check(OP, result)
    }

    /// Blocks until every command enqueued so far is terminal.
    pub fn finish(&self) -> Result<()> {
        const OP: &str = "CommandQueue::finish";
        self.context.ensure_alive(OP)?;
        let result = self.context.backend().finish(self.raw());
        self.context.check(OP, result)
    }

    fn no_op(&self, op: &'static str, wait: &[RawEvent]) -> Result<Event> {
        let result = self.context.backend().enqueue_marker(self.raw(), wait);
        self.event(op, result)
    }

    fn event(
        &self,
        op: &'static str,
        result: std::result::Result<RawEvent, accel_sys::Status>,
    ) -> Result<Event> {
        let raw = self.context.check(op, result)?;
        Ok(Event::adopt(&self.context, raw))
    }

    fn pending<'a>(
        &self,
        event: Event,
        sink: HostSink,
        dst: &'a mut [u8],
        blocking: bool,
    ) -> Result<Pending<'a>> {
        let mut pending = Pending {
            event,
            sink,
            dst: Some(dst),
        };
        if blocking {
            pending.complete()?;
        }
        Ok(pending)
    }

    fn check_mem<M: MemoryObject>(&self, op: &'static str, object: &M) -> Result<()> {
        if !object.context().same(&self.context) {
            return Err(Error::configuration(
                op,
                format!("{} belongs to another context", object.raw()),
            ));
        }
        core_of(object).ensure_usable(op)
    }

    fn wait_list(&self, op: &'static str, wait: &[Event]) -> Result<Vec<RawEvent>> {
        wait.iter()
            .map(|event| {
                if event.context().same(&self.context) {
                    Ok(event.raw())
                } else {
                    Err(Error::configuration(
                        op,
                        format!("wait-list event {} belongs to another context", event.raw()),
                    ))
                }
            })
            .collect()
    }
}

fn check_range(op: &'static str, offset: usize, len: usize, size: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::configuration(
            op,
            format!("{len} bytes at offset {offset} exceed the {size} byte buffer"),
        )),
    }
}

fn check_region(
    op: &'static str,
    image: &Image2D,
    origin: [usize; 2],
    region: [usize; 2],
    host_len: usize,
) -> Result<()> {
    let fits = |o: usize, r: usize, limit: usize| o.checked_add(r).is_some_and(|end| end <= limit);
    if !fits(origin[0], region[0], image.width()) || !fits(origin[1], region[1], image.height()) {
        return Err(Error::configuration(
            op,
            format!(
                "region {}x{} at ({}, {}) exceeds the {}x{} image",
                region[0],
                region[1],
                origin[0],
                origin[1],
                image.width(),
                image.height()
            ),
        ));
    }
    let expected = image
        .format()
        .region_len(region[0], region[1])
        .ok_or_else(|| Error::configuration(op, "region size overflows"))?;
    if host_len != expected {
        return Err(Error::configuration(
            op,
            format!("{host_len} host bytes for a {expected} byte region"),
        ));
    }
    Ok(())
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("raw", &self.raw())
            .field("device", &self.device)
            .field("options", &self.options)
            .finish()
    }
}

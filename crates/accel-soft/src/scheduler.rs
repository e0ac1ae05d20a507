use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use accel_sys::{
    CommandType, EventStatus, HostBytes, HostSink, NdRangeDesc, ProfilingParam, RawEvent,
    RawHandle, RawKernel, RawMem, RawQueue, Status,
};
use tracing::{trace, warn};

use crate::launch::{KernelFn, LaunchArg, SoftLaunch};
use crate::objects::{BoundArg, EventObj, MemShape, Object};
use crate::state::{Shared, State};

/// One recorded event state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub event: RawEvent,
    pub command: CommandType,
    pub status: EventStatus,
}

pub(crate) enum CommandKind {
    ReadBuffer {
        mem: RawMem,
        offset: usize,
        dst: HostSink,
    },
    WriteBuffer {
        mem: RawMem,
        offset: usize,
        src: HostBytes,
    },
    CopyBuffer {
        src: RawMem,
        dst: RawMem,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
    },
    ReadImage {
        mem: RawMem,
        origin: [usize; 2],
        region: [usize; 2],
        dst: HostSink,
    },
    WriteImage {
        mem: RawMem,
        origin: [usize; 2],
        region: [usize; 2],
        src: HostBytes,
    },
    NdRange {
        kernel: RawKernel,
        range: NdRangeDesc,
        local: [usize; 3],
        args: Vec<BoundArg>,
    },
    AcquireGl {
        mems: Vec<RawMem>,
    },
    ReleaseGl {
        mems: Vec<RawMem>,
    },
    Marker,
}

impl CommandKind {
    pub fn command_type(&self) -> CommandType {
        match self {
            CommandKind::ReadBuffer { .. } => CommandType::ReadBuffer,
            CommandKind::WriteBuffer { .. } => CommandType::WriteBuffer,
            CommandKind::CopyBuffer { .. } => CommandType::CopyBuffer,
            CommandKind::ReadImage { .. } => CommandType::ReadImage,
            CommandKind::WriteImage { .. } => CommandType::WriteImage,
            CommandKind::NdRange { .. } => CommandType::NdRangeKernel,
            CommandKind::AcquireGl { .. } => CommandType::AcquireGlObjects,
            CommandKind::ReleaseGl { .. } => CommandType::ReleaseGlObjects,
            CommandKind::Marker => CommandType::Marker,
        }
    }

    /// Objects the command touches and must keep alive until it completes.
    fn touched(&self) -> Vec<RawHandle> {
        match self {
            CommandKind::ReadBuffer { mem, .. }
            | CommandKind::WriteBuffer { mem, .. }
            | CommandKind::ReadImage { mem, .. }
            | CommandKind::WriteImage { mem, .. } => vec![mem.handle()],
            CommandKind::CopyBuffer { src, dst, .. } => vec![src.handle(), dst.handle()],
            CommandKind::NdRange { kernel, args, .. } => std::iter::once(kernel.handle())
                .chain(args.iter().filter_map(|arg| match arg {
                    BoundArg::Mem(mem) => Some(mem.handle()),
                    _ => None,
                }))
                .collect(),
            CommandKind::AcquireGl { mems } | CommandKind::ReleaseGl { mems } => {
                mems.iter().map(|m| m.handle()).collect()
            }
            CommandKind::Marker => Vec::new(),
        }
    }
}

pub(crate) struct Command {
    event: RawEvent,
    queue: RawQueue,
    /// Previous command of an in-order queue.
    after: Option<RawEvent>,
    wait: Vec<RawEvent>,
    kind: CommandKind,
    /// Internal references released on completion.
    holds: Vec<RawHandle>,
}

/// A kernel launch whose memory arguments are checked out of their objects.
///
/// The body runs on the scheduler thread with the state lock released; host calls made in the
/// meantime see the command as `Running`.
pub(crate) struct Launch {
    cmd: Command,
    kernel: RawKernel,
    name: String,
    body: KernelFn,
    range: NdRangeDesc,
    local: [usize; 3],
    args: Vec<LaunchArg>,
    /// Argument index and object of every checked-out memory object.
    checked_out: Vec<(usize, RawMem)>,
}

impl Launch {
    fn execute(&mut self) -> std::thread::Result<Result<(), Status>> {
        let body = Arc::clone(&self.body);
        catch_unwind(AssertUnwindSafe(|| {
            let mut launch = SoftLaunch::new(&self.name, self.range, self.local, &mut self.args);
            body(&mut launch)
        }))
    }
}

impl State {
    /// Records a command on `queue` and returns its event, holding one host reference.
    ///
    /// The caller has validated the queue, the wait list and the command itself.
    pub fn push_command(
        &mut self,
        queue: RawQueue,
        wait: &[RawEvent],
        kind: CommandKind,
    ) -> Result<RawEvent, Status> {
        let (context, in_order, profiling, last) = {
            let q = self.queue(queue)?;
            (q.context, q.in_order(), q.profiling(), q.last)
        };
        let command_type = kind.command_type();
        let now = self.now_ns();

        let mut event_obj = EventObj {
            context,
            queue,
            command_type,
            status: EventStatus::Queued,
            profiling,
            times: [None; 4],
        };
        event_obj.stamp(ProfilingParam::Queued, now);
        let event = RawEvent(self.insert(Object::Event(event_obj)));

        let after = if in_order {
            last.filter(|prev| self.event(*prev).is_ok())
        } else {
            None
        };

        let mut holds = vec![event.handle(), queue.handle()];
        holds.extend(after.map(RawEvent::handle));
        holds.extend(wait.iter().map(|e| e.handle()));
        holds.extend(kind.touched());
        for &id in &holds {
            self.add_ref(id);
        }

        self.queue_mut(queue)?.last = Some(event);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(
            seq,
            Command {
                event,
                queue,
                after,
                wait: wait.to_vec(),
                kind,
                holds,
            },
        );
        self.record(event, command_type, EventStatus::Queued);
        Ok(event)
    }

    fn record(&mut self, event: RawEvent, command: CommandType, status: EventStatus) {
        trace!(%event, ?command, %status, "event transition");
        self.timeline.push(Transition {
            event,
            command,
            status,
        });
    }

    fn set_status(&mut self, event: RawEvent, status: EventStatus) {
        let now = self.now_ns();
        let Ok(obj) = self.event_mut(event) else {
            return;
        };
        obj.status = status;
        match status {
            EventStatus::Submitted => obj.stamp(ProfilingParam::Submit, now),
            EventStatus::Running => obj.stamp(ProfilingParam::Start, now),
            EventStatus::Complete | EventStatus::Error(_) => {
                if obj.time(ProfilingParam::Start).is_none() {
                    obj.stamp(ProfilingParam::Start, now);
                }
                obj.stamp(ProfilingParam::End, now)
            }
            EventStatus::Queued => {}
        }
        let command = obj.command_type;
        self.record(event, command, status);
    }

    fn event_status_or_complete(&self, event: RawEvent) -> EventStatus {
        self.event(event)
            .map(|e| e.status)
            .unwrap_or(EventStatus::Complete)
    }

    /// Moves every queued command to `Submitted`.
    fn submit_queued(&mut self) {
        let queued: Vec<RawEvent> = self
            .pending
            .values()
            .map(|cmd| cmd.event)
            .filter(|&e| self.event_status_or_complete(e) == EventStatus::Queued)
            .collect();
        for event in queued {
            self.set_status(event, EventStatus::Submitted);
        }
    }

    /// Lowest-sequence command whose dependencies are all terminal.
    fn next_ready(&self) -> Option<u64> {
        self.pending.iter().find_map(|(&seq, cmd)| {
            let ready = cmd
                .after
                .iter()
                .chain(&cmd.wait)
                .all(|&dep| self.event_status_or_complete(dep).is_terminal());
            ready.then_some(seq)
        })
    }

    fn queue_lost(&self, queue: RawQueue) -> bool {
        self.queue(queue)
            .ok()
            .and_then(|q| self.device(q.device).ok())
            .map_or(false, |slot| slot.lost)
    }

    /// Runs the command at `seq`, except for kernel launches, which are handed back ready to
    /// execute and must be finished with [`State::finish_launch`].
    fn run(&mut self, seq: u64) -> Option<Launch> {
        let cmd = self.pending.remove(&seq)?;

        let dep_failed = cmd
            .wait
            .iter()
            .any(|&e| matches!(self.event_status_or_complete(e), EventStatus::Error(_)));

        let status = if dep_failed {
            EventStatus::Error(Status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST)
        } else if self.queue_lost(cmd.queue) {
            EventStatus::Error(Status::DEVICE_LOST)
        } else {
            self.set_status(cmd.event, EventStatus::Running);
            if matches!(cmd.kind, CommandKind::NdRange { .. }) {
                return match self.check_out(cmd) {
                    Ok(launch) => {
                        self.running = Some(launch.cmd.queue);
                        Some(launch)
                    }
                    Err((cmd, status)) => {
                        let status = outcome(cmd.event, Err(status));
                        self.complete(cmd, status);
                        None
                    }
                };
            }
            let result = self.execute(&cmd.kind);
            outcome(cmd.event, result)
        };
        self.complete(cmd, status);
        None
    }

    /// Checks the memory of a launch back in and completes its command.
    fn finish_launch(
        &mut self,
        mut launch: Launch,
        result: std::thread::Result<Result<(), Status>>,
    ) {
        self.running = None;
        for (index, mem) in std::mem::take(&mut launch.checked_out) {
            if let LaunchArg::Mem { data, .. } =
                std::mem::replace(&mut launch.args[index], LaunchArg::Local(0))
            {
                if let Ok(obj) = self.mem_mut(mem) {
                    obj.data = data;
                }
            }
        }

        let result = result.unwrap_or_else(|_| {
            warn!(kernel = %launch.name, "kernel body panicked");
            if let Ok(context) = self.kernel(launch.kernel).map(|k| k.context) {
                self.notify(context, format!("kernel '{}' aborted", launch.name));
            }
            Err(Status::OUT_OF_RESOURCES)
        });
        let status = if self.queue_lost(launch.cmd.queue) {
            EventStatus::Error(Status::DEVICE_LOST)
        } else {
            outcome(launch.cmd.event, result)
        };
        self.complete(launch.cmd, status);
    }

    fn complete(&mut self, cmd: Command, status: EventStatus) {
        self.set_status(cmd.event, status);
        for id in cmd.holds {
            self.drop_ref(id);
        }
    }

    /// Fails every pending command queued on a device that is gone.
    pub fn fail_lost(&mut self) {
        let lost: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, cmd)| self.queue_lost(cmd.queue))
            .map(|(&seq, _)| seq)
            .collect();
        for seq in lost {
            if let Some(cmd) = self.pending.remove(&seq) {
                self.complete(cmd, EventStatus::Error(Status::DEVICE_LOST));
            }
        }
    }

    pub fn has_pending_on(&self, queue: RawQueue) -> bool {
        self.running == Some(queue) || self.pending.values().any(|cmd| cmd.queue == queue)
    }

    fn execute(&mut self, kind: &CommandKind) -> Result<(), Status> {
        match kind {
            CommandKind::ReadBuffer { mem, offset, dst } => {
                let data = &self.mem(*mem)?.data;
                let src = data
                    .get(*offset..offset + dst.len())
                    .ok_or(Status::INVALID_VALUE)?;
                dst.write_at(0, src)
                    .then_some(())
                    .ok_or(Status::INVALID_VALUE)
            }
            CommandKind::WriteBuffer { mem, offset, src } => {
                let data = &mut self.mem_mut(*mem)?.data;
                data.get_mut(*offset..offset + src.len())
                    .ok_or(Status::INVALID_VALUE)?
                    .copy_from_slice(src);
                Ok(())
            }
            CommandKind::CopyBuffer {
                src,
                dst,
                src_offset,
                dst_offset,
                size,
            } => {
                let bytes = self
                    .mem(*src)?
                    .data
                    .get(*src_offset..src_offset + size)
                    .ok_or(Status::INVALID_VALUE)?
                    .to_vec();
                self.mem_mut(*dst)?
                    .data
                    .get_mut(*dst_offset..dst_offset + size)
                    .ok_or(Status::INVALID_VALUE)?
                    .copy_from_slice(&bytes);
                Ok(())
            }
            CommandKind::ReadImage {
                mem,
                origin,
                region,
                dst,
            } => {
                let mem = self.mem(*mem)?;
                let (row_len, rows) = image_rows(mem.shape, *origin, *region)?;
                for (row, start) in rows.enumerate() {
                    let src = mem
                        .data
                        .get(start..start + row_len)
                        .ok_or(Status::INVALID_VALUE)?;
                    if !dst.write_at(row * row_len, src) {
                        return Err(Status::INVALID_VALUE);
                    }
                }
                Ok(())
            }
            CommandKind::WriteImage {
                mem,
                origin,
                region,
                src,
            } => {
                let mem = self.mem_mut(*mem)?;
                let (row_len, rows) = image_rows(mem.shape, *origin, *region)?;
                for (row, start) in rows.enumerate() {
                    let chunk = src
                        .get(row * row_len..(row + 1) * row_len)
                        .ok_or(Status::INVALID_VALUE)?;
                    mem.data
                        .get_mut(start..start + row_len)
                        .ok_or(Status::INVALID_VALUE)?
                        .copy_from_slice(chunk);
                }
                Ok(())
            }
            // Launches execute outside the lock, see `State::run`.
            CommandKind::NdRange { .. } => Err(Status::INVALID_OPERATION),
            CommandKind::AcquireGl { mems } => {
                for &mem in mems {
                    let token = self.mem(mem)?.gl.ok_or(Status::INVALID_GL_OBJECT)?;
                    let contents = self.gl.contents(token)?.to_vec();
                    let obj = self.mem_mut(mem)?;
                    if contents.len() != obj.size {
                        return Err(Status::INVALID_GL_OBJECT);
                    }
                    obj.data = contents;
                }
                Ok(())
            }
            CommandKind::ReleaseGl { mems } => {
                for &mem in mems {
                    let obj = self.mem(mem)?;
                    let token = obj.gl.ok_or(Status::INVALID_GL_OBJECT)?;
                    let data = obj.data.clone();
                    self.gl.store(token, &data)?;
                }
                Ok(())
            }
            CommandKind::Marker => Ok(()),
        }
    }

    /// Moves the contents of every memory argument of a launch out of its object. Arguments
    /// naming an already checked-out object become aliases of the first.
    fn check_out(&mut self, cmd: Command) -> Result<Launch, (Command, Status)> {
        let CommandKind::NdRange {
            kernel,
            range,
            local,
            ref args,
        } = cmd.kind
        else {
            return Err((cmd, Status::INVALID_OPERATION));
        };
        match self.take_args(kernel, args) {
            Ok((name, body, args, checked_out)) => Ok(Launch {
                cmd,
                kernel,
                name,
                body,
                range,
                local,
                args,
                checked_out,
            }),
            Err(status) => Err((cmd, status)),
        }
    }

    #[allow(clippy::type_complexity)]
    fn take_args(
        &mut self,
        kernel: RawKernel,
        args: &[BoundArg],
    ) -> Result<(String, KernelFn, Vec<LaunchArg>, Vec<(usize, RawMem)>), Status> {
        let name = self.kernel(kernel)?.entry.name.clone();
        let body = self
            .kernels
            .get(&name)
            .cloned()
            .ok_or(Status::INVALID_KERNEL)?;
        // Nothing is taken unless every object is still there to give it back to.
        for arg in args {
            if let BoundArg::Mem(mem) = arg {
                self.mem(*mem)?;
            }
        }

        let mut checked_out: Vec<(usize, RawMem)> = Vec::new();
        let mut launch_args = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let launch_arg = match arg {
                BoundArg::Bytes(bytes) => LaunchArg::Scalar(bytes.clone()),
                BoundArg::Local(len) => LaunchArg::Local(*len),
                BoundArg::Mem(mem) => match checked_out.iter().find(|(_, m)| m == mem) {
                    Some(&(first, _)) => LaunchArg::Alias(first),
                    None => {
                        let obj = self.mem_mut(*mem)?;
                        let image = match obj.shape {
                            MemShape::Buffer => None,
                            MemShape::Image {
                                format,
                                width,
                                height,
                            } => Some((format, width, height)),
                        };
                        let data = std::mem::take(&mut obj.data);
                        checked_out.push((index, *mem));
                        LaunchArg::Mem { data, image }
                    }
                },
            };
            launch_args.push(launch_arg);
        }
        Ok((name, body, launch_args, checked_out))
    }
}

fn outcome(event: RawEvent, result: Result<(), Status>) -> EventStatus {
    match result {
        Ok(()) => EventStatus::Complete,
        Err(status) => {
            warn!(%event, %status, "command failed");
            EventStatus::Error(status)
        }
    }
}

/// Row length in bytes and the byte offset of each row of an image region.
pub(crate) fn image_rows(
    shape: MemShape,
    origin: [usize; 2],
    region: [usize; 2],
) -> Result<(usize, impl Iterator<Item = usize>), Status> {
    let MemShape::Image {
        format,
        width,
        height,
    } = shape
    else {
        return Err(Status::INVALID_MEM_OBJECT);
    };
    let fits = |o: usize, r: usize, limit: usize| o.checked_add(r).map_or(false, |e| e <= limit);
    if !fits(origin[0], region[0], width) || !fits(origin[1], region[1], height) {
        return Err(Status::INVALID_VALUE);
    }
    let bpp = format.bytes_per_pixel();
    let row_len = region[0] * bpp;
    let rows = (0..region[1]).map(move |row| ((origin[1] + row) * width + origin[0]) * bpp);
    Ok((row_len, rows))
}

/// Body of the scheduler thread.
pub(crate) fn run(shared: Arc<Shared>) {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            break;
        }
        if !state.paused {
            state.submit_queued();
            if let Some(seq) = state.next_ready() {
                if let Some(mut launch) = state.run(seq) {
                    drop(state);
                    let result = launch.execute();
                    state = shared.lock();
                    state.finish_launch(launch, result);
                }
                shared.cond.notify_all();
                let notifications = std::mem::take(&mut state.notifications);
                if !notifications.is_empty() {
                    drop(state);
                    Shared::deliver(notifications);
                    state = shared.lock();
                }
                continue;
            }
        }
        state = shared.wait(state);
    }
}

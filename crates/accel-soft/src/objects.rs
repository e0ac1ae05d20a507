use std::collections::HashMap;

use accel_sys::{
    BuildStatus, CommandType, EventStatus, GlObjectToken, ImageFormat, MemFlags, NotifyFn,
    ObjectKind, ProfilingParam, QueueProperties, RawContext, RawDevice, RawEvent, RawHandle,
    RawMem, RawProgram, RawQueue, Status,
};

use crate::compiler::EntryPoint;

pub(crate) struct ContextObj {
    pub devices: Vec<RawDevice>,
    pub gl_share_group: Option<u64>,
    pub notify: Option<NotifyFn>,
    /// Bytes currently allocated by memory objects of this context.
    pub allocated: u64,
}

pub(crate) struct QueueObj {
    pub context: RawContext,
    pub device: RawDevice,
    pub properties: QueueProperties,
    /// Most recent command, for in-order chaining.
    pub last: Option<RawEvent>,
}

impl QueueObj {
    pub fn in_order(&self) -> bool {
        !self
            .properties
            .contains(QueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE)
    }

    pub fn profiling(&self) -> bool {
        self.properties.contains(QueueProperties::PROFILING_ENABLE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemShape {
    Buffer,
    Image {
        format: ImageFormat,
        width: usize,
        height: usize,
    },
}

pub(crate) struct MemObj {
    pub context: RawContext,
    pub flags: MemFlags,
    pub shape: MemShape,
    pub size: usize,
    /// Empty while a kernel launch has the contents checked out.
    pub data: Vec<u8>,
    pub gl: Option<GlObjectToken>,
}

pub(crate) struct BuildRecord {
    pub status: BuildStatus,
    pub options: String,
    pub log: String,
    /// `Some` exactly when the build for this device succeeded.
    pub entry_points: Option<Vec<EntryPoint>>,
}

pub(crate) struct ProgramObj {
    pub context: RawContext,
    pub source: String,
    pub builds: HashMap<RawDevice, BuildRecord>,
    pub attached_kernels: usize,
}

impl ProgramObj {
    /// Entry points of the executable built for `device`.
    pub fn executable_for(&self, device: RawDevice) -> Option<&[EntryPoint]> {
        self.builds.get(&device)?.entry_points.as_deref()
    }

    /// Entry points of the first device in `devices` with a successful build.
    pub fn executable(&self, devices: &[RawDevice]) -> Option<&[EntryPoint]> {
        devices.iter().find_map(|&device| self.executable_for(device))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BoundArg {
    Bytes(Vec<u8>),
    Mem(RawMem),
    Local(usize),
}

pub(crate) struct KernelObj {
    pub program: RawProgram,
    pub context: RawContext,
    pub entry: EntryPoint,
    pub args: Vec<Option<BoundArg>>,
}

pub(crate) struct EventObj {
    pub context: RawContext,
    pub queue: RawQueue,
    pub command_type: CommandType,
    pub status: EventStatus,
    pub profiling: bool,
    pub times: [Option<u64>; 4],
}

impl EventObj {
    pub fn time(&self, param: ProfilingParam) -> Option<u64> {
        self.times[profiling_slot(param)]
    }

    pub fn stamp(&mut self, param: ProfilingParam, now: u64) {
        self.times[profiling_slot(param)] = Some(now);
    }
}

fn profiling_slot(param: ProfilingParam) -> usize {
    match param {
        ProfilingParam::Queued => 0,
        ProfilingParam::Submit => 1,
        ProfilingParam::Start => 2,
        ProfilingParam::End => 3,
    }
}

pub(crate) enum Object {
    Context(ContextObj),
    Queue(QueueObj),
    Mem(MemObj),
    Program(ProgramObj),
    Kernel(KernelObj),
    Event(EventObj),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Context(_) => ObjectKind::Context,
            Object::Queue(_) => ObjectKind::Queue,
            Object::Mem(_) => ObjectKind::Mem,
            Object::Program(_) => ObjectKind::Program,
            Object::Kernel(_) => ObjectKind::Kernel,
            Object::Event(_) => ObjectKind::Event,
        }
    }

    /// Internal references this object holds on other objects.
    pub fn dependencies(&self) -> Vec<RawHandle> {
        match self {
            Object::Context(_) | Object::Event(_) => Vec::new(),
            Object::Queue(q) => vec![q.context.handle()],
            Object::Mem(m) => vec![m.context.handle()],
            Object::Program(p) => vec![p.context.handle()],
            Object::Kernel(k) => std::iter::once(k.program.handle())
                .chain(k.args.iter().filter_map(|arg| match arg {
                    Some(BoundArg::Mem(mem)) => Some(mem.handle()),
                    _ => None,
                }))
                .collect(),
        }
    }
}

pub(crate) struct Entry {
    /// Host references plus internal ones.
    pub refs: u32,
    pub object: Object,
}

/// The status a call reports for a handle that is not a live object of `kind`.
pub(crate) fn invalid_status(kind: ObjectKind) -> Status {
    match kind {
        ObjectKind::Context => Status::INVALID_CONTEXT,
        ObjectKind::Queue => Status::INVALID_COMMAND_QUEUE,
        ObjectKind::Mem => Status::INVALID_MEM_OBJECT,
        ObjectKind::Program => Status::INVALID_PROGRAM,
        ObjectKind::Kernel => Status::INVALID_KERNEL,
        ObjectKind::Event => Status::INVALID_EVENT,
    }
}

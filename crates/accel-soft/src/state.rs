use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use accel_sys::{
    NotifyFn, ObjectKind, RawContext, RawDevice, RawEvent, RawHandle, RawKernel, RawMem,
    RawPlatform, RawProgram, RawQueue, Status,
};
use tracing::debug;

use crate::config::{SoftConfig, SoftDeviceConfig};
use crate::gl::GlObjects;
use crate::launch::KernelFn;
use crate::ledger::Ledger;
use crate::objects::{
    invalid_status, ContextObj, Entry, EventObj, KernelObj, MemObj, Object, ProgramObj, QueueObj,
};
use crate::scheduler::{Command, Transition};

pub(crate) struct DeviceSlot {
    pub id: RawDevice,
    pub config: SoftDeviceConfig,
    pub lost: bool,
}

pub(crate) struct State {
    pub config: SoftConfig,
    pub platform: RawPlatform,
    pub devices: Vec<DeviceSlot>,
    next_id: u64,
    objects: HashMap<RawHandle, Entry>,
    pub pending: BTreeMap<u64, Command>,
    pub next_seq: u64,
    pub timeline: Vec<Transition>,
    pub kernels: HashMap<String, KernelFn>,
    pub gl: GlObjects,
    pub notifications: Vec<(NotifyFn, String)>,
    pub paused: bool,
    /// Queue of the kernel launch executing outside the lock.
    pub running: Option<RawQueue>,
    pub shutdown: bool,
    pub fail_next_allocation: bool,
    pub size_races: u32,
    pub ledger: Arc<Ledger>,
    epoch: Instant,
}

impl State {
    pub fn new(config: SoftConfig, ledger: Arc<Ledger>) -> Self {
        let mut next_id = 1;
        let platform = RawPlatform(RawHandle(next_id));
        let devices = config
            .devices
            .iter()
            .map(|device| {
                next_id += 1;
                DeviceSlot {
                    id: RawDevice(RawHandle(next_id)),
                    config: device.clone(),
                    lost: false,
                }
            })
            .collect();

        Self {
            config,
            platform,
            devices,
            // Object ids start well clear of platform and device ids.
            next_id: 0x1000,
            objects: HashMap::new(),
            pending: BTreeMap::new(),
            next_seq: 0,
            timeline: Vec::new(),
            kernels: HashMap::new(),
            gl: GlObjects::default(),
            notifications: Vec::new(),
            paused: false,
            running: None,
            shutdown: false,
            fail_next_allocation: false,
            size_races: 0,
            ledger,
            epoch: Instant::now(),
        }
    }

    /// Device clock in nanoseconds.
    pub fn now_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    pub fn device(&self, id: RawDevice) -> Result<&DeviceSlot, Status> {
        self.devices
            .iter()
            .find(|slot| slot.id == id)
            .ok_or(Status::INVALID_DEVICE)
    }

    pub fn check_platform(&self, platform: RawPlatform) -> Result<(), Status> {
        if platform == self.platform {
            Ok(())
        } else {
            Err(Status::INVALID_PLATFORM)
        }
    }

    /// Inserts a new object holding one host reference.
    pub fn insert(&mut self, object: Object) -> RawHandle {
        let id = RawHandle(self.next_id);
        self.next_id += 1;
        let kind = object.kind();
        for dep in object.dependencies() {
            self.add_ref(dep);
        }
        self.objects.insert(id, Entry { refs: 1, object });
        self.ledger.inc_created(kind);
        debug!(%kind, %id, "created");
        id
    }

    fn entry_mut(&mut self, kind: ObjectKind, id: RawHandle) -> Result<&mut Entry, Status> {
        match self.objects.get_mut(&id) {
            Some(entry) if entry.object.kind() == kind => Ok(entry),
            _ => Err(invalid_status(kind)),
        }
    }

    pub fn reference_count(&self, kind: ObjectKind, id: RawHandle) -> Result<u32, Status> {
        match self.objects.get(&id) {
            Some(entry) if entry.object.kind() == kind => Ok(entry.refs),
            _ => Err(invalid_status(kind)),
        }
    }

    pub fn retain_host(&mut self, kind: ObjectKind, id: RawHandle) -> Result<(), Status> {
        self.entry_mut(kind, id)?.refs += 1;
        self.ledger.inc_retained(kind);
        Ok(())
    }

    pub fn release_host(&mut self, kind: ObjectKind, id: RawHandle) -> Result<(), Status> {
        self.entry_mut(kind, id)?;
        self.ledger.inc_released(kind);
        self.drop_ref(id);
        Ok(())
    }

    /// Takes an internal reference. Unknown ids are ignored.
    pub fn add_ref(&mut self, id: RawHandle) {
        if let Some(entry) = self.objects.get_mut(&id) {
            entry.refs += 1;
        }
    }

    /// Drops a reference, destroying the object at zero and releasing what it held in turn.
    pub fn drop_ref(&mut self, id: RawHandle) {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let Some(entry) = self.objects.get_mut(&id) else {
                continue;
            };
            entry.refs -= 1;
            if entry.refs > 0 {
                continue;
            }
            let Some(entry) = self.objects.remove(&id) else {
                continue;
            };
            let kind = entry.object.kind();
            match &entry.object {
                Object::Kernel(kernel) => {
                    if let Ok(program) = self.program_mut(kernel.program) {
                        program.attached_kernels -= 1;
                    }
                }
                Object::Mem(mem) => {
                    if let Ok(context) = self.context_mut(mem.context) {
                        context.allocated -= mem.size as u64;
                    }
                }
                _ => {}
            }
            work.extend(entry.object.dependencies());
            self.ledger.inc_destroyed(kind);
            debug!(%kind, %id, "destroyed");
        }
    }

    pub fn context_lost(&self, context: RawContext) -> Result<bool, Status> {
        let context = self.context(context)?;
        Ok(context
            .devices
            .iter()
            .any(|&d| self.device(d).map_or(false, |slot| slot.lost)))
    }

    /// Fails with `DEVICE_LOST` once any device of the context is gone.
    pub fn check_alive(&self, context: RawContext) -> Result<(), Status> {
        if self.context_lost(context)? {
            Err(Status::DEVICE_LOST)
        } else {
            Ok(())
        }
    }

    /// Live contexts containing `device`.
    pub fn contexts_of(&self, device: RawDevice) -> Vec<RawContext> {
        self.objects
            .iter()
            .filter_map(|(&id, entry)| match &entry.object {
                Object::Context(ctx) if ctx.devices.contains(&device) => Some(RawContext(id)),
                _ => None,
            })
            .collect()
    }

    pub fn notify(&mut self, context: RawContext, message: String) {
        if let Ok(Some(notify)) = self.context(context).map(|c| c.notify.clone()) {
            self.notifications.push((notify, message));
        }
    }
}

macro_rules! accessors {
    ($($get:ident, $get_mut:ident: $raw:ident => $variant:ident($obj:ident), $kind:ident;)*) => {
        impl State {
            $(
                pub fn $get(&self, id: $raw) -> Result<&$obj, Status> {
                    match self.objects.get(&id.handle()) {
                        Some(Entry { object: Object::$variant(obj), .. }) => Ok(obj),
                        _ => Err(invalid_status(ObjectKind::$kind)),
                    }
                }

                pub fn $get_mut(&mut self, id: $raw) -> Result<&mut $obj, Status> {
                    match self.objects.get_mut(&id.handle()) {
                        Some(Entry { object: Object::$variant(obj), .. }) => Ok(obj),
                        _ => Err(invalid_status(ObjectKind::$kind)),
                    }
                }
            )*
        }
    };
}

accessors! {
    context, context_mut: RawContext => Context(ContextObj), Context;
    queue, queue_mut: RawQueue => Queue(QueueObj), Queue;
    mem, mem_mut: RawMem => Mem(MemObj), Mem;
    program, program_mut: RawProgram => Program(ProgramObj), Program;
    kernel, kernel_mut: RawKernel => Kernel(KernelObj), Kernel;
    event, event_mut: RawEvent => Event(EventObj), Event;
}

pub(crate) struct Shared {
    state: Mutex<State>,
    pub cond: Condvar,
}

impl Shared {
    pub fn new(state: State) -> Self {
        Self {
            state: Mutex::new(state),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.cond
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands queued context notifications to their callbacks outside the lock.
    pub fn deliver(notifications: Vec<(NotifyFn, String)>) {
        for (notify, message) in notifications {
            notify(&message, &[]);
        }
    }
}

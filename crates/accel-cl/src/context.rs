use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use accel_sys::{Backend, ContextDesc, ImageFormat, NotifyFn, RawContext, RawDevice, Status};
use tracing::{debug, error};

use crate::device::Device;
use crate::error::{Error, Result};
use crate::handle::{ContextKind, Handle};
use crate::memory::MemAccess;
use crate::platform::Platform;

struct ContextShared {
    platform: Platform,
    devices: Vec<Device>,
    gl_share_group: Option<u64>,
    lost: AtomicBool,
}

/// A set of devices sharing memory objects, programs and queues.
///
/// Every object created from a context keeps it alive. Once any operation reports a lost
/// device the context is poisoned: later operations on it or its dependents fail fast with
/// [`Error::DeviceLost`].
#[derive(Clone)]
pub struct Context {
    handle: Handle<ContextKind>,
    shared: Arc<ContextShared>,
}

impl Context {
    /// Context over `devices` with the default error callback, which logs.
    pub fn new<I>(platform: &Platform, devices: I) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: Borrow<Device>,
    {
        Self::builder(platform)
            .devices(devices.into_iter().map(|d| Device::clone(d.borrow())))
            .build()
    }

    pub fn builder(platform: &Platform) -> ContextBuilder {
        ContextBuilder {
            platform: platform.clone(),
            devices: Vec::new(),
            notify: None,
            gl_share_group: None,
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.shared.platform
    }

    pub fn devices(&self) -> &[Device] {
        &self.shared.devices
    }

    pub fn num_devices(&self) -> usize {
        self.devices().len()
    }

    pub fn contains(&self, device: &Device) -> bool {
        self.shared.devices.contains(device)
    }

    pub fn gl_share_group(&self) -> Option<u64> {
        self.shared.gl_share_group
    }

    pub fn is_lost(&self) -> bool {
        self.shared.lost.load(Ordering::Acquire)
    }

    pub fn reference_count(&self) -> Result<u32> {
        self.handle.reference_count()
    }

    /// Image formats every device of the context accepts for `access`.
    pub fn supported_image_formats(&self, access: MemAccess) -> Result<Vec<ImageFormat>> {
        const OP: &str = "Context::supported_image_formats";
        self.ensure_alive(OP)?;
        let result = self
            .backend()
            .supported_image_formats(self.raw(), access.flags(false));
        self.check(OP, result)
    }

    pub fn raw(&self) -> RawContext {
        self.handle.raw()
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        self.handle.backend()
    }

    pub(crate) fn same(&self, other: &Context) -> bool {
        self.raw() == other.raw()
    }

    /// Fails with [`Error::DeviceLost`] once the context is poisoned.
    pub(crate) fn ensure_alive(&self, op: &'static str) -> Result<()> {
        if self.is_lost() {
            Err(Error::DeviceLost {
                op,
                status: Status::DEVICE_LOST,
            })
        } else {
            Ok(())
        }
    }

    /// Translates a backend result, poisoning the context on `DEVICE_LOST`.
    pub(crate) fn check<T>(
        &self,
        op: &'static str,
        result: std::result::Result<T, Status>,
    ) -> Result<T> {
        result.map_err(|status| self.error(op, status))
    }

    pub(crate) fn error(&self, op: &'static str, status: Status) -> Error {
        if status == Status::DEVICE_LOST && !self.shared.lost.swap(true, Ordering::AcqRel) {
            error!(context = %self.raw(), op, "device lost; context poisoned");
        }
        Error::from_status(op, status)
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("raw", &self.raw())
            .field("devices", &self.shared.devices)
            .field("lost", &self.is_lost())
            .finish()
    }
}

/// Builder for [`Context`].
pub struct ContextBuilder {
    platform: Platform,
    devices: Vec<Device>,
    notify: Option<NotifyFn>,
    gl_share_group: Option<u64>,
}

impl ContextBuilder {
    pub fn device(mut self, device: Device) -> Self {
        self.devices.push(device);
        self
    }

    pub fn devices(mut self, devices: impl IntoIterator<Item = Device>) -> Self {
        self.devices.extend(devices);
        self
    }

    /// Receives asynchronous error reports. Called from backend threads.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.notify = Some(Arc::new(callback));
        self
    }

    /// Share group of the graphics context to import objects from.
    pub fn gl_share_group(mut self, share_group: u64) -> Self {
        self.gl_share_group = Some(share_group);
        self
    }

    pub fn build(self) -> Result<Context> {
        const OP: &str = "Context::new";
        if self.devices.is_empty() {
            return Err(Error::configuration(OP, "a context needs at least one device"));
        }
        for (i, device) in self.devices.iter().enumerate() {
            if device.platform_raw() != self.platform.raw() {
                return Err(Error::configuration(
                    OP,
                    format!("device {} belongs to another platform", device.raw()),
                ));
            }
            if self.devices[..i].contains(device) {
                return Err(Error::configuration(
                    OP,
                    format!("device {} listed twice", device.raw()),
                ));
            }
        }

        let notify = self.notify.unwrap_or_else(|| {
            Arc::new(|message: &str, _: &[u8]| error!(detail = message, "context error"))
        });
        let backend = self.platform.backend().clone();
        let raw_devices: Vec<RawDevice> = self.devices.iter().map(Device::raw).collect();
        let desc = ContextDesc {
            platform: self.platform.raw(),
            devices: &raw_devices,
            gl_share_group: self.gl_share_group,
        };
        let raw = backend
            .create_context(&desc, Some(notify))
            .map_err(|status| Error::from_status(OP, status))?;
        debug!(%raw, devices = raw_devices.len(), "created context");

        Ok(Context {
            handle: Handle::adopt(backend, raw),
            shared: Arc::new(ContextShared {
                platform: self.platform,
                devices: self.devices,
                gl_share_group: self.gl_share_group,
                lost: AtomicBool::new(false),
            }),
        })
    }
}

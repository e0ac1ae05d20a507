use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use accel_sys::{Backend, DeviceParam, DeviceType, RawDevice, RawPlatform};

use crate::error::Result;
use crate::query::{fetch_bytes, InfoValue};

/// A typed device info key. The constants live in [`crate::device_info`].
pub struct DeviceInfo<T> {
    name: &'static str,
    param: DeviceParam,
    _value: PhantomData<fn() -> T>,
}

impl<T> DeviceInfo<T> {
    pub(crate) const fn new(name: &'static str, param: DeviceParam) -> Self {
        Self {
            name,
            param,
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn param(&self) -> DeviceParam {
        self.param
    }
}

impl<T> Clone for DeviceInfo<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DeviceInfo<T> {}

impl<T> fmt::Debug for DeviceInfo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A compute device. Root devices are not reference counted, so this is a plain id plus the
/// backend that owns it.
#[derive(Clone)]
pub struct Device {
    backend: Arc<dyn Backend>,
    platform: RawPlatform,
    raw: RawDevice,
}

impl Device {
    pub(crate) fn new(backend: Arc<dyn Backend>, platform: RawPlatform, raw: RawDevice) -> Self {
        Self {
            backend,
            platform,
            raw,
        }
    }

    pub fn raw(&self) -> RawDevice {
        self.raw
    }

    pub fn platform_raw(&self) -> RawPlatform {
        self.platform
    }

    /// Reads one typed capability.
    pub fn info<T: InfoValue>(&self, key: DeviceInfo<T>) -> Result<T> {
        let bytes = fetch_bytes("Device::info", |out| {
            self.backend.device_info(self.raw, key.param, out)
        })?;
        T::decode("Device::info", &bytes)
    }

    pub fn name(&self) -> Result<String> {
        self.info(crate::device_info::NAME)
    }

    pub fn vendor(&self) -> Result<String> {
        self.info(crate::device_info::VENDOR)
    }

    pub fn device_type(&self) -> Result<DeviceType> {
        self.info(crate::device_info::TYPE)
    }

    pub fn extensions(&self) -> Result<Vec<String>> {
        self.info(crate::device_info::EXTENSIONS)
    }

    pub fn max_compute_units(&self) -> Result<u32> {
        self.info(crate::device_info::MAX_COMPUTE_UNITS)
    }

    pub fn max_work_group_size(&self) -> Result<usize> {
        self.info(crate::device_info::MAX_WORK_GROUP_SIZE)
    }

    pub fn max_work_item_sizes(&self) -> Result<Vec<usize>> {
        self.info(crate::device_info::MAX_WORK_ITEM_SIZES)
    }

    pub fn global_mem_size(&self) -> Result<u64> {
        self.info(crate::device_info::GLOBAL_MEM_SIZE)
    }

    pub fn local_mem_size(&self) -> Result<u64> {
        self.info(crate::device_info::LOCAL_MEM_SIZE)
    }

    pub fn max_mem_alloc_size(&self) -> Result<u64> {
        self.info(crate::device_info::MAX_MEM_ALLOC_SIZE)
    }

    pub fn image_support(&self) -> Result<bool> {
        self.info(crate::device_info::IMAGE_SUPPORT)
    }

    /// Largest 2D image as `(width, height)`.
    pub fn image2d_max_size(&self) -> Result<(usize, usize)> {
        Ok((
            self.info(crate::device_info::IMAGE2D_MAX_WIDTH)?,
            self.info(crate::device_info::IMAGE2D_MAX_HEIGHT)?,
        ))
    }

    pub fn is_available(&self) -> Result<bool> {
        self.info(crate::device_info::AVAILABLE)
    }

    /// Every known capability rendered as text, in table order.
    pub fn capabilities(&self) -> Result<Vec<(&'static str, String)>> {
        crate::device_info::TABLE
            .iter()
            .map(|(name, read)| Ok((*name, read(self)?)))
            .collect()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Device {}

impl std::hash::Hash for Device {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Device").field(&self.raw).finish()
    }
}

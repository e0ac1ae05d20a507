use std::fmt;
use std::sync::Arc;

use accel_sys::{Backend, DeviceType, PlatformParam, RawPlatform, Status};
use tracing::debug;

use crate::device::Device;
use crate::error::Result;
use crate::query::{fetch_bytes, fetch_list, InfoValue};

#[derive(Debug)]
struct PlatformInfo {
    name: String,
    vendor: String,
    version: String,
    profile: String,
    extensions: Vec<String>,
}

/// A compute platform. Platforms are not reference counted; their descriptive strings are read
/// once at enumeration.
#[derive(Clone)]
pub struct Platform {
    backend: Arc<dyn Backend>,
    raw: RawPlatform,
    info: Arc<PlatformInfo>,
}

/// Every platform the backend exposes.
pub fn get_platforms(backend: &Arc<dyn Backend>) -> Result<Vec<Platform>> {
    fetch_list("get_platforms", |out| backend.platform_ids(out))?
        .into_iter()
        .map(|raw| Platform::open(backend.clone(), raw))
        .collect()
}

impl Platform {
    fn open(backend: Arc<dyn Backend>, raw: RawPlatform) -> Result<Self> {
        let fetch = |param| -> Result<String> {
            let bytes = fetch_bytes("Platform::info", |out| {
                backend.platform_info(raw, param, out)
            })?;
            String::decode("Platform::info", &bytes)
        };
        let info = PlatformInfo {
            name: fetch(PlatformParam::Name)?,
            vendor: fetch(PlatformParam::Vendor)?,
            version: fetch(PlatformParam::Version)?,
            profile: fetch(PlatformParam::Profile)?,
            extensions: fetch(PlatformParam::Extensions)?
                .split_whitespace()
                .map(str::to_owned)
                .collect(),
        };
        debug!(%raw, name = %info.name, "opened platform");
        Ok(Self {
            backend,
            raw,
            info: Arc::new(info),
        })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn vendor(&self) -> &str {
        &self.info.vendor
    }

    pub fn version(&self) -> &str {
        &self.info.version
    }

    pub fn profile(&self) -> &str {
        &self.info.profile
    }

    pub fn extensions(&self) -> &[String] {
        &self.info.extensions
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.info.extensions.iter().any(|e| e == name)
    }

    pub fn raw(&self) -> RawPlatform {
        self.raw
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn get_devices(&self) -> Result<Vec<Device>> {
        self.get_devices_of_type(DeviceType::ALL)
    }

    /// Devices matching `device_type`. No match is an empty list, not an error.
    pub fn get_devices_of_type(&self, device_type: DeviceType) -> Result<Vec<Device>> {
        let ids = fetch_list("Platform::get_devices", |out| {
            match self.backend.device_ids(self.raw, device_type, out) {
                Err(Status::DEVICE_NOT_FOUND) => Ok(0),
                other => other,
            }
        })?;
        Ok(ids
            .into_iter()
            .map(|raw| Device::new(self.backend.clone(), self.raw, raw))
            .collect())
    }
}

impl PartialEq for Platform {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Platform {}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("raw", &self.raw)
            .field("name", &self.info.name)
            .field("version", &self.info.version)
            .finish()
    }
}

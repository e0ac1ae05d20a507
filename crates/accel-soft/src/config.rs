use serde::Deserialize;
use thiserror::Error;

use accel_sys::DeviceType;

const DEFAULT_GLOBAL_MEM_BYTES: u64 = 256 * 1024 * 1024; // 256 MiB
const DEFAULT_MAX_ALLOC_BYTES: u64 = 64 * 1024 * 1024; // 64 MiB

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),

    #[error("invalid device configuration: {0}")]
    InvalidDevice(String),

    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to start scheduler thread: {0}")]
    Scheduler(#[from] std::io::Error),
}

/// Kind of device the reference runtime pretends to be. Only affects the reported type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoftDeviceKind {
    Cpu,
    Gpu,
    Accelerator,
}

impl SoftDeviceKind {
    pub fn device_type(self) -> DeviceType {
        match self {
            SoftDeviceKind::Cpu => DeviceType::CPU,
            SoftDeviceKind::Gpu => DeviceType::GPU,
            SoftDeviceKind::Accelerator => DeviceType::ACCELERATOR,
        }
    }
}

/// Capabilities reported for one simulated device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SoftDeviceConfig {
    pub name: String,
    pub kind: SoftDeviceKind,
    pub compute_units: u32,
    pub clock_mhz: u32,
    pub global_mem_bytes: u64,
    pub local_mem_bytes: u64,
    pub max_alloc_bytes: u64,
    pub max_work_group_size: usize,
    pub max_work_item_sizes: [usize; 3],
    pub image_support: bool,
    pub image2d_max_width: usize,
    pub image2d_max_height: usize,
    pub extensions: Vec<String>,
}

impl Default for SoftDeviceConfig {
    fn default() -> Self {
        Self {
            name: "accel soft device".to_owned(),
            kind: SoftDeviceKind::Cpu,
            compute_units: 4,
            clock_mhz: 1000,
            global_mem_bytes: DEFAULT_GLOBAL_MEM_BYTES,
            local_mem_bytes: 32 * 1024,
            max_alloc_bytes: DEFAULT_MAX_ALLOC_BYTES,
            max_work_group_size: 256,
            max_work_item_sizes: [256, 256, 64],
            image_support: true,
            image2d_max_width: 8192,
            image2d_max_height: 8192,
            extensions: vec![
                "cl_khr_global_int32_base_atomics".to_owned(),
                "cl_khr_gl_sharing".to_owned(),
            ],
        }
    }
}

impl SoftDeviceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidDevice("device name is empty".into()));
        }
        if self.compute_units == 0 {
            return Err(ConfigError::InvalidDevice(format!(
                "{}: compute_units must be non-zero",
                self.name
            )));
        }
        if self.max_work_group_size == 0 || self.max_work_item_sizes.contains(&0) {
            return Err(ConfigError::InvalidDevice(format!(
                "{}: work-group limits must be non-zero",
                self.name
            )));
        }
        if self.max_alloc_bytes == 0 || self.max_alloc_bytes > self.global_mem_bytes {
            return Err(ConfigError::InvalidDevice(format!(
                "{}: max_alloc_bytes must be in 1..=global_mem_bytes",
                self.name
            )));
        }
        Ok(())
    }
}

/// Description of the single platform exposed by [`crate::SoftRuntime`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SoftConfig {
    pub platform_name: String,
    pub vendor: String,
    pub version: String,
    pub profile: String,
    pub extensions: Vec<String>,
    pub devices: Vec<SoftDeviceConfig>,
}

impl Default for SoftConfig {
    fn default() -> Self {
        Self {
            platform_name: "accel soft platform".to_owned(),
            vendor: "accel".to_owned(),
            version: "OpenCL 1.2 accel-soft".to_owned(),
            profile: "FULL_PROFILE".to_owned(),
            extensions: vec!["cl_khr_icd".to_owned(), "cl_khr_gl_sharing".to_owned()],
            devices: vec![SoftDeviceConfig::default()],
        }
    }
}

impl SoftConfig {
    pub fn with_platform_name(mut self, name: impl Into<String>) -> Self {
        self.platform_name = name.into();
        self
    }

    /// Replaces the device list with `count` copies of `device`, numbered by suffix.
    pub fn with_devices(mut self, count: usize, device: SoftDeviceConfig) -> Self {
        self.devices = (0..count)
            .map(|i| SoftDeviceConfig {
                name: if count == 1 {
                    device.name.clone()
                } else {
                    format!("{} #{i}", device.name)
                },
                ..device.clone()
            })
            .collect();
        self
    }

    pub fn with_device(mut self, device: SoftDeviceConfig) -> Self {
        self.devices.push(device);
        self
    }

    /// Reads overrides from the environment on top of the defaults.
    ///
    /// - `ACCEL_SOFT_DEVICES`: number of identical devices (may be 0)
    /// - `ACCEL_SOFT_GLOBAL_MEM_BYTES`
    /// - `ACCEL_SOFT_MAX_ALLOC_BYTES`
    /// - `ACCEL_SOFT_MAX_WORK_GROUP_SIZE`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut device = SoftDeviceConfig::default();
        if let Some(bytes) = env_parse::<u64>("ACCEL_SOFT_GLOBAL_MEM_BYTES")? {
            device.global_mem_bytes = bytes;
        }
        if let Some(bytes) = env_parse::<u64>("ACCEL_SOFT_MAX_ALLOC_BYTES")? {
            device.max_alloc_bytes = bytes;
        }
        if let Some(size) = env_parse::<usize>("ACCEL_SOFT_MAX_WORK_GROUP_SIZE")? {
            device.max_work_group_size = size;
            device.max_work_item_sizes = [size, size, size.min(64)];
        }
        let count = env_parse::<usize>("ACCEL_SOFT_DEVICES")?.unwrap_or(1);

        let config = Self::default().with_devices(count, device);
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SoftConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.devices.iter().try_for_each(SoftDeviceConfig::validate)
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv(var)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidEnv(var)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_overrides_defaults() {
        let config = SoftConfig::from_json(
            r#"{
                "platform_name": "test platform",
                "devices": [
                    { "name": "gpu0", "kind": "gpu", "max_work_group_size": 1024,
                      "max_work_item_sizes": [1024, 1024, 64] }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.platform_name, "test platform");
        assert_eq!(config.vendor, "accel");
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].kind, SoftDeviceKind::Gpu);
        assert_eq!(config.devices[0].max_work_group_size, 1024);
        assert_eq!(config.devices[0].compute_units, 4);
    }

    #[test]
    fn json_rejects_unknown_fields_and_bad_limits() {
        assert!(matches!(
            SoftConfig::from_json(r#"{ "platfrom_name": "typo" }"#),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            SoftConfig::from_json(r#"{ "devices": [ { "compute_units": 0 } ] }"#),
            Err(ConfigError::InvalidDevice(_))
        ));
    }

    #[test]
    fn with_devices_numbers_names() {
        let config = SoftConfig::default().with_devices(2, SoftDeviceConfig::default());
        assert_eq!(config.devices[0].name, "accel soft device #0");
        assert_eq!(config.devices[1].name, "accel soft device #1");
        assert_eq!(
            SoftConfig::default().with_devices(0, SoftDeviceConfig::default()).devices.len(),
            0
        );
    }
}

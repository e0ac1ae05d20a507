//! Typed device capability keys.
//!
//! ```no_run
//! # fn demo(device: &accel_cl::Device) -> accel_cl::Result<()> {
//! use accel_cl::device_info;
//!
//! let units: u32 = device.info(device_info::MAX_COMPUTE_UNITS)?;
//! let name: String = device.info(device_info::NAME)?;
//! println!("{name}: {units} compute units");
//! # Ok(())
//! # }
//! ```

use accel_sys::{DeviceParam, DeviceType};

use crate::device::{Device, DeviceInfo};
use crate::error::Result;
use crate::query::InfoValue;

macro_rules! device_info_keys {
    ($($(#[$meta:meta])* $key:ident: $ty:ty = $param:ident, $name:literal;)*) => {
        $(
            $(#[$meta])*
            pub const $key: DeviceInfo<$ty> = DeviceInfo::new($name, DeviceParam::$param);
        )*

        /// Every key with a reader that renders its value.
        pub(crate) const TABLE: &[(&str, fn(&Device) -> Result<String>)] = &[
            $(($name, |device| device.info($key).map(|v| v.render())),)*
        ];
    };
}

device_info_keys! {
    NAME: String = Name, "name";
    VENDOR: String = Vendor, "vendor";
    TYPE: DeviceType = Type, "type";
    VERSION: String = Version, "version";
    DRIVER_VERSION: String = DriverVersion, "driver version";
    /// Space separated in the native reply.
    EXTENSIONS: Vec<String> = Extensions, "extensions";
    /// Raw id of the owning platform.
    PLATFORM: u64 = Platform, "platform";
    MAX_COMPUTE_UNITS: u32 = MaxComputeUnits, "max compute units";
    MAX_WORK_ITEM_DIMENSIONS: u32 = MaxWorkItemDimensions, "max work item dimensions";
    MAX_WORK_ITEM_SIZES: Vec<usize> = MaxWorkItemSizes, "max work item sizes";
    MAX_WORK_GROUP_SIZE: usize = MaxWorkGroupSize, "max work group size";
    /// In MHz.
    MAX_CLOCK_FREQUENCY: u32 = MaxClockFrequency, "max clock frequency";
    ADDRESS_BITS: u32 = AddressBits, "address bits";
    GLOBAL_MEM_SIZE: u64 = GlobalMemSize, "global memory size";
    LOCAL_MEM_SIZE: u64 = LocalMemSize, "local memory size";
    MAX_MEM_ALLOC_SIZE: u64 = MaxMemAllocSize, "max allocation size";
    MAX_CONSTANT_BUFFER_SIZE: u64 = MaxConstantBufferSize, "max constant buffer size";
    IMAGE_SUPPORT: bool = ImageSupport, "image support";
    IMAGE2D_MAX_WIDTH: usize = Image2dMaxWidth, "image2d max width";
    IMAGE2D_MAX_HEIGHT: usize = Image2dMaxHeight, "image2d max height";
    AVAILABLE: bool = Available, "available";
    COMPILER_AVAILABLE: bool = CompilerAvailable, "compiler available";
    /// In nanoseconds.
    PROFILING_TIMER_RESOLUTION: usize = ProfilingTimerResolution, "profiling timer resolution";
}

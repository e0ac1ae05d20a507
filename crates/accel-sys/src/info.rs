//! Info query parameter ids.
//!
//! Every info query uses the two-call idiom: called with no output buffer it returns the
//! number of bytes (or elements) the answer needs; called with a buffer of that size it fills
//! it. Values are encoded in native byte order: integers at their natural width, `size_t`
//! values as `usize`, booleans as `u32`, strings as UTF-8 with a trailing NUL.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformParam {
    Profile,
    Version,
    Name,
    Vendor,
    Extensions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceParam {
    /// `u64` device type bits.
    Type,
    Name,
    Vendor,
    Version,
    DriverVersion,
    Extensions,
    /// `u64` raw platform id.
    Platform,
    MaxComputeUnits,
    MaxWorkItemDimensions,
    /// `usize` per dimension.
    MaxWorkItemSizes,
    MaxWorkGroupSize,
    MaxClockFrequency,
    AddressBits,
    GlobalMemSize,
    LocalMemSize,
    MaxMemAllocSize,
    MaxConstantBufferSize,
    ImageSupport,
    Image2dMaxWidth,
    Image2dMaxHeight,
    Available,
    CompilerAvailable,
    ProfilingTimerResolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemParam {
    /// `usize` bytes.
    Size,
    /// `u64` [`crate::MemFlags`] bits.
    Flags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramParam {
    NumKernels,
    /// Semicolon separated entry point names.
    KernelNames,
    Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramBuildParam {
    /// `i32`, see [`BuildStatus`].
    Status,
    Options,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelParam {
    FunctionName,
    NumArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelWorkGroupParam {
    WorkGroupSize,
    /// Three `usize` values; all zero when the kernel does not require a work-group size.
    CompileWorkGroupSize,
    LocalMemSize,
    PreferredWorkGroupSizeMultiple,
    PrivateMemSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfilingParam {
    Queued,
    Submit,
    Start,
    End,
}

/// Per-device build state of a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildStatus {
    None,
    Error,
    Success,
    InProgress,
}

impl BuildStatus {
    pub fn code(self) -> i32 {
        match self {
            BuildStatus::Success => 0,
            BuildStatus::None => -1,
            BuildStatus::Error => -2,
            BuildStatus::InProgress => -3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(BuildStatus::Success),
            -1 => Some(BuildStatus::None),
            -2 => Some(BuildStatus::Error),
            -3 => Some(BuildStatus::InProgress),
            _ => None,
        }
    }
}

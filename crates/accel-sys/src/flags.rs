use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct DeviceType: u64 {
        const DEFAULT = 1 << 0;
        const CPU = 1 << 1;
        const GPU = 1 << 2;
        const ACCELERATOR = 1 << 3;
        const ALL = 0xFFFF_FFFF;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MemFlags: u64 {
        const READ_WRITE = 1 << 0;
        const WRITE_ONLY = 1 << 1;
        const READ_ONLY = 1 << 2;
        const USE_HOST_PTR = 1 << 3;
        const ALLOC_HOST_PTR = 1 << 4;
        const COPY_HOST_PTR = 1 << 5;
    }
}

impl MemFlags {
    /// The kernel access bits (`READ_WRITE`, `WRITE_ONLY`, `READ_ONLY`).
    pub fn access(self) -> MemFlags {
        self & (MemFlags::READ_WRITE | MemFlags::WRITE_ONLY | MemFlags::READ_ONLY)
    }

    /// At most one access bit may be set; none means `READ_WRITE`.
    pub fn is_valid_access(self) -> bool {
        self.access().bits().count_ones() <= 1
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct QueueProperties: u64 {
        const OUT_OF_ORDER_EXEC_MODE_ENABLE = 1 << 0;
        const PROFILING_ENABLE = 1 << 1;
    }
}

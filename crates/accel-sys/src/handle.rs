use std::fmt;

/// Opaque id of a backend object. Backends never hand out `0`; [`RawHandle::NULL`] only fills
/// output arrays before a query writes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RawHandle(pub u64);

impl RawHandle {
    pub const NULL: RawHandle = RawHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

macro_rules! raw_handle {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
            pub struct $name(pub RawHandle);

            impl $name {
                pub const NULL: $name = $name(RawHandle::NULL);

                pub fn handle(self) -> RawHandle {
                    self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    self.0.fmt(f)
                }
            }
        )*
    };
}

raw_handle! {
    /// A platform id. Platforms are not reference counted.
    RawPlatform;
    /// A device id. Root devices are not reference counted.
    RawDevice;
    RawContext;
    RawQueue;
    /// A memory object (buffer or image).
    RawMem;
    RawProgram;
    RawKernel;
    RawEvent;
}

/// The reference-counted object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Context,
    Queue,
    Mem,
    Program,
    Kernel,
    Event,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 6] = [
        ObjectKind::Context,
        ObjectKind::Queue,
        ObjectKind::Mem,
        ObjectKind::Program,
        ObjectKind::Kernel,
        ObjectKind::Event,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Context => "context",
            ObjectKind::Queue => "command queue",
            ObjectKind::Mem => "memory object",
            ObjectKind::Program => "program",
            ObjectKind::Kernel => "kernel",
            ObjectKind::Event => "event",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use std::fmt;

use accel_sys::{ImageFormat, Status};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], for callers that only need to decide what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request itself was malformed: bad flags, sizes, formats, objects from another context.
    Configuration,
    /// The device or host ran out of memory or another resource.
    ResourceExhausted,
    /// Program compilation failed; the error carries every device's build log.
    Build,
    /// A kernel argument was missing or incompatible.
    Argument,
    /// The device is gone. Every object of the affected context is poisoned.
    DeviceLost,
    /// A command failed while executing.
    Operation,
    /// A named entity (kernel, device) does not exist.
    NotFound,
    /// The backend answered a query with a malformed or inconsistent reply.
    Structural,
}

/// What an allocation that ran out of resources asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Unspecified,
    Bytes(usize),
    Image {
        format: ImageFormat,
        width: usize,
        height: usize,
    },
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Unspecified => f.write_str("unspecified request"),
            Request::Bytes(len) => write!(f, "{len} bytes"),
            Request::Image {
                format,
                width,
                height,
            } => write!(
                f,
                "{width}x{height} {:?}/{:?} image",
                format.order, format.data_type
            ),
        }
    }
}

/// Build output of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLog {
    pub device: String,
    pub log: String,
}

fn render_logs(logs: &[BuildLog]) -> String {
    logs.iter()
        .map(|l| format!("\n--- {} ---\n{}", l.device, l.log.trim_end()))
        .collect()
}

fn render_index(index: &Option<u32>) -> String {
    index.map_or_else(String::new, |i| format!(" {i}"))
}

/// Every failure the wrapper reports. Each variant records the operation that failed and the
/// native status behind it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("{op}: invalid configuration: {detail} [{status}]")]
    Configuration {
        op: &'static str,
        status: Status,
        detail: String,
    },

    #[error("{op}: out of resources for {request} [{status}]")]
    ResourceExhausted {
        op: &'static str,
        status: Status,
        request: Request,
    },

    #[error("{op}: program build failed [{status}]{}", render_logs(.logs))]
    Build {
        op: &'static str,
        status: Status,
        logs: Vec<BuildLog>,
    },

    #[error("{op}: kernel '{kernel}' argument{}: {detail} [{status}]", render_index(.index))]
    Argument {
        op: &'static str,
        status: Status,
        kernel: String,
        index: Option<u32>,
        detail: String,
    },

    #[error("{op}: device lost [{status}]")]
    DeviceLost { op: &'static str, status: Status },

    #[error("{op}: operation failed: {detail} [{status}]")]
    Operation {
        op: &'static str,
        status: Status,
        detail: String,
    },

    #[error("{op}: {detail} not found [{status}]")]
    NotFound {
        op: &'static str,
        status: Status,
        detail: String,
    },

    #[error("{op}: malformed reply: {detail} [{status}]")]
    Structural {
        op: &'static str,
        status: Status,
        detail: String,
    },
}

impl Error {
    /// Classifies a native failure status.
    pub fn from_status(op: &'static str, status: Status) -> Self {
        let detail = status.name().unwrap_or("unrecognized status").to_owned();
        match status {
            Status::DEVICE_LOST => Error::DeviceLost { op, status },
            Status::MEM_OBJECT_ALLOCATION_FAILURE
            | Status::OUT_OF_RESOURCES
            | Status::OUT_OF_HOST_MEMORY => Error::ResourceExhausted {
                op,
                status,
                request: Request::Unspecified,
            },
            Status::BUILD_PROGRAM_FAILURE => Error::Build {
                op,
                status,
                logs: Vec::new(),
            },
            Status::INVALID_ARG_INDEX
            | Status::INVALID_ARG_VALUE
            | Status::INVALID_ARG_SIZE
            | Status::INVALID_KERNEL_ARGS => Error::Argument {
                op,
                status,
                kernel: String::new(),
                index: None,
                detail,
            },
            Status::INVALID_KERNEL_NAME => Error::NotFound {
                op,
                status,
                detail: "kernel".to_owned(),
            },
            Status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST | Status::MAP_FAILURE => {
                Error::Operation { op, status, detail }
            }
            _ if status.name().is_none() => Error::Operation { op, status, detail },
            _ => Error::Configuration { op, status, detail },
        }
    }

    /// A request rejected by the wrapper before reaching the backend.
    pub fn configuration(op: &'static str, detail: impl Into<String>) -> Self {
        Error::Configuration {
            op,
            status: Status::INVALID_VALUE,
            detail: detail.into(),
        }
    }

    pub fn structural(op: &'static str, status: Status, detail: impl Into<String>) -> Self {
        Error::Structural {
            op,
            status,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration { .. } => ErrorKind::Configuration,
            Error::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Error::Build { .. } => ErrorKind::Build,
            Error::Argument { .. } => ErrorKind::Argument,
            Error::DeviceLost { .. } => ErrorKind::DeviceLost,
            Error::Operation { .. } => ErrorKind::Operation,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Structural { .. } => ErrorKind::Structural,
        }
    }

    /// The native status behind the error.
    pub fn status(&self) -> Status {
        match self {
            Error::Configuration { status, .. }
            | Error::ResourceExhausted { status, .. }
            | Error::Build { status, .. }
            | Error::Argument { status, .. }
            | Error::DeviceLost { status, .. }
            | Error::Operation { status, .. }
            | Error::NotFound { status, .. }
            | Error::Structural { status, .. } => *status,
        }
    }

    /// Name of the failed operation.
    pub fn op(&self) -> &'static str {
        match self {
            Error::Configuration { op, .. }
            | Error::ResourceExhausted { op, .. }
            | Error::Build { op, .. }
            | Error::Argument { op, .. }
            | Error::DeviceLost { op, .. }
            | Error::Operation { op, .. }
            | Error::NotFound { op, .. }
            | Error::Structural { op, .. } => op,
        }
    }

    /// Whether the context the error came from is unusable from now on.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::DeviceLost
    }

    /// Per-device logs of a [`Error::Build`]; empty for every other variant.
    pub fn build_logs(&self) -> &[BuildLog] {
        match self {
            Error::Build { logs, .. } => logs,
            _ => &[],
        }
    }

    /// Replaces the free-form detail of variants that carry one.
    pub fn with_detail(mut self, new: impl Into<String>) -> Self {
        match &mut self {
            Error::Configuration { detail, .. }
            | Error::Argument { detail, .. }
            | Error::Operation { detail, .. }
            | Error::NotFound { detail, .. }
            | Error::Structural { detail, .. } => *detail = new.into(),
            _ => {}
        }
        self
    }

    /// Attaches the allocation request to a [`Error::ResourceExhausted`].
    pub fn with_request(mut self, new: Request) -> Self {
        if let Error::ResourceExhausted { request, .. } = &mut self {
            *request = new;
        }
        self
    }

    /// Attaches the kernel and argument slot to an [`Error::Argument`].
    pub(crate) fn with_argument(mut self, name: &str, slot: Option<u32>) -> Self {
        if let Error::Argument { kernel, index, .. } = &mut self {
            name.clone_into(kernel);
            *index = slot;
        }
        self
    }
}

/// Converts raw backend results into [`Error`]s tagged with the failing operation.
pub trait StatusExt<T> {
    fn check(self, op: &'static str) -> Result<T>;
}

impl<T> StatusExt<T> for std::result::Result<T, Status> {
    fn check(self, op: &'static str) -> Result<T> {
        self.map_err(|status| Error::from_status(op, status))
    }
}

use std::fmt;

use accel_sys::{BuildStatus, ProgramBuildParam, ProgramParam, RawDevice, RawProgram, Status};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::device::Device;
use crate::error::{BuildLog, Error, Result};
use crate::handle::{Handle, ProgramKind};
use crate::kernel::Kernel;
use crate::query::{fetch_bytes, InfoValue};

/// Device code created from source text.
#[derive(Clone)]
pub struct Program {
    handle: Handle<ProgramKind>,
    context: Context,
}

impl Program {
    pub fn with_source(context: &Context, source: &str) -> Result<Self> {
        Self::with_sources(context, &[source])
    }

    /// Concatenates `sources` into one program.
    pub fn with_sources(context: &Context, sources: &[&str]) -> Result<Self> {
        const OP: &str = "Program::with_source";
        context.ensure_alive(OP)?;
        if sources.is_empty() || sources.iter().any(|s| s.is_empty()) {
            return Err(Error::configuration(OP, "program source is empty"));
        }
        let result = context.backend().create_program(context.raw(), sources);
        let raw = context.check(OP, result)?;
        Ok(Self {
            handle: Handle::adopt(context.backend().clone(), raw),
            context: context.clone(),
        })
    }

    pub fn raw(&self) -> RawProgram {
        self.handle.raw()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn reference_count(&self) -> Result<u32> {
        self.handle.reference_count()
    }

    /// Builds for every device of the context.
    pub fn build(&self, options: &str) -> Result<()> {
        let devices = self.context.devices().to_vec();
        self.build_for(&devices, options)
    }

    /// Builds for a subset of the context's devices. A failed build reports every failing
    /// device's log.
    pub fn build_for(&self, devices: &[Device], options: &str) -> Result<()> {
        const OP: &str = "Program::build";
        self.context.ensure_alive(OP)?;
        if devices.is_empty() {
            return Err(Error::configuration(OP, "no devices to build for"));
        }
        if let Some(stranger) = devices.iter().find(|d| !self.context.contains(d)) {
            return Err(Error::configuration(
                OP,
                format!("device {} is not part of the context", stranger.raw()),
            ));
        }
        let raw: Vec<RawDevice> = devices.iter().map(Device::raw).collect();
        debug!(program = %self.raw(), options, devices = raw.len(), "building");
        match self.context.backend().build_program(self.raw(), &raw, options) {
            Ok(()) => {
                info!(program = %self.raw(), "program built");
                Ok(())
            }
            Err(
                status @ (Status::BUILD_PROGRAM_FAILURE
                | Status::INVALID_BUILD_OPTIONS
                | Status::COMPILER_NOT_AVAILABLE),
            ) => {
                let failed: Vec<&Device> = devices
                    .iter()
                    .filter(|d| self.build_status(d).map_or(true, |s| s != BuildStatus::Success))
                    .collect();
                let logs = failed
                    .into_iter()
                    .map(|device| BuildLog {
                        device: device
                            .name()
                            .unwrap_or_else(|_| device.raw().to_string()),
                        log: self.build_log(device),
                    })
                    .collect();
                Err(Error::Build {
                    op: OP,
                    status,
                    logs,
                })
            }
            Err(status) => Err(self.context.error(OP, status)),
        }
    }

    fn build_info(&self, device: &Device, param: ProgramBuildParam) -> Result<Vec<u8>> {
        fetch_bytes("Program::build_info", |out| {
            self.context
                .backend()
                .program_build_info(self.raw(), device.raw(), param, out)
        })
    }

    pub fn build_status(&self, device: &Device) -> Result<BuildStatus> {
        let bytes = self.build_info(device, ProgramBuildParam::Status)?;
        let code = i32::decode("Program::build_status", &bytes)?;
        BuildStatus::from_code(code).ok_or_else(|| {
            Error::structural(
                "Program::build_status",
                Status::SUCCESS,
                format!("unknown build status {code}"),
            )
        })
    }

    /// The last build log for `device`. Never fails: an unavailable log reads as empty.
    pub fn build_log(&self, device: &Device) -> String {
        match self
            .build_info(device, ProgramBuildParam::Log)
            .and_then(|bytes| String::decode("Program::build_log", &bytes))
        {
            Ok(log) => log,
            Err(err) => {
                warn!(program = %self.raw(), device = %device.raw(), %err, "build log unavailable");
                String::new()
            }
        }
    }

    pub fn build_options(&self, device: &Device) -> Result<String> {
        let bytes = self.build_info(device, ProgramBuildParam::Options)?;
        String::decode("Program::build_options", &bytes)
    }

    pub fn source(&self) -> Result<String> {
        self.string_info("Program::source", ProgramParam::Source)
    }

    /// Entry points of the last successful build.
    pub fn kernel_names(&self) -> Result<Vec<String>> {
        const OP: &str = "Program::kernel_names";
        let names = self
            .string_info(OP, ProgramParam::KernelNames)
            .map_err(|e| not_built(OP, e))?;
        Ok(names
            .split(';')
            .filter(|n| !n.is_empty())
            .map(str::to_owned)
            .collect())
    }

    fn string_info(&self, op: &'static str, param: ProgramParam) -> Result<String> {
        let bytes = fetch_bytes(op, |out| {
            self.context.backend().program_info(self.raw(), param, out)
        })?;
        String::decode(op, &bytes)
    }

    /// Creates the kernel `name`. Fails with [`Error::NotFound`] when the program has no
    /// successful build or no such entry point.
    pub fn get_kernel(&self, name: &str) -> Result<Kernel> {
        const OP: &str = "Program::get_kernel";
        self.context.ensure_alive(OP)?;
        let result = self.context.backend().create_kernel(self.raw(), name);
        let raw = self
            .context
            .check(OP, result)
            .map_err(|e| match e.status() {
                Status::INVALID_KERNEL_NAME => e.with_detail(format!("kernel '{name}'")),
                _ => not_built(OP, e),
            })?;
        Kernel::adopt(self, raw)
    }

    /// One kernel per entry point.
    pub fn create_kernels(&self) -> Result<Vec<Kernel>> {
        self.kernel_names()?
            .iter()
            .map(|name| self.get_kernel(name))
            .collect()
    }
}

fn not_built(op: &'static str, err: Error) -> Error {
    if err.status() == Status::INVALID_PROGRAM_EXECUTABLE {
        Error::NotFound {
            op,
            status: err.status(),
            detail: "successful program build".to_owned(),
        }
    } else {
        err
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Program").field(&self.raw()).finish()
    }
}

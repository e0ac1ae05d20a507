use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use accel_sys::{KernelArgValue, KernelParam, KernelWorkGroupParam, RawEvent, RawKernel, Status};
use bytemuck::Pod;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::handle::{Handle, KernelKind};
use crate::memory::{Buffer, Image2D, MemoryObject};
use crate::program::Program;
use crate::query::{fetch_bytes, InfoValue};

/// A recorded kernel argument.
#[derive(Debug, Clone)]
pub enum KernelArg {
    /// A by-value argument as raw bytes.
    Scalar(Vec<u8>),
    Buffer(Buffer),
    Image(Image2D),
    /// A `__local` allocation of the given byte size.
    Local(usize),
}

impl KernelArg {
    pub fn scalar<T: Pod>(value: T) -> Self {
        KernelArg::Scalar(bytemuck::bytes_of(&value).to_vec())
    }

    pub fn local(bytes: usize) -> Self {
        KernelArg::Local(bytes)
    }

    pub(crate) fn memory(&self) -> Option<&dyn MemoryObject> {
        match self {
            KernelArg::Buffer(buffer) => Some(buffer),
            KernelArg::Image(image) => Some(image),
            KernelArg::Scalar(_) | KernelArg::Local(_) => None,
        }
    }
}

impl From<&Buffer> for KernelArg {
    fn from(buffer: &Buffer) -> Self {
        KernelArg::Buffer(buffer.clone())
    }
}

impl From<&Image2D> for KernelArg {
    fn from(image: &Image2D) -> Self {
        KernelArg::Image(image.clone())
    }
}

/// An entry point of a built program.
///
/// Arguments are recorded host-side and handed to the backend when the kernel is enqueued, so
/// an incompatible argument surfaces as [`Error::Argument`] from
/// [`crate::CommandQueue::run_kernel`]. Clones share one argument set.
#[derive(Clone)]
pub struct Kernel {
    handle: Handle<KernelKind>,
    program: Program,
    name: Arc<str>,
    args: Arc<Mutex<Vec<Option<KernelArg>>>>,
}

impl Kernel {
    pub(crate) fn adopt(program: &Program, raw: RawKernel) -> Result<Self> {
        let handle = Handle::adopt(program.context().backend().clone(), raw);
        let info = |param| {
            fetch_bytes("Kernel::info", |out| {
                program.context().backend().kernel_info(raw, param, out)
            })
        };
        let name = String::decode("Kernel::info", &info(KernelParam::FunctionName)?)?;
        let num_args = u32::decode("Kernel::info", &info(KernelParam::NumArgs)?)?;
        Ok(Self {
            handle,
            program: program.clone(),
            name: name.into(),
            args: Arc::new(Mutex::new(vec![None; num_args as usize])),
        })
    }

    pub fn raw(&self) -> RawKernel {
        self.handle.raw()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn num_args(&self) -> u32 {
        self.lock_args().len() as u32
    }

    pub fn reference_count(&self) -> Result<u32> {
        self.handle.reference_count()
    }

    /// Records argument `index`, replacing any earlier value.
    pub fn set_arg(&self, index: u32, arg: impl Into<KernelArg>) -> Result<()> {
        const OP: &str = "Kernel::set_arg";
        let arg = arg.into();
        if let Some(memory) = arg.memory() {
            if !memory.context().same(self.program.context()) {
                return Err(Error::Argument {
                    op: OP,
                    status: Status::INVALID_ARG_VALUE,
                    kernel: self.name.to_string(),
                    index: Some(index),
                    detail: "memory object belongs to another context".to_owned(),
                });
            }
        }
        let mut args = self.lock_args();
        let count = args.len();
        let Some(slot) = args.get_mut(index as usize) else {
            return Err(Error::Argument {
                op: OP,
                status: Status::INVALID_ARG_INDEX,
                kernel: self.name.to_string(),
                index: Some(index),
                detail: format!("kernel takes {count} arguments"),
            });
        };
        *slot = Some(arg);
        Ok(())
    }

    pub fn set_arg_scalar<T: Pod>(&self, index: u32, value: T) -> Result<()> {
        self.set_arg(index, KernelArg::scalar(value))
    }

    /// Hands every recorded argument to the backend and runs `enqueue`, all while holding the
    /// argument set so concurrent launches of clones cannot interleave.
    pub(crate) fn launch<F>(&self, op: &'static str, enqueue: F) -> Result<RawEvent>
    where
        F: FnOnce(&[Option<KernelArg>]) -> Result<RawEvent>,
    {
        let context = self.program.context();
        let args = self.lock_args();
        for (index, arg) in args.iter().enumerate() {
            let index = index as u32;
            let Some(arg) = arg else {
                return Err(Error::Argument {
                    op,
                    status: Status::INVALID_KERNEL_ARGS,
                    kernel: self.name.to_string(),
                    index: Some(index),
                    detail: "argument not set".to_owned(),
                });
            };
            let value = match arg {
                KernelArg::Scalar(bytes) => KernelArgValue::Bytes(bytes.as_slice()),
                KernelArg::Buffer(buffer) => KernelArgValue::Mem(buffer.raw()),
                KernelArg::Image(image) => KernelArgValue::Mem(image.raw()),
                KernelArg::Local(len) => KernelArgValue::Local(*len),
            };
            let result = context.backend().set_kernel_arg(self.raw(), index, value);
            context
                .check(op, result)
                .map_err(|e| e.with_argument(&self.name, Some(index)))?;
        }
        enqueue(&args)
    }

    fn work_group_info(&self, device: &Device, param: KernelWorkGroupParam) -> Result<Vec<u8>> {
        fetch_bytes("Kernel::work_group_info", |out| {
            self.program
                .context()
                .backend()
                .kernel_work_group_info(self.raw(), device.raw(), param, out)
        })
    }

    /// Largest work-group this kernel can run with on `device`.
    pub fn work_group_size(&self, device: &Device) -> Result<usize> {
        let bytes = self.work_group_info(device, KernelWorkGroupParam::WorkGroupSize)?;
        usize::decode("Kernel::work_group_size", &bytes)
    }

    /// The size the source requires, or `None` if it leaves the choice to the launch.
    pub fn compile_work_group_size(&self, device: &Device) -> Result<Option<[usize; 3]>> {
        let bytes = self.work_group_info(device, KernelWorkGroupParam::CompileWorkGroupSize)?;
        let sizes = Vec::<usize>::decode("Kernel::compile_work_group_size", &bytes)?;
        let sizes: [usize; 3] = sizes.try_into().map_err(|sizes: Vec<usize>| {
            Error::structural(
                "Kernel::compile_work_group_size",
                Status::SUCCESS,
                format!("expected 3 dimensions, got {}", sizes.len()),
            )
        })?;
        Ok((sizes != [0; 3]).then_some(sizes))
    }

    pub fn local_mem_size(&self, device: &Device) -> Result<u64> {
        let bytes = self.work_group_info(device, KernelWorkGroupParam::LocalMemSize)?;
        u64::decode("Kernel::local_mem_size", &bytes)
    }

    pub fn preferred_work_group_size_multiple(&self, device: &Device) -> Result<usize> {
        let bytes =
            self.work_group_info(device, KernelWorkGroupParam::PreferredWorkGroupSizeMultiple)?;
        usize::decode("Kernel::preferred_work_group_size_multiple", &bytes)
    }

    fn lock_args(&self) -> std::sync::MutexGuard<'_, Vec<Option<KernelArg>>> {
        self.args.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("raw", &self.raw())
            .field("name", &self.name)
            .finish()
    }
}

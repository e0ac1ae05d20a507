use std::sync::Arc;

use bytemuck::Pod;

use accel_sys::{ImageFormat, NdRangeDesc, Status};

/// Host implementation of a device entry point.
///
/// The body runs once per launch and iterates the NDRange itself. Returning an error (or
/// panicking) fails the launch event with that status (`OUT_OF_RESOURCES` for panics).
pub type KernelFn = Arc<dyn Fn(&mut SoftLaunch<'_>) -> Result<(), Status> + Send + Sync>;

/// One argument as seen by a running kernel body.
#[derive(Debug)]
pub(crate) enum LaunchArg {
    Scalar(Vec<u8>),
    /// Memory object contents, moved out of the object for the duration of the launch.
    Mem {
        data: Vec<u8>,
        image: Option<(ImageFormat, usize, usize)>,
    },
    /// Same memory object as an earlier argument.
    Alias(usize),
    Local(usize),
}

/// Launch context handed to a [`KernelFn`].
#[derive(Debug)]
pub struct SoftLaunch<'a> {
    name: &'a str,
    range: NdRangeDesc,
    local: [usize; 3],
    args: &'a mut [LaunchArg],
}

impl<'a> SoftLaunch<'a> {
    pub(crate) fn new(
        name: &'a str,
        range: NdRangeDesc,
        local: [usize; 3],
        args: &'a mut [LaunchArg],
    ) -> Self {
        Self {
            name,
            range,
            local,
            args,
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn work_dim(&self) -> u32 {
        self.range.work_dim
    }

    /// Global size in dimension `dim`; 1 for dimensions past `work_dim`.
    pub fn global_size(&self, dim: usize) -> usize {
        if dim < self.range.work_dim as usize {
            self.range.global[dim]
        } else {
            1
        }
    }

    pub fn global_offset(&self, dim: usize) -> usize {
        if dim < self.range.work_dim as usize {
            self.range.global_offset[dim]
        } else {
            0
        }
    }

    pub fn local_size(&self, dim: usize) -> usize {
        if dim < self.range.work_dim as usize {
            self.local[dim]
        } else {
            1
        }
    }

    pub fn num_groups(&self, dim: usize) -> usize {
        self.global_size(dim) / self.local_size(dim)
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// Reads a by-value argument. Its size must match `T` exactly.
    pub fn scalar<T: Pod>(&self, index: usize) -> Result<T, Status> {
        match self.args.get(index) {
            Some(LaunchArg::Scalar(bytes)) if bytes.len() == std::mem::size_of::<T>() => {
                Ok(bytemuck::pod_read_unaligned(bytes))
            }
            Some(LaunchArg::Scalar(_)) => Err(Status::INVALID_ARG_SIZE),
            Some(_) => Err(Status::INVALID_ARG_VALUE),
            None => Err(Status::INVALID_ARG_INDEX),
        }
    }

    pub fn mem(&self, index: usize) -> Result<&[u8], Status> {
        let index = self.resolve(index)?;
        match &self.args[index] {
            LaunchArg::Mem { data, .. } => Ok(data),
            _ => Err(Status::INVALID_ARG_VALUE),
        }
    }

    pub fn mem_mut(&mut self, index: usize) -> Result<&mut [u8], Status> {
        let index = self.resolve(index)?;
        match &mut self.args[index] {
            LaunchArg::Mem { data, .. } => Ok(data),
            _ => Err(Status::INVALID_ARG_VALUE),
        }
    }

    /// Borrows two distinct memory arguments, one for reading and one for writing. Fails with
    /// `INVALID_ARG_VALUE` if both refer to the same object.
    pub fn mem_pair(&mut self, src: usize, dst: usize) -> Result<(&[u8], &mut [u8]), Status> {
        let (src, dst) = (self.resolve(src)?, self.resolve(dst)?);
        if src == dst {
            return Err(Status::INVALID_ARG_VALUE);
        }
        let (low, high) = self.args.split_at_mut(src.max(dst));
        let (src_arg, dst_arg) = if src < dst {
            (&low[src], &mut high[0])
        } else {
            (&high[0], &mut low[dst])
        };
        match (src_arg, dst_arg) {
            (LaunchArg::Mem { data: s, .. }, LaunchArg::Mem { data: d, .. }) => Ok((s, d)),
            _ => Err(Status::INVALID_ARG_VALUE),
        }
    }

    /// Reads element `element` of a memory argument viewed as an array of `T`.
    pub fn load<T: Pod>(&self, index: usize, element: usize) -> Result<T, Status> {
        let bytes = self.mem(index)?;
        let size = std::mem::size_of::<T>();
        let start = element.checked_mul(size).ok_or(Status::INVALID_VALUE)?;
        bytes
            .get(start..start + size)
            .map(bytemuck::pod_read_unaligned)
            .ok_or(Status::INVALID_VALUE)
    }

    /// Writes element `element` of a memory argument viewed as an array of `T`.
    pub fn store<T: Pod>(&mut self, index: usize, element: usize, value: T) -> Result<(), Status> {
        let bytes = self.mem_mut(index)?;
        let size = std::mem::size_of::<T>();
        let start = element.checked_mul(size).ok_or(Status::INVALID_VALUE)?;
        let dst = bytes
            .get_mut(start..start + size)
            .ok_or(Status::INVALID_VALUE)?;
        dst.copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }

    /// Size of a `__local` argument in bytes.
    pub fn local_len(&self, index: usize) -> Result<usize, Status> {
        match self.args.get(index) {
            Some(LaunchArg::Local(len)) => Ok(*len),
            Some(_) => Err(Status::INVALID_ARG_VALUE),
            None => Err(Status::INVALID_ARG_INDEX),
        }
    }

    /// Format, width and height of an image argument.
    pub fn image_dims(&self, index: usize) -> Result<(ImageFormat, usize, usize), Status> {
        let index = self.resolve(index)?;
        match &self.args[index] {
            LaunchArg::Mem {
                image: Some(dims), ..
            } => Ok(*dims),
            _ => Err(Status::INVALID_ARG_VALUE),
        }
    }

    fn resolve(&self, index: usize) -> Result<usize, Status> {
        match self.args.get(index) {
            Some(LaunchArg::Alias(first)) => Ok(*first),
            Some(_) => Ok(index),
            None => Err(Status::INVALID_ARG_INDEX),
        }
    }
}

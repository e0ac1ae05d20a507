//! Encoding of info query replies.

use accel_sys::Status;

pub(crate) trait ReplyValue {
    fn encode(&self) -> Vec<u8>;
}

impl ReplyValue for str {
    fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len() + 1);
        bytes.extend_from_slice(self.as_bytes());
        bytes.push(0);
        bytes
    }
}

impl ReplyValue for String {
    fn encode(&self) -> Vec<u8> {
        self.as_str().encode()
    }
}

impl ReplyValue for bool {
    fn encode(&self) -> Vec<u8> {
        u32::from(*self).to_ne_bytes().to_vec()
    }
}

macro_rules! reply_int {
    ($($ty:ty),*) => {
        $(
            impl ReplyValue for $ty {
                fn encode(&self) -> Vec<u8> {
                    self.to_ne_bytes().to_vec()
                }
            }
        )*
    };
}

reply_int!(i32, u32, u64, usize);

impl<const N: usize> ReplyValue for [usize; N] {
    fn encode(&self) -> Vec<u8> {
        self.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }
}

/// Answers one half of a two-call query: the size when `out` is `None`, otherwise the value,
/// provided `out` can hold it.
pub(crate) fn reply<V: ReplyValue + ?Sized>(
    value: &V,
    out: Option<&mut [u8]>,
) -> Result<usize, Status> {
    let bytes = value.encode();
    if let Some(out) = out {
        let dst = out.get_mut(..bytes.len()).ok_or(Status::INVALID_VALUE)?;
        dst.copy_from_slice(&bytes);
    }
    Ok(bytes.len())
}

/// Same as [`reply`] for id lists, counted in elements.
pub(crate) fn reply_ids<T: Copy>(ids: &[T], out: Option<&mut [T]>) -> Result<usize, Status> {
    if let Some(out) = out {
        let dst = out.get_mut(..ids.len()).ok_or(Status::INVALID_VALUE)?;
        dst.copy_from_slice(ids);
    }
    Ok(ids.len())
}

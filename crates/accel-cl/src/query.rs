//! The two-call info query idiom and typed decoding of its replies.

use accel_sys::{DeviceType, Status};
use tracing::warn;

use crate::error::{Error, Result, StatusExt};

/// Attempts before a reply whose size keeps changing is reported as malformed.
const ATTEMPTS: usize = 2;

/// Runs a two-call query: `query(None)` reports the size, `query(Some(buf))` fills `buf`.
///
/// A fetch that fails with `INVALID_VALUE` right after a successful size query means the
/// answer grew in between; the query is retried once before giving up.
pub(crate) fn fetch_list<T, F>(op: &'static str, mut query: F) -> Result<Vec<T>>
where
    T: Copy + Default,
    F: FnMut(Option<&mut [T]>) -> std::result::Result<usize, Status>,
{
    for attempt in 1..=ATTEMPTS {
        let len = query(None).check(op)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![T::default(); len];
        match query(Some(&mut buf)) {
            Ok(written) if written <= len => {
                buf.truncate(written);
                return Ok(buf);
            }
            Ok(_) | Err(Status::INVALID_VALUE) => {
                warn!(op, attempt, "reply size changed between size and fetch");
            }
            Err(status) => return Err(Error::from_status(op, status)),
        }
    }
    Err(Error::structural(
        op,
        Status::INVALID_VALUE,
        "reply size changed between size and fetch calls",
    ))
}

pub(crate) fn fetch_bytes<F>(op: &'static str, query: F) -> Result<Vec<u8>>
where
    F: FnMut(Option<&mut [u8]>) -> std::result::Result<usize, Status>,
{
    fetch_list(op, query)
}

/// A value an info query can return.
pub trait InfoValue: Sized {
    fn decode(op: &'static str, bytes: &[u8]) -> Result<Self>;

    /// Human-readable rendering, used by capability listings.
    fn render(&self) -> String;
}

fn fixed<const N: usize>(op: &'static str, bytes: &[u8]) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| {
        Error::structural(
            op,
            Status::SUCCESS,
            format!("expected {N} bytes, got {}", bytes.len()),
        )
    })
}

impl InfoValue for String {
    fn decode(op: &'static str, bytes: &[u8]) -> Result<Self> {
        let Some((0, text)) = bytes.split_last() else {
            return Err(Error::structural(
                op,
                Status::SUCCESS,
                "string reply is not NUL-terminated",
            ));
        };
        String::from_utf8(text.to_vec())
            .map_err(|e| Error::structural(op, Status::SUCCESS, e.to_string()))
    }

    fn render(&self) -> String {
        self.clone()
    }
}

macro_rules! info_int {
    ($($ty:ty),*) => {
        $(
            impl InfoValue for $ty {
                fn decode(op: &'static str, bytes: &[u8]) -> Result<Self> {
                    Ok(<$ty>::from_ne_bytes(fixed(op, bytes)?))
                }

                fn render(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

info_int!(i32, u32, u64, usize);

impl InfoValue for bool {
    fn decode(op: &'static str, bytes: &[u8]) -> Result<Self> {
        Ok(u32::decode(op, bytes)? != 0)
    }

    fn render(&self) -> String {
        if *self { "yes" } else { "no" }.to_owned()
    }
}

impl InfoValue for Vec<usize> {
    fn decode(op: &'static str, bytes: &[u8]) -> Result<Self> {
        let width = std::mem::size_of::<usize>();
        if bytes.len() % width != 0 {
            return Err(Error::structural(
                op,
                Status::SUCCESS,
                format!("{} bytes is not a whole number of size_t values", bytes.len()),
            ));
        }
        bytes
            .chunks_exact(width)
            .map(|chunk| usize::decode(op, chunk))
            .collect()
    }

    fn render(&self) -> String {
        let parts: Vec<String> = self.iter().map(usize::to_string).collect();
        parts.join(" x ")
    }
}

/// Space separated lists such as extension strings.
impl InfoValue for Vec<String> {
    fn decode(op: &'static str, bytes: &[u8]) -> Result<Self> {
        Ok(String::decode(op, bytes)?
            .split_whitespace()
            .map(str::to_owned)
            .collect())
    }

    fn render(&self) -> String {
        self.join(" ")
    }
}

impl InfoValue for DeviceType {
    fn decode(op: &'static str, bytes: &[u8]) -> Result<Self> {
        Ok(DeviceType::from_bits_retain(u64::decode(op, bytes)?))
    }

    fn render(&self) -> String {
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        if names.is_empty() {
            "none".to_owned()
        } else {
            names.join(" | ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn retries_once_when_the_reply_grows() {
        let mut sizes = vec![4usize, 5, 5].into_iter();
        let mut actual = 0;
        let bytes = fetch_bytes("test", |out| match out {
            None => {
                actual = sizes.next().unwrap_or(5);
                Ok(actual)
            }
            Some(buf) if buf.len() < 5 => Err(Status::INVALID_VALUE),
            Some(buf) => {
                buf.copy_from_slice(b"abcd\0");
                Ok(5)
            }
        })
        .unwrap();
        assert_eq!(bytes, b"abcd\0");
        assert_eq!(actual, 5);
    }

    #[test]
    fn persistent_size_races_are_structural() {
        let err = fetch_bytes("test", |out| match out {
            None => Ok(1),
            Some(_) => Err(Status::INVALID_VALUE),
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Structural);
    }

    #[test]
    fn decodes_typed_values() {
        assert_eq!(String::decode("t", b"gpu\0").unwrap(), "gpu");
        assert_eq!(
            String::decode("t", b"gpu").unwrap_err().kind(),
            ErrorKind::Structural
        );
        assert!(bool::decode("t", &1u32.to_ne_bytes()).unwrap());
        assert_eq!(
            u64::decode("t", &[0u8; 3]).unwrap_err().kind(),
            ErrorKind::Structural
        );
        assert_eq!(
            Vec::<String>::decode("t", b"cl_a  cl_b\0").unwrap(),
            vec!["cl_a".to_owned(), "cl_b".to_owned()]
        );
        let sizes: Vec<u8> = [4usize, 2].iter().flat_map(|v| v.to_ne_bytes()).collect();
        assert_eq!(Vec::<usize>::decode("t", &sizes).unwrap(), vec![4, 2]);
        assert_eq!(DeviceType::GPU.render(), "GPU");
    }
}

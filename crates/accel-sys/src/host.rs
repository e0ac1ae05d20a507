use std::sync::{Arc, Mutex, PoisonError};

/// Host bytes handed to the device. The backend may read them at any point until the command
/// that received them completes; sharing the allocation keeps it alive for that long.
pub type HostBytes = Arc<[u8]>;

/// Host-side destination the device writes into.
///
/// The backend keeps a clone until the command completes; the host side copies the bytes out
/// once it has observed completion.
#[derive(Debug, Clone, Default)]
pub struct HostSink {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl HostSink {
    pub fn with_len(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0; len])),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes `src` at `offset`. Returns `false` if it would not fit.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> bool {
        let mut bytes = self.lock();
        let Some(end) = offset.checked_add(src.len()) else {
            return false;
        };
        match bytes.get_mut(offset..end) {
            Some(dst) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    /// Copies the sink contents into `dst`, which must have the sink's length.
    pub fn copy_to(&self, dst: &mut [u8]) -> bool {
        let bytes = self.lock();
        if bytes.len() != dst.len() {
            return false;
        }
        dst.copy_from_slice(&bytes);
        true
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_at_rejects_out_of_range() {
        let sink = HostSink::with_len(4);
        assert!(sink.write_at(1, &[1, 2, 3]));
        assert!(!sink.write_at(2, &[1, 2, 3]));
        assert!(!sink.write_at(usize::MAX, &[1]));
        assert_eq!(sink.to_vec(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn clones_share_storage() {
        let sink = HostSink::with_len(2);
        let device_side = sink.clone();
        assert!(device_side.write_at(0, &[7, 9]));

        let mut out = [0u8; 2];
        assert!(sink.copy_to(&mut out));
        assert_eq!(out, [7, 9]);
        assert!(!sink.copy_to(&mut [0u8; 3]));
    }
}

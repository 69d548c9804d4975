use std::fmt::{Display, Formatter};
use std::ptr::NonNull;

/// Where a buffer's storage lives.
///
/// A buffer with elements always owns at least one allocation; the only
/// allocation-free state is `Empty`.
#[derive(Debug)]
pub(crate) enum Residency<T> {
    Empty,
    /// Synchronous mode: a pinned host allocation.
    HostOnly { host: NonNull<T> },
    /// Asynchronous mode, uninitialized: filled by device work.
    DeviceOnly { device: NonNull<T> },
    /// Asynchronous mode, seeded from host data through a pinned staging copy
    /// that must outlive the pending host-to-device transfer.
    DeviceWithHostStaging { device: NonNull<T>, host: NonNull<T> },
}

impl<T> Residency<T> {
    pub(crate) fn kind(&self) -> ResidencyKind {
        match self {
            Residency::Empty => ResidencyKind::Empty,
            Residency::HostOnly { .. } => ResidencyKind::HostOnly,
            Residency::DeviceOnly { .. } => ResidencyKind::DeviceOnly,
            Residency::DeviceWithHostStaging { .. } => ResidencyKind::DeviceWithHostStaging,
        }
    }

    pub(crate) fn device(&self) -> Option<NonNull<T>> {
        match *self {
            Residency::DeviceOnly { device } | Residency::DeviceWithHostStaging { device, .. } => {
                Some(device)
            }
            _ => None,
        }
    }

    pub(crate) fn host(&self) -> Option<NonNull<T>> {
        match *self {
            Residency::HostOnly { host } | Residency::DeviceWithHostStaging { host, .. } => {
                Some(host)
            }
            _ => None,
        }
    }

    /// The pointer kernels and accessors should use: device first.
    pub(crate) fn authoritative(&self) -> Option<NonNull<T>> {
        self.device().or_else(|| self.host())
    }

    pub(crate) fn take(&mut self) -> Residency<T> {
        std::mem::replace(self, Residency::Empty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResidencyKind {
    Empty,
    HostOnly,
    DeviceOnly,
    DeviceWithHostStaging,
}

impl ResidencyKind {
    pub fn is_on_device(self) -> bool {
        matches!(
            self,
            ResidencyKind::DeviceOnly | ResidencyKind::DeviceWithHostStaging
        )
    }
}

impl Display for ResidencyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ResidencyKind::Empty => write!(f, "empty"),
            ResidencyKind::HostOnly => write!(f, "host"),
            ResidencyKind::DeviceOnly => write!(f, "device"),
            ResidencyKind::DeviceWithHostStaging => write!(f, "device+staging"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_preference() {
        let mut device_word = 1u32;
        let mut host_word = 2u32;
        let device = NonNull::from(&mut device_word);
        let host = NonNull::from(&mut host_word);

        let staged = Residency::DeviceWithHostStaging { device, host };
        assert_eq!(staged.authoritative(), Some(device));
        assert_eq!(staged.host(), Some(host));
        assert!(staged.kind().is_on_device());

        let host_only = Residency::HostOnly { host };
        assert_eq!(host_only.authoritative(), Some(host));
        assert_eq!(host_only.device(), None);
        assert!(!host_only.kind().is_on_device());

        let mut device_only = Residency::DeviceOnly { device };
        assert_eq!(device_only.host(), None);
        let taken = device_only.take();
        assert_eq!(taken.kind(), ResidencyKind::DeviceOnly);
        assert_eq!(device_only.kind(), ResidencyKind::Empty);
        assert_eq!(device_only.authoritative(), None);
    }
}

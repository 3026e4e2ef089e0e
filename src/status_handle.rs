/// Registration token returned by the service manager when the control handler is registered.
///
/// Every status report is addressed through it. A null raw handle never makes it into a
/// `StatusHandle`, so holding one means the registration succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusHandle(isize);

impl StatusHandle {
    /// Wraps a raw registration handle, returning `None` for the null handle.
    pub fn from_raw(handle: isize) -> Option<Self> {
        if handle == 0 {
            None
        } else {
            Some(StatusHandle(handle))
        }
    }

    /// Returns the underlying raw handle.
    pub fn raw_handle(&self) -> isize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_is_rejected() {
        assert_eq!(StatusHandle::from_raw(0), None);
        assert_eq!(StatusHandle::from_raw(7).map(|h| h.raw_handle()), Some(7));
    }
}

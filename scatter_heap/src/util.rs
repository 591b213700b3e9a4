use std::fmt::{self, Debug};

/// Divide, rounding up
pub const fn divroundup(num: usize, divisor: usize) -> usize {
    (num + divisor - 1) / divisor
}

/// Round `num` up to a multiple of `multiple` (which must be a power of two)
pub const fn roundto(num: usize, multiple: usize) -> usize {
    (num + multiple - 1) & !(multiple - 1)
}

/// Wrapper that prints a pointer as a plain hex address in tracing output
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UsizePtr(pub usize);

impl Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl<T: ?Sized> From<*const T> for UsizePtr {
    fn from(value: *const T) -> Self {
        Self(value as *const () as usize)
    }
}

impl<T: ?Sized> From<*mut T> for UsizePtr {
    fn from(value: *mut T) -> Self {
        Self(value as *const () as usize)
    }
}

impl<T: ?Sized> From<&T> for UsizePtr {
    fn from(value: &T) -> Self {
        Self(value as *const T as *const () as usize)
    }
}

impl<T> From<Option<std::ptr::NonNull<T>>> for UsizePtr {
    fn from(value: Option<std::ptr::NonNull<T>>) -> Self {
        Self(value.map_or(0, |x| x.as_ptr() as usize))
    }
}

use std::num::Wrapping;

/// Element types that may be moved between host and device memory with a raw
/// byte copy.
///
/// # Safety
/// Implementors must be plain data: no pointers into host memory, no drop
/// glue, and every byte pattern produced by a device kernel writing a value of
/// the type must be a valid value.
///
/// Over-aligned types are allowed, but a buffer of them can only be created
/// on pools whose [`alignment`](crate::backend::MemoryPool::alignment) is at
/// least `align_of::<Self>()`; the default host pools guarantee 64 bytes.
pub unsafe trait DeviceCopy: Copy + 'static {}

macro_rules! impl_device_copy {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl DeviceCopy for $t {})*
    };
}

impl_device_copy!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char, (),
);

unsafe impl<T: DeviceCopy> DeviceCopy for Wrapping<T> {}
unsafe impl<T: DeviceCopy, const N: usize> DeviceCopy for [T; N] {}
unsafe impl<A: DeviceCopy, B: DeviceCopy> DeviceCopy for (A, B) {}
unsafe impl<A: DeviceCopy, B: DeviceCopy, C: DeviceCopy> DeviceCopy for (A, B, C) {}
unsafe impl<A: DeviceCopy, B: DeviceCopy, C: DeviceCopy, D: DeviceCopy> DeviceCopy
    for (A, B, C, D)
{
}

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

/// `GlobalAlloc` front for the heap of the context published by
/// [`init`](crate::init). Returns null until then.
///
/// ```rust,ignore
/// #[global_allocator]
/// static ALLOCATOR: kernel_alloc::KernelHeapAllocator = kernel_alloc::KernelHeapAllocator;
/// ```
#[derive(Debug, Default, Copy, Clone)]
pub struct KernelHeapAllocator;

unsafe impl GlobalAlloc for KernelHeapAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        crate::memory()
            .and_then(|memory| memory.alloc_aligned(layout.size(), layout.align()))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() {
            unsafe { ptr.write_bytes(0, layout.size()) };
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let (Some(memory), Some(ptr)) = (crate::memory(), NonNull::new(ptr)) {
            unsafe { memory.free(ptr) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_before_init() {
        let layout = Layout::from_size_align(64, 16).unwrap();
        let ptr = unsafe { KernelHeapAllocator.alloc(layout) };
        assert!(ptr.is_null());
        unsafe { KernelHeapAllocator.dealloc(ptr, layout) };
    }
}

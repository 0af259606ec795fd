//! Fixed-size page allocation.
//!
//! Every node occupies exactly one [`Page`]. Pages are allocated zeroed and
//! handed around as raw pointers; ownership rules are documented at each
//! transfer point. Allocation failure is fatal.

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};

/// Size of a node page in bytes.
pub const PAGE_SIZE: usize = 1024;

/// A fixed-size page backing one tree node.
///
/// The concrete node layout is imposed by casting the page pointer to a
/// node type of identical size and alignment (checked at compile time in
/// the node modules).
#[repr(C, align(8))]
pub struct Page {
    bytes: [u8; PAGE_SIZE],
}

const _: () = {
    assert!(std::mem::size_of::<Page>() == PAGE_SIZE);
    assert!(std::mem::align_of::<Page>() == 8);
};

/// Allocate a zeroed page.
///
/// Aborts via [`handle_alloc_error`] if the allocator fails; the tree has
/// no meaningful degraded mode without memory.
#[must_use]
pub fn alloc_page() -> *mut Page {
    let layout = Layout::new::<Page>();
    // SAFETY: Page has non-zero size.
    let raw = unsafe { alloc_zeroed(layout) };
    if raw.is_null() {
        handle_alloc_error(layout);
    }
    raw.cast()
}

/// Release a page previously returned by [`alloc_page`].
///
/// # Safety
///
/// - `page` must have been returned by [`alloc_page`] and not yet released.
/// - No live reference or in-flight reader may target the page; the epoch
///   reclaimer is responsible for establishing that.
pub unsafe fn release_page(page: *mut Page) {
    debug_assert!(!page.is_null());
    // SAFETY: allocated by alloc_page with the same layout (caller contract).
    unsafe { dealloc(page.cast(), Layout::new::<Page>()) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_returns_zeroed_page() {
        let page = alloc_page();
        assert!(!page.is_null());
        // SAFETY: freshly allocated above.
        let bytes = unsafe { &(*page).bytes };
        assert!(bytes.iter().all(|&b| b == 0));
        // SAFETY: allocated above, released once.
        unsafe { release_page(page) };
    }

    #[test]
    fn test_distinct_allocations() {
        let a = alloc_page();
        let b = alloc_page();
        assert_ne!(a, b);
        // SAFETY: allocated above, released once each.
        unsafe {
            release_page(a);
            release_page(b);
        }
    }
}

//! Process-wide allocation accounting.
//!
//! [`CountingAllocator`] wraps the system allocator and maintains a
//! used-memory counter that background workers update concurrently
//! with the request thread, so the counter is atomic. Sizes are
//! rounded up to word alignment before accounting, matching what the
//! allocator actually hands out for small requests.
//!
//! The library only defines the allocator; the embedding binary opts
//! in with `#[global_allocator]`. Installing one from a library would
//! force it on every dependent.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static USED_MEMORY: AtomicUsize = AtomicUsize::new(0);

/// Out-of-memory handler, stored as a raw fn pointer so the allocation
/// path never takes a lock. 0 means "use the default".
static OOM_HANDLER: AtomicU64 = AtomicU64::new(0);

/// Bytes currently accounted as live by [`CountingAllocator`].
#[must_use]
pub fn used_memory() -> usize {
    USED_MEMORY.load(Ordering::Relaxed)
}

/// Replace the process-wide out-of-memory handler.
///
/// The default logs the failed size to stderr and aborts; a host can
/// install a handler that sheds caches instead, but if the handler
/// returns, the failed allocation is still reported as null to the
/// caller.
pub fn set_oom_handler(handler: fn(usize)) {
    OOM_HANDLER.store(handler as usize as u64, Ordering::SeqCst);
}

fn default_oom_handler(size: usize) {
    eprintln!("fredis: out of memory allocating {size} bytes");
    std::process::abort();
}

fn run_oom_handler(size: usize) {
    let raw = OOM_HANDLER.load(Ordering::SeqCst);
    if raw == 0 {
        default_oom_handler(size);
    } else {
        // Stored from a valid `fn(usize)` in set_oom_handler.
        let handler: fn(usize) = unsafe { std::mem::transmute(raw as usize) };
        handler(size);
    }
}

const fn round_to_word(size: usize) -> usize {
    let word = std::mem::size_of::<usize>();
    (size + word - 1) & !(word - 1)
}

/// A [`GlobalAlloc`] that forwards to the system allocator and keeps
/// the used-memory counter.
pub struct CountingAllocator;

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if ptr.is_null() {
            run_oom_handler(layout.size());
        } else {
            USED_MEMORY.fetch_add(round_to_word(layout.size()), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        USED_MEMORY.fetch_sub(round_to_word(layout.size()), Ordering::Relaxed);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if new_ptr.is_null() {
            run_oom_handler(new_size);
        } else {
            let old = round_to_word(layout.size());
            let new = round_to_word(new_size);
            if new >= old {
                USED_MEMORY.fetch_add(new - old, Ordering::Relaxed);
            } else {
                USED_MEMORY.fetch_sub(old - new, Ordering::Relaxed);
            }
        }
        new_ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding_is_word_aligned() {
        let word = std::mem::size_of::<usize>();
        assert_eq!(round_to_word(1), word);
        assert_eq!(round_to_word(word), word);
        assert_eq!(round_to_word(word + 1), 2 * word);
        assert_eq!(round_to_word(0), 0);
    }

    #[test]
    fn test_alloc_and_dealloc_balance_the_counter() {
        // Drive the allocator directly; it is not installed globally in
        // tests, so the counter only sees what we do here.
        let alloc = CountingAllocator;
        let layout = Layout::from_size_align(100, 8).expect("layout should be valid");
        let before = used_memory();
        let ptr = unsafe { alloc.alloc(layout) };
        assert!(!ptr.is_null());
        assert_eq!(used_memory() - before, round_to_word(100));
        unsafe { alloc.dealloc(ptr, layout) };
        assert_eq!(used_memory(), before);
    }
}

// Physical page allocator.
//
// Hands out and reclaims whole 4 KiB physical pages. The free list
// costs no memory of its own: each free page's first machine word is
// reused as the "next" link, so `Run` only ever exists transiently as
// a view onto a page that is, at that moment, not holding anything
// else.

use core::ptr;

use crate::memlayout::PHYSTOP;
use crate::riscv::PGSIZE;
use crate::spinlock::Spinlock;
use crate::string::memset;
use crate::PGROUNDUP;

extern "C" {
    // first address after the kernel image, set by the linker script.
    static mut end: u8;
}

struct Run {
    next: *mut Run,
}

/// Byte pattern stamped into a page when it is freed, to catch
/// use-after-free reads. Callers must not depend on freed-then-reused
/// pages being zero.
const FREE_JUNK: u8 = 0x01;
/// Byte pattern stamped into a page when it is handed out, to catch
/// reads of uninitialized memory.
const ALLOC_JUNK: u8 = 0x05;

pub struct KMem {
    lock: Spinlock,
    freelist: *mut Run,
}

pub static mut KMEM: KMem = KMem::create();

// The free list is a raw pointer chain guarded by `lock`; every access
// happens with the lock held, so the pointer itself is safe to share.
unsafe impl Sync for KMem {}

impl KMem {
    const fn create() -> Self {
        Self {
            lock: Spinlock::init_lock("kmem"),
            freelist: ptr::null_mut(),
        }
    }

    /// Free every page from the end of the kernel image through
    /// PHYSTOP into the allocator.
    pub fn kinit() {
        unsafe {
            KMEM.freerange((&raw mut end) as *mut u8, PHYSTOP as *mut u8);
        }
    }

    fn freerange(&mut self, pa_start: *mut u8, pa_end: *mut u8) {
        let mut p = PGROUNDUP!(pa_start as usize);
        while p + PGSIZE <= pa_end as usize {
            self.kfree(p as *mut u8);
            p += PGSIZE;
        }
    }

    /// Free the page of physical memory pointed at by `pa`, which
    /// normally was handed out by a prior `kalloc()` (the exception is
    /// `kinit`'s initial sweep).
    pub fn kfree<T>(&mut self, pa: *mut T) {
        let addr = pa as usize;
        unsafe {
            if addr % PGSIZE != 0 || addr < ((&raw const end) as usize) || addr >= PHYSTOP {
                panic!("kfree: not a managed page");
            }
        }

        memset(pa as *mut u8, FREE_JUNK, PGSIZE);

        let r = pa as *mut Run;
        self.lock.acquire();
        unsafe {
            (*r).next = self.freelist;
        }
        self.freelist = r;
        self.lock.release();
    }

    /// Allocate one 4096-byte page of physical memory, or return a
    /// null pointer if the free list is empty. Callers must treat a
    /// null result as a recoverable resource-exhaustion error, not a
    /// fatal one.
    pub fn kalloc<T>(&mut self) -> *mut T {
        self.lock.acquire();
        let r = self.freelist;
        if !r.is_null() {
            unsafe {
                self.freelist = (*r).next;
            }
        }
        self.lock.release();

        if !r.is_null() {
            memset(r as *mut u8, ALLOC_JUNK, PGSIZE);
        }
        r as *mut T
    }
}

#[cfg(test)]
mod tests {
    // The real allocator threads its free list through kernel physical
    // memory and can't run off-target; exercise the same free-list
    // discipline (push/pop order, junk-fill sentinel contract) against
    // a small heap-backed arena instead.
    use std::vec::Vec;

    const PAGE: usize = 4096;

    struct TestArena {
        pages: Vec<Box<[u8; PAGE]>>,
        free: Vec<usize>, // indices into `pages` currently free
    }

    impl TestArena {
        fn new(n: usize) -> Self {
            let mut pages = Vec::new();
            for _ in 0..n {
                pages.push(Box::new([0u8; PAGE]));
            }
            let free = (0..n).collect();
            TestArena { pages, free }
        }

        fn alloc(&mut self) -> Option<usize> {
            let idx = self.free.pop()?;
            self.pages[idx].fill(0x05);
            Some(idx)
        }

        fn free(&mut self, idx: usize) {
            self.pages[idx].fill(0x01);
            self.free.push(idx);
        }
    }

    #[test]
    fn alloc_returns_distinct_pages_until_exhausted() {
        let mut arena = TestArena::new(2);
        let a = arena.alloc().unwrap();
        let b = arena.alloc().unwrap();
        assert_ne!(a, b);
        assert!(arena.alloc().is_none());
    }

    #[test]
    fn freed_page_is_junk_filled_and_reusable() {
        let mut arena = TestArena::new(1);
        let a = arena.alloc().unwrap();
        arena.pages[a][0] = 0x42;
        arena.free(a);
        assert!(arena.pages[a].iter().all(|&b| b == 0x01));
        let b = arena.alloc().unwrap();
        assert_eq!(a, b);
        assert!(arena.pages[b].iter().all(|&b| b == 0x05));
    }
}

// Sv39 virtual memory: the kernel's own page table, and the
// operations user page tables are built and torn down with.
//
// A page table is a tree of 512-entry pages, one page per level. A
// PTE is either an interior node (VALID set, R/W/X all clear) that
// points at the next-level table, or a leaf (VALID set, at least one
// of R/W/X set) that maps one 4 KiB page of physical memory.

use core::ptr;

use crate::kalloc::KMEM;
use crate::memlayout::{TRAMPOLINE, TRAPFRAME, UART0, VIRTIO0};
use crate::param::USERSTACK;
use crate::proc::Trapframe;
use crate::riscv::{PageTable, Pte, PteFlags, MAXVA, PGSIZE};
use crate::string::memset;
use crate::{PA2PTE, PGROUNDDOWN, PGROUNDUP, PTE2PA, PX};

extern "C" {
    // boundaries provided by the linker script.
    static etext: u8; // end of kernel code.
    static trampoline: u8; // trampoline.S
}

pub static mut KERNEL_PAGETABLE: *mut PageTable = ptr::null_mut();

/// Return the address of the PTE for virtual address `va` in page
/// table `pt`, allocating any missing interior levels along the way
/// when `alloc` is set. Returns null if a level is missing and
/// `alloc` is false, or if a physical page can't be allocated.
///
/// Mirrors the three 9-bit VPN fields xv6's Sv39 walk uses: level 2 is
/// the root, level 0 the leaf.
pub fn walk(pt: *mut PageTable, va: usize, alloc: bool) -> *mut Pte {
    if va >= MAXVA {
        panic!("walk: out of range virtual address");
    }

    let mut pt = pt;
    for level in (1..=2).rev() {
        let pte = unsafe { &mut (*pt).0[PX!(level, va)] };
        if pte.is_valid() {
            pt = PTE2PA!(pte.0) as *mut PageTable;
        } else {
            if !alloc {
                return ptr::null_mut();
            }
            let new_pt: *mut PageTable = unsafe { KMEM.kalloc() };
            if new_pt.is_null() {
                return ptr::null_mut();
            }
            memset(new_pt as *mut u8, 0, PGSIZE);
            *pte = Pte(PA2PTE!(new_pt) | PteFlags::VALID.bits());
            pt = new_pt;
        }
    }
    unsafe { &mut (*pt).0[PX!(0, va)] as *mut Pte }
}

/// Look up the physical address that user virtual address `va` maps
/// to. `va` must be page-aligned and the mapping must exist, be
/// valid, and be user-accessible; anything else is treated as "no
/// mapping" rather than a fault, since callers use this to validate
/// addresses handed up from user space.
pub fn walkaddr(pt: *mut PageTable, va: usize) -> Option<usize> {
    if va >= MAXVA {
        return None;
    }
    let pte = walk(pt, va, false);
    if pte.is_null() {
        return None;
    }
    let flags = unsafe { (*pte).flags() };
    if !flags.contains(PteFlags::VALID) || !flags.contains(PteFlags::USER) {
        return None;
    }
    Some(PTE2PA!(unsafe { (*pte).0 }))
}

/// Create PTEs mapping the `size` bytes starting at `va` (need not be
/// page-aligned) to the `size` bytes of physical memory starting at
/// `pa`. Panics if a page is already validly mapped: callers are
/// always establishing brand-new mappings, so a collision means a
/// bookkeeping bug, not user error.
pub fn mappages(pt: *mut PageTable, va: usize, size: usize, pa: usize, perm: PteFlags) -> Result<(), ()> {
    if size == 0 {
        panic!("mappages: size == 0");
    }

    let mut a = PGROUNDDOWN!(va);
    let last = PGROUNDDOWN!(va + size - 1);
    let mut pa = pa;
    loop {
        let pte = walk(pt, a, true);
        if pte.is_null() {
            return Err(());
        }
        if unsafe { (*pte).is_valid() } {
            panic!("mappages: remap");
        }
        unsafe {
            *pte = Pte(PA2PTE!(pa) | (perm | PteFlags::VALID).bits());
        }
        if a == last {
            break;
        }
        a += PGSIZE;
        pa += PGSIZE;
    }
    Ok(())
}

/// Remove `npages` of mappings starting at `va`, which must be
/// page-aligned. Frees the underlying physical pages when
/// `do_free` is set. Panics if a page in the range isn't mapped or
/// isn't a leaf: both indicate the caller's own bookkeeping is wrong
/// about what it owns.
pub fn uvmunmap(pt: *mut PageTable, va: usize, npages: usize, do_free: bool) {
    if va % PGSIZE != 0 {
        panic!("uvmunmap: not aligned");
    }

    let mut a = va;
    for _ in 0..npages {
        let pte = walk(pt, a, false);
        if pte.is_null() {
            panic!("uvmunmap: walk");
        }
        let flags = unsafe { (*pte).flags() };
        if !flags.contains(PteFlags::VALID) {
            panic!("uvmunmap: not mapped");
        }
        if !flags.is_leaf() {
            panic!("uvmunmap: not a leaf");
        }
        if do_free {
            let pa = PTE2PA!(unsafe { (*pte).0 });
            unsafe { KMEM.kfree(pa as *mut u8) };
        }
        unsafe {
            *pte = Pte(0);
        }
        a += PGSIZE;
    }
}

/// Allocate an empty user page table page (no mappings at all).
pub fn uvmcreate() -> *mut PageTable {
    let pt: *mut PageTable = unsafe { KMEM.kalloc() };
    if !pt.is_null() {
        memset(pt as *mut u8, 0, PGSIZE);
    }
    pt
}

/// Add a mapping for the kernel's own page table; panics instead of
/// returning Err since every call site here is boot-time setup where
/// failure means the machine can't continue at all.
pub fn kvmmap(pt: *mut PageTable, va: usize, pa: usize, size: usize, perm: PteFlags) {
    if mappages(pt, va, size, pa, perm).is_err() {
        panic!("kvmmap: out of memory");
    }
}

fn kvmmake() -> *mut PageTable {
    let pt = uvmcreate();
    if pt.is_null() {
        panic!("kvmmake: kalloc");
    }

    kvmmap(pt, UART0, UART0, PGSIZE, PteFlags::READ | PteFlags::WRITE);
    kvmmap(pt, VIRTIO0, VIRTIO0, PGSIZE, PteFlags::READ | PteFlags::WRITE);
    kvmmap(
        pt,
        crate::memlayout::PLIC,
        crate::memlayout::PLIC,
        0x400000,
        PteFlags::READ | PteFlags::WRITE,
    );

    let etext_addr = unsafe { (&raw const etext) as usize };
    kvmmap(
        pt,
        crate::memlayout::KERNBASE,
        crate::memlayout::KERNBASE,
        etext_addr - crate::memlayout::KERNBASE,
        PteFlags::READ | PteFlags::EXEC,
    );
    kvmmap(
        pt,
        etext_addr,
        etext_addr,
        crate::memlayout::PHYSTOP - etext_addr,
        PteFlags::READ | PteFlags::WRITE,
    );
    kvmmap(
        pt,
        TRAMPOLINE,
        unsafe { (&raw const trampoline) as usize },
        PGSIZE,
        PteFlags::READ | PteFlags::EXEC,
    );

    crate::proc::proc_mapstacks(pt);

    pt
}

/// Called once, from hart 0: build the kernel's own page table.
pub fn kvminit() {
    unsafe {
        KERNEL_PAGETABLE = kvmmake();
    }
}

/// Called on every hart: install the kernel page table and flush the
/// TLB, so this hart starts translating through it immediately.
pub fn kvminithart() {
    crate::riscv::sfence_vma();
    unsafe {
        crate::riscv::w_satp(crate::MAKE_SATP!(KERNEL_PAGETABLE as usize));
    }
    crate::riscv::sfence_vma();
}

/// Copy `initcode`'s bytes into a brand-new page 0 of a freshly
/// created user page table, with user+RWX permissions. Used exactly
/// once, to start the first process: every later process is created
/// by fork()/exec(), never by directly depositing a byte blob.
pub fn uvmfirst(pt: *mut PageTable, src: &[u8]) {
    if src.len() >= PGSIZE {
        panic!("uvmfirst: more than a page");
    }

    let mem: *mut u8 = unsafe { KMEM.kalloc() };
    if mem.is_null() {
        panic!("uvmfirst: kalloc");
    }
    memset(mem, 0, PGSIZE);
    mappages(
        pt,
        0,
        PGSIZE,
        mem as usize,
        PteFlags::WRITE | PteFlags::READ | PteFlags::EXEC | PteFlags::USER,
    )
    .expect("uvmfirst: mappages");
    unsafe {
        ptr::copy_nonoverlapping(src.as_ptr(), mem, src.len());
    }
}

/// Grow a user process's memory from `oldsz` to `newsz` (both byte
/// counts), allocating and mapping whole pages as needed. Returns the
/// new size, or an error leaving memory unchanged if allocation fails
/// partway through (already-mapped pages are unwound).
pub fn uvmalloc(pt: *mut PageTable, oldsz: usize, newsz: usize, xperm: PteFlags) -> Result<usize, ()> {
    if newsz < oldsz {
        return Ok(oldsz);
    }

    let oldsz_up = PGROUNDUP!(oldsz);
    let mut a = oldsz_up;
    while a < newsz {
        let mem: *mut u8 = unsafe { KMEM.kalloc() };
        if mem.is_null() {
            uvmdealloc(pt, a, oldsz);
            return Err(());
        }
        memset(mem, 0, PGSIZE);
        if mappages(
            pt,
            a,
            PGSIZE,
            mem as usize,
            PteFlags::READ | PteFlags::USER | xperm,
        )
        .is_err()
        {
            unsafe { KMEM.kfree(mem) };
            uvmdealloc(pt, a, oldsz);
            return Err(());
        }
        a += PGSIZE;
    }
    Ok(newsz)
}

/// Shrink a user process's memory from `oldsz` to `newsz`, freeing and
/// unmapping whole pages. Returns the new size.
pub fn uvmdealloc(pt: *mut PageTable, oldsz: usize, newsz: usize) -> usize {
    if newsz >= oldsz {
        return oldsz;
    }

    let old_up = PGROUNDUP!(oldsz);
    let new_up = PGROUNDUP!(newsz);
    if new_up < old_up {
        let npages = (old_up - new_up) / PGSIZE;
        uvmunmap(pt, new_up, npages, true);
    }

    newsz
}

/// Recursively free a page-table tree. Every leaf must already have
/// been unmapped (via uvmunmap) before this is called; a remaining
/// leaf indicates memory is being freed while still in use.
fn freewalk(pt: *mut PageTable) {
    for i in 0..512 {
        let pte = unsafe { &mut (*pt).0[i] };
        let flags = pte.flags();
        if flags.contains(PteFlags::VALID) {
            if flags.is_leaf() {
                panic!("freewalk: leaf still mapped");
            }
            let child = PTE2PA!(pte.0) as *mut PageTable;
            freewalk(child);
            *pte = Pte(0);
        }
    }
    unsafe { KMEM.kfree(pt as *mut u8) };
}

/// Unmap and free an entire user address space: every mapped page
/// below `sz`, the trapframe, and the page-table pages themselves.
/// The trampoline page is shared kernel text and is never freed here.
pub fn uvmfree(pt: *mut PageTable, sz: usize) {
    if sz > 0 {
        uvmunmap(pt, 0, PGROUNDUP!(sz) / PGSIZE, true);
    }
    freewalk(pt);
}

/// Duplicate a parent's user address space into a freshly allocated
/// child page table, copying the underlying physical pages (not
/// sharing them). On failure, everything allocated so far is unwound
/// so the caller can simply discard the child page table.
pub fn uvmcopy(old_pt: *mut PageTable, new_pt: *mut PageTable, sz: usize) -> Result<(), ()> {
    let mut i = 0;
    while i < sz {
        let pte = walk(old_pt, i, false);
        if pte.is_null() {
            panic!("uvmcopy: pte should exist");
        }
        let flags = unsafe { (*pte).flags() };
        if !flags.contains(PteFlags::VALID) {
            panic!("uvmcopy: page not present");
        }
        let pa = PTE2PA!(unsafe { (*pte).0 });

        let mem: *mut u8 = unsafe { KMEM.kalloc() };
        if mem.is_null() {
            uvmunmap(new_pt, 0, i / PGSIZE, true);
            return Err(());
        }
        unsafe { ptr::copy_nonoverlapping(pa as *const u8, mem, PGSIZE) };

        if mappages(new_pt, i, PGSIZE, mem as usize, flags).is_err() {
            unsafe { KMEM.kfree(mem) };
            uvmunmap(new_pt, 0, i / PGSIZE, true);
            return Err(());
        }
        i += PGSIZE;
    }
    Ok(())
}

/// Clear PTE_U on the page at `va`, so user code can no longer read or
/// write it (used to mark the guard page below the initial stack).
pub fn uvmclear(pt: *mut PageTable, va: usize) {
    let pte = walk(pt, va, false);
    if pte.is_null() {
        panic!("uvmclear");
    }
    unsafe {
        (*pte).0 &= !PteFlags::USER.bits();
    }
}

/// Copy `n` bytes from kernel memory at `src` to user virtual address
/// `dst_va` in `pt`, crossing page boundaries as needed.
pub fn copyout(pt: *mut PageTable, dst_va: usize, src: &[u8]) -> Result<(), ()> {
    let mut dst_va = dst_va;
    let mut copied = 0usize;
    let n = src.len();

    while copied < n {
        let va0 = PGROUNDDOWN!(dst_va);
        let pa0 = walkaddr(pt, va0).ok_or(())?;
        let off = dst_va - va0;
        let n1 = core::cmp::min(PGSIZE - off, n - copied);
        unsafe {
            ptr::copy_nonoverlapping(
                src.as_ptr().add(copied),
                (pa0 + off) as *mut u8,
                n1,
            );
        }
        copied += n1;
        dst_va = va0 + PGSIZE;
    }
    Ok(())
}

/// Copy `n` bytes from user virtual address `src_va` in `pt` into
/// kernel memory at `dst`, crossing page boundaries as needed.
pub fn copyin(pt: *mut PageTable, dst: &mut [u8], src_va: usize) -> Result<(), ()> {
    let mut src_va = src_va;
    let mut copied = 0usize;
    let n = dst.len();

    while copied < n {
        let va0 = PGROUNDDOWN!(src_va);
        let pa0 = walkaddr(pt, va0).ok_or(())?;
        let off = src_va - va0;
        let n1 = core::cmp::min(PGSIZE - off, n - copied);
        unsafe {
            ptr::copy_nonoverlapping(
                (pa0 + off) as *const u8,
                dst.as_mut_ptr().add(copied),
                n1,
            );
        }
        copied += n1;
        src_va = va0 + PGSIZE;
    }
    Ok(())
}

/// Copy a NUL-terminated string of at most `dst.len()` bytes (the last
/// slot is reserved for the terminator) from user virtual address
/// `src_va`, stopping at the first NUL. Returns an error if no NUL is
/// found within the budget or a page along the way isn't mapped.
pub fn copyinstr(pt: *mut PageTable, dst: &mut [u8], src_va: usize) -> Result<(), ()> {
    if dst.is_empty() {
        return Err(());
    }
    let max = dst.len() - 1;
    let mut src_va = src_va;
    let mut copied = 0usize;

    while copied < max {
        let va0 = PGROUNDDOWN!(src_va);
        let pa0 = walkaddr(pt, va0).ok_or(())?;
        let off = src_va - va0;
        let n1 = core::cmp::min(PGSIZE - off, max - copied);

        for k in 0..n1 {
            let byte = unsafe { ((pa0 + off + k) as *const u8).read() };
            dst[copied + k] = byte;
            if byte == 0 {
                return Ok(());
            }
        }
        copied += n1;
        src_va = va0 + PGSIZE;
    }
    Err(())
}

/// Build a fresh user page table for a new process: an empty table
/// with the trampoline and trapframe mapped at their fixed addresses.
/// The caller still owns mapping the process's own text/data/stack.
pub fn proc_pagetable(trapframe: *mut Trapframe) -> Option<*mut PageTable> {
    let pt = uvmcreate();
    if pt.is_null() {
        return None;
    }

    if mappages(
        pt,
        TRAMPOLINE,
        PGSIZE,
        unsafe { (&raw const trampoline) as usize },
        PteFlags::READ | PteFlags::EXEC,
    )
    .is_err()
    {
        unsafe { KMEM.kfree(pt as *mut u8) };
        return None;
    }

    if mappages(
        pt,
        TRAPFRAME,
        PGSIZE,
        trapframe as usize,
        PteFlags::READ | PteFlags::WRITE,
    )
    .is_err()
    {
        uvmunmap(pt, TRAMPOLINE, 1, false);
        unsafe { KMEM.kfree(pt as *mut u8) };
        return None;
    }

    Some(pt)
}

/// Tear down a process's page table: unmap the trampoline/trapframe
/// (without freeing their backing pages, which the process struct
/// itself owns) and free everything else, including `sz` bytes of
/// user memory.
pub fn proc_freepagetable(pt: *mut PageTable, sz: usize) {
    uvmunmap(pt, TRAMPOLINE, 1, false);
    uvmunmap(pt, TRAPFRAME, 1, false);
    uvmfree(pt, sz);
}

pub const fn initial_stack_pages() -> usize {
    USERSTACK
}

#[cfg(test)]
mod tests {
    // walk()/mappages() manipulate real physical memory through
    // KMEM, which only exists in the real kernel's address space;
    // exercise the PTE encode/decode rules they rely on directly.
    use crate::riscv::{Pte, PteFlags};
    use crate::{PA2PTE, PTE2PA};

    #[test]
    fn pa2pte_roundtrips_page_aligned_address() {
        let pa: usize = 0x8020_3000;
        let encoded = PA2PTE!(pa) | PteFlags::VALID.bits();
        assert_eq!(PTE2PA!(encoded), pa);
    }

    #[test]
    fn interior_vs_leaf_classification() {
        let interior = Pte(PteFlags::VALID.bits());
        assert!(interior.is_valid());
        assert!(!interior.flags().is_leaf());

        let leaf = Pte((PteFlags::VALID | PteFlags::READ | PteFlags::USER).bits());
        assert!(leaf.is_valid());
        assert!(leaf.flags().is_leaf());
    }
}

// ELF program loader, invoked by the exec system call. Builds a brand
// new address space for the calling process, loads each PT_LOAD
// segment into it, and only swaps it in for the old one once every
// step has succeeded -- so a failing exec leaves the caller's current
// image untouched.

use core::mem;

use crate::elf::{ElfHeader, ProgramHeader, ELF_MAGIC, ELF_PROG_LOAD};
use crate::file::INode;
use crate::fs::fs::namei;
use crate::log::{begin_op, end_op};
use crate::param::{MAXARG, MAXPATH};
use crate::proc::{myproc, proc_freepagetable, proc_pagetable};
use crate::riscv::{PageTable, PteFlags, PGSIZE};
use crate::string::strlen;
use crate::vm::{copyout, uvmalloc, uvmclear, walkaddr};
use crate::PGROUNDUP;

fn flags2perm(flags: u32) -> PteFlags {
    let mut perm = PteFlags::empty();
    if flags & 0x1 != 0 {
        perm |= PteFlags::EXEC;
    }
    if flags & 0x2 != 0 {
        perm |= PteFlags::WRITE;
    }
    perm
}

pub fn exec(path: &[u8; MAXPATH], argv: &[Option<*mut u8>; MAXARG]) -> i32 {
    begin_op();

    let path_len = path.iter().position(|&b| b == 0).unwrap_or(path.len());
    let ip = match namei(&path[..path_len]) {
        Some(ip) => ip,
        None => {
            end_op();
            return -1;
        }
    };
    ip.ilock();

    let mut elf = ElfHeader::create();
    if ip.readi(false, &mut elf as *mut ElfHeader, 0, mem::size_of::<ElfHeader>())
        != mem::size_of::<ElfHeader>()
        || elf.magic != ELF_MAGIC
    {
        ip.iunlockput();
        end_op();
        return -1;
    }

    let p = myproc().expect("exec: no current process");
    let pagetable = match proc_pagetable(p.trapframe()) {
        Some(pt) => pt,
        None => {
            ip.iunlockput();
            end_op();
            return -1;
        }
    };

    let mut sz = 0usize;
    let mut off = elf.phoff as u32;
    let ph_sz = mem::size_of::<ProgramHeader>();
    for _ in 0..elf.phnum {
        let mut ph = ProgramHeader::create();
        if ip.readi(false, &mut ph as *mut ProgramHeader, off, ph_sz) != ph_sz {
            proc_freepagetable(pagetable, sz);
            ip.iunlockput();
            end_op();
            return -1;
        }
        off += ph_sz as u32;

        if ph.hdr_type != ELF_PROG_LOAD {
            continue;
        }
        if ph.memsz < ph.filesz || ph.vaddr + ph.memsz < ph.vaddr || ph.vaddr % PGSIZE as u64 != 0
        {
            proc_freepagetable(pagetable, sz);
            ip.iunlockput();
            end_op();
            return -1;
        }

        sz = match uvmalloc(pagetable, sz, (ph.vaddr + ph.memsz) as usize, flags2perm(ph.flags)) {
            Ok(sz) => sz,
            Err(_) => {
                proc_freepagetable(pagetable, sz);
                ip.iunlockput();
                end_op();
                return -1;
            }
        };

        if loadseg(pagetable, ph.vaddr, ip, ph.off, ph.filesz).is_err() {
            proc_freepagetable(pagetable, sz);
            ip.iunlockput();
            end_op();
            return -1;
        }
    }
    ip.iunlockput();
    end_op();

    let oldsz = p.sz();

    // Allocate a guard page and a stack page above the loaded image;
    // the guard page is left unmapped so stack overflow faults.
    sz = PGROUNDUP!(sz);
    sz = match uvmalloc(pagetable, sz, sz + 2 * PGSIZE, PteFlags::WRITE) {
        Ok(sz) => sz,
        Err(_) => {
            proc_freepagetable(pagetable, sz);
            return -1;
        }
    };
    uvmclear(pagetable, sz - 2 * PGSIZE);

    let mut sp = sz;
    let stackbase = sp - PGSIZE;

    let mut ustack: [usize; MAXARG] = [0; MAXARG];
    let mut argc = 0;
    while argc < MAXARG {
        let arg = match argv[argc] {
            Some(a) => a,
            None => break,
        };
        let len = strlen(arg);
        sp -= len + 1;
        sp -= sp % 16;
        if sp < stackbase {
            proc_freepagetable(pagetable, sz);
            return -1;
        }
        let bytes = unsafe { core::slice::from_raw_parts(arg, len + 1) };
        if copyout(pagetable, sp, bytes).is_err() {
            proc_freepagetable(pagetable, sz);
            return -1;
        }
        ustack[argc] = sp;
        argc += 1;
    }
    ustack[argc] = 0;

    sp -= (argc + 1) * mem::size_of::<u64>();
    sp -= sp % 16;
    if sp < stackbase {
        proc_freepagetable(pagetable, sz);
        return -1;
    }
    let argv_bytes = unsafe {
        core::slice::from_raw_parts(
            ustack.as_ptr() as *const u8,
            (argc + 1) * mem::size_of::<u64>(),
        )
    };
    if copyout(pagetable, sp, argv_bytes).is_err() {
        proc_freepagetable(pagetable, sz);
        return -1;
    }

    let tf = unsafe { &mut *p.trapframe() };
    tf.a1 = sp as u64;

    let mut name = [0u8; 16];
    let copy_len = path_len.min(name.len());
    name[..copy_len].copy_from_slice(&path[..copy_len]);
    p.set_name(name);

    let oldpagetable = p.pagetable();
    p.set_pagetable(pagetable);
    p.set_sz(sz);
    tf.epc = elf.entry;
    tf.sp = sp as u64;
    proc_freepagetable(oldpagetable, oldsz);

    argc as i32
}

/// Load one PT_LOAD segment's bytes into an already-allocated range of
/// `pagetable`. `va` must be page-aligned and every page in [va, va+sz)
/// must already be mapped.
fn loadseg(pagetable: *mut PageTable, va: u64, ip: &mut INode, offset: u64, sz: u64) -> Result<(), ()> {
    let mut i = 0u64;
    while i < sz {
        let pa = walkaddr(pagetable, (va + i) as usize).ok_or(())?;
        let n = if sz - i < PGSIZE as u64 {
            (sz - i) as usize
        } else {
            PGSIZE
        };
        if ip.readi(false, pa as *mut u8, (offset + i) as u32, n) != n {
            return Err(());
        }
        i += n as u64;
    }
    Ok(())
}

// Process table, scheduler, context switching, and the sleep/wakeup
// channel abstraction blocking I/O is built on.
//
// Locking order, strictly enforced: to sleep, a process must hold its
// own `p.lock` and no other lock (sleep releases whatever lock the
// caller was holding for the wait condition, then reacquires it on
// wake). The one exception is WAIT_LOCK, which is always acquired
// before any `p.lock` it nests under, so that a parent waiting in
// wait() and a child exiting can't deadlock against each other.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::file::{File, INode};
use crate::param::{NCPU, NOFILE, NPROC};
use crate::riscv::PageTable;
use crate::spinlock::{pop_off, push_off, Spinlock};
use crate::string::safestrcpy;
use crate::vm::{proc_freepagetable, proc_pagetable, uvmalloc, uvmcopy, uvmdealloc, uvmfirst};
use crate::KSTACK;

extern "C" {
    fn swtch(old: *mut Context, new: *mut Context);
}

#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct Context {
    pub ra: u64,
    pub sp: u64,
    // callee-saved
    pub s0: u64,
    pub s1: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
}

#[derive(Copy, Clone)]
pub struct Cpu {
    proc: *mut Proc,
    context: Context, // swtch() here to enter scheduler()
    pub noff: i32,     // depth of push_off() nesting
    pub intena: bool,  // were interrupts enabled before push_off()?
}

impl Cpu {
    const fn create() -> Self {
        Cpu {
            proc: ptr::null_mut(),
            context: Context {
                ra: 0,
                sp: 0,
                s0: 0,
                s1: 0,
                s2: 0,
                s3: 0,
                s4: 0,
                s5: 0,
                s6: 0,
                s7: 0,
                s8: 0,
                s9: 0,
                s10: 0,
                s11: 0,
            },
            noff: 0,
            intena: false,
        }
    }
}

pub static mut CPUS: [Cpu; NCPU] = [Cpu::create(); NCPU];

/// Per-process data mapped into the page common to both the trampoline
/// and every user page table, at a fixed virtual address, so the
/// trampoline code can find it regardless of which process's page
/// table satp currently points to. Field order and size are load
/// bearing: trampoline.S addresses these by raw byte offset, not by
/// name.
#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct Trapframe {
    pub kernel_satp: u64,   // 0:   kernel page table
    pub kernel_sp: u64,     // 8:   top of process's kernel stack
    pub kernel_trap: u64,   // 16:  usertrap()
    pub epc: u64,           // 24:  saved user program counter
    pub kernel_hartid: u64, // 32:  saved kernel tp
    pub ra: u64,            // 40
    pub sp: u64,            // 48
    pub gp: u64,            // 56
    pub tp: u64,            // 64
    pub t0: u64,            // 72
    pub t1: u64,            // 80
    pub t2: u64,            // 88
    pub s0: u64,            // 96
    pub s1: u64,            // 104
    pub a0: u64,            // 112
    pub a1: u64,            // 120
    pub a2: u64,            // 128
    pub a3: u64,            // 136
    pub a4: u64,            // 144
    pub a5: u64,            // 152
    pub a6: u64,            // 160
    pub a7: u64,            // 168
    pub s2: u64,            // 176
    pub s3: u64,            // 184
    pub s4: u64,            // 192
    pub s5: u64,            // 200
    pub s6: u64,            // 208
    pub s7: u64,            // 216
    pub s8: u64,            // 224
    pub s9: u64,            // 232
    pub s10: u64,           // 240
    pub s11: u64,           // 248
    pub t3: u64,            // 256
    pub t4: u64,            // 264
    pub t5: u64,            // 272
    pub t6: u64,            // 280
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Procstate {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

#[derive(Copy, Clone)]
pub struct Proc {
    pub lock: Spinlock,

    // these are protected by `lock`:
    state: Procstate,
    chan: usize, // sleeping on this address if non-zero
    killed: bool,
    xstate: i32, // exit status, for a parent's wait()
    pid: i32,

    // these are protected by WAIT_LOCK; only meaningfully written
    // while that lock is held, and only read by the owning process or
    // a parent holding WAIT_LOCK.
    parent: *mut Proc,

    // these are private to the process, no lock needed:
    kstack: usize,           // virtual address of kernel stack
    sz: usize,               // size of process memory (bytes)
    pagetable: *mut PageTable,
    trapframe: *mut Trapframe,
    context: Context, // swtch() here to run process
    ofile: [Option<*mut File>; NOFILE],
    cwd: Option<*mut INode>,
    name: [u8; 16],
}

impl Proc {
    const fn create() -> Self {
        Proc {
            lock: Spinlock::init_lock("proc"),
            state: Procstate::Unused,
            chan: 0,
            killed: false,
            xstate: 0,
            pid: 0,
            parent: ptr::null_mut(),
            kstack: 0,
            sz: 0,
            pagetable: ptr::null_mut(),
            trapframe: ptr::null_mut(),
            context: Context {
                ra: 0,
                sp: 0,
                s0: 0,
                s1: 0,
                s2: 0,
                s3: 0,
                s4: 0,
                s5: 0,
                s6: 0,
                s7: 0,
                s8: 0,
                s9: 0,
                s10: 0,
                s11: 0,
            },
            ofile: [None; NOFILE],
            cwd: None,
            name: [0; 16],
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn state(&self) -> Procstate {
        self.state
    }

    pub fn name(&self) -> &[u8; 16] {
        &self.name
    }

    pub fn pagetable(&self) -> *mut PageTable {
        self.pagetable
    }

    pub fn trapframe(&self) -> *mut Trapframe {
        self.trapframe
    }

    pub fn kstack_top(&self) -> usize {
        self.kstack + crate::riscv::PGSIZE
    }

    /// Read `killed` without the acquire/release ceremony `killed()`
    /// does: safe to call from usertrap(), which already holds no
    /// locks of its own and just needs a quick flag check.
    pub fn killed_flag(&self) -> bool {
        self.killed
    }

    pub fn sz(&self) -> usize {
        self.sz
    }

    /// The remaining accessors below exist for the external-collaborator
    /// layers (exec, file descriptors, the file system) that need to
    /// read or replace a process's memory image or open-file state
    /// without reaching past the process table's own bookkeeping.
    pub fn ofile_mut(&mut self) -> &mut [Option<*mut File>; NOFILE] {
        &mut self.ofile
    }

    pub fn cwd(&self) -> Option<*mut INode> {
        self.cwd
    }

    pub fn set_cwd(&mut self, ip: Option<*mut INode>) {
        self.cwd = ip;
    }

    pub fn set_pagetable(&mut self, pt: *mut PageTable) {
        self.pagetable = pt;
    }

    pub fn set_sz(&mut self, sz: usize) {
        self.sz = sz;
    }

    pub fn set_name(&mut self, name: [u8; 16]) {
        self.name = name;
    }
}

pub static mut PROCS: [Proc; NPROC] = [Proc::create(); NPROC];

static mut INIT_PROC: *mut Proc = ptr::null_mut();

static NEXT_PID: AtomicI32 = AtomicI32::new(1);
static mut WAIT_LOCK: Spinlock = Spinlock::init_lock("wait_lock");

const INITCODE: [u8; 52] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x35, 0x02,
    0x93, 0x08, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00, 0x93, 0x08, 0x20, 0x00, 0x73, 0x00, 0x00, 0x00,
    0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x24, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

/// Which hart is this, per the tp register `start()` set at boot.
/// Must be called with interrupts disabled: if they were on, this
/// hart could be preempted and rescheduled onto another hart between
/// reading tp and using the result.
pub fn cpuid() -> usize {
    crate::riscv::r_tp() as usize
}

/// Return this hart's `Cpu` struct. Interrupts must be disabled.
pub fn mycpu() -> &'static mut Cpu {
    let id = cpuid();
    unsafe { &mut CPUS[id] }
}

/// Return the process running on this hart, or None if the scheduler
/// thread itself is running (no process).
pub fn myproc() -> Option<&'static mut Proc> {
    push_off();
    let p = mycpu().proc;
    pop_off();
    if p.is_null() {
        None
    } else {
        Some(unsafe { &mut *p })
    }
}

fn allocpid() -> i32 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// Map each process's kernel stack into the kernel page table, below
/// the trampoline, separated by an unmapped guard page so a stack
/// overflow faults instead of corrupting the neighboring stack.
pub fn proc_mapstacks(kpt: *mut PageTable) {
    for i in 0..NPROC {
        let pa: *mut u8 = unsafe { crate::kalloc::KMEM.kalloc() };
        if pa.is_null() {
            panic!("proc_mapstacks: kalloc");
        }
        let va = KSTACK!(i);
        crate::vm::kvmmap(
            kpt,
            va,
            pa as usize,
            crate::riscv::PGSIZE,
            crate::riscv::PteFlags::READ | crate::riscv::PteFlags::WRITE,
        );
    }
}

pub fn procinit() {
    for i in 0..NPROC {
        unsafe {
            PROCS[i].kstack = KSTACK!(i);
        }
    }
}

/// Look through the process table for a RUNNABLE process to run next.
/// Runs forever: a hart with nothing to run just spins here, with
/// interrupts enabled, until something wakes up.
pub fn scheduler() -> ! {
    let c = mycpu();
    c.proc = ptr::null_mut();
    loop {
        crate::riscv::intr_on();

        let mut found = false;
        for i in 0..NPROC {
            let p = unsafe { &mut PROCS[i] };
            p.lock.acquire();
            if p.state == Procstate::Runnable {
                p.state = Procstate::Running;
                c.proc = p as *mut Proc;
                unsafe {
                    swtch(&mut c.context as *mut Context, &mut p.context as *mut Context);
                }
                c.proc = ptr::null_mut();
                found = true;
            }
            p.lock.release();
        }
        if !found {
            // nothing runnable: wait for a timer/device interrupt
            // rather than burn the hart spinning at full rate.
            unsafe { core::arch::asm!("wfi") };
        }
    }
}

/// Switch from the current process back to the scheduler, having
/// already set `p.state` to something other than Running. Must be
/// called with `p.lock` held and exactly the interrupt-disable depth
/// the process had when it started running, so the depth is
/// unaffected by the switch.
fn sched() {
    let p = myproc().expect("sched: no current process");
    if !p.lock.holding() {
        panic!("sched: p->lock not held");
    }
    if mycpu().noff != 1 {
        panic!("sched: locks held while switching");
    }
    if p.state == Procstate::Running {
        panic!("sched: process still marked running");
    }
    if crate::riscv::intr_get() {
        panic!("sched: interruptible while switching");
    }

    let intena = mycpu().intena;
    unsafe {
        swtch(&mut p.context as *mut Context, &mut mycpu().context as *mut Context);
    }
    mycpu().intena = intena;
}

/// Give up the CPU for one scheduling round.
pub fn proc_yield() {
    if let Some(p) = myproc() {
        p.lock.acquire();
        p.state = Procstate::Runnable;
        sched();
        p.lock.release();
    }
}

/// The very first scheduling of a freshly forked process lands here
/// (set up as `context.ra` by allocproc): release the lock sched()'s
/// caller would normally still be holding, run any first-process-only
/// setup, then fall through to the trap return path back to user
/// space.
static FIRST_SCHEDULE: AtomicBool = AtomicBool::new(true);

extern "C" fn forkret() {
    let p = myproc().expect("forkret: no current process");
    p.lock.release();

    if FIRST_SCHEDULE.swap(false, Ordering::SeqCst) {
        // File-system initialization has to run from a process context
        // (it may block on disk I/O), so it can't happen in kmain().
        crate::fs::fs::fsinit(crate::param::ROOTDEV);
        crate::fs::fs::iinit();

        let root = crate::fs::fs::namei(b"/").expect("forkret: no root inode");
        p.set_cwd(Some(root as *mut crate::file::INode));
    }

    crate::trap::usertrapret();
}

/// Scan the process table for an UNUSED slot and turn it into a
/// freshly allocated (but not yet runnable) process: a pid, a kernel
/// stack, a trapframe, an empty page table, and a context primed to
/// start at forkret() the first time it's scheduled. Returns the slot
/// still locked, for the caller to finish filling in.
fn allocproc() -> Option<&'static mut Proc> {
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        p.lock.acquire();
        if p.state == Procstate::Unused {
            p.pid = allocpid();
            p.state = Procstate::Used;

            let tf: *mut Trapframe = unsafe { crate::kalloc::KMEM.kalloc() };
            if tf.is_null() {
                freeproc(p);
                p.lock.release();
                return None;
            }
            p.trapframe = tf;

            p.pagetable = match proc_pagetable(p.trapframe) {
                Some(pt) => pt,
                None => {
                    freeproc(p);
                    p.lock.release();
                    return None;
                }
            };

            p.context = Context::default();
            p.context.ra = forkret as usize as u64;
            p.context.sp = (p.kstack + crate::riscv::PGSIZE) as u64;

            return Some(p);
        }
        p.lock.release();
    }
    None
}

/// Free a process slot's resources and reset it to UNUSED. `p.lock`
/// must be held.
fn freeproc(p: &mut Proc) {
    if !p.trapframe.is_null() {
        unsafe { crate::kalloc::KMEM.kfree(p.trapframe as *mut u8) };
    }
    p.trapframe = ptr::null_mut();
    if !p.pagetable.is_null() {
        proc_freepagetable(p.pagetable, p.sz);
    }
    p.pagetable = ptr::null_mut();
    p.sz = 0;
    p.pid = 0;
    p.parent = ptr::null_mut();
    p.name = [0; 16];
    p.killed = false;
    p.xstate = 0;
    p.state = Procstate::Unused;
    p.chan = 0;
}

/// Set up the very first user process: page table with initcode
/// mapped at address 0, a trapframe that will enter it at pc=0 with a
/// one-page stack, and state RUNNABLE so the scheduler picks it up.
pub fn userinit() {
    let p = allocproc().expect("userinit: allocproc failed");

    uvmfirst(p.pagetable, &INITCODE);
    p.sz = crate::riscv::PGSIZE;

    unsafe {
        (*p.trapframe).epc = 0;
        (*p.trapframe).sp = crate::riscv::PGSIZE as u64;
    }

    safestrcpy(&mut p.name, b"initcode");
    p.cwd = None; // set to the root inode on first real schedule, once fs::fs::iinit() has run.

    p.state = Procstate::Runnable;

    unsafe {
        INIT_PROC = p as *mut Proc;
    }

    p.lock.release();
}

/// Grow or shrink the calling process's memory by `n` bytes (n may be
/// negative to shrink). Returns an error, leaving memory unchanged,
/// if growing runs out of physical memory.
pub fn growproc(n: i64) -> Result<(), ()> {
    let p = myproc().ok_or(())?;
    let oldsz = p.sz;
    let newsz = if n >= 0 {
        let newsz = uvmalloc(
            p.pagetable,
            oldsz,
            (oldsz as i64 + n) as usize,
            crate::riscv::PteFlags::WRITE,
        )
        .map_err(|_| ())?;
        newsz
    } else {
        uvmdealloc(p.pagetable, oldsz, (oldsz as i64 + n) as usize)
    };
    p.sz = newsz;
    Ok(())
}

/// Create a new process, a near-exact copy of the caller: same text,
/// data, and open files, forked at the current trapframe so the child
/// resumes exactly where the parent called fork(), except with a
/// return value of 0 instead of the child's pid.
pub fn fork() -> i32 {
    let p = match myproc() {
        Some(p) => p,
        None => return -1,
    };

    let np = match allocproc() {
        Some(np) => np,
        None => return -1,
    };

    if uvmcopy(p.pagetable, np.pagetable, p.sz).is_err() {
        freeproc(np);
        np.lock.release();
        return -1;
    }
    np.sz = p.sz;

    unsafe {
        *np.trapframe = *p.trapframe;
        (*np.trapframe).a0 = 0;
    }

    for i in 0..NOFILE {
        if let Some(f) = p.ofile[i] {
            crate::file::file::filedup(f);
            np.ofile[i] = Some(f);
        }
    }
    np.cwd = p.cwd;

    np.name = p.name;

    let pid = np.pid;
    np.lock.release();

    unsafe {
        WAIT_LOCK.acquire();
        np.parent = p as *mut Proc;
        WAIT_LOCK.release();
    }

    np.lock.acquire();
    np.state = Procstate::Runnable;
    np.lock.release();

    pid
}

/// Hand every child of `p` to init, under WAIT_LOCK (already held by
/// the caller), so a parent that exits before its children do doesn't
/// orphan them permanently.
fn reparent(p: *mut Proc) {
    for i in 0..NPROC {
        let pp = unsafe { &mut PROCS[i] };
        if pp.parent == p {
            pp.parent = unsafe { INIT_PROC };
            wakeup(unsafe { INIT_PROC } as usize);
        }
    }
}

/// Terminate the calling process: reparent its children to init, wake
/// a waiting parent, and become a ZOMBIE holding `status` until the
/// parent's wait() reaps it. Never returns.
pub fn exit(status: i32) -> ! {
    let p = myproc().expect("exit: no current process");

    if ptr::eq(p, unsafe { INIT_PROC }) {
        panic!("exit: init process exiting");
    }

    for i in 0..NOFILE {
        if let Some(f) = p.ofile[i].take() {
            crate::file::file::fileclose(f);
        }
    }

    unsafe {
        WAIT_LOCK.acquire();
    }
    reparent(p as *mut Proc);
    let parent = p.parent;
    wakeup(parent as usize);

    p.lock.acquire();
    p.xstate = status;
    p.state = Procstate::Zombie;
    unsafe {
        WAIT_LOCK.release();
    }

    sched();
    unreachable!("exit: zombie process rescheduled");
}

/// Block until some child exits, then reap it: copy its exit status to
/// `*status_va` (a user-space address in the caller's own memory) if
/// non-null, and return its pid. Returns an error if the caller has no
/// children at all.
pub fn wait(status_va: usize) -> Result<i32, ()> {
    let p = myproc().ok_or(())?;

    unsafe {
        WAIT_LOCK.acquire();
    }

    loop {
        let mut have_children = false;
        for i in 0..NPROC {
            let np = unsafe { &mut PROCS[i] };
            if np.parent == p as *mut Proc {
                have_children = true;
                np.lock.acquire();
                if np.state == Procstate::Zombie {
                    let pid = np.pid;
                    if status_va != 0 {
                        let xstate = np.xstate;
                        let bytes = xstate.to_ne_bytes();
                        if crate::vm::copyout(p.pagetable, status_va, &bytes).is_err() {
                            np.lock.release();
                            unsafe { WAIT_LOCK.release() };
                            return Err(());
                        }
                    }
                    freeproc(np);
                    np.lock.release();
                    unsafe { WAIT_LOCK.release() };
                    return Ok(pid);
                }
                np.lock.release();
            }
        }

        if !have_children || killed(Some(p)) {
            unsafe { WAIT_LOCK.release() };
            return Err(());
        }

        sleep(p as *const Proc as usize, unsafe { &WAIT_LOCK });
    }
}

/// Mark `pid`'s process killed, and wake it if it's sleeping so it
/// notices at its next chance (a sleeping process only checks
/// `killed` in its own wait loops, never mid-instruction).
pub fn kill(pid: i32) -> Result<(), ()> {
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        p.lock.acquire();
        if p.pid == pid {
            p.killed = true;
            if p.state == Procstate::Sleeping {
                p.state = Procstate::Runnable;
            }
            p.lock.release();
            return Ok(());
        }
        p.lock.release();
    }
    Err(())
}

pub fn set_killed(p: &mut Proc) {
    p.lock.acquire();
    p.killed = true;
    p.lock.release();
}

pub fn killed(p: Option<&mut Proc>) -> bool {
    match p {
        Some(p) => {
            p.lock.acquire();
            let k = p.killed;
            p.lock.release();
            k
        }
        None => false,
    }
}

/// Atomically release `lk` and put the calling process to sleep on
/// `chan`, reacquiring `lk` before returning. `lk` must be something
/// other than the process's own `p.lock`, or the check-then-sleep
/// below isn't actually atomic with respect to a concurrent wakeup.
pub fn sleep(chan: usize, lk: &Spinlock) {
    let p = myproc().expect("sleep: no current process");

    // Acquire p->lock in order to change p->state and then call
    // sched. Once we hold p->lock, we can be guaranteed that we won't
    // miss any wakeup (wakeup locks p->lock), so it's okay to release
    // lk before we sleep.
    let same_lock = ptr::eq(lk, &p.lock);
    p.lock.acquire();
    if !same_lock {
        lk.release();
    }

    p.chan = chan;
    p.state = Procstate::Sleeping;

    sched();

    p.chan = 0;

    p.lock.release();
    if !same_lock {
        lk.acquire();
    }
}

/// Wake every process sleeping on `chan`.
pub fn wakeup(chan: usize) {
    let me: *const Proc = myproc().map(|mp| mp as *const Proc).unwrap_or(ptr::null());
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        if !ptr::eq(p, me) {
            p.lock.acquire();
            if p.state == Procstate::Sleeping && p.chan == chan {
                p.state = Procstate::Runnable;
            }
            p.lock.release();
        }
    }
}

/// Print a one-line summary of every non-UNUSED process, for the
/// console's Ctrl-P hotkey and for debugging deadlocks.
pub fn procdump() {
    crate::println!();
    for i in 0..NPROC {
        let p = unsafe { &PROCS[i] };
        if p.state == Procstate::Unused {
            continue;
        }
        let state = match p.state {
            Procstate::Unused => "unused",
            Procstate::Used => "used",
            Procstate::Sleeping => "sleep ",
            Procstate::Runnable => "runble",
            Procstate::Running => "run   ",
            Procstate::Zombie => "zombie",
        };
        let name_len = p.name.iter().position(|&b| b == 0).unwrap_or(p.name.len());
        let name = core::str::from_utf8(&p.name[..name_len]).unwrap_or("?");
        crate::println!("{} {} {}", p.pid, state, name);
    }
}

/// Copy `n` bytes from kernel memory at `src` to `dst`, which is
/// either a user virtual address (through the calling process's page
/// table) or a kernel virtual address, depending on `user_dst`.
pub fn either_copyout(user_dst: bool, dst: usize, src: &[u8]) -> Result<(), ()> {
    if user_dst {
        let p = myproc().ok_or(())?;
        crate::vm::copyout(p.pagetable, dst, src)
    } else {
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len());
        }
        Ok(())
    }
}

/// Copy `dst.len()` bytes from `src` (user or kernel virtual address,
/// per `user_src`) into kernel memory at `dst`.
pub fn either_copyin(dst: &mut [u8], user_src: bool, src: usize) -> Result<(), ()> {
    if user_src {
        let p = myproc().ok_or(())?;
        crate::vm::copyin(p.pagetable, dst, src)
    } else {
        unsafe {
            ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }
}

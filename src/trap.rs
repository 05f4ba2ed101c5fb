// Trap dispatch: entry/exit for both user-mode traps (syscalls, page
// faults, device interrupts taken while running a process) and
// kernel-mode traps (device interrupts taken while the kernel itself
// is running).
//
// User traps always land in the trampoline page first (mapped at the
// same address in every page table), which saves registers into the
// trapframe and switches satp to the kernel page table before handing
// off to usertrap() below. Kernel traps go straight to kernelvec,
// which saves just enough to call kerneltrap() and return.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::memlayout::{TRAMPOLINE, UART0_IRQ, VIRTIO0_IRQ};
use crate::proc::{exit, myproc, proc_yield, set_killed};
use crate::spinlock::Spinlock;

extern "C" {
    fn kernelvec();
    fn trampoline();
    fn uservec();
    fn userret();
}

static TICKS_LOCK: Spinlock = Spinlock::init_lock("time");
static TICKS: AtomicU64 = AtomicU64::new(0);

const SCAUSE_INTERRUPT_BIT: u64 = 1 << 63;
// scause codes this kernel recognizes; anything else is fatal.
const IRQ_TIMER: u64 = 5;
const IRQ_SOFTWARE: u64 = 1; // supervisor software interrupt (used to signal a timer tick from machine mode)
const SYSCALL_ECALL_FROM_U: u64 = 8;

pub fn trapinit() {
    // TICKS_LOCK needs no runtime init beyond its const constructor.
}

/// Called on every hart: point stvec at the kernel trap vector used
/// while *not* running a user process (interrupts taken in kernel
/// code, e.g. while servicing a syscall).
pub fn trapinithart() {
    crate::riscv::w_stvec(kernelvec as usize);
}

/// Entered (via uservec in trampoline.S) whenever a user process traps
/// into the kernel: syscall, page fault, illegal instruction, or a
/// device interrupt that arrived while running user code.
#[no_mangle]
pub extern "C" fn usertrap() -> ! {
    if (crate::riscv::r_sstatus() & crate::riscv::SSTATUS_SPP as u64) != 0 {
        panic!("usertrap: not from user mode");
    }

    // Device interrupts should be handled with the kernel's own trap
    // vector installed, since usertrap() itself isn't set up to
    // re-enter from the trampoline.
    crate::riscv::w_stvec(kernelvec as usize);

    let p = myproc().expect("usertrap: no current process");

    unsafe {
        (*p.trapframe()).epc = crate::riscv::r_sepc() as u64;
    }

    let scause = crate::riscv::r_scause();
    if scause == SYSCALL_ECALL_FROM_U {
        if p.killed_flag() {
            exit(-1);
        }

        // sepc points at the ecall instruction; resume just past it.
        unsafe {
            (*p.trapframe()).epc += 4;
        }

        crate::riscv::intr_on();
        crate::syscall::syscall::syscall();
    } else if let Some(irq) = devintr(scause) {
        let _ = irq;
    } else {
        let tf = p.trapframe();
        crate::printf!(
            "usertrap(): unexpected scause {:#x} pid={}\n",
            scause,
            p.pid()
        );
        crate::printf!(
            "            sepc={:#x} stval={:#x}\n",
            unsafe { (*tf).epc },
            crate::riscv::r_stval()
        );
        set_killed(p);
    }

    if p.killed_flag() {
        exit(-1);
    }

    if scause == IRQ_TIMER + SCAUSE_INTERRUPT_BIT {
        proc_yield();
    }

    usertrapret();
}

/// Return from the kernel to user space: finish preparing the
/// trapframe and jump through the trampoline's userret entry point,
/// which restores registers and executes `sret`.
pub fn usertrapret() -> ! {
    let p = myproc().expect("usertrapret: no current process");

    crate::riscv::intr_off();

    let trampoline_uservec = TRAMPOLINE + (uservec as usize - trampoline as usize);
    crate::riscv::w_stvec(trampoline_uservec);

    unsafe {
        let tf = p.trapframe();
        (*tf).kernel_satp = crate::riscv::r_satp() as u64;
        (*tf).kernel_sp = (p.kstack_top()) as u64;
        (*tf).kernel_trap = usertrap as usize as u64;
        (*tf).kernel_hartid = crate::riscv::r_tp();
    }

    let mut x = crate::riscv::r_sstatus();
    x &= !(crate::riscv::SSTATUS_SPP as u64); // clear SPP: return to user mode
    x |= crate::riscv::SSTATUS_SPIE as u64; // enable interrupts in user mode
    crate::riscv::w_sstatus(x);

    unsafe {
        crate::riscv::w_sepc((*p.trapframe()).epc as usize);
    }

    let satp = crate::MAKE_SATP!(p.pagetable() as usize);
    let trampoline_userret = TRAMPOLINE + (userret as usize - trampoline as usize);

    let go: extern "C" fn(usize) -> ! = unsafe { core::mem::transmute(trampoline_userret) };
    go(satp);
}

/// Entered (via kernelvec in kernelvec.S) whenever the kernel itself
/// traps while not running a user process: only device interrupts are
/// expected here, anything else is a kernel bug.
#[no_mangle]
pub extern "C" fn kerneltrap() {
    let sepc = crate::riscv::r_sepc();
    let sstatus = crate::riscv::r_sstatus();
    let scause = crate::riscv::r_scause();

    if (sstatus & crate::riscv::SSTATUS_SPP as u64) == 0 {
        panic!("kerneltrap: not from supervisor mode");
    }
    if crate::riscv::intr_get() {
        panic!("kerneltrap: interrupts enabled");
    }

    if devintr(scause).is_none() {
        crate::printf!(
            "scause {:#x}\n sepc={:#x} stval={:#x}\n",
            scause,
            sepc,
            crate::riscv::r_stval()
        );
        panic!("kerneltrap: unexpected trap");
    }

    // a timer interrupt may have marked the running process runnable
    // again; give something else a turn rather than resume it blindly.
    if scause == IRQ_TIMER + SCAUSE_INTERRUPT_BIT
        && myproc().is_some()
    {
        proc_yield();
    }

    crate::riscv::w_sepc(sepc);
    crate::riscv::w_sstatus(sstatus);
}

/// Handle a device interrupt, returning the IRQ number (2 for a timer
/// interrupt, which has no PLIC claim) or None if `scause` doesn't
/// describe one of the two devices/timer this kernel drives.
fn devintr(scause: u64) -> Option<u64> {
    if scause == SCAUSE_INTERRUPT_BIT + IRQ_SOFTWARE {
        // software interrupt from a machine-mode timer trap: bump the
        // shared tick counter and wake anything sleeping on it.
        if crate::proc::cpuid() == 0 {
            TICKS_LOCK.acquire();
            let t = TICKS.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = t;
            crate::proc::wakeup(core::ptr::addr_of!(TICKS) as usize);
            TICKS_LOCK.release();
        }
        crate::riscv::w_sip(crate::riscv::r_sip() & !2);
        Some(IRQ_TIMER)
    } else if scause == SCAUSE_INTERRUPT_BIT + 9 {
        // supervisor external interrupt, via PLIC.
        let irq = crate::plic::plic_claim();
        if irq as usize == UART0_IRQ {
            crate::uart::uart_intr();
        } else if irq as usize == VIRTIO0_IRQ {
            // The disk driver's completion handling lives in the
            // buffer cache layer, outside this kernel's core scope;
            // still claim/complete the IRQ so the PLIC isn't wedged.
        } else if irq != 0 {
            crate::printf!("unexpected interrupt irq={}\n", irq);
        }
        if irq != 0 {
            crate::plic::plic_complete(irq);
        }
        Some(9)
    } else {
        None
    }
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::SeqCst)
}

/// Block the calling process until the tick counter advances by at
/// least one, used by the `sleep` syscall.
pub fn clockintr_wait() {
    TICKS_LOCK.acquire();
    let t0 = TICKS.load(Ordering::SeqCst);
    while TICKS.load(Ordering::SeqCst) == t0 {
        crate::proc::sleep(core::ptr::addr_of!(TICKS) as usize, &TICKS_LOCK);
    }
    TICKS_LOCK.release();
}

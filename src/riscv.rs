// RISC-V machine and supervisor register accessors, Sv39 page table
// types, and the handful of bit-twiddling macros (PGROUNDUP, PX, ...)
// that the rest of the kernel leans on.

use bitflags::bitflags;
use core::arch::asm;

pub fn r_mhartid() -> u64 {
    let mut x: u64;
    unsafe { asm!("csrr {}, mhartid", out(reg) x) }
    x
}

// Machine Status Register, mstatus
pub const MSTATUS_MPP_MASK: u64 = 3 << 11; // previous mode.
pub const MSTATUS_MPP_M: u64 = 3 << 11;
pub const MSTATUS_MPP_S: u64 = 1 << 11;
pub const MSTATUS_MPP_U: u64 = 0 << 11;
pub const MSTATUS_MIE: u64 = 1 << 3; // machine-mode interrupt enable.

pub fn r_mstatus() -> u64 {
    let mut x: u64;
    unsafe { asm!("csrr {}, mstatus", out(reg) x) }
    x
}

pub fn w_mstatus(x: u64) {
    unsafe { asm!("csrw mstatus, {}", in(reg) x) }
}

// machine exception program counter: the instruction address a
// return from exception will go to.
pub fn w_mepc(x: usize) {
    unsafe { asm!("csrw mepc, {}", in(reg) x) }
}

// Supervisor Status Register, sstatus
pub const SSTATUS_SPP: u64 = 1 << 8; // Previous mode, 1=Supervisor, 0=User
pub const SSTATUS_SPIE: u64 = 1 << 5; // Supervisor Previous Interrupt Enable
pub const SSTATUS_UPIE: u64 = 1 << 4; // User Previous Interrupt Enable
pub const SSTATUS_SIE: u64 = 1 << 1; // Supervisor Interrupt Enable
pub const SSTATUS_UIE: u64 = 1 << 0; // User Interrupt Enable

pub fn r_sstatus() -> u64 {
    let mut x: u64;
    unsafe { asm!("csrr {}, sstatus", out(reg) x) }
    x
}

pub fn w_sstatus(x: u64) {
    unsafe { asm!("csrw sstatus, {}", in(reg) x) }
}

// Supervisor Interrupt Pending
pub fn r_sip() -> u64 {
    let mut x: u64;
    unsafe { asm!("csrr {}, sip", out(reg) x) }
    x
}

pub fn w_sip(x: u64) {
    unsafe { asm!("csrw sip, {}", in(reg) x) }
}

// Supervisor Interrupt Enable
pub const SIE_SEIE: u64 = 1 << 9; // external
pub const SIE_STIE: u64 = 1 << 5; // timer
pub const SIE_SSIE: u64 = 1 << 1; // software

pub fn r_sie() -> u64 {
    let mut x: u64;
    unsafe { asm!("csrr {}, sie", out(reg) x) }
    x
}

pub fn w_sie(x: u64) {
    unsafe { asm!("csrw sie, {}", in(reg) x) }
}

// Machine-mode Interrupt Enable
pub const MIE_MEIE: u64 = 1 << 11; // external
pub const MIE_MTIE: u64 = 1 << 7; // timer
pub const MIE_MSIE: u64 = 1 << 3; // software

pub fn r_mie() -> u64 {
    let mut x: u64;
    unsafe { asm!("csrr {}, mie", out(reg) x) }
    x
}

pub fn w_mie(x: u64) {
    unsafe { asm!("csrw mie, {}", in(reg) x) }
}

// supervisor exception program counter
pub fn r_sepc() -> usize {
    let mut x: usize;
    unsafe { asm!("csrr {}, sepc", out(reg) x) }
    x
}

pub fn w_sepc(x: usize) {
    unsafe { asm!("csrw sepc, {}", in(reg) x) }
}

// Machine Exception Delegation
pub fn r_medeleg() -> u64 {
    let mut x: u64;
    unsafe { asm!("csrr {}, medeleg", out(reg) x) }
    x
}

pub fn w_medeleg(x: u64) {
    unsafe { asm!("csrw medeleg, {}", in(reg) x) }
}

// Machine Interrupt Delegation
pub fn r_mideleg() -> u64 {
    let mut x: u64;
    unsafe { asm!("csrr {}, mideleg", out(reg) x) }
    x
}

pub fn w_mideleg(x: u64) {
    unsafe { asm!("csrw mideleg, {}", in(reg) x) }
}

// Supervisor Trap-Vector Base Address; low two bits are mode.
pub fn r_stvec() -> usize {
    let mut x: usize;
    unsafe { asm!("csrr {}, stvec", out(reg) x) }
    x
}

pub fn w_stvec(x: usize) {
    unsafe { asm!("csrw stvec, {}", in(reg) x) }
}

// Machine-mode interrupt vector
pub fn w_mtvec(x: usize) {
    unsafe { asm!("csrw mtvec, {}", in(reg) x) }
}

// Physical Memory Protection
pub fn w_pmpcfg0(x: u64) {
    unsafe { asm!("csrw pmpcfg0, {}", in(reg) x) }
}

pub fn w_pmpaddr0(x: u64) {
    unsafe { asm!("csrw pmpaddr0, {}", in(reg) x) }
}

// supervisor address translation and protection register: holds the
// physical address of the root page table.
pub fn r_satp() -> usize {
    let mut x: usize;
    unsafe { asm!("csrr {}, satp", out(reg) x) }
    x
}

// use riscv's Sv39 page table scheme.
pub const SATP_SV39: usize = 8 << 60;
#[macro_export]
macro_rules! MAKE_SATP {
    ( $x:expr ) => {
        $crate::riscv::SATP_SV39 | (($x) >> 12)
    };
}

pub fn w_satp(x: usize) {
    unsafe { asm!("csrw satp, {}", in(reg) x) }
}

pub fn w_mscratch(x: usize) {
    unsafe { asm!("csrw mscratch, {}", in(reg) x) }
}

// Supervisor Trap Cause
pub fn r_scause() -> u64 {
    let mut x: u64;
    unsafe { asm!("csrr {}, scause", out(reg) x) }
    x
}

// Supervisor Trap Value
pub fn r_stval() -> u64 {
    let mut x: u64;
    unsafe { asm!("csrr {}, stval", out(reg) x) }
    x
}

// Machine-mode Counter-Enable
pub fn r_mcounteren() -> u64 {
    let mut x: u64;
    unsafe { asm!("csrr {}, mcounteren", out(reg) x) }
    x
}

pub fn w_mcounteren(x: u64) {
    unsafe { asm!("csrw mcounteren, {}", in(reg) x) }
}

// machine-mode cycle counter
pub fn r_time() -> u64 {
    let mut x: u64;
    unsafe { asm!("csrr {}, time", out(reg) x) }
    x
}

// enable/disable device interrupts on this hart.
pub fn intr_on() {
    w_sstatus(r_sstatus() | SSTATUS_SIE);
}

pub fn intr_off() {
    w_sstatus(r_sstatus() & !SSTATUS_SIE);
}

pub fn intr_get() -> bool {
    (r_sstatus() & SSTATUS_SIE) != 0
}

pub fn r_sp() -> u64 {
    let mut x: u64;
    unsafe { asm!("mv {}, sp", out(reg) x) }
    x
}

// xv6 keeps this hart's id in tp, the thread pointer, for cpuid().
pub fn r_tp() -> u64 {
    let mut x: u64;
    unsafe { asm!("mv {}, tp", out(reg) x) }
    x
}

pub fn w_tp(x: u64) {
    unsafe { asm!("mv tp, {}", in(reg) x) }
}

pub fn r_ra() -> u64 {
    let mut x: u64;
    unsafe { asm!("mv {}, ra", out(reg) x) }
    x
}

// flush the TLB.
pub fn sfence_vma() {
    unsafe { asm!("sfence.vma zero, zero") }
}

bitflags! {
    /// Page table entry permission/validity bits. `VALID` alone (no R/W/X)
    /// marks an interior node; {R,W,X} all clear with VALID set is the
    /// "points at a child table" encoding, everything else is a leaf.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct PteFlags: usize {
        const VALID = 1 << 0;
        const READ  = 1 << 1;
        const WRITE = 1 << 2;
        const EXEC  = 1 << 3;
        const USER  = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

impl PteFlags {
    /// RWX bits only, used to tell interior nodes (none set) from leaves.
    pub fn perm(self) -> PteFlags {
        self & (PteFlags::READ | PteFlags::WRITE | PteFlags::EXEC)
    }

    pub fn is_leaf(self) -> bool {
        !self.perm().is_empty()
    }
}

/// VPN = Virtual Page Number, PPN = Physical Page Number.
/// Sv39 virtual address: | (9) level-2 VPN | (9) level-1 VPN | (9) level-0 VPN | (12) offset |
/// PTE: | (26) reserved | (44) PPN | (2) RSW | D A G U X W R V |
#[repr(transparent)]
#[derive(Copy, Clone)]
pub struct Pte(pub usize);

impl Pte {
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & 0x3FF)
    }

    pub fn is_valid(&self) -> bool {
        self.flags().contains(PteFlags::VALID)
    }
}

pub const PTE_SIZE: usize = PGSIZE / 8;

/// One node of the three-level Sv39 page table: 512 PTEs, one physical
/// page.
#[repr(C)]
pub struct PageTable(pub [Pte; PTE_SIZE]);

pub const PGSIZE: usize = 4096; // bytes per page
pub const PGSHIFT: usize = 12; // bits of offset within a page

#[macro_export]
macro_rules! PGROUNDUP {
    ( $sz:expr ) => {
        (($sz) as usize + $crate::riscv::PGSIZE - 1) & !($crate::riscv::PGSIZE - 1)
    };
}
#[macro_export]
macro_rules! PGROUNDDOWN {
    ( $a:expr ) => {
        (($a) as usize) & !($crate::riscv::PGSIZE - 1)
    };
}

// legacy bit constants, kept for call sites that build permission
// masks out of plain usize arithmetic (e.g. ELF flag translation).
pub const PTE_V: usize = PteFlags::VALID.bits();
pub const PTE_R: usize = PteFlags::READ.bits();
pub const PTE_W: usize = PteFlags::WRITE.bits();
pub const PTE_X: usize = PteFlags::EXEC.bits();
pub const PTE_U: usize = PteFlags::USER.bits();

// shift a physical address to the right place for a PTE.
#[macro_export]
macro_rules! PA2PTE {
    ( $pa:expr ) => {
        (($pa) as usize >> 12) << 10
    };
}

#[macro_export]
macro_rules! PTE2PA {
    ( $pte:expr ) => {
        (($pte) as usize >> 10) << 12
    };
}

#[macro_export]
macro_rules! PTE_FLAGS {
    ( $pte:expr ) => {
        ($pte) & 0x3FF
    };
}

// extract the three 9-bit page table indices from a virtual address.
pub const PXMASK: usize = 0x1FF; // 9 bits
#[macro_export]
macro_rules! PXSHIFT {
    ( $level:expr ) => {
        $crate::riscv::PGSHIFT + (9 * ($level))
    };
}
#[macro_export]
macro_rules! PX {
    ( $level:expr, $va:expr ) => {
        (($va) >> $crate::PXSHIFT!($level)) & $crate::riscv::PXMASK
    };
}

// one past the highest possible virtual address. Sv39 actually allows
// one more bit, but MAXVA stops short of it so addresses never need
// sign-extension.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

/// Atomic test-and-set: swap `val` into `*ptr`, return the old value,
/// with acquire ordering. Backs Spinlock::acquire's spin-wait. Plain
/// `bool`/pointer fields (instead of `core::sync::atomic` types) are
/// what let `Spinlock` stay `Copy`, which the process and CPU tables
/// need for their const array initializers.
pub fn sync_lock_test_and_set(ptr: *mut u32, val: u32) -> u32 {
    let ret: u32;
    unsafe { asm!("amoswap.w.aq {0}, {1}, ({2})", out(reg) ret, in(reg) val, in(reg) ptr) }
    ret
}

/// Atomic release-ordered store of zero, used by Spinlock::release.
pub fn sync_lock_release(ptr: *mut u32) {
    unsafe { asm!("amoswap.w.rl zero, zero, ({0})", in(reg) ptr) }
}

pub fn sync_synchronize() {
    unsafe { asm!("fence iorw, iorw") }
}

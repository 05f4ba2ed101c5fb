// The RISC-V Platform-Level Interrupt Controller (PLIC) multiplexes
// external device interrupts (UART, virtio disk) onto each hart's
// single external-interrupt line. Claim/complete hands exactly one
// pending IRQ to the claiming hart at a time.

use crate::memlayout::{PLIC, UART0_IRQ, VIRTIO0_IRQ};
use crate::proc::cpuid;
use crate::{PLIC_MCLAIM, PLIC_SCLAIM, PLIC_SENABLE, PLIC_SPRIORITY};

unsafe fn write_reg(addr: usize, val: u32) {
    (addr as *mut u32).write_volatile(val);
}

unsafe fn read_reg(addr: usize) -> u32 {
    (addr as *const u32).read_volatile()
}

/// Called once, from hart 0: set the global priority of the two
/// devices this kernel drives. Priority 0 means "never interrupt", so
/// anything we want delivered needs at least 1.
pub fn plicinit() {
    unsafe {
        write_reg(PLIC + UART0_IRQ * 4, 1);
        write_reg(PLIC + VIRTIO0_IRQ * 4, 1);
    }
}

/// Called by every hart: enable the two device interrupts for this
/// hart in supervisor mode, and set this hart's threshold to 0 so it
/// sees every enabled priority.
pub fn plicinithart() {
    let hart = cpuid();
    unsafe {
        write_reg(
            PLIC_SENABLE!(hart),
            ((1 << UART0_IRQ) | (1 << VIRTIO0_IRQ)) as u32,
        );
        write_reg(PLIC_SPRIORITY!(hart), 0);
    }
}

/// Ask the PLIC which interrupt, if any, is ready for this hart.
pub fn plic_claim() -> u32 {
    let hart = cpuid();
    unsafe { read_reg(PLIC_SCLAIM!(hart)) }
}

/// Tell the PLIC this hart is done servicing `irq`, so it can be
/// claimed again once it next fires.
pub fn plic_complete(irq: u32) {
    let hart = cpuid();
    unsafe {
        write_reg(PLIC_SCLAIM!(hart), irq);
    }
}

#![no_std]
#![no_main]

mod asm;
mod bio;
mod buf;
mod console;
mod elf;
mod exec;
mod file;
mod fs;
mod kalloc;
mod log;
mod memlayout;
mod param;
mod pipe;
mod plic;
mod printf;
mod proc;
mod riscv;
mod sleeplock;
mod spinlock;
mod stat;
mod start;
mod string;
mod syscall;
mod trap;
mod uart;
mod virtio;
mod vm;

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::kalloc::KMem;
use crate::printf::{Printer, PRINTER};
use crate::proc::cpuid;
use crate::riscv::sync_synchronize;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    unsafe { PRINTER.set_panicked() };
    printf!("kernel panic on hart {}: ", cpuid());
    if let Some(loc) = info.location() {
        printf!("{}:{}: ", loc.file(), loc.line());
    }
    printf!("{}\n", info.message());
    loop {
        unsafe { core::arch::asm!("wfi") }
    }
}

static STARTED: AtomicBool = AtomicBool::new(false);

/// Entered once per hart, in supervisor mode, with paging still off and
/// a kernel stack (not this hart's boot stack) already active courtesy
/// of start.rs. Hart 0 brings every subsystem up in dependency order;
/// the rest spin until it's done, then bring up only the per-hart
/// pieces (page table, trap vector, PLIC context) before joining the
/// scheduler.
#[no_mangle]
pub extern "C" fn kmain() -> ! {
    if cpuid() == 0 {
        Printer::init();
        printf::init_logger();
        printf!("\nkernel is booting...\n\n");

        KMem::kinit(); // physical page allocator
        vm::kvminit(); // create kernel page table
        vm::kvminithart(); // turn on paging

        proc::procinit(); // process table

        trap::trapinit(); // trap vectors
        trap::trapinithart(); // install kernel trap vector

        plic::plicinit(); // set up interrupt controller
        plic::plicinithart(); // ask PLIC for device interrupts

        bio::binit(); // buffer cache
        file::file::fileinit(); // file table

        uart::uart_init();
        console::Console::init();

        virtio::virtio_disk::virtio_disk_init(); // emulated hard disk

        proc::userinit(); // first user process

        sync_synchronize();
        STARTED.store(true, Ordering::Relaxed);
        printf!("\nboot successful, hart 0 entering scheduler\n");
    } else {
        while !STARTED.load(Ordering::Relaxed) {
            core::hint::spin_loop();
        }
        sync_synchronize();
        printf!("hart {} starting\n", cpuid());

        vm::kvminithart(); // turn on paging
        trap::trapinithart(); // install kernel trap vector
        plic::plicinithart(); // ask PLIC for device interrupts
    }

    proc::scheduler();
}

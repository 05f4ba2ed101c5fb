// Hand-written RISC-V assembly the Rust code above can't express:
// the kernel entry stub, the user/kernel trap vectors, and the
// context-switch routine. Pulled into the binary verbatim via
// global_asm!; the symbols they define are declared `extern "C"`
// at their Rust call sites (proc.rs, trap.rs, vm.rs).

core::arch::global_asm!(include_str!("entry.S"));
core::arch::global_asm!(include_str!("kernelvec.S"));
core::arch::global_asm!(include_str!("trampoline.S"));
core::arch::global_asm!(include_str!("switch.S"));

// Low-level driver for the qemu "virt" 16550a-compatible UART.
//
// Output is double-buffered: uart_putc() queues into a small ring and
// returns immediately (sleeping only if the ring is momentarily full),
// while the "transmit done" interrupt drains one queued byte per
// interrupt via uart_start(). uart_putc_sync() bypasses the ring
// entirely for places that must not sleep (panic, the console's own
// echo of a character still being typed).

use crate::memlayout::UART0;
use crate::proc::{sleep, wakeup};
use crate::spinlock::Spinlock;

const RHR: usize = 0; // receive holding register (read)
const THR: usize = 0; // transmit holding register (write)
const IER: usize = 1; // interrupt enable register
const IER_RX_ENABLE: u8 = 1 << 0;
const IER_TX_ENABLE: u8 = 1 << 1;
const FCR: usize = 2; // FIFO control register
const FCR_FIFO_ENABLE: u8 = 1 << 0;
const FCR_FIFO_CLEAR: u8 = 3 << 1; // clear the content of the two FIFOs
const ISR: usize = 2; // interrupt status register
const LCR: usize = 3; // line control register
const LCR_EIGHT_BITS: u8 = 3;
const LCR_BAUD_LATCH: u8 = 1 << 7; // special mode to set baud rate
const LSR: usize = 5; // line status register
const LSR_RX_READY: u8 = 1 << 0; // input is waiting to be read from RHR
const LSR_TX_IDLE: u8 = 1 << 5; // THR can accept another character to send

fn reg(r: usize) -> *mut u8 {
    (UART0 + r) as *mut u8
}

fn write_reg(r: usize, v: u8) {
    unsafe { reg(r).write_volatile(v) }
}

fn read_reg(r: usize) -> u8 {
    unsafe { reg(r).read_volatile() }
}

const UART_TX_BUF_SIZE: usize = 32;

struct UartState {
    tx_lock: Spinlock,
    // circular buffer of bytes queued for transmission
    tx_buf: [u8; UART_TX_BUF_SIZE],
    tx_w: usize, // next empty slot to fill
    tx_r: usize, // next full slot to send
}

static mut UART: UartState = UartState {
    tx_lock: Spinlock::init_lock("uart"),
    tx_buf: [0; UART_TX_BUF_SIZE],
    tx_w: 0,
    tx_r: 0,
};

pub fn uart_init() {
    write_reg(IER, 0x00);

    write_reg(LCR, LCR_BAUD_LATCH);
    write_reg(0, 0x03); // LSB for baud rate of 38.4K
    write_reg(1, 0x00); // MSB

    write_reg(LCR, LCR_EIGHT_BITS);

    write_reg(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);

    write_reg(IER, IER_TX_ENABLE | IER_RX_ENABLE);
}

/// Queue a byte for transmission, blocking if the ring is full. Safe
/// to call with or without interrupts enabled; never called from an
/// interrupt handler itself (use uart_putc_sync there).
pub fn uart_putc(c: u8) {
    unsafe {
        UART.tx_lock.acquire();
        while UART.tx_w == UART.tx_r + UART_TX_BUF_SIZE {
            // buffer full: wait for uart_start() to drain a slot.
            sleep(
                core::ptr::addr_of!(UART.tx_r) as usize,
                &UART.tx_lock,
            );
        }
        UART.tx_buf[UART.tx_w % UART_TX_BUF_SIZE] = c;
        UART.tx_w += 1;
        uart_start();
        UART.tx_lock.release();
    }
}

/// Write directly to the UART, polling for the THR to go idle. Used
/// by panic() and kernel printf() before/without interrupts, so it
/// must not depend on any interrupt ever firing again.
pub fn uart_putc_sync(c: u8) {
    crate::spinlock::push_off();
    unsafe {
        while (read_reg(LSR) & LSR_TX_IDLE) == 0 {
            core::hint::spin_loop();
        }
        write_reg(THR, c);
    }
    crate::spinlock::pop_off();
}

/// If the transmitter is idle and a byte is queued, start it going.
/// Called both after queuing a new byte and from the transmit-complete
/// interrupt; `UART.tx_lock` must already be held.
fn uart_start() {
    unsafe {
        if UART.tx_w == UART.tx_r {
            return; // nothing queued.
        }
        if (read_reg(LSR) & LSR_TX_IDLE) == 0 {
            return; // UART busy with the previous byte.
        }
        let c = UART.tx_buf[UART.tx_r % UART_TX_BUF_SIZE];
        UART.tx_r += 1;
        // a waiting uart_putc() may now have room.
        wakeup(core::ptr::addr_of!(UART.tx_r) as usize);
        write_reg(THR, c);
    }
}

/// Read one input character, or None if the RHR has nothing waiting.
fn uart_getc() -> Option<u8> {
    if (read_reg(LSR) & LSR_RX_READY) != 0 {
        Some(read_reg(RHR))
    } else {
        None
    }
}

/// Handle a UART interrupt: drain any received characters into the
/// console line discipline, then let a pending transmission proceed.
pub fn uart_intr() {
    loop {
        match uart_getc() {
            Some(c) => unsafe { crate::console::CONSOLE.consoleintr(c) },
            None => break,
        }
    }

    unsafe {
        UART.tx_lock.acquire();
        uart_start();
        UART.tx_lock.release();
    }
}

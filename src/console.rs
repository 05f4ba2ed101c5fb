// Console input/output.
//
// A single input queue consumed a line at a time: consoleintr() is
// called by the UART interrupt handler one character at a time and
// buffers/echoes it; console read() blocks until a full line (or EOF)
// has accumulated, matching a real terminal's line discipline.

use core::fmt;

use crate::file::{Devsw, CONSOLE as CONSOLE_MAJOR};
use crate::param::NDEV;
use crate::proc::{either_copyin, either_copyout, killed, wakeup};
use crate::spinlock::Spinlock;
use crate::uart::{uart_putc, uart_putc_sync};

const INPUT_BUF: usize = 128;

const BACKSPACE: u8 = 0x08;
const CTRL_D: u8 = 0x04; // end-of-file
const CTRL_U: u8 = 0x15; // kill line
const CTRL_H: u8 = 0x08; // backspace
const CTRL_P: u8 = 0x10; // procdump
const DEL: u8 = 0x7f;

fn ctrl(c: u8) -> u8 {
    c - b'@'
}

pub struct Console {
    lock: Spinlock,
    buf: [u8; INPUT_BUF],
    // buf[r..w) is unconsumed input; buf[w..e) is being edited by the
    // user before the next newline/EOF/full-buffer flush.
    r: usize,
    w: usize,
    e: usize,
}

pub static mut CONSOLE: Console = Console::create();

unsafe impl Sync for Console {}

impl Console {
    const fn create() -> Self {
        Console {
            lock: Spinlock::init_lock("cons"),
            buf: [0; INPUT_BUF],
            r: 0,
            w: 0,
            e: 0,
        }
    }

    pub fn init() {
        unsafe {
            crate::file::DEVSW[CONSOLE_MAJOR] = Some(&CONSOLE);
        }
        let _ = NDEV;
    }

    fn putc(&self, c: u8) {
        if c == BACKSPACE {
            uart_putc_sync(0x08);
            uart_putc_sync(b' ');
            uart_putc_sync(0x08);
        } else {
            uart_putc_sync(c);
        }
    }

    /// Called by the UART interrupt handler for every received byte.
    /// Does erase/kill-line editing and echo; pushes a char onto the
    /// consumer-visible part of the buffer when the line is "done"
    /// (newline, Ctrl-D, or the edit buffer is full).
    pub fn consoleintr(&mut self, c: u8) {
        self.lock.acquire();

        match c {
            c if c == ctrl(b'P') || c == CTRL_P => {
                crate::proc::procdump();
            }
            c if c == ctrl(b'U') || c == CTRL_U => {
                while self.e != self.w && self.buf[(self.e - 1) % INPUT_BUF] != b'\n' {
                    self.e -= 1;
                    self.putc(BACKSPACE);
                }
            }
            c if c == ctrl(b'H') || c == CTRL_H || c == DEL => {
                if self.e != self.w {
                    self.e -= 1;
                    self.putc(BACKSPACE);
                }
            }
            _ => {
                if c != 0 && self.e - self.r < INPUT_BUF {
                    let c = if c == b'\r' { b'\n' } else { c };

                    self.putc(c);

                    self.buf[self.e % INPUT_BUF] = c;
                    self.e += 1;

                    if c == b'\n' || c == ctrl(b'D') || c == CTRL_D || self.e - self.r == INPUT_BUF
                    {
                        self.w = self.e;
                        wakeup(core::ptr::addr_of!(self.r) as usize);
                    }
                }
            }
        }

        self.lock.release();
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            uart_putc(b);
        }
        Ok(())
    }
}

impl Devsw for Console {
    /// Read up to `n` bytes from the console into user/kernel memory
    /// at `dst`, blocking until at least a newline's worth, EOF, or
    /// `n` bytes are available. Returns bytes actually copied, which
    /// may be 0 on EOF with nothing buffered.
    fn read(&self, dst: usize, n: usize, user_dst: bool) -> i32{
        let target = n;
        let mut n = n;
        let mut dst = dst;
        let console = unsafe { &mut *(self as *const Self as *mut Self) };

        console.lock.acquire();
        while console.r == console.w {
            if killed(crate::proc::myproc()) {
                console.lock.release();
                return -1;
            }
            crate::proc::sleep(core::ptr::addr_of!(console.r) as usize, &console.lock);
        }

        let mut copied = 0usize;
        while n > 0 {
            if console.r == console.w {
                break;
            }
            let c = console.buf[console.r % INPUT_BUF];
            console.r += 1;

            if c == ctrl(b'D') || c == CTRL_D {
                if copied < target {
                    // Push the EOF marker back so the next read sees
                    // it immediately and returns 0.
                    console.r -= 1;
                }
                break;
            }

            if either_copyout(user_dst, dst, &[c]).is_err() {
                break;
            }
            dst += 1;
            n -= 1;
            copied += 1;

            if c == b'\n' {
                break;
            }
        }
        console.lock.release();

        copied as i32
    }

    /// Write `n` bytes from user/kernel memory at `src` to the UART,
    /// one at a time.
    fn write(&self, src: usize, n: usize, user_src: bool) -> i32 {
        for i in 0..n {
            let mut byte = [0u8; 1];
            if either_copyin(&mut byte, user_src, src + i).is_err() {
                return i as i32;
            }
            uart_putc(byte[0]);
        }
        n as i32
    }
}

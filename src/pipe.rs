// Anonymous pipes: a fixed-size ring buffer shared between a reader
// and a writer file descriptor, synchronized with a spinlock and the
// sleep/wakeup channel mechanism (one channel for "space freed up",
// one for "data available").

use crate::file::file::{filealloc, fileclose};
use crate::file::FDType;
use crate::file::File;
use crate::kalloc::KMEM;
use crate::proc::{either_copyin, either_copyout, killed, myproc, sleep, wakeup};
use crate::spinlock::Spinlock;

const PIPESIZE: usize = 512;

pub struct Pipe {
    lock: Spinlock,
    data: [u8; PIPESIZE],
    nread: u32,  // number of bytes read
    nwrite: u32, // number of bytes written
    readopen: bool,
    writeopen: bool,
}

impl Pipe {
    /// Allocate a pipe's backing page and wire up a pair of File
    /// descriptors (read end, write end) pointing at it.
    pub fn alloc() -> Option<(*mut File, *mut File)> {
        let rf = filealloc()?;
        let wf = match filealloc() {
            Some(wf) => wf,
            None => {
                fileclose(rf as *mut File);
                return None;
            }
        };

        let pi: *mut Pipe = unsafe { KMEM.kalloc() };
        if pi.is_null() {
            fileclose(rf as *mut File);
            fileclose(wf as *mut File);
            return None;
        }
        unsafe {
            *pi = Pipe {
                lock: Spinlock::init_lock("pipe"),
                data: [0; PIPESIZE],
                nread: 0,
                nwrite: 0,
                readopen: true,
                writeopen: true,
            };
        }

        rf.file_type = FDType::FD_PIPE;
        rf.readable = true;
        rf.writable = false;
        rf.pipe = Some(pi);

        wf.file_type = FDType::FD_PIPE;
        wf.readable = false;
        wf.writable = true;
        wf.pipe = Some(pi);

        Some((rf as *mut File, wf as *mut File))
    }

    pub fn close(self: &mut Self, writable: bool) {
        self.lock.acquire();
        if writable {
            self.writeopen = false;
            wakeup(core::ptr::addr_of!(self.nread) as usize);
        } else {
            self.readopen = false;
            wakeup(core::ptr::addr_of!(self.nwrite) as usize);
        }
        let both_closed = !self.readopen && !self.writeopen;
        self.lock.release();
        if both_closed {
            unsafe { KMEM.kfree(self as *mut Pipe) };
        }
    }

    /// Write `n` bytes starting at `addr` (a user virtual address when
    /// `user_src`, otherwise a kernel address) into the ring, blocking
    /// while it's full and a reader remains.
    pub fn write(self: &mut Self, addr: usize, n: usize, user_src: bool) -> i32 {
        let mut written = 0usize;
        self.lock.acquire();
        while written < n {
            if !self.readopen || killed(myproc()) {
                self.lock.release();
                return -1;
            }
            if self.nwrite == self.nread + PIPESIZE as u32 {
                wakeup(core::ptr::addr_of!(self.nread) as usize);
                sleep(core::ptr::addr_of!(self.nwrite) as usize, &self.lock);
                continue;
            }
            let mut byte = [0u8; 1];
            if either_copyin(&mut byte, user_src, addr + written).is_err() {
                break;
            }
            let idx = (self.nwrite as usize) % PIPESIZE;
            self.data[idx] = byte[0];
            self.nwrite += 1;
            written += 1;
        }
        wakeup(core::ptr::addr_of!(self.nread) as usize);
        self.lock.release();
        written as i32
    }

    /// Read up to `n` bytes into `addr`, blocking until at least one
    /// byte is available, the writer has hung up, or the caller is
    /// killed.
    pub fn read(self: &mut Self, addr: usize, n: usize, user_dst: bool) -> i32 {
        self.lock.acquire();
        while self.nread == self.nwrite && self.writeopen {
            if killed(myproc()) {
                self.lock.release();
                return -1;
            }
            sleep(core::ptr::addr_of!(self.nread) as usize, &self.lock);
        }
        let mut copied = 0usize;
        while copied < n && self.nread != self.nwrite {
            let idx = (self.nread as usize) % PIPESIZE;
            let c = self.data[idx];
            if either_copyout(user_dst, addr + copied, &[c]).is_err() {
                break;
            }
            self.nread += 1;
            copied += 1;
        }
        wakeup(core::ptr::addr_of!(self.nwrite) as usize);
        self.lock.release();
        copied as i32
    }
}

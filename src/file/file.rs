use crate::file::FDType::{FD_DEVICE, FD_INODE, FD_NONE, FD_PIPE};
use crate::file::{File, DEVSW};
use crate::log::{begin_op, end_op};
use crate::param::{NDEV, NFILE};
use crate::spinlock::Spinlock;

struct FTable {
    lock: Spinlock,
    file: [File; NFILE]
}

static mut FTABLE: FTable = FTable {
    lock: Spinlock::init_lock("ftable"),
    file: [File::create(); NFILE],
};

pub fn fileinit() {
    // empty due to FTABLE has already been initialized
}

// Allocate a file structure.
pub fn filealloc() -> Option<&'static mut File> {
    unsafe {
        FTABLE.lock.acquire();
        for f in &mut FTABLE.file {
            if f.ref_cnt == 0 {
                f.ref_cnt = 1;
                FTABLE.lock.release();
                return Some(f);
            }
        }

        FTABLE.lock.release();
        return None;
    }
}

// Increment ref count for file f, returning the same pointer back so
// callers can chain it straight into a new fd slot.
pub fn filedup(f: *mut File) -> *mut File {
    unsafe {
        FTABLE.lock.acquire();
        let fr = f.as_mut().unwrap();
        if fr.ref_cnt < 1 {
            panic!("filedup")
        }

        fr.ref_cnt += 1;
        FTABLE.lock.release();
    }
    f
}

// Close file f.  (Decrement ref count, close when reaches 0.)
pub fn fileclose(f: *mut File) {
    unsafe {
        FTABLE.lock.acquire();
        let f = f.as_mut().unwrap();
        if f.ref_cnt < 1 {
            panic!("fileclose");
        }

        f.ref_cnt -= 1;
        if f.ref_cnt > 0 {
            FTABLE.lock.release();
            return;
        }

        let file_type = f.file_type;
        let pipe = f.pipe;
        let writable = f.writable;
        let ip = f.ip;

        f.ref_cnt = 0;
        f.file_type = FD_NONE;
        FTABLE.lock.release();

        if file_type == FD_PIPE {
            (*pipe.unwrap()).close(writable);
        } else if file_type == FD_INODE || file_type == FD_DEVICE {
            begin_op();
            (*ip.unwrap()).iput();
            end_op();
        }
    }
}

/// Read up to `n` bytes from `f` into `addr` (a user virtual address
/// when `user_dst`, otherwise a kernel address), dispatching on the
/// file's underlying kind. Returns bytes read, or -1 on error.
pub fn fileread(f: *mut File, addr: usize, n: usize, user_dst: bool) -> i32 {
    let f = unsafe { &mut *f };
    if !f.readable {
        return -1;
    }

    match f.file_type {
        FD_PIPE => unsafe { (*f.pipe.unwrap()).read(addr, n, user_dst) },
        FD_DEVICE => {
            if f.major < 0 || f.major as usize >= NDEV {
                return -1;
            }
            match unsafe { DEVSW[f.major as usize] } {
                Some(dev) => dev.read(addr, n, user_dst),
                None => -1,
            }
        }
        FD_INODE => {
            let ip = unsafe { &mut *f.ip.unwrap() };
            ip.ilock();
            let r = ip.readi(user_dst, addr as *mut u8, f.off, n);
            f.off += r as u32;
            ip.iunlock();
            r as i32
        }
        FD_NONE => -1,
    }
}

/// Write `n` bytes from `addr` to `f`, dispatching on the file's
/// underlying kind. Returns bytes written, or -1 on error.
pub fn filewrite(f: *mut File, addr: usize, n: usize, user_src: bool) -> i32 {
    let f = unsafe { &mut *f };
    if !f.writable {
        return -1;
    }

    match f.file_type {
        FD_PIPE => unsafe { (*f.pipe.unwrap()).write(addr, n, user_src) },
        FD_DEVICE => {
            if f.major < 0 || f.major as usize >= NDEV {
                return -1;
            }
            match unsafe { DEVSW[f.major as usize] } {
                Some(dev) => dev.write(addr, n, user_src),
                None => -1,
            }
        }
        FD_INODE => {
            // Write in block-sized chunks so one transaction never
            // outgrows the log's per-operation block budget.
            const MAX: usize = 1024; // BSIZE worth of data per op
            let ip = unsafe { &mut *f.ip.unwrap() };
            let mut i = 0;
            while i < n {
                let chunk = (n - i).min(MAX);
                begin_op();
                ip.ilock();
                let r = ip.writei(user_src, (addr + i) as *mut u8, f.off, chunk);
                ip.iunlock();
                end_op();
                if r < 0 || r as usize != chunk {
                    break;
                }
                f.off += r as u32;
                i += chunk;
            }
            if i == n {
                i as i32
            } else {
                -1
            }
        }
        FD_NONE => -1,
    }
}

// Sleeping locks: like a spinlock, but the holder can block (e.g. on
// disk I/O) without spinning the hart. Built on top of a spinlock plus
// the sleep/wakeup channel mechanism, so acquiring one may context
// switch away entirely instead of just busy-waiting.

use crate::proc::{myproc, sleep, wakeup};
use crate::spinlock::Spinlock;

#[derive(Copy, Clone)]
pub struct Sleeplock {
    locked: bool,
    lk: Spinlock,

    // for debugging:
    name: &'static str,
    pid: i32,
}

impl Sleeplock {
    pub const fn init_lock(name: &'static str) -> Self {
        Sleeplock {
            locked: false,
            lk: Spinlock::init_lock(name),
            name,
            pid: 0,
        }
    }

    /// Block until the lock is free, then take it. Takes `&self` (not
    /// `&mut self`) so it composes with the raw-pointer interior
    /// mutability the rest of the per-slot tables (inodes, buffers)
    /// use: the real exclusion comes from `locked`/`lk`, not from the
    /// borrow checker.
    pub fn acquire_sleep(&self) {
        let this = self.as_mut();
        this.lk.acquire();
        while this.locked {
            sleep(self as *const Self as usize, &this.lk);
        }
        this.locked = true;
        this.pid = myproc().map(|p| p.pid()).unwrap_or(0);
        this.lk.release();
    }

    pub fn release_sleep(&self) {
        let this = self.as_mut();
        this.lk.acquire();
        this.locked = false;
        this.pid = 0;
        wakeup(self as *const Self as usize);
        this.lk.release();
    }

    #[allow(clippy::mut_from_ref)]
    fn as_mut(&self) -> &mut Self {
        unsafe { &mut *(self as *const Self as *mut Self) }
    }

    pub fn holding_sleep(&self) -> bool {
        self.lk.acquire();
        let r = self.locked && self.pid == myproc().map(|p| p.pid()).unwrap_or(0);
        self.lk.release();
        r
    }
}

// Only ever reached through call sites that hold `lk` for any field
// access, like Spinlock itself.
unsafe impl Sync for Sleeplock {}

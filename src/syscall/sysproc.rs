// Process-control system calls. Each of these is a thin wrapper: the
// real logic lives in proc.rs, which is also what the scheduler and
// trap handler call directly.

use crate::proc::{self, exit, myproc};
use crate::syscall::syscall::{argaddr, argint};
use crate::trap::{clockintr_wait, ticks};

pub(crate) fn sys_fork() -> u64 {
    let pid = proc::fork();
    (pid as i64) as u64
}

pub(crate) fn sys_exit() -> u64 {
    let status = argint(0);
    exit(status);
}

pub(crate) fn sys_wait() -> u64 {
    let addr = argaddr(0);
    match proc::wait(addr) {
        Ok(pid) => (pid as i64) as u64,
        Err(()) => u64::MAX,
    }
}

pub(crate) fn sys_kill() -> u64 {
    let pid = argint(0);
    match proc::kill(pid) {
        Ok(()) => 0,
        Err(()) => u64::MAX,
    }
}

pub(crate) fn sys_getpid() -> u64 {
    match myproc() {
        Some(p) => p.pid() as u64,
        None => u64::MAX,
    }
}

pub(crate) fn sys_sbrk() -> u64 {
    let n = argint(0) as i64;
    let p = match myproc() {
        Some(p) => p,
        None => return u64::MAX,
    };
    let oldsz = p.sz();
    match proc::growproc(n) {
        Ok(()) => oldsz as u64,
        Err(()) => u64::MAX,
    }
}

pub(crate) fn sys_sleep() -> u64 {
    let n = argint(0);
    if n < 0 {
        return u64::MAX;
    }
    let target = ticks() + n as u64;
    while ticks() < target {
        if myproc().map(|p| p.killed_flag()).unwrap_or(true) {
            return u64::MAX;
        }
        clockintr_wait();
    }
    0
}

pub(crate) fn sys_uptime() -> u64 {
    ticks()
}

// File-system-related system calls: open/close/read/write/dup/pipe and
// the directory-tree operations (mkdir/mknod/link/unlink/chdir/exec).

use core::mem;

use crate::exec::exec;
use crate::file::fcntl::{O_CREATE, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY};
use crate::file::file::{fileclose, filealloc, filedup, fileread, filewrite};
use crate::file::FDType::{FD_DEVICE, FD_INODE};
use crate::file::{File, INode};
use crate::fs::fs::{dirlink, ialloc, link as fs_link, namei, nameiparent, unlink as fs_unlink};
use crate::kalloc::KMEM;
use crate::log::{begin_op, end_op};
use crate::param::{MAXARG, MAXPATH, NDEV, NOFILE};
use crate::pipe::Pipe;
use crate::proc::myproc;
use crate::riscv::PGSIZE;
use crate::stat::FileType;
use crate::stat::FileType::{T_DEVICE, T_DIR, T_FILE};
use crate::stat::Stat;
use crate::syscall::syscall::{argaddr, argint, argstr, fetchaddr, fetchstr};
use crate::vm::copyout;

fn path_bytes(path: &[u8]) -> &[u8] {
    let len = path.iter().position(|&b| b == 0).unwrap_or(path.len());
    &path[..len]
}

pub(crate) fn sys_exec() -> u64 {
    let mut uarg: usize = 0;
    let uargv = argaddr(1);

    let mut path: [u8; MAXPATH] = [0; MAXPATH];
    if argstr(0, &mut path) < 0 {
        return u64::MAX;
    }

    let mut argv: [Option<*mut u8>; MAXARG] = [None; MAXARG];
    let mut i = 0;
    let mut bad = false;
    loop {
        if i >= argv.len() {
            bad = true;
            break;
        }

        if fetchaddr(uargv + mem::size_of::<usize>() * i, &mut uarg) < 0 {
            bad = true;
            break;
        }

        if uarg == 0 {
            argv[i] = None;
            break;
        }

        let ptr: *mut u8 = unsafe { KMEM.kalloc() };
        if ptr.is_null() {
            bad = true;
            break;
        }
        argv[i] = Some(ptr);

        let buf = unsafe { core::slice::from_raw_parts_mut(ptr, PGSIZE) };
        if fetchstr(uarg, buf) < 0 {
            bad = true;
            break;
        }

        i += 1;
    }

    let ret = if !bad { exec(&path, &argv) } else { -1 };

    for slot in argv.iter() {
        match slot {
            Some(p) => unsafe { KMEM.kfree(*p) },
            None => break,
        }
    }

    (ret as i64) as u64
}

pub(crate) fn sys_open() -> u64 {
    let mut path: [u8; MAXPATH] = [0; MAXPATH];
    let omode = argint(1);
    if argstr(0, &mut path) < 0 {
        return u64::MAX;
    }
    let path = path_bytes(&path);

    begin_op();

    let ip: &mut INode;
    if omode & O_CREATE != 0 {
        ip = match create(path, T_FILE, 0, 0) {
            Some(ip) => ip,
            None => {
                end_op();
                return u64::MAX;
            }
        };
    } else {
        ip = match namei(path) {
            Some(ip) => ip,
            None => {
                end_op();
                return u64::MAX;
            }
        };
        ip.ilock();
        if ip.file_type == T_DIR && omode != O_RDONLY {
            ip.iunlockput();
            end_op();
            return u64::MAX;
        }
    }

    if ip.file_type == T_DEVICE && (ip.major < 0 || ip.major as usize >= NDEV) {
        ip.iunlockput();
        end_op();
        return u64::MAX;
    }

    let fptr: *mut File = match filealloc() {
        Some(f) => f,
        None => {
            ip.iunlockput();
            end_op();
            return u64::MAX;
        }
    };

    let fd = match fdalloc(fptr) {
        Some(fd) => fd,
        None => {
            fileclose(fptr);
            ip.iunlockput();
            end_op();
            return u64::MAX;
        }
    };

    let f = unsafe { &mut *fptr };
    if ip.file_type == T_DEVICE {
        f.file_type = FD_DEVICE;
        f.major = ip.major;
    } else {
        f.file_type = FD_INODE;
        f.off = 0;
    }
    f.readable = omode & O_WRONLY == 0;
    f.writable = (omode & O_WRONLY) != 0 || (omode & O_RDWR) != 0;

    if (omode & O_TRUNC) != 0 && ip.file_type == T_FILE {
        ip.itrunc();
    }

    ip.iunlock();
    f.ip = Some(ip as *mut INode);
    end_op();

    fd as u64
}

pub(crate) fn sys_mknod() -> u64 {
    begin_op();
    let major = argint(1) as i16;
    let minor = argint(2) as i16;

    let mut path = [0u8; MAXPATH];
    if argstr(0, &mut path) < 0 {
        end_op();
        return u64::MAX;
    }

    match create(path_bytes(&path), T_DEVICE, major, minor) {
        Some(ip) => {
            ip.iunlockput();
            end_op();
            0
        }
        None => {
            end_op();
            u64::MAX
        }
    }
}

pub(crate) fn sys_mkdir() -> u64 {
    begin_op();
    let mut path = [0u8; MAXPATH];
    if argstr(0, &mut path) < 0 {
        end_op();
        return u64::MAX;
    }

    match create(path_bytes(&path), T_DIR, 0, 0) {
        Some(ip) => {
            ip.iunlockput();
            end_op();
            0
        }
        None => {
            end_op();
            u64::MAX
        }
    }
}

pub(crate) fn sys_chdir() -> u64 {
    let p = match myproc() {
        Some(p) => p,
        None => return u64::MAX,
    };

    let mut path = [0u8; MAXPATH];
    if argstr(0, &mut path) < 0 {
        return u64::MAX;
    }

    begin_op();
    let ip = match namei(path_bytes(&path)) {
        Some(ip) => ip,
        None => {
            end_op();
            return u64::MAX;
        }
    };
    ip.ilock();
    if ip.file_type != T_DIR {
        ip.iunlockput();
        end_op();
        return u64::MAX;
    }
    ip.iunlock();

    if let Some(old) = p.cwd() {
        unsafe { (*old).iput() };
    }
    end_op();
    p.set_cwd(Some(ip as *mut INode));
    0
}

pub(crate) fn sys_unlink() -> u64 {
    let mut path = [0u8; MAXPATH];
    if argstr(0, &mut path) < 0 {
        return u64::MAX;
    }

    begin_op();
    let r = fs_unlink(path_bytes(&path));
    end_op();

    match r {
        Some(()) => 0,
        None => u64::MAX,
    }
}

pub(crate) fn sys_link() -> u64 {
    let mut new = [0u8; MAXPATH];
    let mut old = [0u8; MAXPATH];
    if argstr(0, &mut old) < 0 || argstr(1, &mut new) < 0 {
        return u64::MAX;
    }

    begin_op();
    let r = fs_link(path_bytes(&new), path_bytes(&old));
    end_op();

    match r {
        Some(()) => 0,
        None => u64::MAX,
    }
}

pub(crate) fn sys_close() -> u64 {
    let (fd, f) = match argfd(0) {
        Some(v) => v,
        None => return u64::MAX,
    };
    if let Some(p) = myproc() {
        p.ofile_mut()[fd] = None;
    }
    fileclose(f);
    0
}

pub(crate) fn sys_dup() -> u64 {
    let (_, f) = match argfd(0) {
        Some(v) => v,
        None => return u64::MAX,
    };
    let fd = match fdalloc(f) {
        Some(fd) => fd,
        None => return u64::MAX,
    };
    filedup(f);
    fd as u64
}

pub(crate) fn sys_read() -> u64 {
    let (_, f) = match argfd(0) {
        Some(v) => v,
        None => return u64::MAX,
    };
    let addr = argaddr(1);
    let n = argint(2);
    if n < 0 {
        return u64::MAX;
    }
    (fileread(f, addr, n as usize, true) as i64) as u64
}

pub(crate) fn sys_write() -> u64 {
    let (_, f) = match argfd(0) {
        Some(v) => v,
        None => return u64::MAX,
    };
    let addr = argaddr(1);
    let n = argint(2);
    if n < 0 {
        return u64::MAX;
    }
    (filewrite(f, addr, n as usize, true) as i64) as u64
}

pub(crate) fn sys_fstat() -> u64 {
    let (_, f) = match argfd(0) {
        Some(v) => v,
        None => return u64::MAX,
    };
    let addr = argaddr(1);
    let f = unsafe { &mut *f };
    let ip = match f.ip {
        Some(ip) => unsafe { &mut *ip },
        None => return u64::MAX,
    };

    let mut st = Stat::create();
    ip.ilock();
    ip.stat(&mut st);
    ip.iunlock();

    let p = match myproc() {
        Some(p) => p,
        None => return u64::MAX,
    };
    let bytes = unsafe {
        core::slice::from_raw_parts(&st as *const Stat as *const u8, mem::size_of::<Stat>())
    };
    match copyout(p.pagetable(), addr, bytes) {
        Ok(()) => 0,
        Err(()) => u64::MAX,
    }
}

pub(crate) fn sys_pipe() -> u64 {
    let fdarray = argaddr(0);
    let (rf, wf) = match Pipe::alloc() {
        Some(v) => v,
        None => return u64::MAX,
    };

    let p = match myproc() {
        Some(p) => p,
        None => {
            fileclose(rf);
            fileclose(wf);
            return u64::MAX;
        }
    };

    let fd0 = match fdalloc(rf) {
        Some(fd) => fd,
        None => {
            fileclose(rf);
            fileclose(wf);
            return u64::MAX;
        }
    };
    let fd1 = match fdalloc(wf) {
        Some(fd) => fd,
        None => {
            p.ofile_mut()[fd0] = None;
            fileclose(rf);
            fileclose(wf);
            return u64::MAX;
        }
    };

    let b0 = (fd0 as u32).to_ne_bytes();
    let b1 = (fd1 as u32).to_ne_bytes();
    let ok = copyout(p.pagetable(), fdarray, &b0).is_ok()
        && copyout(p.pagetable(), fdarray + mem::size_of::<u32>(), &b1).is_ok();
    if !ok {
        p.ofile_mut()[fd0] = None;
        p.ofile_mut()[fd1] = None;
        fileclose(rf);
        fileclose(wf);
        return u64::MAX;
    }

    0
}

// Create a new file-system entry named by `path`: either the file at
// the end of a fresh path (O_CREATE), a device node (mknod), or a
// directory (mkdir). Returns the new inode, locked.
fn create<'a>(path: &[u8], file_type: FileType, major: i16, minor: i16) -> Option<&'a mut INode> {
    let (dp, name) = nameiparent(path);
    let dp = dp?;
    dp.ilock();

    let mut poff = 0u32;
    if let Some(ip) = crate::fs::fs::dirlookup(dp, name, &mut poff) {
        dp.iunlockput();
        ip.ilock();
        if file_type == T_FILE && (ip.file_type == T_FILE || ip.file_type == T_DEVICE) {
            return Some(ip);
        }
        ip.iunlockput();
        return None;
    }

    let ip = match ialloc(dp.dev, file_type) {
        Some(ip) => ip,
        None => {
            dp.iunlockput();
            return None;
        }
    };
    ip.ilock();
    ip.major = major;
    ip.minor = minor;
    ip.nlink = 1;
    ip.iupdate();

    if file_type == T_DIR {
        // No ip.nlink += 1 for ".": avoid a cyclic reference count.
        if dirlink(ip, b".", ip.inum as u16).is_none() || dirlink(ip, b"..", dp.inum as u16).is_none() {
            ip.nlink = 0;
            ip.iupdate();
            ip.iunlockput();
            dp.iunlockput();
            return None;
        }
    }

    if dirlink(dp, name, ip.inum as u16).is_none() {
        ip.nlink = 0;
        ip.iupdate();
        ip.iunlockput();
        dp.iunlockput();
        return None;
    }

    if file_type == T_DIR {
        // Now that success is guaranteed, count the child's ".." entry.
        dp.nlink += 1;
        dp.iupdate();
    }

    dp.iunlockput();

    Some(ip)
}

// Allocate a file descriptor for the given file in the calling
// process's table. Takes over the file reference from the caller.
fn fdalloc(f: *mut File) -> Option<usize> {
    let p = myproc()?;
    let ofile = p.ofile_mut();
    for fd in 0..NOFILE {
        if ofile[fd].is_none() {
            ofile[fd] = Some(f);
            return Some(fd);
        }
    }
    None
}

// Resolve the nth system-call argument as a file descriptor, returning
// the fd and a pointer to the open File it names.
fn argfd(n: u8) -> Option<(usize, *mut File)> {
    let fd = argint(n);
    if fd < 0 || fd as usize >= NOFILE {
        return None;
    }
    let fd = fd as usize;
    let p = myproc()?;
    let f = p.ofile_mut()[fd]?;
    Some((fd, f))
}

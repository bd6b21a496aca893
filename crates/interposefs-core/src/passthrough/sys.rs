// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Thin safe wrappers over the descriptor-relative syscalls the
//! passthrough layer is built on. Every failure is surfaced as the raw
//! OS error; callers propagate the errno unchanged to the kernel.

use std::ffi::{CStr, CString, OsStr, OsString};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn check_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Converts a path component into a C string, rejecting interior NULs.
pub fn cstr(name: &OsStr) -> io::Result<CString> {
    CString::new(name.as_bytes()).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

/// The `/proc/self/fd/<fd>` alias of an open descriptor. Re-opening or
/// naming a path-only descriptor through this link preserves the
/// no-symlink-follow property of the original open.
pub fn proc_self_fd(fd: RawFd) -> CString {
    CString::new(format!("/proc/self/fd/{fd}")).expect("no interior NUL")
}

pub fn open(path: &OsStr, flags: libc::c_int) -> io::Result<OwnedFd> {
    let path = cstr(path)?;
    let fd = unsafe { libc::open(path.as_ptr(), flags) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Re-opens the object behind a path-only descriptor with real access
/// flags, via its /proc alias.
pub fn open_proc(fd: RawFd, flags: libc::c_int) -> io::Result<OwnedFd> {
    let proc_path = proc_self_fd(fd);
    let new = unsafe { libc::open(proc_path.as_ptr(), flags) };
    if new == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

pub fn openat(
    dir: BorrowedFd<'_>,
    name: &OsStr,
    flags: libc::c_int,
    mode: libc::mode_t,
) -> io::Result<OwnedFd> {
    let name = cstr(name)?;
    let fd = unsafe { libc::openat(dir.as_raw_fd(), name.as_ptr(), flags, mode) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// `fstatat(fd, "", AT_EMPTY_PATH | AT_SYMLINK_NOFOLLOW)`: stat the
/// object behind the descriptor itself.
pub fn fstatat_empty(fd: RawFd) -> io::Result<libc::stat> {
    let empty = unsafe { CStr::from_bytes_with_nul_unchecked(b"\0") };
    let mut st = MaybeUninit::<libc::stat>::uninit();
    check(unsafe {
        libc::fstatat(
            fd,
            empty.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    })?;
    Ok(unsafe { st.assume_init() })
}

pub fn fstat(fd: RawFd) -> io::Result<libc::stat> {
    let mut st = MaybeUninit::<libc::stat>::uninit();
    check(unsafe { libc::fstat(fd, st.as_mut_ptr()) })?;
    Ok(unsafe { st.assume_init() })
}

pub fn readlinkat_empty(fd: RawFd) -> io::Result<OsString> {
    let empty = unsafe { CStr::from_bytes_with_nul_unchecked(b"\0") };
    let mut buf = vec![0u8; libc::PATH_MAX as usize + 1];
    let len = check_size(unsafe {
        libc::readlinkat(
            fd,
            empty.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    })?;
    if len == buf.len() {
        return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
    }
    buf.truncate(len);
    Ok(OsString::from_vec(buf))
}

pub fn mkdirat(dir: BorrowedFd<'_>, name: &OsStr, mode: libc::mode_t) -> io::Result<()> {
    let name = cstr(name)?;
    check(unsafe { libc::mkdirat(dir.as_raw_fd(), name.as_ptr(), mode) })
}

pub fn mkfifoat(dir: BorrowedFd<'_>, name: &OsStr, mode: libc::mode_t) -> io::Result<()> {
    let name = cstr(name)?;
    check(unsafe { libc::mkfifoat(dir.as_raw_fd(), name.as_ptr(), mode) })
}

pub fn mknodat(
    dir: BorrowedFd<'_>,
    name: &OsStr,
    mode: libc::mode_t,
    rdev: libc::dev_t,
) -> io::Result<()> {
    let name = cstr(name)?;
    check(unsafe { libc::mknodat(dir.as_raw_fd(), name.as_ptr(), mode, rdev) })
}

/// Creates a unix-domain socket file at `name` under the directory. The
/// socket is bound only so the node exists in the source tree; nothing
/// ever listens on it.
pub fn bind_socket_at(dir: BorrowedFd<'_>, name: &OsStr) -> io::Result<()> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    // The socket is bound through the directory's /proc alias so the
    // node lands next to its siblings without mount-root path strings.
    let mut path = proc_self_fd(dir.as_raw_fd()).into_bytes();
    path.push(b'/');
    path.extend_from_slice(name.as_bytes());
    if path.len() >= addr.sun_path.len() {
        return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(path.iter()) {
        *dst = *src as libc::c_char;
    }
    let sock = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if sock == -1 {
        return Err(io::Error::last_os_error());
    }
    let sock = unsafe { OwnedFd::from_raw_fd(sock) };
    check(unsafe {
        libc::bind(
            sock.as_raw_fd(),
            std::ptr::addr_of!(addr).cast(),
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    })
}

pub fn symlinkat(target: &OsStr, dir: BorrowedFd<'_>, name: &OsStr) -> io::Result<()> {
    let target = cstr(target)?;
    let name = cstr(name)?;
    check(unsafe { libc::symlinkat(target.as_ptr(), dir.as_raw_fd(), name.as_ptr()) })
}

pub fn unlinkat(dir: BorrowedFd<'_>, name: &OsStr, flags: libc::c_int) -> io::Result<()> {
    let name = cstr(name)?;
    check(unsafe { libc::unlinkat(dir.as_raw_fd(), name.as_ptr(), flags) })
}

pub fn renameat(
    olddir: BorrowedFd<'_>,
    oldname: &OsStr,
    newdir: BorrowedFd<'_>,
    newname: &OsStr,
) -> io::Result<()> {
    let oldname = cstr(oldname)?;
    let newname = cstr(newname)?;
    check(unsafe {
        libc::renameat(
            olddir.as_raw_fd(),
            oldname.as_ptr(),
            newdir.as_raw_fd(),
            newname.as_ptr(),
        )
    })
}

/// Links the object behind `fd` (via its /proc alias) into `newdir`.
pub fn linkat_proc(fd: RawFd, newdir: BorrowedFd<'_>, newname: &OsStr) -> io::Result<()> {
    let proc_path = proc_self_fd(fd);
    let newname = cstr(newname)?;
    check(unsafe {
        libc::linkat(
            libc::AT_FDCWD,
            proc_path.as_ptr(),
            newdir.as_raw_fd(),
            newname.as_ptr(),
            libc::AT_SYMLINK_FOLLOW,
        )
    })
}

pub fn fchmod(fd: RawFd, mode: libc::mode_t) -> io::Result<()> {
    check(unsafe { libc::fchmod(fd, mode) })
}

/// chmod through the /proc alias of a path-only descriptor.
pub fn chmod_proc(fd: RawFd, mode: libc::mode_t) -> io::Result<()> {
    let proc_path = proc_self_fd(fd);
    check(unsafe { libc::chmod(proc_path.as_ptr(), mode) })
}

pub fn fchownat_empty(fd: RawFd, uid: libc::uid_t, gid: libc::gid_t) -> io::Result<()> {
    let empty = unsafe { CStr::from_bytes_with_nul_unchecked(b"\0") };
    check(unsafe {
        libc::fchownat(
            fd,
            empty.as_ptr(),
            uid,
            gid,
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    })
}

pub fn ftruncate(fd: RawFd, size: libc::off_t) -> io::Result<()> {
    check(unsafe { libc::ftruncate(fd, size) })
}

pub fn truncate_proc(fd: RawFd, size: libc::off_t) -> io::Result<()> {
    let proc_path = proc_self_fd(fd);
    check(unsafe { libc::truncate(proc_path.as_ptr(), size) })
}

pub fn futimens(fd: RawFd, times: &[libc::timespec; 2]) -> io::Result<()> {
    check(unsafe { libc::futimens(fd, times.as_ptr()) })
}

pub fn utimensat_proc(fd: RawFd, times: &[libc::timespec; 2]) -> io::Result<()> {
    let proc_path = proc_self_fd(fd);
    check(unsafe { libc::utimensat(libc::AT_FDCWD, proc_path.as_ptr(), times.as_ptr(), 0) })
}

pub fn pread(fd: RawFd, buf: &mut [u8], offset: libc::off_t) -> io::Result<usize> {
    check_size(unsafe { libc::pread(fd, buf.as_mut_ptr().cast(), buf.len(), offset) })
}

pub fn pwrite(fd: RawFd, buf: &[u8], offset: libc::off_t) -> io::Result<usize> {
    check_size(unsafe { libc::pwrite(fd, buf.as_ptr().cast(), buf.len(), offset) })
}

pub fn close(fd: RawFd) -> io::Result<()> {
    check(unsafe { libc::close(fd) })
}

/// `close(dup(fd))`: surfaces pending write errors without tearing down
/// the per-open descriptor, the classic flush implementation.
pub fn close_dup(fd: RawFd) -> io::Result<()> {
    let dup = unsafe { libc::dup(fd) };
    if dup == -1 {
        return Err(io::Error::last_os_error());
    }
    check(unsafe { libc::close(dup) })
}

pub fn fsync(fd: RawFd, datasync: bool) -> io::Result<()> {
    check(unsafe {
        if datasync {
            libc::fdatasync(fd)
        } else {
            libc::fsync(fd)
        }
    })
}

pub fn fallocate(
    fd: RawFd,
    mode: libc::c_int,
    offset: libc::off_t,
    length: libc::off_t,
) -> io::Result<()> {
    check(unsafe { libc::fallocate(fd, mode, offset, length) })
}

pub fn lseek(fd: RawFd, offset: libc::off_t, whence: libc::c_int) -> io::Result<libc::off_t> {
    let ret = unsafe { libc::lseek(fd, offset, whence) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

pub fn copy_file_range(
    fd_in: RawFd,
    offset_in: libc::off_t,
    fd_out: RawFd,
    offset_out: libc::off_t,
    len: usize,
    flags: u32,
) -> io::Result<usize> {
    let mut off_in = offset_in;
    let mut off_out = offset_out;
    check_size(unsafe {
        libc::copy_file_range(fd_in, &mut off_in, fd_out, &mut off_out, len, flags)
    })
}

pub fn fstatvfs(fd: RawFd) -> io::Result<libc::statvfs> {
    let mut st = MaybeUninit::<libc::statvfs>::uninit();
    check(unsafe { libc::fstatvfs(fd, st.as_mut_ptr()) })?;
    Ok(unsafe { st.assume_init() })
}

pub fn faccessat_proc(fd: RawFd, mask: libc::c_int) -> io::Result<()> {
    let proc_path = proc_self_fd(fd);
    check(unsafe { libc::faccessat(libc::AT_FDCWD, proc_path.as_ptr(), mask, 0) })
}

pub fn getxattr_proc(fd: RawFd, name: &OsStr, buf: &mut [u8]) -> io::Result<usize> {
    let proc_path = proc_self_fd(fd);
    let name = cstr(name)?;
    check_size(unsafe {
        libc::getxattr(
            proc_path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    })
}

pub fn setxattr_proc(fd: RawFd, name: &OsStr, value: &[u8], flags: libc::c_int) -> io::Result<()> {
    let proc_path = proc_self_fd(fd);
    let name = cstr(name)?;
    check(unsafe {
        libc::setxattr(
            proc_path.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            flags,
        )
    })
}

pub fn listxattr_proc(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let proc_path = proc_self_fd(fd);
    check_size(unsafe {
        libc::listxattr(proc_path.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
    })
}

pub fn removexattr_proc(fd: RawFd, name: &OsStr) -> io::Result<()> {
    let proc_path = proc_self_fd(fd);
    let name = cstr(name)?;
    check(unsafe { libc::removexattr(proc_path.as_ptr(), name.as_ptr()) })
}

pub fn fcntl_getlk(fd: RawFd, lock: &mut libc::flock) -> io::Result<()> {
    check(unsafe { libc::fcntl(fd, libc::F_GETLK, lock as *mut libc::flock) })
}

pub fn fcntl_setlk(fd: RawFd, lock: &libc::flock, sleep: bool) -> io::Result<()> {
    let cmd = if sleep { libc::F_SETLKW } else { libc::F_SETLK };
    check(unsafe { libc::fcntl(fd, cmd, lock as *const libc::flock) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn proc_alias_names_the_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let fd = open(dir.path().as_os_str(), libc::O_PATH).unwrap();
        let alias = proc_self_fd(fd.as_raw_fd());
        assert!(alias.to_str().unwrap().starts_with("/proc/self/fd/"));
        let st = fstatat_empty(fd.as_raw_fd()).unwrap();
        assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFDIR);
    }

    #[test]
    fn openat_resolves_relative_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x"), b"abc").unwrap();
        let dirfd = open(dir.path().as_os_str(), libc::O_PATH).unwrap();
        let fd = openat(dirfd.as_fd(), OsStr::new("x"), libc::O_RDONLY, 0).unwrap();
        let mut buf = [0u8; 8];
        let n = pread(fd.as_raw_fd(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"abc");
    }

    #[test]
    fn interior_nul_is_rejected() {
        let err = cstr(OsStr::new("a\0b")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }
}

//! Non-blocking socket natives
//!
//! Stream sockets over libc, never blocking the worker: any operation
//! that would block suspends with the fd so the scheduler's poll pass
//! wakes the thread when the socket is ready. Connect keeps its fd in an
//! async-progress record whose abort hook closes it if the thread dies
//! mid-connect.

use crate::heap::CFuncProgress;
use crate::interp::{NativeCtx, NativeOutcome};
use crate::program::{CLASS_RUNTIMEERROR, CLASS_TYPEERROR, CLASS_VALUEERROR};
use crate::scheduler::SuspendType;
use crate::value::{bytes_content, str_chars, ErrorInfo, Value};

fn type_error(msg: &str) -> NativeOutcome {
    NativeOutcome::Error(Box::new(ErrorInfo::new(CLASS_TYPEERROR, msg)))
}

fn runtime_error(msg: &str) -> NativeOutcome {
    NativeOutcome::Error(Box::new(ErrorInfo::new(CLASS_RUNTIMEERROR, msg)))
}

fn parse_ipv4(s: &str) -> Option<[u8; 4]> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 4 {
        return None;
    }
    let mut out = [0u8; 4];
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() || part.len() > 3 || !part.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        if part.len() > 1 && part.starts_with('0') {
            return None;
        }
        let v: u32 = part.parse().ok()?;
        if v > 255 {
            return None;
        }
        out[i] = v as u8;
    }
    Some(out)
}

fn set_nonblocking(fd: i32) -> bool {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        flags >= 0 && libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) >= 0
    }
}

struct ConnectProgress {
    fd: i32,
    finished: bool,
}

impl CFuncProgress for ConnectProgress {
    fn abort(&mut self) {
        if !self.finished {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// `net.connect(host, port)` -> stream fd
///
/// Host is a dotted IPv4 address or "localhost"; name resolution belongs
/// to the stdlib layer above this runtime.
pub fn native_connect(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    if let Some(progress) = ctx.progress_mut::<ConnectProgress>() {
        let fd = progress.fd;
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 || err != 0 {
            progress.finished = true;
            unsafe {
                libc::close(fd);
            }
            return runtime_error("connection failed");
        }
        progress.finished = true;
        return NativeOutcome::Return(Value::Int(fd as i64));
    }

    let host = match str_chars(&ctx.heaps.gc, ctx.arg(0)) {
        Some(chars) => chars.iter().collect::<String>(),
        None => return type_error("connect expects a host string"),
    };
    let port = match ctx.arg(1) {
        Value::Int(p) if (0..=65535).contains(p) => *p as u16,
        _ => {
            return NativeOutcome::Error(Box::new(ErrorInfo::new(
                CLASS_VALUEERROR,
                "port must be between 0 and 65535",
            )))
        }
    };
    let host = if host == "localhost" {
        "127.0.0.1".to_string()
    } else {
        host
    };
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    let host_c = match std::ffi::CString::new(host) {
        Ok(c) => c,
        Err(_) => return type_error("host string contains a null byte"),
    };
    let octets = match parse_ipv4(host_c.to_str().unwrap_or("")) {
        Some(octets) => octets,
        None => {
            return NativeOutcome::Error(Box::new(ErrorInfo::new(
                CLASS_VALUEERROR,
                "host is not a valid IPv4 address",
            )))
        }
    };
    addr.sin_addr.s_addr = u32::from_be_bytes(octets);

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return runtime_error("socket creation failed");
    }
    if !set_nonblocking(fd) {
        unsafe {
            libc::close(fd);
        }
        return runtime_error("socket configuration failed");
    }
    let rc = unsafe {
        libc::connect(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        return NativeOutcome::Return(Value::Int(fd as i64));
    }
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    if errno == libc::EINPROGRESS {
        ctx.start_progress(Box::new(ConnectProgress {
            fd,
            finished: false,
        }));
        return NativeOutcome::Suspend(SuspendType::SockwaitWritableOrError, fd as i64);
    }
    unsafe {
        libc::close(fd);
    }
    runtime_error("connection failed")
}

/// `net.read(fd, maxlen)` -> bytes (empty at end of stream)
pub fn native_read(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let fd = match ctx.arg(0) {
        Value::Int(fd) => *fd as i32,
        _ => return type_error("read expects a stream fd"),
    };
    let maxlen = match ctx.arg(1) {
        Value::Int(n) if *n > 0 => (*n as usize).min(1 << 20),
        _ => {
            return NativeOutcome::Error(Box::new(ErrorInfo::new(
                CLASS_VALUEERROR,
                "read length must be positive",
            )))
        }
    };
    let mut buf = vec![0u8; maxlen];
    let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, maxlen) };
    if rc >= 0 {
        buf.truncate(rc as usize);
        return match ctx.make_bytes(&buf) {
            Ok(v) => NativeOutcome::Return(v),
            Err(_) => NativeOutcome::Error(Box::new(ErrorInfo::out_of_memory())),
        };
    }
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
        return NativeOutcome::Suspend(SuspendType::SockwaitReadableOrError, fd as i64);
    }
    runtime_error("read failed")
}

struct WriteProgress {
    written: usize,
}

impl CFuncProgress for WriteProgress {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// `net.write(fd, bytes)` -> count written
pub fn native_write(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let fd = match ctx.arg(0) {
        Value::Int(fd) => *fd as i32,
        _ => return type_error("write expects a stream fd"),
    };
    let data: Vec<u8> = match bytes_content(&ctx.heaps.gc, ctx.arg(1)) {
        Some(b) => b.to_vec(),
        None => match str_chars(&ctx.heaps.gc, ctx.arg(1)) {
            Some(chars) => chars.iter().collect::<String>().into_bytes(),
            None => return type_error("write expects bytes or a string"),
        },
    };
    let mut written = ctx
        .progress_mut::<WriteProgress>()
        .map(|p| p.written)
        .unwrap_or(0);
    while written < data.len() {
        let rc = unsafe {
            libc::write(
                fd,
                data[written..].as_ptr() as *const libc::c_void,
                data.len() - written,
            )
        };
        if rc >= 0 {
            written += rc as usize;
            continue;
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            match ctx.progress_mut::<WriteProgress>() {
                Some(p) => p.written = written,
                None => ctx.start_progress(Box::new(WriteProgress { written })),
            }
            return NativeOutcome::Suspend(SuspendType::SockwaitWritableOrError, fd as i64);
        }
        return runtime_error("write failed");
    }
    NativeOutcome::Return(Value::Int(written as i64))
}

/// `net.close(fd)`
pub fn native_close(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let fd = match ctx.arg(0) {
        Value::Int(fd) => *fd as i32,
        _ => return type_error("close expects a stream fd"),
    };
    unsafe {
        libc::close(fd);
    }
    NativeOutcome::Return(Value::None)
}

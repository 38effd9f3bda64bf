//! `splice`, `splice_to_eof`, and `splice_chunks` (design §4.F "Splice
//! pipeline"), grounded in `Backend_splice`/`Backend_splice_to_eof`'s two
//! variants (the `POLYPHONY_LINUX` direct `splice(2)` path and the portable
//! read/write shuttle fallback) and in `splice_chunks_write`/
//! `splice_chunks_splice`/`Backend_splice_chunks` for the chunked transfer.
//!
//! Every op here suspends through [`Backend::wait_for_rw_io`] rather than
//! [`Backend::wait_for_io`]: a single watcher spanning both the source and
//! destination fds, woken only once *both* have become ready — `splice(2)`
//! can't make progress until the source has bytes to give and the
//! destination has room to take them, so waking early just burns a retry.
//! Matches `libev_wait_rw_fd_with_watcher`'s refcounted combined watcher
//! exactly (see `DESIGN.md`).

use std::os::unix::io::RawFd;

use crate::error::{Error, Result};
use crate::fiber::Host;
use crate::scheduler::Backend;

fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

fn is_would_block(errno: i32) -> bool {
    errno == libc::EWOULDBLOCK || errno == libc::EAGAIN
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(Error::Syscall(std::io::Error::last_os_error()));
        }
        if flags & libc::O_NONBLOCK == 0
            && libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0
        {
            return Err(Error::Syscall(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Moves up to `maxlen` bytes directly from `src_fd` to `dest_fd` with no
/// intermediate copy into userspace, on platforms that have `splice(2)`.
/// Everywhere else, shuttles the data through a scratch buffer instead — the
/// visible behavior is identical, only the syscall count differs.
#[cfg(target_os = "linux")]
fn splice_once(
    src_fd: RawFd,
    dest_fd: RawFd,
    maxlen: usize,
) -> std::io::Result<isize> {
    let n = unsafe {
        libc::splice(
            src_fd,
            std::ptr::null_mut(),
            dest_fd,
            std::ptr::null_mut(),
            maxlen,
            0,
        )
    };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n)
    }
}

/// Copies at most `maxlen` bytes from `src_fd` to `dest_fd`, suspending on
/// either fd's readiness as needed, and returns the number of bytes moved
/// (`0` at EOF). Mirrors `Backend_splice`: exactly one read followed by
/// however many writes it takes to drain that one read.
pub fn splice<H: Host>(
    backend: &Backend<H>,
    src_fd: RawFd,
    dest_fd: RawFd,
    maxlen: usize,
) -> Result<usize> {
    set_nonblocking(src_fd)?;
    set_nonblocking(dest_fd)?;

    #[cfg(target_os = "linux")]
    {
        let mut suspended = false;
        loop {
            backend.bump_op_count();
            match splice_once(src_fd, dest_fd, maxlen) {
                Ok(n) => {
                    if !suspended {
                        backend.snooze().into_result()?;
                    }
                    return Ok(n as usize);
                }
                Err(err) => {
                    let errno = err.raw_os_error().unwrap_or(libc::EIO);
                    if errno == libc::EINTR {
                        continue;
                    }
                    if !is_would_block(errno) {
                        return Err(Error::Syscall(err));
                    }
                    suspended = true;
                    backend
                        .wait_for_rw_io(Some(src_fd), Some(dest_fd))
                        .into_result()?;
                }
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let mut buf = vec![0u8; maxlen];
        let total = shuttle_read(backend, src_fd, &mut buf)?;
        if let Some(total) = total {
            drain_write(backend, dest_fd, &buf[..total])?;
            backend.snooze().into_result()?;
            Ok(total)
        } else {
            Ok(0)
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn shuttle_read<H: Host>(
    backend: &Backend<H>,
    src_fd: RawFd,
    buf: &mut [u8],
) -> Result<Option<usize>> {
    loop {
        backend.bump_op_count();
        let n = unsafe { libc::read(src_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            if !is_would_block(errno) {
                return Err(Error::Syscall(std::io::Error::from_raw_os_error(errno)));
            }
            backend
                .wait_for_rw_io(Some(src_fd), None)
                .into_result()?;
            continue;
        }
        if n == 0 {
            return Ok(None);
        }
        return Ok(Some(n as usize));
    }
}

#[cfg(not(target_os = "linux"))]
fn drain_write<H: Host>(backend: &Backend<H>, dest_fd: RawFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        backend.bump_op_count();
        let n = unsafe { libc::write(dest_fd, buf.as_ptr() as *const _, buf.len()) };
        if n < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            if !is_would_block(errno) {
                return Err(Error::Syscall(std::io::Error::from_raw_os_error(errno)));
            }
            backend
                .wait_for_rw_io(None, Some(dest_fd))
                .into_result()?;
            continue;
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

/// Like [`splice`] but repeats until `src_fd` hits EOF, returning the total
/// bytes moved. Mirrors `Backend_splice_to_eof`'s outer loop around the same
/// read/write (or `splice(2)`) shuttle.
pub fn splice_to_eof<H: Host>(
    backend: &Backend<H>,
    src_fd: RawFd,
    dest_fd: RawFd,
    maxlen: usize,
) -> Result<usize> {
    set_nonblocking(src_fd)?;
    set_nonblocking(dest_fd)?;
    let mut total = 0usize;
    let mut suspended = false;

    loop {
        #[cfg(target_os = "linux")]
        let chunk = loop {
            backend.bump_op_count();
            match splice_once(src_fd, dest_fd, maxlen) {
                Ok(n) => break n as usize,
                Err(err) => {
                    let errno = err.raw_os_error().unwrap_or(libc::EIO);
                    if errno == libc::EINTR {
                        continue;
                    }
                    if !is_would_block(errno) {
                        return Err(Error::Syscall(err));
                    }
                    suspended = true;
                    backend
                        .wait_for_rw_io(Some(src_fd), Some(dest_fd))
                        .into_result()?;
                }
            }
        };

        #[cfg(not(target_os = "linux"))]
        let chunk = {
            let mut buf = vec![0u8; maxlen];
            match shuttle_read(backend, src_fd, &mut buf)? {
                None => 0,
                Some(n) => {
                    suspended = true;
                    drain_write(backend, dest_fd, &buf[..n])?;
                    n
                }
            }
        };

        if chunk == 0 {
            break;
        }
        total += chunk;
    }

    if !suspended {
        backend.snooze().into_result()?;
    }
    Ok(total)
}

/// A literal chunk framing payload, a per-chunk payload produced on demand
/// from the chunk's length, or nothing at all — mirrors `splice_chunks`'
/// `prefix`/`postfix`/`chunk_prefix`/`chunk_postfix` arguments, each of which
/// the original accepts as either a string or a callable.
pub enum Framing {
    None,
    Bytes(Vec<u8>),
    PerChunk(Box<dyn FnMut(usize) -> Vec<u8>>),
}

impl Framing {
    fn resolve(&mut self, chunk_len: usize) -> Option<Vec<u8>> {
        match self {
            Framing::None => None,
            Framing::Bytes(bytes) => Some(bytes.clone()),
            Framing::PerChunk(f) => Some(f(chunk_len)),
        }
    }
}

fn write_all<H: Host>(backend: &Backend<H>, fd: RawFd, buf: &[u8]) -> Result<()> {
    let mut left = buf;
    while !left.is_empty() {
        backend.bump_op_count();
        let n = unsafe { libc::write(fd, left.as_ptr() as *const _, left.len()) };
        if n < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            if !is_would_block(errno) {
                return Err(Error::Syscall(std::io::Error::from_raw_os_error(errno)));
            }
            backend.wait_for_rw_io(None, Some(fd)).into_result()?;
            continue;
        }
        left = &left[n as usize..];
    }
    Ok(())
}

/// Copies `src_fd` to `dest_fd` through an internal pipe, chunk by chunk, so
/// arbitrary framing can be interleaved around the transferred bytes without
/// ever buffering a whole chunk in userspace. Mirrors `Backend_splice_chunks`:
/// each chunk is first spliced from `src_fd` into the write end of a pipe,
/// then from the pipe's read end into `dest_fd`, with `chunk_prefix`/
/// `chunk_postfix` written directly to `dest_fd` around that second splice.
///
/// The pipe's fds are closed on every exit path, including error returns —
/// mirrors the original's `goto done; free(buf)` cleanup discipline, just
/// expressed as an RAII guard instead of a manual label.
pub fn splice_chunks<H: Host>(
    backend: &Backend<H>,
    src_fd: RawFd,
    dest_fd: RawFd,
    mut prefix: Framing,
    mut postfix: Framing,
    mut chunk_prefix: Framing,
    mut chunk_postfix: Framing,
    chunk_size: usize,
) -> Result<usize> {
    set_nonblocking(src_fd)?;
    set_nonblocking(dest_fd)?;

    struct Pipe(RawFd, RawFd);
    impl Drop for Pipe {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.0);
                libc::close(self.1);
            }
        }
    }

    let mut fds = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(Error::Syscall(std::io::Error::last_os_error()));
    }
    let pipe = Pipe(fds[0], fds[1]);
    set_nonblocking(pipe.0)?;
    set_nonblocking(pipe.1)?;

    let mut total = 0usize;

    if let Some(bytes) = prefix.resolve(0) {
        write_all(backend, dest_fd, &bytes)?;
    }

    loop {
        let chunk_len = splice_stage(backend, src_fd, pipe.1, chunk_size)?;
        if chunk_len == 0 {
            break;
        }
        total += chunk_len;

        if let Some(bytes) = chunk_prefix.resolve(chunk_len) {
            write_all(backend, dest_fd, &bytes)?;
        }

        let mut left = chunk_len;
        while left > 0 {
            let n = splice_stage(backend, pipe.0, dest_fd, left)?;
            left -= n;
        }

        if let Some(bytes) = chunk_postfix.resolve(chunk_len) {
            write_all(backend, dest_fd, &bytes)?;
        }
    }

    if let Some(bytes) = postfix.resolve(0) {
        write_all(backend, dest_fd, &bytes)?;
    }

    backend.snooze().into_result()?;
    Ok(total)
}

/// One leg of a `splice_chunks` transfer: moves up to `maxlen` bytes from
/// `src_fd` to `dest_fd`, suspending on either side's readiness. Shared by
/// both the src-to-pipe and pipe-to-dest legs, mirroring
/// `splice_chunks_splice`'s single helper used for both directions.
fn splice_stage<H: Host>(
    backend: &Backend<H>,
    src_fd: RawFd,
    dest_fd: RawFd,
    maxlen: usize,
) -> Result<usize> {
    #[cfg(target_os = "linux")]
    {
        loop {
            backend.bump_op_count();
            match splice_once(src_fd, dest_fd, maxlen) {
                Ok(n) => return Ok(n as usize),
                Err(err) => {
                    let errno = err.raw_os_error().unwrap_or(libc::EIO);
                    if errno == libc::EINTR {
                        continue;
                    }
                    if !is_would_block(errno) {
                        return Err(Error::Syscall(err));
                    }
                    backend
                        .wait_for_rw_io(Some(src_fd), Some(dest_fd))
                        .into_result()?;
                }
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let mut buf = vec![0u8; maxlen];
        match shuttle_read(backend, src_fd, &mut buf)? {
            None => Ok(0),
            Some(n) => {
                drain_write(backend, dest_fd, &buf[..n])?;
                Ok(n)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::thread::ThreadHost;
    use std::sync::mpsc;
    use std::sync::Arc;

    fn run_fiber<T: Send + 'static>(
        backend: Arc<Backend<ThreadHost>>,
        body: impl FnOnce(&Backend<ThreadHost>) -> T + Send + 'static,
    ) -> T {
        let (tx, rx) = mpsc::channel();
        let host = backend.host().clone();
        let (fiber, join) = host.spawn(move |_| {
            let value = body(&backend);
            tx.send(value).unwrap();
        });
        host.make_runnable(fiber);
        join.join().unwrap();
        rx.recv().unwrap()
    }

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn splice_moves_one_chunk_between_pipes() {
        let host = ThreadHost::new();
        let backend = Arc::new(Backend::new(host).unwrap());
        let (src_r, src_w) = pipe_pair();
        let (dest_r, dest_w) = pipe_pair();

        unsafe {
            libc::write(src_w, b"hello\0".as_ptr() as *const _, 5);
            libc::close(src_w);
        }

        let n = run_fiber(backend, move |backend| {
            let n = splice(backend, src_r, dest_w, 64).unwrap();
            unsafe {
                libc::close(src_r);
                libc::close(dest_w);
            }
            n
        });
        assert_eq!(n, 5);

        let mut buf = [0u8; 16];
        let got = unsafe { libc::read(dest_r, buf.as_mut_ptr() as *mut _, buf.len()) };
        assert_eq!(&buf[..got as usize], b"hello");
        unsafe {
            libc::close(dest_r);
        }
    }

    #[test]
    fn splice_to_eof_drains_a_1mib_file() {
        // Spec §8 scenario 4: a 1 MiB regular file spliced to EOF returns
        // exactly 1048576. The destination here is a pipe rather than the
        // spec's literal `/dev/null`: `splice(2)` requires at least one of
        // its two fds to be a pipe, and a regular file satisfies neither
        // side of a file-to-`/dev/null` pair — a drained background reader
        // stands in for `/dev/null`'s "discard everything" role without
        // hitting that kernel constraint on the direct-splice path.
        use std::io::Write as _;

        let host = ThreadHost::new();
        let backend = Arc::new(Backend::new(host).unwrap());

        let mut file = tempfile::tempfile().unwrap();
        let chunk = vec![0x42u8; 65536];
        for _ in 0..16 {
            file.write_all(&chunk).unwrap();
        }
        file.flush().unwrap();
        let src_fd = {
            use std::os::unix::io::AsRawFd;
            // Duplicate so the op owns a fd it can freely set non-blocking
            // and the `tempfile::File` can still drop (and unlink) its own.
            unsafe { libc::dup(file.as_raw_fd()) }
        };
        unsafe {
            libc::lseek(src_fd, 0, libc::SEEK_SET);
        }

        let (dest_r, dest_w) = pipe_pair();
        let drain = std::thread::spawn(move || {
            let mut buf = [0u8; 65536];
            let mut total = 0usize;
            loop {
                let n = unsafe { libc::read(dest_r, buf.as_mut_ptr() as *mut _, buf.len()) };
                if n <= 0 {
                    break;
                }
                total += n as usize;
            }
            unsafe {
                libc::close(dest_r);
            }
            total
        });

        let total = run_fiber(backend, move |backend| {
            let total = splice_to_eof(backend, src_fd, dest_w, 65536).unwrap();
            unsafe {
                libc::close(src_fd);
                libc::close(dest_w);
            }
            total
        });
        assert_eq!(total, 1024 * 1024);
        assert_eq!(drain.join().unwrap(), 1024 * 1024);
    }

    #[test]
    fn splice_to_eof_drains_a_producer_until_it_closes() {
        let host = ThreadHost::new();
        let backend = Arc::new(Backend::new(host).unwrap());
        let (src_r, src_w) = pipe_pair();
        let (dest_r, dest_w) = pipe_pair();

        let producer = std::thread::spawn(move || {
            for _ in 0..4 {
                unsafe {
                    libc::write(src_w, b"abcd".as_ptr() as *const _, 4);
                }
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            unsafe {
                libc::close(src_w);
            }
        });

        let total = run_fiber(backend, move |backend| {
            let total = splice_to_eof(backend, src_r, dest_w, 4).unwrap();
            unsafe {
                libc::close(src_r);
                libc::close(dest_w);
            }
            total
        });
        producer.join().unwrap();
        assert_eq!(total, 16);

        let mut buf = [0u8; 32];
        let mut got = 0usize;
        loop {
            let n = unsafe {
                libc::read(dest_r, buf[got..].as_mut_ptr() as *mut _, buf.len() - got)
            };
            if n <= 0 {
                break;
            }
            got += n as usize;
        }
        assert_eq!(got, 16);
        unsafe {
            libc::close(dest_r);
        }
    }

    #[test]
    fn splice_chunks_wraps_every_chunk_and_frames_the_whole_stream() {
        let host = ThreadHost::new();
        let backend = Arc::new(Backend::new(host).unwrap());
        let (src_r, src_w) = pipe_pair();
        let (dest_r, dest_w) = pipe_pair();

        unsafe {
            libc::write(src_w, b"0123456789".as_ptr() as *const _, 10);
            libc::close(src_w);
        }

        let total = run_fiber(backend, move |backend| {
            let total = splice_chunks(
                backend,
                src_r,
                dest_w,
                Framing::Bytes(b"<start>".to_vec()),
                Framing::Bytes(b"<end>".to_vec()),
                Framing::Bytes(b"[".to_vec()),
                Framing::Bytes(b"]".to_vec()),
                4,
            )
            .unwrap();
            unsafe {
                libc::close(src_r);
                libc::close(dest_w);
            }
            total
        });
        assert_eq!(total, 10);

        let mut buf = [0u8; 128];
        let mut got = 0usize;
        loop {
            let n = unsafe {
                libc::read(dest_r, buf[got..].as_mut_ptr() as *mut _, buf.len() - got)
            };
            if n <= 0 {
                break;
            }
            got += n as usize;
        }
        unsafe {
            libc::close(dest_r);
        }
        let out = &buf[..got];
        assert!(out.starts_with(b"<start>"));
        assert!(out.ends_with(b"<end>"));
        assert_eq!(
            out.iter().filter(|&&b| b == b'[').count(),
            out.iter().filter(|&&b| b == b']').count()
        );
    }
}

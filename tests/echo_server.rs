//! End-to-end echo server scenario (spec §8, scenario 1): accept_loop spawns
//! a fiber per connection that reads until EOF and writes back whatever it
//! read; a real TCP client on another OS thread sees its own bytes echoed
//! back, then an orderly close.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::mpsc;
use std::sync::Arc;

use fiber_io::fiber::thread::ThreadHost;
use fiber_io::fiber::ResumeValue;
use fiber_io::scheduler::Backend;
use fiber_io::{io as fio, Result};

#[test]
fn echo_server_roundtrips_a_client_message() {
    let host = ThreadHost::new();
    let backend = Arc::new(Backend::new(host).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let listener_fd = listener.as_raw_fd();

    let (done_tx, done_rx) = mpsc::channel();

    let server_host = backend.host().clone();
    let server_backend = backend.clone();
    let (server_fiber, server_join) = server_host.spawn(move |_| {
        let result: Result<()> = fio::accept_loop(&server_backend, listener_fd, {
            let backend = server_backend.clone();
            let done_tx = done_tx.clone();
            move |conn_fd| {
                let backend = backend.clone();
                let done_tx = done_tx.clone();
                let host = backend.host().clone();
                let conn_backend = backend.clone();
                let (conn_fiber, _join) = host.spawn(move |_| {
                    let _ = fio::read_loop(&conn_backend, conn_fd, 4096, |chunk| {
                        fio::write(&conn_backend, conn_fd, chunk)?;
                        Ok(())
                    });
                    unsafe {
                        libc::close(conn_fd);
                    }
                    let _ = done_tx.send(());
                });
                // The server fiber is already running, so this isn't the
                // bootstrap case (see `control.rs`'s tests): schedule the new
                // fiber through the backend's run queue instead of waking its
                // thread directly, so only one fiber's thread ever actually
                // runs at a time.
                backend.schedule(conn_fiber, ResumeValue::Unit, false);
                Ok(())
            }
        });
        // accept_loop only returns on error (e.g. the listener is closed
        // out from under it at test teardown); that's expected here.
        let _ = result;
    });
    backend.host().make_runnable(server_fiber);

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"hello").unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();

    let mut received = Vec::new();
    stream.read_to_end(&mut received).unwrap();
    assert_eq!(received, b"hello");

    // Wait for the per-connection fiber to notice EOF and close its end,
    // confirming the server side wound down cleanly rather than leaking a
    // fiber or fd.
    done_rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();

    // The server fiber handed control to the connection fiber via
    // `backend.schedule` + the run queue and is parked waiting for someone
    // to switch back to it, which nothing here does (the connection fiber's
    // body just returns once it's done, as in `fiber::thread`'s own tests).
    // Its thread is leaked rather than joined; the process exiting reclaims
    // it either way, and nothing past this point depends on it running
    // again.
    drop(listener);
    drop(server_join);
}

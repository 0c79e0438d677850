use std::io::{Error, Result};
use std::ptr::null_mut;
use std::time::Duration;

use libc::{c_int, fd_set, timeval};

use crate::sys::RawSock;

const WORD_BITS: usize = usize::BITS as usize;

fn to_timeval(timeout: Duration) -> timeval {
    timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    }
}

// The native fd_set is a fixed bitmap capped at FD_SETSIZE descriptors.
// Build one sized to the highest handle instead; `select` only needs
// the bitmap pointer and an nfds covering the allocation.
fn bitmap(handles: &[RawSock]) -> Vec<usize> {
    let max_fd = handles.iter().copied().max().unwrap_or(0) as usize;

    let mut words = vec![0usize; max_fd / WORD_BITS + 1];

    for &fd in handles {
        words[fd as usize / WORD_BITS] |= 1 << (fd as usize % WORD_BITS);
    }

    words
}

pub fn select_readable(handles: &[RawSock], timeout: Duration) -> Result<Vec<RawSock>> {
    let mut words = bitmap(handles);

    let mut tv = to_timeval(timeout);

    let ready = unsafe {
        libc::select(
            (words.len() * WORD_BITS) as c_int,
            words.as_mut_ptr() as *mut fd_set,
            null_mut(),
            null_mut(),
            &mut tv,
        )
    };

    if ready < 0 {
        return Err(Error::last_os_error());
    }

    let mut out = Vec::with_capacity(ready as usize);

    if ready > 0 {
        for &fd in handles {
            if words[fd as usize / WORD_BITS] & (1 << (fd as usize % WORD_BITS)) != 0 {
                out.push(fd);
            }
        }
    }

    log::trace!(target: "netline_poll", "{} of {} handles readable", out.len(), handles.len());

    Ok(out)
}

pub fn select_writable(sock: RawSock, timeout: Duration) -> Result<bool> {
    let mut words = bitmap(&[sock]);

    let mut tv = to_timeval(timeout);

    let ready = unsafe {
        libc::select(
            (words.len() * WORD_BITS) as c_int,
            null_mut(),
            words.as_mut_ptr() as *mut fd_set,
            null_mut(),
            &mut tv,
        )
    };

    if ready < 0 {
        return Err(Error::last_os_error());
    }

    Ok(ready > 0)
}

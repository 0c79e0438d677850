use std::io::{Error, Result};
use std::ptr::null_mut;
use std::time::Duration;

use winapi::um::winsock2::{fd_set, select, timeval, WSAGetLastError, SOCKET_ERROR};

use crate::sys::RawSock;

// The Winsock fd_set ABI is a u_count prefix followed by a SOCKET
// array. Build one sized to the input instead of the fixed 64-slot
// layout; nfds is ignored on Windows.
fn handle_array(handles: &[RawSock]) -> Vec<usize> {
    let mut set = Vec::with_capacity(handles.len() + 1);

    set.push(handles.len());

    set.extend(handles.iter().map(|&h| h as usize));

    set
}

fn to_timeval(timeout: Duration) -> timeval {
    timeval {
        tv_sec: timeout.as_secs() as _,
        tv_usec: timeout.subsec_micros() as _,
    }
}

fn wsa_error() -> Error {
    Error::from_raw_os_error(unsafe { WSAGetLastError() })
}

pub fn select_readable(handles: &[RawSock], timeout: Duration) -> Result<Vec<RawSock>> {
    let mut set = handle_array(handles);

    let tv = to_timeval(timeout);

    let ready = unsafe {
        select(
            0,
            set.as_mut_ptr() as *mut fd_set,
            null_mut(),
            null_mut(),
            &tv,
        )
    };

    if ready == SOCKET_ERROR {
        return Err(wsa_error());
    }

    let mut out = Vec::with_capacity(ready as usize);

    if ready > 0 {
        let survivors = &set[1..=set[0]];

        for &h in handles {
            if survivors.contains(&(h as usize)) {
                out.push(h);
            }
        }
    }

    log::trace!(target: "netline_poll", "{} of {} handles readable", out.len(), handles.len());

    Ok(out)
}

pub fn select_writable(sock: RawSock, timeout: Duration) -> Result<bool> {
    // A failed non-blocking connect reports through the except set on
    // Windows; SO_ERROR picks up the failure afterwards.
    let mut write_set = handle_array(&[sock]);

    let mut except_set = handle_array(&[sock]);

    let tv = to_timeval(timeout);

    let ready = unsafe {
        select(
            0,
            null_mut(),
            write_set.as_mut_ptr() as *mut fd_set,
            except_set.as_mut_ptr() as *mut fd_set,
            &tv,
        )
    };

    if ready == SOCKET_ERROR {
        return Err(wsa_error());
    }

    Ok(ready > 0)
}

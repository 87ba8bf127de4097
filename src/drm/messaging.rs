//! Socket plumbing for the DRM helper: fixed-size request/response structs,
//! SCM_RIGHTS fd passing, and a fixed one-second budget on every send and
//! receive enforced with `ppoll`.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::time::Duration;

use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::socket::{
    accept, bind, listen, recvmsg, sendmsg, socket, AddressFamily, Backlog, ControlMessageOwned,
    MsgFlags, SockFlag, SockType, UnixAddr,
};
use nix::sys::time::TimeSpec;

use super::{DrmRequest, DrmResponse, MAX_PLANE_DESCRIPTORS};
use crate::types::error::{Error, Result};

/// Budget for each send and each receive on the helper socket.
pub const DRM_DATA_TIMEOUT: Duration = Duration::from_secs(1);

/// The mask installed for the duration of `ppoll` must NOT block SIGCHLD,
/// so that a dying helper interrupts the wait instead of running the full
/// timeout.
fn poll_sigmask() -> SigSet {
    let mut mask = SigSet::thread_get_mask().unwrap_or_else(|_| SigSet::empty());
    mask.remove(Signal::SIGCHLD);
    mask
}

fn wait_ready(fd: BorrowedFd<'_>, events: PollFlags, timeout: Duration) -> Result<()> {
    let mut fds = [PollFd::new(fd, events)];
    let ready = ppoll(
        &mut fds,
        Some(TimeSpec::from_duration(timeout)),
        Some(poll_sigmask()),
    )?;
    if ready == 0 {
        return Err(Error::Timeout(
            "DRM helper did not respond within the deadline".into(),
        ));
    }
    Ok(())
}

pub fn bind_listener(path: &str) -> Result<OwnedFd> {
    // A stale socket from a crashed run would make bind fail
    let _ = std::fs::remove_file(path);

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )?;
    bind(fd.as_raw_fd(), &UnixAddr::new(path)?)?;
    listen(&fd, Backlog::new(1)?)?;
    Ok(fd)
}

pub fn accept_with_timeout(listener: &OwnedFd, timeout: Duration) -> Result<OwnedFd> {
    wait_ready(listener.as_fd(), PollFlags::POLLIN, timeout)?;
    let fd = accept(listener.as_raw_fd())?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn send_request(socket: &OwnedFd, kind: u32) -> Result<()> {
    wait_ready(socket.as_fd(), PollFlags::POLLOUT, DRM_DATA_TIMEOUT)?;

    let request = DrmRequest { kind };
    let bytes = unsafe {
        std::slice::from_raw_parts(
            &request as *const DrmRequest as *const u8,
            std::mem::size_of::<DrmRequest>(),
        )
    };

    let sent = sendmsg::<UnixAddr>(
        socket.as_raw_fd(),
        &[IoSlice::new(bytes)],
        &[],
        MsgFlags::empty(),
        None,
    )?;
    if sent < std::mem::size_of::<DrmRequest>() {
        return Err(Error::Capture("short write to DRM helper".into()));
    }
    Ok(())
}

/// Receives one response. The file descriptors arrive as SCM_RIGHTS
/// ancillary data and are owned by the caller from here on; dropping the
/// returned handles closes them.
pub fn receive_planes(socket: &OwnedFd) -> Result<(DrmResponse, Vec<OwnedFd>)> {
    wait_ready(socket.as_fd(), PollFlags::POLLIN, DRM_DATA_TIMEOUT)?;

    let mut response = DrmResponse::default();
    let mut cmsg_buffer = nix::cmsg_space!([i32; MAX_PLANE_DESCRIPTORS]);

    let mut received_fds: Vec<OwnedFd> = Vec::new();
    let bytes = {
        let response_bytes = unsafe {
            std::slice::from_raw_parts_mut(
                &mut response as *mut DrmResponse as *mut u8,
                std::mem::size_of::<DrmResponse>(),
            )
        };
        let mut iov = [IoSliceMut::new(response_bytes)];

        let msg = recvmsg::<UnixAddr>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_WAITALL,
        )?;

        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                received_fds
                    .extend(fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
            }
        }
        msg.bytes
    };

    if bytes < std::mem::size_of::<DrmResponse>() {
        return Err(Error::Capture("short read from DRM helper".into()));
    }
    if received_fds.len() < response.num_fds as usize {
        return Err(Error::Capture(format!(
            "DRM helper promised {} fds but delivered {}",
            response.num_fds,
            received_fds.len()
        )));
    }

    // The fd fields in the payload are only meaningful in the helper's
    // process; substitute the ones the kernel just gave us
    for (descriptor, fd) in response
        .descriptors
        .iter_mut()
        .zip(received_fds.iter())
        .take(response.num_fds as usize)
    {
        descriptor.fd = fd.as_raw_fd();
    }

    Ok((response, received_fds))
}

/// One full GetPlanes round trip.
pub fn get_planes(socket: &OwnedFd) -> Result<(DrmResponse, Vec<OwnedFd>)> {
    send_request(socket, super::request::GET_PLANES)?;
    receive_planes(socket)
}

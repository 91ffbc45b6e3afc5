//! Thin wrappers over the `v4l` crate's raw ioctl layer for the buffer calls
//! the high-level stream API does not expose per index.

use std::io;
use std::os::fd::RawFd;

use v4l::v4l2;
use v4l::v4l_sys::{
    v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE, v4l2_buffer, v4l2_exportbuffer,
    v4l2_memory_V4L2_MEMORY_MMAP, v4l2_requestbuffers,
};

pub(crate) const CAPTURE_TYPE: u32 = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
pub(crate) const MEMORY_MMAP: u32 = v4l2_memory_V4L2_MEMORY_MMAP;

fn zeroed_buffer(index: u32) -> v4l2_buffer {
    let mut buf: v4l2_buffer = unsafe { std::mem::zeroed() };
    buf.type_ = CAPTURE_TYPE;
    buf.memory = MEMORY_MMAP;
    buf.index = index;
    buf
}

/// VIDIOC_REQBUFS: ask the driver for `count` mmap buffers; returns how many
/// it actually allocated.
pub(crate) fn request_buffers(fd: RawFd, count: u32) -> io::Result<u32> {
    let mut req: v4l2_requestbuffers = unsafe { std::mem::zeroed() };
    req.count = count;
    req.type_ = CAPTURE_TYPE;
    req.memory = MEMORY_MMAP;
    unsafe {
        v4l2::ioctl(
            fd,
            v4l2::vidioc::VIDIOC_REQBUFS,
            &mut req as *mut _ as *mut std::os::raw::c_void,
        )?;
    }
    Ok(req.count)
}

/// VIDIOC_QUERYBUF: mmap offset and length for one buffer.
pub(crate) fn query_buffer(fd: RawFd, index: u32) -> io::Result<(u64, usize)> {
    let mut buf = zeroed_buffer(index);
    unsafe {
        v4l2::ioctl(
            fd,
            v4l2::vidioc::VIDIOC_QUERYBUF,
            &mut buf as *mut _ as *mut std::os::raw::c_void,
        )?;
    }
    Ok((unsafe { buf.m.offset } as u64, buf.length as usize))
}

/// VIDIOC_EXPBUF: export one buffer as a DMA-BUF descriptor.
pub(crate) fn export_buffer(fd: RawFd, index: u32) -> io::Result<RawFd> {
    let mut exp: v4l2_exportbuffer = unsafe { std::mem::zeroed() };
    exp.type_ = CAPTURE_TYPE;
    exp.index = index;
    exp.flags = (libc::O_RDWR | libc::O_CLOEXEC) as u32;
    unsafe {
        v4l2::ioctl(
            fd,
            v4l2::vidioc::VIDIOC_EXPBUF,
            &mut exp as *mut _ as *mut std::os::raw::c_void,
        )?;
    }
    Ok(exp.fd)
}

/// VIDIOC_QBUF: hand one buffer back to the kernel queue.
pub(crate) fn queue_buffer(fd: RawFd, index: u32) -> io::Result<()> {
    let mut buf = zeroed_buffer(index);
    unsafe {
        v4l2::ioctl(
            fd,
            v4l2::vidioc::VIDIOC_QBUF,
            &mut buf as *mut _ as *mut std::os::raw::c_void,
        )
    }
}

/// Filled-buffer metadata from VIDIOC_DQBUF.
pub(crate) struct Dequeued {
    pub index: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub sequence: u32,
}

/// VIDIOC_DQBUF: take the next filled buffer off the kernel queue.
pub(crate) fn dequeue_buffer(fd: RawFd) -> io::Result<Dequeued> {
    let mut buf = zeroed_buffer(0);
    unsafe {
        v4l2::ioctl(
            fd,
            v4l2::vidioc::VIDIOC_DQBUF,
            &mut buf as *mut _ as *mut std::os::raw::c_void,
        )?;
    }
    Ok(Dequeued {
        index: buf.index,
        bytesused: buf.bytesused,
        flags: buf.flags,
        sequence: buf.sequence,
    })
}

/// VIDIOC_STREAMON / VIDIOC_STREAMOFF.
pub(crate) fn stream_on(fd: RawFd) -> io::Result<()> {
    let mut typ = CAPTURE_TYPE;
    unsafe {
        v4l2::ioctl(
            fd,
            v4l2::vidioc::VIDIOC_STREAMON,
            &mut typ as *mut _ as *mut std::os::raw::c_void,
        )
    }
}

pub(crate) fn stream_off(fd: RawFd) -> io::Result<()> {
    let mut typ = CAPTURE_TYPE;
    unsafe {
        v4l2::ioctl(
            fd,
            v4l2::vidioc::VIDIOC_STREAMOFF,
            &mut typ as *mut _ as *mut std::os::raw::c_void,
        )
    }
}

/// Wait for the device to become readable within `timeout_ms`.
/// Returns false on timeout.
pub(crate) fn wait_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc > 0 {
            return Ok(true);
        }
        if rc == 0 {
            return Ok(false);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

//! Fixed-layout wire records for the producerd/consumerd Unix-socket
//! protocol. Every record is `#[repr(C)]` and read/written as exactly
//! `size_of::<T>()` bytes — there is no delimiter framing, matching the
//! original daemons' `recv(fd, &msg, size, 0)` call.

use std::io::{Read, Write};
use std::mem::size_of;

use crate::error::{Result, StreamError};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMsgType {
    CreatePipeline = 1,
    DestroyPipeline = 2,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderRspType {
    CreateSuccess = 1,
    DestroySuccess = 2,
    Fail = 255,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProviderMsg {
    pub msg_type: u32,
    pub node_id: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProviderRsp {
    pub rsp_type: u32,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerMsgType {
    CreateSrtTarget = 1,
    StartTarget = 2,
    CreateRecordingTarget = 3,
    CreateImageCaptureTarget = 4,
    DestroyTarget = 5,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerRspType {
    CreateTargetSuccess = 1,
    StartSuccess = 2,
    DestroyTargetSuccess = 3,
    Fail = 255,
}

const URI_LEN: usize = 128;
const USERNAME_LEN: usize = 128;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ConsumerMsg {
    pub msg_type: u32,
    pub codec: u32,
    pub input_node_id: u32,
    pub output_node_id: u32,
    pub bitrate: u32,
    pub hash_id: u32,
    pub pipeline_handle: u64,
    pub uri: [u8; URI_LEN],
    pub username: [u8; USERNAME_LEN],
}

impl std::fmt::Debug for ConsumerMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerMsg")
            .field("msg_type", &self.msg_type)
            .field("codec", &self.codec)
            .field("input_node_id", &self.input_node_id)
            .field("output_node_id", &self.output_node_id)
            .field("bitrate", &self.bitrate)
            .field("hash_id", &self.hash_id)
            .field("uri", &self.uri_str())
            .field("username", &self.username_str())
            .finish()
    }
}

fn bytes_to_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn str_to_fixed<const N: usize>(s: &str) -> Result<[u8; N]> {
    if s.len() >= N {
        return Err(StreamError::InvalidArgument(format!(
            "string of length {} does not fit in {}-byte field",
            s.len(),
            N
        )));
    }
    let mut buf = [0u8; N];
    buf[..s.len()].copy_from_slice(s.as_bytes());
    Ok(buf)
}

impl ConsumerMsg {
    pub fn uri_str(&self) -> String {
        bytes_to_str(&self.uri)
    }

    pub fn username_str(&self) -> String {
        bytes_to_str(&self.username)
    }

    pub fn new(
        msg_type: ConsumerMsgType,
        codec: u32,
        input_node_id: u32,
        output_node_id: u32,
        bitrate: u32,
        hash_id: u32,
        uri: &str,
        username: &str,
    ) -> Result<ConsumerMsg> {
        Ok(ConsumerMsg {
            msg_type: msg_type as u32,
            codec,
            input_node_id,
            output_node_id,
            bitrate,
            hash_id,
            pipeline_handle: 0,
            uri: str_to_fixed::<URI_LEN>(uri)?,
            username: str_to_fixed::<USERNAME_LEN>(username)?,
        })
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ConsumerRsp {
    pub rsp_type: u32,
}

/// Reads exactly `size_of::<T>()` bytes from `reader` into a `T`. Used by
/// the daemon's per-connection child (reading the request), the CLI client
/// (reading the response), and the worker pipe protocol in [`crate::worker`].
pub fn recv_exact<T: Copy, R: Read>(reader: &mut R) -> Result<T> {
    let mut buf = vec![0u8; size_of::<T>()];
    reader.read_exact(&mut buf).map_err(StreamError::Io)?;
    Ok(unsafe { std::ptr::read(buf.as_ptr() as *const T) })
}

pub fn send_exact<T: Copy, W: Write>(writer: &mut W, value: &T) -> Result<()> {
    let bytes =
        unsafe { std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) };
    writer.write_all(bytes).map_err(StreamError::Io)?;
    Ok(())
}

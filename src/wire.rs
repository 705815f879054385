use std::io::{self, Read, Write};

use bytes::BufMut;
use prost::Message;

/// Largest hot-path frame: a length prefix plus a `MallocRecord` with every
/// field at its maximum varint width. Hot-path callers stage frames in a
/// stack buffer of this size instead of allocating.
pub const MAX_FRAME_SZ: usize = 64;

/// Upper bound accepted for an incoming frame. Only handshake replies are
/// ever read on the client, and a configuration for 256 heaps fits well
/// under this.
const MAX_INBOUND_FRAME_SZ: u64 = 1 << 20;

/// Identity presented by the client when the session socket opens.
#[derive(Clone, PartialEq, Message)]
pub struct Handshake {
  #[prost(uint64, tag = "1")]
  pub pid: u64,
  #[prost(string, tag = "2")]
  pub cmdline: String,
}

/// Per-heap profiling parameters negotiated at handshake. The index of an
/// entry in `ClientConfiguration::heaps` is the service-side heap id.
#[derive(Clone, PartialEq, Message)]
pub struct HeapConfig {
  #[prost(string, tag = "1")]
  pub name: String,
  #[prost(uint64, tag = "2")]
  pub sampling_interval: u64,
}

/// The daemon's authoritative answer: which heaps to profile and how.
#[derive(Clone, PartialEq, Message)]
pub struct ClientConfiguration {
  #[prost(message, repeated, tag = "1")]
  pub heaps: Vec<HeapConfig>,
}

/// One sampled allocation.
#[derive(Clone, PartialEq, Message)]
pub struct MallocRecord {
  #[prost(uint32, tag = "1")]
  pub heap_id: u32,
  #[prost(uint64, tag = "2")]
  pub alloc_id: u64,
  #[prost(uint64, tag = "3")]
  pub sampled_size: u64,
  #[prost(uint64, tag = "4")]
  pub raw_size: u64,
}

/// One freed allocation.
#[derive(Clone, PartialEq, Message)]
pub struct FreeRecord {
  #[prost(uint32, tag = "1")]
  pub heap_id: u32,
  #[prost(uint64, tag = "2")]
  pub alloc_id: u64,
}

/// Envelope for every frame on the daemon socket.
#[derive(Clone, PartialEq, Message)]
pub struct Record {
  #[prost(oneof = "Payload", tags = "1, 2, 3, 4")]
  pub payload: Option<Payload>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Payload {
  #[prost(message, tag = "1")]
  Handshake(Handshake),
  #[prost(message, tag = "2")]
  ClientConfiguration(ClientConfiguration),
  #[prost(message, tag = "3")]
  Malloc(MallocRecord),
  #[prost(message, tag = "4")]
  Free(FreeRecord),
}

impl Record {
  #[must_use]
  pub fn client_configuration(config: ClientConfiguration) -> Self {
    Self {
      payload: Some(Payload::ClientConfiguration(config)),
    }
  }

  #[must_use]
  pub fn free(heap_id: u32, alloc_id: u64) -> Self {
    Self {
      payload: Some(Payload::Free(FreeRecord { heap_id, alloc_id })),
    }
  }

  #[must_use]
  pub fn handshake(pid: u64, cmdline: String) -> Self {
    Self {
      payload: Some(Payload::Handshake(Handshake { pid, cmdline })),
    }
  }

  #[must_use]
  pub fn malloc(heap_id: u32, alloc_id: u64, sampled_size: u64, raw_size: u64) -> Self {
    Self {
      payload: Some(Payload::Malloc(MallocRecord {
        heap_id,
        alloc_id,
        sampled_size,
        raw_size,
      })),
    }
  }
}

/// Read one length-delimited record.
///
/// The length prefix is consumed a byte at a time, so nothing past the frame
/// is ever taken off the stream.
///
/// # Errors
/// An IO error from the underlying reader, or `InvalidData` for a malformed
/// or oversized frame.
pub fn read_record<R: Read>(mut reader: R) -> io::Result<Record> {
  let mut len: u64 = 0;
  let mut shift = 0u32;
  loop {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    len |= u64::from(byte[0] & 0x7f) << shift;
    if byte[0] & 0x80 == 0 {
      break;
    }
    shift += 7;
    if shift >= 64 {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "frame length prefix does not terminate",
      ));
    }
  }
  if len > MAX_INBOUND_FRAME_SZ {
    return Err(io::Error::new(
      io::ErrorKind::InvalidData,
      "frame exceeds inbound size bound",
    ));
  }

  let mut body = vec![0u8; len as usize];
  reader.read_exact(&mut body)?;
  Record::decode(&body[..]).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Encode `record` length-delimited into `buf` and write it in one call.
///
/// `buf` is caller-provided so the hot path can stage frames on the stack; a
/// record that does not fit is an error, never a heap fallback.
///
/// # Errors
/// `InvalidInput` when the record does not fit `buf`, otherwise any error
/// from the underlying writer.
pub fn write_record<W: Write>(mut writer: W, record: &Record, buf: &mut [u8]) -> io::Result<()> {
  let capacity = buf.len();
  let mut cursor = &mut buf[..];
  record
    .encode_length_delimited(&mut cursor)
    .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
  let written = capacity - cursor.remaining_mut();
  writer.write_all(&buf[..written])
}

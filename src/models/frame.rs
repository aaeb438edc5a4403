// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire framing for the transfer protocol.
//!
//! Every message on the wire is one frame: a fixed 10-byte header followed
//! by up to [`MAX_PAYLOAD`] payload bytes, all header fields little-endian:
//!
//! ```text
//!  0        1        2        4        6        10
//! +--------+--------+--------+--------+--------+----------------+
//! | type   | flags  | seq    | length | crc    | payload ...    |
//! +--------+--------+--------+--------+--------+----------------+
//! ```
//!
//! The CRC covers the payload only. The header is protected indirectly by
//! the type and length validity checks performed on decode.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use core::fmt;
use crc::{CRC_32_ISO_HDLC, Crc};
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32};

pub const HEADER_LEN: usize = 10;
pub const MAX_FRAME: usize = 1500;
pub const MAX_PAYLOAD: usize = MAX_FRAME - HEADER_LEN;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 as used on the wire: reflected, polynomial `0xEDB88320`
/// (reversed form), init and final XOR `0xFFFFFFFF`.
#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Frame types defined by the protocol.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Command = 0x01,
    Response = 0x02,
    Data = 0x03,
    Ack = 0x04,
    Nack = 0x05,
}

impl FrameType {
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => Self::Command,
            0x02 => Self::Response,
            0x03 => Self::Data,
            0x04 => Self::Ack,
            0x05 => Self::Nack,
            _ => return None,
        })
    }
}

/// Wire-safe frame type byte. Unknown values round-trip untouched; the
/// session layer decides what to do with them.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawFrameType(u8);

impl RawFrameType {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_raw(v: u8) -> Self {
        Self(v)
    }

    #[inline]
    pub fn known(&self) -> Option<FrameType> {
        FrameType::from_u8(self.0)
    }
}

impl From<FrameType> for RawFrameType {
    fn from(t: FrameType) -> Self {
        Self(t as u8)
    }
}

impl fmt::Debug for RawFrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.known() {
            Some(t) => write!(f, "{t:?}"),
            None => write!(f, "Unknown(0x{:02X})", self.0),
        }
    }
}

bitflags! {
    /// Chunk placement flags. Reserved bits are carried verbatim so that a
    /// decoded frame re-encodes to the exact bytes it came from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        const LAST_CHUNK = 0x01;
        const FIRST_CHUNK = 0x02;
    }
}

/// Fixed frame header as laid out on the wire.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    pub kind: RawFrameType,                 // 0
    pub flags: u8,                          // 1
    pub sequence_number: U16<LittleEndian>, // 2..4
    pub payload_length: U16<LittleEndian>,  // 4..6
    pub crc: U32<LittleEndian>,             // 6..10
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame too short: {got} bytes, header needs {HEADER_LEN}")]
    TooShort { got: usize },
    #[error("declared payload length {declared} does not match {actual} bytes on the wire")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("payload CRC mismatch: header says 0x{expected:08X}, computed 0x{computed:08X}")]
    CrcMismatch { expected: u32, computed: u32 },
    #[error("payload length {0} exceeds the {MAX_PAYLOAD}-byte cap")]
    Oversize(usize),
}

/// One protocol frame, decoded or ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: RawFrameType,
    pub flags: FrameFlags,
    pub sequence_number: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameType, flags: FrameFlags, sequence_number: u16, payload: Bytes) -> Self {
        Self {
            kind: kind.into(),
            flags,
            sequence_number,
            payload,
        }
    }

    #[inline]
    pub fn known_kind(&self) -> Option<FrameType> {
        self.kind.known()
    }

    #[inline]
    pub fn is_first_chunk(&self) -> bool {
        self.flags.contains(FrameFlags::FIRST_CHUNK)
    }

    #[inline]
    pub fn is_last_chunk(&self) -> bool {
        self.flags.contains(FrameFlags::LAST_CHUNK)
    }

    /// Serialize header plus payload, computing the payload CRC.
    pub fn encode(&self) -> Result<Bytes, FramingError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(FramingError::Oversize(self.payload.len()));
        }

        let header = FrameHeader {
            kind: self.kind,
            flags: self.flags.bits(),
            sequence_number: U16::new(self.sequence_number),
            payload_length: U16::new(self.payload.len() as u16),
            crc: U32::new(crc32(&self.payload)),
        };

        let mut out = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        out.put_slice(header.as_bytes());
        out.put_slice(&self.payload);
        Ok(out.freeze())
    }

    /// Parse one whole frame. The input must hold exactly
    /// `HEADER_LEN + payload_length` bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        if bytes.len() < HEADER_LEN {
            return Err(FramingError::TooShort { got: bytes.len() });
        }

        let header = FrameHeader::read_from_bytes(&bytes[..HEADER_LEN])
            .map_err(|_| FramingError::TooShort { got: bytes.len() })?;

        let declared = header.payload_length.get() as usize;
        if declared > MAX_PAYLOAD {
            return Err(FramingError::Oversize(declared));
        }

        let actual = bytes.len() - HEADER_LEN;
        if declared != actual {
            return Err(FramingError::LengthMismatch { declared, actual });
        }

        let payload = &bytes[HEADER_LEN..];
        let computed = crc32(payload);
        let expected = header.crc.get();
        if computed != expected {
            return Err(FramingError::CrcMismatch { expected, computed });
        }

        Ok(Self {
            kind: header.kind,
            flags: FrameFlags::from_bits_retain(header.flags),
            sequence_number: header.sequence_number.get(),
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

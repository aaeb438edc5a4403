// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Payload layouts carried inside `COMMAND` and `RESPONSE` frames.
//!
//! A command payload is `[code, file_id_len, file_id...]`; a response
//! payload is a single status byte. File identifiers are opaque byte
//! strings, interpreted only by the backing store.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Longest file identifier a command payload can carry.
pub const MAX_FILE_ID_LEN: usize = 253;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    Read = 0x01,
    Write = 0x02,
    Abort = 0x03,
}

impl CommandCode {
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => Self::Read,
            0x02 => Self::Write,
            0x03 => Self::Abort,
            _ => return None,
        })
    }
}

/// Single-byte status carried by `RESPONSE` frames.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Ok = 0x00,
    Error = 0x01,
    FileNotFound = 0x02,
    Busy = 0x03,
}

impl ResponseCode {
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::Ok,
            0x01 => Self::Error,
            0x02 => Self::FileNotFound,
            0x03 => Self::Busy,
            _ => return None,
        })
    }

    #[inline]
    pub fn to_payload(self) -> [u8; 1] {
        [self as u8]
    }

    pub fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        let first = *payload.first().ok_or(CommandError::EmptyResponse)?;
        Self::from_u8(first).ok_or(CommandError::UnknownResponse(first))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("command payload too short: {0} bytes")]
    TooShort(usize),
    #[error("file id length {file_id_len} overruns the {payload_len}-byte payload")]
    BadFileIdLen { file_id_len: usize, payload_len: usize },
    #[error("unknown command code 0x{0:02x}")]
    UnknownCode(u8),
    #[error("file id length {0} exceeds the {MAX_FILE_ID_LEN}-byte cap")]
    FileIdTooLong(usize),
    #[error("empty response payload")]
    EmptyResponse,
    #[error("unknown response code 0x{0:02x}")]
    UnknownResponse(u8),
}

/// Parsed opening command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub code: CommandCode,
    pub file_id: Bytes,
}

impl Command {
    /// Build the command payload for a `COMMAND` frame.
    pub fn encode(code: CommandCode, file_id: &[u8]) -> Result<Bytes, CommandError> {
        if file_id.len() > MAX_FILE_ID_LEN {
            return Err(CommandError::FileIdTooLong(file_id.len()));
        }
        let mut out = BytesMut::with_capacity(2 + file_id.len());
        out.put_u8(code as u8);
        out.put_u8(file_id.len() as u8);
        out.put_slice(file_id);
        Ok(out.freeze())
    }

    /// Parse a `COMMAND` frame payload. Trailing bytes past the declared
    /// file id are tolerated; a declared id longer than the payload is not.
    pub fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        if payload.len() < 2 {
            return Err(CommandError::TooShort(payload.len()));
        }

        let file_id_len = payload[1] as usize;
        if file_id_len + 2 > payload.len() {
            return Err(CommandError::BadFileIdLen {
                file_id_len,
                payload_len: payload.len(),
            });
        }

        let code = CommandCode::from_u8(payload[0]).ok_or(CommandError::UnknownCode(payload[0]))?;

        Ok(Self {
            code,
            file_id: Bytes::copy_from_slice(&payload[2..2 + file_id_len]),
        })
    }
}

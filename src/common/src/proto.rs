/*
   Wolkentor: OIDC device-flow logins for Unix hosts
   Copyright (C) David Mulder <dmulder@samba.org> 2025

   This program is free software; you can redistribute it and/or modify
   it under the terms of the GNU General Public License as published by
   the Free Software Foundation; either version 3 of the License, or
   (at your option) any later version.

   This program is distributed in the hope that it will be useful,
   but WITHOUT ANY WARRANTY; without even the implied warranty of
   MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
   GNU General Public License for more details.

   You should have received a copy of the GNU General Public License
   along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! Wire protocol spoken between an unprivileged client and the broker over
//! the Unix domain socket.
//!
//! A session opens with the fixed magic marker and a protocol version,
//! followed by the command header (requested username, configuration key,
//! client info). The broker answers with any number of Log/Info frames and
//! exactly one terminal SuccessResult/FailedResult frame. All integers are
//! big-endian; strings are a u32 byte length followed by UTF-8 bytes.

use std::fmt;
use std::io::{self, Cursor};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::ConfigurationKey;

pub const COMMAND_MAGIC_MARKER: &[u8; 4] = b"EPc1";
pub const COMMAND_VERSION: u16 = 1;

/// Upper bound for any single length-prefixed string on the wire.
pub const MAX_STRING_LEN: u32 = 64 * 1024;

pub type LogLevel = u16;

pub const LOG_LEVEL_ERROR: LogLevel = 1;
pub const LOG_LEVEL_WARN: LogLevel = 2;
pub const LOG_LEVEL_INFO: LogLevel = 3;
pub const LOG_LEVEL_DEBUG: LogLevel = 4;

#[derive(Debug)]
pub enum ProtoError {
    Io(io::Error),
    /// The peer did not open the session with the magic marker, or hung up
    /// before completing the header. Expected from port scanners and
    /// misconfigured clients; never treated as a fault.
    NotOurProtocol,
    UnsupportedVersion(u16),
    IllegalStringLength(u32),
    IllegalUtf8,
    IllegalFrameType(u8),
    IllegalResultCode(u8),
    /// A terminal frame was already sent on this session.
    TerminalAlreadySent,
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::Io(e) => write!(f, "io error: {}", e),
            ProtoError::NotOurProtocol => f.write_str("illegal command header introduction"),
            ProtoError::UnsupportedVersion(v) => {
                write!(f, "client requested unsupported version: {}", v)
            }
            ProtoError::IllegalStringLength(l) => write!(f, "illegal string length: {}", l),
            ProtoError::IllegalUtf8 => f.write_str("illegal utf-8 in string"),
            ProtoError::IllegalFrameType(t) => {
                write!(f, "illegal message call type received: {}", t)
            }
            ProtoError::IllegalResultCode(c) => write!(f, "illegal result code received: {}", c),
            ProtoError::TerminalAlreadySent => {
                f.write_str("terminal frame was already sent on this session")
            }
        }
    }
}

impl std::error::Error for ProtoError {}

impl From<io::Error> for ProtoError {
    fn from(e: io::Error) -> Self {
        ProtoError::Io(e)
    }
}

/// The authoritative outcome of a broker session. Carried as a single byte
/// on the wire; only `Success` satisfies [ResultCode::is_success].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0,
    SystemErr = 1,
    ConfigurationErr = 2,
    RequestingNameForbidden = 3,
    OidcAuthorizeTimeout = 4,
    OidcAuthorizeFailed = 5,
    RequirementResolutionFailed = 6,
    LoginAllowedResolutionFailed = 7,
    LoginForbidden = 8,
    UserEnsuringFailed = 9,
    NoSuchUser = 10,
    Ignore = 11,
}

impl ResultCode {
    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Success)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = match self {
            ResultCode::Success => "success",
            ResultCode::SystemErr => "system error",
            ResultCode::ConfigurationErr => "configuration related error",
            ResultCode::RequestingNameForbidden => "requesting name forbidden",
            ResultCode::OidcAuthorizeTimeout => "oidc authorize timeout",
            ResultCode::OidcAuthorizeFailed => "oidc authorize failed",
            ResultCode::RequirementResolutionFailed => "requirement resolution failed",
            ResultCode::LoginAllowedResolutionFailed => "login allowed resolution failed",
            ResultCode::LoginForbidden => "login forbidden",
            ResultCode::UserEnsuringFailed => "user ensuring failed",
            ResultCode::NoSuchUser => "no such user",
            ResultCode::Ignore => "ignore",
        };
        f.write_str(v)
    }
}

impl TryFrom<u8> for ResultCode {
    type Error = ProtoError;

    fn try_from(v: u8) -> Result<Self, ProtoError> {
        Ok(match v {
            0 => ResultCode::Success,
            1 => ResultCode::SystemErr,
            2 => ResultCode::ConfigurationErr,
            3 => ResultCode::RequestingNameForbidden,
            4 => ResultCode::OidcAuthorizeTimeout,
            5 => ResultCode::OidcAuthorizeFailed,
            6 => ResultCode::RequirementResolutionFailed,
            7 => ResultCode::LoginAllowedResolutionFailed,
            8 => ResultCode::LoginForbidden,
            9 => ResultCode::UserEnsuringFailed,
            10 => ResultCode::NoSuchUser,
            11 => ResultCode::Ignore,
            other => return Err(ProtoError::IllegalResultCode(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHeader {
    pub requested_username: String,
    pub configuration_key: ConfigurationKey,
    pub client_info: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandFrame {
    Log {
        level: LogLevel,
        message: String,
    },
    Info {
        message: String,
    },
    SuccessResult {
        result: ResultCode,
        local_user: String,
        local_uid: u64,
        local_group: String,
        local_gid: u64,
    },
    FailedResult {
        result: ResultCode,
        message: String,
    },
}

const FRAME_TYPE_LOG: u8 = 0;
const FRAME_TYPE_INFO: u8 = 1;
const FRAME_TYPE_SUCCESS_RESULT: u8 = 2;
const FRAME_TYPE_FAILED_RESULT: u8 = 3;

impl CommandFrame {
    /// A terminal frame carries the authoritative outcome; nothing may be
    /// written on a session after one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandFrame::SuccessResult { .. } | CommandFrame::FailedResult { .. }
        )
    }
}

fn put_string(dst: &mut BytesMut, v: &str) {
    dst.put_u32(v.len() as u32);
    dst.put_slice(v.as_bytes());
}

/// Attempt to take one length-prefixed string from the cursor. `Ok(None)`
/// means more bytes are needed.
fn try_get_string(cur: &mut Cursor<&[u8]>) -> Result<Option<String>, ProtoError> {
    if cur.remaining() < 4 {
        return Ok(None);
    }
    let len = cur.get_u32();
    if len > MAX_STRING_LEN {
        return Err(ProtoError::IllegalStringLength(len));
    }
    if cur.remaining() < len as usize {
        return Ok(None);
    }
    let mut buf = vec![0u8; len as usize];
    cur.copy_to_slice(&mut buf);
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| ProtoError::IllegalUtf8)
}

/// Streaming decoder/encoder for the session-opening command header.
pub struct CommandHeaderCodec;

impl Decoder for CommandHeaderCodec {
    type Error = ProtoError;
    type Item = CommandHeader;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < COMMAND_MAGIC_MARKER.len() {
            return Ok(None);
        }
        if &src[..COMMAND_MAGIC_MARKER.len()] != COMMAND_MAGIC_MARKER {
            return Err(ProtoError::NotOurProtocol);
        }

        let mut cur = Cursor::new(&src[COMMAND_MAGIC_MARKER.len()..]);
        if cur.remaining() < 2 {
            return Ok(None);
        }
        let version = cur.get_u16();
        if version != COMMAND_VERSION {
            return Err(ProtoError::UnsupportedVersion(version));
        }

        let Some(requested_username) = try_get_string(&mut cur)? else {
            return Ok(None);
        };
        let Some(raw_key) = try_get_string(&mut cur)? else {
            return Ok(None);
        };
        let Some(client_info) = try_get_string(&mut cur)? else {
            return Ok(None);
        };

        let consumed = COMMAND_MAGIC_MARKER.len() + cur.position() as usize;
        src.advance(consumed);

        // An invalid key on the wire is a client error, but not one that
        // should kill the header decode; the broker reports it via a
        // FailedResult. Carry the raw text through unvalidated.
        Ok(Some(CommandHeader {
            requested_username,
            configuration_key: ConfigurationKey::raw(raw_key),
            client_info,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(header) => Ok(Some(header)),
            None if src.is_empty() => Ok(None),
            // The peer hung up mid-header. Indistinguishable from a probe.
            None => Err(ProtoError::NotOurProtocol),
        }
    }
}

impl Encoder<CommandHeader> for CommandHeaderCodec {
    type Error = ProtoError;

    fn encode(&mut self, header: CommandHeader, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(COMMAND_MAGIC_MARKER);
        dst.put_u16(COMMAND_VERSION);
        put_string(dst, &header.requested_username);
        put_string(dst, header.configuration_key.as_str());
        put_string(dst, &header.client_info);
        Ok(())
    }
}

/// Streaming decoder/encoder for the typed frames that follow the header.
pub struct CommandFrameCodec;

impl Decoder for CommandFrameCodec {
    type Error = ProtoError;
    type Item = CommandFrame;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let mut cur = Cursor::new(&src[..]);
        let frame_type = cur.get_u8();

        let frame = match frame_type {
            FRAME_TYPE_LOG => {
                if cur.remaining() < 2 {
                    return Ok(None);
                }
                let level = cur.get_u16();
                let Some(message) = try_get_string(&mut cur)? else {
                    return Ok(None);
                };
                CommandFrame::Log { level, message }
            }
            FRAME_TYPE_INFO => {
                let Some(message) = try_get_string(&mut cur)? else {
                    return Ok(None);
                };
                CommandFrame::Info { message }
            }
            FRAME_TYPE_SUCCESS_RESULT => {
                if !cur.has_remaining() {
                    return Ok(None);
                }
                let result = ResultCode::try_from(cur.get_u8())?;
                let Some(local_user) = try_get_string(&mut cur)? else {
                    return Ok(None);
                };
                if cur.remaining() < 8 {
                    return Ok(None);
                }
                let local_uid = cur.get_u64();
                let Some(local_group) = try_get_string(&mut cur)? else {
                    return Ok(None);
                };
                if cur.remaining() < 8 {
                    return Ok(None);
                }
                let local_gid = cur.get_u64();
                CommandFrame::SuccessResult {
                    result,
                    local_user,
                    local_uid,
                    local_group,
                    local_gid,
                }
            }
            FRAME_TYPE_FAILED_RESULT => {
                if !cur.has_remaining() {
                    return Ok(None);
                }
                let result = ResultCode::try_from(cur.get_u8())?;
                let Some(message) = try_get_string(&mut cur)? else {
                    return Ok(None);
                };
                CommandFrame::FailedResult { result, message }
            }
            other => return Err(ProtoError::IllegalFrameType(other)),
        };

        let consumed = cur.position() as usize;
        src.advance(consumed);
        Ok(Some(frame))
    }
}

impl Encoder<CommandFrame> for CommandFrameCodec {
    type Error = ProtoError;

    fn encode(&mut self, frame: CommandFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match frame {
            CommandFrame::Log { level, message } => {
                dst.put_u8(FRAME_TYPE_LOG);
                dst.put_u16(level);
                put_string(dst, &message);
            }
            CommandFrame::Info { message } => {
                dst.put_u8(FRAME_TYPE_INFO);
                put_string(dst, &message);
            }
            CommandFrame::SuccessResult {
                result,
                local_user,
                local_uid,
                local_group,
                local_gid,
            } => {
                dst.put_u8(FRAME_TYPE_SUCCESS_RESULT);
                dst.put_u8(result as u8);
                put_string(dst, &local_user);
                dst.put_u64(local_uid);
                put_string(dst, &local_group);
                dst.put_u64(local_gid);
            }
            CommandFrame::FailedResult { result, message } => {
                dst.put_u8(FRAME_TYPE_FAILED_RESULT);
                dst.put_u8(result as u8);
                put_string(dst, &message);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn decode_header(bytes: &[u8]) -> Result<Option<CommandHeader>, ProtoError> {
        let mut buf = BytesMut::from(bytes);
        CommandHeaderCodec.decode(&mut buf)
    }

    fn sample_header() -> CommandHeader {
        CommandHeader {
            requested_username: "alice".to_string(),
            configuration_key: ConfigurationKey::raw("default"),
            client_info: "test-client/1".to_string(),
        }
    }

    #[test]
    fn test_header_round_trip() {
        let mut buf = BytesMut::new();
        CommandHeaderCodec
            .encode(sample_header(), &mut buf)
            .unwrap();
        let decoded = CommandHeaderCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, sample_header());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_rejects_wrong_magic() {
        let err = decode_header(b"nope-this-is-not-it").unwrap_err();
        assert!(matches!(err, ProtoError::NotOurProtocol));
    }

    #[test]
    fn test_header_short_read_wants_more() {
        assert!(decode_header(b"EP").unwrap().is_none());
        assert!(decode_header(b"EPc1\x00").unwrap().is_none());
    }

    #[test]
    fn test_header_short_read_at_eof_is_not_our_protocol() {
        let mut buf = BytesMut::from(&b"EP"[..]);
        let err = CommandHeaderCodec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, ProtoError::NotOurProtocol));
    }

    #[test]
    fn test_header_rejects_wrong_version() {
        let mut buf = BytesMut::new();
        buf.put_slice(COMMAND_MAGIC_MARKER);
        buf.put_u16(7);
        let err = CommandHeaderCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtoError::UnsupportedVersion(7)));
    }

    #[test]
    fn test_header_rejects_oversized_string() {
        let mut buf = BytesMut::new();
        buf.put_slice(COMMAND_MAGIC_MARKER);
        buf.put_u16(COMMAND_VERSION);
        buf.put_u32(MAX_STRING_LEN + 1);
        let err = CommandHeaderCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtoError::IllegalStringLength(_)));
    }

    #[test]
    fn test_frame_round_trips() {
        let frames = vec![
            CommandFrame::Log {
                level: LOG_LEVEL_DEBUG,
                message: "token received".to_string(),
            },
            CommandFrame::Info {
                message: "Open https://idp.example.com/device in your browser".to_string(),
            },
            CommandFrame::SuccessResult {
                result: ResultCode::Success,
                local_user: "alice@example.com".to_string(),
                local_uid: 1000,
                local_group: "sso".to_string(),
                local_gid: 1000,
            },
            CommandFrame::FailedResult {
                result: ResultCode::ConfigurationErr,
                message: "illegal configuration requested by client: nope".to_string(),
            },
        ];
        for frame in frames {
            let mut buf = BytesMut::new();
            CommandFrameCodec.encode(frame.clone(), &mut buf).unwrap();
            let decoded = CommandFrameCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, frame);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_frame_partial_then_complete() {
        let frame = CommandFrame::Info {
            message: "waiting for approval".to_string(),
        };
        let mut full = BytesMut::new();
        CommandFrameCodec.encode(frame.clone(), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..5]);
        assert!(CommandFrameCodec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[5..]);
        let decoded = CommandFrameCodec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_frame_rejects_unknown_type() {
        let mut buf = BytesMut::from(&[42u8][..]);
        let err = CommandFrameCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtoError::IllegalFrameType(42)));
    }

    #[test]
    fn test_only_success_is_success() {
        for raw in 0u8..=11 {
            let code = ResultCode::try_from(raw).unwrap();
            assert_eq!(code.is_success(), raw == 0);
        }
        assert!(matches!(
            ResultCode::try_from(12),
            Err(ProtoError::IllegalResultCode(12))
        ));
    }

    #[test]
    fn test_terminal_frames() {
        assert!(!CommandFrame::Info {
            message: String::new()
        }
        .is_terminal());
        assert!(CommandFrame::FailedResult {
            result: ResultCode::Ignore,
            message: String::new()
        }
        .is_terminal());
    }
}

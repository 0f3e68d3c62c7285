//! Frames the gateway writes to the inbound side.
//!
//! Each frame is one codec frame whose first byte is a tag:
//!
//! | tag  | frame         | body                                 |
//! |------|---------------|--------------------------------------|
//! | 0x01 | `Response`    | backend response payload             |
//! | 0x02 | `Data`        | u64 BE sequence number, then payload |
//! | 0x03 | `Resync`      | u64 BE next sequence number          |
//! | 0x04 | `End`         | 0 = clean, 1 = failed                |
//! | 0x05 | `Unavailable` | UTF-8 reason code                    |

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::session::EndStatus;

const TAG_RESPONSE: u8 = 0x01;
const TAG_DATA: u8 = 0x02;
const TAG_RESYNC: u8 = 0x03;
const TAG_END: u8 = 0x04;
const TAG_UNAVAILABLE: u8 = 0x05;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Reply to a unary request.
    Response(Bytes),
    /// One pushed stream frame.
    Data { seq: u64, payload: Bytes },
    /// The requested resume point is gone; restart from `next_seq`.
    Resync { next_seq: u64 },
    /// The stream is over.
    End(EndStatus),
    /// The request could not be served; retriable.
    Unavailable { code: String },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    #[error("frame body too short")]
    Short,
    #[error("unavailable code is not UTF-8")]
    Utf8,
}

impl ClientFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            ClientFrame::Response(payload) => {
                buf.put_u8(TAG_RESPONSE);
                buf.put_slice(payload);
            }
            ClientFrame::Data { seq, payload } => {
                buf.reserve(9 + payload.len());
                buf.put_u8(TAG_DATA);
                buf.put_u64(*seq);
                buf.put_slice(payload);
            }
            ClientFrame::Resync { next_seq } => {
                buf.put_u8(TAG_RESYNC);
                buf.put_u64(*next_seq);
            }
            ClientFrame::End(status) => {
                buf.put_u8(TAG_END);
                buf.put_u8(match status {
                    EndStatus::Clean => 0,
                    EndStatus::Failed => 1,
                });
            }
            ClientFrame::Unavailable { code } => {
                buf.put_u8(TAG_UNAVAILABLE);
                buf.put_slice(code.as_bytes());
            }
        }
        buf.freeze()
    }

    pub fn decode(mut frame: Bytes) -> Result<Self, FrameError> {
        if frame.is_empty() {
            return Err(FrameError::Empty);
        }
        let tag = frame.get_u8();
        match tag {
            TAG_RESPONSE => Ok(ClientFrame::Response(frame)),
            TAG_DATA => {
                if frame.len() < 8 {
                    return Err(FrameError::Short);
                }
                let seq = frame.get_u64();
                Ok(ClientFrame::Data { seq, payload: frame })
            }
            TAG_RESYNC => {
                if frame.len() < 8 {
                    return Err(FrameError::Short);
                }
                Ok(ClientFrame::Resync {
                    next_seq: frame.get_u64(),
                })
            }
            TAG_END => match frame.first() {
                Some(0) => Ok(ClientFrame::End(EndStatus::Clean)),
                Some(_) => Ok(ClientFrame::End(EndStatus::Failed)),
                None => Err(FrameError::Short),
            },
            TAG_UNAVAILABLE => String::from_utf8(frame.to_vec())
                .map(|code| ClientFrame::Unavailable { code })
                .map_err(|_| FrameError::Utf8),
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

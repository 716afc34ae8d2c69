//! The raw text wire frame: `event;msg_id;flag;payload_json`.

use crate::error::{Error, Result};

/// Per-frame flag. `AckNormal`/`AckError` mark a reply to a prior `msg_id`;
/// `NeedAck` asks the peer to reply; `NoAck` is fire-and-forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    AckNormal = 0,
    AckError = 1,
    NeedAck = 2,
    NoAck = 4,
}

impl Flag {
    fn from_i64(v: i64) -> Result<Self> {
        match v {
            0 => Ok(Flag::AckNormal),
            1 => Ok(Flag::AckError),
            2 => Ok(Flag::NeedAck),
            4 => Ok(Flag::NoAck),
            other => Err(Error::Protocol(format!("unknown wire flag {other}"))),
        }
    }
}

/// A decoded (or to-be-encoded) wire frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Empty for ack frames.
    pub event: String,
    pub msg_id: u64,
    pub flag: Flag,
    /// The remainder of the frame, verbatim — not re-parsed here.
    pub payload_json: String,
}

impl Frame {
    pub fn encode(&self) -> String {
        format!("{};{};{};{}", self.event, self.msg_id, self.flag as i64, self.payload_json)
    }

    pub fn decode(text: &str) -> Result<Self> {
        let mut parts = text.splitn(4, ';');
        let event = parts.next().unwrap_or_default().to_string();
        let msg_id: u64 = parts
            .next()
            .ok_or_else(|| Error::Protocol("frame missing msg_id field".into()))?
            .parse()
            .map_err(|_| Error::Protocol("frame msg_id is not a non-negative integer".into()))?;
        let flag_raw: i64 = parts
            .next()
            .ok_or_else(|| Error::Protocol("frame missing flag field".into()))?
            .parse()
            .map_err(|_| Error::Protocol("frame flag is not an integer".into()))?;
        let flag = Flag::from_i64(flag_raw)?;
        let payload_json = parts.next().unwrap_or_default().to_string();
        Ok(Frame {
            event,
            msg_id,
            flag,
            payload_json,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let frame = Frame {
            event: "sdp".into(),
            msg_id: 7,
            flag: Flag::NeedAck,
            payload_json: r#"{"type":"offer"}"#.into(),
        };
        let text = frame.encode();
        assert_eq!(text, r#"sdp;7;2;{"type":"offer"}"#);
        let back = Frame::decode(&text).unwrap();
        assert_eq!(back.event, "sdp");
        assert_eq!(back.msg_id, 7);
        assert_eq!(back.flag, Flag::NeedAck);
        assert_eq!(back.payload_json, r#"{"type":"offer"}"#);
    }

    #[test]
    fn ack_frame_has_empty_event() {
        let text = ";3;0;{}";
        let frame = Frame::decode(text).unwrap();
        assert_eq!(frame.event, "");
        assert_eq!(frame.flag, Flag::AckNormal);
    }

    #[test]
    fn payload_may_itself_contain_semicolons() {
        let text = r#"custom:chat;9;4;{"content":"a;b;c"}"#;
        let frame = Frame::decode(text).unwrap();
        assert_eq!(frame.payload_json, r#"{"content":"a;b;c"}"#);
    }

    #[test]
    fn rejects_unknown_flag() {
        assert!(Frame::decode("ev;1;9;{}").is_err());
    }
}

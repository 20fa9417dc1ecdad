//! Wire protocol frames.
//!
//! Every frame is a JSON array whose first element names the command.
//!
//! **Client → Relay:** `EVENT`, `REQ`, `CLOSE`, `CHANGES`, `LASTSEQ`,
//! `CHANGES_SUB`, `CHANGES_UNSUB`.
//!
//! **Relay → Client:** `EVENT`, `OK`, `EOSE`, `CLOSED`, `NOTICE`,
//! `CHANGES`, `LASTSEQ`, `CHANGES_EVENT`, `CHANGES_EOSE`.

use serde_json::Value;
use thiserror::Error;

use crate::event::Event;
use crate::store::Change;

/// Errors produced while parsing a client frame.
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("could not parse frame: {0}")]
    InvalidJson(String),
    #[error("frame must be a non-empty JSON array")]
    NotArray,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("malformed {0} command: {1}")]
    Malformed(&'static str, String),
}

/// Commands sent from client to relay.
///
/// Event and filter payloads stay as raw JSON values here; the dispatch
/// layer validates them so failures can be answered on the right surface
/// (`OK` for events, `CLOSED` for subscriptions).
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// `["EVENT", <event>]`
    Event(Value),
    /// `["REQ", <sub_id>, <filter>, ...]` with at least one filter.
    Req { sub_id: String, filters: Vec<Value> },
    /// `["CLOSE", <sub_id>]`
    Close { sub_id: String },
    /// `["CHANGES", <options>]`
    Changes(Value),
    /// `["LASTSEQ"]`
    LastSeq,
    /// `["CHANGES_SUB", <sub_id>, <options>]`
    ChangesSub { sub_id: String, options: Value },
    /// `["CHANGES_UNSUB", <sub_id>]`
    ChangesUnsub { sub_id: String },
}

fn sub_id_arg(arr: &[Value], cmd: &'static str) -> Result<String, FrameError> {
    arr.get(1)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(FrameError::Malformed(cmd, "missing subscription id".into()))
}

impl ClientFrame {
    /// Parse one frame of client input.
    pub fn from_json(input: &str) -> Result<Self, FrameError> {
        let val: Value = serde_json::from_str(input)
            .map_err(|e| FrameError::InvalidJson(e.to_string()))?;
        let arr = val.as_array().filter(|a| !a.is_empty()).ok_or(FrameError::NotArray)?;
        let command = arr[0].as_str().ok_or(FrameError::NotArray)?;
        match command {
            "EVENT" => match arr.get(1) {
                Some(ev) => Ok(ClientFrame::Event(ev.clone())),
                None => Err(FrameError::Malformed("EVENT", "missing event".into())),
            },
            "REQ" => {
                let sub_id = sub_id_arg(arr, "REQ")?;
                if arr.len() < 3 {
                    return Err(FrameError::Malformed("REQ", "missing filter".into()));
                }
                Ok(ClientFrame::Req {
                    sub_id,
                    filters: arr[2..].to_vec(),
                })
            }
            "CLOSE" => Ok(ClientFrame::Close {
                sub_id: sub_id_arg(arr, "CLOSE")?,
            }),
            "CHANGES" => match arr.get(1) {
                Some(opts) => Ok(ClientFrame::Changes(opts.clone())),
                None => Err(FrameError::Malformed("CHANGES", "missing options".into())),
            },
            "LASTSEQ" => Ok(ClientFrame::LastSeq),
            "CHANGES_SUB" => {
                let sub_id = sub_id_arg(arr, "CHANGES_SUB")?;
                let options = arr
                    .get(2)
                    .cloned()
                    .ok_or(FrameError::Malformed("CHANGES_SUB", "missing options".into()))?;
                Ok(ClientFrame::ChangesSub { sub_id, options })
            }
            "CHANGES_UNSUB" => Ok(ClientFrame::ChangesUnsub {
                sub_id: sub_id_arg(arr, "CHANGES_UNSUB")?,
            }),
            other => Err(FrameError::UnknownCommand(other.to_string())),
        }
    }
}

/// Frames sent from relay to client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    /// `["EVENT", <sub_id>, <event>]`
    Event { sub_id: String, event: Event },
    /// `["OK", <event_id>, <accepted>, <reason>]`
    Ok {
        event_id: String,
        accepted: bool,
        reason: String,
    },
    /// `["EOSE", <sub_id>]`
    Eose { sub_id: String },
    /// `["CLOSED", <sub_id>, <reason>]`
    Closed { sub_id: String, reason: String },
    /// `["NOTICE", <text>]`
    Notice { text: String },
    /// `["CHANGES", {changes, lastSeq}]`
    Changes { changes: Vec<Change>, last_seq: i64 },
    /// `["LASTSEQ", <seq>]`
    LastSeq(i64),
    /// `["CHANGES_EVENT", <sub_id>, {seq, event}]`
    ChangesEvent {
        sub_id: String,
        seq: i64,
        event: Event,
    },
    /// `["CHANGES_EOSE", <sub_id>, {lastSeq}]`
    ChangesEose { sub_id: String, last_seq: i64 },
}

impl RelayFrame {
    /// Serialize the frame for the wire.
    pub fn to_json(&self) -> String {
        match self {
            RelayFrame::Event { sub_id, event } => {
                serde_json::json!(["EVENT", sub_id, event]).to_string()
            }
            RelayFrame::Ok {
                event_id,
                accepted,
                reason,
            } => serde_json::json!(["OK", event_id, accepted, reason]).to_string(),
            RelayFrame::Eose { sub_id } => serde_json::json!(["EOSE", sub_id]).to_string(),
            RelayFrame::Closed { sub_id, reason } => {
                serde_json::json!(["CLOSED", sub_id, reason]).to_string()
            }
            RelayFrame::Notice { text } => serde_json::json!(["NOTICE", text]).to_string(),
            RelayFrame::Changes { changes, last_seq } => {
                let rows: Vec<Value> = changes
                    .iter()
                    .map(|c| serde_json::json!({"seq": c.seq, "event": c.event}))
                    .collect();
                serde_json::json!(["CHANGES", {"changes": rows, "lastSeq": last_seq}]).to_string()
            }
            RelayFrame::LastSeq(seq) => serde_json::json!(["LASTSEQ", seq]).to_string(),
            RelayFrame::ChangesEvent { sub_id, seq, event } => {
                serde_json::json!(["CHANGES_EVENT", sub_id, {"seq": seq, "event": event}])
                    .to_string()
            }
            RelayFrame::ChangesEose { sub_id, last_seq } => {
                serde_json::json!(["CHANGES_EOSE", sub_id, {"lastSeq": last_seq}]).to_string()
            }
        }
    }

    /// Create an EVENT frame.
    pub fn event(sub_id: impl Into<String>, event: Event) -> Self {
        RelayFrame::Event {
            sub_id: sub_id.into(),
            event,
        }
    }

    /// Create an OK acknowledgement.
    pub fn ok(event_id: impl Into<String>, accepted: bool, reason: impl Into<String>) -> Self {
        RelayFrame::Ok {
            event_id: event_id.into(),
            accepted,
            reason: reason.into(),
        }
    }

    /// Create an EOSE frame.
    pub fn eose(sub_id: impl Into<String>) -> Self {
        RelayFrame::Eose {
            sub_id: sub_id.into(),
        }
    }

    /// Create a CLOSED frame.
    pub fn closed(sub_id: impl Into<String>, reason: impl Into<String>) -> Self {
        RelayFrame::Closed {
            sub_id: sub_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a NOTICE frame.
    pub fn notice(text: impl Into<String>) -> Self {
        RelayFrame::Notice { text: text.into() }
    }

    /// Create a CHANGES_EVENT frame.
    pub fn changes_event(sub_id: impl Into<String>, seq: i64, event: Event) -> Self {
        RelayFrame::ChangesEvent {
            sub_id: sub_id.into(),
            seq,
            event,
        }
    }

    /// Create a CHANGES_EOSE frame.
    pub fn changes_eose(sub_id: impl Into<String>, last_seq: i64) -> Self {
        RelayFrame::ChangesEose {
            sub_id: sub_id.into(),
            last_seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;

    fn sample_event() -> Event {
        Event {
            id: "aa".repeat(32),
            pubkey: "bb".repeat(32),
            kind: 1,
            created_at: 5,
            tags: vec![Tag(vec!["t".into(), "x".into()])],
            content: "hi".into(),
            sig: "cc".repeat(64),
        }
    }

    #[test]
    fn parse_event() {
        let frame = ClientFrame::from_json(r#"["EVENT", {"kind": 1}]"#).unwrap();
        assert_eq!(frame, ClientFrame::Event(serde_json::json!({"kind": 1})));
    }

    #[test]
    fn parse_req_with_filters() {
        let frame =
            ClientFrame::from_json(r#"["REQ", "sub1", {"kinds": [1]}, {"authors": ["p"]}]"#)
                .unwrap();
        match frame {
            ClientFrame::Req { sub_id, filters } => {
                assert_eq!(sub_id, "sub1");
                assert_eq!(filters.len(), 2);
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn parse_req_requires_filter() {
        assert_eq!(
            ClientFrame::from_json(r#"["REQ", "sub1"]"#),
            Err(FrameError::Malformed("REQ", "missing filter".into()))
        );
    }

    #[test]
    fn parse_close_and_unsub() {
        assert_eq!(
            ClientFrame::from_json(r#"["CLOSE", "s"]"#).unwrap(),
            ClientFrame::Close { sub_id: "s".into() }
        );
        assert_eq!(
            ClientFrame::from_json(r#"["CHANGES_UNSUB", "f"]"#).unwrap(),
            ClientFrame::ChangesUnsub { sub_id: "f".into() }
        );
    }

    #[test]
    fn parse_changes_commands() {
        assert_eq!(
            ClientFrame::from_json(r#"["CHANGES", {"since": 3}]"#).unwrap(),
            ClientFrame::Changes(serde_json::json!({"since": 3}))
        );
        assert_eq!(
            ClientFrame::from_json(r#"["LASTSEQ"]"#).unwrap(),
            ClientFrame::LastSeq
        );
        assert_eq!(
            ClientFrame::from_json(r#"["CHANGES_SUB", "f", {}]"#).unwrap(),
            ClientFrame::ChangesSub {
                sub_id: "f".into(),
                options: serde_json::json!({}),
            }
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            ClientFrame::from_json("not json"),
            Err(FrameError::InvalidJson(_))
        ));
        assert_eq!(ClientFrame::from_json("{}"), Err(FrameError::NotArray));
        assert_eq!(ClientFrame::from_json("[]"), Err(FrameError::NotArray));
        assert_eq!(ClientFrame::from_json("[42]"), Err(FrameError::NotArray));
        assert_eq!(
            ClientFrame::from_json(r#"["SYNC"]"#),
            Err(FrameError::UnknownCommand("SYNC".into()))
        );
        assert!(matches!(
            ClientFrame::from_json(r#"["CHANGES_SUB", "f"]"#),
            Err(FrameError::Malformed("CHANGES_SUB", _))
        ));
    }

    #[test]
    fn relay_frames_serialize() {
        assert_eq!(
            RelayFrame::eose("s").to_json(),
            r#"["EOSE","s"]"#
        );
        assert_eq!(
            RelayFrame::ok("abc", true, "").to_json(),
            r#"["OK","abc",true,""]"#
        );
        assert_eq!(
            RelayFrame::closed("s", "invalid: nope").to_json(),
            r#"["CLOSED","s","invalid: nope"]"#
        );
        assert_eq!(RelayFrame::LastSeq(9).to_json(), r#"["LASTSEQ",9]"#);
    }

    #[test]
    fn changes_frames_serialize() {
        let ev = sample_event();
        let json = RelayFrame::Changes {
            changes: vec![Change {
                seq: 4,
                event: ev.clone(),
            }],
            last_seq: 7,
        }
        .to_json();
        let val: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(val[0], "CHANGES");
        assert_eq!(val[1]["lastSeq"], 7);
        assert_eq!(val[1]["changes"][0]["seq"], 4);
        assert_eq!(val[1]["changes"][0]["event"]["id"], ev.id);

        let json = RelayFrame::changes_event("f", 4, ev.clone()).to_json();
        let val: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(val[0], "CHANGES_EVENT");
        assert_eq!(val[1], "f");
        assert_eq!(val[2]["seq"], 4);

        let json = RelayFrame::changes_eose("f", 11).to_json();
        let val: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(val[2]["lastSeq"], 11);
    }
}

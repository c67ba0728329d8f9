//! Message records exchanged with clients.
//!
//! Every client message after the length prefix starts with a
//! [`RequestHeader`], every server message with a [`ReplyHeader`], except the
//! session handshake which exchanges a bare [`ConnectRequest`] /
//! [`ConnectResponse`] pair.

use crate::proto::archive::{
    self, read_buffer, read_i32, read_i64, read_string, write_buffer, write_i32, write_i64,
    write_string,
};
use bytes::{Bytes, BytesMut};

/// xid reserved for watch notifications pushed by the server.
pub const NOTIFICATION_XID: i32 = -1;
/// xid used by client heartbeats.
pub const PING_XID: i32 = -2;
/// xid used by authentication packets.
pub const AUTH_XID: i32 = -4;

/// Request type codes understood at the framing layer.
pub mod op_code {
    pub const NOTIFICATION: i32 = 0;
    pub const PING: i32 = 11;
    pub const AUTH: i32 = 100;
}

/// Error codes carried in [`ReplyHeader::err`].
pub mod error_code {
    pub const OK: i32 = 0;
    pub const AUTH_FAILED: i32 = -115;
}

/// Length of the password buffer issued with every session.
pub const SESSION_PASSWD_LEN: usize = 16;

/// First message of a connection: the client's session proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub protocol_version: i32,
    pub last_zxid_seen: i64,
    pub timeout: i32,
    pub session_id: i64,
    pub passwd: Vec<u8>,
}

impl ConnectRequest {
    pub fn deserialize(buf: &mut Bytes) -> Result<Self, archive::ArchiveError> {
        Ok(Self {
            protocol_version: read_i32(buf)?,
            last_zxid_seen: read_i64(buf)?,
            timeout: read_i32(buf)?,
            session_id: read_i64(buf)?,
            passwd: read_buffer(buf)?,
        })
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        write_i32(buf, self.protocol_version);
        write_i64(buf, self.last_zxid_seen);
        write_i32(buf, self.timeout);
        write_i64(buf, self.session_id);
        write_buffer(buf, &self.passwd);
    }
}

/// Server's answer to a [`ConnectRequest`]. Timeout, id, and password are
/// zeroed when the session is refused or expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub protocol_version: i32,
    pub timeout: i32,
    pub session_id: i64,
    pub passwd: Vec<u8>,
}

impl ConnectResponse {
    pub fn deserialize(buf: &mut Bytes) -> Result<Self, archive::ArchiveError> {
        Ok(Self {
            protocol_version: read_i32(buf)?,
            timeout: read_i32(buf)?,
            session_id: read_i64(buf)?,
            passwd: read_buffer(buf)?,
        })
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        write_i32(buf, self.protocol_version);
        write_i32(buf, self.timeout);
        write_i64(buf, self.session_id);
        write_buffer(buf, &self.passwd);
    }
}

/// Header of every post-handshake client message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub xid: i32,
    pub rtype: i32,
}

impl RequestHeader {
    pub fn deserialize(buf: &mut Bytes) -> Result<Self, archive::ArchiveError> {
        Ok(Self {
            xid: read_i32(buf)?,
            rtype: read_i32(buf)?,
        })
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        write_i32(buf, self.xid);
        write_i32(buf, self.rtype);
    }
}

/// Header of every post-handshake server message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: i32,
    pub zxid: i64,
    pub err: i32,
}

impl ReplyHeader {
    pub fn new(xid: i32, zxid: i64, err: i32) -> Self {
        Self { xid, zxid, err }
    }

    pub fn deserialize(buf: &mut Bytes) -> Result<Self, archive::ArchiveError> {
        Ok(Self {
            xid: read_i32(buf)?,
            zxid: read_i64(buf)?,
            err: read_i32(buf)?,
        })
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        write_i32(buf, self.xid);
        write_i64(buf, self.zxid);
        write_i32(buf, self.err);
    }
}

/// Body of an `auth`-type request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPacket {
    pub auth_type: i32,
    pub scheme: String,
    pub auth: Vec<u8>,
}

impl AuthPacket {
    pub fn deserialize(buf: &mut Bytes) -> Result<Self, archive::ArchiveError> {
        Ok(Self {
            auth_type: read_i32(buf)?,
            scheme: read_string(buf)?,
            auth: read_buffer(buf)?,
        })
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        write_i32(buf, self.auth_type);
        write_string(buf, &self.scheme);
        write_buffer(buf, &self.auth);
    }
}

/// Body of a watch notification (paired with `xid = -1`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
    pub event_type: i32,
    pub state: i32,
    pub path: String,
}

impl WatcherEvent {
    pub fn deserialize(buf: &mut Bytes) -> Result<Self, archive::ArchiveError> {
        Ok(Self {
            event_type: read_i32(buf)?,
            state: read_i32(buf)?,
            path: read_string(buf)?,
        })
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        write_i32(buf, self.event_type);
        write_i32(buf, self.state);
        write_string(buf, &self.path);
    }
}

/// An authenticated identity attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Id {
    pub scheme: String,
    pub id: String,
}

impl Id {
    pub fn new(scheme: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            id: id.into(),
        }
    }
}

/// A response body the connection layer can serialise after a
/// [`ReplyHeader`]. The request pipeline hands pre-serialised record bytes
/// through [`ResponseBody::Raw`]; the connection layer itself only ever
/// produces the other variants.
#[derive(Debug, Clone)]
pub enum ResponseBody {
    Connect(ConnectResponse),
    Watcher(WatcherEvent),
    Raw(Bytes),
}

impl ResponseBody {
    pub fn serialize(&self, buf: &mut BytesMut) {
        match self {
            ResponseBody::Connect(r) => r.serialize(buf),
            ResponseBody::Watcher(e) => e.serialize(buf),
            ResponseBody::Raw(b) => buf.extend_from_slice(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_request_wire_size() {
        // 4 + 8 + 4 + 8 + (4 + 16): the canonical first frame is 44 bytes.
        let req = ConnectRequest {
            protocol_version: 0,
            last_zxid_seen: 0,
            timeout: 30_000,
            session_id: 0,
            passwd: vec![0u8; SESSION_PASSWD_LEN],
        };
        let mut buf = BytesMut::new();
        req.serialize(&mut buf);
        assert_eq!(buf.len(), 44);

        let mut bytes = buf.freeze();
        assert_eq!(ConnectRequest::deserialize(&mut bytes).unwrap(), req);
    }

    #[test]
    fn test_reply_header_round_trip() {
        let h = ReplyHeader::new(NOTIFICATION_XID, -1, error_code::OK);
        let mut buf = BytesMut::new();
        h.serialize(&mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(ReplyHeader::deserialize(&mut bytes).unwrap(), h);
    }

    #[test]
    fn test_auth_packet_round_trip() {
        let p = AuthPacket {
            auth_type: 0,
            scheme: "digest".into(),
            auth: b"user:pass".to_vec(),
        };
        let mut buf = BytesMut::new();
        p.serialize(&mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(AuthPacket::deserialize(&mut bytes).unwrap(), p);
    }

    #[test]
    fn test_watcher_event_round_trip() {
        let e = WatcherEvent {
            event_type: 1,
            state: 3,
            path: "/ledger/members".into(),
        };
        let mut buf = BytesMut::new();
        e.serialize(&mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(WatcherEvent::deserialize(&mut bytes).unwrap(), e);
    }

    #[test]
    fn test_truncated_connect_request() {
        let mut bytes = Bytes::from_static(&[0, 0, 0, 0, 1]);
        assert!(ConnectRequest::deserialize(&mut bytes).is_err());
    }
}

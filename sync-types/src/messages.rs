//! Protocol commands for peersync.
//!
//! Every command is a JSON document with a `command` discriminator, for
//! example:
//!
//! ```text
//! {"command":"HANDSHAKE_REQUEST","hostPort":{"host":"10.0.0.7","port":8111}}
//! ```
//!
//! Framing on the stream is handled by the peer crate; this module only maps
//! between [`Command`] and document bytes.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{FileMeta, PeerAddress, WireError};

/// Every `command` value this crate understands.
pub const COMMAND_KINDS: &[&str] = &[
    "HANDSHAKE_REQUEST",
    "HANDSHAKE_RESPONSE",
    "CONNECTION_REFUSED",
    "INVALID_PROTOCOL",
    "CONNECTION_EXISTS",
    "FILE_CREATE_REQUEST",
    "FILE_CREATE_RESPONSE",
    "FILE_MODIFY_REQUEST",
    "FILE_MODIFY_RESPONSE",
    "FILE_DELETE_REQUEST",
    "FILE_DELETE_RESPONSE",
    "DIRECTORY_CREATE_REQUEST",
    "DIRECTORY_CREATE_RESPONSE",
    "DIRECTORY_DELETE_REQUEST",
    "DIRECTORY_DELETE_RESPONSE",
    "FILE_BYTES_REQUEST",
    "FILE_BYTES_RESPONSE",
    "HEARTBEAT",
];

/// All possible protocol commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Opens a connection; carries the sender's advertised address
    HandshakeRequest(Handshake),
    /// Admission granted; carries the listener's advertised address
    HandshakeResponse(Handshake),
    /// Admission refused for capacity; lists peers to try instead
    ConnectionRefused(ConnectionRefused),
    /// Protocol violation or duplicate connection
    InvalidProtocol(Notice),
    /// Duplicate connection (decoded for compatibility, never sent)
    ConnectionExists(Notice),
    /// Ask the peer to create a file
    FileCreateRequest(FileRequest),
    /// Outcome of a create
    FileCreateResponse(FileResponse),
    /// Ask the peer to replace a file's content
    FileModifyRequest(FileRequest),
    /// Outcome of a modify
    FileModifyResponse(FileResponse),
    /// Ask the peer to delete a file
    FileDeleteRequest(FileRequest),
    /// Outcome of a delete
    FileDeleteResponse(FileResponse),
    /// Ask the peer to create a directory
    DirectoryCreateRequest(DirectoryRequest),
    /// Outcome of a directory create
    DirectoryCreateResponse(DirectoryResponse),
    /// Ask the peer to remove a directory
    DirectoryDeleteRequest(DirectoryRequest),
    /// Outcome of a directory delete
    DirectoryDeleteResponse(DirectoryResponse),
    /// Pull one chunk of a file
    FileBytesRequest(BytesRequest),
    /// One chunk of a file
    FileBytesResponse(BytesResponse),
    /// Keepalive sent when a connection has been quiet
    Heartbeat,
}

impl Command {
    /// Serialize to JSON document bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Serialization)
    }

    /// Deserialize from JSON document bytes.
    ///
    /// Distinguishes a document with an unrecognised `command` (which can be
    /// skipped) from one that is not a command document at all.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| WireError::Malformed(e.to_string()))?;

        let kind = match value.as_object().map(|o| o.get("command")) {
            None => return Err(WireError::Malformed("not a JSON object".into())),
            Some(None) => return Err(WireError::Malformed("missing `command` field".into())),
            Some(Some(serde_json::Value::String(kind))) => kind.clone(),
            Some(Some(_)) => return Err(WireError::Malformed("`command` is not a string".into())),
        };

        if !COMMAND_KINDS.contains(&kind.as_str()) {
            return Err(WireError::UnknownKind(kind));
        }

        serde_json::from_value(value).map_err(|e| WireError::Malformed(format!("{kind}: {e}")))
    }

    /// The `command` discriminator as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::HandshakeRequest(_) => "HANDSHAKE_REQUEST",
            Command::HandshakeResponse(_) => "HANDSHAKE_RESPONSE",
            Command::ConnectionRefused(_) => "CONNECTION_REFUSED",
            Command::InvalidProtocol(_) => "INVALID_PROTOCOL",
            Command::ConnectionExists(_) => "CONNECTION_EXISTS",
            Command::FileCreateRequest(_) => "FILE_CREATE_REQUEST",
            Command::FileCreateResponse(_) => "FILE_CREATE_RESPONSE",
            Command::FileModifyRequest(_) => "FILE_MODIFY_REQUEST",
            Command::FileModifyResponse(_) => "FILE_MODIFY_RESPONSE",
            Command::FileDeleteRequest(_) => "FILE_DELETE_REQUEST",
            Command::FileDeleteResponse(_) => "FILE_DELETE_RESPONSE",
            Command::DirectoryCreateRequest(_) => "DIRECTORY_CREATE_REQUEST",
            Command::DirectoryCreateResponse(_) => "DIRECTORY_CREATE_RESPONSE",
            Command::DirectoryDeleteRequest(_) => "DIRECTORY_DELETE_REQUEST",
            Command::DirectoryDeleteResponse(_) => "DIRECTORY_DELETE_RESPONSE",
            Command::FileBytesRequest(_) => "FILE_BYTES_REQUEST",
            Command::FileBytesResponse(_) => "FILE_BYTES_RESPONSE",
            Command::Heartbeat => "HEARTBEAT",
        }
    }

    /// `HANDSHAKE_REQUEST` from `address`.
    pub fn handshake_request(address: PeerAddress) -> Self {
        Command::HandshakeRequest(Handshake { host_port: address })
    }

    /// `HANDSHAKE_RESPONSE` from `address`.
    pub fn handshake_response(address: PeerAddress) -> Self {
        Command::HandshakeResponse(Handshake { host_port: address })
    }

    /// `CONNECTION_REFUSED` listing `peers`.
    pub fn connection_refused(message: impl Into<String>, peers: Vec<PeerAddress>) -> Self {
        Command::ConnectionRefused(ConnectionRefused {
            message: message.into(),
            peers,
        })
    }

    /// `INVALID_PROTOCOL` with a reason.
    pub fn invalid_protocol(message: impl Into<String>) -> Self {
        Command::InvalidProtocol(Notice {
            message: message.into(),
        })
    }
}

/// Body of both handshake commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Advertised address of the sender
    pub host_port: PeerAddress,
}

/// Body of `CONNECTION_REFUSED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRefused {
    /// Human-readable reason
    pub message: String,
    /// Peers currently connected to the refusing node
    pub peers: Vec<PeerAddress>,
}

/// Body of `INVALID_PROTOCOL` and `CONNECTION_EXISTS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Human-readable reason
    pub message: String,
}

/// Outcome of a request: `"ok"` or `{"refused": reason}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// The request was carried out
    Ok,
    /// The request was declined; the reason is informational
    Refused(String),
}

impl Status {
    /// A refusal with the given reason.
    pub fn refused(reason: impl Into<String>) -> Self {
        Status::Refused(reason.into())
    }

    /// Whether the request was carried out.
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::Refused(reason) => write!(f, "refused: {reason}"),
        }
    }
}

/// A file create, modify or delete request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    /// Path relative to the share root
    pub path_name: String,
    /// Version of the file the sender has
    pub file_descriptor: FileMeta,
}

/// Response to a [`FileRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse {
    /// Path from the request
    pub path_name: String,
    /// Descriptor from the request
    pub file_descriptor: FileMeta,
    /// Outcome
    pub status: Status,
}

/// A directory create or delete request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryRequest {
    /// Path relative to the share root
    pub path_name: String,
}

/// Response to a [`DirectoryRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryResponse {
    /// Path from the request
    pub path_name: String,
    /// Outcome
    pub status: Status,
}

/// Request for `length` bytes of a file starting at `position`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BytesRequest {
    /// Path relative to the share root
    pub path_name: String,
    /// Version being transferred
    pub file_descriptor: FileMeta,
    /// Offset of the first byte
    pub position: u64,
    /// Number of bytes wanted
    pub length: u64,
}

/// One chunk of file content.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BytesResponse {
    /// Path relative to the share root
    pub path_name: String,
    /// Version being transferred
    pub file_descriptor: FileMeta,
    /// Offset of the first byte
    pub position: u64,
    /// Number of bytes in `content`
    pub length: u64,
    /// The bytes, base64 on the wire
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    pub content: Vec<u8>,
    /// Whether this chunk ends the file
    pub done: bool,
    /// Outcome of the read
    pub status: Status,
}

impl std::fmt::Debug for BytesResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BytesResponse")
            .field("path_name", &self.path_name)
            .field("file_descriptor", &self.file_descriptor)
            .field("position", &self.position)
            .field("length", &self.length)
            .field("content", &format!("[{} bytes]", self.content.len()))
            .field("done", &self.done)
            .field("status", &self.status)
            .finish()
    }
}

fn to_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> FileMeta {
        FileMeta::of_content(b"hello world", 1_705_000_000_000)
    }

    fn one_of_each() -> Vec<Command> {
        let file = FileRequest {
            path_name: "docs/a.txt".into(),
            file_descriptor: meta(),
        };
        let answered = FileResponse {
            path_name: "docs/a.txt".into(),
            file_descriptor: meta(),
            status: Status::Ok,
        };
        let dir = DirectoryRequest {
            path_name: "docs".into(),
        };
        let dir_answered = DirectoryResponse {
            path_name: "docs".into(),
            status: Status::refused("pathname already exists"),
        };
        vec![
            Command::handshake_request(PeerAddress::new("10.0.0.1", 8111)),
            Command::handshake_response(PeerAddress::new("10.0.0.2", 8112)),
            Command::connection_refused(
                "connection limit reached",
                vec![PeerAddress::new("a", 1), PeerAddress::new("b", 2)],
            ),
            Command::invalid_protocol("peer already connected"),
            Command::ConnectionExists(Notice {
                message: "peer already connected".into(),
            }),
            Command::FileCreateRequest(file.clone()),
            Command::FileCreateResponse(answered.clone()),
            Command::FileModifyRequest(file.clone()),
            Command::FileModifyResponse(answered.clone()),
            Command::FileDeleteRequest(file),
            Command::FileDeleteResponse(answered),
            Command::DirectoryCreateRequest(dir.clone()),
            Command::DirectoryCreateResponse(dir_answered.clone()),
            Command::DirectoryDeleteRequest(dir),
            Command::DirectoryDeleteResponse(dir_answered),
            Command::FileBytesRequest(BytesRequest {
                path_name: "docs/a.txt".into(),
                file_descriptor: meta(),
                position: 0,
                length: 11,
            }),
            Command::FileBytesResponse(BytesResponse {
                path_name: "docs/a.txt".into(),
                file_descriptor: meta(),
                position: 0,
                length: 11,
                content: b"hello world".to_vec(),
                done: true,
                status: Status::Ok,
            }),
            Command::Heartbeat,
        ]
    }

    #[test]
    fn every_kind_roundtrips() {
        let commands = one_of_each();
        assert_eq!(commands.len(), COMMAND_KINDS.len());

        for command in commands {
            let bytes = command.to_bytes().unwrap();
            let restored = Command::from_bytes(&bytes).unwrap();
            assert_eq!(restored, command, "{} did not survive", command.kind());
        }
    }

    #[test]
    fn kind_matches_wire_discriminator() {
        for command in one_of_each() {
            let value = serde_json::to_value(&command).unwrap();
            assert_eq!(value["command"], command.kind());
            assert!(COMMAND_KINDS.contains(&command.kind()));
        }
    }

    #[test]
    fn handshake_wire_shape() {
        let bytes = Command::handshake_request(PeerAddress::new("h", 9)).to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"command": "HANDSHAKE_REQUEST", "hostPort": {"host": "h", "port": 9}})
        );
    }

    #[test]
    fn content_is_base64_on_the_wire() {
        let response = Command::FileBytesResponse(BytesResponse {
            path_name: "f".into(),
            file_descriptor: FileMeta::of_content(b"\x00\xffbin", 0),
            position: 0,
            length: 5,
            content: b"\x00\xffbin".to_vec(),
            done: true,
            status: Status::Ok,
        });
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["content"], STANDARD.encode(b"\x00\xffbin"));
    }

    #[test]
    fn status_wire_forms() {
        assert_eq!(serde_json::to_value(Status::Ok).unwrap(), "ok");
        assert_eq!(
            serde_json::to_value(Status::refused("locked")).unwrap(),
            serde_json::json!({"refused": "locked"})
        );
    }

    #[test]
    fn unknown_kind_is_reported_by_name() {
        let err = Command::from_bytes(br#"{"command":"CHECK"}"#).unwrap_err();
        assert!(matches!(err, WireError::UnknownKind(ref k) if k == "CHECK"));
    }

    #[test]
    fn non_documents_are_malformed() {
        for bad in [
            &b"not json"[..],
            br#"[1,2,3]"#,
            br#"{"hostPort":{"host":"h","port":1}}"#,
            br#"{"command":42}"#,
            br#"{"command":"HANDSHAKE_REQUEST"}"#,
        ] {
            let err = Command::from_bytes(bad).unwrap_err();
            assert!(matches!(err, WireError::Malformed(_)), "{err:?}");
        }
    }

    #[test]
    fn invalid_base64_is_malformed() {
        let doc = serde_json::json!({
            "command": "FILE_BYTES_RESPONSE",
            "pathName": "f",
            "fileDescriptor": {"identity": "x", "lastModified": 0, "fileSize": 1},
            "position": 0,
            "length": 1,
            "content": "!!!",
            "done": true,
            "status": "ok",
        });
        let err = Command::from_bytes(doc.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, WireError::Malformed(_)));
    }

    #[test]
    fn bytes_response_debug_hides_content() {
        let response = BytesResponse {
            path_name: "f".into(),
            file_descriptor: meta(),
            position: 0,
            length: 3,
            content: vec![7, 7, 7],
            done: false,
            status: Status::Ok,
        };
        assert!(format!("{response:?}").contains("[3 bytes]"));
    }
}

//! The wire protocol between the daemon and its clients.
//!
//! Requests and responses travel as newline-delimited JSON over a unix
//! socket. A `commit_chunk_from_stream` request is immediately followed
//! by exactly `bytes` raw bytes on the same socket.

use serde::{Deserialize, Serialize};

use crate::imagestore::ImageError;
use crate::progress::Progress;

pub const INSTALL_OK: i32 = 0;
pub const INSTALL_ERROR_GENERIC: i32 = 1;
pub const INSTALL_ERROR_NO_SPACE: i32 = 2;
pub const INSTALL_ERROR_FILE_SYSTEM_CLUTTERED: i32 = 3;

/// Collapse the image-store taxonomy into the client-facing codes.
pub fn status_code(e: &ImageError) -> i32 {
    match e {
        ImageError::NoSpace => INSTALL_ERROR_NO_SPACE,
        ImageError::Cluttered => INSTALL_ERROR_FILE_SYSTEM_CLUTTERED,
        _ => INSTALL_ERROR_GENERIC,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    OpenInstall {
        install_dir: String,
    },
    CloseInstall,
    CreatePartition {
        name: String,
        size: i64,
        read_only: bool,
    },
    /// `bytes` of raw image data follow this request on the socket.
    CommitChunkFromStream {
        bytes: i64,
    },
    CommitChunkFromMemory {
        data: Vec<u8>,
    },
    /// Point the daemon at a file-backed shared buffer.
    SetSharedBuffer {
        path: String,
        size: i64,
    },
    CommitChunkFromShared {
        bytes: i64,
    },
    GetInstallProgress,
    Enable {
        one_shot: bool,
    },
    IsEnabled,
    Disable,
    Remove,
    CancelInstall,
    IsInstalled,
    IsRunning,
    IsInProgress,
    GetInstalledImageDir,
    ZeroPartition {
        name: String,
    },
    OpenImageService {
        prefix: String,
    },
    DumpDeviceMapperDevices,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Status { code: i32 },
    Bool { value: bool },
    Text { value: String },
    Progress { progress: Progress },
    ImageService { metadata_dir: String, data_dir: String },
    /// The caller's uid is not allowed to perform the operation.
    SecurityError { message: String },
    /// Transport- or protocol-level failure.
    Error { message: String },
}

impl Response {
    pub fn status(code: i32) -> Self {
        Response::Status { code }
    }

    pub fn boolean(value: bool) -> Self {
        Response::Bool { value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_request_wire_format() {
        let req = Request::CreatePartition {
            name: "system".into(),
            size: 10485760,
            read_only: true,
        };
        let line = serde_json::to_string(&req).unwrap();
        assert_eq!(
            line,
            r#"{"op":"create_partition","name":"system","size":10485760,"read_only":true}"#
        );
        let back: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_response_wire_format() {
        let line = serde_json::to_string(&Response::status(INSTALL_OK)).unwrap();
        assert_eq!(line, r#"{"result":"status","code":0}"#);
        let r: Response = serde_json::from_str(r#"{"result":"bool","value":true}"#).unwrap();
        assert_eq!(r, Response::Bool { value: true });
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status_code(&ImageError::NoSpace), INSTALL_ERROR_NO_SPACE);
        assert_eq!(
            status_code(&ImageError::Cluttered),
            INSTALL_ERROR_FILE_SYSTEM_CLUTTERED
        );
        assert_eq!(
            status_code(&ImageError::Failed(anyhow!("boom"))),
            INSTALL_ERROR_GENERIC
        );
        assert_eq!(status_code(&ImageError::NotFound), INSTALL_ERROR_GENERIC);
    }
}

//! Shared types for the FTP crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Options ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpCredentials {
    pub user: String,
    pub password: String,
}

impl Default for FtpCredentials {
    fn default() -> Self {
        Self {
            user: "anonymous".into(),
            password: "anonymous@".into(),
        }
    }
}

/// Per-handler connection options; every request may override them per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpOptions {
    pub host_name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Chunk size for streaming transfers.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// TYPE I when true, TYPE A otherwise.
    #[serde(default = "default_true")]
    pub use_binary: bool,
    /// PASV data channels when true, PORT otherwise.
    #[serde(default = "default_true")]
    pub use_passive: bool,
    /// Return sessions to the group for reuse instead of QUITting.
    #[serde(default)]
    pub keep_alive: bool,
    /// Opaque proxy hint carried through the configuration surface.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub credentials: Option<FtpCredentials>,
    /// Sessions sharing a group name also share their connection cap.
    #[serde(default)]
    pub group_name: Option<String>,
    /// Concurrent control connections per group.
    #[serde(default = "default_connections_limit")]
    pub connections_limit: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_sec: u64,
}

fn default_port() -> u16 {
    21
}
fn default_buffer_size() -> usize {
    4096
}
fn default_connections_limit() -> usize {
    2
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_true() -> bool {
    true
}

impl FtpOptions {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            port: default_port(),
            buffer_size: default_buffer_size(),
            use_binary: true,
            use_passive: true,
            keep_alive: false,
            proxy: None,
            credentials: None,
            group_name: None,
            connections_limit: default_connections_limit(),
            connect_timeout_sec: default_connect_timeout(),
        }
    }

    /// Pool key: the group name, defaulting to the host.
    pub(crate) fn group_key(&self) -> String {
        self.group_name
            .clone()
            .unwrap_or_else(|| self.host_name.clone())
    }
}

// ── Requests ─────────────────────────────────────────────────────────

/// Control-channel security for one request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FtpSecurityMode {
    /// Plain-text FTP.
    None,
    /// Upgrade via AUTH TLS before logging in.
    Explicit,
}

impl Default for FtpSecurityMode {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpVerb {
    ListNames,
    ListDetails,
    Rename,
    DeleteFile,
    MakeDirectory,
    RemoveDirectory,
    PrintWorkingDirectory,
    GetSize,
    GetTimestamp,
    Download,
    Upload,
    UploadUnique,
    Append,
}

/// One verb request, as seen (and mutable) by the `on_make_request` hook.
#[derive(Debug, Clone)]
pub struct FtpRequest {
    pub verb: FtpVerb,
    /// Remote path the request targets.
    pub path: String,
    /// Effective options: per-call override or the handler defaults.
    pub options: FtpOptions,
    /// Hook-settable; `Explicit` turns the request into FTPS.
    pub security: FtpSecurityMode,
    /// Known upload size, set by the preflight when the source supports it.
    pub content_length: Option<u64>,
    /// Rename target.
    pub new_name: Option<String>,
}

impl FtpRequest {
    /// `hostName + "/" + path`, the target this request addresses.
    pub fn target(&self) -> String {
        format!("{}/{}", self.options.host_name, self.path)
    }
}

// ── Replies ──────────────────────────────────────────────────────────

/// A single FTP reply, possibly multi-line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl FtpReply {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// 1xx–3xx.
    pub fn is_success(&self) -> bool {
        self.code < 400
    }

    /// 1xx: transfer about to start.
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// 2xx: command ok.
    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx: more input needed.
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }
}

// ── Listings ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FtpEntryKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// One parsed entry from LIST output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpEntry {
    pub name: String,
    pub kind: FtpEntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub permissions: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub link_target: Option<String>,
    /// Raw server line, kept for callers that want the details verbatim.
    pub raw: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_defaults_apply() {
        let opts: FtpOptions = serde_json::from_str(r#"{"hostName":"ftp.example.com"}"#).unwrap();
        assert_eq!(opts.port, 21);
        assert_eq!(opts.buffer_size, 4096);
        assert!(opts.use_binary);
        assert!(opts.use_passive);
        assert!(!opts.keep_alive);
        assert_eq!(opts.connections_limit, 2);
        assert!(opts.credentials.is_none());
    }

    #[test]
    fn group_key_falls_back_to_host() {
        let mut opts = FtpOptions::new("ftp.example.com");
        assert_eq!(opts.group_key(), "ftp.example.com");
        opts.group_name = Some("mirror-pool".into());
        assert_eq!(opts.group_key(), "mirror-pool");
    }

    #[test]
    fn request_target_joins_host_and_path() {
        let req = FtpRequest {
            verb: FtpVerb::Download,
            path: "pub/file.bin".into(),
            options: FtpOptions::new("ftp.example.com"),
            security: FtpSecurityMode::None,
            content_length: None,
            new_name: None,
        };
        assert_eq!(req.target(), "ftp.example.com/pub/file.bin");
    }

    #[test]
    fn reply_classification() {
        let reply = FtpReply {
            code: 150,
            lines: vec!["150 Opening data connection".into()],
        };
        assert!(reply.is_preliminary());
        assert!(reply.is_success());
        let reply = FtpReply {
            code: 550,
            lines: vec!["550 No such file".into()],
        };
        assert!(!reply.is_success());
    }
}

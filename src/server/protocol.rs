//! Wire protocol.
//!
//! Newline-delimited framing: the first whitespace-separated token is the
//! command, the remainder (if any) is a JSON body or a bare argument.
//! `PING` and `STATS` may be sent as bare keywords. Every request gets
//! exactly one JSON object back, terminated by `\n`, then the connection
//! closes.

use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::query::executor::{SearchHit, DEFAULT_LIMIT};
use crate::query::Mode;

/// Error kinds surfaced on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed JSON or unknown command
    BadRequest,
    /// Missing or mistyped field, unknown bookmark
    BadArgument,
    /// Filesystem or socket failure
    IoError,
    /// Persistence failure
    DbError,
    /// Deadline exceeded
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::BadArgument => "bad_argument",
            ErrorKind::IoError => "io_error",
            ErrorKind::DbError => "db_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

/// A request that could not be served. Serialises to
/// `{"error":"<kind>","message":"<detail>"}`.
#[derive(Debug, Clone)]
pub struct RequestError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RequestError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn bad_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadArgument, message)
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IoError, message)
    }

    pub fn db_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DbError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub bookmark_path: String,
    pub mode: Mode,
    pub query: String,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchAllRequest {
    /// Empty means every registered bookmark.
    pub bookmark_paths: Vec<String>,
    pub query: String,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddBookmarkRequest {
    pub name: String,
    pub path: String,
    pub is_network: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveBookmarkRequest {
    pub name: String,
}

/// A parsed client request.
#[derive(Debug)]
pub enum Request {
    Ping,
    Stats,
    Search(SearchRequest),
    SearchAll(SearchAllRequest),
    /// Trailing argument is the path to re-walk.
    Rescan(String),
    AddBookmark(AddBookmarkRequest),
    RemoveBookmark(RemoveBookmarkRequest),
}

/// Parse one request line.
pub fn parse_request(line: &str) -> Result<Request, RequestError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(RequestError::bad_request("empty request"));
    }

    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    };

    match command {
        "PING" => Ok(Request::Ping),
        "STATS" => Ok(Request::Stats),
        "SEARCH" => Ok(Request::Search(body_from_json(rest)?)),
        "SEARCH_ALL" => Ok(Request::SearchAll(body_from_json(rest)?)),
        "RESCAN" => {
            if rest.is_empty() {
                Err(RequestError::bad_argument("RESCAN requires a path"))
            } else {
                Ok(Request::Rescan(rest.to_string()))
            }
        }
        "ADD_BOOKMARK" => Ok(Request::AddBookmark(body_from_json(rest)?)),
        "REMOVE_BOOKMARK" => Ok(Request::RemoveBookmark(body_from_json(rest)?)),
        other => Err(RequestError::bad_request(format!(
            "unknown command {other:?}"
        ))),
    }
}

fn body_from_json<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, RequestError> {
    if body.is_empty() {
        return Err(RequestError::bad_argument("missing request body"));
    }
    serde_json::from_str(body).map_err(|e| {
        // Broken JSON is a framing problem; well-formed JSON with wrong
        // fields is an argument problem.
        if e.classify() == serde_json::error::Category::Data {
            RequestError::bad_argument(e.to_string())
        } else {
            RequestError::bad_request(e.to_string())
        }
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct PongResponse {
    pub status: &'static str,
}

pub fn pong() -> PongResponse {
    PongResponse { status: "pong" }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub files: usize,
    /// Distinct trigrams, i.e. the posting-list map's size.
    pub trigrams: usize,
    pub bookmarks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub total_indexed: usize,
    pub search_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResponse {
    pub status: &'static str,
    pub indexed: usize,
}

pub fn scan_ok(indexed: usize) -> ScanResponse {
    ScanResponse {
        status: "ok",
        indexed,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RemovedResponse {
    pub status: &'static str,
    pub removed: usize,
}

pub fn removed_ok(removed: usize) -> RemovedResponse {
    RemovedResponse {
        status: "ok",
        removed,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

impl From<&RequestError> for ErrorResponse {
    fn from(e: &RequestError) -> Self {
        Self {
            error: e.kind.as_str(),
            message: e.message.clone(),
        }
    }
}

/// Write one newline-terminated JSON frame.
pub fn write_frame<W: Write>(writer: &mut W, msg: &impl Serialize) -> io::Result<()> {
    let json = serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&json)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

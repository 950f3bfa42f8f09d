//! Program artifacts and upload outcomes

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Number of captured tool output lines kept in a failure message
pub const DIAGNOSTIC_LINES: usize = 10;

/// A compiled user program downloaded from the server
///
/// The bytes are also persisted to a private temporary directory so that
/// file-based flashing tools can read them. The directory is removed when
/// the program is dropped.
#[derive(Debug)]
pub struct Program {
    filename: String,
    bytes: Vec<u8>,
    path: PathBuf,
    _dir: TempDir,
}

impl Program {
    /// Persist `bytes` as `filename` inside a fresh temporary directory
    pub fn persist(filename: impl Into<String>, bytes: Vec<u8>) -> io::Result<Self> {
        let filename = filename.into();
        // Only the final path component of a server supplied name is used
        let local_name = Path::new(&filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "program.bin".to_string());

        let dir = tempfile::Builder::new().prefix("roberta-").tempdir()?;
        let path = dir.path().join(local_name);
        std::fs::write(&path, &bytes)?;

        Ok(Self {
            filename,
            bytes,
            path,
            _dir: dir,
        })
    }

    /// Name announced by the server in the `Filename` header
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Location of the persisted copy
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A runtime file fetched from `/rest/update/<name>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Result of an upload attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    /// 0 on success
    pub code: i32,
    /// Operator facing message
    pub message: String,
}

impl UploadOutcome {
    pub fn ok() -> Self {
        Self {
            code: 0,
            message: String::new(),
        }
    }

    pub fn failed(code: i32, message: impl Into<String>) -> Self {
        // A failure never reports code 0
        let code = if code == 0 { 1 } else { code };
        Self {
            code,
            message: message.into(),
        }
    }

    /// Build an outcome from a tool exit code and its captured stderr
    pub fn from_output(code: i32, stderr: &str) -> Self {
        if code == 0 {
            Self::ok()
        } else {
            Self::failed(code, tail_lines(stderr, DIAGNOSTIC_LINES))
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

impl fmt::Display for UploadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            write!(f, "upload succeeded")
        } else {
            write!(f, "upload failed ({}): {}", self.code, self.message)
        }
    }
}

/// The last `n` non-empty lines of `text`
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

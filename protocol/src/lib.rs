//! Line protocol spoken between the host and the `nodectld` guest daemon.
//!
//! One command per connection:
//!
//! ```text
//! UPLOAD <path> <size>\n<size raw bytes>  -> "[OK] uploaded <n> bytes\n" | "ERR <msg>\n"
//! READ <path>\n                           -> raw file bytes until EOF     | "ERR <msg>\n"
//! <anything else>\n                       -> stdout/stderr bytes until EOF
//! ```
//!
//! The guest closes the connection after every command. An empty line
//! closes it without a response.

use thiserror::Error;

pub mod client;

/// Vsock port used when the port file is missing or unusable.
pub const DEFAULT_PORT: u32 = 1;

/// File the guest daemon reads its vsock port from at startup.
pub const PORT_FILE: &str = "/.nodectld-port";

/// Shell used to run exec command lines (`<shell> -c <line>`).
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Upper bound on a command line, including the trailing newline.
pub const MAX_COMMAND_LINE: usize = 64 * 1024;

const UPLOAD_VERB: &str = "UPLOAD";
const READ_VERB: &str = "READ";

// ---------------------------------------------------------------------------
// Host -> Guest commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create or truncate `path` and fill it with exactly `size` bytes
    /// taken from the connection.
    Upload { path: String, size: u64 },

    /// Stream the content of `path` back to the host.
    Read { path: String },

    /// Run the whole line through the shell, relaying its output.
    Exec { raw: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid upload syntax")]
    InvalidUploadSyntax,

    #[error("invalid read syntax")]
    InvalidReadSyntax,

    #[error("invalid size")]
    InvalidSize,
}

impl Command {
    /// Parse a single command line.
    ///
    /// Surrounding whitespace is trimmed first; an empty line yields
    /// `Ok(None)`. Tokens are separated by exactly one space, so doubled
    /// spaces produce empty tokens and count against the arity of
    /// `UPLOAD`/`READ`. Lines starting with those verbs never fall through
    /// to exec.
    pub fn parse(line: &str) -> Result<Option<Self>, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let parts: Vec<&str> = line.split(' ').collect();
        let cmd = match parts[0] {
            UPLOAD_VERB => {
                let [_, path, size] = parts.as_slice() else {
                    return Err(ProtocolError::InvalidUploadSyntax);
                };
                Command::Upload {
                    path: path.to_string(),
                    size: parse_size(size)?,
                }
            }
            READ_VERB => {
                let [_, path] = parts.as_slice() else {
                    return Err(ProtocolError::InvalidReadSyntax);
                };
                Command::Read {
                    path: path.to_string(),
                }
            }
            _ => Command::Exec {
                raw: line.to_string(),
            },
        };
        Ok(Some(cmd))
    }

    /// Render the newline-terminated request line a host sends.
    pub fn to_line(&self) -> String {
        match self {
            Command::Upload { path, size } => format!("{UPLOAD_VERB} {path} {size}\n"),
            Command::Read { path } => format!("{READ_VERB} {path}\n"),
            Command::Exec { raw } => format!("{raw}\n"),
        }
    }
}

/// Sizes are signed base-10 integers on the wire; anything negative is
/// rejected.
fn parse_size(s: &str) -> Result<u64, ProtocolError> {
    let n: i64 = s.parse().map_err(|_| ProtocolError::InvalidSize)?;
    u64::try_from(n).map_err(|_| ProtocolError::InvalidSize)
}

// ---------------------------------------------------------------------------
// Guest -> Host status lines
// ---------------------------------------------------------------------------

const UPLOADED_PREFIX: &str = "[OK] uploaded ";
const UPLOADED_SUFFIX: &str = " bytes";
const ERR_PREFIX: &str = "ERR ";

/// Status line written by the guest. Only uploads and failures produce one;
/// successful reads and execs answer with raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Uploaded(u64),
    Error(String),
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error(message.into())
    }

    pub fn to_line(&self) -> String {
        match self {
            Response::Uploaded(n) => format!("{UPLOADED_PREFIX}{n}{UPLOADED_SUFFIX}\n"),
            Response::Error(msg) => format!("{ERR_PREFIX}{msg}\n"),
        }
    }

    /// Parse a status line as sent by the guest. Returns `None` for
    /// anything that is not a status line.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(msg) = line.strip_prefix(ERR_PREFIX) {
            return Some(Response::Error(msg.to_string()));
        }
        let n = line
            .strip_prefix(UPLOADED_PREFIX)?
            .strip_suffix(UPLOADED_SUFFIX)?
            .parse()
            .ok()?;
        Some(Response::Uploaded(n))
    }
}

impl From<ProtocolError> for Response {
    fn from(e: ProtocolError) -> Self {
        Response::Error(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Command parsing
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_upload() {
        let cmd = Command::parse("UPLOAD /tmp/a.bin 1024\n").unwrap();
        assert_eq!(
            cmd,
            Some(Command::Upload {
                path: "/tmp/a.bin".into(),
                size: 1024
            })
        );
    }

    #[test]
    fn test_parse_upload_zero_size() {
        let cmd = Command::parse("UPLOAD /tmp/empty 0").unwrap().unwrap();
        assert_eq!(
            cmd,
            Command::Upload {
                path: "/tmp/empty".into(),
                size: 0
            }
        );
    }

    #[test]
    fn test_parse_upload_wrong_arity() {
        assert_eq!(
            Command::parse("UPLOAD /tmp/a"),
            Err(ProtocolError::InvalidUploadSyntax)
        );
        assert_eq!(
            Command::parse("UPLOAD /tmp/a 1 extra"),
            Err(ProtocolError::InvalidUploadSyntax)
        );
        assert_eq!(
            Command::parse("UPLOAD"),
            Err(ProtocolError::InvalidUploadSyntax)
        );
    }

    #[test]
    fn test_parse_upload_double_space_is_not_collapsed() {
        assert_eq!(
            Command::parse("UPLOAD  /tmp/a 3"),
            Err(ProtocolError::InvalidUploadSyntax)
        );
    }

    #[test]
    fn test_parse_upload_bad_size() {
        for size in ["-1", "abc", "1.5", "", "0x10"] {
            let line = format!("UPLOAD /tmp/a {size}");
            let expected = if size.is_empty() {
                // trailing space is trimmed away, leaving two tokens
                ProtocolError::InvalidUploadSyntax
            } else {
                ProtocolError::InvalidSize
            };
            assert_eq!(Command::parse(&line), Err(expected), "size {size:?}");
        }
    }

    #[test]
    fn test_parse_upload_signed_forms() {
        let Some(Command::Upload { size, .. }) = Command::parse("UPLOAD /x +5").unwrap() else {
            panic!("expected Upload");
        };
        assert_eq!(size, 5);
        let Some(Command::Upload { size, .. }) = Command::parse("UPLOAD /x -0").unwrap() else {
            panic!("expected Upload");
        };
        assert_eq!(size, 0);
    }

    #[test]
    fn test_parse_read() {
        assert_eq!(
            Command::parse("  READ /etc/hostname  ").unwrap(),
            Some(Command::Read {
                path: "/etc/hostname".into()
            })
        );
    }

    #[test]
    fn test_parse_read_wrong_arity() {
        assert_eq!(Command::parse("READ"), Err(ProtocolError::InvalidReadSyntax));
        assert_eq!(
            Command::parse("READ /a /b"),
            Err(ProtocolError::InvalidReadSyntax)
        );
    }

    #[test]
    fn test_parse_exec_keeps_whole_line() {
        let cmd = Command::parse("echo hello  world | tr a-z A-Z\n").unwrap();
        assert_eq!(
            cmd,
            Some(Command::Exec {
                raw: "echo hello  world | tr a-z A-Z".into()
            })
        );
    }

    #[test]
    fn test_parse_verbs_are_case_sensitive() {
        assert_eq!(
            Command::parse("upload /tmp/a 3").unwrap(),
            Some(Command::Exec {
                raw: "upload /tmp/a 3".into()
            })
        );
        assert_eq!(
            Command::parse("READER x").unwrap(),
            Some(Command::Exec {
                raw: "READER x".into()
            })
        );
    }

    #[test]
    fn test_parse_empty_line() {
        assert_eq!(Command::parse(""), Ok(None));
        assert_eq!(Command::parse("\n"), Ok(None));
        assert_eq!(Command::parse(" \t \r\n"), Ok(None));
    }

    #[test]
    fn test_to_line_parses_back() {
        let cmds = [
            Command::Upload {
                path: "/srv/data.tar".into(),
                size: 7,
            },
            Command::Read {
                path: "/var/log/messages".into(),
            },
            Command::Exec {
                raw: "uname -a".into(),
            },
        ];
        for cmd in cmds {
            let line = cmd.to_line();
            assert!(line.ends_with('\n'));
            assert_eq!(Command::parse(&line).unwrap(), Some(cmd));
        }
    }

    // -----------------------------------------------------------------------
    // Status lines
    // -----------------------------------------------------------------------

    #[test]
    fn test_response_lines() {
        assert_eq!(Response::Uploaded(40).to_line(), "[OK] uploaded 40 bytes\n");
        assert_eq!(
            Response::error("cannot open file: nope").to_line(),
            "ERR cannot open file: nope\n"
        );
        assert_eq!(
            Response::from(ProtocolError::InvalidSize).to_line(),
            "ERR invalid size\n"
        );
    }

    #[test]
    fn test_response_parse() {
        assert_eq!(
            Response::parse("[OK] uploaded 12 bytes\n"),
            Some(Response::Uploaded(12))
        );
        assert_eq!(
            Response::parse("ERR invalid read syntax\n"),
            Some(Response::Error("invalid read syntax".into()))
        );
        assert_eq!(Response::parse("[OK] uploaded many bytes\n"), None);
        assert_eq!(Response::parse("hello\n"), None);
    }
}

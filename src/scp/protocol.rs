//! SCP wire format: transfer parameters, status replies and control records.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

/// Byte sent by the sink to tell the source to start
pub const GO_AHEAD: u8 = 0x00;

/// Channel type carrying exec requests
pub const SESSION_CHANNEL: &str = "session";

/// Channel request reporting the remote command's exit code
pub const EXIT_STATUS: &str = "exit-status";

const EXEC_LENGTH_PREFIX: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed control record: {0:?}")]
    MalformedRecord(String),

    #[error("invalid mode in control record: {0:?}")]
    InvalidMode(String),

    #[error("invalid length in control record: {0:?}")]
    InvalidLength(String),

    #[error("unknown control record type {0:#04x}")]
    UnknownRecord(u8),

    #[error("control line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("connection closed before a full control line was read")]
    UnexpectedEof,

    #[error("unknown status code {0:#04x}")]
    UnknownStatus(u8),

    #[error("control line is not valid UTF-8")]
    InvalidUtf8,

    #[error("exec payload is truncated")]
    TruncatedPayload,

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::UnexpectedEof
        } else {
            ProtocolError::Io(e.to_string())
        }
    }
}

/// Transfer flags from the scp command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Parameters(u8);

impl Parameters {
    pub const VERBOSE: Parameters = Parameters(1 << 0);
    pub const DIRECTORY: Parameters = Parameters(1 << 1);
    pub const SINK: Parameters = Parameters(1 << 2);
    pub const SOURCE: Parameters = Parameters(1 << 3);
    pub const RECURSIVE: Parameters = Parameters(1 << 4);

    const NAMES: [(Parameters, &'static str); 5] = [
        (Self::VERBOSE, "Verbose"),
        (Self::DIRECTORY, "Directory"),
        (Self::SINK, "Sink"),
        (Self::SOURCE, "Source"),
        (Self::RECURSIVE, "Recursive"),
    ];

    pub const fn empty() -> Self {
        Parameters(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Parameters) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Parameters) -> bool {
        self.0 & other.0 != 0
    }

    /// Fold a run of single-letter flags (the part after `-`) into the set.
    /// Letters are case-insensitive; unknown letters are ignored.
    pub fn parse_flags(&mut self, flags: &str) {
        for flag in flags.chars() {
            match flag.to_ascii_lowercase() {
                'd' => *self |= Self::DIRECTORY,
                'f' => *self |= Self::SOURCE,
                'r' => *self |= Self::RECURSIVE,
                't' => *self |= Self::SINK,
                'v' => *self |= Self::VERBOSE,
                _ => {}
            }
        }
    }

    pub fn from_flags(flags: &str) -> Self {
        let mut params = Self::empty();
        params.parse_flags(flags);
        params
    }
}

impl BitOr for Parameters {
    type Output = Parameters;

    fn bitor(self, rhs: Parameters) -> Parameters {
        Parameters(self.0 | rhs.0)
    }
}

impl BitOrAssign for Parameters {
    fn bitor_assign(&mut self, rhs: Parameters) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join(","))
    }
}

/// Status byte prefixed to every sink reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0x00,
    Warning = 0x01,
    Fatal = 0x02,
}

impl StatusCode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for StatusCode {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x00 => Ok(StatusCode::Ok),
            0x01 => Ok(StatusCode::Warning),
            0x02 => Ok(StatusCode::Fatal),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

/// A reply sent to the peer after each control record or file body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Warning,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Fatal,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Wire form: the code byte, plus `message\n` for Warning and Fatal
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.message.len() + 2);
        buf.push(self.code.as_byte());
        if self.code != StatusCode::Ok {
            // The message is newline-terminated on the wire
            buf.extend(self.message.replace(['\n', '\r'], " ").as_bytes());
            buf.push(b'\n');
        }
        buf
    }
}

/// Decode one status reply, the counterpart of [`Status::encode`]
pub async fn read_status<R>(reader: &mut R) -> Result<Status, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let code = StatusCode::try_from(reader.read_u8().await?)?;
    if code == StatusCode::Ok {
        return Ok(Status::ok());
    }

    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line).await?;
    if line.pop() != Some(b'\n') {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(Status {
        code,
        message: String::from_utf8_lossy(&line).into_owned(),
    })
}

/// A `C` record announcing one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyDirective {
    /// Permission bits, e.g. `0o644`
    pub mode: u32,
    pub length: u64,
    pub filename: String,
}

impl CopyDirective {
    /// Parse `C<mode> <length> <filename>`. The filename is the rest of the
    /// line and may contain spaces.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (mode, length, filename) = split_record(line, 'C')?;
        let length = length
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidLength(length.to_string()))?;
        Ok(Self {
            mode,
            length,
            filename,
        })
    }

    pub fn encode(&self) -> String {
        format!("C{:04o} {} {}\n", self.mode, self.length, self.filename)
    }
}

/// A `D` record entering a subdirectory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryDirective {
    pub mode: u32,
    pub name: String,
}

impl DirectoryDirective {
    /// Parse `D<mode> <length> <name>`; the length field is always 0
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (mode, length, name) = split_record(line, 'D')?;
        if length.parse::<u64>().is_err() {
            return Err(ProtocolError::InvalidLength(length.to_string()));
        }
        Ok(Self { mode, name })
    }
}

/// One control line from the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRecord {
    File(CopyDirective),
    Directory(DirectoryDirective),
    EndDirectory,
}

impl ControlRecord {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        match line.as_bytes().first() {
            Some(b'C') => CopyDirective::parse(line).map(ControlRecord::File),
            Some(b'D') => DirectoryDirective::parse(line).map(ControlRecord::Directory),
            Some(b'E') => Ok(ControlRecord::EndDirectory),
            Some(other) => Err(ProtocolError::UnknownRecord(*other)),
            None => Err(ProtocolError::MalformedRecord(String::new())),
        }
    }
}

fn trim_line_end(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Split `<kind><4-digit mode> <length> <name>` into its fields
fn split_record(line: &str, kind: char) -> Result<(u32, &str, String), ProtocolError> {
    let line = trim_line_end(line);
    let malformed = || ProtocolError::MalformedRecord(line.to_string());

    let mut tokens = line.splitn(3, ' ');
    let head = tokens.next().ok_or_else(malformed)?;
    let length = tokens.next().ok_or_else(malformed)?;
    let name = tokens.next().ok_or_else(malformed)?;

    if head.len() != 5 || !head.starts_with(kind) {
        return Err(malformed());
    }
    let digits = &head[1..];
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::InvalidMode(digits.to_string()));
    }
    let mode =
        u32::from_str_radix(digits, 8).map_err(|_| ProtocolError::InvalidMode(digits.to_string()))?;

    if name.is_empty() {
        return Err(malformed());
    }
    Ok((mode, length, name.to_string()))
}

/// Read one `\n`-terminated control line of at most `max_len` bytes
pub async fn read_control_line<R>(reader: &mut R, max_len: usize) -> Result<String, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = u64::try_from(max_len).unwrap_or(u64::MAX);
    let read = reader.take(limit).read_until(b'\n', &mut buf).await?;

    if buf.last() != Some(&b'\n') {
        if read >= max_len {
            return Err(ProtocolError::LineTooLong(max_len));
        }
        return Err(ProtocolError::UnexpectedEof);
    }
    String::from_utf8(buf).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Extract the command from an exec request payload (a length-prefixed
/// string)
pub fn decode_exec_command(payload: &[u8]) -> Result<String, ProtocolError> {
    if payload.len() < EXEC_LENGTH_PREFIX {
        return Err(ProtocolError::TruncatedPayload);
    }
    let (prefix, rest) = payload.split_at(EXEC_LENGTH_PREFIX);
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    let command = rest.get(..len).ok_or(ProtocolError::TruncatedPayload)?;
    Ok(String::from_utf8_lossy(command).into_owned())
}

/// Build an exec request payload for `command`
pub fn encode_exec_command(command: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(command.len() + EXEC_LENGTH_PREFIX);
    payload.extend((command.len() as u32).to_be_bytes());
    payload.extend(command.as_bytes());
    payload
}

/// Payload of an `exit-status` channel request
pub fn exit_status_payload(status: u32) -> Vec<u8> {
    status.to_be_bytes().to_vec()
}

/// Drain and discard the remainder of a bounded reader
pub async fn discard<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<u64> {
    tokio::io::copy(reader, &mut tokio::io::sink()).await
}

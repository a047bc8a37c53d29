//! The on-disk dependency record: one file per target, a fixed-width header
//! followed by one line per recorded prerequisite.
//!
//! Header: `EEEEEEEEEE:<40 hex digest chars>:F\n` where E is the zero-padded
//! decimal epoch token and F is `S` for source targets, `-` otherwise.
//! Body lines: `T:<escaped path>\n` with T one of `c`/`e`/`a`.
//!
//! The header is fixed width so it can be rewritten in place without
//! touching body entries appended during the same build.

use crate::hashes::{self, Digest, DIGEST_LEN};
use anyhow::Context;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

/// How a prerequisite's state bears on the target that recorded it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Rebuild the dependent when this prerequisite's content changes.
    Changed,
    /// Rebuild the dependent when this prerequisite comes into existence.
    CreatedGuard,
    /// Rebuild the dependent unconditionally.
    AlwaysRebuild,
}

impl Relation {
    pub fn tag(self) -> u8 {
        match self {
            Relation::Changed => b'c',
            Relation::CreatedGuard => b'e',
            Relation::AlwaysRebuild => b'a',
        }
    }

    fn from_tag(tag: u8) -> Option<Relation> {
        match tag {
            b'c' => Some(Relation::Changed),
            b'e' => Some(Relation::CreatedGuard),
            b'a' => Some(Relation::AlwaysRebuild),
            _ => None,
        }
    }
}

/// One recorded prerequisite; the path is root-relative unless the
/// prerequisite escapes the project root, in which case it is absolute.
#[derive(Debug)]
pub struct Prereq {
    pub relation: Relation,
    pub path: String,
}

/// The persisted state for exactly one target.
#[derive(Debug)]
pub struct DependencyRecord {
    pub epoch: u32,
    pub digest: Digest,
    pub is_source: bool,
    pub prereqs: Vec<Prereq>,
}

/// Failure to read a record.  Missing and Malformed both mean "needs
/// rebuild" to the engine; only Io is fatal.
#[derive(Debug)]
pub enum CodecError {
    Missing,
    Malformed(&'static str),
    Io(std::io::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Missing => write!(f, "no record"),
            CodecError::Malformed(what) => write!(f, "malformed record: {}", what),
            CodecError::Io(err) => write!(f, "record i/o error: {}", err),
        }
    }
}

impl std::error::Error for CodecError {}

const DELIM: u8 = b':';
const EPOCH_DIGITS: usize = 10;
/// epoch + ':' + hex digest + ':' + flags byte + '\n'
pub const HEADER_LEN: usize = EPOCH_DIGITS + 1 + DIGEST_LEN * 2 + 1 + 1 + 1;

fn header_bytes(epoch: u32, digest: &Digest, is_source: bool) -> Vec<u8> {
    let flag = if is_source { 'S' } else { '-' };
    let header = format!("{:010}:{}:{}\n", epoch, hashes::to_hex(digest), flag);
    debug_assert_eq!(header.len(), HEADER_LEN);
    header.into_bytes()
}

/// A reset record starts with this placeholder.  It parses as malformed on
/// purpose: an interrupted build leaves the target marked for rebuild.
fn placeholder_header() -> [u8; HEADER_LEN] {
    let mut bytes = [b'?'; HEADER_LEN];
    bytes[HEADER_LEN - 1] = b'\n';
    bytes
}

/// Truncate a record to a header-only placeholder, discarding all
/// previously recorded prerequisites.
pub fn reset(path: &Path) -> anyhow::Result<()> {
    std::fs::write(path, placeholder_header())
        .with_context(|| format!("reset record {}", path.display()))
}

/// Rewrite the header in place, leaving any body entries intact.
pub fn write_header(path: &Path, epoch: u32, digest: &Digest, is_source: bool) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("open record {}", path.display()))?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header_bytes(epoch, digest, is_source))
        .with_context(|| format!("write record header {}", path.display()))
}

/// Append one prerequisite entry.  A record created by this call gets the
/// placeholder header first, so the header space stays reserved.
pub fn append_prereq(path: &Path, relation: Relation, prereq_path: &str) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("open record {}", path.display()))?;
    if file.metadata()?.len() == 0 {
        file.write_all(&placeholder_header())?;
    }
    let mut line = Vec::with_capacity(prereq_path.len() + 3);
    line.push(relation.tag());
    line.push(DELIM);
    line.extend_from_slice(encode_path(prereq_path).as_bytes());
    line.push(b'\n');
    file.write_all(&line)
        .with_context(|| format!("append to record {}", path.display()))
}

pub fn read(path: &Path) -> Result<DependencyRecord, CodecError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(CodecError::Missing),
        Err(err) => return Err(CodecError::Io(err)),
    };

    let header = match bytes.get(..HEADER_LEN) {
        Some(header) => header,
        None => return Err(CodecError::Malformed("truncated header")),
    };
    if header[EPOCH_DIGITS] != DELIM
        || header[EPOCH_DIGITS + 1 + DIGEST_LEN * 2] != DELIM
        || header[HEADER_LEN - 1] != b'\n'
    {
        return Err(CodecError::Malformed("bad header delimiters"));
    }
    let epoch: u32 = std::str::from_utf8(&header[..EPOCH_DIGITS])
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or(CodecError::Malformed("bad epoch token"))?;
    let hex = std::str::from_utf8(&header[EPOCH_DIGITS + 1..EPOCH_DIGITS + 1 + DIGEST_LEN * 2])
        .map_err(|_| CodecError::Malformed("bad digest"))?;
    let digest = hashes::from_hex(hex).ok_or(CodecError::Malformed("bad digest"))?;
    let is_source = match header[HEADER_LEN - 2] {
        b'S' => true,
        b'-' => false,
        _ => return Err(CodecError::Malformed("bad flags byte")),
    };

    let mut prereqs = Vec::new();
    for line in bytes[HEADER_LEN..].split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        if line.len() < 3 || line[1] != DELIM {
            return Err(CodecError::Malformed("bad prerequisite entry"));
        }
        let relation =
            Relation::from_tag(line[0]).ok_or(CodecError::Malformed("unknown relation tag"))?;
        let raw = std::str::from_utf8(&line[2..])
            .map_err(|_| CodecError::Malformed("non-utf8 prerequisite path"))?;
        prereqs.push(Prereq {
            relation,
            path: decode_path(raw),
        });
    }

    Ok(DependencyRecord {
        epoch,
        digest,
        is_source,
        prereqs,
    })
}

/// Escape a path for one body line: backslashes are doubled, literal
/// newlines become `\n`, and the field delimiter gets a backslash prefix.
pub fn encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\:"),
            _ => out.push(c),
        }
    }
    out
}

/// Exact inverse of encode_path.  A stray trailing backslash is dropped
/// rather than poisoning the whole record.
pub fn decode_path(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(c) => out.push(c),
            None => break,
        }
    }
    out
}

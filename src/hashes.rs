//! Content digests over target files.  The digest, not the mtime, is the
//! ground truth for staleness decisions.

use anyhow::Context;
use sha1::{Digest as _, Sha1};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Size in bytes of a content digest.
pub const DIGEST_LEN: usize = 20;

/// A 160-bit digest over a target's full byte stream.
pub type Digest = [u8; DIGEST_LEN];

const CHUNK_SIZE: usize = 8192;

/// Digest a file's contents, streaming in fixed-size chunks.
pub fn hash_file(path: &Path) -> anyhow::Result<Digest> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Canonical lowercase hex form, exactly 40 characters.
pub fn to_hex(digest: &Digest) -> String {
    hex::encode(digest)
}

/// Inverse of to_hex; None on wrong length or any non-hex character.
pub fn from_hex(text: &str) -> Option<Digest> {
    if text.len() != DIGEST_LEN * 2 {
        return None;
    }
    let mut digest = [0u8; DIGEST_LEN];
    hex::decode_to_slice(text, &mut digest).ok()?;
    Some(digest)
}

use crate::{Error, Result};
use md5::Md5;
use sha1::{Digest, Sha1};
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

/// Read size used for all digests. Chunking never changes the result.
pub const CHUNK_SIZE: usize = 4096;

/// Hashes at most `limit` bytes from `inner`, stopping early at end of file.
fn digest_stream<D: Digest, R: Read>(mut inner: R, limit: u64) -> std::io::Result<String> {
    let mut digest = D::new();
    let mut buf = [0u8; CHUNK_SIZE];
    let mut remaining = limit;

    while remaining > 0 {
        // remaining < CHUNK_SIZE makes the cast safe
        let want = if remaining < CHUNK_SIZE as u64 {
            remaining as usize
        } else {
            CHUNK_SIZE
        };
        let size = inner.read(&mut buf[..want])?;
        if size == 0 {
            break;
        }
        digest.update(&buf[..size]);
        remaining -= size as u64;
    }

    Ok(hex::encode(digest.finalize()))
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|source| Error::ChecksumIo {
        path: path.to_path_buf(),
        source,
    })
}

fn whole_file<D: Digest>(path: &Path) -> Result<String> {
    let f = open(path)?;
    digest_stream::<D, _>(f, u64::MAX).map_err(|source| Error::ChecksumIo {
        path: path.to_path_buf(),
        source,
    })
}

/// Lowercase hex MD5 of the whole file.
pub fn whole_file_md5(path: &Path) -> Result<String> {
    whole_file::<Md5>(path)
}

/// Lowercase hex SHA-1 of the whole file.
pub fn whole_file_sha1(path: &Path) -> Result<String> {
    whole_file::<Sha1>(path)
}

/// Lowercase hex MD5 of the half-open byte range `[start, end)`.
///
/// Callers validate the range against the file size; a range running past
/// the end of the file yields the digest of whatever bytes were available.
pub fn range_md5(path: &Path, start: u64, end: u64) -> Result<String> {
    debug_assert!(start <= end, "range_md5: end {end} < start {start}");
    let mut f = open(path)?;
    let io_err = |source| Error::ChecksumIo {
        path: path.to_path_buf(),
        source,
    };
    f.seek(SeekFrom::Start(start)).map_err(io_err)?;
    digest_stream::<Md5, _>(f, end.saturating_sub(start)).map_err(io_err)
}

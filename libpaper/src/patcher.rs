//! Locate and rewrite the ADB credential hash embedded in a firmware image.
//!
//! Two signatures are recognised in the raw bytes of the image:
//!
//! * SHA-256: `#` + 64 hex digits + `  -`
//! * MD5: `= "` + 32 hex digits + `  -"`
//!
//! Both come from `sha256sum`/`md5sum` output baked into the image's init
//! scripts. The payload is only ever overwritten in place, so the image
//! length never changes.
use crate::{Error, Result};
use md5::Md5;
use regex::bytes::Regex;
use sha2::{Digest, Sha256};
use std::{
    fmt,
    fs::OpenOptions,
    io::{Seek, SeekFrom, Write},
    path::Path,
    sync::OnceLock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Md5,
    Sha256,
}

impl HashKind {
    /// Length of the hex payload in bytes.
    pub const fn len(self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha256 => 64,
        }
    }

    /// Hex digest the device expects for `secret`.
    ///
    /// The MD5 variant was generated with `echo secret | md5sum`, so it
    /// includes the trailing newline; the SHA-256 one does not.
    pub fn digest(self, secret: &str) -> String {
        match self {
            Self::Md5 => {
                let mut d = Md5::new();
                d.update(secret.as_bytes());
                d.update(b"\n");
                hex::encode(d.finalize())
            }
            Self::Sha256 => hex::encode(Sha256::digest(secret.as_bytes())),
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Md5 => "MD5",
            Self::Sha256 => "SHA-256",
        })
    }
}

/// A located credential hash: the hex payload lives at
/// `offset..offset + length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashSite {
    pub kind: HashKind,
    pub offset: u64,
    pub length: usize,
}

/// Which site to patch when an image carries more than one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SiteSelection {
    /// Lowest offset.
    #[default]
    First,
    /// Index into the offset-ordered list from [`find_hash_sites`].
    Index(usize),
}

fn signatures() -> &'static [(HashKind, Regex); 2] {
    static SIGNATURES: OnceLock<[(HashKind, Regex); 2]> = OnceLock::new();
    SIGNATURES.get_or_init(|| {
        // (?-u) so that non-UTF-8 bytes elsewhere in the image are fine
        [
            (
                HashKind::Sha256,
                Regex::new(r"(?-u)#([0-9a-fA-F]{64})  -").expect("valid SHA-256 signature"),
            ),
            (
                HashKind::Md5,
                Regex::new(r#"(?-u)= "([0-9a-fA-F]{32})  -""#).expect("valid MD5 signature"),
            ),
        ]
    })
}

/// Finds every non-overlapping signature match in `data`, ordered by offset.
pub fn scan(data: &[u8]) -> Vec<HashSite> {
    let mut sites = Vec::new();
    for (kind, re) in signatures() {
        for caps in re.captures_iter(data) {
            if let Some(m) = caps.get(1) {
                debug!(%kind, offset = m.start(), "hash signature found");
                sites.push(HashSite {
                    kind: *kind,
                    offset: m.start() as u64,
                    length: kind.len(),
                });
            }
        }
    }
    sites.sort_by_key(|s| s.offset);
    sites
}

/// Scans the image at `path` for credential hash sites.
pub fn find_hash_sites(path: &Path) -> Result<Vec<HashSite>> {
    info!("Searching {path:?} for password hashes...");
    let data = std::fs::read(path)?;
    Ok(scan(&data))
}

/// Picks the site to patch, warning when the choice is ambiguous.
pub fn select_site(path: &Path, sites: &[HashSite], selection: SiteSelection) -> Result<HashSite> {
    if sites.is_empty() {
        return Err(Error::PatchSiteNotFound(path.to_path_buf()));
    }
    if sites.len() > 1 {
        warn!(
            count = sites.len(),
            "multiple password hash signatures found; selection may be wrong"
        );
    }
    let index = match selection {
        SiteSelection::First => 0,
        SiteSelection::Index(i) => i,
    };
    sites
        .get(index)
        .copied()
        .ok_or(Error::PatchSiteSelection {
            index,
            count: sites.len(),
        })
}

/// Overwrites the payload of `site` with the hash of `secret`.
///
/// Returns the new hex digest.
pub fn write_hash(path: &Path, site: &HashSite, secret: &str) -> Result<String> {
    if secret.is_empty() {
        return Err(Error::EmptySecret);
    }
    let new_hash = site.kind.digest(secret);
    debug_assert_eq!(new_hash.len(), site.length);

    let mut f = OpenOptions::new().read(true).write(true).open(path)?;
    f.lock()?;
    f.seek(SeekFrom::Start(site.offset))?;
    f.write_all(new_hash.as_bytes())?;
    f.flush()?;
    f.unlock()?;

    info!(kind = %site.kind, offset = site.offset, "new hash {new_hash} written");
    Ok(new_hash)
}

/// Finds, selects and patches a credential hash site in one step.
pub fn replace_hash(path: &Path, secret: &str, selection: SiteSelection) -> Result<HashSite> {
    if secret.is_empty() {
        return Err(Error::EmptySecret);
    }
    let sites = find_hash_sites(path)?;
    let site = select_site(path, &sites, selection)?;
    write_hash(path, &site, secret)?;
    Ok(site)
}

#[cfg(test)]
mod test {
    use super::*;

    const MD5_SITE: &[u8] = b"= \"0123456789abcdef0123456789ABCDEF  -\"";

    fn sha_signature(fill: u8) -> Vec<u8> {
        let mut v = vec![b'#'];
        v.extend(std::iter::repeat(fill).take(64));
        v.extend_from_slice(b"  -");
        v
    }

    fn image(parts: &[&[u8]]) -> Result<tempfile::NamedTempFile> {
        let f = tempfile::NamedTempFile::new()?;
        std::fs::write(f.path(), parts.concat())?;
        Ok(f)
    }

    #[test]
    fn sha256_site_offset() {
        for k in [0usize, 1, 7, 500] {
            let mut data = vec![0xffu8; k];
            data.extend(sha_signature(b'a'));
            data.extend_from_slice(b"\x00\x80tail");

            let sites = scan(&data);
            assert_eq!(
                vec![HashSite {
                    kind: HashKind::Sha256,
                    offset: k as u64 + 1,
                    length: 64,
                }],
                sites,
            );
        }
    }

    #[test]
    fn md5_site_offset() {
        for k in [0usize, 3, 1024] {
            let mut data = vec![0xc3u8; k];
            data.extend_from_slice(MD5_SITE);

            let sites = scan(&data);
            assert_eq!(
                vec![HashSite {
                    kind: HashKind::Md5,
                    offset: k as u64 + 3,
                    length: 32,
                }],
                sites,
            );
        }
    }

    #[test]
    fn near_misses_ignored() {
        // 63 hex digits, single space, non-hex digit, missing closing quote
        let mut short = vec![b'#'];
        short.extend(std::iter::repeat(b'a').take(63));
        short.extend_from_slice(b"  -");
        assert!(scan(&short).is_empty());

        let mut one_space = sha_signature(b'b');
        one_space.remove(65);
        assert!(scan(&one_space).is_empty());

        assert!(scan(&sha_signature(b'g')).is_empty());
        assert!(scan(&MD5_SITE[..MD5_SITE.len() - 1]).is_empty());
    }

    #[test]
    fn multiple_sites_ordered() -> Result<()> {
        let f = image(&[b"xx", MD5_SITE, b"yy", &sha_signature(b'1'), MD5_SITE])?;
        let sites = find_hash_sites(f.path())?;
        assert_eq!(3, sites.len());
        assert_eq!(HashKind::Md5, sites[0].kind);
        assert_eq!(5, sites[0].offset);
        assert_eq!(HashKind::Sha256, sites[1].kind);
        assert!(sites.windows(2).all(|w| w[0].offset < w[1].offset));

        assert_eq!(sites[0], select_site(f.path(), &sites, SiteSelection::First)?);
        assert_eq!(sites[2], select_site(f.path(), &sites, SiteSelection::Index(2))?);
        assert!(matches!(
            select_site(f.path(), &sites, SiteSelection::Index(3)),
            Err(Error::PatchSiteSelection { index: 3, count: 3 }),
        ));
        Ok(())
    }

    #[test]
    fn replace_sha256_in_place() -> Result<()> {
        let f = image(&[b"...", &sha_signature(b'a'), b"  -..."])?;
        let before = std::fs::read(f.path())?;

        let site = replace_hash(f.path(), "newpass", SiteSelection::First)?;
        assert_eq!(HashKind::Sha256, site.kind);
        assert_eq!(4, site.offset);

        let after = std::fs::read(f.path())?;
        assert_eq!(before.len(), after.len());
        let (start, end) = (site.offset as usize, site.offset as usize + site.length);
        assert_eq!(before[..start], after[..start]);
        assert_eq!(before[end..], after[end..]);
        assert_eq!(
            b"253c2e786c2414dcaec8dbf11df515b5075371454b93a5687d24d96ddbf3b939",
            &after[start..end],
        );

        // The patched image still carries exactly one site, now with the new hash
        assert_eq!(vec![site], find_hash_sites(f.path())?);
        Ok(())
    }

    #[test]
    fn replace_md5_appends_newline() -> Result<()> {
        let f = image(&[b"\x7fELF", MD5_SITE, b"\n"])?;
        let site = replace_hash(f.path(), "newpass", SiteSelection::First)?;
        let after = std::fs::read(f.path())?;
        // md5("newpass\n")
        assert_eq!(
            b"9eb1d8a0ec670a43e99aa74a7744901f",
            &after[site.offset as usize..site.offset as usize + 32],
        );
        Ok(())
    }

    #[test]
    fn no_site_is_fatal() -> Result<()> {
        let f = image(&[b"nothing to see here"])?;
        assert!(matches!(
            replace_hash(f.path(), "pw", SiteSelection::First),
            Err(Error::PatchSiteNotFound(_)),
        ));
        assert!(matches!(
            replace_hash(f.path(), "", SiteSelection::First),
            Err(Error::EmptySecret),
        ));
        Ok(())
    }
}

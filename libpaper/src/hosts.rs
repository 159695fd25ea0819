//! Host-table redirect of the vendor domain to the local service.
//!
//! A backup of the host table is taken before the first change and copied
//! back on [`NetworkRedirector::disable`]. The backup's existence is the only
//! record that a redirect is active.
use crate::{config::ProtocolConfig, Error, Result};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    process::Command,
};

/// Encodings tried, in order, when reading the host table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostEncoding {
    Utf8,
    Gbk,
    Latin1,
}

const ENCODINGS: [HostEncoding; 3] = [HostEncoding::Utf8, HostEncoding::Gbk, HostEncoding::Latin1];

impl HostEncoding {
    fn decode(self, raw: &[u8]) -> Option<String> {
        match self {
            Self::Utf8 => std::str::from_utf8(raw).ok().map(str::to_string),
            Self::Gbk => encoding_rs::GBK
                .decode_without_bom_handling_and_without_replacement(raw)
                .map(|s| s.into_owned()),
            Self::Latin1 => Some(raw.iter().map(|&b| char::from(b)).collect()),
        }
    }

    fn encode(self, text: &str) -> Option<Vec<u8>> {
        match self {
            Self::Utf8 => Some(text.as_bytes().to_vec()),
            Self::Gbk => {
                let (bytes, _, had_errors) = encoding_rs::GBK.encode(text);
                (!had_errors).then(|| bytes.into_owned())
            }
            Self::Latin1 => text.chars().map(|c| u8::try_from(c).ok()).collect(),
        }
    }
}

/// First encoding in [`ENCODINGS`] that decodes `raw` without error.
fn decode_host_table(raw: &[u8]) -> (String, HostEncoding) {
    ENCODINGS
        .iter()
        .find_map(|&encoding| encoding.decode(raw).map(|text| (text, encoding)))
        // Latin-1 maps every byte, so this is never reached
        .unwrap_or_else(|| (String::from_utf8_lossy(raw).into_owned(), HostEncoding::Latin1))
}

/// Does `table` already map `domain` to `ip`?
fn has_entry(table: &str, ip: &str, domain: &str) -> bool {
    table.lines().any(|line| {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        fields.next() == Some(ip) && fields.any(|name| name.eq_ignore_ascii_case(domain))
    })
}

/// Invalidates the OS resolver cache. Failure is only worth a warning.
fn flush_dns_cache() {
    #[cfg(windows)]
    let (program, args) = ("ipconfig", &["/flushdns"][..]);
    #[cfg(target_os = "macos")]
    let (program, args) = ("dscacheutil", &["-flushcache"][..]);
    #[cfg(not(any(windows, target_os = "macos")))]
    let (program, args) = ("resolvectl", &["flush-caches"][..]);

    match Command::new(program).args(args).output() {
        Ok(out) if out.status.success() => debug!("DNS cache flushed"),
        Ok(out) => warn!(
            "failed to flush DNS cache ({program} exited with {})",
            out.status
        ),
        Err(e) => warn!("failed to flush DNS cache ({program}: {e})"),
    }
}

pub struct NetworkRedirector {
    hosts_path: PathBuf,
    backup_path: PathBuf,
    domain: String,
    flush_dns: bool,
}

impl NetworkRedirector {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            hosts_path: config.hosts_path.clone(),
            backup_path: config.hosts_backup_path.clone(),
            domain: config.vendor_domain.clone(),
            flush_dns: config.flush_dns,
        }
    }

    pub fn hosts_path(&self) -> &Path {
        &self.hosts_path
    }

    /// Whether a redirect is currently in place.
    pub fn is_active(&self) -> bool {
        self.backup_path.exists()
    }

    fn err(&self, e: impl std::fmt::Display) -> Error {
        Error::host_table(&self.hosts_path, e)
    }

    /// Points the vendor domain at `ip`.
    ///
    /// Returns `false` if the entry was already present and nothing changed.
    pub fn enable(&self, ip: &str) -> Result<bool> {
        if !self.is_active() {
            info!("Backing up {:?} to {:?}", self.hosts_path, self.backup_path);
            fs::copy(&self.hosts_path, &self.backup_path).map_err(|e| self.err(e))?;
        }

        let raw = fs::read(&self.hosts_path).map_err(|e| self.err(e))?;
        let (table, encoding) = decode_host_table(&raw);
        debug!(?encoding, "read host table");
        if has_entry(&table, ip, &self.domain) {
            info!("Host table already redirects {} to {ip}", self.domain);
            return Ok(false);
        }

        let prefix = if table.is_empty() || table.ends_with('\n') {
            ""
        } else {
            "\n"
        };
        let line = format!("{prefix}{ip} {}\n", self.domain);
        let bytes = encoding
            .encode(&line)
            .ok_or_else(|| self.err(format!("entry cannot be encoded as {encoding:?}")))?;
        OpenOptions::new()
            .append(true)
            .open(&self.hosts_path)
            .and_then(|mut f| f.write_all(&bytes))
            .map_err(|e| self.err(e))?;

        info!("Host table now redirects {} to {ip}", self.domain);
        if self.flush_dns {
            flush_dns_cache();
        }
        Ok(true)
    }

    /// Restores the host table from the backup and removes the backup.
    ///
    /// Returns `false` when no redirect was active.
    pub fn disable(&self) -> Result<bool> {
        if !self.is_active() {
            return Ok(false);
        }
        info!("Restoring {:?} from backup", self.hosts_path);
        fs::copy(&self.backup_path, &self.hosts_path).map_err(|e| self.err(e))?;
        fs::remove_file(&self.backup_path).map_err(|e| self.err(e))?;

        info!("Host table restored");
        if self.flush_dns {
            flush_dns_cache();
        }
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn redirector(dir: &Path, content: &[u8]) -> Result<NetworkRedirector> {
        let hosts = dir.join("hosts");
        fs::write(&hosts, content)?;
        Ok(NetworkRedirector::new(&ProtocolConfig {
            hosts_path: hosts,
            hosts_backup_path: dir.join("hosts.paper_bak"),
            flush_dns: false,
            ..Default::default()
        }))
    }

    fn backups(dir: &Path) -> Result<usize> {
        Ok(fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with("paper_bak"))
            .count())
    }

    #[test]
    fn enable_twice_then_disable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let original = b"127.0.0.1 localhost\n# comment without newline";
        let r = redirector(dir.path(), original)?;

        assert!(!r.is_active());
        assert!(r.enable("10.0.0.1")?);
        assert!(!r.enable("10.0.0.1")?);
        assert!(r.is_active());
        assert_eq!(1, backups(dir.path())?);

        let table = fs::read_to_string(r.hosts_path())?;
        assert_eq!(
            1,
            table
                .lines()
                .filter(|l| *l == "10.0.0.1 iotapi.abupdate.com")
                .count()
        );
        assert!(table.starts_with("127.0.0.1 localhost\n# comment without newline\n10.0.0.1"));

        assert!(r.disable()?);
        assert!(!r.is_active());
        assert_eq!(0, backups(dir.path())?);
        assert_eq!(&original[..], fs::read(r.hosts_path())?);
        Ok(())
    }

    #[test]
    fn disable_without_backup_is_noop() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let r = redirector(dir.path(), b"127.0.0.1 localhost\n")?;
        assert!(!r.disable()?);
        assert_eq!(b"127.0.0.1 localhost\n".to_vec(), fs::read(r.hosts_path())?);
        Ok(())
    }

    #[test]
    fn existing_entry_left_alone() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let original = b"10.0.0.1\tother.example IOTAPI.abupdate.com # pen\n";
        let r = redirector(dir.path(), original)?;
        assert!(!r.enable("10.0.0.1")?);
        assert_eq!(&original[..], fs::read(r.hosts_path())?);
        // A different address is still appended
        assert!(r.enable("110.0.0.1")?);
        Ok(())
    }

    #[test]
    fn non_utf8_table_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // "# 本地" in GBK
        let original = b"# \xb1\xbe\xb5\xd8\n127.0.0.1 localhost";
        let r = redirector(dir.path(), original)?;
        assert!(r.enable("192.168.137.1")?);

        let raw = fs::read(r.hosts_path())?;
        assert!(raw.starts_with(original));
        assert!(raw.ends_with(b"\n192.168.137.1 iotapi.abupdate.com\n"));

        r.disable()?;
        assert_eq!(&original[..], fs::read(r.hosts_path())?);
        Ok(())
    }

    #[test]
    fn encoding_fallback_order() {
        assert_eq!(HostEncoding::Utf8, decode_host_table("é".as_bytes()).1);
        assert_eq!(HostEncoding::Gbk, decode_host_table(b"\xb1\xbe").1);
        // Lone lead byte is neither UTF-8 nor GBK
        let (text, encoding) = decode_host_table(b"a\xff");
        assert_eq!(HostEncoding::Latin1, encoding);
        assert_eq!("a\u{ff}", text);
    }

    #[test]
    fn missing_table_is_host_table_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let r = NetworkRedirector::new(&ProtocolConfig {
            hosts_path: dir.path().join("absent"),
            hosts_backup_path: dir.path().join("absent.bak"),
            flush_dns: false,
            ..Default::default()
        });
        assert!(matches!(r.enable("10.0.0.1"), Err(Error::HostTable { .. })));
        Ok(())
    }
}

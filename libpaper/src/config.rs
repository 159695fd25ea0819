use crate::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[cfg(windows)]
const HOSTS_PATH: &str = r"C:\Windows\System32\drivers\etc\hosts";
#[cfg(windows)]
const HOSTS_BACKUP_PATH: &str = r"C:\Windows\System32\drivers\etc\hosts.paper_bak";
#[cfg(not(windows))]
const HOSTS_PATH: &str = "/etc/hosts";
#[cfg(not(windows))]
const HOSTS_BACKUP_PATH: &str = "/etc/hosts.paper_bak";

/// Vendor OTA protocol constants and local system paths.
///
/// Every field has a default matching the vendor service, so a TOML file
/// only needs to name the values it overrides:
///
/// ```toml
/// vendor_base_url = "http://127.0.0.1:8080"
/// flush_dns = false
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Scheme and host the captured request path is replayed against.
    pub vendor_base_url: String,

    /// Domain redirected to the local service in the host table.
    pub vendor_domain: String,

    /// Path fragment identifying the device's product in the request target.
    pub product_fragment: String,

    /// Path fragment identifying an update check.
    pub check_fragment: String,

    /// Version reported to the vendor so it answers with a full package.
    pub sentinel_version: String,

    /// `User-Agent` of the device's update client.
    pub user_agent: String,

    /// Route the patched image is served on.
    pub image_route: String,

    /// TCP port the device's update check is sent to.
    pub capture_port: u16,

    pub hosts_path: PathBuf,

    /// Backup of [`Self::hosts_path`]; exists only while a redirect is active.
    pub hosts_backup_path: PathBuf,

    /// Invalidate the OS resolver cache after touching the host table.
    pub flush_dns: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            vendor_base_url: "http://iotapi.abupdate.com".to_string(),
            vendor_domain: "iotapi.abupdate.com".to_string(),
            product_fragment: "/product/".to_string(),
            check_fragment: "/ota/checkVersion".to_string(),
            sentinel_version: "99.99.90".to_string(),
            user_agent: "Dalvik/2.1.0 (Linux; U; Android 8.1.0; P780 Build/O11019)".to_string(),
            image_route: "/image.img".to_string(),
            capture_port: 80,
            hosts_path: PathBuf::from(HOSTS_PATH),
            hosts_backup_path: PathBuf::from(HOSTS_BACKUP_PATH),
            flush_dns: true,
        }
    }
}

impl ProtocolConfig {
    /// Reads a TOML file, falling back to defaults for absent keys.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Full vendor URL for a captured request target.
    pub fn vendor_url(&self, path: &str) -> String {
        format!("{}{}", self.vendor_base_url.trim_end_matches('/'), path)
    }

    /// URL the device downloads the patched image from.
    pub fn local_image_url(&self, local_address: &str) -> String {
        format!("http://{}{}", local_address, self.image_route)
    }
}

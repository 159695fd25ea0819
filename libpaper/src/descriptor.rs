use crate::{checksum, config::ProtocolConfig, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

const VERSION_PATH: &str = "data.version";
const SEGMENTS_KEY: &str = "segmentMd5";

/// Vendor update descriptor, as returned by `/ota/checkVersion`.
///
/// Held as raw JSON so that fields this tool doesn't know about survive the
/// round trip untouched. Only `data.version` is interpreted:
///
/// ```json
/// {"data": {"version": {
///     "deltaUrl": "...", "bakUrl": "...", "fullUrl": "...",
///     "md5sum": "...", "sha": "...",
///     "segmentMd5": "[{\"startpos\":0,\"endpos\":4,\"md5\":\"...\"}]"
/// }}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateDescriptor(pub Value);

/// One digest-covered byte range `[startpos, endpos)` of the image.
///
/// Held as the vendor's own object, so key order and unknown keys are
/// written back as they came.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Segment(Map<String, Value>);

impl Segment {
    fn from_value(path: &str, value: &Value) -> Result<Self> {
        let record = value
            .as_object()
            .ok_or_else(|| Error::descriptor(path, "expected an object"))?;
        for key in ["startpos", "endpos"] {
            if !record.get(key).is_some_and(Value::is_u64) {
                return Err(Error::descriptor(
                    path,
                    format!("`{key}` missing or not a non-negative integer"),
                ));
            }
        }
        Ok(Self(record.clone()))
    }

    fn position(&self, key: &str) -> u64 {
        // Checked in from_value
        self.0.get(key).and_then(Value::as_u64).unwrap_or_default()
    }

    pub fn startpos(&self) -> u64 {
        self.position("startpos")
    }

    pub fn endpos(&self) -> u64 {
        self.position("endpos")
    }

    pub fn md5(&self) -> Option<&str> {
        self.0.get("md5").and_then(Value::as_str)
    }

    /// Replaces the digest in place, or appends it if absent.
    pub fn set_md5(&mut self, md5: String) {
        self.0.insert("md5".to_string(), Value::String(md5));
    }
}

/// `segmentMd5` in whichever encoding the vendor used.
///
/// The device's parser only accepts the encoding it was sent, so the tag is
/// read once and written back unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentTable {
    /// A string holding a JSON array.
    Encoded(Vec<Segment>),
    /// A plain JSON array.
    Native(Vec<Segment>),
}

impl SegmentTable {
    pub fn from_value(value: &Value) -> Result<Self> {
        let path = format!("{VERSION_PATH}.{SEGMENTS_KEY}");
        match value {
            Value::String(s) => {
                let inner: Value = serde_json::from_str(s)
                    .map_err(|e| Error::descriptor(&path, format!("invalid encoded JSON: {e}")))?;
                Ok(Self::Encoded(parse_segments(&path, &inner)?))
            }
            Value::Array(_) => Ok(Self::Native(parse_segments(&path, value)?)),
            _ => Err(Error::descriptor(path, "expected a string or an array")),
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(match self {
            Self::Encoded(segments) => Value::String(serde_json::to_string(segments)?),
            Self::Native(segments) => serde_json::to_value(segments)?,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        match self {
            Self::Encoded(s) | Self::Native(s) => s,
        }
    }

    pub fn segments_mut(&mut self) -> &mut Vec<Segment> {
        match self {
            Self::Encoded(s) | Self::Native(s) => s,
        }
    }
}

fn parse_segments(path: &str, value: &Value) -> Result<Vec<Segment>> {
    let items = value
        .as_array()
        .ok_or_else(|| Error::descriptor(path, "expected an array of segments"))?;
    items
        .iter()
        .enumerate()
        .map(|(i, item)| Segment::from_value(&format!("{path}[{i}]"), item))
        .collect()
}

impl UpdateDescriptor {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Ok(Self(serde_json::from_slice(data)?))
    }

    /// The `data.version` object.
    pub fn version(&self) -> Result<&Map<String, Value>> {
        self.0
            .get("data")
            .and_then(|d| d.get("version"))
            .and_then(Value::as_object)
            .ok_or_else(|| Error::descriptor(VERSION_PATH, "missing or not an object"))
    }

    pub fn version_mut(&mut self) -> Result<&mut Map<String, Value>> {
        self.0
            .get_mut("data")
            .and_then(|d| d.get_mut("version"))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::descriptor(VERSION_PATH, "missing or not an object"))
    }

    /// URL of the firmware package the vendor offers.
    pub fn delta_url(&self) -> Result<&str> {
        self.version()?
            .get("deltaUrl")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::descriptor(format!("{VERSION_PATH}.deltaUrl"), "missing"))
    }

    pub fn segment_table(&self) -> Result<SegmentTable> {
        let value = self.version()?.get(SEGMENTS_KEY).ok_or_else(|| {
            Error::descriptor(format!("{VERSION_PATH}.{SEGMENTS_KEY}"), "missing")
        })?;
        SegmentTable::from_value(value)
    }

    /// Points the descriptor at the patched image at `image_path`, served
    /// from `local_address`.
    ///
    /// Every segment digest, `md5sum` and `sha` are recomputed from the file
    /// on disk, and `deltaUrl`, `bakUrl` and `fullUrl` (when present) are
    /// rewritten to the local image route.
    pub fn rebuild(
        &mut self,
        image_path: &Path,
        local_address: &str,
        config: &ProtocolConfig,
    ) -> Result<()> {
        info!("Recalculating checksums for {image_path:?}...");
        let size = std::fs::metadata(image_path)
            .map_err(|source| Error::ChecksumIo {
                path: image_path.to_path_buf(),
                source,
            })?
            .len();

        let mut table = self.segment_table()?;
        for (i, segment) in table.segments_mut().iter_mut().enumerate() {
            let (start, end) = (segment.startpos(), segment.endpos());
            if start > end || end > size {
                return Err(Error::descriptor(
                    format!("{VERSION_PATH}.{SEGMENTS_KEY}[{i}]"),
                    format!("range {start}..{end} does not fit a {size} byte image"),
                ));
            }
            segment.set_md5(checksum::range_md5(image_path, start, end)?);
        }
        let segments = table.to_value()?;
        let md5sum = checksum::whole_file_md5(image_path)?;
        let sha = checksum::whole_file_sha1(image_path)?;
        let url = Value::String(config.local_image_url(local_address));

        let version = self.version_mut()?;
        version.insert(SEGMENTS_KEY.to_string(), segments);
        version.insert("md5sum".to_string(), Value::String(md5sum));
        version.insert("sha".to_string(), Value::String(sha));
        version.insert("deltaUrl".to_string(), url.clone());
        version.insert("bakUrl".to_string(), url.clone());
        if let Some(full) = version.get_mut("fullUrl") {
            *full = url;
        }

        debug!("rebuilt descriptor: {}", self.0);
        Ok(())
    }
}

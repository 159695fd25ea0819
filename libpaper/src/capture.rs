//! Passive capture of the device's update check.
use crate::{config::ProtocolConfig, frame::tcp_payload, Error, Result};
use pnet_datalink::{self as datalink, Channel, Config, NetworkInterface};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    io::ErrorKind,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// How often a blocked capture checks for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The device's update check: request target plus its JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub path: String,
    pub body: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    Found(CapturedRequest),
    Cancelled,
}

/// Shared cancellation flag for blocking operations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Recognises an update check in a single TCP payload.
#[derive(Debug, Clone)]
pub struct RequestFilter {
    product_fragment: String,
    check_fragment: String,
}

impl RequestFilter {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            product_fragment: config.product_fragment.clone(),
            check_fragment: config.check_fragment.clone(),
        }
    }

    /// Returns the request if `payload` is a `POST` to the update-check
    /// path carrying a JSON object body.
    pub fn inspect(&self, payload: &[u8]) -> Option<CapturedRequest> {
        let text = String::from_utf8_lossy(payload);
        let target = request_target(&text)?;
        debug!("captured POST: {:.100}", text);

        if !(target.contains(&self.product_fragment) && target.contains(&self.check_fragment)) {
            return None;
        }
        info!("Captured update request for {target}");

        let Some((_, body)) = text.split_once("\r\n\r\n") else {
            warn!("update request has no body in this segment");
            return None;
        };
        let Some(json) = extract_json_object(body) else {
            warn!("no JSON object in update request body");
            return None;
        };
        match serde_json::from_str::<Map<String, Value>>(json) {
            Ok(body) => Some(CapturedRequest {
                path: target.to_string(),
                body,
            }),
            Err(e) => {
                warn!("failed to parse update request body: {e}");
                None
            }
        }
    }
}

/// Target of a `POST <target> HTTP/x` request line.
fn request_target(text: &str) -> Option<&str> {
    let line = text.lines().next()?;
    let rest = line.strip_prefix("POST ")?;
    let end = rest.find(" HTTP")?;
    Some(&rest[..end])
}

/// Finds the first brace-balanced JSON object in `text`.
///
/// Braces inside string literals are not counted. Anything after the
/// closing brace is ignored.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut from = 0;
    while let Some(rel) = bytes[from..].iter().position(|&b| b == b'{') {
        let start = from + rel;
        if let Some(len) = balanced_len(&bytes[start..]) {
            // Braces are ASCII, so both ends are char boundaries
            return Some(&text[start..start + len]);
        }
        from = start + 1;
    }
    None
}

fn balanced_len(bytes: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn find_interface(address: IpAddr) -> Result<NetworkInterface> {
    let interfaces = datalink::interfaces();
    let found = if address.is_unspecified() {
        interfaces
            .into_iter()
            .find(|i| i.is_up() && !i.is_loopback() && !i.ips.is_empty())
    } else {
        interfaces
            .into_iter()
            .find(|i| i.ips.iter().any(|n| n.ip() == address))
    };
    found.ok_or(Error::InterfaceNotFound(address))
}

/// Listens on the interface owning `interface_address` until the device's
/// update check is seen or `cancel` is set.
///
/// Frames that fail to decode are skipped; only a match or cancellation ends
/// the capture.
pub fn capture(
    config: &ProtocolConfig,
    interface_address: IpAddr,
    cancel: &CancelToken,
) -> Result<CaptureOutcome> {
    let interface = find_interface(interface_address)?;
    info!(
        "Starting packet capture on {} ({interface_address})...",
        interface.name
    );

    let channel_config = Config {
        read_timeout: Some(POLL_INTERVAL),
        ..Default::default()
    };
    let mut rx = match datalink::channel(&interface, channel_config) {
        Ok(Channel::Ethernet(_, rx)) => rx,
        Ok(_) => return Err(Error::UnsupportedChannel(interface.name)),
        Err(e) => return Err(e.into()),
    };

    let filter = RequestFilter::new(config);
    info!("Waiting for the device to check for updates...");
    loop {
        if cancel.is_cancelled() {
            info!("Capture cancelled");
            return Ok(CaptureOutcome::Cancelled);
        }
        match rx.next() {
            Ok(frame) => {
                let found = tcp_payload(frame, config.capture_port)
                    .and_then(|payload| filter.inspect(payload));
                if let Some(request) = found {
                    return Ok(CaptureOutcome::Found(request));
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e.into()),
        }
    }
}

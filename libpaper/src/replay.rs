use crate::{
    capture::CancelToken, config::ProtocolConfig, descriptor::UpdateDescriptor, Error, Result,
};
use serde_json::{Map, Value};
use std::{
    fs::File,
    io::{BufWriter, Read, Write},
    path::Path,
};
use ureq::{http::Response, Agent, Body};

const DOWNLOAD_CHUNK: usize = 8192;

/// Talks to the vendor OTA service on behalf of the device.
pub struct ReplayClient {
    config: ProtocolConfig,
    agent: Agent,
}

impl ReplayClient {
    pub fn new(config: ProtocolConfig) -> Self {
        // Non-2xx responses are reported with their body rather than as a bare status
        let agent: Agent = Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();
        Self { config, agent }
    }

    fn check_status(url: &str, response: &mut Response<Body>) -> Result<()> {
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(());
        }
        let body = response.body_mut().read_to_string().unwrap_or_default();
        error!("vendor returned HTTP {status}: {body}");
        Err(Error::ReplayHttp {
            url: url.to_string(),
            status,
            body,
        })
    }

    /// Replays a captured update check and returns the vendor's descriptor.
    ///
    /// A `version` field in `body` is replaced with the sentinel version so
    /// the vendor offers a full image rather than a delta. No retries.
    pub fn fetch_descriptor(
        &self,
        path: &str,
        body: &Map<String, Value>,
    ) -> Result<UpdateDescriptor> {
        let url = self.config.vendor_url(path);
        info!("Requesting update information from {url}...");

        let mut body = body.clone();
        if let Some(version) = body.get_mut("version") {
            info!(
                "Replacing reported version {version} with {}",
                self.config.sentinel_version
            );
            *version = Value::String(self.config.sentinel_version.clone());
        }
        debug!("request body: {}", serde_json::Value::Object(body.clone()));

        let mut response = self
            .agent
            .post(&url)
            .header("User-Agent", self.config.user_agent.as_str())
            .header("Connection", "Keep-Alive")
            .send_json(&body)?;
        Self::check_status(&url, &mut response)?;

        let descriptor: UpdateDescriptor = response.body_mut().read_json()?;
        debug!("update information: {:.200}", descriptor.0.to_string());
        Ok(descriptor)
    }

    /// Streams `url` into `dest`, calling `progress(downloaded, total)` after
    /// every chunk. `total` is `None` when the server sends no length.
    ///
    /// `cancel` is checked between chunks; a cancelled download removes the
    /// partial file and returns [`Error::Cancelled`].
    ///
    /// Returns the number of bytes written.
    pub fn download_firmware(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancelToken,
        mut progress: impl FnMut(u64, Option<u64>),
    ) -> Result<u64> {
        info!("Downloading {url} to {dest:?}...");
        let mut response = self
            .agent
            .get(url)
            .header("User-Agent", self.config.user_agent.as_str())
            .call()?;
        Self::check_status(url, &mut response)?;

        let total = response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let mut reader = response.into_body().into_reader();
        let mut out = BufWriter::new(File::create(dest)?);
        let mut buf = [0u8; DOWNLOAD_CHUNK];
        let mut downloaded = 0u64;

        loop {
            if cancel.is_cancelled() {
                drop(out);
                info!("Download cancelled, removing {dest:?}");
                if let Err(e) = std::fs::remove_file(dest) {
                    warn!("failed to remove partial download: {e}");
                }
                return Err(Error::Cancelled);
            }
            let size = reader.read(&mut buf)?;
            if size == 0 {
                break;
            }
            out.write_all(&buf[..size])?;
            downloaded += size as u64;
            progress(downloaded, total);
        }
        out.flush()?;

        info!("Download complete ({downloaded} bytes)");
        Ok(downloaded)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::thread;
    use tiny_http::{Response as HttpResponse, Server};

    /// Fake vendor answering a single request; returns what it was sent.
    fn vendor(
        status: u16,
        reply: &'static [u8],
    ) -> (String, thread::JoinHandle<(String, String, Option<String>, String)>) {
        let server = Server::http("127.0.0.1:0").expect("bind");
        let port = server.server_addr().to_ip().expect("ip").port();
        let handle = thread::spawn(move || {
            let mut req = server.recv().expect("request");
            let method = req.method().to_string();
            let url = req.url().to_string();
            let agent = req
                .headers()
                .iter()
                .find(|h| h.field.equiv("User-Agent"))
                .map(|h| h.value.to_string());
            let mut body = String::new();
            req.as_reader().read_to_string(&mut body).expect("body");
            req.respond(HttpResponse::from_data(reply).with_status_code(status))
                .expect("respond");
            (method, url, agent, body)
        });
        (format!("http://127.0.0.1:{port}"), handle)
    }

    /// Fake vendor that doesn't mind the client hanging up mid-response.
    fn vendor_lenient(reply: &'static [u8]) -> (String, thread::JoinHandle<()>) {
        let server = Server::http("127.0.0.1:0").expect("bind");
        let port = server.server_addr().to_ip().expect("ip").port();
        let handle = thread::spawn(move || {
            if let Ok(req) = server.recv() {
                req.respond(HttpResponse::from_data(reply)).ok();
            }
        });
        (format!("http://127.0.0.1:{port}"), handle)
    }

    fn client(base: String) -> ReplayClient {
        ReplayClient::new(ProtocolConfig {
            vendor_base_url: base,
            ..Default::default()
        })
    }

    #[test]
    fn replay_forces_sentinel_version() -> Result<()> {
        let (base, handle) = vendor(200, br#"{"status":1000,"data":{"version":{"deltaUrl":"http://cdn/fw"}}}"#);
        let body = json!({"mid": "P780", "version": "1.4.2"});
        let body = body.as_object().expect("object");

        let descriptor = client(base).fetch_descriptor("/product/1/k/ota/checkVersion", body)?;
        assert_eq!("http://cdn/fw", descriptor.delta_url()?);

        let (method, url, agent, sent) = handle.join().expect("vendor thread");
        assert_eq!("POST", method);
        assert_eq!("/product/1/k/ota/checkVersion", url);
        assert_eq!(Some(ProtocolConfig::default().user_agent), agent);
        let sent: Value = serde_json::from_str(&sent)?;
        assert_eq!(json!({"mid": "P780", "version": "99.99.90"}), sent);
        Ok(())
    }

    #[test]
    fn replay_without_version_sends_body_unchanged() -> Result<()> {
        let (base, handle) = vendor(200, br#"{"data":{"version":{}}}"#);
        let body = json!({"mid": "P780"});
        client(base).fetch_descriptor("/p", body.as_object().expect("object"))?;
        let (_, _, _, sent) = handle.join().expect("vendor thread");
        assert_eq!(body, serde_json::from_str::<Value>(&sent)?);
        Ok(())
    }

    #[test]
    fn replay_error_status() {
        let (base, handle) = vendor(503, b"maintenance");
        let err = client(base)
            .fetch_descriptor("/p", &Map::new())
            .unwrap_err();
        match err {
            Error::ReplayHttp { status, body, .. } => {
                assert_eq!(503, status);
                assert_eq!("maintenance", body);
            }
            e => panic!("unexpected {e:?}"),
        }
        handle.join().expect("vendor thread");
    }

    #[test]
    fn download_reports_progress() -> Result<()> {
        static IMAGE: [u8; 20000] = [0x5a; 20000];
        let (base, handle) = vendor(200, &IMAGE);
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("image.img");

        let mut last = (0, None);
        let written = client(base.clone()).download_firmware(
            &format!("{base}/fw.img"),
            &dest,
            &CancelToken::new(),
            |done, total| last = (done, total),
        )?;
        handle.join().expect("vendor thread");

        assert_eq!(IMAGE.len() as u64, written);
        assert_eq!((IMAGE.len() as u64, Some(IMAGE.len() as u64)), last);
        assert_eq!(&IMAGE[..], std::fs::read(&dest)?);
        Ok(())
    }

    #[test]
    fn cancelled_download_removes_partial_file() -> Result<()> {
        static IMAGE: [u8; 20000] = [0xa5; 20000];
        let (base, handle) = vendor_lenient(&IMAGE);
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("image.img");

        let cancel = CancelToken::new();
        cancel.cancel();
        let mut calls = 0;
        let result = client(base.clone()).download_firmware(
            &format!("{base}/fw.img"),
            &dest,
            &cancel,
            |_, _| calls += 1,
        );
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(0, calls);
        assert!(!dest.exists());
        handle.join().expect("vendor thread");
        Ok(())
    }
}

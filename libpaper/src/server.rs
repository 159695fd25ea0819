//! Local stand-in for the vendor OTA service.
//!
//! Answers two routes:
//!
//! * `POST` to any path containing the check-version fragment: the rebuilt
//!   descriptor as JSON.
//! * `GET`/`HEAD` on the image route: the patched image, with single-range
//!   `Range`, `If-Range`, `If-None-Match` and `If-Modified-Since` support so
//!   the device can resume downloads.
use crate::{
    capture::CancelToken,
    config::ProtocolConfig,
    descriptor::UpdateDescriptor,
    port::{bind_error, probe_port},
    Error, Result,
};
use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};

/// Called with `(bytes_sent, total_size)` as the image is streamed.
///
/// `bytes_sent` is the absolute file position, so a resumed download reports
/// progress through the whole image. Panics are caught and ignored.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// How long [`LocalOtaServer::stop`] waits for the OS to release the port.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Failed(String),
}

/// Everything a serving session needs; fixed once the server starts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub image_path: PathBuf,
    pub descriptor: Option<UpdateDescriptor>,
    pub check_fragment: String,
    pub image_route: String,
    /// Bind-then-close the port before the real bind.
    pub probe: bool,
}

impl ServerConfig {
    pub fn new(
        protocol: &ProtocolConfig,
        port: u16,
        image_path: PathBuf,
        descriptor: Option<UpdateDescriptor>,
    ) -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            image_path,
            descriptor,
            check_fragment: protocol.check_fragment.clone(),
            image_route: protocol.image_route.clone(),
            probe: true,
        }
    }
}

/// Read-only state shared by all request handlers of one session.
struct Session {
    descriptor: Option<Vec<u8>>,
    image_path: PathBuf,
    check_fragment: String,
    image_route: String,
    progress: Option<ProgressFn>,
}

struct Running {
    server: Arc<Server>,
    worker: JoinHandle<()>,
    addr: SocketAddr,
}

pub struct LocalOtaServer {
    config: ServerConfig,
    progress: Option<ProgressFn>,
    state: Arc<Mutex<ServerState>>,
    running: Option<Running>,
}

fn set_state(state: &Mutex<ServerState>, new: ServerState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = new;
}

impl LocalOtaServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            progress: None,
            state: Arc::new(Mutex::new(ServerState::Idle)),
            running: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn state(&self) -> ServerState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Address actually bound, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.addr)
    }

    fn fail(&self, err: Error) -> Error {
        set_state(&self.state, ServerState::Failed(err.to_string()));
        err
    }

    /// Binds the listener and starts serving on a worker thread.
    pub fn start(&mut self) -> Result<SocketAddr> {
        if self.running.is_some() {
            return Err(Error::ServerRuntime("server is already running".to_string()));
        }
        set_state(&self.state, ServerState::Starting);
        let addr = SocketAddr::new(self.config.bind_address, self.config.port);

        if self.config.probe {
            probe_port(addr).map_err(|e| self.fail(e))?;
        }
        let descriptor = match &self.config.descriptor {
            Some(d) => Some(serde_json::to_vec(d).map_err(|e| self.fail(e.into()))?),
            None => None,
        };

        let server = Server::http(addr).map_err(|e| {
            let err = match e.downcast::<io::Error>() {
                Ok(io_err) => bind_error(addr.port(), *io_err),
                Err(e) => Error::ServerRuntime(e.to_string()),
            };
            self.fail(err)
        })?;
        let bound = server.server_addr().to_ip().unwrap_or(addr);
        let server = Arc::new(server);

        let session = Arc::new(Session {
            descriptor,
            image_path: self.config.image_path.clone(),
            check_fragment: self.config.check_fragment.clone(),
            image_route: self.config.image_route.clone(),
            progress: self.progress.clone(),
        });
        let worker_server = Arc::clone(&server);
        let state = Arc::clone(&self.state);
        let worker = thread::Builder::new()
            .name("ota-server".to_string())
            .spawn(move || accept_loop(&worker_server, &session, &state))
            .map_err(|e| self.fail(e.into()))?;

        set_state(&self.state, ServerState::Running);
        info!("Serving OTA update on {bound}");
        self.running = Some(Running {
            server,
            worker,
            addr: bound,
        });
        Ok(bound)
    }

    /// [`Self::start`], retried once after a port conflict if `retry`
    /// agrees (eg: once the operator has freed the port).
    pub fn start_with_retry(&mut self, retry: impl FnOnce(&Error) -> bool) -> Result<SocketAddr> {
        match self.start() {
            Err(e @ Error::PortBindConflict { port }) => {
                error!("Port {port} is already in use or access was denied.");
                error!("Stop any other web server on port {port} (IIS, Apache, Skype, etc.),");
                error!("or free it with `paper free-port --port {port}`.");
                if retry(&e) {
                    info!("Retrying server start...");
                    self.start()
                } else {
                    Err(e)
                }
            }
            r => r,
        }
    }

    /// Stops accepting connections and releases the port.
    ///
    /// In-flight transfers run on their own threads and may still complete.
    pub fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        set_state(&self.state, ServerState::Stopping);
        info!("Stopping server on {}...", running.addr);

        running.server.unblock();
        if running.worker.join().is_err() {
            return Err(self.fail(Error::ServerRuntime(
                "server worker panicked".to_string(),
            )));
        }
        // Last reference: closes the listening socket
        drop(running.server);
        wait_for_release(running.addr);

        set_state(&self.state, ServerState::Idle);
        info!("Server stopped");
        Ok(())
    }

    /// Blocks until `cancel` is set or the server fails.
    pub fn wait(&self, cancel: &CancelToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if let ServerState::Failed(reason) = self.state() {
                return Err(Error::ServerRuntime(reason));
            }
            thread::sleep(POLL_INTERVAL * 10);
        }
    }
}

impl Drop for LocalOtaServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("error stopping server: {e}");
        }
    }
}

fn wait_for_release(addr: SocketAddr) {
    let deadline = Instant::now() + RELEASE_TIMEOUT;
    while probe_port(addr).is_err() {
        if Instant::now() >= deadline {
            warn!("port {} still busy after stopping", addr.port());
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn accept_loop(server: &Server, session: &Arc<Session>, state: &Mutex<ServerState>) {
    for request in server.incoming_requests() {
        let session = Arc::clone(session);
        let spawned = thread::Builder::new()
            .name("ota-request".to_string())
            .spawn(move || handle(&session, request));
        if let Err(e) = spawned {
            error!("failed to spawn request handler: {e}");
        }
    }

    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if *state != ServerState::Stopping {
        error!("listener stopped unexpectedly");
        *state = ServerState::Failed("listener stopped unexpectedly".to_string());
    }
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

fn text_response(status: u16, body: &str) -> Response<io::Cursor<Vec<u8>>> {
    let mut response = Response::from_string(body).with_status_code(status);
    if let Some(h) = header("Content-Type", "text/plain; charset=utf-8") {
        response.add_header(h);
    }
    response
}

fn request_header(request: &Request, name: &'static str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv(name))
        .map(|h| h.value.as_str().to_string())
}

fn handle(session: &Session, request: Request) {
    let method = request.method().clone();
    let url = request.url().to_string();
    let path = url.split('?').next().unwrap_or_default();
    debug!("{method} {url}");

    let result = match method {
        Method::Post if path.contains(&session.check_fragment) => {
            respond_descriptor(session, request, &url)
        }
        Method::Get | Method::Head if path == session.image_route => {
            respond_image(session, request)
        }
        _ => request.respond(text_response(404, "Not Found")),
    };
    if let Err(e) = result {
        // Usually the device hanging up mid-transfer
        debug!("{method} {url}: {e}");
    }
}

fn respond_descriptor(session: &Session, request: Request, url: &str) -> io::Result<()> {
    info!("Received update check: {url}");
    match &session.descriptor {
        Some(json) => {
            let mut response = Response::from_data(json.clone());
            if let Some(h) = header("Content-Type", "application/json") {
                response.add_header(h);
            }
            request.respond(response)
        }
        None => {
            error!("update check received but no descriptor is configured");
            request.respond(text_response(500, "No update data configured"))
        }
    }
}

/// `ETag` and `Last-Modified` of the served image.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Validators {
    etag: String,
    modified: Option<SystemTime>,
}

impl Validators {
    fn new(size: u64, modified: Option<SystemTime>) -> Self {
        // HTTP dates have one-second resolution
        let modified = modified
            .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
            .map(|d| UNIX_EPOCH + Duration::from_secs(d.as_secs()));
        let secs = modified
            .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        Self {
            etag: format!("\"{secs:x}-{size:x}\""),
            modified,
        }
    }

    fn etag_matches(&self, list: &str) -> bool {
        list.split(',').map(str::trim).any(|tag| {
            tag == "*" || tag.strip_prefix("W/").unwrap_or(tag) == self.etag
        })
    }

    fn not_modified_since(&self, since: &str) -> bool {
        match (self.modified, httpdate::parse_http_date(since)) {
            (Some(modified), Ok(since)) => modified <= since,
            _ => false,
        }
    }

    /// `If-Range` holds: a strong ETag match or an exact date match.
    fn if_range_holds(&self, value: &str) -> bool {
        let value = value.trim();
        if value.starts_with('"') || value.starts_with("W/") {
            return value == self.etag;
        }
        match (self.modified, httpdate::parse_http_date(value)) {
            (Some(modified), Ok(date)) => modified == date,
            _ => false,
        }
    }
}

/// Conditional headers of an image request.
#[derive(Debug, Default)]
struct Conditions {
    range: Option<String>,
    if_range: Option<String>,
    if_none_match: Option<String>,
    if_modified_since: Option<String>,
}

impl Conditions {
    fn from_request(request: &Request) -> Self {
        Self {
            range: request_header(request, "Range"),
            if_range: request_header(request, "If-Range"),
            if_none_match: request_header(request, "If-None-Match"),
            if_modified_since: request_header(request, "If-Modified-Since"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Plan {
    NotModified,
    Full,
    /// Inclusive byte range.
    Partial(u64, u64),
    Unsatisfiable,
}

/// Parses a single `bytes=` range against a file of `size` bytes.
///
/// `None` means the header is ignored (malformed or multiple ranges), which
/// results in a full response.
fn parse_range(value: &str, size: u64) -> Option<Plan> {
    let spec = value.trim().strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }
    let (first, last) = spec.split_once('-')?;
    let (first, last) = (first.trim(), last.trim());

    let plan = if first.is_empty() {
        let suffix: u64 = last.parse().ok()?;
        if suffix == 0 || size == 0 {
            Plan::Unsatisfiable
        } else {
            Plan::Partial(size.saturating_sub(suffix), size - 1)
        }
    } else {
        let start: u64 = first.parse().ok()?;
        let end = if last.is_empty() {
            None
        } else {
            Some(last.parse::<u64>().ok()?)
        };
        if end.is_some_and(|end| end < start) {
            return None;
        }
        if start >= size {
            Plan::Unsatisfiable
        } else {
            Plan::Partial(start, end.map_or(size - 1, |end| end.min(size - 1)))
        }
    };
    Some(plan)
}

fn plan_response(validators: &Validators, conditions: &Conditions, size: u64) -> Plan {
    let not_modified = match (&conditions.if_none_match, &conditions.if_modified_since) {
        (Some(tags), _) => validators.etag_matches(tags),
        (None, Some(since)) => validators.not_modified_since(since),
        (None, None) => false,
    };
    if not_modified {
        return Plan::NotModified;
    }

    let Some(range) = &conditions.range else {
        return Plan::Full;
    };
    if let Some(if_range) = &conditions.if_range {
        if !validators.if_range_holds(if_range) {
            return Plan::Full;
        }
    }
    parse_range(range, size).unwrap_or(Plan::Full)
}

/// Streams the image while reporting progress.
///
/// Wraps a reader positioned at `position` within an image of `total` bytes.
struct ProgressReader<T> {
    inner: T,
    position: u64,
    total: u64,
    progress: Option<ProgressFn>,
}

impl<T> ProgressReader<T> {
    fn new(inner: T, position: u64, total: u64, progress: Option<ProgressFn>) -> Self {
        Self {
            inner,
            position,
            total,
            progress,
        }
    }
}

impl<T: Read> Read for ProgressReader<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.inner.read(buf)?;
        self.position += size as u64;
        if size > 0 {
            if let Some(progress) = &self.progress {
                let (sent, total) = (self.position, self.total);
                if catch_unwind(AssertUnwindSafe(|| progress(sent, total))).is_err() {
                    debug!("progress callback panicked; ignored");
                }
            }
        }
        Ok(size)
    }
}

fn respond_image(session: &Session, request: Request) -> io::Result<()> {
    let mut file = match File::open(&session.image_path) {
        Ok(f) => f,
        Err(e) => {
            error!("firmware image {:?} unavailable: {e}", session.image_path);
            return request.respond(text_response(404, "File not found"));
        }
    };
    let meta = file.metadata()?;
    let size = meta.len();
    let validators = Validators::new(size, meta.modified().ok());
    let plan = plan_response(&validators, &Conditions::from_request(&request), size);
    info!(?plan, "Serving firmware {:?}", session.image_path);

    let mut headers: Vec<Header> = [
        ("Accept-Ranges", "bytes".to_string()),
        ("ETag", validators.etag.clone()),
    ]
    .into_iter()
    .chain(
        validators
            .modified
            .map(|m| ("Last-Modified", httpdate::fmt_http_date(m))),
    )
    .filter_map(|(name, value)| header(name, &value))
    .collect();

    let (status, start, len) = match plan {
        Plan::NotModified => {
            let mut response = Response::empty(304);
            for h in headers {
                response.add_header(h);
            }
            return request.respond(response);
        }
        Plan::Unsatisfiable => {
            let mut response = text_response(416, "Requested range not satisfiable");
            if let Some(h) = header("Content-Range", &format!("bytes */{size}")) {
                response.add_header(h);
            }
            return request.respond(response);
        }
        Plan::Full => (200, 0, size),
        Plan::Partial(start, end) => {
            headers.extend(header(
                "Content-Range",
                &format!("bytes {start}-{end}/{size}"),
            ));
            (206, start, end - start + 1)
        }
    };
    headers.extend(header("Content-Type", "application/octet-stream"));

    file.seek(SeekFrom::Start(start))?;
    let body = ProgressReader::new(file.take(len), start, size, session.progress.clone());
    let length = usize::try_from(len).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let response = Response::new(StatusCode(status), headers, body, Some(length), None)
        // Always send a Content-Length, never chunked
        .with_chunked_threshold(usize::MAX);
    request.respond(response)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::{
        net::TcpStream,
        sync::atomic::{AtomicU64, Ordering},
    };
    use ureq::{
        http::{self, HeaderMap},
        Agent, Body,
    };

    const IMAGE: &[u8] = b"0123456789";

    struct Reply {
        status: u16,
        headers: HeaderMap,
        body: Vec<u8>,
    }

    impl Reply {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers.get(name).and_then(|v| v.to_str().ok())
        }
    }

    /// Fresh agent per request, so no pooled connection outlives a server.
    fn agent() -> Agent {
        Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into()
    }

    fn read_reply(mut response: http::Response<Body>) -> Result<Reply> {
        Ok(Reply {
            status: response.status().as_u16(),
            headers: response.headers().clone(),
            body: response.body_mut().read_to_vec()?,
        })
    }

    fn get(addr: SocketAddr, headers: &[(&str, &str)]) -> Result<Reply> {
        let mut request = agent().get(format!("http://{addr}/image.img"));
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        read_reply(request.call()?)
    }

    fn config(image: PathBuf, descriptor: Option<UpdateDescriptor>) -> ServerConfig {
        ServerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ServerConfig::new(&ProtocolConfig::default(), 0, image, descriptor)
        }
    }

    fn image() -> Result<tempfile::NamedTempFile> {
        let f = tempfile::NamedTempFile::new()?;
        std::fs::write(f.path(), IMAGE)?;
        Ok(f)
    }

    #[test]
    fn range_request() -> Result<()> {
        let f = image()?;
        let mut server = LocalOtaServer::new(config(f.path().to_path_buf(), None));
        let addr = server.start()?;

        let reply = get(addr, &[("Range", "bytes=2-3")])?;
        assert_eq!(206, reply.status);
        assert_eq!(b"23".to_vec(), reply.body);
        assert_eq!(Some("bytes 2-3/10"), reply.header("Content-Range"));
        assert_eq!(Some("2"), reply.header("Content-Length"));

        let reply = get(addr, &[("Range", "bytes=-3")])?;
        assert_eq!(206, reply.status);
        assert_eq!(b"789".to_vec(), reply.body);

        let reply = get(addr, &[("Range", "bytes=7-100")])?;
        assert_eq!(Some("bytes 7-9/10"), reply.header("Content-Range"));

        let reply = get(addr, &[("Range", "bytes=10-")])?;
        assert_eq!(416, reply.status);
        assert_eq!(Some("bytes */10"), reply.header("Content-Range"));

        server.stop()?;
        Ok(())
    }

    #[test]
    fn full_and_conditional() -> Result<()> {
        let f = image()?;
        let mut server = LocalOtaServer::new(config(f.path().to_path_buf(), None));
        let addr = server.start()?;

        let reply = get(addr, &[])?;
        assert_eq!(200, reply.status);
        assert_eq!(IMAGE.to_vec(), reply.body);
        assert_eq!(Some("bytes"), reply.header("Accept-Ranges"));
        let etag = reply.header("ETag").expect("etag").to_string();
        let modified = reply.header("Last-Modified").expect("last-modified").to_string();

        // Resume with a matching validator
        let reply = get(addr, &[("Range", "bytes=5-"), ("If-Range", etag.as_str())])?;
        assert_eq!(206, reply.status);
        assert_eq!(b"56789".to_vec(), reply.body);
        let reply = get(addr, &[("Range", "bytes=5-"), ("If-Range", modified.as_str())])?;
        assert_eq!(206, reply.status);

        // Image changed since: whole file
        let reply = get(addr, &[("Range", "bytes=5-"), ("If-Range", "\"stale\"")])?;
        assert_eq!(200, reply.status);
        assert_eq!(IMAGE.to_vec(), reply.body);

        let reply = get(addr, &[("If-None-Match", etag.as_str())])?;
        assert_eq!(304, reply.status);
        assert!(reply.body.is_empty());
        let reply = get(addr, &[("If-Modified-Since", modified.as_str())])?;
        assert_eq!(304, reply.status);

        let reply = read_reply(agent().head(format!("http://{addr}/image.img")).call()?)?;
        assert_eq!(200, reply.status);
        assert_eq!(Some("10"), reply.header("Content-Length"));
        assert!(reply.body.is_empty());

        server.stop()?;
        Ok(())
    }

    #[test]
    fn descriptor_route() -> Result<()> {
        let f = image()?;
        let descriptor = UpdateDescriptor(json!({"data": {"version": {"md5sum": "abc"}}}));
        let mut server = LocalOtaServer::new(config(f.path().to_path_buf(), Some(descriptor.clone())));
        let addr = server.start()?;

        let body = r#"{"version":"1.0"}"#;
        let reply = read_reply(
            agent()
                .post(format!("http://{addr}/product/1/key/ota/checkVersion"))
                .header("Content-Type", "application/json")
                .send(body)?,
        )?;
        assert_eq!(200, reply.status);
        assert_eq!(Some("application/json"), reply.header("Content-Type"));
        assert_eq!(descriptor, UpdateDescriptor::from_slice(&reply.body)?);

        let reply = read_reply(agent().get(format!("http://{addr}/elsewhere")).call()?)?;
        assert_eq!(404, reply.status);
        let reply = read_reply(
            agent()
                .post(format!("http://{addr}/product/1/ota/report"))
                .send_empty()?,
        )?;
        assert_eq!(404, reply.status);

        server.stop()?;
        Ok(())
    }

    #[test]
    fn missing_descriptor_and_image() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut server = LocalOtaServer::new(config(dir.path().join("absent.img"), None));
        let addr = server.start()?;

        let reply = read_reply(
            agent()
                .post(format!("http://{addr}/ota/checkVersion"))
                .send_empty()?,
        )?;
        assert_eq!(500, reply.status);
        assert_eq!(b"No update data configured".to_vec(), reply.body);
        assert_eq!(404, get(addr, &[])?.status);

        server.stop()?;
        Ok(())
    }

    #[test]
    fn progress_panics_are_swallowed() -> Result<()> {
        let f = image()?;
        let last = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&last);
        let progress: ProgressFn = Arc::new(move |sent, total| {
            assert_eq!(10, total);
            seen.store(sent, Ordering::SeqCst);
            panic!("display went away");
        });
        let mut server =
            LocalOtaServer::new(config(f.path().to_path_buf(), None)).with_progress(progress);
        let addr = server.start()?;

        let reply = get(addr, &[("Range", "bytes=4-")])?;
        assert_eq!(206, reply.status);
        assert_eq!(b"456789".to_vec(), reply.body);
        assert_eq!(10, last.load(Ordering::SeqCst));

        server.stop()?;
        Ok(())
    }

    #[test]
    fn lifecycle_and_port_reuse() -> Result<()> {
        let f = image()?;
        let mut first = LocalOtaServer::new(config(f.path().to_path_buf(), None));
        assert_eq!(ServerState::Idle, first.state());
        let port = first.start()?.port();
        assert_eq!(ServerState::Running, first.state());

        // A second server on the same port is a conflict
        let mut clash = LocalOtaServer::new(ServerConfig {
            port,
            ..config(f.path().to_path_buf(), None)
        });
        assert!(matches!(clash.start(), Err(Error::PortBindConflict { .. })));
        assert!(matches!(clash.state(), ServerState::Failed(_)));

        first.stop()?;
        assert_eq!(ServerState::Idle, first.state());
        assert!(TcpStream::connect(("127.0.0.1", port)).is_err());

        // Same port, no restart of the process needed, twice over
        let mut second = LocalOtaServer::new(ServerConfig {
            port,
            ..config(f.path().to_path_buf(), None)
        });
        for _ in 0..2 {
            assert_eq!(port, second.start()?.port());
            assert_eq!(200, get(SocketAddr::from(([127, 0, 0, 1], port)), &[])?.status);
            second.stop()?;
        }
        Ok(())
    }

    #[test]
    fn retry_once_after_conflict() -> Result<()> {
        let f = image()?;
        let held = std::net::TcpListener::bind("127.0.0.1:0")?;
        let port = held.local_addr()?.port();
        let mut server = LocalOtaServer::new(ServerConfig {
            port,
            ..config(f.path().to_path_buf(), None)
        });

        let mut held = Some(held);
        let addr = server.start_with_retry(|e| {
            assert!(matches!(e, Error::PortBindConflict { .. }));
            // Operator frees the port
            held.take();
            true
        })?;
        assert_eq!(port, addr.port());
        server.stop()?;

        let _held = std::net::TcpListener::bind(("127.0.0.1", port))?;
        assert!(matches!(
            server.start_with_retry(|_| false),
            Err(Error::PortBindConflict { .. })
        ));
        Ok(())
    }

    #[test]
    fn wait_returns_on_cancel() -> Result<()> {
        let f = image()?;
        let mut server = LocalOtaServer::new(config(f.path().to_path_buf(), None));
        server.start()?;
        let cancel = CancelToken::new();
        cancel.cancel();
        server.wait(&cancel)?;
        server.stop()?;
        Ok(())
    }

    #[test]
    fn range_parsing() {
        assert_eq!(Some(Plan::Partial(2, 3)), parse_range("bytes=2-3", 10));
        assert_eq!(Some(Plan::Partial(0, 9)), parse_range("bytes=0-", 10));
        assert_eq!(Some(Plan::Partial(0, 9)), parse_range("bytes=-20", 10));
        assert_eq!(Some(Plan::Unsatisfiable), parse_range("bytes=-0", 10));
        assert_eq!(Some(Plan::Unsatisfiable), parse_range("bytes=0-", 0));
        assert_eq!(None, parse_range("bytes=3-2", 10));
        assert_eq!(None, parse_range("bytes=0-1,4-5", 10));
        assert_eq!(None, parse_range("items=0-1", 10));
        assert_eq!(None, parse_range("bytes=x-1", 10));
    }

    #[test]
    fn conditional_planning() {
        let modified = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let v = Validators::new(10, Some(modified + Duration::from_millis(300)));
        assert_eq!(Some(modified), v.modified);
        let date = httpdate::fmt_http_date(modified);

        let plan = |c: Conditions| plan_response(&v, &c, 10);
        assert_eq!(Plan::Full, plan(Conditions::default()));
        assert_eq!(
            Plan::NotModified,
            plan(Conditions {
                if_none_match: Some(format!("\"nope\", {}", v.etag)),
                ..Default::default()
            })
        );
        // If-None-Match takes precedence over If-Modified-Since
        assert_eq!(
            Plan::Full,
            plan(Conditions {
                if_none_match: Some("\"nope\"".to_string()),
                if_modified_since: Some(date.clone()),
                ..Default::default()
            })
        );
        assert_eq!(
            Plan::Partial(1, 9),
            plan(Conditions {
                range: Some("bytes=1-".to_string()),
                if_range: Some(date),
                ..Default::default()
            })
        );
        assert_eq!(
            Plan::Full,
            plan(Conditions {
                range: Some("bytes=1-".to_string()),
                if_range: Some(httpdate::fmt_http_date(modified + Duration::from_secs(1))),
                ..Default::default()
            })
        );
    }
}

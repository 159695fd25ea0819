//! The end-to-end run: capture, replay, download, patch, rebuild, redirect
//! and serve.
//!
//! Stages run one after another on the calling thread. The host table
//! redirect is undone on every way out of [`Pipeline::run`], including
//! errors, cancellation and unwinding panics.
use crate::{
    capture::{capture, CancelToken, CaptureOutcome, CapturedRequest},
    config::ProtocolConfig,
    descriptor::UpdateDescriptor,
    hosts::NetworkRedirector,
    patcher::{find_hash_sites, select_site, write_hash, HashSite, SiteSelection},
    replay::ReplayClient,
    server::{LocalOtaServer, ProgressFn, ServerConfig},
    Error, Result,
};
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Decisions only a person can make.
pub trait Operator {
    /// Asks for the replacement password. `None` abandons the run.
    fn request_secret(&self, prompt: &str) -> Option<String>;

    fn confirm(&self, question: &str) -> bool;

    /// Picks which of several hash sites to patch.
    fn choose_site(&self, _sites: &[HashSite]) -> SiteSelection {
        SiteSelection::First
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The image was served until the run was cancelled.
    Completed,
    /// The operator declined to supply a password.
    Abandoned,
}

/// Per-run values.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Address of the interface to capture on; unspecified picks one.
    pub interface_address: IpAddr,
    /// Address the device reaches this machine on.
    pub local_address: IpAddr,
    pub port: u16,
    pub image_path: PathBuf,
}

impl PipelineOptions {
    /// `host[:port]` used in the rewritten download URLs.
    pub fn local_authority(&self) -> String {
        match (self.local_address, self.port) {
            (IpAddr::V4(ip), 80) => ip.to_string(),
            (IpAddr::V6(ip), 80) => format!("[{ip}]"),
            (ip, port) => SocketAddr::new(ip, port).to_string(),
        }
    }
}

/// Restores the host table when dropped.
struct RedirectGuard<'a>(&'a NetworkRedirector);

impl Drop for RedirectGuard<'_> {
    fn drop(&mut self) {
        match self.0.disable() {
            Ok(true) => info!("Host table redirect removed"),
            Ok(false) => {}
            Err(e) => error!("failed to restore host table: {e}"),
        }
    }
}

/// Logs every tenth of `total` once.
struct DecileLogger {
    what: &'static str,
    last: AtomicU64,
}

impl DecileLogger {
    fn new(what: &'static str) -> Self {
        Self {
            what,
            last: AtomicU64::new(0),
        }
    }

    fn update(&self, done: u64, total: u64) {
        if total == 0 {
            return;
        }
        let decile = done.min(total) * 10 / total;
        if self.last.fetch_max(decile, Ordering::Relaxed) < decile {
            info!("{}: {}% ({done}/{total} bytes)", self.what, decile * 10);
        }
    }
}

pub struct Pipeline<'a> {
    config: ProtocolConfig,
    options: PipelineOptions,
    operator: &'a dyn Operator,
    cancel: CancelToken,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: ProtocolConfig,
        options: PipelineOptions,
        operator: &'a dyn Operator,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            options,
            operator,
            cancel,
        }
    }

    pub fn run(&self) -> Result<PipelineOutcome> {
        // Also clears a redirect left behind by an earlier run that was killed
        let redirector = NetworkRedirector::new(&self.config);
        let _guard = RedirectGuard(&redirector);

        let request = self.capture_request()?;
        let descriptor = self.fetch_update(&request)?;
        self.download_image(&descriptor)?;
        if self.patch_image()?.is_none() {
            return Ok(PipelineOutcome::Abandoned);
        }
        let descriptor = self.rebuild_descriptor(descriptor)?;
        self.serve(&redirector, descriptor)?;
        Ok(PipelineOutcome::Completed)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    fn capture_request(&self) -> Result<CapturedRequest> {
        if self.cancel.is_cancelled() {
            return Err(Error::CaptureAborted);
        }
        match capture(&self.config, self.options.interface_address, &self.cancel)? {
            CaptureOutcome::Found(request) => Ok(request),
            CaptureOutcome::Cancelled => Err(Error::CaptureAborted),
        }
    }

    fn fetch_update(&self, request: &CapturedRequest) -> Result<UpdateDescriptor> {
        self.check_cancelled()?;
        ReplayClient::new(self.config.clone()).fetch_descriptor(&request.path, &request.body)
    }

    /// Downloads the descriptor's image, unless the operator keeps an
    /// existing file. Returns whether a download happened.
    fn download_image(&self, descriptor: &UpdateDescriptor) -> Result<bool> {
        self.check_cancelled()?;
        let url = descriptor.delta_url()?;
        let dest = &self.options.image_path;
        let question = format!(
            "{} already exists. Download again and overwrite it?",
            dest.display()
        );
        if dest.exists() && !self.operator.confirm(&question) {
            info!("Keeping existing image {dest:?}");
            return Ok(false);
        }

        let logger = DecileLogger::new("Download");
        let client = ReplayClient::new(self.config.clone());
        client.download_firmware(url, dest, &self.cancel, |done, total| {
            if let Some(total) = total {
                logger.update(done, total);
            }
        })?;
        Ok(true)
    }

    /// Asks until a password with something besides whitespace is given.
    /// Surrounding whitespace is dropped.
    fn ask_secret(&self) -> Option<String> {
        loop {
            let secret = self.operator.request_secret("New ADB password")?;
            let secret = secret.trim();
            if !secret.is_empty() {
                return Some(secret.to_string());
            }
            warn!("password must not be empty");
        }
    }

    /// Writes the operator's password hash into the image. `None` if the
    /// operator gave up.
    fn patch_image(&self) -> Result<Option<HashSite>> {
        self.check_cancelled()?;
        let path = &self.options.image_path;
        let sites = find_hash_sites(path)?;
        let site = select_site(path, &sites, self.operator.choose_site(&sites))?;
        info!(kind = %site.kind, offset = site.offset, "password hash site selected");

        let Some(secret) = self.ask_secret() else {
            warn!("no password given; image left unpatched");
            return Ok(None);
        };
        write_hash(path, &site, &secret)?;
        Ok(Some(site))
    }

    fn rebuild_descriptor(&self, mut descriptor: UpdateDescriptor) -> Result<UpdateDescriptor> {
        self.check_cancelled()?;
        descriptor.rebuild(
            &self.options.image_path,
            &self.options.local_authority(),
            &self.config,
        )?;
        Ok(descriptor)
    }

    /// Redirects the vendor domain here and serves until cancelled.
    ///
    /// The caller owns undoing the redirect.
    fn serve(&self, redirector: &NetworkRedirector, descriptor: UpdateDescriptor) -> Result<()> {
        self.check_cancelled()?;
        redirector.enable(&self.options.local_address.to_string())?;

        let logger = Arc::new(DecileLogger::new("Device download"));
        let progress: ProgressFn = Arc::new(move |sent, total| logger.update(sent, total));
        let mut server = LocalOtaServer::new(ServerConfig::new(
            &self.config,
            self.options.port,
            self.options.image_path.clone(),
            Some(descriptor),
        ))
        .with_progress(progress);

        server.start_with_retry(|_| {
            self.operator
                .confirm("Free the port, then retry starting the server?")
        })?;
        info!("Ready. Trigger an update check on the device; press Ctrl-C when done.");
        let waited = server.wait(&self.cancel);
        server.stop()?;
        waited
    }
}

#[macro_use]
extern crate tracing;

use crate::{error::Error, prompt::TerminalOperator};
use clap::{Args, Parser, Subcommand, ValueHint};
use libpaper::{
    CancelToken, CaptureOutcome, CapturedRequest, LocalOtaServer, NetworkRedirector, Operator,
    Pipeline, PipelineOptions, PipelineOutcome, ProgressFn, ProtocolConfig, ReplayClient,
    ServerConfig, SiteSelection, UpdateDescriptor,
};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod error;
mod prompt;

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Args)]
struct RunOpts {
    /// Address of the interface the pen's traffic passes through, eg: the
    /// hotspot adapter. `0.0.0.0` picks the first active interface.
    #[clap(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    interface: IpAddr,

    /// Address the pen reaches this machine on (eg: `192.168.137.1`)
    #[clap(short, long)]
    local_address: IpAddr,

    /// Port to serve the update on
    #[clap(short, long, default_value_t = 80)]
    port: u16,

    /// Where to download and patch the firmware image
    #[clap(long, default_value = "image.img", value_hint = ValueHint::FilePath)]
    image: PathBuf,
}

#[derive(Debug, Args)]
struct CaptureOpts {
    /// Address of the interface to capture on; `0.0.0.0` picks one.
    #[clap(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    interface: IpAddr,

    /// Save the captured request as JSON, for use with `fetch`
    #[clap(short, long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct FetchOpts {
    /// Captured request saved by `capture --output`
    #[clap(value_hint = ValueHint::FilePath)]
    request: PathBuf,

    /// Where to save the vendor's update descriptor
    #[clap(short, long, default_value = "descriptor.json", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Also download the firmware image to this path
    #[clap(short, long, value_hint = ValueHint::FilePath)]
    download: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct PatchOpts {
    /// Firmware image to patch in place
    #[clap(value_hint = ValueHint::FilePath)]
    image: PathBuf,

    /// Index of the hash site to patch, as listed by `find-sites`.
    ///
    /// If omitted and more than one site is found, you will be asked.
    #[clap(short, long)]
    site: Option<usize>,

    /// New ADB password. If omitted, you will be prompted for it.
    #[clap(long)]
    password: Option<String>,
}

#[derive(Debug, Args)]
struct RebuildOpts {
    /// Update descriptor saved by `fetch`; rewritten in place
    #[clap(value_hint = ValueHint::FilePath)]
    descriptor: PathBuf,

    /// Patched firmware image
    #[clap(long, default_value = "image.img", value_hint = ValueHint::FilePath)]
    image: PathBuf,

    /// `host[:port]` the pen should download the image from
    #[clap(short, long)]
    local_address: String,
}

#[derive(Debug, Subcommand)]
enum RedirectOpt {
    /// Point the vendor domain at this address
    Enable { address: IpAddr },
    /// Restore the host table from its backup
    Disable,
    /// Show whether a redirect is active
    Status,
}

#[derive(Debug, Args)]
struct ServeOpts {
    /// Patched firmware image
    #[clap(long, default_value = "image.img", value_hint = ValueHint::FilePath)]
    image: PathBuf,

    /// Rebuilt update descriptor. Without one, update checks get HTTP 500.
    #[clap(short, long, value_hint = ValueHint::FilePath)]
    descriptor: Option<PathBuf>,

    #[clap(short, long, default_value_t = 80)]
    port: u16,

    #[clap(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,
}

#[derive(Debug, Args)]
struct FreePortOpts {
    #[clap(short, long, default_value_t = 80)]
    port: u16,
}

#[derive(Debug, Subcommand)]
enum Opt {
    /// Run every step: capture, fetch, patch, redirect and serve
    Run(RunOpts),
    /// Wait for the pen's update check
    Capture(CaptureOpts),
    /// Replay a captured update check against the vendor
    Fetch(FetchOpts),
    /// List password hash signatures in a firmware image
    FindSites {
        #[clap(value_hint = ValueHint::FilePath)]
        image: PathBuf,
    },
    /// Replace the ADB password hash in a firmware image
    Patch(PatchOpts),
    /// Recompute descriptor checksums for a patched image
    Rebuild(RebuildOpts),
    /// Manage the host table redirect
    #[clap(subcommand)]
    Redirect(RedirectOpt),
    /// Serve a patched image and descriptor
    Serve(ServeOpts),
    /// Terminate whatever is listening on a port (asks first, unless `--yes`)
    FreePort(FreePortOpts),
}

/// Reset a dictionary pen's ADB password through its OTA update.
///
/// Log verbosity can be set with `RUST_LOG`, eg: `RUST_LOG=libpaper=trace`.
#[derive(Debug, Parser)]
#[clap(verbatim_doc_comment)]
struct CliParser {
    /// Protocol settings (TOML); defaults match the vendor service
    #[clap(short, long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Log at debug level by default
    #[clap(long, global = true)]
    debug: bool,

    /// Answer yes to every confirmation
    #[clap(short = 'y', long, global = true)]
    yes: bool,

    #[clap(subcommand)]
    opt: Opt,
}

/// Cancel token set by Ctrl-C or SIGTERM.
///
/// The first interrupt lets the current step finish, which can mean waiting
/// on a prompt or a network read. A second one exits at once, first undoing
/// the host table redirect if `redirector` is given.
fn interrupt_token(redirector: Option<NetworkRedirector>) -> Result<CancelToken> {
    let cancel = CancelToken::new();
    let handler = cancel.clone();
    ctrlc::set_handler(move || {
        if !handler.is_cancelled() {
            info!("Interrupted, shutting down after the current step (interrupt again to quit now)...");
            handler.cancel();
            return;
        }
        warn!("Interrupted again, quitting");
        if let Some(redirector) = &redirector {
            if let Err(e) = redirector.disable() {
                error!("failed to restore host table: {e}");
            }
        }
        std::process::exit(130);
    })?;
    Ok(cancel)
}

fn progress_logger(what: &'static str) -> impl FnMut(u64, Option<u64>) {
    let mut last = 0;
    move |done, total| {
        if let Some(total) = total.filter(|&t| t > 0) {
            let percent = done * 100 / total;
            if percent >= last + 10 || done == total {
                last = percent;
                info!("{what}: {percent}% ({done}/{total} bytes)");
            }
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut f = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut f, value)?;
    f.flush()?;
    Ok(())
}

fn run(config: ProtocolConfig, o: RunOpts, operator: &TerminalOperator) -> Result<()> {
    let options = PipelineOptions {
        interface_address: o.interface,
        local_address: o.local_address,
        port: o.port,
        image_path: o.image,
    };
    let cancel = interrupt_token(Some(NetworkRedirector::new(&config)))?;
    let pipeline = Pipeline::new(config, options, operator, cancel);
    match pipeline.run()? {
        PipelineOutcome::Completed => info!("Done."),
        PipelineOutcome::Abandoned => return Err(Error::Aborted("no password given")),
    }
    Ok(())
}

fn capture(config: ProtocolConfig, o: CaptureOpts) -> Result<()> {
    let request = match libpaper::capture(&config, o.interface, &interrupt_token(None)?)? {
        CaptureOutcome::Found(request) => request,
        CaptureOutcome::Cancelled => return Err(libpaper::Error::CaptureAborted.into()),
    };
    info!("Path: {}", request.path);
    info!("Body: {}", serde_json::Value::Object(request.body.clone()));
    if let Some(output) = o.output {
        write_json(&output, &request)?;
        info!("Saved request to {output:?}");
    }
    Ok(())
}

fn fetch(config: ProtocolConfig, o: FetchOpts, operator: &TerminalOperator) -> Result<()> {
    let request: CapturedRequest = read_json(&o.request)?;
    let client = ReplayClient::new(config);
    let descriptor = client.fetch_descriptor(&request.path, &request.body)?;
    write_json(&o.output, &descriptor)?;
    info!("Saved update descriptor to {:?}", o.output);

    let Some(dest) = o.download else {
        return Ok(());
    };
    if dest.exists()
        && !operator.confirm(&format!("{} already exists. Overwrite it?", dest.display()))
    {
        info!("Keeping existing image {dest:?}");
        return Ok(());
    }
    let cancel = interrupt_token(None)?;
    client.download_firmware(
        descriptor.delta_url()?,
        &dest,
        &cancel,
        progress_logger("Download"),
    )?;
    Ok(())
}

fn find_sites(image: &Path) -> Result<()> {
    let sites = libpaper::find_hash_sites(image)?;
    if sites.is_empty() {
        warn!("No password hash signatures found");
    }
    let mut f = File::open(image)?;
    for (i, site) in sites.iter().enumerate() {
        let mut current = vec![0; site.length];
        f.seek(SeekFrom::Start(site.offset))?;
        f.read_exact(&mut current)?;
        info!(
            "[{i}] {} at {:#x}: {}",
            site.kind,
            site.offset,
            String::from_utf8_lossy(&current)
        );
    }
    Ok(())
}

fn patch(o: PatchOpts, operator: &TerminalOperator) -> Result<()> {
    let sites = libpaper::find_hash_sites(&o.image)?;
    let selection = match o.site {
        Some(i) => SiteSelection::Index(i),
        None => operator.choose_site(&sites),
    };
    let site = libpaper::select_site(&o.image, &sites, selection)?;

    let secret = match o.password {
        Some(p) => prompt::secret(&p).ok_or(Error::Aborted("password must not be empty"))?,
        None => loop {
            match operator.request_secret("New ADB password") {
                Some(p) => match prompt::secret(&p) {
                    Some(p) => break p,
                    None => warn!("password must not be empty"),
                },
                None => return Err(Error::Aborted("no password given")),
            }
        },
    };
    let hash = libpaper::write_hash(&o.image, &site, &secret)?;
    info!("Patched {} hash at {:#x}: {hash}", site.kind, site.offset);
    Ok(())
}

fn rebuild(config: ProtocolConfig, o: RebuildOpts) -> Result<()> {
    let mut descriptor: UpdateDescriptor = read_json(&o.descriptor)?;
    descriptor.rebuild(&o.image, &o.local_address, &config)?;
    write_json(&o.descriptor, &descriptor)?;
    info!("Rewrote {:?}", o.descriptor);
    Ok(())
}

fn redirect(config: ProtocolConfig, o: RedirectOpt) -> Result<()> {
    let redirector = NetworkRedirector::new(&config);
    match o {
        RedirectOpt::Enable { address } => {
            redirector.enable(&address.to_string())?;
        }
        RedirectOpt::Disable => {
            if !redirector.disable()? {
                info!("No redirect was active");
            }
        }
        RedirectOpt::Status => {
            let state = if redirector.is_active() {
                "active"
            } else {
                "inactive"
            };
            info!("Redirect of {} is {state}", config.vendor_domain);
        }
    }
    Ok(())
}

fn serve(config: ProtocolConfig, o: ServeOpts, operator: &TerminalOperator) -> Result<()> {
    let descriptor = o
        .descriptor
        .as_deref()
        .map(read_json::<UpdateDescriptor>)
        .transpose()?;
    let server_config = ServerConfig {
        bind_address: o.bind,
        ..ServerConfig::new(&config, o.port, o.image, descriptor)
    };
    let progress: ProgressFn = Arc::new(|sent, total| {
        debug!("sent {sent}/{total} bytes");
        if sent == total {
            info!("Image fully sent");
        }
    });
    let mut server = LocalOtaServer::new(server_config).with_progress(progress);
    let cancel = interrupt_token(None)?;

    server.start_with_retry(|_| operator.confirm("Retry starting the server?"))?;
    info!("Press Ctrl-C to stop.");
    let waited = server.wait(&cancel);
    server.stop()?;
    Ok(waited?)
}

fn free_port(o: FreePortOpts, operator: &TerminalOperator) -> Result<()> {
    let pids = libpaper::listening_pids(o.port)?;
    if pids.is_empty() {
        info!("Nothing is listening on port {}", o.port);
        return Ok(());
    }
    info!("Port {} is held by PID(s) {pids:?}", o.port);
    if !operator.confirm("Force-terminate these processes?") {
        return Err(Error::Aborted("port left in use"));
    }
    let killed = libpaper::kill_port_owners(o.port)?;
    info!("Terminated {} process(es)", killed.len());
    Ok(())
}

fn main() -> Result<()> {
    let opts = CliParser::parse();
    let default_level = if opts.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .compact()
        .init();

    let config = match &opts.config {
        Some(path) => {
            info!("Loading settings from {path:?}...");
            ProtocolConfig::load(path)?
        }
        None => ProtocolConfig::default(),
    };
    let operator = TerminalOperator {
        assume_yes: opts.yes,
    };

    match opts.opt {
        Opt::Run(o) => run(config, o, &operator)?,
        Opt::Capture(o) => capture(config, o)?,
        Opt::Fetch(o) => fetch(config, o, &operator)?,
        Opt::FindSites { image } => find_sites(&image)?,
        Opt::Patch(o) => patch(o, &operator)?,
        Opt::Rebuild(o) => rebuild(config, o)?,
        Opt::Redirect(o) => redirect(config, o)?,
        Opt::Serve(o) => serve(config, o, &operator)?,
        Opt::FreePort(o) => free_port(o, &operator)?,
    }

    Ok(())
}

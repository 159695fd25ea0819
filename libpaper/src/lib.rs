//! Intercept, patch and locally serve a dictionary pen's OTA firmware update.
//!
//! ## Flow
//!
//! 1. [capture]: watch the network for the pen's update check
//!    (`POST /product/…/ota/checkVersion` with a JSON body).
//! 2. [ReplayClient::fetch_descriptor]: replay it against the vendor,
//!    claiming version `99.99.90` so a full image is offered.
//! 3. [ReplayClient::download_firmware]: fetch the image.
//! 4. [replace_hash]: overwrite the embedded root password hash.
//! 5. [UpdateDescriptor::rebuild]: recompute every digest and point the
//!    download URLs at this machine.
//! 6. [NetworkRedirector::enable]: map the vendor domain to this machine in
//!    the host table.
//! 7. [LocalOtaServer]: answer the next update check with the rebuilt
//!    descriptor and serve the patched image.
//!
//! [Pipeline] runs all of these in order and undoes the redirect on the way
//! out.
//!
//! ## Password hash signatures
//!
//! The image's root filesystem carries the ADB password as the output of
//! `sha256sum` or `md5sum`, in one of two forms:
//!
//! * `#` + 64 hex digits + `  -`: SHA-256 of the password
//! * `= "` + 32 hex digits + `  -"`: MD5 of the password plus a newline
//!
//! Both are found by scanning raw bytes and rewritten in place, so the image
//! length never changes.
#[macro_use]
extern crate tracing;

mod capture;
mod checksum;
mod config;
mod descriptor;
mod error;
mod frame;
mod hosts;
mod patcher;
mod pipeline;
mod port;
mod replay;
mod server;

pub use crate::{
    capture::{
        capture, extract_json_object, CancelToken, CaptureOutcome, CapturedRequest,
        RequestFilter,
    },
    checksum::{range_md5, whole_file_md5, whole_file_sha1},
    config::ProtocolConfig,
    descriptor::{Segment, SegmentTable, UpdateDescriptor},
    error::Error,
    frame::tcp_payload,
    hosts::NetworkRedirector,
    patcher::{
        find_hash_sites, replace_hash, scan, select_site, write_hash, HashKind, HashSite,
        SiteSelection,
    },
    pipeline::{Operator, Pipeline, PipelineOptions, PipelineOutcome},
    port::{kill_port_owners, listening_pids, probe_port},
    replay::ReplayClient,
    server::{LocalOtaServer, ProgressFn, ServerConfig, ServerState},
};
pub type Result<T> = std::result::Result<T, Error>;

use std::io::Error as IoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] IoError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("cannot install interrupt handler: {0}")]
    CtrlCError(#[from] ctrlc::Error),

    #[error(transparent)]
    LibPaperError(#[from] libpaper::Error),

    #[error("aborted: {0}")]
    Aborted(&'static str),
}

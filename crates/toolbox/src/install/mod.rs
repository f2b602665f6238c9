//! Archive download and installation with pollable progress.

mod archive;
mod pipeline;
mod progress;

pub use archive::{ArchiveFormat, extract_blocking};
pub use pipeline::{
    DEFAULT_CHUNK_SIZE, InstallHandle, InstallOutcome, InstallRequest, Installer,
    InstallerOptions,
};
pub use progress::{DEFAULT_POLL_INTERVAL, Phase, ProgressEvent, ProgressSnapshot, ProgressStore};

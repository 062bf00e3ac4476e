//! Core entities of the tracker: the on-disk `Run`, its file-backed
//! attribute store, and the filesystem/process primitives everything
//! else is built on. All run state is recoverable by re-reading the
//! filesystem; nothing here keeps an authoritative in-memory registry.

mod attr;
mod context;
mod fsutil;
mod pid;
mod run;

pub use attr::{AttrError, AttrStore, AttrValue};
pub use context::TrackerContext;
pub use fsutil::{
    atomic_write_bytes, ensure_dir, sha256_bytes, sha256_file, timestamp, try_read_to_string,
};
pub use pid::pid_alive;
pub use run::{
    mkid, Run, RunStatus, LOCK_FILE, OUTPUT_FILE, PENDING_FILE, REMOTE_LOCK_FILE, SOURCECODE_DIR,
    TRACKER_DIR,
};

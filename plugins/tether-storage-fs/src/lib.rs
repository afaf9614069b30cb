//! Filesystem Storage Backend for Tether
//!
//! Implements `SessionStore` and `RunStore` on the local filesystem.
//! Everything lives under one data directory:
//!
//! ```text
//! <data_dir>/
//! ├── runs.jsonl                # RunRecord per line
//! └── sessions/
//!     ├── <session-id>.jsonl    # Session log, one message per line
//!     └── ...
//! ```

mod run_store;
mod session_store;

pub use run_store::FsRunStore;
pub use session_store::FsSessionStore;

//! Pseudo-terminal sessions
//!
//! Provides pseudo-terminal creation and lifecycle management
//! using portable-pty, with bounded history for late-joining viewers.

mod config;
mod manager;
mod session;

pub use config::{PtyManagerConfig, PtyOptions};
pub use manager::PtyManager;
pub use session::{DataListener, PtyExit, PtyInfo, PtySession, PtyState, Subscription};

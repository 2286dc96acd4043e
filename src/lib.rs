//! Scripted orchestration of interactive programs.
//!
//! `porch` spawns a program under a fresh pseudo-terminal and stalls it
//! in a pre-exec state over a private control socket, so the embedding
//! can adjust terminal attributes, environment, working directory,
//! signal state and credentials before the target ever runs. After
//! release, the [`Process`] handle drives the session: callback-based
//! reads with coarse minimum-duration timeouts, writes to the pty,
//! signal delivery, and a close path that always reaps the child.
//!
//! The crate is the orchestration core only. Pattern matching on the
//! output, script parsing and the command line around it all live in
//! the embedding.

pub mod errors;
pub mod ipc;
pub mod process;
pub mod sandbox;
pub mod signals;
mod spawn;
pub mod status;
pub mod term;

pub use errors::{Error, Result};
pub use ipc::{IpcChannel, IpcMessage, MessageTag};
pub use process::{EnvSpec, Process, WaitPolicy};
pub use status::{ProcessStatus, StatusKind};
pub use term::{CcValue, TermUpdate, Terminal};

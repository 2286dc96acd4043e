//! Error kinds surfaced by the orchestration core.
//!
//! Everything that can go wrong comes back as a status value; nothing in
//! this crate aborts the process. OS failures keep their [`Errno`] so the
//! embedding can inspect them.

use nix::errno::Errno;
use snafu::Snafu;

use crate::ipc::MessageTag;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
  /// The wire header was malformed: a declared size smaller than the
  /// header itself, a tag outside the closed set, or a truncated
  /// acknowledgment payload. Fatal to the channel.
  #[snafu(display("malformed frame on control socket"))]
  Framing,

  /// The peer hung up in the middle of an exchange that expected a
  /// reply.
  #[snafu(display("control socket closed by peer"))]
  PeerClosed,

  /// An acknowledgment slot received a message of the wrong tag.
  #[snafu(display("unexpected message type '{tag}'"))]
  UnexpectedMessage { tag: MessageTag },

  #[snafu(display("process already released"))]
  AlreadyReleased,

  #[snafu(display("process not yet released"))]
  NotReleased,

  #[snafu(display("process has already terminated"))]
  AlreadyTerminated,

  #[snafu(display("pty already closed"))]
  PtyClosed,

  /// The child was reaped with a terminating signal that the controller
  /// did not deliver itself.
  #[snafu(display("spawned process killed with signal '{signal}'"))]
  KilledBySignal { signal: i32 },

  /// Even SIGKILL did not produce a reapable child.
  #[snafu(display("could not kill spawned process"))]
  Unkillable,

  #[snafu(display("no command specified to spawn"))]
  EmptyArgv,

  #[snafu(display("unknown cc '{name}'"))]
  UnknownControlChar { name: String },

  #[snafu(display("expected number for cc '{name}'"))]
  LiteralControlChar { name: &'static str },

  #[snafu(display("malformed value for cc '{name}': {value}"))]
  MalformedControlChar { name: &'static str, value: String },

  #[snafu(display("cntrl char for cc '{name}' out of bounds: {value}"))]
  ControlCharRange { name: &'static str, value: String },

  #[snafu(display("script root already installed"))]
  SandboxInstalled,

  #[snafu(display("no script root installed"))]
  NoSandbox,

  #[snafu(display("{source}"), context(false))]
  Os { source: Errno },
}

impl Error {
  /// The errno behind this error, when there is one.
  pub fn errno(&self) -> Option<Errno> {
    match self {
      Self::Os { source } => Some(*source),
      _ => None,
    }
  }
}

//! Decomposition of raw wait statuses.

use nix::libc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
  Exited,
  Signaled,
  Stopped,
}

/// One child's exit circumstances: the decomposed kind and code plus the
/// raw status word they came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStatus {
  kind: StatusKind,
  code: i32,
  raw: i32,
}

impl ProcessStatus {
  pub fn from_raw(raw: i32) -> Self {
    let (kind, code) = if libc::WIFEXITED(raw) {
      (StatusKind::Exited, libc::WEXITSTATUS(raw))
    } else if libc::WIFSIGNALED(raw) {
      (StatusKind::Signaled, libc::WTERMSIG(raw))
    } else if libc::WIFSTOPPED(raw) {
      (StatusKind::Stopped, libc::WSTOPSIG(raw))
    } else {
      (StatusKind::Exited, 0)
    };
    Self { kind, code, raw }
  }

  /// Wrap an exit code reported by something other than `waitpid`.
  pub fn exited(code: i32) -> Self {
    Self {
      kind: StatusKind::Exited,
      code,
      raw: (code & 0xff) << 8,
    }
  }

  pub fn kind(&self) -> StatusKind {
    self.kind
  }

  pub fn code(&self) -> i32 {
    self.code
  }

  pub fn raw(&self) -> i32 {
    self.raw
  }
}

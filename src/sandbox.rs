//! Script-root sandbox.
//!
//! The embedding installs the directory its script came from once; every
//! later script open resolves strictly relative to that handle. The
//! descriptor lives for the rest of the process.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::OnceLock;

use nix::errno::Errno;
use nix::libc;

use crate::errors::{Error, Result};

static SCRIPT_ROOT: OnceLock<OwnedFd> = OnceLock::new();

cfg_if::cfg_if! {
  if #[cfg(any(target_os = "linux", target_os = "android"))] {
    const ROOT_FLAGS: libc::c_int = libc::O_DIRECTORY | libc::O_PATH | libc::O_CLOEXEC;
  } else {
    const ROOT_FLAGS: libc::c_int = libc::O_DIRECTORY | libc::O_CLOEXEC;
  }
}

fn cpath(path: &Path) -> Result<CString> {
  CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL.into())
}

/// Install the script root. First caller wins; a second install is an
/// error, and nothing ever tears the handle down.
pub fn install<P: AsRef<Path>>(root: P) -> Result<()> {
  let path = cpath(root.as_ref())?;
  let fd = Errno::result(unsafe { libc::open(path.as_ptr(), ROOT_FLAGS) })?;
  let fd = unsafe { OwnedFd::from_raw_fd(fd) };
  SCRIPT_ROOT.set(fd).map_err(|_| Error::SandboxInstalled)
}

pub fn installed() -> bool {
  SCRIPT_ROOT.get().is_some()
}

/// Open a script file relative to the installed root. Absolute names
/// would escape the sandbox and are refused.
pub fn open_script<P: AsRef<Path>>(name: P) -> Result<File> {
  let name = name.as_ref();
  let root = SCRIPT_ROOT.get().ok_or(Error::NoSandbox)?;
  if name.is_absolute() {
    return Err(Errno::EINVAL.into());
  }
  let path = cpath(name)?;
  let fd = Errno::result(unsafe {
    libc::openat(
      root.as_raw_fd(),
      path.as_ptr(),
      libc::O_RDONLY | libc::O_CLOEXEC,
    )
  })?;
  Ok(unsafe { File::from_raw_fd(fd) })
}

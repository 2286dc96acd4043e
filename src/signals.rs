//! Signal set plumbing: conversions between the platform `sigset_t` and
//! the compact 32-bit mask the control protocol uses, plus queries over
//! the current dispositions.
//!
//! Bit *k* of a mask stands for signal *k + 1*. Conversions stop at the
//! first signal number the platform set cannot represent.

use std::mem::MaybeUninit;
use std::sync::LazyLock;

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::Signal;

use crate::errors::Result;

pub(crate) fn empty_sigset() -> libc::sigset_t {
  unsafe {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    libc::sigemptyset(set.as_mut_ptr());
    set.assume_init()
  }
}

pub(crate) fn sigset_has(set: &libc::sigset_t, signo: i32) -> Result<bool, Errno> {
  match unsafe { libc::sigismember(set, signo) } {
    -1 => Err(Errno::last()),
    0 => Ok(false),
    _ => Ok(true),
  }
}

/// Compact the platform set into a mask. Signals the set API cannot
/// express terminate the walk early.
pub fn sigset_to_mask(set: &libc::sigset_t) -> u32 {
  let mut mask = 0;
  for bit in 0..u32::BITS {
    let signo = bit as i32 + 1;
    match sigset_has(set, signo) {
      Ok(true) => mask |= 1 << bit,
      Ok(false) => {}
      Err(_) => break,
    }
  }
  mask
}

/// Expand a mask into a fresh platform set. A bit the platform cannot
/// represent is invalid input.
pub fn mask_to_sigset(mask: u32) -> Result<libc::sigset_t> {
  let mut set = empty_sigset();
  for bit in 0..u32::BITS {
    if mask & (1 << bit) == 0 {
      continue;
    }
    let signo = bit as i32 + 1;
    if unsafe { libc::sigaddset(&mut set, signo) } == -1 {
      return Err(Errno::EINVAL.into());
    }
  }
  Ok(set)
}

const fn uncatchable(signo: i32) -> bool {
  signo == libc::SIGKILL || signo == libc::SIGSTOP
}

/// Snapshot of every signal whose current disposition is not ignore.
/// `SIGKILL` and `SIGSTOP` are never included; signals the disposition
/// query rejects are counted as caught, since any later attempt to
/// change them will fail where the user can see it.
pub fn fetch_sigcaught() -> Result<libc::sigset_t> {
  let mut caught = empty_sigset();
  for signo in 1..sigmax() {
    if uncatchable(signo) {
      continue;
    }
    if sigset_has(&caught, signo).is_err() {
      // Hit the end of valid signals.
      break;
    }

    let mut act = MaybeUninit::<libc::sigaction>::uninit();
    let queried = unsafe { libc::sigaction(signo, std::ptr::null(), act.as_mut_ptr()) } == 0;
    if queried {
      let act = unsafe { act.assume_init() };
      if act.sa_sigaction == libc::SIG_IGN {
        continue;
      }
    }

    unsafe { libc::sigaddset(&mut caught, signo) };
  }
  Ok(caught)
}

/// Set (or, with `complement`, clear) in `target` exactly those signals
/// present in `apply`.
pub fn mask_apply(complement: bool, target: &mut libc::sigset_t, apply: &libc::sigset_t) {
  for signo in 1..sigmax() {
    match sigset_has(apply, signo) {
      Ok(true) => {}
      _ => continue,
    }
    unsafe {
      if complement {
        libc::sigdelset(target, signo);
      } else {
        libc::sigaddset(target, signo);
      }
    }
  }
}

/// The signal mask currently in effect for the calling process.
pub fn current_sigmask() -> Result<libc::sigset_t> {
  let mut set = MaybeUninit::<libc::sigset_t>::uninit();
  let res = unsafe { libc::sigprocmask(libc::SIG_BLOCK, std::ptr::null(), set.as_mut_ptr()) };
  Errno::result(res)?;
  Ok(unsafe { set.assume_init() })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn probe_sigmax() -> i32 {
  libc::SIGRTMAX() + 1
}

/// `NSIG` undercounts the realtime range here; probe upward until the
/// set API rejects the number.
#[cfg(target_os = "freebsd")]
fn probe_sigmax() -> i32 {
  let set = empty_sigset();
  let mut max = libc::NSIG;
  for signo in libc::NSIG.. {
    if unsafe { libc::sigismember(&set, signo) } == -1 {
      max = signo;
      break;
    }
  }
  max
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn probe_sigmax() -> i32 {
  libc::NSIG
}

/// One past the highest usable signal number.
///
/// `NSIG` is usually that already, but some platforms keep usable
/// realtime signals above it and need a probe.
pub fn sigmax() -> i32 {
  static SIGMAX: LazyLock<i32> = LazyLock::new(probe_sigmax);
  *SIGMAX
}

/// Human-readable signal names indexed by signal number, without the
/// `SIG` prefix. Unknown slots (realtime range, holes) are empty.
pub fn signames() -> &'static [&'static str] {
  static NAMES: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    let mut names = vec![""; sigmax() as usize];
    for sig in Signal::iterator() {
      let signo = sig as i32 as usize;
      if signo < names.len() {
        names[signo] = sig.as_str().strip_prefix("SIG").unwrap_or(sig.as_str());
      }
    }
    names
  });
  &NAMES
}

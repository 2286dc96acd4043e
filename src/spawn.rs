//! Fork/exec supervisor.
//!
//! `spawn` produces a child stalled in a pre-exec service loop: session
//! leader on a fresh pty slave, stdio wired up, waiting on the control
//! socket for the parent to inspect or adjust it before `execvp`. The
//! handshake exists to kill the classic race where the script writes to
//! the pty before the child has had a chance to disable echo or drop
//! privileges.

use std::cell::{Cell, RefCell};
use std::ffi::{CStr, CString};
use std::mem;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::rc::Rc;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::pty::posix_openpt;
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::sys::termios::{SetArg, Termios, tcgetattr, tcsetattr};
use nix::unistd::{self, ForkResult, Gid, Pid, Uid, fork};
use tracing::debug;

use crate::errors::Result;
use crate::ipc::{self, IpcChannel, IpcMessage, MessageTag};
use crate::signals;

/// SIGCATCH payload: which signals, and whether the child should be
/// able to catch them (default disposition) or ignore them.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct SigCatchPayload {
  pub mask: libc::sigset_t,
  pub catch: u8,
}

/// SETID payload. The flag bytes say which of the two ids to change.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct SetIdPayload {
  pub set_uid: u8,
  pub set_gid: u8,
  pub uid: libc::uid_t,
  pub gid: libc::gid_t,
}

/// Spawn `argv` under a fresh pty and stall it pre-exec.
///
/// On return the child has finished its terminal setup and sits in the
/// IPC service loop; `error` latches if it reports a pre-exec failure.
pub(crate) fn spawn(
  argv: &[CString],
  error: Rc<Cell<bool>>,
) -> Result<(Pid, OwnedFd, IpcChannel)> {
  let (parent_sock, child_sock) = socketpair(
    AddressFamily::Unix,
    SockType::Stream,
    None,
    SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
  )?;
  let master = new_pt()?;

  match unsafe { fork() }? {
    ForkResult::Child => {
      drop(parent_sock);
      let ipc = IpcChannel::open(child_sock);
      child_main(ipc, master, argv)
    }
    ForkResult::Parent { child } => {
      drop(child_sock);
      let mut ipc = IpcChannel::open(parent_sock);
      debug!(pid = child.as_raw(), "spawned child, stalling until ready");

      ipc.register(MessageTag::Error, move |_ipc, msg| {
        let payload = msg.payload();
        let text = payload.split(|b| *b == 0).next().unwrap_or_default();
        if !text.is_empty() {
          eprintln!("CHILD ERROR: {}", String::from_utf8_lossy(text));
        }
        error.set(true);
        Ok(())
      });

      // Stalls until the tty is configured; side-steps races from the
      // script writing to the tty before echo is disabled.
      wait_release(&mut ipc)?;
      Ok((child, master, ipc))
    }
  }
}

/// Service IPC until the peer's RELEASE (or EOF) arrives.
pub(crate) fn wait_release(ipc: &mut IpcChannel) -> Result<()> {
  loop {
    if ipc.wait()? {
      return Ok(());
    }
    match ipc.recv()? {
      Some(msg) if msg.tag() == MessageTag::Release => return Ok(()),
      _ => {}
    }
  }
}

fn new_pt() -> Result<OwnedFd> {
  let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)?;
  nix::pty::grantpt(&master)?;
  nix::pty::unlockpt(&master)?;
  Ok(unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn slave_name(master: &OwnedFd) -> Result<CString, Errno> {
  let mut buf = [0 as libc::c_char; 128];
  let res = unsafe { libc::ptsname_r(master.as_raw_fd(), buf.as_mut_ptr(), buf.len()) };
  if res != 0 {
    return Err(Errno::from_raw(res));
  }
  Ok(unsafe { CStr::from_ptr(buf.as_ptr()) }.to_owned())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn slave_name(master: &OwnedFd) -> Result<CString, Errno> {
  // Single-threaded here, and the result is copied out immediately.
  let name = unsafe { libc::ptsname(master.as_raw_fd()) };
  if name.is_null() {
    return Err(Errno::last());
  }
  Ok(unsafe { CStr::from_ptr(name) }.to_owned())
}

/// Report a fatal pre-exec failure to the parent and die. The only exit
/// paths out of the child before `execvp` run through here or `_exit`.
fn child_error(ipc: &mut IpcChannel, msg: &str) -> ! {
  let mut payload = msg.as_bytes().to_vec();
  payload.push(0);
  let _ = ipc.send(&IpcMessage::new(MessageTag::Error, payload));
  let _ = ipc.close();
  unsafe { libc::_exit(1) }
}

fn child_main(mut ipc: IpcChannel, master: OwnedFd, argv: &[CString]) -> ! {
  if let Err(e) = unistd::setsid() {
    child_error(&mut ipc, &format!("setsid: {e}"));
  }

  let termios = child_use_pt(&mut ipc, &master);
  // The child never holds the master side.
  drop(master);

  child_exec(ipc, argv, termios)
}

/// Open the slave by name, make it the controlling terminal of the new
/// session, and wire it over stdio. Returns the slave's initial
/// attributes.
fn child_use_pt(ipc: &mut IpcChannel, master: &OwnedFd) -> Termios {
  let name = match slave_name(master) {
    Ok(name) => name,
    Err(e) => child_error(ipc, &format!("ptsname: {e}")),
  };
  let path = std::ffi::OsStr::from_bytes(name.to_bytes());

  let slave: OwnedFd = match std::fs::OpenOptions::new().read(true).write(true).open(path) {
    Ok(file) => file.into(),
    Err(e) => child_error(ipc, &format!("open {}: {e}", path.display())),
  };

  // tcsetsid() where the platform has it boils down to this ioctl on a
  // fresh session leader.
  if unsafe { libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as _, 0) } == -1 {
    child_error(ipc, &format!("tcsetsid: {}", Errno::last()));
  }

  let termios = match tcgetattr(&slave) {
    Ok(t) => t,
    Err(e) => child_error(ipc, &format!("tcgetattr: {e}")),
  };

  let mut stdin = unsafe { OwnedFd::from_raw_fd(0) };
  let mut stdout = unsafe { OwnedFd::from_raw_fd(1) };
  let mut stderr = unsafe { OwnedFd::from_raw_fd(2) };
  for stdio in [&mut stdin, &mut stdout, &mut stderr] {
    if let Err(e) = unistd::dup2(slave.as_fd(), stdio) {
      child_error(ipc, &format!("dup2: {e}"));
    }
  }
  mem::forget(stdin);
  mem::forget(stdout);
  mem::forget(stderr);
  if slave.as_raw_fd() <= 2 {
    // The slave landed on a stdio slot; leaking it is the point.
    mem::forget(slave);
  }

  termios
}

/// The pre-exec wait state: service control messages until the parent
/// releases us, then become the target program.
fn child_exec(mut ipc: IpcChannel, argv: &[CString], termios: Termios) -> ! {
  // The embedding may have its own SIGINT handling; the child must not
  // inherit it.
  let _ = unsafe { signal(Signal::SIGINT, SigHandler::SigDfl) };

  let state = Rc::new(RefCell::new(termios));
  register_child_handlers(&mut ipc, &state);

  // Tell the parent we are ready for inspection.
  if ipc.send_bare(MessageTag::Release).is_err() {
    unsafe { libc::_exit(1) }
  }

  let released = wait_release(&mut ipc).is_ok();
  let _ = ipc.close();
  if !released {
    unsafe { libc::_exit(1) }
  }

  let _ = unistd::execvp(&argv[0], argv);
  unsafe { libc::_exit(1) }
}

fn register_child_handlers(ipc: &mut IpcChannel, state: &Rc<RefCell<Termios>>) {
  let st = Rc::clone(state);
  ipc.register(MessageTag::TermiosInquiry, move |ipc, _msg| {
    let raw: libc::termios = st.borrow().clone().into();
    ipc.send(&IpcMessage::new(
      MessageTag::TermiosSet,
      ipc::payload_of(&raw).to_vec(),
    ))
  });

  let st = Rc::clone(state);
  ipc.register(MessageTag::TermiosSet, move |ipc, msg| {
    let Some(raw) = ipc::payload_as::<libc::termios>(msg.payload()) else {
      return Err(Errno::EINVAL.into());
    };
    let updated = Termios::from(raw);
    if tcsetattr(std::io::stdin(), SetArg::TCSANOW, &updated).is_err() {
      child_error(ipc, "tcsetattr");
    }
    *st.borrow_mut() = updated;
    ipc.send_bare(MessageTag::TermiosAck)
  });

  ipc.register(MessageTag::EnvSetup, |ipc, msg| {
    let err = apply_env(msg.payload());
    ipc.send(&IpcMessage::with_errno(MessageTag::EnvAck, err))
  });

  ipc.register(MessageTag::Chdir, |ipc, msg| {
    let err = match CStr::from_bytes_until_nul(msg.payload()) {
      Ok(dir) => match unistd::chdir(dir) {
        Ok(()) => 0,
        Err(e) => e as i32,
      },
      Err(_) => libc::EINVAL,
    };
    ipc.send(&IpcMessage::with_errno(MessageTag::ChdirAck, err))
  });

  ipc.register(MessageTag::SetMask, |ipc, msg| {
    let err = match ipc::payload_as::<libc::sigset_t>(msg.payload()) {
      Some(set) => {
        let res =
          unsafe { libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut()) };
        if res == -1 { Errno::last() as i32 } else { 0 }
      }
      None => libc::EINVAL,
    };
    ipc.send(&IpcMessage::with_errno(MessageTag::SetMaskAck, err))
  });

  ipc.register(MessageTag::SigCatch, |ipc, msg| {
    let err = match ipc::payload_as::<SigCatchPayload>(msg.payload()) {
      Some(req) => apply_sigcatch(&req),
      None => libc::EINVAL,
    };
    ipc.send(&IpcMessage::with_errno(MessageTag::SigCatchAck, err))
  });

  ipc.register(MessageTag::SetId, |ipc, msg| {
    let err = match ipc::payload_as::<SetIdPayload>(msg.payload()) {
      Some(req) => apply_setid(&req),
      None => libc::EINVAL,
    };
    ipc.send(&IpcMessage::with_errno(MessageTag::SetIdAck, err))
  });

  ipc.register(MessageTag::SetGroups, |ipc, msg| {
    let err = apply_setgroups(msg.payload());
    ipc.send(&IpcMessage::with_errno(MessageTag::SetGroupsAck, err))
  });
}

fn read_usize(bytes: &[u8]) -> Option<usize> {
  bytes.try_into().ok().map(usize::from_ne_bytes)
}

/// ENV_SETUP application: clear, then the unset list, then the set list.
/// The blobs are NUL-delimited; expansion already happened on the other
/// side of the socket.
fn apply_env(payload: &[u8]) -> i32 {
  const USZ: usize = mem::size_of::<usize>();

  if payload.len() < 1 + 2 * USZ {
    return libc::EINVAL;
  }
  let clear = payload[0] != 0;
  let Some(setsz) = read_usize(&payload[1..1 + USZ]) else {
    return libc::EINVAL;
  };
  let Some(unsetsz) = read_usize(&payload[1 + USZ..1 + 2 * USZ]) else {
    return libc::EINVAL;
  };
  let blobs = &payload[1 + 2 * USZ..];
  if blobs.len() != setsz + unsetsz {
    return libc::EINVAL;
  }
  let (set_blob, unset_blob) = blobs.split_at(setsz);

  // Single-threaded between fork and exec; mutating the environment
  // directly is fine and execvp inherits the result.
  if clear {
    let keys: Vec<_> = std::env::vars_os().map(|(k, _)| k).collect();
    for key in keys {
      unsafe { std::env::remove_var(&key) };
    }
  }

  for name in unset_blob.split(|b| *b == 0).filter(|s| !s.is_empty()) {
    unsafe { std::env::remove_var(std::ffi::OsStr::from_bytes(name)) };
  }

  for entry in set_blob.split(|b| *b == 0).filter(|s| !s.is_empty()) {
    let Some(eq) = entry.iter().position(|b| *b == b'=') else {
      return libc::EINVAL;
    };
    let (name, value) = entry.split_at(eq);
    unsafe {
      std::env::set_var(
        std::ffi::OsStr::from_bytes(name),
        std::ffi::OsStr::from_bytes(&value[1..]),
      );
    }
  }

  0
}

fn apply_sigcatch(req: &SigCatchPayload) -> i32 {
  let disposition = if req.catch != 0 {
    libc::SIG_DFL
  } else {
    libc::SIG_IGN
  };

  let mut err = 0;
  for signo in 1..signals::sigmax() {
    match signals::sigset_has(&req.mask, signo) {
      Ok(true) => {}
      _ => continue,
    }
    if unsafe { libc::signal(signo, disposition) } == libc::SIG_ERR && err == 0 {
      err = Errno::last() as i32;
    }
  }
  err
}

fn apply_setid(req: &SetIdPayload) -> i32 {
  // Group first: once the uid drops we may not be allowed to.
  if req.set_gid != 0
    && let Err(e) = unistd::setgid(Gid::from_raw(req.gid))
  {
    return e as i32;
  }
  if req.set_uid != 0
    && let Err(e) = unistd::setuid(Uid::from_raw(req.uid))
  {
    return e as i32;
  }
  0
}

fn apply_setgroups(payload: &[u8]) -> i32 {
  const GSZ: usize = mem::size_of::<libc::gid_t>();

  if payload.len() % GSZ != 0 {
    return libc::EINVAL;
  }
  let mut groups = Vec::with_capacity(payload.len() / GSZ);
  for chunk in payload.chunks_exact(GSZ) {
    let Ok(raw) = chunk.try_into().map(libc::gid_t::from_ne_bytes) else {
      return libc::EINVAL;
    };
    groups.push(Gid::from_raw(raw));
  }
  match unistd::setgroups(&groups) {
    Ok(()) => 0,
    Err(e) => e as i32,
  }
}

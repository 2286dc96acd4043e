//! Parent-side handle for one spawned child.
//!
//! Everything after `spawn` goes through here: pty I/O with timed,
//! callback-driven reads, the pre-exec round-trips over the control
//! socket, release, signal delivery, and the close-time escalation that
//! guarantees the child is reaped.

use std::cell::{Cell, RefCell};
use std::ffi::{CString, OsStr, OsString};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::sys::termios::{LocalFlags, SetArg, tcgetattr, tcsetattr};
use nix::unistd::{Pid, alarm};
use tracing::{debug, trace, warn};

use crate::errors::{Error, Result};
use crate::ipc::{self, IpcChannel, IpcMessage, MessageTag};
use crate::signals;
use crate::spawn::{self, SetIdPayload, SigCatchPayload};
use crate::status::ProcessStatus;
use crate::term::{TermState, Terminal};

/// Read chunk size for the pty loop.
const READ_CHUNK: usize = 2048;

/// Grace period between asking nicely and SIGKILL at close time.
const CLOSE_GRACE_SECS: u32 = 5;

/// How long `eof` may wait for the child to become reapable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
  /// Check without blocking.
  NoHang,
  /// Block until the child can be reaped.
  Hang,
  /// Block, but give up after this many seconds.
  Alarm(u32),
}

/// Environment changes applied in the child right before `exec`.
///
/// Any `$VAR` expansion is the embedding's business; these land on the
/// wire as two NUL-delimited blobs plus the clear flag.
#[derive(Debug, Default, Clone)]
pub struct EnvSpec {
  /// Start from an empty environment.
  pub clear: bool,
  pub set: Vec<(OsString, OsString)>,
  pub unset: Vec<OsString>,
}

impl EnvSpec {
  fn is_empty(&self) -> bool {
    !self.clear && self.set.is_empty() && self.unset.is_empty()
  }
}

pub struct Process {
  pid: Option<Pid>,
  master: Option<OwnedFd>,
  ipc: Option<IpcChannel>,
  /// Raw wait status once reaped.
  status: Option<i32>,
  eof: bool,
  released: bool,
  draining: bool,
  /// Latched by the ERROR handler registered at spawn.
  error: Rc<Cell<bool>>,
  /// Last signal the controller delivered via [`Process::signal`].
  last_signal: Option<i32>,
  /// Parent-side mirrors of the child's signal state.
  blocked: libc::sigset_t,
  caught: libc::sigset_t,
  pub(crate) term: Option<TermState>,
}

impl std::fmt::Debug for Process {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Process")
      .field("pid", &self.pid)
      .field("released", &self.released)
      .field("eof", &self.eof)
      .finish_non_exhaustive()
  }
}

impl Process {
  /// Spawn `argv` under a fresh pty, stalled pre-exec until
  /// [`release`](Self::release).
  pub fn spawn<S: AsRef<OsStr>>(argv: &[S]) -> Result<Self> {
    if argv.is_empty() {
      return Err(Error::EmptyArgv);
    }
    let argv = argv
      .iter()
      .map(|arg| CString::new(arg.as_ref().as_bytes()))
      .collect::<Result<Vec<_>, _>>()
      .map_err(|_| Error::Os {
        source: Errno::EINVAL,
      })?;

    let error = Rc::new(Cell::new(false));
    let (pid, master, ipc) = spawn::spawn(&argv, Rc::clone(&error))?;

    // The child inherited our mask and dispositions across fork; that
    // is what the mirrors start from.
    let blocked = signals::current_sigmask()?;
    let caught = signals::fetch_sigcaught()?;

    Ok(Self {
      pid: Some(pid),
      master: Some(master),
      ipc: Some(ipc),
      status: None,
      eof: false,
      released: false,
      draining: false,
      error,
      last_signal: None,
      blocked,
      caught,
      term: None,
    })
  }

  pub fn pid(&self) -> Option<Pid> {
    self.pid
  }

  pub fn released(&self) -> bool {
    self.released
  }

  /// Whether the pty has hit end-of-file.
  pub fn saw_eof(&self) -> bool {
    self.eof
  }

  /// Whether the child reported a pre-exec failure.
  pub fn child_failed(&self) -> bool {
    self.error.get()
  }

  /// The child's signal mask as last pushed over IPC.
  pub fn blocked_mask(&self) -> u32 {
    signals::sigset_to_mask(&self.blocked)
  }

  /// The child's caught set as known to the parent.
  pub fn caught_mask(&self) -> u32 {
    signals::sigset_to_mask(&self.caught)
  }

  /// Change the child's working directory before exec.
  pub fn chdir<P: AsRef<Path>>(&mut self, dir: P) -> Result<()> {
    let mut payload = dir.as_ref().as_os_str().as_bytes().to_vec();
    payload.push(0);
    self.send_acked_errno(
      &IpcMessage::new(MessageTag::Chdir, payload),
      MessageTag::ChdirAck,
    )
  }

  /// Replace the child's signal mask before exec.
  pub fn sigmask(&mut self, mask: u32) -> Result<()> {
    let set = signals::mask_to_sigset(mask)?;
    self.send_acked_errno(
      &IpcMessage::new(MessageTag::SetMask, ipc::payload_of(&set).to_vec()),
      MessageTag::SetMaskAck,
    )?;
    self.blocked = set;
    Ok(())
  }

  /// Make the signals in `mask` catchable (`catch`) or ignored in the
  /// child before exec, and update the parent-side caught set.
  pub fn sigcatch(&mut self, catch: bool, mask: u32) -> Result<()> {
    let set = signals::mask_to_sigset(mask)?;
    let payload = SigCatchPayload {
      mask: set,
      catch: catch.into(),
    };
    self.send_acked_errno(
      &IpcMessage::new(MessageTag::SigCatch, ipc::payload_of(&payload).to_vec()),
      MessageTag::SigCatchAck,
    )?;
    signals::mask_apply(!catch, &mut self.caught, &set);
    Ok(())
  }

  /// Change the child's credentials before exec.
  pub fn setid(&mut self, uid: Option<libc::uid_t>, gid: Option<libc::gid_t>) -> Result<()> {
    let payload = SetIdPayload {
      set_uid: uid.is_some().into(),
      set_gid: gid.is_some().into(),
      uid: uid.unwrap_or(0),
      gid: gid.unwrap_or(0),
    };
    self.send_acked_errno(
      &IpcMessage::new(MessageTag::SetId, ipc::payload_of(&payload).to_vec()),
      MessageTag::SetIdAck,
    )
  }

  /// Replace the child's supplementary groups before exec.
  pub fn setgroups(&mut self, groups: &[libc::gid_t]) -> Result<()> {
    let mut payload = Vec::with_capacity(groups.len() * size_of::<libc::gid_t>());
    for gid in groups {
      payload.extend_from_slice(&gid.to_ne_bytes());
    }
    self.send_acked_errno(
      &IpcMessage::new(MessageTag::SetGroups, payload),
      MessageTag::SetGroupsAck,
    )
  }

  /// Let the child exec. Applies `env` first when given; afterwards the
  /// control channel is gone and only pty I/O remains.
  pub fn release(&mut self, env: Option<&EnvSpec>) -> Result<()> {
    if let Some(env) = env
      && !env.is_empty()
    {
      self.setup_env(env)?;
    }

    let mut ipc = self.ipc.take().ok_or(Error::AlreadyReleased)?;
    let sent = ipc.send_bare(MessageTag::Release);
    let _ = ipc.close();
    sent?;

    debug!(pid = self.pid.map(Pid::as_raw), "released child");
    self.released = true;
    Ok(())
  }

  fn setup_env(&mut self, env: &EnvSpec) -> Result<()> {
    let mut set_blob = Vec::new();
    for (name, value) in &env.set {
      set_blob.extend_from_slice(name.as_bytes());
      set_blob.push(b'=');
      set_blob.extend_from_slice(value.as_bytes());
      set_blob.push(0);
    }
    let mut unset_blob = Vec::new();
    for name in &env.unset {
      unset_blob.extend_from_slice(name.as_bytes());
      unset_blob.push(0);
    }

    let mut payload = Vec::with_capacity(1 + 2 * size_of::<usize>() + set_blob.len() + unset_blob.len());
    payload.push(env.clear.into());
    payload.extend_from_slice(&set_blob.len().to_ne_bytes());
    payload.extend_from_slice(&unset_blob.len().to_ne_bytes());
    payload.extend_from_slice(&set_blob);
    payload.extend_from_slice(&unset_blob);

    self.send_acked_errno(
      &IpcMessage::new(MessageTag::EnvSetup, payload),
      MessageTag::EnvAck,
    )
  }

  /// Deliver `signo` to the released child. Unknown signal numbers are
  /// passed through; kill(2) validates better than we can.
  pub fn signal(&mut self, signo: i32) -> Result<()> {
    if self.ipc.is_some() {
      // Signaling a stalled pre-exec child only tests the supervisor.
      return Err(Error::NotReleased);
    }
    let pid = self.pid.ok_or(Error::AlreadyTerminated)?;
    self.last_signal = Some(signo);
    Errno::result(unsafe { libc::kill(pid.as_raw(), signo) })?;
    Ok(())
  }

  /// Acquire the terminal handle, performing the attribute inquiry
  /// round-trip on first use. Pre-release only.
  pub fn term(&mut self) -> Result<Terminal<'_>> {
    if self.term.is_none() {
      self.term_inquiry()?;
    }
    Ok(Terminal { proc: self })
  }

  fn term_inquiry(&mut self) -> Result<()> {
    let ipc = self.ipc.as_mut().ok_or(Error::AlreadyReleased)?;
    if !ipc.live() {
      return Err(Error::AlreadyReleased);
    }

    let slot: Rc<RefCell<Option<libc::termios>>> = Rc::new(RefCell::new(None));
    let shared = Rc::clone(&slot);
    ipc.register(MessageTag::TermiosSet, move |_ipc, msg| {
      match ipc::payload_as::<libc::termios>(msg.payload()) {
        Some(raw) => {
          *shared.borrow_mut() = Some(raw);
          Ok(())
        }
        None => Err(Errno::EINVAL.into()),
      }
    });

    // The child only responds to us until release, so the next message
    // must be the reply; anything else is a protocol error.
    let exchange = (|| -> Result<()> {
      ipc.send_bare(MessageTag::TermiosInquiry)?;
      ipc.wait()?;
      match ipc.recv()? {
        None => Ok(()),
        Some(msg) => Err(Error::UnexpectedMessage { tag: msg.tag() }),
      }
    })();
    ipc.unregister(MessageTag::TermiosSet);
    exchange?;

    let raw = slot.borrow_mut().take().ok_or(Error::PeerClosed)?;
    self.term = Some(TermState::new(raw));
    Ok(())
  }

  /// Write `buf` to the pty master, riding out EINTR and short writes.
  pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
    let master = self.master.as_ref().ok_or(Error::PtyClosed)?;
    let fd = master.as_fd();
    let mut total = 0;
    while total < buf.len() {
      match ipc::fd_write(fd, &buf[total..]) {
        Ok(n) => total += n,
        Err(Errno::EINTR) => continue,
        Err(e) => return Err(e.into()),
      }
    }
    Ok(total)
  }

  /// Feed pty output to `callback` until it returns `true`, the timeout
  /// lapses, or EOF.
  ///
  /// `timeout` is a minimum wall-clock duration with one-second
  /// granularity; anything shorter counts as one second, and lapsing is
  /// success with no callback invocation. At EOF the callback sees
  /// `None` once and the handle latches; a child found dead from a
  /// signal the controller did not send surfaces as
  /// [`Error::KilledBySignal`].
  pub fn read<F>(&mut self, timeout: Option<Duration>, mut callback: F) -> Result<()>
  where
    F: FnMut(Option<&[u8]>) -> bool,
  {
    let timeout = timeout.map(|t| t.max(Duration::from_secs(1)));
    let start = Instant::now();
    let mut buf = [0u8; READ_CHUNK];

    loop {
      if self.error.get() {
        // Child reported a pre-exec failure; let the caller inspect it.
        return Ok(());
      }
      let remaining = match timeout {
        Some(t) => match t.checked_sub(start.elapsed()) {
          Some(left) if !left.is_zero() => Some(left),
          _ => return Ok(()),
        },
        None => None,
      };

      let master = self.master.as_ref().ok_or(Error::PtyClosed)?;
      match wait_readable(master.as_fd(), remaining) {
        Ok(true) => {}
        Ok(false) => return Ok(()), // timeout: not the end of the world
        Err(Errno::EINTR) => {
          if !self.draining {
            continue;
          }
          // Shutdown alarms cut the drain short instead of rearming.
          return Ok(());
        }
        Err(e) => return Err(e.into()),
      }

      let n = match ipc::fd_read(master.as_fd(), &mut buf) {
        Ok(n) => n,
        // Some platforms report a vanished slave as EIO rather than EOF.
        Err(Errno::EIO) => 0,
        Err(e) => return Err(e.into()),
      };

      if n > 0 {
        trace!(len = n, "pty chunk");
        if callback(Some(&buf[..n])) {
          return Ok(());
        }
        continue;
      }

      self.eof = true;
      self.master = None;
      callback(None);

      if !self.draining
        && self.reap(false)
        && let Some(signo) = self.fatal_signal()
        && Some(signo) != self.last_signal
      {
        return Err(Error::KilledBySignal { signal: signo });
      }
      // EOF still reads as success so the caller can tell "done" from
      // "disaster" by asking for the exit status.
      return Ok(());
    }
  }

  /// Report the EOF latch and, once the pty is gone, the child's exit
  /// status, reaping it according to `wait`.
  pub fn eof(&mut self, wait: WaitPolicy) -> (bool, Option<ProcessStatus>) {
    if !self.eof {
      return (false, None);
    }
    if self.pid.is_some() {
      match wait {
        WaitPolicy::NoHang => {
          self.reap(false);
        }
        WaitPolicy::Hang => {
          self.reap(true);
        }
        WaitPolicy::Alarm(secs) => {
          let restore = claim_alarm();
          alarm::set(secs);
          self.reap(true);
          alarm::cancel();
          restore();
        }
      }
    }
    (true, self.status.map(ProcessStatus::from_raw))
  }

  /// Graceful shutdown: reap if already dead, otherwise SIGINT with a
  /// grace period and a final pty drain, escalating to SIGKILL.
  /// Escalation that ends in a reap is still success; all resources are
  /// released regardless.
  pub fn close(&mut self) -> Result<()> {
    if self.pid.is_some()
      && self.reap(false)
      && let Some(signo) = self.fatal_signal()
      && Some(signo) != self.last_signal
    {
      self.teardown();
      return Err(Error::KilledBySignal { signal: signo });
    }

    if self.pid.is_some() {
      let restore = claim_alarm();
      let mut sig = libc::SIGINT;
      let reaped = loop {
        if let Some(pid) = self.pid
          && unsafe { libc::kill(pid.as_raw(), sig) } == -1
        {
          warn!(sig, pid = pid.as_raw(), "kill: {}", Errno::last());
        }

        if sig == libc::SIGKILL {
          // Past asking nicely; drop the pty along with anything the
          // child buffered after our SIGINT.
          self.master = None;
          if self.reap(true) {
            break true;
          }
          break false;
        }

        // Some systems hold the controlling process until the tty is
        // drained; do that under the alarm before waiting.
        alarm::set(CLOSE_GRACE_SECS);
        self.drain_pty();
        // Only hang on the reap when the drain actually saw the child
        // go away; otherwise the alarm has already been spent.
        let reaped = self.reap(self.eof);
        alarm::cancel();
        if reaped {
          break true;
        }
        debug!(pid = self.pid.map(Pid::as_raw), "SIGINT did not stick, escalating");
        sig = libc::SIGKILL;
      };
      restore();

      if !reaped {
        self.teardown();
        return Err(Error::Unkillable);
      }
    }

    self.teardown();
    Ok(())
  }

  /// Interleave the child's pty and a caller-supplied input stream,
  /// handing each side's bytes to its callback. With `pulse`, idle
  /// seconds invoke it and a `false` return aborts.
  ///
  /// Returns `true` when the session ended cleanly: child EOF with a
  /// zero exit, no input EOF, no pulse abort.
  pub fn proxy<I, OF, IF>(
    &mut self,
    input: I,
    mut output_fn: OF,
    mut input_fn: IF,
    mut pulse: Option<&mut dyn FnMut() -> bool>,
  ) -> Result<bool>
  where
    I: AsFd,
    OF: FnMut(Option<&[u8]>),
    IF: FnMut(Option<&[u8]>),
  {
    let master_raw = self.master.as_ref().ok_or(Error::PtyClosed)?.as_raw_fd();
    let input_owned: OwnedFd = {
      let raw = Errno::result(unsafe { libc::dup(input.as_fd().as_raw_fd()) })?;
      unsafe { OwnedFd::from_raw_fd(raw) }
    };

    // A tty input loses line buffering and signal keys for the duration.
    match tcgetattr(&input_owned) {
      Ok(mut t) => {
        t.local_flags
          .remove(LocalFlags::ICANON | LocalFlags::ISIG);
        tcsetattr(&input_owned, SetArg::TCSANOW, &t)?;
      }
      Err(Errno::ENOTTY) => {}
      Err(e) => return Err(e.into()),
    }

    let timeout = if pulse.is_some() {
      PollTimeout::try_from(1000i32).unwrap_or(PollTimeout::MAX)
    } else {
      PollTimeout::NONE
    };

    let mut buf = [0u8; 4096];
    let mut bailed = false;
    let mut eof = false;
    while !eof {
      let master_fd = unsafe { BorrowedFd::borrow_raw(master_raw) };
      let mut fds = [
        PollFd::new(master_fd, PollFlags::POLLIN),
        PollFd::new(input_owned.as_fd(), PollFlags::POLLIN),
      ];
      let ready = match poll(&mut fds, timeout) {
        Ok(n) => n,
        Err(Errno::EINTR) => continue,
        Err(e) => return Err(e.into()),
      };

      if ready == 0 {
        if let Some(pulse) = pulse.as_mut()
          && !pulse()
        {
          bailed = true;
          break;
        }
        continue;
      }

      let out_ready = fds[0]
        .revents()
        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP));
      let in_ready = fds[1]
        .revents()
        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP));

      if out_ready {
        let chunk = proxy_read(master_fd, &mut buf)?;
        match chunk {
          Some(data) => output_fn(Some(data)),
          None => {
            eof = true;
            output_fn(None);
            let clean = if self.pid.is_none() || self.reap(true) {
              self
                .status
                .is_none_or(|raw| libc::WIFEXITED(raw) && libc::WEXITSTATUS(raw) == 0)
            } else {
              false
            };
            bailed = !clean;
          }
        }
      }

      if in_ready {
        let chunk = proxy_read(input_owned.as_fd(), &mut buf)?;
        match chunk {
          Some(data) => input_fn(Some(data)),
          None => {
            eof = true;
            input_fn(None);
            bailed = true;
          }
        }
      } else if eof {
        // Let the input side wrap up even though it had nothing to say.
        input_fn(None);
      }
    }

    Ok(!bailed)
  }

  pub(crate) fn master_raw(&self) -> Option<RawFd> {
    self.master.as_ref().map(AsRawFd::as_raw_fd)
  }

  pub(crate) fn term_state(&self) -> &TermState {
    match &self.term {
      Some(state) => state,
      None => unreachable!("terminal state exists while a handle is live"),
    }
  }

  pub(crate) fn term_state_mut(&mut self) -> &mut TermState {
    match &mut self.term {
      Some(state) => state,
      None => unreachable!("terminal state exists while a handle is live"),
    }
  }

  /// Push a full attribute struct to the child and await its ack.
  pub(crate) fn push_termios(&mut self, raw: libc::termios) -> Result<()> {
    self
      .send_acked(
        &IpcMessage::new(MessageTag::TermiosSet, ipc::payload_of(&raw).to_vec()),
        MessageTag::TermiosAck,
      )
      .map(drop)
  }

  /// One request/ack round-trip. Messages with handlers (ERROR) may be
  /// consumed along the way; any other tag in the ack slot is fatal to
  /// the operation.
  fn send_acked(&mut self, msg: &IpcMessage, ack: MessageTag) -> Result<IpcMessage> {
    let ipc = self.ipc.as_mut().ok_or(Error::AlreadyReleased)?;
    if !ipc.live() {
      return Err(Error::AlreadyReleased);
    }
    ipc.send(msg)?;
    loop {
      if ipc.wait()? {
        return Err(Error::PeerClosed);
      }
      match ipc.recv()? {
        None => {
          if !ipc.live() {
            return Err(Error::PeerClosed);
          }
        }
        Some(reply) if reply.tag() == ack => return Ok(reply),
        Some(reply) => return Err(Error::UnexpectedMessage { tag: reply.tag() }),
      }
    }
  }

  fn send_acked_errno(&mut self, msg: &IpcMessage, ack: MessageTag) -> Result<()> {
    let reply = self.send_acked(msg, ack)?;
    match reply.errno_value() {
      Some(0) => Ok(()),
      Some(errno) => Err(Errno::from_raw(errno).into()),
      None => Err(Error::Framing),
    }
  }

  /// Non-failing wait bookkeeping: true once the child is collected.
  fn reap(&mut self, hang: bool) -> bool {
    let Some(pid) = self.pid else {
      return true;
    };
    let mut status: libc::c_int = 0;
    let flags = if hang { 0 } else { libc::WNOHANG };
    let res = unsafe { libc::waitpid(pid.as_raw(), &mut status, flags) };
    if res != pid.as_raw() {
      return false;
    }
    debug!(pid = pid.as_raw(), status, "reaped child");
    self.status = Some(status);
    self.pid = None;
    true
  }

  fn fatal_signal(&self) -> Option<i32> {
    self.status.and_then(|raw| {
      if libc::WIFSIGNALED(raw) {
        Some(libc::WTERMSIG(raw))
      } else {
        None
      }
    })
  }

  /// Close-time drain: discard pending pty bytes until EOF or the grace
  /// period lapses. Draining mode also treats an alarm interruption as
  /// the end of the pass rather than rearming the wait.
  fn drain_pty(&mut self) {
    if self.master.is_none() {
      return;
    }
    self.draining = true;
    let _ = self.read(Some(Duration::from_secs(CLOSE_GRACE_SECS.into())), |_| false);
    self.draining = false;
  }

  fn teardown(&mut self) {
    if let Some(mut ipc) = self.ipc.take() {
      let _ = ipc.close();
    }
    self.master = None;
  }
}

impl Drop for Process {
  fn drop(&mut self) {
    if self.pid.is_some() || self.ipc.is_some() || self.master.is_some() {
      let _ = self.close();
    }
  }
}

fn wait_readable(fd: BorrowedFd<'_>, remaining: Option<Duration>) -> Result<bool, Errno> {
  let timeout = match remaining {
    Some(d) => {
      let millis = i32::try_from(d.as_millis()).unwrap_or(i32::MAX);
      PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
    }
    None => PollTimeout::NONE,
  };
  let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
  let n = poll(&mut fds, timeout)?;
  Ok(n > 0)
}

/// One proxy-side read: `None` is EOF, EINTR retries, EIO maps to EOF
/// like the main loop.
fn proxy_read<'a>(fd: BorrowedFd<'_>, buf: &'a mut [u8]) -> Result<Option<&'a [u8]>> {
  loop {
    match ipc::fd_read(fd, buf) {
      Ok(0) => return Ok(None),
      Ok(n) => return Ok(Some(&buf[..n])),
      Err(Errno::EINTR) => continue,
      Err(Errno::EIO) => return Ok(None),
      Err(e) => return Err(e.into()),
    }
  }
}

extern "C" fn alarm_noop(_: libc::c_int) {}

/// Claim SIGALRM with a do-nothing handler; the returned closure puts
/// the default disposition back.
fn claim_alarm() -> impl FnOnce() {
  let _ = unsafe { signal(Signal::SIGALRM, SigHandler::Handler(alarm_noop)) };
  || {
    let _ = unsafe { signal(Signal::SIGALRM, SigHandler::SigDfl) };
  }
}

//! Framed message transport over the pre-exec control socket.
//!
//! The parent and the not-yet-exec'd child share one non-blocking unix
//! stream socket. Every message is a fixed header (total size, then tag)
//! followed by an opaque payload; both endpoints are the same binary on
//! the same host, so native byte order and struct layout are fine on the
//! wire.
//!
//! A channel owns the socket, a FIFO queue of fully received messages,
//! and one handler slot per tag. Handlers run as messages are popped off
//! the queue; they may send on, or even close, the channel they were
//! invoked from.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::rc::Rc;

use nix::errno::Errno;
use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, trace};

use crate::errors::{Error, Result};

/// Wire header: `size: usize` then `tag: u32`, no padding.
pub(crate) const HEADER_SIZE: usize = mem::size_of::<usize>() + mem::size_of::<u32>();

cfg_if::cfg_if! {
  if #[cfg(any(target_os = "linux", target_os = "android"))] {
    const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
  } else {
    const SEND_FLAGS: libc::c_int = 0;
  }
}

/// The closed set of message tags. The reserved on-wire value `0` has no
/// variant here: decoding it (or anything else outside this set) is a
/// framing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[repr(u32)]
pub enum MessageTag {
  /// Bidirectional: child says "ready", parent says "exec".
  Release = 1,
  /// Child -> parent, NUL-terminated error string.
  Error,
  /// Parent -> child, no payload.
  TermiosInquiry,
  /// Bidirectional, raw `termios` payload.
  TermiosSet,
  /// Child -> parent, no payload.
  TermiosAck,
  /// Parent -> child: clear flag, set/unset sizes, NUL-delimited blobs.
  EnvSetup,
  /// Child -> parent, errno payload.
  EnvAck,
  /// Parent -> child, NUL-terminated path.
  Chdir,
  ChdirAck,
  /// Parent -> child, raw `sigset_t` payload.
  SetMask,
  SetMaskAck,
  /// Parent -> child, raw `sigset_t` plus catch flag.
  SigCatch,
  SigCatchAck,
  /// Parent -> child, credential payload.
  SetId,
  SetIdAck,
  /// Parent -> child, packed `gid_t` list.
  SetGroups,
  SetGroupsAck,
}

const TAG_SLOTS: usize = MessageTag::SetGroupsAck as usize;

impl MessageTag {
  fn slot(self) -> usize {
    self as usize - 1
  }
}

/// One framed message: a tag plus an owned, possibly empty payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcMessage {
  tag: MessageTag,
  payload: Vec<u8>,
}

impl IpcMessage {
  pub fn new(tag: MessageTag, payload: Vec<u8>) -> Self {
    Self { tag, payload }
  }

  /// A payload-less message, as used for acknowledgments.
  pub fn bare(tag: MessageTag) -> Self {
    Self {
      tag,
      payload: Vec::new(),
    }
  }

  pub(crate) fn with_errno(tag: MessageTag, errno: i32) -> Self {
    Self::new(tag, errno.to_ne_bytes().to_vec())
  }

  pub fn tag(&self) -> MessageTag {
    self.tag
  }

  pub fn payload(&self) -> &[u8] {
    &self.payload
  }

  pub fn into_payload(self) -> Vec<u8> {
    self.payload
  }

  pub(crate) fn errno_value(&self) -> Option<i32> {
    self
      .payload
      .as_slice()
      .try_into()
      .ok()
      .map(i32::from_ne_bytes)
  }

  fn wire_size(&self) -> usize {
    HEADER_SIZE + self.payload.len()
  }
}

/// Per-tag message handler. The C incarnation carried a `cookie` pointer
/// next to the function; closures capture instead.
pub type IpcHandler = Rc<RefCell<dyn FnMut(&mut IpcChannel, IpcMessage) -> Result<()>>>;

pub struct IpcChannel {
  sock: Option<OwnedFd>,
  queue: VecDeque<IpcMessage>,
  handlers: [Option<IpcHandler>; TAG_SLOTS],
}

impl std::fmt::Debug for IpcChannel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("IpcChannel")
      .field("sock", &self.sock.as_ref().map(AsRawFd::as_raw_fd))
      .field("queued", &self.queue.len())
      .finish_non_exhaustive()
  }
}

impl IpcChannel {
  /// Adopt an already-connected, non-blocking, close-on-exec stream
  /// socket.
  pub fn open(sock: OwnedFd) -> Self {
    Self {
      sock: Some(sock),
      queue: VecDeque::new(),
      handlers: [const { None }; TAG_SLOTS],
    }
  }

  /// A channel is live until EOF retires the socket. Queued messages
  /// stay readable after that.
  pub fn live(&self) -> bool {
    self.sock.is_some()
  }

  /// Install a handler for `tag`, replacing any previous one.
  pub fn register<F>(&mut self, tag: MessageTag, handler: F)
  where
    F: FnMut(&mut IpcChannel, IpcMessage) -> Result<()> + 'static,
  {
    self.handlers[tag.slot()] = Some(Rc::new(RefCell::new(handler)));
  }

  /// Clear the handler slot for `tag`.
  pub fn unregister(&mut self, tag: MessageTag) {
    self.handlers[tag.slot()] = None;
  }

  #[cfg(test)]
  pub(crate) fn registered(&self, tag: MessageTag) -> bool {
    self.handlers[tag.slot()].is_some()
  }

  /// Test hook: plant a message on the receive queue as if the peer had
  /// sent it.
  #[cfg(test)]
  pub(crate) fn inject(&mut self, msg: IpcMessage) {
    self.queue.push_back(msg);
  }

  /// Half-close our side, collect the peer's remaining traffic until it
  /// hangs up, then run handlers for whatever was queued. Unhandled
  /// messages are dropped. Idempotent; returns the first handler error.
  pub fn close(&mut self) -> Result<()> {
    if let Some(sock) = self.sock.as_ref() {
      let _ = unsafe { libc::shutdown(sock.as_raw_fd(), libc::SHUT_WR) };

      while self.live() {
        let _ = self.wait();
        if self.drain().is_err() {
          break;
        }
      }
      self.hangup();
    }

    let result = self.pop(false).map(|_| ());
    // A handler error aborts dispatch; nothing may survive close either
    // way.
    self.queue.clear();
    result
  }

  /// Send one message, draining the read side first so the peer never
  /// blocks against us. A short header write is a framing error.
  pub fn send(&mut self, msg: &IpcMessage) -> Result<()> {
    let header = encode_header(msg.wire_size(), msg.tag);
    loop {
      self.drain()?;
      if !self.live() {
        return Err(Error::PeerClosed);
      }
      match self.write_sock(&header) {
        Ok(n) if n == header.len() => break,
        Ok(_) => return Err(Error::Framing),
        Err(Errno::EAGAIN) => continue,
        Err(e) => return Err(e.into()),
      }
    }

    let mut off = 0;
    while off < msg.payload.len() {
      match self.write_sock(&msg.payload[off..]) {
        Ok(n) => off += n,
        Err(Errno::EAGAIN) => continue,
        Err(e) => return Err(e.into()),
      }
    }
    Ok(())
  }

  /// Tag-only convenience for acknowledgments.
  pub fn send_bare(&mut self, tag: MessageTag) -> Result<()> {
    self.send(&IpcMessage::bare(tag))
  }

  /// Pop one message, dispatching handled ones along the way. `None`
  /// means the queue is dry (and, if the channel is no longer live,
  /// nothing more is coming).
  pub fn recv(&mut self) -> Result<Option<IpcMessage>> {
    self.drain()?;
    self.pop(true)
  }

  /// Block until a message can be received. Returns `true` when the
  /// peer has hung up and the queue is empty.
  pub fn wait(&mut self) -> Result<bool> {
    if !self.queue.is_empty() {
      return Ok(false);
    }
    let Some(sock) = self.sock.as_ref() else {
      return Ok(true);
    };
    poll_readable(sock.as_fd())?;
    Ok(false)
  }

  /// Pull everything currently buffered on the socket into the queue.
  /// Never blocks unless a message is partially received.
  fn drain(&mut self) -> Result<()> {
    loop {
      if !self.live() {
        return Ok(());
      }

      let mut header = [0u8; HEADER_SIZE];
      let mut filled = match self.read_sock(&mut header) {
        Ok(0) => {
          self.hangup();
          return Ok(());
        }
        Ok(n) => n,
        Err(Errno::EAGAIN) => return Ok(()),
        Err(e) => return Err(e.into()),
      };

      // A partial header counts as a partially received message: finish
      // it even if that means waiting on the socket.
      while filled < HEADER_SIZE {
        match self.read_sock(&mut header[filled..]) {
          Ok(0) => {
            self.hangup();
            return Ok(());
          }
          Ok(n) => filled += n,
          Err(Errno::EAGAIN) => self.wait_readable()?,
          Err(e) => return Err(e.into()),
        }
      }

      let (size, tag) = decode_header(&header)?;
      let mut payload = vec![0u8; size - HEADER_SIZE];
      let mut off = 0;
      while off < payload.len() {
        match self.read_sock(&mut payload[off..]) {
          Ok(0) => {
            // Truncated transfer; the partial message is dropped but
            // everything already queued stays valid.
            self.hangup();
            return Ok(());
          }
          Ok(n) => off += n,
          Err(Errno::EAGAIN) => self.wait_readable()?,
          Err(e) => return Err(e.into()),
        }
      }

      trace!(%tag, len = payload.len(), "queued control message");
      self.queue.push_back(IpcMessage { tag, payload });
    }
  }

  /// Dequeue in arrival order, invoking handlers. A handler error stops
  /// dispatch; with `deliver` the first unhandled message goes back to
  /// the caller, otherwise it is dropped (teardown drain).
  fn pop(&mut self, deliver: bool) -> Result<Option<IpcMessage>> {
    while let Some(msg) = self.queue.pop_front() {
      let handler = self.handlers[msg.tag().slot()].clone();
      if let Some(handler) = handler {
        // The handler may close the channel out from under us; the
        // queue itself stays usable either way.
        (&mut *handler.borrow_mut())(self, msg)?;
        continue;
      }

      if deliver {
        return Ok(Some(msg));
      }
    }
    Ok(None)
  }

  fn read_sock(&self, buf: &mut [u8]) -> Result<usize, Errno> {
    match self.sock.as_ref() {
      Some(sock) => fd_read(sock.as_fd(), buf),
      None => Ok(0),
    }
  }

  fn write_sock(&self, buf: &[u8]) -> Result<usize, Errno> {
    // send(2) rather than write(2): a peer that died mid-protocol must
    // surface as EPIPE, not SIGPIPE.
    match self.sock.as_ref() {
      Some(sock) => {
        let res = unsafe {
          libc::send(
            sock.as_raw_fd(),
            buf.as_ptr().cast(),
            buf.len(),
            SEND_FLAGS,
          )
        };
        Errno::result(res).map(|n| n as usize)
      }
      None => Err(Errno::EPIPE),
    }
  }

  fn wait_readable(&self) -> Result<()> {
    if let Some(sock) = self.sock.as_ref() {
      poll_readable(sock.as_fd())?;
    }
    Ok(())
  }

  fn hangup(&mut self) {
    if let Some(sock) = self.sock.take() {
      debug!(fd = sock.as_raw_fd(), "control socket reached EOF");
      drop(sock);
    }
  }
}

fn encode_header(size: usize, tag: MessageTag) -> [u8; HEADER_SIZE] {
  let mut header = [0u8; HEADER_SIZE];
  header[..mem::size_of::<usize>()].copy_from_slice(&size.to_ne_bytes());
  header[mem::size_of::<usize>()..].copy_from_slice(&(tag as u32).to_ne_bytes());
  header
}

fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<(usize, MessageTag)> {
  let (size_bytes, tag_bytes) = header.split_at(mem::size_of::<usize>());
  let size = usize::from_ne_bytes(size_bytes.try_into().map_err(|_| Error::Framing)?);
  let raw_tag = u32::from_ne_bytes(tag_bytes.try_into().map_err(|_| Error::Framing)?);

  // An empty payload is legal; less than a header's worth of data is
  // not, and neither is a tag from outside the closed set.
  if size < HEADER_SIZE {
    return Err(Error::Framing);
  }
  let tag = MessageTag::from_repr(raw_tag).ok_or(Error::Framing)?;
  Ok((size, tag))
}

pub(crate) fn fd_read(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<usize, Errno> {
  let res = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
  Errno::result(res).map(|n| n as usize)
}

pub(crate) fn fd_write(fd: BorrowedFd<'_>, buf: &[u8]) -> Result<usize, Errno> {
  let res = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
  Errno::result(res).map(|n| n as usize)
}

fn poll_readable(fd: BorrowedFd<'_>) -> Result<(), Errno> {
  loop {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::NONE) {
      Err(Errno::EINTR) => continue,
      Err(e) => return Err(e),
      Ok(_) => return Ok(()),
    }
  }
}

/// Raw-struct payload view. Sound only for plain-old-data types, and
/// only because both endpoints are the same binary on the same host.
pub(crate) fn payload_of<T: Copy>(value: &T) -> &[u8] {
  unsafe { std::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>()) }
}

/// The inverse of [`payload_of`]; `None` on a size mismatch.
pub(crate) fn payload_as<T: Copy>(bytes: &[u8]) -> Option<T> {
  if bytes.len() != mem::size_of::<T>() {
    return None;
  }
  Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) })
}

#[cfg(test)]
mod tests {
  use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

  use super::*;

  fn channel_pair() -> (IpcChannel, IpcChannel) {
    let (a, b) = socketpair(
      AddressFamily::Unix,
      SockType::Stream,
      None,
      SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
    )
    .unwrap();
    (IpcChannel::open(a), IpcChannel::open(b))
  }

  fn recv_one(chan: &mut IpcChannel) -> IpcMessage {
    assert!(!chan.wait().unwrap());
    chan.recv().unwrap().expect("a message should be queued")
  }

  #[test]
  fn tag_order_is_preserved() {
    let (mut tx, mut rx) = channel_pair();
    let tags = [
      MessageTag::TermiosInquiry,
      MessageTag::Chdir,
      MessageTag::Release,
      MessageTag::SetMask,
    ];
    for tag in tags {
      tx.send(&IpcMessage::new(tag, vec![0x5a; 3])).unwrap();
    }
    for tag in tags {
      assert_eq!(recv_one(&mut rx).tag(), tag);
    }
  }

  #[test]
  fn empty_payload_is_legal() {
    let (mut tx, mut rx) = channel_pair();
    tx.send_bare(MessageTag::Release).unwrap();
    let msg = recv_one(&mut rx);
    assert_eq!(msg.tag(), MessageTag::Release);
    assert!(msg.payload().is_empty());
  }

  #[test]
  fn large_payload_survives_partial_reads() {
    let (mut tx, mut rx) = channel_pair();
    let blob: Vec<u8> = (0..64 * 1024u32).map(|i| i as u8).collect();
    tx.send(&IpcMessage::new(MessageTag::EnvSetup, blob.clone()))
      .unwrap();
    let msg = recv_one(&mut rx);
    assert_eq!(msg.payload(), &blob[..]);
  }

  #[test]
  fn forbidden_tag_is_a_framing_error() {
    let (tx, mut rx) = channel_pair();
    // Tag 0 never appears on the wire; write a raw frame claiming it.
    let header = encode_header(HEADER_SIZE, MessageTag::Release);
    let mut bogus = header;
    bogus[mem::size_of::<usize>()..].copy_from_slice(&0u32.to_ne_bytes());
    fd_write(tx.sock.as_ref().unwrap().as_fd(), &bogus).unwrap();
    assert!(matches!(rx.recv(), Err(Error::Framing)));
  }

  #[test]
  fn undersized_frame_is_a_framing_error() {
    let (tx, mut rx) = channel_pair();
    let header = encode_header(HEADER_SIZE - 1, MessageTag::Release);
    fd_write(tx.sock.as_ref().unwrap().as_fd(), &header).unwrap();
    assert!(matches!(rx.recv(), Err(Error::Framing)));
  }

  #[test]
  fn handlers_run_in_dispatch_order() {
    let (mut tx, mut rx) = channel_pair();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&seen);
    rx.register(MessageTag::Chdir, move |_chan, msg| {
      log.borrow_mut().push(msg.payload().to_vec());
      Ok(())
    });

    tx.send(&IpcMessage::new(MessageTag::Chdir, b"/one\0".to_vec()))
      .unwrap();
    tx.send(&IpcMessage::new(MessageTag::Chdir, b"/two\0".to_vec()))
      .unwrap();
    tx.send_bare(MessageTag::Release).unwrap();

    // Handled messages are consumed inline; the unhandled one surfaces.
    let msg = recv_one(&mut rx);
    assert_eq!(msg.tag(), MessageTag::Release);
    assert_eq!(&*seen.borrow(), &[b"/one\0".to_vec(), b"/two\0".to_vec()]);
  }

  #[test]
  fn handler_error_aborts_dispatch() {
    let (mut tx, mut rx) = channel_pair();
    rx.register(MessageTag::Chdir, |_chan, _msg| Err(Errno::EINVAL.into()));
    tx.send(&IpcMessage::new(MessageTag::Chdir, b"x\0".to_vec()))
      .unwrap();
    assert!(matches!(
      rx.recv(),
      Err(Error::Os {
        source: Errno::EINVAL
      })
    ));
  }

  #[test]
  fn handler_replacement_is_idempotent() {
    let (mut tx, mut rx) = channel_pair();
    let hits = Rc::new(RefCell::new(0));
    let first = Rc::clone(&hits);
    rx.register(MessageTag::Release, move |_chan, _msg| {
      *first.borrow_mut() += 10;
      Ok(())
    });
    let second = Rc::clone(&hits);
    rx.register(MessageTag::Release, move |_chan, _msg| {
      *second.borrow_mut() += 1;
      Ok(())
    });

    tx.send_bare(MessageTag::Release).unwrap();
    assert!(!rx.wait().unwrap());
    assert!(rx.recv().unwrap().is_none());
    assert_eq!(*hits.borrow(), 1);

    rx.unregister(MessageTag::Release);
    assert!(!rx.registered(MessageTag::Release));
  }

  #[test]
  fn wait_reports_eof_after_peer_close() {
    let (tx, mut rx) = channel_pair();
    drop(tx);
    assert!(!rx.wait().unwrap()); // readable: EOF is pending
    assert!(rx.recv().unwrap().is_none());
    assert!(!rx.live());
    assert!(rx.wait().unwrap());
  }

  #[test]
  fn close_runs_handlers_and_empties_queue() {
    let (mut tx, mut rx) = channel_pair();
    let seen = Rc::new(RefCell::new(0));
    let count = Rc::clone(&seen);
    rx.register(MessageTag::Error, move |_chan, _msg| {
      *count.borrow_mut() += 1;
      Ok(())
    });

    tx.send(&IpcMessage::new(MessageTag::Error, b"boom\0".to_vec()))
      .unwrap();
    tx.send_bare(MessageTag::Release).unwrap(); // unhandled: dropped
    drop(tx);

    rx.close().unwrap();
    assert_eq!(*seen.borrow(), 1);
    assert!(!rx.live());
    assert!(rx.queue.is_empty());

    // Idempotent on an already-closed channel.
    rx.close().unwrap();
  }

  #[test]
  fn messages_survive_eof_until_drained() {
    let (mut tx, mut rx) = channel_pair();
    tx.send(&IpcMessage::new(MessageTag::Chdir, b"/tmp\0".to_vec()))
      .unwrap();
    drop(tx);

    let msg = rx.recv().unwrap().expect("queued before EOF");
    assert_eq!(msg.tag(), MessageTag::Chdir);
    assert!(!rx.live());
    assert!(rx.recv().unwrap().is_none());
  }

  #[test]
  fn errno_ack_roundtrip() {
    let msg = IpcMessage::with_errno(MessageTag::ChdirAck, libc::ENOENT);
    assert_eq!(msg.errno_value(), Some(libc::ENOENT));
    assert_eq!(IpcMessage::bare(MessageTag::ChdirAck).errno_value(), None);
  }

  #[test]
  fn raw_payload_views_roundtrip() {
    let ws = libc::winsize {
      ws_row: 24,
      ws_col: 80,
      ws_xpixel: 0,
      ws_ypixel: 0,
    };
    let bytes = payload_of(&ws).to_vec();
    let back: libc::winsize = payload_as(&bytes).unwrap();
    assert_eq!(back.ws_row, 24);
    assert_eq!(back.ws_col, 80);
    assert!(payload_as::<libc::winsize>(&bytes[1..]).is_none());
  }
}

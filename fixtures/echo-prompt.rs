//! Interactive fixture: prints a prompt, echoes each line, and catches
//! SIGINT (unless an inherited ignore says not to) until three
//! interrupts have landed, then exits 37.

use std::sync::atomic::{AtomicI32, Ordering};

use nix::libc;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

static SIGNALS: AtomicI32 = AtomicI32::new(0);

extern "C" fn catch_sigint(_: libc::c_int) {
  const MSG: &[u8] = b"\nInterrupt caught\n";
  unsafe {
    libc::write(libc::STDOUT_FILENO, MSG.as_ptr().cast(), MSG.len());
  }
  SIGNALS.fetch_add(1, Ordering::SeqCst);
}

fn main() {
  // No SA_RESTART: the read below must come back with EINTR so the
  // interrupt counter gets rechecked.
  let handler = SigAction::new(
    SigHandler::Handler(catch_sigint),
    SaFlags::empty(),
    SigSet::empty(),
  );
  unsafe {
    let inherited = sigaction(Signal::SIGINT, &handler).unwrap();
    if matches!(inherited.handler(), SigHandler::SigIgn) {
      // Whoever spawned us asked for interrupts to stay ignored.
      let _ = sigaction(Signal::SIGINT, &inherited);
    }
  }

  let mut buf = [0u8; 1024];
  while SIGNALS.load(Ordering::SeqCst) < 3 {
    let prompt = b">> ";
    unsafe {
      libc::write(libc::STDOUT_FILENO, prompt.as_ptr().cast(), prompt.len());
    }

    let n = unsafe { libc::read(libc::STDIN_FILENO, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
      if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
        continue;
      }
      eprintln!("read: {}", std::io::Error::last_os_error());
      std::process::exit(1);
    }
    if n == 0 {
      std::process::exit(1);
    }
    unsafe {
      libc::write(libc::STDOUT_FILENO, buf.as_ptr().cast(), n as usize);
    }
  }

  std::process::exit(37);
}

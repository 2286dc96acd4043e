//! End-to-end sessions against the fixture programs.
//!
//! Everything here spawns real children under a pty, so the whole file
//! takes the serial lock.

use std::time::{Duration, Instant};

use nix::libc;
use porch::{EnvSpec, Process, StatusKind, TermUpdate, WaitPolicy};
use serial_test::file_serial;

const ECHO_PROMPT: &str = env!("CARGO_BIN_EXE_echo-prompt");
const SIGCHECK: &str = env!("CARGO_BIN_EXE_sigcheck");

const fn sigbit(signo: i32) -> u32 {
  1 << (signo - 1)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
  haystack.windows(needle.len()).any(|window| window == needle)
}

/// Accumulate pty output until `needle` shows up. Panics on EOF or after
/// `secs` of silence so a broken session fails loudly.
fn read_until(proc: &mut Process, needle: &[u8], secs: u64) -> Vec<u8> {
  let mut acc = Vec::new();
  let deadline = Instant::now() + Duration::from_secs(secs);
  loop {
    proc
      .read(Some(Duration::from_secs(2)), |chunk| {
        if let Some(chunk) = chunk {
          acc.extend_from_slice(chunk);
        }
        contains(&acc, needle)
      })
      .expect("read failed");
    if contains(&acc, needle) {
      return acc;
    }
    assert!(
      !proc.saw_eof(),
      "EOF before {:?} showed up; got {:?}",
      String::from_utf8_lossy(needle),
      String::from_utf8_lossy(&acc),
    );
    assert!(
      Instant::now() < deadline,
      "no {:?} after {secs}s; got {:?}",
      String::from_utf8_lossy(needle),
      String::from_utf8_lossy(&acc),
    );
  }
}

fn read_to_eof(proc: &mut Process, secs: u64) -> Vec<u8> {
  let mut acc = Vec::new();
  let deadline = Instant::now() + Duration::from_secs(secs);
  while !proc.saw_eof() {
    proc
      .read(Some(Duration::from_secs(2)), |chunk| {
        if let Some(chunk) = chunk {
          acc.extend_from_slice(chunk);
        }
        false
      })
      .expect("read failed");
    assert!(Instant::now() < deadline, "no EOF after {secs}s");
  }
  acc
}

#[test]
#[file_serial]
fn echo_prompt_session_runs_to_exit() {
  let mut proc = Process::spawn(&[ECHO_PROMPT]).unwrap();
  proc.release(None).unwrap();

  read_until(&mut proc, b">> ", 10);
  proc.write(b"hello\n").unwrap();
  read_until(&mut proc, b"hello", 10);

  // The fixture gives up after three interrupts and exits 37.
  for _ in 0..3 {
    proc.signal(libc::SIGINT).unwrap();
    read_until(&mut proc, b"Interrupt caught", 10);
  }

  read_to_eof(&mut proc, 10);
  let (eof, status) = proc.eof(WaitPolicy::Hang);
  assert!(eof);
  let status = status.unwrap();
  assert_eq!(status.kind(), StatusKind::Exited);
  assert_eq!(status.code(), 37);

  proc.close().unwrap();
}

#[test]
#[file_serial]
fn terminal_echo_toggle_round_trip() {
  let mut proc = Process::spawn(&["cat"]).unwrap();

  {
    let mut term = proc.term().unwrap();
    let lflags = term.local_flags();
    assert_ne!(lflags & libc::ECHO, 0, "fresh pty should echo");
    term
      .update(&TermUpdate {
        local_flags: Some(lflags & !libc::ECHO),
        ..Default::default()
      })
      .unwrap();
    assert_eq!(term.local_flags() & libc::ECHO, 0);
  }

  proc.release(None).unwrap();
  proc.write(b"x\n").unwrap();

  let mut acc = read_until(&mut proc, b"x", 10);
  // Give a hypothetical echo duplicate a chance to arrive, then make
  // sure cat's copy is the only one.
  proc
    .read(Some(Duration::from_secs(2)), |chunk| {
      if let Some(chunk) = chunk {
        acc.extend_from_slice(chunk);
      }
      false
    })
    .unwrap();
  assert_eq!(
    acc.iter().filter(|b| **b == b'x').count(),
    1,
    "echo was supposed to be off; saw {:?}",
    String::from_utf8_lossy(&acc)
  );

  proc.close().unwrap();
}

#[test]
#[file_serial]
fn chdir_applies_before_exec() {
  let dir = tempfile::tempdir().unwrap();
  let target = dir.path().canonicalize().unwrap();

  let mut proc = Process::spawn(&["pwd"]).unwrap();
  proc.chdir(&target).unwrap();
  proc.release(None).unwrap();

  let out = read_to_eof(&mut proc, 10);
  assert!(
    contains(&out, target.as_os_str().as_encoded_bytes()),
    "pwd printed {:?}",
    String::from_utf8_lossy(&out)
  );

  let (eof, status) = proc.eof(WaitPolicy::Hang);
  assert!(eof);
  assert_eq!(status.unwrap().kind(), StatusKind::Exited);
  proc.close().unwrap();
}

#[test]
#[file_serial]
fn chdir_errors_come_back_with_their_errno() {
  let mut proc = Process::spawn(&["pwd"]).unwrap();
  let err = proc
    .chdir("/porch-no-such-directory")
    .expect_err("chdir to nowhere should fail");
  assert_eq!(err.errno(), Some(nix::errno::Errno::ENOENT));

  proc.release(None).unwrap();
  read_to_eof(&mut proc, 10);
  proc.close().unwrap();
}

#[test]
#[file_serial]
fn ignored_interrupts_do_not_kill_and_deliberate_signals_are_not_errors() {
  let mut proc = Process::spawn(&[ECHO_PROMPT]).unwrap();
  proc.sigcatch(false, sigbit(libc::SIGINT)).unwrap();
  assert_eq!(proc.caught_mask() & sigbit(libc::SIGINT), 0);
  proc.release(None).unwrap();

  read_until(&mut proc, b">> ", 10);

  // With SIGINT ignored pre-exec the fixture leaves the disposition
  // alone, so this interrupt goes nowhere.
  proc.signal(libc::SIGINT).unwrap();
  let mut acc = Vec::new();
  proc
    .read(Some(Duration::from_secs(2)), |chunk| {
      if let Some(chunk) = chunk {
        acc.extend_from_slice(chunk);
      }
      false
    })
    .unwrap();
  assert!(!proc.saw_eof(), "ignored SIGINT ended the session");
  assert!(!contains(&acc, b"Interrupt caught"));

  // A signal the controller sent itself must not read as a failure.
  proc.signal(libc::SIGKILL).unwrap();
  read_to_eof(&mut proc, 10);
  let (eof, status) = proc.eof(WaitPolicy::Hang);
  assert!(eof);
  let status = status.unwrap();
  assert_eq!(status.kind(), StatusKind::Signaled);
  assert_eq!(status.code(), libc::SIGKILL);

  proc.close().unwrap();
}

#[test]
#[file_serial]
fn sigcatch_can_hand_interrupts_back() {
  let mut proc = Process::spawn(&[ECHO_PROMPT]).unwrap();
  proc.sigcatch(false, sigbit(libc::SIGINT)).unwrap();
  proc.sigcatch(true, sigbit(libc::SIGINT)).unwrap();
  assert_ne!(proc.caught_mask() & sigbit(libc::SIGINT), 0);
  proc.release(None).unwrap();

  read_until(&mut proc, b">> ", 10);
  proc.signal(libc::SIGINT).unwrap();
  read_until(&mut proc, b"Interrupt caught", 10);

  proc.signal(libc::SIGKILL).unwrap();
  read_to_eof(&mut proc, 10);
  proc.close().unwrap();
}

#[test]
#[file_serial]
fn close_escalates_to_sigkill_after_the_grace_period() {
  let mut proc = Process::spawn(&[ECHO_PROMPT]).unwrap();
  proc.sigcatch(false, sigbit(libc::SIGINT)).unwrap();
  proc.release(None).unwrap();
  read_until(&mut proc, b">> ", 10);

  let start = Instant::now();
  proc.close().unwrap();
  let elapsed = start.elapsed();
  assert!(
    elapsed >= Duration::from_secs(4),
    "close came back in {elapsed:?}, before the SIGINT grace period"
  );
  assert!(
    elapsed < Duration::from_secs(10),
    "close took {elapsed:?}, escalation never fired"
  );
}

#[test]
#[file_serial]
fn setmask_applies_before_exec() {
  let mask = sigbit(libc::SIGUSR1) | sigbit(libc::SIGUSR2);
  let mut proc = Process::spawn(&[SIGCHECK, "-c"]).unwrap();
  proc.sigmask(mask).unwrap();
  assert_eq!(proc.blocked_mask() & mask, mask);
  proc.release(None).unwrap();

  let out = read_to_eof(&mut proc, 10);
  assert!(
    contains(&out, b"2 signals blocked"),
    "sigcheck printed {:?}",
    String::from_utf8_lossy(&out)
  );

  let (_, status) = proc.eof(WaitPolicy::Hang);
  assert_eq!(status.unwrap().code(), 0);
  proc.close().unwrap();
}

#[test]
#[file_serial]
fn env_setup_rides_along_with_release() {
  let mut proc = Process::spawn(&["sh", "-c", "echo marker=$PORCH_SPAWN_CHECK"]).unwrap();
  let env = EnvSpec {
    clear: false,
    set: vec![("PORCH_SPAWN_CHECK".into(), "granted".into())],
    unset: vec![],
  };
  proc.release(Some(&env)).unwrap();

  let out = read_to_eof(&mut proc, 10);
  assert!(
    contains(&out, b"marker=granted"),
    "child saw {:?}",
    String::from_utf8_lossy(&out)
  );
  proc.close().unwrap();
}

#[test]
#[file_serial]
fn setid_to_current_ids_is_a_permitted_noop() {
  let uid = nix::unistd::getuid().as_raw();
  let gid = nix::unistd::getgid().as_raw();

  let mut proc = Process::spawn(&["id", "-u"]).unwrap();
  proc.setid(Some(uid), Some(gid)).unwrap();
  proc.release(None).unwrap();

  let out = read_to_eof(&mut proc, 10);
  assert!(
    contains(&out, uid.to_string().as_bytes()),
    "id printed {:?}",
    String::from_utf8_lossy(&out)
  );
  proc.close().unwrap();
}

#[test]
#[file_serial]
fn read_timeout_is_a_minimum_and_not_an_error() {
  let mut proc = Process::spawn(&["cat"]).unwrap();
  proc.release(None).unwrap();

  let start = Instant::now();
  proc
    .read(Some(Duration::from_millis(10)), |_| {
      panic!("no output was expected")
    })
    .unwrap();
  // Sub-second timeouts are promoted to a full second.
  assert!(start.elapsed() >= Duration::from_secs(1));
  assert!(!proc.saw_eof());

  proc.close().unwrap();
}

#[test]
#[file_serial]
fn window_size_round_trips_through_the_master() {
  let mut proc = Process::spawn(&["cat"]).unwrap();
  {
    let mut term = proc.term().unwrap();
    assert_eq!(term.set_size(120, 40).unwrap(), (120, 40));
    assert_eq!(term.size().unwrap(), (120, 40));
  }
  proc.release(None).unwrap();
  proc.close().unwrap();
}

#[test]
#[file_serial]
fn proxy_interleaves_until_child_exit() {
  let mut proc = Process::spawn(&["sh", "-c", "echo from-child; exit 0"]).unwrap();
  proc.release(None).unwrap();

  // Keep the write end open so the input side stays quiet instead of
  // hitting EOF and aborting the proxy.
  let (input_rd, _input_wr) = nix::unistd::pipe().unwrap();

  let mut output = Vec::new();
  let mut input_done = false;
  let clean = proc
    .proxy(
      &input_rd,
      |chunk| {
        if let Some(chunk) = chunk {
          output.extend_from_slice(chunk);
        }
      },
      |chunk| {
        if chunk.is_none() {
          input_done = true;
        }
      },
      None,
    )
    .unwrap();

  assert!(clean, "child exited zero, proxy should report success");
  assert!(contains(&output, b"from-child"));
  assert!(input_done, "input side was told to wrap up");

  proc.close().unwrap();
}

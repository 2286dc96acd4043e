//! Parent-side mirror of the child's terminal attributes.
//!
//! All attribute mutations cross the control socket as a full `termios`
//! struct; the window size is an ioctl against the pty master and stays
//! local. Control characters travel in caret notation (`"^X"`, `"^?"`,
//! empty for disabled) except the literal MIN/TIME fields.

use nix::errno::Errno;
use nix::libc;

use crate::errors::{Error, Result};
use crate::process::Process;

cfg_if::cfg_if! {
  if #[cfg(any(target_os = "linux", target_os = "android"))] {
    const VDISABLE: libc::cc_t = 0;
  } else {
    const VDISABLE: libc::cc_t = 0xff;
  }
}

const DEL: libc::cc_t = 0o177;

struct CntrlChar {
  idx: usize,
  name: &'static str,
  /// Plain integer on the wire rather than caret notation.
  literal: bool,
}

macro_rules! cntrl_entry {
  ($idx:ident) => {
    CntrlChar {
      idx: libc::$idx,
      name: stringify!($idx),
      literal: false,
    }
  };
  ($idx:ident, literal) => {
    CntrlChar {
      idx: libc::$idx,
      name: stringify!($idx),
      literal: true,
    }
  };
}

const CNTRL_CHARS: &[CntrlChar] = &[
  cntrl_entry!(VEOF),
  cntrl_entry!(VEOL),
  cntrl_entry!(VERASE),
  cntrl_entry!(VINTR),
  cntrl_entry!(VKILL),
  cntrl_entry!(VMIN, literal),
  cntrl_entry!(VQUIT),
  cntrl_entry!(VSUSP),
  cntrl_entry!(VTIME, literal),
  cntrl_entry!(VSTART),
  cntrl_entry!(VSTOP),
  #[cfg(any(
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "macos"
  ))]
  cntrl_entry!(VSTATUS),
];

/// One control-character value as it appears at the API boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CcValue {
  /// MIN/TIME style count.
  Literal(u8),
  /// `"^X"`, `"^?"`, or `""` for disabled.
  Notation(String),
}

/// Overlay for [`Terminal::update`]: absent fields keep their mirrored
/// value.
#[derive(Debug, Default, Clone)]
pub struct TermUpdate {
  pub input_flags: Option<libc::tcflag_t>,
  pub output_flags: Option<libc::tcflag_t>,
  pub control_flags: Option<libc::tcflag_t>,
  pub local_flags: Option<libc::tcflag_t>,
  pub control_chars: Vec<(String, CcValue)>,
}

/// Mirror of the child's `termios` plus the cached window size.
pub(crate) struct TermState {
  pub(crate) termios: libc::termios,
  pub(crate) winsz: libc::winsize,
  pub(crate) winsz_valid: bool,
}

impl TermState {
  pub(crate) fn new(termios: libc::termios) -> Self {
    Self {
      termios,
      winsz: libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
      },
      winsz_valid: false,
    }
  }
}

/// Borrowed view over a process's terminal mirror; obtained from
/// [`Process::term`].
#[derive(Debug)]
pub struct Terminal<'p> {
  pub(crate) proc: &'p mut Process,
}

impl Terminal<'_> {
  pub fn input_flags(&self) -> libc::tcflag_t {
    self.proc.term_state().termios.c_iflag
  }

  pub fn output_flags(&self) -> libc::tcflag_t {
    self.proc.term_state().termios.c_oflag
  }

  pub fn control_flags(&self) -> libc::tcflag_t {
    self.proc.term_state().termios.c_cflag
  }

  pub fn local_flags(&self) -> libc::tcflag_t {
    self.proc.term_state().termios.c_lflag
  }

  /// The full control-character table in wire order.
  pub fn control_chars(&self) -> Vec<(&'static str, CcValue)> {
    let termios = &self.proc.term_state().termios;
    CNTRL_CHARS
      .iter()
      .map(|entry| (entry.name, decode_cc(entry, termios.c_cc[entry.idx])))
      .collect()
  }

  pub fn control_char(&self, name: &str) -> Option<CcValue> {
    let termios = &self.proc.term_state().termios;
    CNTRL_CHARS
      .iter()
      .find(|entry| entry.name == name)
      .map(|entry| decode_cc(entry, termios.c_cc[entry.idx]))
  }

  /// Overlay `update` onto the mirror and push the result to the child,
  /// waiting for its acknowledgment.
  pub fn update(&mut self, update: &TermUpdate) -> Result<()> {
    let mut updated = self.proc.term_state().termios;
    if let Some(flags) = update.input_flags {
      updated.c_iflag = flags;
    }
    if let Some(flags) = update.output_flags {
      updated.c_oflag = flags;
    }
    if let Some(flags) = update.control_flags {
      updated.c_cflag = flags;
    }
    if let Some(flags) = update.local_flags {
      updated.c_lflag = flags;
    }
    for (name, value) in &update.control_chars {
      let entry = CNTRL_CHARS
        .iter()
        .find(|entry| entry.name == name)
        .ok_or_else(|| Error::UnknownControlChar { name: name.clone() })?;
      updated.c_cc[entry.idx] = encode_cc(entry, value)?;
    }

    self.proc.term_state_mut().termios = updated;
    self.proc.push_termios(updated)
  }

  /// Current `(cols, rows)`, querying the pty on first use.
  pub fn size(&mut self) -> Result<(u16, u16)> {
    self.refresh_winsz()?;
    let winsz = &self.proc.term_state().winsz;
    Ok((winsz.ws_col, winsz.ws_row))
  }

  /// Resize the pty; the kernel signals the child with SIGWINCH.
  pub fn set_size(&mut self, cols: u16, rows: u16) -> Result<(u16, u16)> {
    self.refresh_winsz()?;
    let fd = self.proc.master_raw().ok_or(Error::PtyClosed)?;
    let state = self.proc.term_state_mut();
    state.winsz.ws_col = cols;
    state.winsz.ws_row = rows;
    let winsz = state.winsz;
    Errno::result(unsafe { libc::ioctl(fd, libc::TIOCSWINSZ as _, &winsz) })?;
    Ok((cols, rows))
  }

  fn refresh_winsz(&mut self) -> Result<()> {
    if self.proc.term_state().winsz_valid {
      return Ok(());
    }
    let fd = self.proc.master_raw().ok_or(Error::PtyClosed)?;
    let mut winsz = libc::winsize {
      ws_row: 0,
      ws_col: 0,
      ws_xpixel: 0,
      ws_ypixel: 0,
    };
    Errno::result(unsafe { libc::ioctl(fd, libc::TIOCGWINSZ as _, &mut winsz) })?;
    let state = self.proc.term_state_mut();
    state.winsz = winsz;
    state.winsz_valid = true;
    Ok(())
  }
}

fn decode_cc(entry: &CntrlChar, cc: libc::cc_t) -> CcValue {
  if entry.literal {
    CcValue::Literal(cc)
  } else if cc == VDISABLE {
    CcValue::Notation(String::new())
  } else if cc == DEL {
    CcValue::Notation("^?".to_string())
  } else {
    CcValue::Notation(format!("^{}", (cc.wrapping_add(0x40)) as char))
  }
}

fn encode_cc(entry: &CntrlChar, value: &CcValue) -> Result<libc::cc_t> {
  if entry.literal {
    return match value {
      CcValue::Literal(cc) => Ok(*cc),
      CcValue::Notation(_) => Err(Error::LiteralControlChar { name: entry.name }),
    };
  }

  let CcValue::Notation(text) = value else {
    return Err(Error::MalformedControlChar {
      name: entry.name,
      value: format!("{value:?}"),
    });
  };

  let bytes = text.as_bytes();
  if bytes.is_empty() {
    return Ok(VDISABLE);
  }
  if bytes.len() != 2 || bytes[0] != b'^' {
    return Err(Error::MalformedControlChar {
      name: entry.name,
      value: text.clone(),
    });
  }
  match bytes[1] {
    b'?' => Ok(DEL),
    c @ 0x40..=0x5f => Ok(c - 0x40),
    _ => Err(Error::ControlCharRange {
      name: entry.name,
      value: text.clone(),
    }),
  }
}

#[cfg(test)]
mod tests {
  use rstest::rstest;

  use super::*;

  fn entry(name: &str) -> &'static CntrlChar {
    CNTRL_CHARS.iter().find(|e| e.name == name).unwrap()
  }

  #[rstest]
  #[case(0x04, "^D")]
  #[case(0x03, "^C")]
  #[case(DEL, "^?")]
  fn caret_notation_decodes(#[case] cc: libc::cc_t, #[case] expect: &str) {
    assert_eq!(
      decode_cc(entry("VEOF"), cc),
      CcValue::Notation(expect.to_string())
    );
  }

  #[test]
  fn disabled_decodes_to_empty() {
    assert_eq!(
      decode_cc(entry("VINTR"), VDISABLE),
      CcValue::Notation(String::new())
    );
  }

  #[test]
  fn literal_fields_decode_to_numbers() {
    assert_eq!(decode_cc(entry("VMIN"), 1), CcValue::Literal(1));
    assert_eq!(decode_cc(entry("VTIME"), 0), CcValue::Literal(0));
  }

  #[rstest]
  #[case("^C", 0x03)]
  #[case("^D", 0x04)]
  #[case("^?", DEL)]
  #[case("", VDISABLE)]
  fn caret_notation_encodes(#[case] text: &str, #[case] expect: libc::cc_t) {
    let value = CcValue::Notation(text.to_string());
    assert_eq!(encode_cc(entry("VINTR"), &value).unwrap(), expect);
  }

  #[test]
  fn malformed_notation_is_rejected() {
    let value = CcValue::Notation("x".to_string());
    assert!(matches!(
      encode_cc(entry("VINTR"), &value),
      Err(Error::MalformedControlChar { name: "VINTR", .. })
    ));
  }

  #[test]
  fn out_of_bounds_caret_char_is_rejected() {
    let value = CcValue::Notation("^a".to_string());
    assert!(matches!(
      encode_cc(entry("VINTR"), &value),
      Err(Error::ControlCharRange { name: "VINTR", .. })
    ));
  }

  #[test]
  fn literal_fields_reject_notation() {
    let value = CcValue::Notation("^C".to_string());
    assert!(matches!(
      encode_cc(entry("VMIN"), &value),
      Err(Error::LiteralControlChar { name: "VMIN" })
    ));
  }

  #[test]
  fn every_entry_roundtrips_its_default_style() {
    for entry in CNTRL_CHARS {
      let decoded = decode_cc(entry, 0x03);
      let encoded = encode_cc(entry, &decoded).unwrap();
      assert_eq!(encoded, 0x03, "cc {}", entry.name);
    }
  }
}

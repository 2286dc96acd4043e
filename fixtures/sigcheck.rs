//! Reports which signals are blocked in the current mask.
//!
//! `-b` prints the blocked signal numbers, `-c` just the count, no flag
//! prints one line per signal.

use std::mem::MaybeUninit;

use nix::libc;

fn usage() -> ! {
  eprintln!("usage: sigcheck [-b | -c]");
  std::process::exit(1);
}

fn main() {
  let mode = match std::env::args().nth(1).as_deref() {
    None => "",
    Some("-b") => "-b",
    Some("-c") => "-c",
    Some(_) => usage(),
  };

  let mask = unsafe {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    if libc::sigprocmask(libc::SIG_BLOCK, std::ptr::null(), set.as_mut_ptr()) != 0 {
      eprintln!("sigprocmask: {}", std::io::Error::last_os_error());
      std::process::exit(1);
    }
    set.assume_init()
  };

  let mut output = 0;
  for signo in 1.. {
    let blocked = match unsafe { libc::sigismember(&mask, signo) } {
      -1 => break,
      0 => false,
      _ => true,
    };
    match mode {
      "-b" => {
        if blocked {
          print!("{}{}", if output > 0 { " " } else { "" }, signo);
          output += 1;
        }
      }
      "-c" => {
        if blocked {
          output += 1;
        }
      }
      _ => {
        if blocked {
          println!("Signal {signo} is blocked");
        } else {
          println!("Signal {signo} is not blocked");
        }
      }
    }
  }

  match mode {
    "-b" => println!(),
    "-c" => println!(
      "{} signal{} blocked",
      output,
      if output == 1 { "" } else { "s" }
    ),
    _ => {}
  }
}

//! Stand-in for the real transcoder binary, used only by the black-box
//! integration tests under `crates/relay/tests/`.
//!
//! Reads its own invocation's last argument (the RTMP URL `build_args`
//! appends) for a handful of `key=value` query-string knobs that let a test
//! control its behavior without touching global process state:
//!
//! - `fatal_after=N`: once `N` bytes have been read from standard input,
//!   print a recognized fatal ingest signal to standard error and exit.
//! - `stall_after=N`: once `N` bytes have been read from standard input,
//!   stop reading forever, so the real process's standard-input pipe fills
//!   up and exercises backpressure.
//!
//! Otherwise behaves like a well-behaved transcoder: immediately announces
//! `Stream mapping:` (confirming "streaming" to the classifier), then echoes
//! periodic `frame=`/`fps=` progress lines as it drains standard input.

use std::{
    env, io::{self, Read},
    thread,
    time::Duration,
};

fn knob(url: &str, key: &str) -> Option<u64> {
    let needle = format!("{key}=");
    let start = url.find(&needle)? + needle.len();
    url[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()
}

fn main() {
    let url = env::args().last().unwrap_or_default();
    let fatal_after = knob(&url, "fatal_after");
    let stall_after = knob(&url, "stall_after");

    eprintln!("Stream mapping: Input #0 -> Output #0");

    let mut stdin = io::stdin();
    let mut buf = [0u8; 4096];
    let mut total: u64 = 0;
    let mut frame: u64 = 0;

    loop {
        if stall_after.is_some_and(|n| total >= n) {
            loop {
                thread::sleep(Duration::from_secs(3600));
            }
        }

        match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                frame += 1;
                if frame % 4 == 0 {
                    eprintln!(
                        "frame={frame} fps=30 q=-1.0 size=100kB \
                         time=00:00:01.00 bitrate=100.0kbits/s speed=1.0x",
                    );
                }
                if fatal_after.is_some_and(|n| total >= n) {
                    eprintln!("Connection refused while writing to output");
                    std::process::exit(1);
                }
            }
            Err(e) => {
                eprintln!("read error: {e}");
                break;
            }
        }
    }
}

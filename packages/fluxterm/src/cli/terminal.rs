use std::io::{self, Stdout, Write};

use anyhow::{Context as _, Result};
use nix::libc;
use nix::sys::termios::{self, SetArg, Termios};
use tracing::debug;

nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);

/// The local terminal while a session is attached.
///
/// Stdin is switched to raw mode on [`Console::attach`] and the saved
/// settings come back on drop. Piped stdin has nothing to save and is
/// left alone.
pub struct Console {
    saved: Option<Termios>,
    stdout: Stdout,
}

impl Console {
    pub fn attach() -> Self {
        let stdin = io::stdin();
        let saved = termios::tcgetattr(&stdin).ok();
        if let Some(saved) = &saved {
            let mut raw = saved.clone();
            termios::cfmakeraw(&mut raw);
            if let Err(e) = termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw) {
                debug!(error = %e, "raw mode unavailable");
            }
        }
        Self {
            saved,
            stdout: io::stdout(),
        }
    }

    /// Device output, passed through untouched.
    pub fn write(&mut self, bytes: &[u8]) {
        let mut out = self.stdout.lock();
        if let Err(e) = out.write_all(bytes).and_then(|()| out.flush()) {
            debug!(error = %e, "stdout write failed");
        }
    }

    pub fn notice(&mut self, text: &str) {
        self.write(notice_line(text).as_bytes());
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        if let Some(saved) = &self.saved {
            let _ = termios::tcsetattr(&io::stdin(), SetArg::TCSADRAIN, saved);
        }
    }
}

/// Dimmed and on its own line so it stands apart from device output.
/// Raw mode needs the explicit `\r`.
fn notice_line(text: &str) -> String {
    format!("\r\n\x1b[2m[fluxterm: {text}]\x1b[0m\r\n")
}

/// Window size of stdout as (cols, rows).
pub fn terminal_size() -> Result<(u16, u16)> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ only writes into `ws`.
    unsafe { tiocgwinsz(libc::STDOUT_FILENO, &mut ws) }.context("stdout is not a terminal")?;
    window_dims(&ws).context("terminal reported a zero size")
}

fn window_dims(ws: &libc::winsize) -> Option<(u16, u16)> {
    (ws.ws_col > 0 && ws.ws_row > 0).then_some((ws.ws_col, ws.ws_row))
}

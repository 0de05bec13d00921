use std::io::{self, Read, Write};

use gag::BufferRedirect;

use super::CapturedOutput;

/// Redirects the process's stdout and stderr into buffers while an attempt
/// runs, then replays what was captured onto the real streams.
///
/// Redirection is process-wide and does not nest: while one attempt captures,
/// attempts started inside it, or on other threads, capture nothing.
pub(crate) struct OutputCapture {
    stdout: Option<BufferRedirect>,
    stderr: Option<BufferRedirect>,
}

impl OutputCapture {
    pub(crate) fn start() -> Self {
        flush();
        Self {
            stdout: BufferRedirect::stdout().ok(),
            stderr: BufferRedirect::stderr().ok(),
        }
    }

    pub(crate) fn finish(self) -> Option<CapturedOutput> {
        if self.stdout.is_none() && self.stderr.is_none() {
            return None;
        }
        flush();
        let stdout = drain(self.stdout);
        let stderr = drain(self.stderr);

        let _ = io::stdout().write_all(stdout.as_bytes());
        let _ = io::stderr().write_all(stderr.as_bytes());
        flush();
        Some(CapturedOutput {
            stdout,
            stderr,
            exit_code: None,
        })
    }
}

fn flush() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

/// Reads everything captured and restores the stream.
fn drain(redirect: Option<BufferRedirect>) -> String {
    let Some(mut redirect) = redirect else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = redirect.read_to_end(&mut buf);
    drop(redirect);
    String::from_utf8_lossy(&buf).into_owned()
}

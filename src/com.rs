// src/com.rs
//
// Host-side plumbing: the polled command channel, the reply format, and the
// G-code file stack behind M32/M99. Reads never block; the control loop
// polls from its idle cycles. An async reader task (spawned in main) feeds
// the channel from stdin or a serial pipe.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use tokio::sync::mpsc;

/// Reply to exactly one G-code command.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok,
    /// `ok key:value ...`
    OkWith(Vec<(String, String)>),
    /// `!! reason`
    Error(String),
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::Ok => write!(f, "ok"),
            Response::OkWith(fields) => {
                write!(f, "ok")?;
                for (k, v) in fields {
                    write!(f, " {}:{}", k, v)?;
                }
                Ok(())
            }
            Response::Error(reason) => write!(f, "!! {}", reason),
        }
    }
}

/// Non-blocking view of the host connection. Lines arrive over an unbounded
/// channel; EOF is observed when the sending side hangs up.
pub struct HostChannel {
    rx: mpsc::UnboundedReceiver<String>,
    out: Box<dyn Write + Send>,
    eof: bool,
}

impl std::fmt::Debug for HostChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostChannel").field("eof", &self.eof).finish()
    }
}

impl HostChannel {
    pub fn new(rx: mpsc::UnboundedReceiver<String>, out: Box<dyn Write + Send>) -> Self {
        Self { rx, out, eof: false }
    }

    /// Channel pair for tests and embedding: push lines through the sender.
    pub fn pipe(out: Box<dyn Write + Send>) -> (mpsc::UnboundedSender<String>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx, out))
    }

    /// Next pending line, if any. Never blocks.
    pub fn try_recv(&mut self) -> Option<String> {
        match self.rx.try_recv() {
            Ok(line) => Some(line),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.eof = true;
                None
            }
        }
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn reply(&mut self, response: &Response) {
        tracing::debug!("reply: {}", response);
        if let Err(e) = writeln!(self.out, "{}", response).and_then(|_| self.out.flush()) {
            tracing::warn!("failed to write reply to host: {}", e);
        }
    }
}

/// Stack of G-code files being printed. M32 pushes, M99 pops, and files
/// that run dry pop themselves. Only the top file is read.
#[derive(Debug, Default)]
pub struct GcodeFileStack {
    files: Vec<std::io::Lines<BufReader<File>>>,
}

impl GcodeFileStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: &str) -> std::io::Result<()> {
        let path = PathBuf::from(path);
        let file = File::open(&path)?;
        tracing::info!("printing from {}", path.display());
        self.files.push(BufReader::new(file).lines());
        Ok(())
    }

    /// M99: return from the current subprogram. False at the top level.
    pub fn pop(&mut self) -> bool {
        self.files.pop().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Next line from the top file, popping exhausted files along the way.
    pub fn next_line(&mut self) -> Option<String> {
        while let Some(top) = self.files.last_mut() {
            match top.next() {
                Some(Ok(line)) => return Some(line),
                Some(Err(e)) => {
                    tracing::warn!("error reading gcode file: {}", e);
                    self.files.pop();
                }
                None => {
                    self.files.pop();
                }
            }
        }
        None
    }
}

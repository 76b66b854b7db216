//! Line-oriented command sources and the stack discipline around them.
//!
//! A source hands out at most one parsed command at a time; the command
//! stays pending until the interpreter completes it (possibly several
//! cycles later, when the planner was busy). Replies go back to the source
//! that issued the command. Sources carry an identity token so `M99` can
//! compare "the source being popped" with "the source that sent this"
//! before popping, never after.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};

use super::{parse_line, Command, Response};

/// Address-equivalent handle for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceId(usize);

static NEXT_SOURCE_ID: AtomicUsize = AtomicUsize::new(1);

fn next_id() -> SourceId {
    SourceId(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
}

/// Host side of an in-memory source: push command lines in, collect replies.
#[derive(Clone)]
pub struct ChannelHandle {
    lines: Sender<String>,
    replies: Arc<Mutex<VecDeque<String>>>,
}

impl ChannelHandle {
    pub fn send_line(&self, line: impl Into<String>) {
        let _ = self.lines.send(line.into());
    }

    pub fn take_replies(&self) -> Vec<String> {
        self.replies.lock().unwrap().drain(..).collect()
    }
}

enum Backend {
    Channel {
        rx: Receiver<String>,
        replies: Arc<Mutex<VecDeque<String>>>,
    },
    File {
        reader: BufReader<File>,
    },
    Stdin {
        buffer: Vec<u8>,
    },
}

pub struct CommandSource {
    id: SourceId,
    backend: Backend,
    pending: Option<Command>,
    eof: bool,
}

impl CommandSource {
    /// In-memory source, for the host link and for tests.
    pub fn channel() -> (CommandSource, ChannelHandle) {
        let (tx, rx) = std::sync::mpsc::channel();
        let replies = Arc::new(Mutex::new(VecDeque::new()));
        let source = CommandSource {
            id: next_id(),
            backend: Backend::Channel {
                rx,
                replies: replies.clone(),
            },
            pending: None,
            eof: false,
        };
        (
            source,
            ChannelHandle {
                lines: tx,
                replies,
            },
        )
    }

    /// G-code file source (`M32`, or a file given on the command line).
    /// Replies to file sources are discarded.
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<CommandSource> {
        let file = File::open(path)?;
        Ok(CommandSource {
            id: next_id(),
            backend: Backend::File {
                reader: BufReader::new(file),
            },
            pending: None,
            eof: false,
        })
    }

    /// Non-blocking stdin source; replies go to stdout.
    pub fn stdin() -> CommandSource {
        // the producer polls many sources per cycle, so stdin must not block
        unsafe {
            let flags = libc::fcntl(libc::STDIN_FILENO, libc::F_GETFL);
            if flags >= 0 {
                libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        CommandSource {
            id: next_id(),
            backend: Backend::Stdin { buffer: Vec::new() },
            pending: None,
            eof: false,
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    /// End of stream reached and no command is pending.
    pub fn is_exhausted(&self) -> bool {
        self.eof && self.pending.is_none()
    }

    /// The command waiting to be interpreted, pulling one line from the
    /// stream if none is pending. Blank and comment lines are skipped.
    pub fn pending(&mut self) -> Option<&Command> {
        while self.pending.is_none() {
            match self.read_line() {
                Some(line) => self.pending = parse_line(&line),
                None => break,
            }
        }
        self.pending.as_ref()
    }

    /// Finish the pending command, optionally sending a reply.
    pub fn complete(&mut self, response: Option<&Response>) {
        self.pending = None;
        if let Some(response) = response {
            self.reply(response);
        }
    }

    pub fn reply(&mut self, response: &Response) {
        match &mut self.backend {
            Backend::Channel { replies, .. } => {
                replies.lock().unwrap().push_back(response.to_string());
            }
            Backend::File { .. } => {
                tracing::debug!(%response, "reply to file source dropped");
            }
            Backend::Stdin { .. } => {
                println!("{response}");
            }
        }
    }

    fn read_line(&mut self) -> Option<String> {
        if self.eof {
            return None;
        }
        match &mut self.backend {
            Backend::Channel { rx, .. } => match rx.try_recv() {
                Ok(line) => Some(line),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => {
                    self.eof = true;
                    None
                }
            },
            Backend::File { reader } => {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) => {
                        self.eof = true;
                        None
                    }
                    Ok(_) => Some(line),
                    Err(err) => {
                        tracing::warn!(%err, "file source read failed");
                        self.eof = true;
                        None
                    }
                }
            }
            Backend::Stdin { buffer } => {
                let mut chunk = [0u8; 256];
                loop {
                    if let Some(at) = buffer.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=at).collect();
                        return Some(String::from_utf8_lossy(&line).into_owned());
                    }
                    match std::io::stdin().lock().read(&mut chunk) {
                        Ok(0) => {
                            self.eof = true;
                            return None;
                        }
                        Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            return None;
                        }
                        Err(err) => {
                            tracing::warn!(%err, "stdin read failed");
                            self.eof = true;
                            return None;
                        }
                    }
                }
            }
        }
    }
}

//! In-memory instrument links for unit tests.

use crate::instrument_link::{InstrumentLink, LinkError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

struct Inner {
    written: Vec<Vec<u8>>,
    pending: VecDeque<u8>,
    responder: Responder,
    broken: bool,
}

/// A link whose device side is a closure: every write is recorded and handed
/// to the responder, whose reply (if any) becomes readable input.
///
/// Reads never block: if the requested data is not already pending the read
/// fails with `LinkError::Timeout`, just like a silent instrument would.
#[derive(Clone)]
pub struct ScriptedLink {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedLink {
    pub fn new(responder: impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                written: Vec::new(),
                pending: VecDeque::new(),
                responder: Box::new(responder),
                broken: false,
            })),
        }
    }

    /// A device that never answers.
    pub fn silent() -> Self {
        Self::new(|_| None)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// Every write as text with line terminators removed.
    pub fn written_lines(&self) -> Vec<String> {
        self.written()
            .iter()
            .map(|w| {
                String::from_utf8_lossy(w)
                    .trim_end_matches(['\r', '\n'])
                    .to_string()
            })
            .collect()
    }

    pub fn push_input(&self, bytes: &[u8]) {
        self.lock().pending.extend(bytes.iter().copied());
    }

    /// Make every later write fail as if the cable was pulled.
    pub fn break_link(&self) {
        self.lock().broken = true;
    }
}

impl InstrumentLink for ScriptedLink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut inner = self.lock();
        if inner.broken {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "link broken").into());
        }
        inner.written.push(bytes.to_vec());
        let reply = (inner.responder)(bytes);
        if let Some(reply) = reply {
            inner.pending.extend(reply);
        }
        Ok(())
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        let mut inner = self.lock();
        match inner.pending.iter().position(|b| *b == terminator) {
            Some(index) => {
                let mut line: Vec<u8> = inner.pending.drain(..=index).collect();
                line.pop();
                Ok(line)
            }
            None => {
                let received: Vec<u8> = inner.pending.drain(..).collect();
                Err(LinkError::Timeout {
                    expected: format!("{:?}", terminator as char),
                    received: String::from_utf8_lossy(&received).to_string(),
                    timeout,
                })
            }
        }
    }

    fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        let mut inner = self.lock();
        if inner.pending.len() < len {
            return Err(LinkError::Timeout {
                expected: format!("{len} bytes"),
                received: format!("{} bytes", inner.pending.len()),
                timeout,
            });
        }
        Ok(inner.pending.drain(..len).collect())
    }

    fn clear_input(&mut self) -> Result<(), LinkError> {
        self.lock().pending.clear();
        Ok(())
    }
}

/// Reply to matching text commands with a fixed line.
pub fn line_responder(
    replies: Vec<(&'static str, &'static str)>,
) -> impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static {
    move |written| {
        let command = String::from_utf8_lossy(written);
        let command = command.trim();
        replies
            .iter()
            .find(|(query, _)| *query == command)
            .map(|(_, reply)| format!("{reply}\n").into_bytes())
    }
}

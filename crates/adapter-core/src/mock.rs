//! Scripted serial port for driver tests.
//!
//! [`ScriptedPort`] implements `AsyncRead + AsyncWrite`. Bytes written to it are
//! split into commands on a terminator, recorded, and answered from a script:
//! fixed replies per command, raw-byte rules for commands without a
//! terminator, or a responder closure for stateful device simulations. A
//! command with no scripted reply gets no reply at all, which is how timeout
//! paths are exercised.
//!
//! ```rust,ignore
//! let (port, script) = ScriptedPort::new(b"\r");
//! script.on("01RAT", "\x0201S00300UH\x03");
//! let transport = SharedTransport::from_port("pump", Box::new(port), Default::default());
//! // ... drive the adapter ...
//! assert_eq!(script.write_count(), 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

type Responder = Box<dyn FnMut(&str) -> Option<Vec<u8>> + Send>;

struct ScriptState {
    terminator: Vec<u8>,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
    replies: HashMap<String, VecDeque<Vec<u8>>>,
    raw: Vec<(Vec<u8>, Vec<u8>)>,
    responder: Option<Responder>,
    writes: Vec<String>,
    read_waker: Option<Waker>,
    closed: bool,
}

impl ScriptState {
    fn reply_for(&mut self, command: &str) -> Option<Vec<u8>> {
        if let Some(queue) = self.replies.get_mut(command) {
            // last scripted reply is sticky
            return if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
        }
        self.responder.as_mut().and_then(|respond| respond(command))
    }

    fn frame_commands(&mut self) {
        loop {
            let raw_hit = self
                .raw
                .iter()
                .find(|(bytes, _)| self.inbound.starts_with(bytes))
                .cloned();
            if let Some((bytes, reply)) = raw_hit {
                self.inbound.drain(..bytes.len());
                self.writes.push(String::from_utf8_lossy(&bytes).into_owned());
                self.outbound.extend(reply);
                continue;
            }

            let term = self.terminator.len();
            let Some(pos) = self
                .inbound
                .windows(term)
                .position(|window| window == self.terminator.as_slice())
            else {
                break;
            };
            let frame: Vec<u8> = self.inbound.drain(..pos + term).collect();
            let command = String::from_utf8_lossy(&frame[..pos]).into_owned();
            if let Some(reply) = self.reply_for(&command) {
                self.outbound.extend(reply);
            }
            self.writes.push(command);
        }

        if !self.outbound.is_empty() {
            if let Some(waker) = self.read_waker.take() {
                waker.wake();
            }
        }
    }
}

/// Fake serial port answering from a script.
pub struct ScriptedPort {
    state: Arc<Mutex<ScriptState>>,
}

/// Test-side handle for scripting a [`ScriptedPort`] and inspecting writes.
#[derive(Clone)]
pub struct ScriptHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedPort {
    /// New port that splits commands on `terminator`.
    pub fn new(terminator: &[u8]) -> (Self, ScriptHandle) {
        let state = Arc::new(Mutex::new(ScriptState {
            terminator: terminator.to_vec(),
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            replies: HashMap::new(),
            raw: Vec::new(),
            responder: None,
            writes: Vec::new(),
            read_waker: None,
            closed: false,
        }));
        (
            Self {
                state: state.clone(),
            },
            ScriptHandle { state },
        )
    }
}

impl ScriptHandle {
    /// Queue a reply for `command`. Replies are consumed in order; the last
    /// one keeps answering.
    pub fn on(&self, command: &str, reply: impl AsRef<[u8]>) -> &Self {
        self.state
            .lock()
            .replies
            .entry(command.to_string())
            .or_default()
            .push_back(reply.as_ref().to_vec());
        self
    }

    /// Reply to a raw byte sequence that has no terminator.
    pub fn on_raw(&self, bytes: &[u8], reply: impl AsRef<[u8]>) -> &Self {
        self.state
            .lock()
            .raw
            .push((bytes.to_vec(), reply.as_ref().to_vec()));
        self
    }

    /// Answer commands without a scripted reply from a closure.
    pub fn respond_with<F>(&self, responder: F) -> &Self
    where
        F: FnMut(&str) -> Option<Vec<u8>> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
        self
    }

    /// Forget all scripted replies for `command`.
    pub fn forget(&self, command: &str) -> &Self {
        self.state.lock().replies.remove(command);
        self
    }

    /// Bytes that arrive without being asked for.
    pub fn push_unsolicited(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        state.outbound.extend(bytes.iter().copied());
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
    }

    /// Make reads report end of file.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
    }

    /// Commands written so far, without terminators.
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    /// Number of commands written so far.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    /// Forget recorded writes.
    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }
}

impl AsyncRead for ScriptedPort {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.state.lock();
        if state.outbound.is_empty() {
            if state.closed {
                return Poll::Ready(Ok(()));
            }
            state.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = buf.remaining().min(state.outbound.len());
        let chunk: Vec<u8> = state.outbound.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ScriptedPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.state.lock();
        if state.closed {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        state.inbound.extend_from_slice(buf);
        state.frame_commands();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_scripted_reply_and_write_log() {
        let (mut port, script) = ScriptedPort::new(b"\r");
        script.on("01DIA", "\x0201S26.70\x03");

        port.write_all(b"01DIA\r").await.unwrap();

        let mut buf = [0u8; 10];
        port.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x0201S26.70\x03");
        assert_eq!(script.writes(), vec!["01DIA"]);
    }

    #[tokio::test]
    async fn test_reply_sequence_last_is_sticky() {
        let (mut port, script) = ScriptedPort::new(b"\n");
        script.on("ERR?", "5\n").on("ERR?", "0\n");

        let mut buf = [0u8; 2];
        for expected in [b"5\n", b"0\n", b"0\n"] {
            port.write_all(b"ERR?\n").await.unwrap();
            port.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, expected);
        }
    }

    #[tokio::test]
    async fn test_raw_rule_without_terminator() {
        let (mut port, script) = ScriptedPort::new(b"\n");
        script.on_raw(&[0x05], "0\n");

        port.write_all(&[0x05]).await.unwrap();
        let mut buf = [0u8; 2];
        port.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"0\n");
        assert_eq!(script.write_count(), 1);
    }

    #[tokio::test]
    async fn test_unscripted_command_is_silent() {
        let (mut port, script) = ScriptedPort::new(b"\r");
        port.write_all(b"nothing\r").await.unwrap();

        let mut buf = [0u8; 1];
        let res =
            tokio::time::timeout(std::time::Duration::from_millis(20), port.read(&mut buf)).await;
        assert!(res.is_err());
        assert_eq!(script.writes(), vec!["nothing"]);
    }
}

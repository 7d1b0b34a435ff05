//! The shared terminal
//!
//! One shell for the whole server. Input frames from any client are written
//! in call order by a writer thread; a reader thread pushes output chunks to
//! the registered sink in the order the shell produced them.

use bytes::Bytes;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::session::{PtySession, ShellOptions};

const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Output(Bytes),
    /// Sent once; the session is dead for the rest of the process lifetime
    Exited { reason: String },
}

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("Failed to spawn shell: {0}")]
    Spawn(String),
    #[error("Terminal session has exited")]
    Closed,
}

pub struct TerminalSession {
    session_id: String,
    shell: String,
    input_tx: mpsc::UnboundedSender<Bytes>,
    alive: Arc<AtomicBool>,
    pty: Mutex<Option<PtySession>>,
}

impl TerminalSession {
    /// Spawn the shell in a PTY and start streaming its output to `sink`
    pub fn spawn(
        options: &ShellOptions,
        sink: mpsc::Sender<TerminalEvent>,
    ) -> Result<Self, TerminalError> {
        let mut pty = PtySession::new(options).map_err(|e| TerminalError::Spawn(e.to_string()))?;
        let reader = pty
            .take_reader()
            .map_err(|e| TerminalError::Spawn(format!("Failed to take reader: {}", e)))?;
        let writer = pty
            .take_writer()
            .map_err(|e| TerminalError::Spawn(format!("Failed to take writer: {}", e)))?;

        let mut session = Self::start(
            pty.session_id().to_string(),
            pty.shell_name().to_string(),
            reader,
            writer,
            sink,
        );
        session.pty = Mutex::new(Some(pty));
        Ok(session)
    }

    /// Run a session over arbitrary streams instead of a PTY
    pub fn from_io(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        sink: mpsc::Sender<TerminalEvent>,
    ) -> Self {
        Self::start(
            Uuid::new_v4().to_string(),
            "custom".to_string(),
            reader,
            writer,
            sink,
        )
    }

    fn start(
        session_id: String,
        shell: String,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        sink: mpsc::Sender<TerminalEvent>,
    ) -> Self {
        let alive = Arc::new(AtomicBool::new(true));
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        spawn_reader(session_id.clone(), reader, sink.clone(), alive.clone());
        spawn_writer(session_id.clone(), writer, input_rx, sink, alive.clone());

        info!(session_id = %session_id, shell = %shell, "Terminal session started");

        Self {
            session_id,
            shell,
            input_tx,
            alive,
            pty: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Queue bytes for the shell's input; no validation, call order is kept
    pub fn write(&self, frame: Bytes) -> Result<(), TerminalError> {
        if !self.is_alive() {
            return Err(TerminalError::Closed);
        }
        self.input_tx.send(frame).map_err(|_| TerminalError::Closed)
    }

    /// Exit code of the shell if it has terminated (PTY sessions only)
    pub fn exit_code(&self) -> Option<i32> {
        self.pty
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().and_then(|pty| pty.try_exit_code()))
    }

    /// Kill the shell and stop accepting input. Idempotent.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let pty = self.pty.lock().ok().and_then(|mut guard| guard.take());
        if let Some(mut pty) = pty {
            pty.kill();
        }
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        debug!(session_id = %self.session_id, "Dropping terminal session");
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Flag the session dead and tell the sink, once
fn mark_exited(alive: &AtomicBool, sink: &mpsc::Sender<TerminalEvent>, reason: String) {
    if alive.swap(false, Ordering::SeqCst) {
        warn!(reason = %reason, "Terminal session ended");
        let _ = sink.blocking_send(TerminalEvent::Exited { reason });
    }
}

fn spawn_reader(
    session_id: String,
    mut reader: Box<dyn Read + Send>,
    sink: mpsc::Sender<TerminalEvent>,
    alive: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut pending: Vec<u8> = Vec::new();
        let reason = loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    if !pending.is_empty() {
                        let _ = sink.blocking_send(TerminalEvent::Output(Bytes::from(
                            std::mem::take(&mut pending),
                        )));
                    }
                    break "shell closed its output".to_string();
                }
                Ok(n) => {
                    let mut data = if pending.is_empty() {
                        buf[..n].to_vec()
                    } else {
                        let mut combined = std::mem::take(&mut pending);
                        combined.extend_from_slice(&buf[..n]);
                        combined
                    };

                    // Hold back a split multi-byte character for the next read.
                    if let Some(incomplete_start) = find_incomplete_utf8(&data) {
                        pending = data.split_off(incomplete_start);
                    }

                    if !data.is_empty()
                        && sink
                            .blocking_send(TerminalEvent::Output(Bytes::from(data)))
                            .is_err()
                    {
                        debug!(session_id = %session_id, "Terminal sink dropped, stopping reader");
                        return;
                    }
                }
                Err(e) => break format!("read error: {}", e),
            }
        };
        mark_exited(&alive, &sink, reason);
    });
}

fn spawn_writer(
    session_id: String,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::UnboundedReceiver<Bytes>,
    sink: mpsc::Sender<TerminalEvent>,
    alive: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        while let Some(frame) = input_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&frame).and_then(|_| writer.flush()) {
                mark_exited(&alive, &sink, format!("write error: {}", e));
                return;
            }
            debug!(session_id = %session_id, bytes = frame.len(), "Wrote input to terminal");
        }
    });
}

/// Start of a truncated UTF-8 sequence at the end of `data`, if any
fn find_incomplete_utf8(data: &[u8]) -> Option<usize> {
    let len = data.len();
    for back in 1..=len.min(3) {
        let byte = data[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return None,
        };
        return if back < needed { Some(len - back) } else { None };
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    /// Writer half of an in-memory pipe
    struct PipeWriter(std_mpsc::Sender<Vec<u8>>);

    impl Write for PipeWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0
                .send(buf.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))?;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Reader half; EOF once every writer is gone
    struct PipeReader {
        rx: std_mpsc::Receiver<Vec<u8>>,
        buffered: Vec<u8>,
    }

    impl Read for PipeReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.buffered.is_empty() {
                match self.rx.recv() {
                    Ok(chunk) => self.buffered = chunk,
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.buffered.len());
            buf[..n].copy_from_slice(&self.buffered[..n]);
            self.buffered.drain(..n);
            Ok(n)
        }
    }

    fn pipe() -> (PipeReader, PipeWriter) {
        let (tx, rx) = std_mpsc::channel();
        (
            PipeReader {
                rx,
                buffered: Vec::new(),
            },
            PipeWriter(tx),
        )
    }

    async fn next_event(rx: &mut mpsc::Receiver<TerminalEvent>) -> TerminalEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for terminal event")
            .expect("sink closed")
    }

    #[tokio::test]
    async fn test_loopback_keeps_order() {
        // Whatever is written comes straight back, like a shell echoing input.
        let (reader, writer) = pipe();
        let (sink, mut events) = mpsc::channel(64);
        let session = TerminalSession::from_io(Box::new(reader), Box::new(writer), sink);
        assert!(session.is_alive());
        assert_eq!(session.shell(), "custom");

        for chunk in ["one ", "two ", "three"] {
            session.write(Bytes::from(chunk)).unwrap();
        }

        let mut output = Vec::new();
        while output.len() < "one two three".len() {
            match next_event(&mut events).await {
                TerminalEvent::Output(data) => output.extend_from_slice(&data),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(output, b"one two three");
    }

    #[tokio::test]
    async fn test_exit_is_reported_once_and_writes_fail() {
        let (reader, shell_stdout) = pipe();
        let (_shell_stdin, writer) = pipe();
        let (sink, mut events) = mpsc::channel(64);
        let session = TerminalSession::from_io(Box::new(reader), Box::new(writer), sink);

        shell_stdout.0.send(b"bye\n".to_vec()).unwrap();
        drop(shell_stdout);

        assert_eq!(
            next_event(&mut events).await,
            TerminalEvent::Output(Bytes::from_static(b"bye\n"))
        );
        assert!(matches!(
            next_event(&mut events).await,
            TerminalEvent::Exited { .. }
        ));
        assert!(!session.is_alive());
        assert!(matches!(
            session.write(Bytes::from_static(b"ls\n")),
            Err(TerminalError::Closed)
        ));
        assert_eq!(session.exit_code(), None);
    }

    #[tokio::test]
    async fn test_broken_input_pipe_is_process_failure() {
        let (reader, _keep_stdout_open) = pipe();
        let (shell_stdin, writer) = pipe();
        drop(shell_stdin);
        let (sink, mut events) = mpsc::channel(64);
        let session = TerminalSession::from_io(Box::new(reader), Box::new(writer), sink);

        session.write(Bytes::from_static(b"echo hi\n")).unwrap();
        match next_event(&mut events).await {
            TerminalEvent::Exited { reason } => assert!(reason.contains("write error")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn test_split_utf8_is_reassembled() {
        let (reader, shell_stdout) = pipe();
        let (_shell_stdin, writer) = pipe();
        let (sink, mut events) = mpsc::channel(64);
        let _session = TerminalSession::from_io(Box::new(reader), Box::new(writer), sink);

        let bytes = "héllo".as_bytes();
        shell_stdout.0.send(bytes[..2].to_vec()).unwrap();
        shell_stdout.0.send(bytes[2..].to_vec()).unwrap();

        let mut frames = Vec::new();
        let mut total = 0;
        while total < bytes.len() {
            match next_event(&mut events).await {
                TerminalEvent::Output(data) => {
                    total += data.len();
                    frames.push(data);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        for frame in &frames {
            assert!(std::str::from_utf8(frame).is_ok());
        }
        assert_eq!(frames.concat(), bytes);
    }

    #[tokio::test]
    async fn test_kill_rejects_input() {
        let (reader, _shell_stdout) = pipe();
        let (_shell_stdin, writer) = pipe();
        let (sink, _events) = mpsc::channel(64);
        let session = TerminalSession::from_io(Box::new(reader), Box::new(writer), sink);

        session.kill();
        session.kill();
        assert!(!session.is_alive());
        assert!(matches!(
            session.write(Bytes::from_static(b"ls\n")),
            Err(TerminalError::Closed)
        ));
    }

    #[test]
    fn test_find_incomplete_utf8() {
        assert_eq!(find_incomplete_utf8(b""), None);
        assert_eq!(find_incomplete_utf8(b"Hello"), None);
        assert_eq!(find_incomplete_utf8("你好".as_bytes()), None);
        assert_eq!(find_incomplete_utf8("😀".as_bytes()), None);

        assert_eq!(find_incomplete_utf8(b"Hello\xe4"), Some(5));
        assert_eq!(find_incomplete_utf8(b"Hello\xe4\xbd"), Some(5));
        assert_eq!(find_incomplete_utf8(b"ab\xf0\x9f\x98"), Some(2));
        assert_eq!(find_incomplete_utf8(b"ab\xc3"), Some(2));
    }
}

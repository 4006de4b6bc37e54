//! Scripted in-memory node for tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::socket::{Connector, NodeStream};

/// What a stream does once its script is used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    Eof,
    Timeout,
    /// Block until the stream is shut down, like an idle socket.
    Block,
}

#[derive(Debug)]
struct StreamState {
    input: Vec<u8>,
    pos: usize,
    exhausted: Exhausted,
    written: Vec<u8>,
    timeouts: Vec<Option<Duration>>,
    shutdowns: usize,
}

/// A stream that replays canned node output and records everything else.
#[derive(Debug, Clone)]
pub struct ScriptedStream {
    state: Arc<Mutex<StreamState>>,
}

impl ScriptedStream {
    pub fn new(script: Vec<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StreamState {
                input: script,
                pos: 0,
                exhausted: Exhausted::Eof,
                written: Vec::new(),
                timeouts: Vec::new(),
                shutdowns: 0,
            })),
        }
    }

    /// Reads past the script fail with a timeout instead of EOF.
    pub fn then_timeout(self) -> Self {
        self.state.lock().unwrap().exhausted = Exhausted::Timeout;
        self
    }

    /// Reads past the script block until shutdown.
    pub fn then_block(self) -> Self {
        self.state.lock().unwrap().exhausted = Exhausted::Block;
        self
    }

    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().unwrap().written).into_owned()
    }

    pub fn timeouts(&self) -> Vec<Option<Duration>> {
        self.state.lock().unwrap().timeouts.clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.state.lock().unwrap().shutdowns
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = loop {
            let state = self.state.lock().unwrap();
            if state.shutdowns > 0 {
                return Ok(0);
            }
            if state.pos < state.input.len() {
                break state;
            }
            match state.exhausted {
                Exhausted::Eof => return Ok(0),
                Exhausted::Timeout => {
                    return Err(io::Error::new(io::ErrorKind::WouldBlock, "timed out"))
                }
                Exhausted::Block => {
                    drop(state);
                    thread::sleep(Duration::from_millis(5));
                }
            }
        };
        let remaining = state.input.len() - state.pos;
        let n = remaining.min(buf.len());
        let start = state.pos;
        buf[..n].copy_from_slice(&state.input[start..start + n]);
        state.pos += n;
        Ok(n)
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.shutdowns > 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "shut down"));
        }
        state.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl NodeStream for ScriptedStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.state.lock().unwrap().timeouts.push(timeout);
        Ok(())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().shutdowns += 1;
        Ok(())
    }

    fn try_clone_stream(&self) -> io::Result<Box<dyn NodeStream>> {
        Ok(Box::new(self.clone()))
    }
}

/// Hands out scripted streams in order; refuses once they run out.
pub struct ScriptedConnector {
    streams: Mutex<VecDeque<ScriptedStream>>,
    opened: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(streams: Vec<ScriptedStream>) -> Self {
        Self {
            streams: Mutex::new(streams.into()),
            opened: AtomicUsize::new(0),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    fn address(&self) -> String {
        "scripted:0".to_string()
    }

    fn connect(&self) -> io::Result<Box<dyn NodeStream>> {
        let stream = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no more streams"))?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(stream))
    }
}

pub fn reply(name: &str, fields: &[(&str, &str)]) -> Vec<u8> {
    let mut out = format!("{name}\n");
    for (k, v) in fields {
        out.push_str(&format!("{k}={v}\n"));
    }
    out.push_str("EndMessage\n");
    out.into_bytes()
}

pub fn data_reply(name: &str, fields: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut out = format!("{name}\n");
    for (k, v) in fields {
        out.push_str(&format!("{k}={v}\n"));
    }
    out.push_str(&format!("DataLength={}\nData\n", payload.len()));
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(payload);
    bytes
}

pub fn node_hello() -> Vec<u8> {
    reply("NodeHello", &[("Version", "Fred,0.7,1.0,1497"), ("FCPVersion", "2.0")])
}

/// Concatenates reply fragments into one script.
pub fn script(parts: &[Vec<u8>]) -> Vec<u8> {
    parts.concat()
}

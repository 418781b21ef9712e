//! In-memory ELM327 simulator
//!
//! Answers commands the way a real adapter with echo off, spaces on and
//! headers off would, so sessions and sequencers can be exercised without
//! hardware. Clones share state, letting a test keep a handle while the
//! session worker owns the port.

use crate::transport::AdapterPort;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MockState {
    responses: HashMap<String, String>,
    answer_unknown: bool,
    pending_line: Vec<u8>,
    rx: VecDeque<u8>,
    written: Vec<String>,
    chatter: Option<Vec<u8>>,
    fail_writes: bool,
    fail_reads: bool,
}

/// Simulated adapter implementing [`AdapterPort`]
#[derive(Debug, Clone, Default)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    /// Adapter that never answers anything
    pub fn silent() -> Self {
        Self::default()
    }

    /// Adapter answering the usual AT set, the supported PIDs and Mode 03/04
    pub fn elm327() -> Self {
        let adapter = Self::default();
        {
            let mut state = adapter.lock();
            state.answer_unknown = true;
            for (command, reply) in [
                ("ATZ", "\r\rELM327 v1.5\r\r>"),
                ("ATI", "ELM327 v1.5\r\r>"),
                ("ATDP", "AUTO, ISO 15765-4 (CAN 11/500)\r\r>"),
                ("0100", "41 00 BE 3F A8 13 \r\r>"),
                ("0104", "41 04 7F \r\r>"),
                ("0105", "41 05 46 \r\r>"),
                ("010C", "41 0C 1A F8 \r\r>"),
                ("010D", "41 0D 5A \r\r>"),
                ("0142", "41 42 31 1A \r\r>"),
                ("03", "43 01 03 01 06 00 00 \r\r>"),
                ("04", "44 \r\r>"),
            ] {
                state.responses.insert(command.to_string(), reply.to_string());
            }
        }
        adapter
    }

    /// Set (or replace) the reply for a command
    pub fn respond(&self, command: &str, reply: &str) -> &Self {
        self.lock()
            .responses
            .insert(command.to_ascii_uppercase(), reply.to_string());
        self
    }

    /// Queue bytes as if the adapter had sent them unprompted
    pub fn inject(&self, bytes: &[u8]) {
        self.lock().rx.extend(bytes);
    }

    /// Bytes appended on every availability check, simulating a busy line
    pub fn set_chatter(&self, chatter: Option<Vec<u8>>) {
        self.lock().chatter = chatter;
    }

    /// Make writes fail until reset
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Make reads fail until reset
    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    /// Commands received so far, without terminators
    pub fn written(&self) -> Vec<String> {
        self.lock().written.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MockState {
    fn handle_command(&mut self, command: String) {
        let reply = match self.responses.get(&command) {
            Some(reply) => Some(reply.clone()),
            None if self.answer_unknown && command.starts_with("AT") => Some("OK\r\r>".to_string()),
            None if self.answer_unknown => Some("?\r\r>".to_string()),
            None => None,
        };
        if let Some(reply) = reply {
            self.rx.extend(reply.bytes());
        }
        self.written.push(command);
    }
}

impl AdapterPort for MockAdapter {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }

        for &byte in data {
            match byte {
                b'\r' => {
                    let line = std::mem::take(&mut state.pending_line);
                    let command = String::from_utf8_lossy(&line).trim().to_ascii_uppercase();
                    if !command.is_empty() {
                        state.handle_command(command);
                    }
                }
                b'\n' => {}
                other => state.pending_line.push(other),
            }
        }
        Ok(())
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let mut state = self.lock();
        if state.fail_reads {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock read failure"));
        }
        if let Some(chatter) = state.chatter.clone() {
            state.rx.extend(chatter);
        }
        Ok(state.rx.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        let count = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn clear(&mut self) -> io::Result<()> {
        let mut state = self.lock();
        state.rx.clear();
        state.pending_line.clear();
        Ok(())
    }
}

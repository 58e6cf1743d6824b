use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::CaptureError;

use super::SourceKey;

/// Fixed-width value recorded by a capture session.
pub trait Sample: Copy + Default + Send {
    const WIDTH: usize;

    fn extend_le(self, out: &mut Vec<u8>);
}

impl Sample for f64 {
    const WIDTH: usize = 8;

    fn extend_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl Sample for i16 {
    const WIDTH: usize = 2;

    fn extend_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

/// One registered signal and its record buffer.
#[derive(Clone, Debug)]
pub struct CaptureSource<T> {
    pub name: String,
    pub key: SourceKey,
    /// Values recorded per pulse
    pub points: usize,
    buf: Vec<T>,
}

impl<T: Sample> CaptureSource<T> {
    pub(super) fn new(name: String, key: SourceKey, points: usize, session_length: usize) -> Self {
        Self {
            name,
            key,
            points,
            buf: vec![T::default(); points * session_length],
        }
    }

    fn slot_mut(&mut self, index: usize) -> &mut [T] {
        let start = index * self.points;
        &mut self.buf[start..start + self.points]
    }

    /// The recorded values of pulses `0..length`, pulse-major
    pub fn recorded(&self, length: usize) -> &[T] {
        &self.buf[..length * self.points]
    }
}

/// What a session did on one pulse.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Idle,
    Started,
    Recording,
    /// Session finished; carries the published status line
    Completed(String),
}

/// An incremental multi-pulse recording of every source of one kind.
#[derive(Debug)]
pub struct CaptureSession<T> {
    sources: Vec<CaptureSource<T>>,
    length: usize,
    /// Next slot to fill; `None` while idle
    index: Option<usize>,
    path: PathBuf,
    percent: u32,
}

impl<T: Sample> CaptureSession<T> {
    pub(super) fn new(sources: Vec<CaptureSource<T>>, length: usize) -> Self {
        Self {
            sources,
            length: length.max(1),
            index: None,
            path: PathBuf::new(),
            percent: 0,
        }
    }

    pub fn sources(&self) -> &[CaptureSource<T>] {
        &self.sources
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_active(&self) -> bool {
        self.index.is_some()
    }

    /// Next slot to fill, or -1 while idle
    pub fn index(&self) -> i64 {
        self.index.map_or(-1, |i| i as i64)
    }

    pub fn percent(&self) -> u32 {
        self.percent
    }

    /// Destination latched when the current or last session started
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Advance the session by one pulse.
    ///
    /// `triggered` starts a session only when idle. `fill` copies a source's
    /// live value into the slot it is given.
    pub(super) fn step(
        &mut self,
        triggered: bool,
        destination: impl FnOnce() -> PathBuf,
        mut fill: impl FnMut(SourceKey, &mut [T]),
    ) -> SessionEvent {
        let (slot, event) = match self.index {
            Some(i) => (i, SessionEvent::Recording),
            None if triggered => {
                self.path = destination();
                (0, SessionEvent::Started)
            }
            None => return SessionEvent::Idle,
        };

        for src in self.sources.iter_mut() {
            let key = src.key;
            fill(key, src.slot_mut(slot));
        }

        let filled = slot + 1;
        self.percent = (filled * 100 / self.length) as u32;
        if filled < self.length {
            self.index = Some(filled);
            return event;
        }

        self.index = None;
        let status = match self.flush() {
            Ok(()) => format!("{} saved!", self.path.display()),
            Err(e) => e.to_string(),
        };
        SessionEvent::Completed(status)
    }

    /// Write every source's record, in registration order, one write per source.
    fn flush(&self) -> Result<(), CaptureError> {
        let err = |source| CaptureError {
            path: self.path.clone(),
            source,
        };
        let file = File::create(&self.path).map_err(err)?;
        let mut writer = BufWriter::new(file);
        let mut bytes = Vec::with_capacity(self.length * T::WIDTH);
        for src in self.sources.iter() {
            bytes.clear();
            for v in src.recorded(self.length) {
                v.extend_le(&mut bytes);
            }
            writer.write_all(&bytes).map_err(err)?;
        }
        writer.flush().map_err(err)
    }
}

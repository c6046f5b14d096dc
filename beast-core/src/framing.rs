//! Split a Beast byte stream into frames.
//!
//! A frame is every byte strictly between two successive 0x1A delimiters.
//! Input arrives in arbitrary chunks (TCP reads, file blocks), so the
//! splitter buffers until a delimiter shows up. An empty frame (two
//! adjacent delimiters) is legal and is passed through untouched; the
//! classifier treats it as "no data".

use std::io::Read;

/// Frame delimiter byte.
pub const DELIMITER: u8 = 0x1A;

/// Longest undelimited run kept while waiting for a delimiter. The longest
/// Beast frame is 22 bytes; anything past this is not Beast data.
pub const MAX_FRAME_RUN: usize = 22 * 8;

/// Incremental delimiter splitter.
///
/// Feed bytes with [`push`](Self::push), drain frames with
/// [`next_frame`](Self::next_frame), and call [`finish`](Self::finish) once
/// the stream has ended to recover the undelimited tail.
///
/// A run longer than [`MAX_FRAME_RUN`] with no delimiter is dropped along
/// with everything up to the next delimiter, so a non-Beast stream cannot
/// grow the buffer without bound.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    buf: Vec<u8>,
    start: usize,
    discarding: bool,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes. Returns the number of oversized frames
    /// dropped by this call.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let mut data = data;
        if self.discarding {
            match data.iter().position(|&b| b == DELIMITER) {
                Some(pos) => {
                    data = &data[pos + 1..];
                    self.discarding = false;
                }
                None => return 0,
            }
        }

        if self.start > 0 && self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        } else if self.start > 4096 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(data);

        let pending = &self.buf[self.start..];
        let run_start = pending
            .iter()
            .rposition(|&b| b == DELIMITER)
            .map_or(0, |pos| pos + 1);
        if pending.len() - run_start > MAX_FRAME_RUN {
            self.buf.truncate(self.start + run_start);
            self.discarding = true;
            return 1;
        }
        0
    }

    /// Next complete frame, or `None` when more input is needed.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let pending = &self.buf[self.start..];
        let pos = pending.iter().position(|&b| b == DELIMITER)?;
        let frame = pending[..pos].to_vec();
        self.start += pos + 1;
        Some(frame)
    }

    /// Bytes buffered after the last delimiter.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.start
    }

    /// End of stream: hand back the non-terminated remainder, if any.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        self.discarding = false;
        let rest = self.buf.split_off(self.start);
        self.buf.clear();
        self.start = 0;
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

// ---------------------------------------------------------------------------
// Blocking reader adapter
// ---------------------------------------------------------------------------

/// Iterator of frames over any blocking reader (captured Beast files).
///
/// Yields `Err` once on a read failure, then stops.
pub struct BeastReader<R> {
    inner: R,
    splitter: FrameSplitter,
    chunk: Box<[u8]>,
    done: bool,
    overruns: u64,
}

impl<R: Read> BeastReader<R> {
    pub fn new(inner: R) -> Self {
        BeastReader {
            inner,
            splitter: FrameSplitter::new(),
            chunk: vec![0u8; 8192].into_boxed_slice(),
            done: false,
            overruns: 0,
        }
    }

    /// Oversized frames dropped so far.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}

impl<R: Read> Iterator for BeastReader<R> {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(frame) = self.splitter.next_frame() {
                return Some(Ok(frame));
            }
            if self.done {
                return None;
            }
            match self.inner.read(&mut self.chunk) {
                Ok(0) => {
                    self.done = true;
                    return self.splitter.finish().map(Ok);
                }
                Ok(n) => {
                    self.overruns += self.splitter.push(&self.chunk[..n]) as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

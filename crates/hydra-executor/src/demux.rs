//! Demultiplexes the container backend's stdout stream.
//!
//! The isolated-container backend multiplexes stdout and stderr onto one
//! byte stream using 8-byte frame headers `[type:1][pad:3][size:4 BE]`
//! (type 1 = stdout, type 2 = stderr; zero-length frames are skipped;
//! unknown types discarded). This mirrors Docker's attach-stream framing,
//! reimplemented here so the reassembly logic (line buffering,
//! partial-final-line handling) is explicit and testable without a daemon.

use std::collections::VecDeque;

const HEADER_LEN: usize = 8;
const STDOUT_FRAME: u8 = 1;
const STDERR_FRAME: u8 = 2;

/// Incrementally reassembles demuxed frames into complete stdout lines,
/// buffering stderr separately. Feed raw bytes via [`feed`]; pull complete
/// lines via [`next_line`]; call [`finish`] at EOF to flush a trailing
/// partial line.
#[derive(Default)]
pub struct ContainerDemuxer {
    pending: Vec<u8>,
    stdout_buf: String,
    stderr_buf: String,
    lines: VecDeque<String>,
    finished: bool,
}

impl ContainerDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly-read bytes from the multiplexed stream. Extracts as many
    /// complete frames as are available; anything past the last complete
    /// frame stays buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        loop {
            if self.pending.len() < HEADER_LEN {
                return;
            }
            let frame_type = self.pending[0];
            let size = u32::from_be_bytes([
                self.pending[4],
                self.pending[5],
                self.pending[6],
                self.pending[7],
            ]) as usize;
            if self.pending.len() < HEADER_LEN + size {
                return;
            }
            let payload: Vec<u8> = self.pending.drain(0..HEADER_LEN + size).skip(HEADER_LEN).collect();
            if payload.is_empty() {
                continue; // zero-length frames are skipped
            }
            match frame_type {
                STDOUT_FRAME => {
                    self.stdout_buf.push_str(&String::from_utf8_lossy(&payload));
                    self.drain_stdout_lines();
                }
                STDERR_FRAME => {
                    self.stderr_buf.push_str(&String::from_utf8_lossy(&payload));
                }
                _ => {} // unknown frame types are discarded
            }
        }
    }

    fn drain_stdout_lines(&mut self) {
        while let Some(pos) = self.stdout_buf.find('\n') {
            let line = self.stdout_buf[..pos].to_string();
            self.lines.push_back(line);
            self.stdout_buf.drain(..=pos);
        }
    }

    /// Feed a chunk already known to be stdout, bypassing frame-header
    /// parsing. Used when the transport (e.g. `bollard`'s log/attach API)
    /// has already split stdout from stderr itself, so there is no raw
    /// `[type][size]` header left to parse — only [`feed`] needs one.
    pub fn feed_stdout(&mut self, bytes: &[u8]) {
        self.stdout_buf.push_str(&String::from_utf8_lossy(bytes));
        self.drain_stdout_lines();
    }

    /// Feed a chunk already known to be stderr. See [`feed_stdout`](Self::feed_stdout).
    pub fn feed_stderr(&mut self, bytes: &[u8]) {
        self.stderr_buf.push_str(&String::from_utf8_lossy(bytes));
    }

    /// Pop the next complete stdout line, if any are buffered.
    pub fn next_line(&mut self) -> Option<String> {
        self.lines.pop_front()
    }

    /// Signal EOF: flush a trailing partial line (no terminating `\n`) as
    /// the final element, then mark finished.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if !self.stdout_buf.is_empty() {
            let remainder = std::mem::take(&mut self.stdout_buf);
            self.lines.push_back(remainder);
        }
    }

    /// Accumulated stderr payload, available any time (most useful after
    /// [`finish`]).
    pub fn stderr(&self) -> &str {
        &self.stderr_buf
    }
}

fn frame(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(frame_type);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_yields_split_lines() {
        let mut d = ContainerDemuxer::new();
        d.feed(&frame(STDOUT_FRAME, b"line one\nline two\n"));
        assert_eq!(d.next_line().as_deref(), Some("line one"));
        assert_eq!(d.next_line().as_deref(), Some("line two"));
        assert_eq!(d.next_line(), None);
    }

    #[test]
    fn partial_final_line_preserved_on_finish() {
        let mut d = ContainerDemuxer::new();
        d.feed(&frame(STDOUT_FRAME, b"complete\nincomplete"));
        assert_eq!(d.next_line().as_deref(), Some("complete"));
        assert_eq!(d.next_line(), None);
        d.finish();
        assert_eq!(d.next_line().as_deref(), Some("incomplete"));
    }

    #[test]
    fn stderr_frames_accumulate_separately() {
        let mut d = ContainerDemuxer::new();
        d.feed(&frame(STDERR_FRAME, b"warn: one\n"));
        d.feed(&frame(STDERR_FRAME, b"warn: two\n"));
        assert_eq!(d.next_line(), None);
        assert_eq!(d.stderr(), "warn: one\nwarn: two\n");
    }

    #[test]
    fn zero_length_frames_are_skipped() {
        let mut d = ContainerDemuxer::new();
        d.feed(&frame(STDOUT_FRAME, b""));
        d.feed(&frame(STDOUT_FRAME, b"ok\n"));
        assert_eq!(d.next_line().as_deref(), Some("ok"));
    }

    #[test]
    fn unknown_frame_type_is_discarded() {
        let mut d = ContainerDemuxer::new();
        d.feed(&frame(99, b"mystery"));
        d.feed(&frame(STDOUT_FRAME, b"real\n"));
        assert_eq!(d.next_line().as_deref(), Some("real"));
    }

    #[test]
    fn split_across_multiple_feed_calls() {
        let mut d = ContainerDemuxer::new();
        let f = frame(STDOUT_FRAME, b"hello\n");
        d.feed(&f[..5]);
        assert_eq!(d.next_line(), None);
        d.feed(&f[5..]);
        assert_eq!(d.next_line().as_deref(), Some("hello"));
    }

    #[test]
    fn feed_stdout_bypasses_header_parsing() {
        let mut d = ContainerDemuxer::new();
        d.feed_stdout(b"already demuxed\n");
        assert_eq!(d.next_line().as_deref(), Some("already demuxed"));
    }

    #[test]
    fn interleaved_frames_concat_per_stream_then_split() {
        let mut d = ContainerDemuxer::new();
        d.feed(&frame(STDOUT_FRAME, b"ab"));
        d.feed(&frame(STDERR_FRAME, b"err\n"));
        d.feed(&frame(STDOUT_FRAME, b"c\n"));
        assert_eq!(d.next_line().as_deref(), Some("abc"));
        assert_eq!(d.stderr(), "err\n");
    }
}

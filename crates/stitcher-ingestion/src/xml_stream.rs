//! Constant-memory splitter for huge, repetitive XML dumps.
//!
//! `XmlStream` wraps a reader and watches every byte that passes through it
//! for `<tag ...>...</tag>` occurrences. Each occurrence is handed to the
//! consumer as a standalone document (synthetic declaration + record), so
//! only the record currently in flight is ever held in memory.
//!
//! Matching is byte-wise and deliberately simple:
//! - the opening delimiter `<tag` counts as confirmed on the next byte if it
//!   is `>` or ASCII whitespace;
//! - a byte that breaks a partial opening or closing match resets that
//!   match without re-examining the byte, so `<<tag>` opens nothing and
//!   `<</tag>` closes nothing;
//! - records must not nest inside themselves; the first inner `</tag>`
//!   ends the record;
//! - a record still open at end of input is delivered as it stands, so the
//!   consumer sees the truncated bytes when it fails to parse them.

use std::io::{self, Read};

use stitcher_common::source_config::ExtractorSpec;
use tracing::{debug, trace, warn};

/// Prefixed to every delivered record.
pub const XML_DECL: &[u8] = b"<?xml version=\"1.0\"?>\n";

const CHUNK_SIZE: usize = 8 * 1024;

/// Handle the consumer gets alongside each record.
#[derive(Debug, Default)]
pub struct StreamControl {
    count: usize,
    done: bool,
}

impl StreamControl {
    /// Records delivered so far, including the current one.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Stop at the next read boundary.
    pub fn set_done(&mut self) {
        self.done = true;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Filtering reader that slices records out of the bytes it forwards.
pub struct XmlStream<R, F> {
    inner: R,
    tag: String,
    open: Vec<u8>,
    close: Vec<u8>,
    /// Bytes of `open` matched so far
    start: usize,
    /// Bytes of `close` matched so far
    stop: usize,
    /// In-flight record; `Some` between a confirmed open and its close
    record: Option<Vec<u8>>,
    oversized: bool,
    limit: Option<usize>,
    skipped: usize,
    control: StreamControl,
    consumer: F,
}

impl<R, F> XmlStream<R, F>
where
    R: Read,
    F: FnMut(&mut StreamControl, &[u8]),
{
    pub fn new(inner: R, tag: &str, consumer: F) -> Self {
        Self {
            inner,
            tag: tag.to_string(),
            open: format!("<{tag}").into_bytes(),
            close: format!("</{tag}>").into_bytes(),
            start: 0,
            stop: 0,
            record: None,
            oversized: false,
            limit: None,
            skipped: 0,
            control: StreamControl::default(),
            consumer,
        }
    }

    /// Build from an adapter's extractor settings.
    pub fn from_spec(inner: R, spec: &ExtractorSpec, consumer: F) -> Self {
        let stream = Self::new(inner, &spec.tag, consumer);
        match spec.max_record_bytes {
            Some(limit) => stream.with_limit(limit),
            None => stream,
        }
    }

    /// Drop records larger than `max_record_bytes` instead of buffering them.
    pub fn with_limit(mut self, max_record_bytes: usize) -> Self {
        self.limit = Some(max_record_bytes);
        self
    }

    /// Drain the whole input, returning the number of records delivered.
    pub fn start(&mut self) -> io::Result<usize> {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            match self.read(&mut chunk) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        debug!(tag = %self.tag, records = self.control.count, skipped = self.skipped, "Stream drained");
        Ok(self.control.count)
    }

    /// Records delivered so far.
    pub fn count(&self) -> usize {
        self.control.count
    }

    /// Records dropped for exceeding the size limit.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn is_done(&self) -> bool {
        self.control.done
    }

    pub fn set_done(&mut self) {
        self.control.done = true;
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn scan(&mut self, b: u8) {
        if self.record.is_none() {
            self.scan_open(b);
        } else {
            self.scan_record(b);
        }
    }

    fn scan_open(&mut self, b: u8) {
        if self.start == self.open.len() {
            if b == b'>' || b.is_ascii_whitespace() {
                let mut record = Vec::with_capacity(XML_DECL.len() + self.open.len() + 256);
                record.extend_from_slice(XML_DECL);
                record.extend_from_slice(&self.open);
                record.push(b);
                self.record = Some(record);
                self.oversized = false;
                self.stop = 0;
            }
            self.start = 0;
        } else if b == self.open[self.start] {
            self.start += 1;
        } else {
            self.start = 0;
        }
    }

    fn scan_record(&mut self, b: u8) {
        if let Some(record) = self.record.as_mut() {
            if !self.oversized {
                record.push(b);
                if let Some(limit) = self.limit {
                    if record.len() > limit {
                        self.oversized = true;
                        *record = Vec::new();
                    }
                }
            }
        }

        if b == self.close[self.stop] {
            self.stop += 1;
            if self.stop == self.close.len() {
                self.finish_record();
            }
        } else {
            self.stop = 0;
        }
    }

    fn finish_record(&mut self) {
        self.stop = 0;
        let Some(record) = self.record.take() else {
            return;
        };
        if self.oversized {
            self.oversized = false;
            self.skipped += 1;
            warn!(
                tag = %self.tag,
                limit = self.limit.unwrap_or_default(),
                "Dropping oversized record"
            );
            return;
        }
        self.control.count += 1;
        trace!(tag = %self.tag, record = self.control.count, bytes = record.len(), "Delivering record");
        (self.consumer)(&mut self.control, &record);
    }

    fn finish_stream(&mut self) {
        if self.record.is_none() {
            return;
        }
        warn!(
            tag = %self.tag,
            bytes = self.record.as_ref().map_or(0, Vec::len),
            "Input ended inside a record, delivering truncated tail"
        );
        self.finish_record();
    }
}

impl<R, F> Read for XmlStream<R, F>
where
    R: Read,
    F: FnMut(&mut StreamControl, &[u8]),
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.control.done {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.finish_stream();
            return Ok(0);
        }
        for &b in &buf[..n] {
            self.scan(b);
            if self.control.done {
                break;
            }
        }
        Ok(n)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(input: &str, tag: &str) -> Vec<String> {
        let mut out = Vec::new();
        let count = XmlStream::new(input.as_bytes(), tag, |_: &mut StreamControl, rec: &[u8]| {
            out.push(String::from_utf8(rec[XML_DECL.len()..].to_vec()).unwrap());
        })
        .start()
        .unwrap();
        assert_eq!(count, out.len());
        out
    }

    #[test]
    fn test_splits_records_with_and_without_attributes() {
        let input = r#"<set><rec id="1"><a>x</a></rec>
            <recx>no</recx><rec><a>y</a></rec></set>"#;
        let records = collect(input, "rec");
        assert_eq!(records, vec![r#"<rec id="1"><a>x</a></rec>"#, "<rec><a>y</a></rec>"]);
    }

    #[test]
    fn test_delivered_record_carries_declaration() {
        let mut first = Vec::new();
        XmlStream::new(&b"<r>1</r>"[..], "r", |_: &mut StreamControl, rec: &[u8]| {
            first = rec.to_vec();
        })
        .start()
        .unwrap();
        assert!(first.starts_with(XML_DECL));
        assert!(first.ends_with(b"<r>1</r>"));
    }

    #[test]
    fn test_self_nested_record_ends_at_first_close() {
        let records = collect("<r>AAA<r>X</r>more</r>", "r");
        assert_eq!(records, vec!["<r>AAA<r>X</r>"]);
    }

    #[test]
    fn test_no_backtracking_on_failed_open_match() {
        assert!(collect("<<r>x</r>", "r").is_empty());
    }

    #[test]
    fn test_no_backtracking_on_failed_close_match() {
        // `<<` breaks the close match; the record runs on to the next `</r>`
        let records = collect("<r>a<</r>b</r>", "r");
        assert_eq!(records, vec!["<r>a<</r>b</r>"]);
    }

    #[test]
    fn test_done_stops_at_next_read() {
        let input = "<r>1</r><r>2</r><r>3</r>";
        let mut seen = 0;
        let count = XmlStream::new(input.as_bytes(), "r", |ctl: &mut StreamControl, _: &[u8]| {
            seen += 1;
            if ctl.count() == 2 {
                ctl.set_done();
            }
        })
        .start()
        .unwrap();
        assert_eq!(count, 2);
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_oversized_records_are_skipped() {
        let input = format!("<r>{}</r><r>ok</r>", "x".repeat(100));
        let mut records = Vec::new();
        let mut stream = XmlStream::new(input.as_bytes(), "r", |_: &mut StreamControl, rec: &[u8]| {
            records.push(rec.len());
        })
        .with_limit(64);
        assert_eq!(stream.start().unwrap(), 1);
        assert_eq!(stream.skipped(), 1);
    }

    #[test]
    fn test_truncated_tail_is_delivered() {
        assert_eq!(collect("<r>1</r><r>2", "r"), vec!["<r>1</r>", "<r>2"]);
        assert_eq!(collect("<r>a<</r>", "r"), vec!["<r>a<</r>"]);
    }

    #[test]
    fn test_oversized_truncated_tail_is_skipped() {
        let input = format!("<r>ok</r><r>{}", "x".repeat(100));
        let mut stream = XmlStream::new(input.as_bytes(), "r", |_: &mut StreamControl, _: &[u8]| {}).with_limit(64);
        assert_eq!(stream.start().unwrap(), 1);
        assert_eq!(stream.skipped(), 1);
    }

    #[test]
    fn test_forwards_every_byte() {
        let input = "<r>1</r> trailing";
        let mut stream = XmlStream::new(input.as_bytes(), "r", |_: &mut StreamControl, _: &[u8]| {});
        let mut forwarded = String::new();
        stream.read_to_string(&mut forwarded).unwrap();
        assert_eq!(forwarded, input);
        assert_eq!(stream.count(), 1);
    }
}

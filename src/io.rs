//! Line discipline shared by the server session and the blocking client:
//! bounded CRLF line reads on the input side, dot-termination and
//! dot-stuffing on the DATA output side.

use std::io::{self, Write};

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Longest accepted command line, terminator excluded.
pub(crate) const MAX_COMMAND_LINE: usize = 1024;

/// Longest accepted DATA payload line, terminator excluded.
pub(crate) const MAX_DATA_LINE: usize = 8192;

/// Outcome of a bounded line read.
#[derive(Debug)]
pub(crate) enum Line {
    /// Clean EOF before the first byte of a new line.
    Eof,
    /// The line exceeded the limit. Its bytes, terminator included, have
    /// been consumed so the stream stays framed.
    TooLong,
    /// A complete line with the trailing LF (and optional CR) stripped.
    Data(Vec<u8>),
}

/// Read one LF-terminated line, capped at `limit` bytes.
///
/// EOF in the middle of a line is an error: SMTP lines are atomic and a
/// partial one cannot be acted on.
pub(crate) async fn read_line_bounded<R>(reader: &mut R, limit: usize) -> io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    let mut over = false;

    loop {
        let (done, used) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                if line.is_empty() && !over {
                    return Ok(Line::Eof);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed in the middle of a line",
                ));
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    if !over {
                        line.extend_from_slice(&buf[..pos]);
                    }
                    (true, pos + 1)
                }
                None => {
                    if !over {
                        line.extend_from_slice(buf);
                    }
                    (false, buf.len())
                }
            }
        };
        reader.consume(used);

        if !over && line.len() > limit {
            over = true;
            line.clear();
        }
        if done {
            if over {
                return Ok(Line::TooLong);
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(Line::Data(line));
        }
    }
}

/// Writes the `CRLF . CRLF` end-of-data sequence on [`finish`], prefixing
/// an extra CRLF only when the payload did not already end with one, so the
/// terminating dot always sits on its own line.
///
/// [`finish`]: DotTerminatedWriter::finish
pub struct DotTerminatedWriter<W: Write> {
    inner: W,
    last: [u8; 2],
}

impl<W: Write> DotTerminatedWriter<W> {
    pub fn new(inner: W) -> Self {
        // An empty payload needs no leading CRLF before the dot.
        Self { inner, last: [b'\r', b'\n'] }
    }

    /// Terminate the data stream and flush.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.last != [b'\r', b'\n'] {
            self.inner.write_all(b"\r\n")?;
        }
        self.inner.write_all(b".\r\n")?;
        self.inner.flush()
    }
}

impl<W: Write> Write for DotTerminatedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if n >= 2 {
            self.last = [buf[n - 2], buf[n - 1]];
        } else if n == 1 {
            self.last = [self.last[1], buf[0]];
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// RFC 5321 dot-stuffing: doubles the leading `.` of every payload line.
/// Line starts are observed via CRLF in the byte stream; the initial state
/// is "at line start".
pub struct ExtraDotWriter<W: Write> {
    inner: W,
    at_line_start: bool,
    last_was_cr: bool,
}

impl<W: Write> ExtraDotWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, at_line_start: true, last_was_cr: false }
    }
}

impl<W: Write> Write for ExtraDotWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut start = 0;
        for (i, &b) in buf.iter().enumerate() {
            if self.at_line_start && b == b'.' {
                self.inner.write_all(&buf[start..i])?;
                self.inner.write_all(b".")?;
                start = i;
            }
            self.at_line_start = self.last_was_cr && b == b'\n';
            self.last_was_cr = b == b'\r';
        }
        self.inner.write_all(&buf[start..])?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all_lines(mut input: &[u8]) -> Vec<Line> {
        let mut out = Vec::new();
        loop {
            match read_line_bounded(&mut input, MAX_COMMAND_LINE).await {
                Ok(Line::Eof) => break,
                Ok(line) => out.push(line),
                Err(_) => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn strips_crlf_and_lf() {
        let lines = read_all_lines(b"first\r\nsecond\n").await;
        assert!(matches!(&lines[0], Line::Data(d) if d == b"first"));
        assert!(matches!(&lines[1], Line::Data(d) if d == b"second"));
    }

    #[tokio::test]
    async fn eof_mid_line_is_an_error() {
        let mut input: &[u8] = b"no terminator";
        let err = read_line_bounded(&mut input, MAX_COMMAND_LINE).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn over_long_line_is_consumed_whole() {
        let mut data = vec![b'x'; MAX_COMMAND_LINE + 10];
        data.extend_from_slice(b"\r\nNOOP\r\n");
        let mut input: &[u8] = &data;
        assert!(matches!(
            read_line_bounded(&mut input, MAX_COMMAND_LINE).await.unwrap(),
            Line::TooLong
        ));
        // the next line is intact
        assert!(matches!(
            read_line_bounded(&mut input, MAX_COMMAND_LINE).await.unwrap(),
            Line::Data(d) if d == b"NOOP"
        ));
    }

    #[tokio::test]
    async fn empty_line() {
        let mut input: &[u8] = b"\r\n";
        assert!(matches!(
            read_line_bounded(&mut input, MAX_COMMAND_LINE).await.unwrap(),
            Line::Data(d) if d.is_empty()
        ));
    }

    fn stuff_and_terminate(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut term = DotTerminatedWriter::new(&mut out);
        {
            let mut stuffed = ExtraDotWriter::new(&mut term);
            stuffed.write_all(payload).unwrap();
        }
        term.finish().unwrap();
        out
    }

    /// Server-side view of the DATA phase: split into lines, stop at the
    /// bare dot, undo the stuffing.
    fn destuff(wire: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for line in wire.split_inclusive(|&b| b == b'\n') {
            let body = line.strip_suffix(b"\r\n").unwrap_or(line);
            if body == b"." {
                break;
            }
            let body = if body.starts_with(b"..") { &body[1..] } else { body };
            out.extend_from_slice(body);
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    #[test]
    fn leading_dots_are_doubled() {
        let wire = stuff_and_terminate(b".hidden\r\n");
        assert_eq!(wire, b"..hidden\r\n.\r\n");
    }

    #[test]
    fn terminator_added_on_missing_trailing_crlf() {
        let wire = stuff_and_terminate(b"no trailing newline");
        assert_eq!(wire, b"no trailing newline\r\n.\r\n");
    }

    #[test]
    fn empty_payload_terminates_cleanly() {
        assert_eq!(stuff_and_terminate(b""), b".\r\n");
    }

    #[test]
    fn lone_dot_line_never_appears_in_payload() {
        let wire = stuff_and_terminate(b"a\r\n.\r\nb\r\n");
        // the stuffed payload may not contain the terminating sequence
        let terminator_at = wire.windows(5).position(|w| w == b"\r\n.\r\n").unwrap();
        assert_eq!(terminator_at, wire.len() - 5);
    }

    #[test]
    fn stuff_then_destuff_round_trips() {
        let payloads: [&[u8]; 5] = [
            b"hi\r\n",
            b".\r\n",
            b"..already stuffed\r\n",
            b"mixed\r\n.dot\r\nlines\r\n",
            b"",
        ];
        for payload in payloads {
            let wire = stuff_and_terminate(payload);
            assert_eq!(destuff(&wire), payload, "payload {:?}", payload);
        }
    }
}

use std::{fmt, io};

use crate::error::{Error, ErrorKind};

/// An abstraction over [`fmt::Write`](std::fmt::Write) for the rendering.
///
/// Writes go to the innermost active capture or, if nothing is being
/// captured, to the sink the output was created for.  Section bodies are
/// captured this way while the surrounding template keeps writing to its
/// own buffer.
pub struct Output<'a> {
    w: &'a mut (dyn fmt::Write + 'a),
    capture_stack: Vec<String>,
}

impl<'a> Output<'a> {
    /// Creates a new output.
    pub(crate) fn new(w: &'a mut (dyn fmt::Write + 'a)) -> Self {
        Self {
            w,
            capture_stack: Vec::new(),
        }
    }

    /// Begins capturing into a string.
    pub(crate) fn begin_capture(&mut self) {
        self.capture_stack.push(String::new());
    }

    /// Ends capturing and returns the captured string.
    pub(crate) fn end_capture(&mut self) -> String {
        self.capture_stack.pop().unwrap_or_default()
    }

    #[inline(always)]
    fn target(&mut self) -> &mut (dyn fmt::Write + 'a) {
        match self.capture_stack.last_mut() {
            Some(stream) => stream,
            None => &mut *self.w,
        }
    }

    /// Writes some data to the underlying buffer contained within this output.
    #[inline]
    pub fn write_str(&mut self, s: &str) -> fmt::Result {
        self.target().write_str(s)
    }

    /// Writes some formatted information into this instance.
    #[inline]
    pub fn write_fmt(&mut self, a: fmt::Arguments<'_>) -> fmt::Result {
        self.target().write_fmt(a)
    }
}

impl fmt::Write for Output<'_> {
    #[inline]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        fmt::Write::write_str(self.target(), s)
    }

    #[inline]
    fn write_char(&mut self, c: char) -> fmt::Result {
        fmt::Write::write_char(self.target(), c)
    }

    #[inline]
    fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> fmt::Result {
        fmt::Write::write_fmt(self.target(), args)
    }
}

pub struct WriteWrapper<W> {
    pub w: W,
    pub err: Option<io::Error>,
}

impl<W> WriteWrapper<W> {
    pub fn new(w: W) -> Self {
        WriteWrapper { w, err: None }
    }

    /// Replaces the given error with the held error if available.
    pub fn take_err(&mut self, original: Error) -> Error {
        self.err
            .take()
            .map(|io_err| {
                Error::new(ErrorKind::WriteFailure, "I/O error during rendering")
                    .with_source(io_err)
            })
            .unwrap_or(original)
    }
}

impl<W: io::Write> fmt::Write for WriteWrapper<W> {
    #[inline]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.w.write_all(s.as_bytes()).map_err(|e| {
            self.err = Some(e);
            fmt::Error
        })
    }

    #[inline]
    fn write_char(&mut self, c: char) -> fmt::Result {
        self.w
            .write_all(c.encode_utf8(&mut [0; 4]).as_bytes())
            .map_err(|e| {
                self.err = Some(e);
                fmt::Error
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_capture() {
        let mut buf = String::new();
        let mut out = Output::new(&mut buf);
        out.write_str("a").unwrap();
        out.begin_capture();
        out.write_str("b").unwrap();
        out.begin_capture();
        write!(out, "{}", 1).unwrap();
        assert_eq!(out.end_capture(), "1");
        assert_eq!(out.end_capture(), "b");
        out.write_str("c").unwrap();
        drop(out);
        assert_eq!(buf, "ac");
    }

    #[test]
    fn test_write_wrapper_keeps_io_error() {
        struct Failing;

        impl io::Write for Failing {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut wrapper = WriteWrapper::new(Failing);
        assert!(fmt::Write::write_str(&mut wrapper, "x").is_err());
        let err = wrapper.take_err(Error::from(ErrorKind::RuntimeError));
        assert_eq!(err.kind(), ErrorKind::WriteFailure);
        assert!(std::error::Error::source(&err).is_some());
    }
}

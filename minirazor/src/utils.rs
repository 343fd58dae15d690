use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::Encoding;
use crate::error::{Error, ErrorKind};
use crate::output::Output;
use crate::value::{StringType, Value, ValueRepr};

/// Helper for dealing with untrusted size hints.
#[inline(always)]
pub(crate) fn untrusted_size_hint(value: usize) -> usize {
    value.min(1024)
}

/// Locks a mutex, recovering the data if another thread panicked while
/// holding it.
///
/// None of the engine's locks guard state that can be left half updated,
/// so poisoning carries no information for us.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct OnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> OnDrop<F> {
    pub fn new(f: F) -> Self {
        Self(Some(f))
    }
}

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

pub(crate) struct HtmlEscape<'a>(pub &'a str);

impl fmt::Display for HtmlEscape<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        let mut start = 0;
        for (i, b) in s.bytes().enumerate() {
            let replacement = match b {
                b'<' => "&lt;",
                b'>' => "&gt;",
                b'&' => "&amp;",
                b'"' => "&quot;",
                b'\'' => "&#x27;",
                _ => continue,
            };
            // all replaced characters are ascii so the slice bounds are char boundaries
            if start < i {
                f.write_str(&s[start..i])?;
            }
            f.write_str(replacement)?;
            start = i + 1;
        }
        if start < s.len() {
            f.write_str(&s[start..])
        } else {
            Ok(())
        }
    }
}

/// Writes a value to the output honoring the encoding.
///
/// Null and missing values write nothing.  Safe strings are never encoded.
pub(crate) fn write_value(out: &mut Output, encoding: Encoding, value: &Value) -> Result<(), Error> {
    let rv = match value.0 {
        ValueRepr::None | ValueRepr::Missing => Ok(()),
        ValueRepr::Invalid(ref reason) => {
            return Err(Error::new(
                ErrorKind::BadSerialization,
                format!("cannot render invalid value: {}", reason),
            ))
        }
        ValueRepr::String(ref s, StringType::Safe) => out.write_str(s),
        ValueRepr::String(ref s, StringType::Normal) => match encoding {
            Encoding::Html => write!(out, "{}", HtmlEscape(s)),
            Encoding::Raw => out.write_str(s),
        },
        ValueRepr::I64(_) | ValueRepr::F64(_) | ValueRepr::Bool(_) => write!(out, "{}", value),
        _ => match encoding {
            Encoding::Html => write!(out, "{}", HtmlEscape(&value.to_string())),
            Encoding::Raw => write!(out, "{}", value),
        },
    };
    rv.map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_escape() {
        let input = "<>&\"'plain ö";
        assert_eq!(
            HtmlEscape(input).to_string(),
            "&lt;&gt;&amp;&quot;&#x27;plain ö"
        );
    }

    #[test]
    fn test_write_value() {
        let mut buf = String::new();
        let mut out = Output::new(&mut buf);
        write_value(&mut out, Encoding::Html, &Value::from("<b>")).unwrap();
        write_value(&mut out, Encoding::Html, &Value::from_safe_string("<i>".into())).unwrap();
        write_value(&mut out, Encoding::Raw, &Value::from("<u>")).unwrap();
        write_value(&mut out, Encoding::Html, &Value::NONE).unwrap();
        write_value(&mut out, Encoding::Html, &Value::MISSING).unwrap();
        write_value(&mut out, Encoding::Html, &Value::from(42)).unwrap();
        drop(out);
        assert_eq!(buf, "&lt;b&gt;<i><u>42");
    }
}

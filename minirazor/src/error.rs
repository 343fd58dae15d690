use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Represents engine errors.
///
/// Every failure the engine can report is an [`Error`] with an
/// [`ErrorKind`].  Errors carry the template name and line where they
/// happened if that is known.  Compilation failures additionally carry the
/// list of [`Diagnostic`]s, the generated program text and the template
/// source.  Format an error with the alternative formatting
/// (``format!("{:#}", err)``) to get all of that attached context.
///
/// Errors are cheap to clone as a compilation failure needs to be handed
/// to every caller that waited on the same compilation.
///
/// # Example
///
/// ```rust
/// # let engine = minirazor::Engine::new();
/// # engine.add_template("hello", "Hello @Model.name!").unwrap();
/// match engine.run("hello", minirazor::model! { name => "World" }) {
///     Ok(result) => println!("{}", result),
///     Err(err) => {
///         eprintln!("Could not render template:");
///         eprintln!("  {:#}", err);
///     }
/// }
/// ```
#[derive(Clone)]
pub struct Error {
    repr: Box<ErrorRepr>,
}

#[derive(Clone)]
struct ErrorRepr {
    kind: ErrorKind,
    detail: Option<Cow<'static, str>>,
    name: Option<String>,
    lineno: usize,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    diagnostics: Vec<Diagnostic>,
    program_text: Option<Arc<str>>,
    template_source: Option<Arc<str>>,
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut err = f.debug_struct("Error");
        err.field("kind", &self.kind());
        if let Some(ref detail) = self.repr.detail {
            err.field("detail", detail);
        }
        if let Some(name) = self.name() {
            err.field("name", &name);
        }
        if let Some(line) = self.line() {
            err.field("line", &line);
        }
        if !self.repr.diagnostics.is_empty() {
            err.field("diagnostics", &self.repr.diagnostics);
        }
        if let Some(ref source) = self.repr.source {
            err.field("source", source);
        }
        err.finish()
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind()
    }
}

impl Eq for Error {}

/// An enum describing the error kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorKind {
    /// The template manager could not find a template for a key.
    TemplateNotFound,
    /// The template source could not be parsed.
    SyntaxError,
    /// The generated program was rejected by the compiler backend.
    CompileError,
    /// The embedded program failed while running.
    RuntimeError,
    /// A variable or attribute was undefined.
    UndefinedError,
    /// An operation is not permitted in this situation.
    InvalidOperation,
    /// A value could not be converted into the engine's value model.
    BadSerialization,
    /// Writing to the output sink failed.
    WriteFailure,
    /// A required section was not defined by any wrapped template.
    MissingSection,
    /// The engine was set up with an invalid configuration.
    InvalidConfiguration,
    /// A caller gave up waiting for a result.
    Timeout,
}

impl ErrorKind {
    fn description(self) -> &'static str {
        match self {
            ErrorKind::TemplateNotFound => "template not found",
            ErrorKind::SyntaxError => "syntax error",
            ErrorKind::CompileError => "template compilation failed",
            ErrorKind::RuntimeError => "template raised an error",
            ErrorKind::UndefinedError => "variable or attribute undefined",
            ErrorKind::InvalidOperation => "invalid operation",
            ErrorKind::BadSerialization => "could not serialize to internal format",
            ErrorKind::WriteFailure => "failed to write output",
            ErrorKind::MissingSection => "missing section",
            ErrorKind::InvalidConfiguration => "invalid configuration",
            ErrorKind::Timeout => "timed out",
        }
    }

    /// Returns `true` if this error kind happens while executing a template.
    pub fn is_runtime(self) -> bool {
        matches!(
            self,
            ErrorKind::RuntimeError
                | ErrorKind::UndefinedError
                | ErrorKind::InvalidOperation
                | ErrorKind::BadSerialization
                | ErrorKind::WriteFailure
                | ErrorKind::MissingSection
                | ErrorKind::Timeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref detail) = self.repr.detail {
            write!(f, "{}: {}", self.kind(), detail)?;
        } else {
            write!(f, "{}", self.kind())?;
        }
        if let Some(ref filename) = self.repr.name {
            write!(f, " (in {}:{})", filename, self.repr.lineno)?
        }
        if f.alternate() {
            if !self.repr.diagnostics.is_empty() {
                writeln!(f)?;
                writeln!(f, "{:-^1$}", " Diagnostics ", 74)?;
                for diagnostic in &self.repr.diagnostics {
                    writeln!(f, "{}", diagnostic)?;
                    if !diagnostic.snippet.is_empty() {
                        writeln!(f, "     | {}", diagnostic.snippet)?;
                    }
                }
                write!(f, "{:-^1$}", "", 74)?;
            }
            if let Some(source) = self.template_source() {
                writeln!(f)?;
                writeln!(f, "{:-^1$}", " Template Source ", 74)?;
                let lines: Vec<_> = source.lines().enumerate().collect();
                let idx = self
                    .line()
                    .unwrap_or(1)
                    .saturating_sub(1)
                    .min(lines.len().saturating_sub(1));
                let skip = idx.saturating_sub(3);
                let pre = lines.iter().skip(skip).take(3.min(idx)).collect::<Vec<_>>();
                let post = lines.iter().skip(idx + 1).take(3).collect::<Vec<_>>();
                for (idx, line) in pre {
                    writeln!(f, "{:>4} | {}", idx + 1, line)?;
                }
                if let Some((_, line)) = lines.get(idx) {
                    writeln!(f, "{:>4} > {}", idx + 1, line)?;
                }
                for (idx, line) in post {
                    writeln!(f, "{:>4} | {}", idx + 1, line)?;
                }
                write!(f, "{:-^1$}", "", 74)?;
            }
        }
        Ok(())
    }
}

impl Error {
    /// Creates a new error with kind and detail.
    pub fn new<D: Into<Cow<'static, str>>>(kind: ErrorKind, detail: D) -> Error {
        Error {
            repr: Box::new(ErrorRepr {
                kind,
                detail: Some(detail.into()),
                name: None,
                lineno: 0,
                source: None,
                diagnostics: Vec::new(),
                program_text: None,
                template_source: None,
            }),
        }
    }

    pub(crate) fn new_not_found(name: &str) -> Error {
        Error::new(
            ErrorKind::TemplateNotFound,
            format!("template {:?} does not exist", name),
        )
    }

    pub(crate) fn set_location(&mut self, filename: &str, lineno: usize) {
        self.repr.name = Some(filename.into());
        self.repr.lineno = lineno;
    }

    /// Attaches a template name and line to the error.
    ///
    /// This is primarily useful for code that reconstructs errors, for
    /// instance after they crossed a process boundary.
    pub fn with_location(mut self, filename: &str, lineno: usize) -> Self {
        self.set_location(filename, lineno);
        self
    }

    /// Attaches another error as source to this error.
    pub fn with_source<E: std::error::Error + Send + Sync + 'static>(mut self, source: E) -> Self {
        self.repr.source = Some(Arc::new(source));
        self
    }

    /// Attaches compiler diagnostics to this error.
    pub fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.repr.diagnostics = diagnostics;
        self
    }

    /// Attaches the generated program text to this error.
    pub fn with_program_text(mut self, text: Arc<str>) -> Self {
        self.repr.program_text = Some(text);
        self
    }

    /// Attaches the template source to this error.
    ///
    /// A source that is already attached is kept.
    pub fn with_template_source(mut self, source: Arc<str>) -> Self {
        if self.repr.template_source.is_none() {
            self.repr.template_source = Some(source);
        }
        self
    }

    /// Returns the error kind
    pub fn kind(&self) -> ErrorKind {
        self.repr.kind
    }

    /// Returns the error detail
    ///
    /// The detail is an error message that provides further details about
    /// the error kind.
    pub fn detail(&self) -> Option<&str> {
        self.repr.detail.as_deref()
    }

    /// Returns the filename of the template that caused the error.
    pub fn name(&self) -> Option<&str> {
        self.repr.name.as_deref()
    }

    /// Returns the line number where the error occurred.
    pub fn line(&self) -> Option<usize> {
        self.repr.name.as_ref().map(|_| self.repr.lineno)
    }

    /// Returns the diagnostics produced while compiling.
    ///
    /// This is only populated for syntax and compile errors.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.repr.diagnostics
    }

    /// Returns the generated program text for compile errors.
    pub fn program_text(&self) -> Option<&str> {
        self.repr.program_text.as_deref()
    }

    /// Returns the template source if it was attached.
    ///
    /// Compilation failures always carry the source.  Runtime errors only
    /// carry it if the debug mode is enabled on the engine
    /// ([`Engine::set_debug`](crate::Engine::set_debug)).
    pub fn template_source(&self) -> Option<&str> {
        self.repr.template_source.as_deref()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.repr.source.as_ref().map(|err| err.as_ref() as _)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        let mut rv = Error::new(kind, "");
        rv.repr.detail = None;
        rv
    }
}

impl From<fmt::Error> for Error {
    fn from(_: fmt::Error) -> Self {
        Error::new(ErrorKind::WriteFailure, "formatting failed")
    }
}

impl serde::ser::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: fmt::Display,
    {
        Error::new(ErrorKind::BadSerialization, msg.to_string())
    }
}

/// The severity of a [`Diagnostic`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// The template or program was rejected.
    Error,
    /// Compilation went ahead.
    Warning,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
        })
    }
}

/// A single message produced by the code generator or the backend.
///
/// Lines and columns are 1-based.  For generator diagnostics they point
/// into the template source, for backend diagnostics into the generated
/// program text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The severity.
    pub kind: DiagnosticKind,
    /// What went wrong.
    pub message: String,
    /// The line the diagnostic points to.
    pub line: usize,
    /// The column the diagnostic points to.
    pub column: usize,
    /// The offending line of text.
    pub snippet: String,
}

impl Diagnostic {
    pub(crate) fn error(message: impl Into<String>, line: usize, column: usize) -> Diagnostic {
        Diagnostic {
            kind: DiagnosticKind::Error,
            message: message.into(),
            line,
            column,
            snippet: String::new(),
        }
    }

    pub(crate) fn warning(message: impl Into<String>, line: usize, column: usize) -> Diagnostic {
        Diagnostic {
            kind: DiagnosticKind::Warning,
            ..Diagnostic::error(message, line, column)
        }
    }

    pub(crate) fn with_snippet(mut self, text: &str) -> Diagnostic {
        self.snippet = text
            .lines()
            .nth(self.line.saturating_sub(1))
            .unwrap_or("")
            .to_string();
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {}:{}: {}",
            self.kind, self.line, self.column, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_kinds() {
        assert!(ErrorKind::UndefinedError.is_runtime());
        assert!(ErrorKind::MissingSection.is_runtime());
        assert!(!ErrorKind::CompileError.is_runtime());
        assert!(!ErrorKind::TemplateNotFound.is_runtime());
    }

    #[test]
    fn test_error_display() {
        let err = Error::new(ErrorKind::UndefinedError, "'x' is undefined").with_location("index", 3);
        assert_eq!(
            err.to_string(),
            "variable or attribute undefined: 'x' is undefined (in index:3)"
        );
        assert_eq!(err.line(), Some(3));
        let err = Error::from(ErrorKind::MissingSection);
        assert_eq!(err.to_string(), "missing section");
        assert_eq!(err.line(), None);
    }

    #[test]
    fn test_alternate_display_with_diagnostics() {
        let err = Error::new(ErrorKind::CompileError, "1 error")
            .with_diagnostics(vec![
                Diagnostic::error("unknown opcode 'nope'", 2, 3).with_snippet(".main\n3 nope\n.end")
            ])
            .with_template_source(Arc::from("hello"));
        insta::assert_snapshot!(format!("{:#}", err), @r###"
        template compilation failed: 1 error
        ------------------------------ Diagnostics -------------------------------
        error at 2:3: unknown opcode 'nope'
             | 3 nope
        --------------------------------------------------------------------------
        ---------------------------- Template Source -----------------------------
           1 > hello
        --------------------------------------------------------------------------
        "###);
    }
}

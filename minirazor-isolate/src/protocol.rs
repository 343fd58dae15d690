//! The messages exchanged between host and worker.
//!
//! Every message is one line of JSON.  The host writes a [`Request`] to the
//! worker's stdin and reads exactly one [`Response`] from its stdout before
//! it sends the next request.
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use minirazor::EngineConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::wire::{WireError, WireValue};

/// A call from the host into the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Replaces the worker's engine.  Sent once after spawning.
    Configure {
        /// The configuration of the worker engine.
        config: EngineConfig,
        /// Loads templates from this directory instead of registering them.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        template_dir: Option<PathBuf>,
    },
    /// Registers a template source.
    AddTemplate {
        /// The template name.
        name: String,
        /// The template source.
        source: String,
    },
    /// Runs a template, optionally with a view bag.
    Run {
        /// The template name.
        name: String,
        /// The model.
        model: WireValue,
        /// The view bag the run starts with.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bag: Option<WireValue>,
    },
    /// Renders an anonymous template.
    RenderStr {
        /// The template source.
        source: String,
        /// The model.
        model: WireValue,
    },
    /// Runs a batch.
    RunMany {
        /// The template names.
        names: Vec<String>,
        /// One model per name.
        models: Vec<WireValue>,
        /// Runs the items on the worker's thread pool.
        parallel: bool,
    },
    /// Drops compiled templates by name.
    Invalidate {
        /// The template name.
        name: String,
    },
    /// Asks for a sign of life.
    Ping,
    /// Disposes the engine and stops the worker.
    Shutdown,
}

impl Request {
    /// The name used in logs.
    pub fn op(&self) -> &'static str {
        match self {
            Request::Configure { .. } => "configure",
            Request::AddTemplate { .. } => "add_template",
            Request::Run { .. } => "run",
            Request::RenderStr { .. } => "render_str",
            Request::RunMany { .. } => "run_many",
            Request::Invalidate { .. } => "invalidate",
            Request::Ping => "ping",
            Request::Shutdown => "shutdown",
        }
    }
}

/// The outcome of one batch item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The item rendered.
    Ok {
        /// The rendered output.
        output: String,
    },
    /// The item failed or was skipped.
    Err {
        /// Why the item has no output.
        error: WireError,
    },
}

/// The answer of the worker to a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// The request was carried out.
    Done,
    /// The output of a run.
    Output {
        /// The rendered output.
        output: String,
        /// The contents of the view bag after the run.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bag: Option<WireValue>,
    },
    /// The outcomes of a batch in input order.
    Batch {
        /// One outcome per item.
        outcomes: Vec<Outcome>,
        /// The first failure, if any item failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    /// The number of dropped compiled templates.
    Invalidated {
        /// How many compiled templates were dropped.
        removed: usize,
    },
    /// The answer to `ping` with the worker's process id.
    Pong {
        /// The process id.
        pid: u32,
    },
    /// The request failed.
    Error {
        /// What went wrong.
        error: WireError,
    },
    /// The answer to `shutdown`.
    Bye,
}

/// Encodes one message as a line of JSON.
pub fn encode_message<T: Serialize>(msg: &T) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    Ok(line)
}

/// Writes one message as a line of JSON and flushes.
pub fn write_message<W: Write, T: Serialize>(mut w: W, msg: &T) -> io::Result<()> {
    w.write_all(&encode_message(msg)?)?;
    w.flush()
}

/// Reads the next message.
///
/// Blank lines are skipped.  Returns `None` once the stream is closed.
pub fn read_message<R: BufRead, T: DeserializeOwned>(mut r: R) -> io::Result<Option<T>> {
    let mut line = String::new();
    loop {
        line.clear();
        if r.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            break;
        }
    }
    serde_json::from_str(&line)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    #[test]
    fn test_request_lines() {
        let mut buf = Vec::new();
        write_message(
            &mut buf,
            &Request::Run {
                name: "page".into(),
                model: WireValue::Int(42),
                bag: None,
            },
        )
        .unwrap();
        write_message(&mut buf, &Request::Ping).unwrap();
        insta::assert_snapshot!(String::from_utf8(buf.clone()).unwrap(), @r###"
        {"type":"run","name":"page","model":{"t":"int","v":42}}
        {"type":"ping"}
        "###);

        let mut r = &buf[..];
        let first: Request = read_message(&mut r).unwrap().unwrap();
        assert_eq!(first.op(), "run");
        let second: Request = read_message(&mut r).unwrap().unwrap();
        assert_eq!(second.op(), "ping");
        assert!(read_message::<_, Request>(&mut r).unwrap().is_none());
    }

    #[test]
    fn test_garbage_is_invalid_data() {
        let mut r = &b"\n\nnot json\n"[..];
        let err = read_message::<_, Response>(&mut r).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}

//! The worker side of the boundary.
use std::any::Any;
use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use minirazor::value::Value;
use minirazor::{Engine, Error, ErrorKind, PathManager, ViewBag};

use crate::protocol::{read_message, write_message, Outcome, Request, Response};
use crate::wire::{WireError, WireValue};

/// Serves requests until the host sends `shutdown` or closes the stream.
///
/// Every request gets exactly one response.  A panic while handling a
/// request is reported as [`ErrorKind::RuntimeError`] and the worker keeps
/// serving.  The engine is disposed before this returns, which deletes all
/// compiled artifacts.
pub fn serve<R: BufRead, W: Write>(mut input: R, mut output: W) -> io::Result<()> {
    let mut worker = Worker {
        engine: Engine::new(),
    };
    tracing::debug!(pid = std::process::id(), "worker ready");

    while let Some(req) = read_message::<_, Request>(&mut input)? {
        let op = req.op();
        let now = Instant::now();
        let shutdown = matches!(req, Request::Shutdown);
        let resp = match panic::catch_unwind(AssertUnwindSafe(|| worker.handle(req))) {
            Ok(resp) => resp,
            Err(payload) => {
                let msg = panic_message(&*payload);
                tracing::error!(op, panic = %msg, "request panicked");
                error_response(Error::new(
                    ErrorKind::RuntimeError,
                    format!("worker panicked during {}: {}", op, msg),
                ))
            }
        };
        write_message(&mut output, &resp)?;
        tracing::debug!(op, elapsed = ?now.elapsed(), "handled request");
        if shutdown {
            return Ok(());
        }
    }

    tracing::info!("host closed the connection");
    worker.engine.dispose();
    Ok(())
}

struct Worker {
    engine: Engine,
}

impl Worker {
    fn handle(&mut self, req: Request) -> Response {
        match self.dispatch(req) {
            Ok(resp) => resp,
            Err(err) => error_response(err),
        }
    }

    fn dispatch(&mut self, req: Request) -> Result<Response, Error> {
        match req {
            Request::Configure {
                mut config,
                template_dir,
            } => {
                // this process is the isolation
                config.isolated = false;
                let mut engine = Engine::with_config(config)?;
                if let Some(dir) = template_dir {
                    engine.set_manager(PathManager::new(dir));
                }
                self.engine.dispose();
                self.engine = engine;
                Ok(Response::Done)
            }
            Request::AddTemplate { name, source } => {
                self.engine.add_template(&name, &source)?;
                Ok(Response::Done)
            }
            Request::Run { name, model, bag } => {
                let bag = match bag {
                    Some(bag) => ViewBag::from_value(&bag.into_value())?,
                    None => ViewBag::new(),
                };
                let output = self
                    .engine
                    .run_with_bag(&name, model.into_value(), &bag)?;
                Ok(Response::Output {
                    output,
                    bag: Some(WireValue::from_value(&bag.snapshot())?),
                })
            }
            Request::RenderStr { source, model } => Ok(Response::Output {
                output: self.engine.render_str(&source, model.into_value())?,
                bag: None,
            }),
            Request::RunMany {
                names,
                models,
                parallel,
            } => {
                let models = models.into_iter().map(WireValue::into_value).collect();
                Ok(match self.engine.run_many(&names, models, parallel) {
                    Ok(outputs) => Response::Batch {
                        outcomes: outputs
                            .into_iter()
                            .map(|output| Outcome::Ok { output })
                            .collect(),
                        error: None,
                    },
                    Err(err) => Response::Batch {
                        error: Some(WireError::from_error(err.first_error())),
                        outcomes: err
                            .into_outcomes()
                            .into_iter()
                            .map(|outcome| match outcome {
                                Ok(output) => Outcome::Ok { output },
                                Err(err) => Outcome::Err {
                                    error: WireError::from_error(&err),
                                },
                            })
                            .collect(),
                    },
                })
            }
            Request::Invalidate { name } => Ok(Response::Invalidated {
                removed: self.engine.invalidate(&name),
            }),
            Request::Ping => Ok(Response::Pong {
                pid: std::process::id(),
            }),
            Request::Shutdown => {
                self.engine.dispose();
                Ok(Response::Bye)
            }
        }
    }
}

fn error_response(err: Error) -> Response {
    Response::Error {
        error: WireError::from_error(&err),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    use crate::protocol::encode_message;

    fn exchange(requests: &[Request]) -> Vec<Response> {
        let mut input = Vec::new();
        for req in requests {
            input.extend(encode_message(req).unwrap());
        }
        let mut output = Vec::new();
        serve(&input[..], &mut output).unwrap();
        let mut r = &output[..];
        let mut rv = Vec::new();
        while let Some(resp) = read_message(&mut r).unwrap() {
            rv.push(resp);
        }
        rv
    }

    #[test]
    fn test_run_returns_bag() {
        let responses = exchange(&[
            Request::AddTemplate {
                name: "page".into(),
                source: "@{ ViewBag.Seen = Model; }<@ViewBag.Given>".into(),
            },
            Request::Run {
                name: "page".into(),
                model: WireValue::Int(7),
                bag: Some(WireValue::Bag(vec![(
                    "Given".into(),
                    WireValue::Str("g".into()),
                )])),
            },
        ]);
        assert_eq!(responses.len(), 2);
        match &responses[1] {
            Response::Output { output, bag } => {
                assert_eq!(output, "<g>");
                let bag = bag.clone().unwrap().into_value();
                assert_eq!(bag.get_attr("Seen").unwrap(), Value::from(7));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_errors_keep_their_kind() {
        let responses = exchange(&[Request::Run {
            name: "missing".into(),
            model: WireValue::Null,
            bag: None,
        }]);
        match &responses[0] {
            Response::Error { error } => assert_eq!(error.kind, ErrorKind::TemplateNotFound),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_shutdown_stops_serving() {
        let responses = exchange(&[Request::Ping, Request::Shutdown, Request::Ping]);
        assert_eq!(responses.len(), 2);
        assert!(matches!(responses[1], Response::Bye));
    }

    #[test]
    fn test_configure_ignores_isolated_flag() {
        let config = minirazor::EngineConfig {
            isolated: true,
            encoding: minirazor::Encoding::Raw,
            ..Default::default()
        };
        let responses = exchange(&[
            Request::Configure {
                config,
                template_dir: None,
            },
            Request::RenderStr {
                source: "@Model".into(),
                model: WireValue::Str("<b>".into()),
            },
        ]);
        assert!(matches!(responses[0], Response::Done));
        match &responses[1] {
            Response::Output { output, .. } => assert_eq!(output, "<b>"),
            other => panic!("unexpected response {:?}", other),
        }
    }
}

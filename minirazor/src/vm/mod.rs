use std::sync::Arc;

use crate::compiler::instructions::{Instruction, Instructions};
use crate::composition::IncludeModel;
use crate::engine::Engine;
use crate::error::{Error, ErrorKind};
use crate::generator::ModelType;
use crate::output::Output;
use crate::template::CompiledTemplate;
use crate::utils::write_value;
use crate::value::{self, Lookup, MapType, Value, ValueRepr};

pub use self::context::ViewBag;
pub(crate) use self::context::ExecuteContext;
pub use self::state::TemplateInstance;

mod context;
mod state;

/// The value stack of a block.
///
/// Popping an empty stack yields an invalid value so that broken programs
/// fail with an error once the value is used.
#[derive(Default)]
struct Stack {
    values: Vec<Value>,
}

impl Stack {
    fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    fn pop(&mut self) -> Value {
        self.values
            .pop()
            .unwrap_or_else(|| Value::from_invalid("value stack underflow"))
    }

    fn peek(&self) -> Option<&Value> {
        self.values.last()
    }

    fn split_off(&mut self, n: usize) -> Vec<Value> {
        let at = self.values.len().saturating_sub(n);
        self.values.split_off(at)
    }
}

fn model_type_matches(expected: &str, model: &Value) -> bool {
    match model.0 {
        ValueRepr::None | ValueRepr::Missing => true,
        ValueRepr::Map(_, MapType::Record(ref name)) => {
            // `@model App.Models.Person` accepts a `Person` record
            &**name == expected || expected.rsplit('.').next() == Some(&**name)
        }
        _ => false,
    }
}

fn string_arg<'a>(func: &str, args: &'a [Value], idx: usize) -> Result<&'a str, Error> {
    match args.get(idx).and_then(|x| x.as_str()) {
        Some(rv) => Ok(rv),
        None => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("{} expects a string as argument {}", func, idx + 1),
        )),
    }
}

fn arity(func: &str, args: &[Value], min: usize, max: usize) -> Result<(), Error> {
    if args.len() < min || args.len() > max {
        Err(Error::new(
            ErrorKind::InvalidOperation,
            format!(
                "{} called with {} argument(s), expected {}",
                func,
                args.len(),
                if min == max {
                    min.to_string()
                } else {
                    format!("{} to {}", min, max)
                }
            ),
        ))
    } else {
        Ok(())
    }
}

/// Executes compiled templates.
pub(crate) struct Vm<'env> {
    engine: &'env Engine,
}

impl<'env> Vm<'env> {
    pub fn new(engine: &'env Engine) -> Vm<'env> {
        Vm { engine }
    }

    /// Runs a template at a composition level and returns the layout it
    /// declared.
    pub fn eval(
        &self,
        compiled: &CompiledTemplate,
        ctx: &mut ExecuteContext,
        level: usize,
        out: &mut Output,
    ) -> Result<Option<Arc<str>>, Error> {
        let model = ctx.model().clone();
        let dynamic = match compiled.model_type() {
            ModelType::Dynamic => true,
            ModelType::Named(expected) => {
                if !model_type_matches(expected, &model) {
                    return Err(Error::new(
                        ErrorKind::InvalidOperation,
                        format!(
                            "template {} expects a model of type {} but got {}",
                            compiled.key(),
                            expected,
                            model.type_name().unwrap_or("an anonymous value"),
                        ),
                    ));
                }
                false
            }
        };
        let lookup = Lookup {
            tolerant: self.engine.config().allow_missing_properties_on_dynamic_model,
            dynamic,
        };
        let mut state = TemplateInstance::new(compiled, model, ctx.bag().clone(), level, lookup);
        match self.eval_block(&compiled.program().main, &mut state, ctx, out) {
            Ok(()) => Ok(state.layout.take()),
            Err(err) if self.engine.config().debug => {
                Err(err.with_template_source(compiled.source_arc()))
            }
            Err(err) => Err(err),
        }
    }

    fn eval_block(
        &self,
        instructions: &Instructions,
        state: &mut TemplateInstance<'_>,
        ctx: &mut ExecuteContext,
        out: &mut Output,
    ) -> Result<(), Error> {
        let compiled: &CompiledTemplate = state.compiled;
        let encoding = compiled.program().encoding;
        let mut stack = Stack::default();
        let mut pc = 0;

        macro_rules! bail {
            ($err:expr) => {{
                let mut err: Error = $err;
                if err.line().is_none() {
                    if let Some(line) = instructions.get_line(pc) {
                        err.set_location(state.name(), line);
                    }
                }
                return Err(err);
            }};
        }

        macro_rules! ctx_ok {
            ($expr:expr) => {
                match $expr {
                    Ok(rv) => rv,
                    Err(err) => bail!(err),
                }
            };
        }

        macro_rules! binop {
            ($op:path) => {{
                let b = stack.pop();
                let a = stack.pop();
                stack.push(ctx_ok!($op(&a, &b)));
            }};
        }

        macro_rules! compare {
            ($op:literal, $test:ident) => {{
                let b = stack.pop();
                let a = stack.pop();
                let ordering = ctx_ok!(value::compare(&a, &b, $op));
                stack.push(Value::from(ordering.$test()));
            }};
        }

        while let Some(instr) = instructions.get(pc) {
            match instr {
                Instruction::EmitRaw(text) => {
                    ctx_ok!(out.write_str(text).map_err(Error::from));
                }
                Instruction::Emit => {
                    let value = stack.pop();
                    ctx_ok!(write_value(out, encoding, &value));
                }
                Instruction::LoadConst(value) => stack.push(value.clone()),
                Instruction::Lookup(name) => stack.push(ctx_ok!(state.lookup(name))),
                Instruction::GetAttr(name) => {
                    let obj = stack.pop();
                    stack.push(ctx_ok!(obj.get_attr_with(name, state.lookup)));
                }
                Instruction::GetItem => {
                    let key = stack.pop();
                    let obj = stack.pop();
                    stack.push(ctx_ok!(obj.get_item_with(&key, state.lookup)));
                }
                Instruction::LookupBag(name) => stack.push(state.lookup_bag(name)),
                Instruction::StoreLocal(name) => {
                    let value = stack.pop();
                    state.locals.insert(name.clone(), value);
                }
                Instruction::StoreBag(name) => {
                    let value = stack.pop();
                    ctx_ok!(value.validate());
                    ctx.bag().set(name, value);
                }
                Instruction::SetLayout => {
                    let value = stack.pop();
                    state.layout = match value.as_str() {
                        Some("") => None,
                        Some(name) => Some(Arc::from(name)),
                        None if value.is_none() || value.is_missing() => None,
                        None => bail!(Error::new(
                            ErrorKind::InvalidOperation,
                            format!("layout must be a string, got {}", value.kind()),
                        )),
                    };
                }
                Instruction::Not => {
                    let value = stack.pop();
                    stack.push(Value::from(!value.is_true()));
                }
                Instruction::Neg => {
                    let value = stack.pop();
                    stack.push(ctx_ok!(value::neg(&value)));
                }
                Instruction::Add => binop!(value::add),
                Instruction::Sub => binop!(value::sub),
                Instruction::Mul => binop!(value::mul),
                Instruction::Div => binop!(value::div),
                Instruction::Rem => binop!(value::rem),
                Instruction::Eq => {
                    let b = stack.pop();
                    let a = stack.pop();
                    stack.push(Value::from(a == b));
                }
                Instruction::Ne => {
                    let b = stack.pop();
                    let a = stack.pop();
                    stack.push(Value::from(a != b));
                }
                Instruction::Lt => compare!("<", is_lt),
                Instruction::Lte => compare!("<=", is_le),
                Instruction::Gt => compare!(">", is_gt),
                Instruction::Gte => compare!(">=", is_ge),
                Instruction::JumpIfFalse(target) => {
                    if !stack.pop().is_true() {
                        pc = *target;
                        continue;
                    }
                }
                Instruction::JumpIfFalseOrPop(target) => {
                    if stack.peek().map_or(false, |x| !x.is_true()) {
                        pc = *target;
                        continue;
                    }
                    stack.pop();
                }
                Instruction::JumpIfTrueOrPop(target) => {
                    if stack.peek().map_or(false, |x| x.is_true()) {
                        pc = *target;
                        continue;
                    }
                    stack.pop();
                }
                Instruction::Jump(target) => {
                    pc = *target;
                    continue;
                }
                Instruction::PushLoop => {
                    let iterable = stack.pop();
                    let items = ctx_ok!(iterable.try_iter());
                    state.loops.push(items.into_iter());
                }
                Instruction::Iterate(target) => {
                    match state.loops.last_mut().and_then(|items| items.next()) {
                        Some(item) => stack.push(item),
                        None => {
                            pc = *target;
                            continue;
                        }
                    }
                }
                Instruction::PopLoop => {
                    state.loops.pop();
                }
                Instruction::DefineSection(name) => {
                    let body = match compiled.program().sections.get(name) {
                        Some(body) => body,
                        None => bail!(Error::new(
                            ErrorKind::InvalidOperation,
                            format!("section {:?} has no body", name),
                        )),
                    };
                    out.begin_capture();
                    let rv = self.eval_block(body, state, ctx, out);
                    let captured = out.end_capture();
                    ctx_ok!(rv);
                    ctx.define_section(state.level, name.clone(), captured);
                }
                Instruction::Call(name, argc) => {
                    let args = stack.split_off(*argc);
                    stack.push(ctx_ok!(self.call(name, &args, state, ctx)));
                }
                Instruction::DiscardTop => {
                    stack.pop();
                }
            }
            pc += 1;
        }

        Ok(())
    }

    fn call(
        &self,
        name: &str,
        args: &[Value],
        state: &TemplateInstance<'_>,
        ctx: &ExecuteContext,
    ) -> Result<Value, Error> {
        match name {
            "RenderBody" => {
                ok!(arity(name, args, 0, 0));
                match ctx.body(state.level) {
                    Some(body) => Ok(Value::from_safe_string(body.to_string())),
                    None => Err(Error::new(
                        ErrorKind::InvalidOperation,
                        "RenderBody can only be called from a layout",
                    )),
                }
            }
            "RenderSection" => {
                ok!(arity(name, args, 1, 2));
                let section = ok!(string_arg(name, args, 0));
                let required = args.get(1).map_or(true, |x| x.is_true());
                if state.level == 0 {
                    return Err(Error::new(
                        ErrorKind::InvalidOperation,
                        "RenderSection can only be called from a layout",
                    ));
                }
                match ctx.find_section(state.level, section) {
                    Some(body) => Ok(Value::from_safe_string(body.to_string())),
                    None if required => Err(Error::new(
                        ErrorKind::MissingSection,
                        format!(
                            "section {:?} is required but no wrapped template defines it",
                            section
                        ),
                    )),
                    None => Ok(Value::NONE),
                }
            }
            "IsSectionDefined" => {
                ok!(arity(name, args, 1, 1));
                let section = ok!(string_arg(name, args, 0));
                Ok(Value::from(ctx.find_section(state.level, section).is_some()))
            }
            "Include" => {
                ok!(arity(name, args, 1, 2));
                let include = ok!(string_arg(name, args, 0));
                let model = match args.get(1) {
                    Some(model) => IncludeModel::Explicit(model.clone()),
                    None => IncludeModel::Inherit,
                };
                self.engine.include(include, model, ctx, state.key())
            }
            "Raw" | "Html.Raw" => {
                ok!(arity(name, args, 1, 1));
                let value = &args[0];
                Ok(match value.0 {
                    ValueRepr::None | ValueRepr::Missing => Value::NONE,
                    ValueRepr::String(..) if value.is_safe() => value.clone(),
                    _ => Value::from_safe_string(value.to_string()),
                })
            }
            _ => match self.engine.get_function(name) {
                Some(func) => func(state, args).map_err(|err| {
                    Error::new(
                        ErrorKind::RuntimeError,
                        format!("call to {} failed", name),
                    )
                    .with_source(err)
                }),
                None => Err(Error::new(
                    ErrorKind::UndefinedError,
                    format!("unknown function {:?}", name),
                )),
            },
        }
    }
}

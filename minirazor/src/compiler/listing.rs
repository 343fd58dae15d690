//! The textual program listing exchanged between generators and backends.
//!
//! A listing looks like this:
//!
//! ```text
//! .template "index"
//! .model dynamic
//! .encoding html
//! .main
//!    1 emit_raw "<h1>Hello "
//!    1 lookup "Model"
//!    1 get_attr "Name"
//!    1 emit
//! .end
//! ```
//!
//! Every instruction line starts with the template source line it was
//! generated from.  Operands are JSON values separated by whitespace.
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use crate::compiler::instructions::{Instruction, Instructions, Program};
use crate::config::Encoding;
use crate::error::{Diagnostic, Error, ErrorKind};
use crate::generator::ModelType;
use crate::value::{StringType, Value, ValueRepr};

fn quote(s: &str) -> String {
    serde_json::Value::from(s).to_string()
}

fn const_to_json(value: &Value) -> Result<String, Error> {
    match value.0 {
        ValueRepr::None => Ok("null".into()),
        ValueRepr::Bool(b) => Ok(b.to_string()),
        ValueRepr::I64(i) => Ok(i.to_string()),
        ValueRepr::F64(f) => serde_json::Number::from_f64(f)
            .map(|n| n.to_string())
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::BadSerialization,
                    "non-finite float constants cannot be listed",
                )
            }),
        ValueRepr::String(ref s, StringType::Normal) => Ok(quote(s)),
        _ => Err(Error::new(
            ErrorKind::BadSerialization,
            format!("{} constants cannot be listed", value.kind()),
        )),
    }
}

fn write_instruction(w: &mut String, instr: &Instruction) -> Result<(), Error> {
    let rv = match instr {
        Instruction::EmitRaw(s) => write!(w, "emit_raw {}", quote(s)),
        Instruction::Emit => w.write_str("emit"),
        Instruction::LoadConst(v) => write!(w, "const {}", ok!(const_to_json(v))),
        Instruction::Lookup(name) => write!(w, "lookup {}", quote(name)),
        Instruction::GetAttr(name) => write!(w, "get_attr {}", quote(name)),
        Instruction::GetItem => w.write_str("get_item"),
        Instruction::LookupBag(name) => write!(w, "lookup_bag {}", quote(name)),
        Instruction::StoreLocal(name) => write!(w, "store_local {}", quote(name)),
        Instruction::StoreBag(name) => write!(w, "store_bag {}", quote(name)),
        Instruction::SetLayout => w.write_str("set_layout"),
        Instruction::Not => w.write_str("not"),
        Instruction::Neg => w.write_str("neg"),
        Instruction::Add => w.write_str("add"),
        Instruction::Sub => w.write_str("sub"),
        Instruction::Mul => w.write_str("mul"),
        Instruction::Div => w.write_str("div"),
        Instruction::Rem => w.write_str("rem"),
        Instruction::Eq => w.write_str("eq"),
        Instruction::Ne => w.write_str("ne"),
        Instruction::Lt => w.write_str("lt"),
        Instruction::Lte => w.write_str("lte"),
        Instruction::Gt => w.write_str("gt"),
        Instruction::Gte => w.write_str("gte"),
        Instruction::JumpIfFalse(target) => write!(w, "jump_if_false {}", target),
        Instruction::JumpIfFalseOrPop(target) => write!(w, "jump_if_false_or_pop {}", target),
        Instruction::JumpIfTrueOrPop(target) => write!(w, "jump_if_true_or_pop {}", target),
        Instruction::Jump(target) => write!(w, "jump {}", target),
        Instruction::PushLoop => w.write_str("push_loop"),
        Instruction::Iterate(target) => write!(w, "iterate {}", target),
        Instruction::PopLoop => w.write_str("pop_loop"),
        Instruction::DefineSection(name) => write!(w, "define_section {}", quote(name)),
        Instruction::Call(name, argc) => write!(w, "call {} {}", quote(name), argc),
        Instruction::DiscardTop => w.write_str("discard"),
    };
    rv.map_err(Error::from)
}

fn write_block(w: &mut String, instructions: &Instructions) -> Result<(), Error> {
    for (instr, line) in instructions.iter() {
        ok!(write!(w, "{:>4} ", line).map_err(Error::from));
        ok!(write_instruction(w, instr));
        w.push('\n');
    }
    w.push_str(".end\n");
    Ok(())
}

/// Writes the listing for a program.
pub fn write_listing(program: &Program) -> Result<String, Error> {
    let mut rv = String::new();
    rv.push_str(".template ");
    rv.push_str(&quote(&program.name));
    rv.push('\n');
    match program.model_type {
        ModelType::Dynamic => rv.push_str(".model dynamic\n"),
        ModelType::Named(ref name) => {
            rv.push_str(".model ");
            rv.push_str(&quote(name));
            rv.push('\n');
        }
    }
    rv.push_str(".encoding ");
    rv.push_str(program.encoding.as_str());
    rv.push('\n');
    rv.push_str(".main\n");
    ok!(write_block(&mut rv, &program.main));
    for (name, instructions) in &program.sections {
        rv.push_str(".section ");
        rv.push_str(&quote(name));
        rv.push('\n');
        ok!(write_block(&mut rv, instructions));
    }
    Ok(rv)
}

enum Block {
    Main,
    Section(Arc<str>),
}

struct OpenBlock {
    block: Block,
    instructions: Instructions,
    line: usize,
    /// Jumps with their targets and program text positions.
    jumps: Vec<(usize, usize, usize)>,
}

struct Assembler<'a> {
    text: &'a str,
    name: Option<Arc<str>>,
    model_type: ModelType,
    encoding: Encoding,
    main: Option<Instructions>,
    sections: BTreeMap<Arc<str>, Instructions>,
    current: Option<OpenBlock>,
    section_refs: Vec<(Arc<str>, usize, usize)>,
    diagnostics: Vec<Diagnostic>,
}

fn operands<'v, const N: usize>(
    opcode: &str,
    args: &'v [serde_json::Value],
) -> Result<&'v [serde_json::Value; N], String> {
    <&[serde_json::Value; N]>::try_from(args).map_err(|_| {
        format!(
            "{} expects {} operand(s), got {}",
            opcode,
            N,
            args.len()
        )
    })
}

fn as_name(value: &serde_json::Value) -> Result<Arc<str>, String> {
    value
        .as_str()
        .map(Arc::from)
        .ok_or_else(|| format!("expected a string operand, got {}", value))
}

fn as_index(value: &serde_json::Value) -> Result<usize, String> {
    value
        .as_u64()
        .and_then(|x| usize::try_from(x).ok())
        .ok_or_else(|| format!("expected an unsigned integer operand, got {}", value))
}

fn as_const(value: &serde_json::Value) -> Result<Value, String> {
    match value {
        serde_json::Value::Null => Ok(Value::NONE),
        serde_json::Value::Bool(b) => Ok(Value::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Value::from(i)),
            None => n
                .as_f64()
                .map(Value::from)
                .ok_or_else(|| format!("unsupported number constant {}", n)),
        },
        serde_json::Value::String(s) => Ok(Value::from(s.as_str())),
        other => Err(format!("unsupported constant {}", other)),
    }
}

fn parse_instruction(opcode: &str, args: &[serde_json::Value]) -> Result<Instruction, String> {
    macro_rules! plain {
        ($instr:expr) => {{
            operands::<0>(opcode, args)?;
            $instr
        }};
    }
    macro_rules! named {
        ($instr:path) => {{
            let [name] = operands::<1>(opcode, args)?;
            $instr(as_name(name)?)
        }};
    }
    macro_rules! jump {
        ($instr:path) => {{
            let [target] = operands::<1>(opcode, args)?;
            $instr(as_index(target)?)
        }};
    }
    Ok(match opcode {
        "emit_raw" => named!(Instruction::EmitRaw),
        "emit" => plain!(Instruction::Emit),
        "const" => {
            let [value] = operands::<1>(opcode, args)?;
            Instruction::LoadConst(as_const(value)?)
        }
        "lookup" => named!(Instruction::Lookup),
        "get_attr" => named!(Instruction::GetAttr),
        "get_item" => plain!(Instruction::GetItem),
        "lookup_bag" => named!(Instruction::LookupBag),
        "store_local" => named!(Instruction::StoreLocal),
        "store_bag" => named!(Instruction::StoreBag),
        "set_layout" => plain!(Instruction::SetLayout),
        "not" => plain!(Instruction::Not),
        "neg" => plain!(Instruction::Neg),
        "add" => plain!(Instruction::Add),
        "sub" => plain!(Instruction::Sub),
        "mul" => plain!(Instruction::Mul),
        "div" => plain!(Instruction::Div),
        "rem" => plain!(Instruction::Rem),
        "eq" => plain!(Instruction::Eq),
        "ne" => plain!(Instruction::Ne),
        "lt" => plain!(Instruction::Lt),
        "lte" => plain!(Instruction::Lte),
        "gt" => plain!(Instruction::Gt),
        "gte" => plain!(Instruction::Gte),
        "jump_if_false" => jump!(Instruction::JumpIfFalse),
        "jump_if_false_or_pop" => jump!(Instruction::JumpIfFalseOrPop),
        "jump_if_true_or_pop" => jump!(Instruction::JumpIfTrueOrPop),
        "jump" => jump!(Instruction::Jump),
        "push_loop" => plain!(Instruction::PushLoop),
        "iterate" => jump!(Instruction::Iterate),
        "pop_loop" => plain!(Instruction::PopLoop),
        "define_section" => named!(Instruction::DefineSection),
        "call" => {
            let [name, argc] = operands::<2>(opcode, args)?;
            Instruction::Call(as_name(name)?, as_index(argc)?)
        }
        "discard" => plain!(Instruction::DiscardTop),
        _ => return Err(format!("unknown opcode {:?}", opcode)),
    })
}

fn jump_target(instr: &Instruction) -> Option<usize> {
    match instr {
        Instruction::Jump(target)
        | Instruction::JumpIfFalse(target)
        | Instruction::JumpIfFalseOrPop(target)
        | Instruction::JumpIfTrueOrPop(target)
        | Instruction::Iterate(target) => Some(*target),
        _ => None,
    }
}

/// Splits off the first whitespace separated word and returns it with
/// its byte offset.
fn next_word(line: &str, offset: usize) -> Option<(&str, usize, usize)> {
    let rest = &line[offset..];
    let start = offset + (rest.len() - rest.trim_start().len());
    let word_len = line[start..]
        .find(char::is_whitespace)
        .unwrap_or(line.len() - start);
    if word_len == 0 {
        None
    } else {
        Some((&line[start..start + word_len], start, start + word_len))
    }
}

impl<'a> Assembler<'a> {
    fn error(&mut self, line: usize, column: usize, message: impl Into<String>) {
        self.diagnostics
            .push(Diagnostic::error(message, line, column + 1).with_snippet(self.text));
    }

    fn parse_json_operands(
        &mut self,
        lineno: usize,
        line: &str,
        offset: usize,
    ) -> Option<Vec<serde_json::Value>> {
        let stream = serde_json::Deserializer::from_str(&line[offset..]).into_iter();
        let mut rv = Vec::new();
        for item in stream {
            match item {
                Ok(value) => rv.push(value),
                Err(err) => {
                    self.error(
                        lineno,
                        offset + err.column().saturating_sub(1),
                        format!("malformed operand: {}", err),
                    );
                    return None;
                }
            }
        }
        Some(rv)
    }

    fn directive(&mut self, lineno: usize, line: &str) {
        let (directive, _, end) = match next_word(line, 0) {
            Some(rv) => rv,
            None => return,
        };
        let bare = line[end..].trim();
        let rv = match directive {
            ".encoding" => match bare {
                "html" => {
                    self.encoding = Encoding::Html;
                    Ok(())
                }
                "raw" => {
                    self.encoding = Encoding::Raw;
                    Ok(())
                }
                other => Err(format!("unknown encoding {:?}", other)),
            },
            ".model" if bare == "dynamic" => {
                self.model_type = ModelType::Dynamic;
                Ok(())
            }
            ".main" => {
                if self.main.is_some() {
                    Err("the main block is defined more than once".into())
                } else {
                    self.open_block(lineno, Block::Main)
                }
            }
            ".end" => self.close_block(),
            ".template" | ".model" | ".section" => {
                let args = match self.parse_json_operands(lineno, line, end) {
                    Some(args) => args,
                    None => return,
                };
                match operands::<1>(directive, &args).and_then(|[name]| as_name(name)) {
                    Ok(name) if directive == ".template" => {
                        self.name = Some(name);
                        Ok(())
                    }
                    Ok(name) if directive == ".model" => {
                        self.model_type = ModelType::Named(name.to_string());
                        Ok(())
                    }
                    Ok(name) if self.sections.contains_key(&name) => {
                        Err(format!("section {:?} is defined more than once", name))
                    }
                    Ok(name) => self.open_block(lineno, Block::Section(name)),
                    Err(msg) => Err(msg),
                }
            }
            other => Err(format!("unknown directive {:?}", other)),
        };
        if let Err(msg) = rv {
            self.error(lineno, 0, msg);
        }
    }

    fn open_block(&mut self, lineno: usize, block: Block) -> Result<(), String> {
        if let Some(ref current) = self.current {
            return Err(format!(
                "block opened on line {} is not closed",
                current.line
            ));
        }
        self.current = Some(OpenBlock {
            block,
            instructions: Instructions::new(),
            line: lineno,
            jumps: Vec::new(),
        });
        Ok(())
    }

    fn close_block(&mut self) -> Result<(), String> {
        let block = match self.current.take() {
            Some(block) => block,
            None => return Err("'.end' without an open block".into()),
        };
        let len = block.instructions.len();
        for &(_, target, lineno) in &block.jumps {
            if target > len {
                self.error(
                    lineno,
                    0,
                    format!("jump target {} is outside of the block ({} instructions)", target, len),
                );
            }
        }
        match block.block {
            Block::Main => self.main = Some(block.instructions),
            Block::Section(name) => {
                self.sections.insert(name, block.instructions);
            }
        }
        Ok(())
    }

    fn instruction(&mut self, lineno: usize, line: &str) {
        let (source_line, _, end) = match next_word(line, 0) {
            Some(rv) => rv,
            None => return,
        };
        let source_line = match source_line.parse::<usize>() {
            Ok(source_line) => source_line,
            Err(_) => {
                let column = line.len() - line.trim_start().len();
                self.error(lineno, column, "expected a source line number");
                return;
            }
        };
        let (opcode, opcode_start, end) = match next_word(line, end) {
            Some(rv) => rv,
            None => {
                self.error(lineno, end, "expected an opcode");
                return;
            }
        };
        let args = match self.parse_json_operands(lineno, line, end) {
            Some(args) => args,
            None => return,
        };
        let instr = match parse_instruction(opcode, &args) {
            Ok(instr) => instr,
            Err(msg) => {
                self.error(lineno, opcode_start, msg);
                return;
            }
        };
        if let Instruction::DefineSection(ref name) = instr {
            self.section_refs.push((name.clone(), lineno, opcode_start));
        }
        if self.current.is_none() {
            self.error(lineno, opcode_start, "instruction outside of a block");
            return;
        }
        let current = match self.current.as_mut() {
            Some(current) => current,
            None => return,
        };
        let target = jump_target(&instr);
        let idx = current.instructions.add_with_line(instr, source_line);
        if let Some(target) = target {
            current.jumps.push((idx, target, lineno));
        }
    }

    fn finish(mut self) -> Result<Program, Error> {
        let last_line = self.text.lines().count().max(1);
        if let Some(current) = self.current.take() {
            self.error(
                last_line,
                0,
                format!("block opened on line {} is not closed", current.line),
            );
        }
        for (name, lineno, column) in std::mem::take(&mut self.section_refs) {
            if !self.sections.contains_key(&name) {
                self.error(lineno, column, format!("reference to undefined section {:?}", name));
            }
        }
        if self.name.is_none() {
            self.error(1, 0, "missing '.template' directive");
        }
        if self.main.is_none() {
            self.error(last_line, 0, "missing '.main' block");
        }
        match (self.name, self.main) {
            (Some(name), Some(main)) if self.diagnostics.is_empty() => Ok(Program {
                name,
                model_type: self.model_type,
                encoding: self.encoding,
                main,
                sections: self.sections,
            }),
            _ => Err(Error::new(
                ErrorKind::CompileError,
                format!(
                    "program assembly failed with {} error(s)",
                    self.diagnostics.len()
                ),
            )
            .with_diagnostics(self.diagnostics)
            .with_program_text(Arc::from(self.text))),
        }
    }
}

/// Assembles a listing into a program.
///
/// All problems are collected before failing so that the resulting
/// [`ErrorKind::CompileError`] carries a diagnostic for every bad line.
pub fn assemble(text: &str) -> Result<Program, Error> {
    let mut assembler = Assembler {
        text,
        name: None,
        model_type: ModelType::Dynamic,
        encoding: Encoding::Html,
        main: None,
        sections: BTreeMap::new(),
        current: None,
        section_refs: Vec::new(),
        diagnostics: Vec::new(),
    };
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('.') {
            assembler.directive(idx + 1, line);
        } else {
            assembler.instruction(idx + 1, line);
        }
    }
    assembler.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    #[test]
    fn test_roundtrip() {
        let mut program = Program::new("index", ModelType::Named("Person".into()), Encoding::Raw);
        program
            .main
            .add_with_line(Instruction::EmitRaw("<p>\"hi\"\n".into()), 1);
        program.main.add_with_line(Instruction::LoadConst(Value::from(1.5)), 2);
        program.main.add_with_line(Instruction::Iterate(3), 2);
        program
            .main
            .add_with_line(Instruction::DefineSection("Scripts".into()), 3);
        let mut section = Instructions::new();
        section.add_with_line(Instruction::Call("Html.Raw".into(), 1), 4);
        program.sections.insert("Scripts".into(), section);

        let text = write_listing(&program).unwrap();
        insta::assert_snapshot!(text, @r###"
        .template "index"
        .model "Person"
        .encoding raw
        .main
           1 emit_raw "<p>\"hi\"\n"
           2 const 1.5
           2 iterate 3
           3 define_section "Scripts"
        .end
        .section "Scripts"
           4 call "Html.Raw" 1
        .end
        "###);

        let assembled = assemble(&text).unwrap();
        assert_eq!(assembled.model_type, ModelType::Named("Person".into()));
        assert_eq!(assembled.encoding, Encoding::Raw);
        assert_eq!(assembled.main.instructions, program.main.instructions);
        assert_eq!(assembled.main.get_line(3), Some(3));
        assert_eq!(
            assembled.sections["Scripts"].instructions,
            program.sections["Scripts"].instructions
        );
    }

    #[test]
    fn test_assembly_diagnostics() {
        let text = ".template \"bad\"\n.main\n   1 frobnicate\n   1 jump 7\n   2 lookup 42\n   3 define_section \"Nope\"\n.end\n";
        let err = assemble(text).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CompileError);
        assert_eq!(err.program_text(), Some(text));
        let rendered: Vec<_> = err
            .diagnostics()
            .iter()
            .map(|d| format!("{} | {}", d, d.snippet))
            .collect();
        insta::assert_debug_snapshot!(rendered, @r###"
        [
            "error at 3:6: unknown opcode \"frobnicate\" |    1 frobnicate",
            "error at 5:6: expected a string operand, got 42 |    2 lookup 42",
            "error at 4:1: jump target 7 is outside of the block (2 instructions) |    1 jump 7",
            "error at 6:6: reference to undefined section \"Nope\" |    3 define_section \"Nope\"",
        ]
        "###);
    }

    #[test]
    fn test_missing_template_directive() {
        let err = assemble(".main\n.end\n").unwrap_err();
        assert_eq!(err.diagnostics().len(), 1);
        assert_eq!(err.diagnostics()[0].message, "missing '.template' directive");
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::compiler::ast::{BinOpKind, Expr, Stmt, StmtKind, Template, UnaryOpKind};
use crate::compiler::instructions::{Instruction, Instructions, Program};
use crate::config::Encoding;
use crate::error::Diagnostic;
use crate::generator::ModelType;

/// Turns a parsed template into a program.
pub struct Emitter<'s> {
    source: &'s str,
    sections: BTreeMap<Arc<str>, Instructions>,
    diagnostics: Vec<Diagnostic>,
}

impl<'s> Emitter<'s> {
    /// Creates an emitter for a template source.
    pub fn new(source: &'s str) -> Emitter<'s> {
        Emitter {
            source,
            sections: BTreeMap::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Compiles the template and returns the program with the warnings
    /// that came up.
    pub fn compile(
        mut self,
        tmpl: &Template<'_>,
        name: &str,
        model_type: ModelType,
        encoding: Encoding,
    ) -> (Program, Vec<Diagnostic>) {
        let mut main = Instructions::new();
        self.compile_stmts(&mut main, &tmpl.children);
        let mut program = Program::new(name, model_type, encoding);
        program.main = main;
        program.sections = self.sections;
        (program, self.diagnostics)
    }

    fn warn(&mut self, stmt: &Stmt<'_>, message: String) {
        self.diagnostics.push(
            Diagnostic::warning(message, stmt.span.line as usize, stmt.span.col as usize)
                .with_snippet(self.source),
        );
    }

    fn compile_stmts(&mut self, out: &mut Instructions, stmts: &[Stmt<'_>]) {
        for stmt in stmts {
            self.compile_stmt(out, stmt);
        }
    }

    fn compile_stmt(&mut self, out: &mut Instructions, stmt: &Stmt<'_>) {
        let line = stmt.span.line as usize;
        match stmt.kind {
            StmtKind::EmitRaw(text) => {
                out.add_with_line(Instruction::EmitRaw(Arc::from(text)), line);
            }
            StmtKind::EmitExpr(ref expr) => {
                self.compile_expr(out, expr, line);
                out.add_with_line(Instruction::Emit, line);
            }
            StmtKind::If {
                ref cond,
                ref body,
                ref else_body,
            } => {
                self.compile_expr(out, cond, line);
                let jump_instr = out.add_with_line(Instruction::JumpIfFalse(!0), line);
                self.compile_stmts(out, body);
                if else_body.is_empty() {
                    out.patch_jump(jump_instr, out.len());
                } else {
                    let end_instr = out.add_with_line(Instruction::Jump(!0), line);
                    out.patch_jump(jump_instr, out.len());
                    self.compile_stmts(out, else_body);
                    out.patch_jump(end_instr, out.len());
                }
            }
            StmtKind::ForEach {
                target,
                ref iter,
                ref body,
            } => {
                self.compile_expr(out, iter, line);
                out.add_with_line(Instruction::PushLoop, line);
                let iter_instr = out.add_with_line(Instruction::Iterate(!0), line);
                out.add_with_line(Instruction::StoreLocal(Arc::from(target)), line);
                self.compile_stmts(out, body);
                out.add_with_line(Instruction::Jump(iter_instr), line);
                out.patch_jump(iter_instr, out.len());
                out.add_with_line(Instruction::PopLoop, line);
            }
            StmtKind::Section { name, ref body } => {
                let mut section = Instructions::new();
                self.compile_stmts(&mut section, body);
                self.sections.insert(Arc::from(name), section);
                out.add_with_line(Instruction::DefineSection(Arc::from(name)), line);
            }
            StmtKind::SetLayout(ref expr) => {
                self.compile_expr(out, expr, line);
                out.add_with_line(Instruction::SetLayout, line);
            }
            StmtKind::SetBag { name, ref value } => {
                self.compile_expr(out, value, line);
                out.add_with_line(Instruction::StoreBag(Arc::from(name)), line);
            }
            StmtKind::SetLocal { name, ref value } => {
                self.compile_expr(out, value, line);
                out.add_with_line(Instruction::StoreLocal(Arc::from(name)), line);
            }
            StmtKind::Do(ref expr) => {
                if let Expr::Const(_) | Expr::Var(_) = expr {
                    self.warn(stmt, "statement has no effect".into());
                }
                self.compile_expr(out, expr, line);
                out.add_with_line(Instruction::DiscardTop, line);
            }
        }
    }

    fn compile_expr(&mut self, out: &mut Instructions, expr: &Expr<'_>, line: usize) {
        match expr {
            Expr::Const(value) => {
                out.add_with_line(Instruction::LoadConst(value.clone()), line);
            }
            Expr::Var(name) => {
                out.add_with_line(Instruction::Lookup(Arc::from(*name)), line);
            }
            Expr::GetAttr(obj, name) => {
                if let Expr::Var("ViewBag") = **obj {
                    out.add_with_line(Instruction::LookupBag(Arc::from(*name)), line);
                } else {
                    self.compile_expr(out, obj, line);
                    out.add_with_line(Instruction::GetAttr(Arc::from(*name)), line);
                }
            }
            Expr::GetItem(obj, index) => {
                self.compile_expr(out, obj, line);
                self.compile_expr(out, index, line);
                out.add_with_line(Instruction::GetItem, line);
            }
            Expr::Call(name, args) => {
                for arg in args {
                    self.compile_expr(out, arg, line);
                }
                out.add_with_line(Instruction::Call(Arc::from(name.as_str()), args.len()), line);
            }
            Expr::UnaryOp(op, value) => {
                self.compile_expr(out, value, line);
                out.add_with_line(
                    match op {
                        UnaryOpKind::Not => Instruction::Not,
                        UnaryOpKind::Neg => Instruction::Neg,
                    },
                    line,
                );
            }
            Expr::BinOp(op, left, right) => {
                self.compile_expr(out, left, line);
                self.compile_expr(out, right, line);
                out.add_with_line(
                    match op {
                        BinOpKind::Eq => Instruction::Eq,
                        BinOpKind::Ne => Instruction::Ne,
                        BinOpKind::Lt => Instruction::Lt,
                        BinOpKind::Lte => Instruction::Lte,
                        BinOpKind::Gt => Instruction::Gt,
                        BinOpKind::Gte => Instruction::Gte,
                        BinOpKind::Add => Instruction::Add,
                        BinOpKind::Sub => Instruction::Sub,
                        BinOpKind::Mul => Instruction::Mul,
                        BinOpKind::Div => Instruction::Div,
                        BinOpKind::Rem => Instruction::Rem,
                    },
                    line,
                );
            }
            Expr::And(left, right) => {
                self.compile_expr(out, left, line);
                let jump_instr = out.add_with_line(Instruction::JumpIfFalseOrPop(!0), line);
                self.compile_expr(out, right, line);
                out.patch_jump(jump_instr, out.len());
            }
            Expr::Or(left, right) => {
                self.compile_expr(out, left, line);
                let jump_instr = out.add_with_line(Instruction::JumpIfTrueOrPop(!0), line);
                self.compile_expr(out, right, line);
                out.patch_jump(jump_instr, out.len());
            }
        }
    }
}

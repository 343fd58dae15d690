use std::collections::BTreeSet;
use std::fmt;

use crate::compiler::ast::{
    BinOpKind, Expr, ModelDecl, Span, Stmt, StmtKind, Template, UnaryOpKind,
};
use crate::error::{Diagnostic, Error, ErrorKind};
use crate::value::Value;

/// Names that templates cannot assign to with `var` or plain assignments.
const RESERVED_NAMES: &[&str] = &["Model", "ViewBag", "Layout"];

/// How deep expressions and blocks may nest.
const MAX_RECURSION: usize = 150;

/// Longest match first.
const PUNCTUATION: &[&str] = &[
    "==", "!=", "<=", ">=", "&&", "||", "(", ")", "[", "]", "{", "}", ".", ",", ";", "=", "<",
    ">", "+", "-", "*", "/", "%", "!", ":",
];

#[derive(Debug, Clone)]
enum Token<'a> {
    Ident(&'a str),
    Str(String),
    Int(i64),
    Float(f64),
    Punct(&'static str),
}

impl Token<'_> {
    fn is_punct(&self, p: &str) -> bool {
        matches!(self, Token::Punct(x) if *x == p)
    }
}

impl fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(x) => write!(f, "identifier '{}'", x),
            Token::Str(_) => f.write_str("string"),
            Token::Int(_) | Token::Float(_) => f.write_str("number"),
            Token::Punct(p) => write!(f, "'{}'", p),
        }
    }
}

#[derive(Copy, Clone)]
struct Cursor {
    pos: usize,
    line: u32,
    line_start: usize,
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Drops the indentation in front of a closing brace.
fn trim_closing_indent(text: &str) -> &str {
    match text.rfind('\n') {
        Some(idx) if text[idx + 1..].trim().is_empty() => &text[..idx + 1],
        _ => text,
    }
}

struct Parser<'a> {
    name: &'a str,
    source: &'a str,
    cursor: Cursor,
    block_depth: usize,
    in_section: bool,
    model: Option<(ModelDecl<'a>, Span)>,
    sections: BTreeSet<&'a str>,
    top_level_layout: Option<Span>,
    assigns_layout: bool,
    depth: usize,
}

type ParseResult<T> = Result<T, Error>;

macro_rules! with_recursion_guard {
    ($parser:expr, $expr:expr) => {{
        $parser.depth += 1;
        if $parser.depth > MAX_RECURSION {
            let span = $parser.span();
            return Err($parser.syntax_error(span, "template exceeds maximum recursion limits"));
        }
        let rv = $expr;
        $parser.depth -= 1;
        rv
    }};
}

impl<'a> Parser<'a> {
    fn new(name: &'a str, source: &'a str) -> Parser<'a> {
        Parser {
            name,
            source,
            cursor: Cursor {
                pos: 0,
                line: 1,
                line_start: 0,
            },
            block_depth: 0,
            in_section: false,
            model: None,
            sections: BTreeSet::new(),
            top_level_layout: None,
            assigns_layout: false,
            depth: 0,
        }
    }

    fn rest(&self) -> &'a str {
        &self.source[self.cursor.pos..]
    }

    fn peek_byte(&self, offset: usize) -> Option<u8> {
        self.source
            .as_bytes()
            .get(self.cursor.pos + offset)
            .copied()
    }

    fn advance(&mut self, n: usize) {
        let end = (self.cursor.pos + n).min(self.source.len());
        for (idx, b) in self.source.as_bytes()[self.cursor.pos..end].iter().enumerate() {
            if *b == b'\n' {
                self.cursor.line += 1;
                self.cursor.line_start = self.cursor.pos + idx + 1;
            }
        }
        self.cursor.pos = end;
    }

    fn advance_char(&mut self) {
        let len = self.rest().chars().next().map_or(1, char::len_utf8);
        self.advance(len);
    }

    fn span(&self) -> Span {
        Span {
            line: self.cursor.line,
            col: (self.cursor.pos - self.cursor.line_start) as u32 + 1,
        }
    }

    fn at_top_level(&self) -> bool {
        self.block_depth == 0 && !self.in_section
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        self.rest().starts_with(keyword) && !self.peek_byte(keyword.len()).map_or(false, is_ident_char)
    }

    fn syntax_error(&self, span: Span, msg: impl Into<String>) -> Error {
        let msg = msg.into();
        let diagnostic = Diagnostic::error(msg.clone(), span.line as usize, span.col as usize)
            .with_snippet(self.source);
        let mut err = Error::new(ErrorKind::SyntaxError, msg).with_diagnostics(vec![diagnostic]);
        err.set_location(self.name, span.line as usize);
        err
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek_byte(0), Some(b) if b.is_ascii_whitespace()) {
            self.advance(1);
        }
    }

    fn skip_inline_ws(&mut self) {
        while matches!(self.peek_byte(0), Some(b' ' | b'\t')) {
            self.advance(1);
        }
    }

    /// Swallows the rest of the line if it is blank.
    fn skip_line_end(&mut self) {
        let save = self.cursor;
        self.skip_inline_ws();
        match self.peek_byte(0) {
            Some(b'\n') => self.advance(1),
            Some(b'\r') if self.peek_byte(1) == Some(b'\n') => self.advance(2),
            None => {}
            _ => self.cursor = save,
        }
    }

    fn read_ident(&mut self) -> &'a str {
        let start = self.cursor.pos;
        while self.peek_byte(0).map_or(false, is_ident_char) {
            self.advance(1);
        }
        &self.source[start..self.cursor.pos]
    }

    fn lex_number(&mut self, span: Span) -> ParseResult<Token<'a>> {
        let start = self.cursor.pos;
        while self.peek_byte(0).map_or(false, |b| b.is_ascii_digit()) {
            self.advance(1);
        }
        let is_float = self.peek_byte(0) == Some(b'.')
            && self.peek_byte(1).map_or(false, |b| b.is_ascii_digit());
        if is_float {
            self.advance(1);
            while self.peek_byte(0).map_or(false, |b| b.is_ascii_digit()) {
                self.advance(1);
            }
        }
        let text = &self.source[start..self.cursor.pos];
        if is_float {
            text.parse()
                .map(Token::Float)
                .map_err(|_| self.syntax_error(span, "invalid float literal"))
        } else {
            text.parse()
                .map(Token::Int)
                .map_err(|_| self.syntax_error(span, "integer literal is too large"))
        }
    }

    fn lex_string(&mut self, span: Span) -> ParseResult<Token<'a>> {
        let quote = self.rest().chars().next();
        self.advance(1);
        let mut rv = String::new();
        loop {
            let c = match self.rest().chars().next() {
                Some(c) => c,
                None => return Err(self.syntax_error(span, "unterminated string literal")),
            };
            self.advance(c.len_utf8());
            if Some(c) == quote {
                return Ok(Token::Str(rv));
            }
            if c != '\\' {
                rv.push(c);
                continue;
            }
            let escape_span = self.span();
            let escaped = self.rest().chars().next();
            rv.push(match escaped {
                Some('n') => '\n',
                Some('t') => '\t',
                Some('r') => '\r',
                Some(c @ ('\\' | '"' | '\'')) => c,
                _ => return Err(self.syntax_error(escape_span, "bad string escape")),
            });
            self.advance(1);
        }
    }

    fn next_token(&mut self) -> ParseResult<Option<(Token<'a>, Span)>> {
        self.skip_ws();
        let span = self.span();
        let b = match self.peek_byte(0) {
            Some(b) => b,
            None => return Ok(None),
        };
        let token = if is_ident_start(b) {
            Token::Ident(self.read_ident())
        } else if b.is_ascii_digit() {
            ok!(self.lex_number(span))
        } else if b == b'"' || b == b'\'' {
            ok!(self.lex_string(span))
        } else if let Some(p) = PUNCTUATION.iter().find(|p| self.rest().starts_with(**p)) {
            self.advance(p.len());
            Token::Punct(p)
        } else {
            let c = self.rest().chars().next().unwrap_or('?');
            return Err(self.syntax_error(span, format!("unexpected character {:?}", c)));
        };
        Ok(Some((token, span)))
    }

    fn peek_token(&mut self) -> ParseResult<Option<Token<'a>>> {
        let save = self.cursor;
        let rv = self.next_token();
        self.cursor = save;
        rv.map(|tok| tok.map(|(tok, _)| tok))
    }

    fn peek_punct(&mut self, p: &str) -> ParseResult<bool> {
        Ok(matches!(ok!(self.peek_token()), Some(tok) if tok.is_punct(p)))
    }

    fn expect_punct(&mut self, p: &'static str) -> ParseResult<Span> {
        match ok!(self.next_token()) {
            Some((tok, span)) if tok.is_punct(p) => Ok(span),
            Some((tok, span)) => {
                Err(self.syntax_error(span, format!("expected '{}', found {}", p, tok)))
            }
            None => Err(self.syntax_error(
                self.span(),
                format!("expected '{}', found end of template", p),
            )),
        }
    }

    fn expect_ident(&mut self, what: &str) -> ParseResult<(&'a str, Span)> {
        match ok!(self.next_token()) {
            Some((Token::Ident(name), span)) => Ok((name, span)),
            Some((tok, span)) => {
                Err(self.syntax_error(span, format!("expected {}, found {}", what, tok)))
            }
            None => Err(self.syntax_error(
                self.span(),
                format!("expected {}, found end of template", what),
            )),
        }
    }

    fn check_assignable(&self, name: &str, span: Span) -> ParseResult<()> {
        if RESERVED_NAMES.contains(&name) {
            Err(self.syntax_error(span, format!("cannot assign to reserved name '{}'", name)))
        } else {
            Ok(())
        }
    }

    fn note_layout(&mut self, span: Span) -> ParseResult<()> {
        self.assigns_layout = true;
        if self.at_top_level() {
            if let Some(previous) = self.top_level_layout {
                return Err(self.syntax_error(
                    span,
                    format!(
                        "conflicting layout declaration, the layout was already declared on line {}",
                        previous.line
                    ),
                ));
            }
            self.top_level_layout = Some(span);
        }
        Ok(())
    }

    fn parse_expr(&mut self) -> ParseResult<Expr<'a>> {
        with_recursion_guard!(self, self.parse_or())
    }

    fn parse_or(&mut self) -> ParseResult<Expr<'a>> {
        let mut left = ok!(self.parse_and());
        while ok!(self.peek_punct("||")) {
            ok!(self.next_token());
            let right = ok!(self.parse_and());
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult<Expr<'a>> {
        let mut left = ok!(self.parse_equality());
        while ok!(self.peek_punct("&&")) {
            ok!(self.next_token());
            let right = ok!(self.parse_equality());
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_binop_level(
        &mut self,
        ops: &[(&str, BinOpKind)],
        next: fn(&mut Parser<'a>) -> ParseResult<Expr<'a>>,
    ) -> ParseResult<Expr<'a>> {
        let mut left = ok!(next(self));
        'outer: loop {
            let tok = match ok!(self.peek_token()) {
                Some(tok) => tok,
                None => break,
            };
            for (p, op) in ops {
                if tok.is_punct(p) {
                    ok!(self.next_token());
                    let right = ok!(next(self));
                    left = Expr::BinOp(*op, Box::new(left), Box::new(right));
                    continue 'outer;
                }
            }
            break;
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> ParseResult<Expr<'a>> {
        self.parse_binop_level(
            &[("==", BinOpKind::Eq), ("!=", BinOpKind::Ne)],
            Parser::parse_compare,
        )
    }

    fn parse_compare(&mut self) -> ParseResult<Expr<'a>> {
        self.parse_binop_level(
            &[
                ("<=", BinOpKind::Lte),
                (">=", BinOpKind::Gte),
                ("<", BinOpKind::Lt),
                (">", BinOpKind::Gt),
            ],
            Parser::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> ParseResult<Expr<'a>> {
        self.parse_binop_level(
            &[("+", BinOpKind::Add), ("-", BinOpKind::Sub)],
            Parser::parse_multiplicative,
        )
    }

    fn parse_multiplicative(&mut self) -> ParseResult<Expr<'a>> {
        self.parse_binop_level(
            &[
                ("*", BinOpKind::Mul),
                ("/", BinOpKind::Div),
                ("%", BinOpKind::Rem),
            ],
            Parser::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> ParseResult<Expr<'a>> {
        let op = match ok!(self.peek_token()) {
            Some(Token::Punct("!")) => UnaryOpKind::Not,
            Some(Token::Punct("-")) => UnaryOpKind::Neg,
            _ => return self.parse_postfix(),
        };
        ok!(self.next_token());
        let expr = ok!(with_recursion_guard!(self, self.parse_unary()));
        Ok(Expr::UnaryOp(op, Box::new(expr)))
    }

    fn parse_args(&mut self) -> ParseResult<Vec<Expr<'a>>> {
        let mut args = Vec::new();
        if ok!(self.peek_punct(")")) {
            ok!(self.next_token());
            return Ok(args);
        }
        loop {
            // named arguments (`required: false`) are matched by position
            let save = self.cursor;
            match ok!(self.next_token()) {
                Some((Token::Ident(_), _)) if ok!(self.peek_punct(":")) => {
                    ok!(self.next_token());
                }
                _ => self.cursor = save,
            }
            args.push(ok!(self.parse_expr()));
            match ok!(self.next_token()) {
                Some((tok, _)) if tok.is_punct(",") => continue,
                Some((tok, _)) if tok.is_punct(")") => break,
                Some((tok, span)) => {
                    return Err(
                        self.syntax_error(span, format!("expected ',' or ')', found {}", tok))
                    )
                }
                None => {
                    return Err(self.syntax_error(
                        self.span(),
                        "unexpected end of template in argument list",
                    ))
                }
            }
        }
        Ok(args)
    }

    fn parse_postfix(&mut self) -> ParseResult<Expr<'a>> {
        let (tok, span) = match ok!(self.next_token()) {
            Some(rv) => rv,
            None => {
                return Err(self.syntax_error(
                    self.span(),
                    "expected an expression, found end of template",
                ))
            }
        };
        let (mut expr, mut path) = match tok {
            Token::Ident("true") => (Expr::Const(Value::from(true)), None),
            Token::Ident("false") => (Expr::Const(Value::from(false)), None),
            Token::Ident("null") => (Expr::Const(Value::NONE), None),
            Token::Ident(name) => (Expr::Var(name), Some(name.to_string())),
            Token::Str(s) => (Expr::Const(Value::from(s)), None),
            Token::Int(i) => (Expr::Const(Value::from(i)), None),
            Token::Float(f) => (Expr::Const(Value::from(f)), None),
            Token::Punct("(") => {
                let expr = ok!(self.parse_expr());
                ok!(self.expect_punct(")"));
                (expr, None)
            }
            tok => {
                return Err(self.syntax_error(span, format!("expected an expression, found {}", tok)))
            }
        };
        loop {
            match ok!(self.peek_token()) {
                Some(Token::Punct(".")) => {
                    ok!(self.next_token());
                    let (name, _) = ok!(self.expect_ident("property name"));
                    path = path.map(|path| format!("{}.{}", path, name));
                    expr = Expr::GetAttr(Box::new(expr), name);
                }
                Some(Token::Punct("[")) => {
                    ok!(self.next_token());
                    let index = ok!(self.parse_expr());
                    ok!(self.expect_punct("]"));
                    path = None;
                    expr = Expr::GetItem(Box::new(expr), Box::new(index));
                }
                Some(Token::Punct("(")) => {
                    let call_span = ok!(self.expect_punct("("));
                    let name = match path.take() {
                        Some(name) => name,
                        None => {
                            return Err(
                                self.syntax_error(call_span, "only named functions can be called")
                            )
                        }
                    };
                    let args = ok!(self.parse_args());
                    expr = Expr::Call(name, args);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Parses `@Model.A.B`, `@items[0]` or `@Func(x)` without whitespace.
    fn parse_implicit_expr(&mut self, first: &'a str) -> ParseResult<Expr<'a>> {
        let mut expr = Expr::Var(first);
        let mut path = Some(first.to_string());
        loop {
            match self.peek_byte(0) {
                Some(b'.') if self.peek_byte(1).map_or(false, is_ident_start) => {
                    self.advance(1);
                    let name = self.read_ident();
                    path = path.map(|path| format!("{}.{}", path, name));
                    expr = Expr::GetAttr(Box::new(expr), name);
                }
                Some(b'[') => {
                    self.advance(1);
                    let index = ok!(self.parse_expr());
                    ok!(self.expect_punct("]"));
                    path = None;
                    expr = Expr::GetItem(Box::new(expr), Box::new(index));
                }
                Some(b'(') => {
                    let call_span = self.span();
                    self.advance(1);
                    let name = match path.take() {
                        Some(name) => name,
                        None => {
                            return Err(
                                self.syntax_error(call_span, "only named functions can be called")
                            )
                        }
                    };
                    let args = ok!(self.parse_args());
                    expr = Expr::Call(name, args);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Parses markup until the end of the template or, for nested blocks,
    /// until the closing brace.
    fn parse_markup(&mut self, opened_at: Option<Span>) -> ParseResult<Vec<Stmt<'a>>> {
        let mut rv = Vec::new();
        let mut brace_depth = 0usize;
        let mut text_start = self.cursor.pos;
        let mut text_span = self.span();

        macro_rules! flush_text {
            ($trim:expr) => {{
                let mut text = &self.source[text_start..self.cursor.pos];
                if $trim {
                    text = trim_closing_indent(text);
                }
                if !text.is_empty() {
                    rv.push(Stmt {
                        kind: StmtKind::EmitRaw(text),
                        span: text_span,
                    });
                }
            }};
        }

        loop {
            let b = match self.peek_byte(0) {
                Some(b) => b,
                None => {
                    if let Some(opened_at) = opened_at {
                        return Err(self.syntax_error(
                            opened_at,
                            format!("missing '}}' for the block opened on line {}", opened_at.line),
                        ));
                    }
                    flush_text!(false);
                    return Ok(rv);
                }
            };
            match b {
                b'@' => {
                    let prev_is_word = self.cursor.pos > 0
                        && is_ident_char(self.source.as_bytes()[self.cursor.pos - 1]);
                    if prev_is_word && self.peek_byte(1).map_or(false, is_ident_char) {
                        // email addresses and similar stay literal text
                        self.advance(1);
                        continue;
                    }
                    flush_text!(false);
                    ok!(self.parse_transition(&mut rv));
                    text_start = self.cursor.pos;
                    text_span = self.span();
                }
                b'{' if opened_at.is_some() => {
                    brace_depth += 1;
                    self.advance(1);
                }
                b'}' if opened_at.is_some() => {
                    if brace_depth == 0 {
                        flush_text!(true);
                        self.advance(1);
                        return Ok(rv);
                    }
                    brace_depth -= 1;
                    self.advance(1);
                }
                _ => self.advance_char(),
            }
        }
    }

    fn parse_block_body(&mut self) -> ParseResult<Vec<Stmt<'a>>> {
        let opened_at = ok!(self.expect_punct("{"));
        self.skip_line_end();
        self.block_depth += 1;
        let rv = self.parse_markup(Some(opened_at));
        self.block_depth -= 1;
        rv
    }

    fn parse_transition(&mut self, rv: &mut Vec<Stmt<'a>>) -> ParseResult<()> {
        with_recursion_guard!(self, self.parse_transition_impl(rv))
    }

    fn parse_transition_impl(&mut self, rv: &mut Vec<Stmt<'a>>) -> ParseResult<()> {
        let span = self.span();
        self.advance(1);
        match self.peek_byte(0) {
            Some(b'@') => {
                let at = &self.source[self.cursor.pos..self.cursor.pos + 1];
                self.advance(1);
                rv.push(Stmt {
                    kind: StmtKind::EmitRaw(at),
                    span,
                });
            }
            Some(b'*') => match self.rest().find("*@") {
                Some(idx) => {
                    self.advance(idx + 2);
                }
                None => return Err(self.syntax_error(span, "unterminated comment")),
            },
            Some(b'(') => {
                self.advance(1);
                let expr = ok!(self.parse_expr());
                ok!(self.expect_punct(")"));
                rv.push(Stmt {
                    kind: StmtKind::EmitExpr(expr),
                    span,
                });
            }
            Some(b'{') => {
                self.advance(1);
                rv.extend(ok!(self.parse_code_block(span)));
            }
            Some(b) if is_ident_start(b) => {
                let ident = self.read_ident();
                let stmt = match ident {
                    "if" => ok!(self.parse_if(span)),
                    "foreach" => ok!(self.parse_foreach(span)),
                    "section" => ok!(self.parse_section(span)),
                    "model" => return self.parse_model_directive(span),
                    "layout" => ok!(self.parse_layout_directive(span)),
                    "else" => {
                        return Err(self.syntax_error(span, "'else' without a matching '@if'"))
                    }
                    _ => Stmt {
                        kind: StmtKind::EmitExpr(ok!(self.parse_implicit_expr(ident))),
                        span,
                    },
                };
                rv.push(stmt);
            }
            _ => return Err(self.syntax_error(span, "expected an expression after '@'")),
        }
        Ok(())
    }

    fn parse_if(&mut self, span: Span) -> ParseResult<Stmt<'a>> {
        ok!(self.expect_punct("("));
        let cond = ok!(self.parse_expr());
        ok!(self.expect_punct(")"));
        let body = ok!(self.parse_block_body());
        let save = self.cursor;
        self.skip_ws();
        let else_body = if self.at_keyword("else") {
            self.advance(4);
            self.skip_ws();
            if self.at_keyword("if") {
                let else_if_span = self.span();
                self.advance(2);
                vec![ok!(self.parse_if(else_if_span))]
            } else {
                let else_body = ok!(self.parse_block_body());
                self.skip_line_end();
                else_body
            }
        } else {
            self.cursor = save;
            self.skip_line_end();
            Vec::new()
        };
        Ok(Stmt {
            kind: StmtKind::If {
                cond,
                body,
                else_body,
            },
            span,
        })
    }

    fn parse_foreach(&mut self, span: Span) -> ParseResult<Stmt<'a>> {
        ok!(self.expect_punct("("));
        let (mut target, mut target_span) = ok!(self.expect_ident("loop variable"));
        if target == "var" {
            (target, target_span) = ok!(self.expect_ident("loop variable"));
        }
        ok!(self.check_assignable(target, target_span));
        match ok!(self.next_token()) {
            Some((Token::Ident("in"), _)) => {}
            Some((tok, span)) => {
                return Err(self.syntax_error(span, format!("expected 'in', found {}", tok)))
            }
            None => {
                return Err(self.syntax_error(self.span(), "expected 'in', found end of template"))
            }
        }
        let iter = ok!(self.parse_expr());
        ok!(self.expect_punct(")"));
        let body = ok!(self.parse_block_body());
        self.skip_line_end();
        Ok(Stmt {
            kind: StmtKind::ForEach { target, iter, body },
            span,
        })
    }

    fn parse_section(&mut self, span: Span) -> ParseResult<Stmt<'a>> {
        if self.in_section {
            return Err(self.syntax_error(span, "sections cannot be nested"));
        }
        if self.block_depth > 0 {
            return Err(self.syntax_error(span, "sections cannot be defined inside of blocks"));
        }
        self.skip_inline_ws();
        let name_span = self.span();
        let name = self.read_ident();
        if name.is_empty() {
            return Err(self.syntax_error(name_span, "expected a section name"));
        }
        if !self.sections.insert(name) {
            return Err(self.syntax_error(
                name_span,
                format!("section '{}' is defined more than once", name),
            ));
        }
        self.in_section = true;
        let body = self.parse_block_body();
        self.in_section = false;
        let body = ok!(body);
        self.skip_line_end();
        Ok(Stmt {
            kind: StmtKind::Section { name, body },
            span,
        })
    }

    fn parse_model_directive(&mut self, span: Span) -> ParseResult<()> {
        if !self.at_top_level() {
            return Err(self.syntax_error(span, "@model can only be used at the top level"));
        }
        if let Some((_, previous)) = self.model {
            return Err(self.syntax_error(
                span,
                format!(
                    "the @model directive may only appear once, it was already used on line {}",
                    previous.line
                ),
            ));
        }
        self.skip_inline_ws();
        let start = self.cursor.pos;
        while self.peek_byte(0).map_or(false, |b| is_ident_char(b) || b == b'.') {
            self.advance(1);
        }
        let type_name = &self.source[start..self.cursor.pos];
        if type_name.is_empty() {
            return Err(self.syntax_error(self.span(), "expected a type name after @model"));
        }
        self.model = Some((
            match type_name {
                "dynamic" => ModelDecl::Dynamic,
                name => ModelDecl::Named(name),
            },
            span,
        ));
        self.skip_line_end();
        Ok(())
    }

    fn parse_layout_directive(&mut self, span: Span) -> ParseResult<Stmt<'a>> {
        if !self.at_top_level() {
            return Err(self.syntax_error(span, "@layout can only be used at the top level"));
        }
        self.skip_inline_ws();
        let line = self.rest().split('\n').next().unwrap_or("");
        let name = line.trim().trim_matches('"');
        if name.is_empty() {
            return Err(self.syntax_error(self.span(), "expected a layout name after @layout"));
        }
        self.advance(line.len());
        self.skip_line_end();
        ok!(self.note_layout(span));
        Ok(Stmt {
            kind: StmtKind::SetLayout(Expr::Const(Value::from(name))),
            span,
        })
    }

    fn parse_code_block(&mut self, opened_at: Span) -> ParseResult<Vec<Stmt<'a>>> {
        let mut rv = Vec::new();
        loop {
            match ok!(self.peek_token()) {
                None => {
                    return Err(self.syntax_error(
                        opened_at,
                        format!(
                            "missing '}}' for the code block opened on line {}",
                            opened_at.line
                        ),
                    ))
                }
                Some(Token::Punct("}")) => {
                    ok!(self.next_token());
                    break;
                }
                Some(Token::Punct(";")) => {
                    ok!(self.next_token());
                }
                Some(_) => rv.push(ok!(self.parse_code_stmt())),
            }
        }
        self.skip_line_end();
        Ok(rv)
    }

    fn parse_assigned_value(&mut self) -> ParseResult<Expr<'a>> {
        ok!(self.expect_punct("="));
        let value = ok!(self.parse_expr());
        ok!(self.expect_punct(";"));
        Ok(value)
    }

    fn parse_code_stmt(&mut self) -> ParseResult<Stmt<'a>> {
        self.skip_ws();
        let span = self.span();
        let save = self.cursor;
        if let Some((Token::Ident(ident), ident_span)) = ok!(self.next_token()) {
            match ident {
                "var" => {
                    let (name, name_span) = ok!(self.expect_ident("variable name"));
                    ok!(self.check_assignable(name, name_span));
                    let value = ok!(self.parse_assigned_value());
                    return Ok(Stmt {
                        kind: StmtKind::SetLocal { name, value },
                        span,
                    });
                }
                "Layout" if ok!(self.peek_punct("=")) => {
                    let value = ok!(self.parse_assigned_value());
                    ok!(self.note_layout(span));
                    return Ok(Stmt {
                        kind: StmtKind::SetLayout(value),
                        span,
                    });
                }
                "ViewBag" if ok!(self.peek_punct(".")) => {
                    ok!(self.next_token());
                    let (name, _) = ok!(self.expect_ident("property name"));
                    if ok!(self.peek_punct("=")) {
                        let value = ok!(self.parse_assigned_value());
                        return Ok(Stmt {
                            kind: StmtKind::SetBag { name, value },
                            span,
                        });
                    }
                }
                name if ok!(self.peek_punct("=")) => {
                    ok!(self.check_assignable(name, ident_span));
                    let value = ok!(self.parse_assigned_value());
                    return Ok(Stmt {
                        kind: StmtKind::SetLocal { name, value },
                        span,
                    });
                }
                _ => {}
            }
        }
        self.cursor = save;
        let expr = ok!(self.parse_expr());
        ok!(self.expect_punct(";"));
        Ok(Stmt {
            kind: StmtKind::Do(expr),
            span,
        })
    }
}

/// Parses a template.
pub fn parse<'a>(source: &'a str, name: &'a str) -> Result<Template<'a>, Error> {
    let mut parser = Parser::new(name, source);
    let children = ok!(parser.parse_markup(None));
    Ok(Template {
        model: parser.model,
        children,
        assigns_layout: parser.assigns_layout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    fn parse_err(source: &str) -> Error {
        parse(source, "test.cshtml").unwrap_err()
    }

    #[test]
    fn test_literal_and_escapes() {
        let tmpl = parse("a@@b @* gone *@c me@example.com", "x").unwrap();
        let raw: Vec<_> = tmpl
            .children
            .iter()
            .map(|stmt| match stmt.kind {
                StmtKind::EmitRaw(text) => text,
                _ => panic!("unexpected statement"),
            })
            .collect();
        assert_eq!(raw, vec!["a", "@", "b ", "c me@example.com"]);
    }

    #[test]
    fn test_implicit_expression() {
        let tmpl = parse("<h1>Hello @Model.Person.Forename</h1>", "x").unwrap();
        assert_eq!(tmpl.children.len(), 3);
        insta::assert_debug_snapshot!(&tmpl.children[1].kind, @r###"
        EmitExpr(
            GetAttr(
                GetAttr(
                    Var(
                        "Model",
                    ),
                    "Person",
                ),
                "Forename",
            ),
        )
        "###);
    }

    #[test]
    fn test_trailing_dot_is_text() {
        let tmpl = parse("Hi @Model.Name.", "x").unwrap();
        assert!(matches!(tmpl.children[2].kind, StmtKind::EmitRaw(".")));
    }

    #[test]
    fn test_dotted_call() {
        let tmpl = parse("@Html.Raw(Model.Body)", "x").unwrap();
        match &tmpl.children[0].kind {
            StmtKind::EmitExpr(Expr::Call(name, args)) => {
                assert_eq!(name, "Html.Raw");
                assert_eq!(args.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_operator_precedence() {
        let tmpl = parse("@(1 + 2 * 3 == 7 && !false)", "x").unwrap();
        insta::assert_debug_snapshot!(&tmpl.children[0].kind, @r###"
        EmitExpr(
            And(
                BinOp(
                    Eq,
                    BinOp(
                        Add,
                        Const(
                            1,
                        ),
                        BinOp(
                            Mul,
                            Const(
                                2,
                            ),
                            Const(
                                3,
                            ),
                        ),
                    ),
                    Const(
                        7,
                    ),
                ),
                UnaryOp(
                    Not,
                    Const(
                        false,
                    ),
                ),
            ),
        )
        "###);
    }

    #[test]
    fn test_code_block_statements() {
        let tmpl = parse(
            "@{\n    Layout = \"_layout\";\n    ViewBag.Title = \"Home\";\n    var n = 1;\n    n = n + 1;\n}\nbody",
            "x",
        )
        .unwrap();
        assert!(tmpl.assigns_layout);
        let kinds: Vec<_> = tmpl
            .children
            .iter()
            .map(|stmt| match &stmt.kind {
                StmtKind::SetLayout(_) => "layout",
                StmtKind::SetBag { .. } => "bag",
                StmtKind::SetLocal { .. } => "local",
                StmtKind::EmitRaw(_) => "raw",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["layout", "bag", "local", "local", "raw"]);
        assert!(matches!(tmpl.children[4].kind, StmtKind::EmitRaw("body")));
    }

    #[test]
    fn test_if_else_chain() {
        let tmpl = parse(
            "@if (Model.A) {\n  a\n} else if (Model.B) {\n  b\n} else {\n  c\n}\nend",
            "x",
        )
        .unwrap();
        assert_eq!(tmpl.children.len(), 2);
        match &tmpl.children[0].kind {
            StmtKind::If { body, else_body, .. } => {
                assert!(matches!(body[0].kind, StmtKind::EmitRaw("  a\n")));
                assert!(matches!(else_body[0].kind, StmtKind::If { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(tmpl.children[1].kind, StmtKind::EmitRaw("end")));
    }

    #[test]
    fn test_foreach_and_nested_braces() {
        let tmpl = parse("@foreach (var item in Model.Items) {<i>{@item}</i>}", "x").unwrap();
        match &tmpl.children[0].kind {
            StmtKind::ForEach { target, body, .. } => {
                assert_eq!(*target, "item");
                assert_eq!(body.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_model_directive() {
        let tmpl = parse("@model Person\n<p>@Model.Name</p>", "x").unwrap();
        assert_eq!(tmpl.model.unwrap().0, ModelDecl::Named("Person"));
        assert!(matches!(tmpl.children[0].kind, StmtKind::EmitRaw("<p>")));
    }

    #[test]
    fn test_unbalanced_block() {
        let err = parse_err("line\n@if (true) {\n<p>open");
        assert_eq!(err.kind(), ErrorKind::SyntaxError);
        assert_eq!(err.line(), Some(2));
        assert_eq!(
            err.detail(),
            Some("missing '}' for the block opened on line 2")
        );
        assert_eq!(err.diagnostics()[0].snippet, "@if (true) {");
    }

    #[test]
    fn test_unclosed_code_block() {
        let err = parse_err("@{ var x = 1;");
        assert_eq!(
            err.detail(),
            Some("missing '}' for the code block opened on line 1")
        );
    }

    #[test]
    fn test_nested_sections() {
        let err = parse_err("@section A {\n@section B { x }\n}");
        assert_eq!(err.detail(), Some("sections cannot be nested"));
        assert_eq!(err.line(), Some(2));
    }

    #[test]
    fn test_section_inside_block() {
        let err = parse_err("@if (true) { @section A { x } }");
        assert_eq!(err.detail(), Some("sections cannot be defined inside of blocks"));
    }

    #[test]
    fn test_duplicate_model() {
        let err = parse_err("@model A\n@model B\n");
        assert_eq!(err.line(), Some(2));
        assert_eq!(
            err.detail(),
            Some("the @model directive may only appear once, it was already used on line 1")
        );
    }

    #[test]
    fn test_conflicting_layouts() {
        let err = parse_err("@layout a\n@{ Layout = \"b\"; }");
        assert_eq!(err.line(), Some(2));
        // assignments inside blocks are decided at runtime
        parse("@{ Layout = \"a\"; }\n@if (Model.X) { @{ Layout = \"b\"; } }", "x").unwrap();
    }

    #[test]
    fn test_reserved_assignment() {
        let err = parse_err("@{ var Model = 1; }");
        assert_eq!(err.detail(), Some("cannot assign to reserved name 'Model'"));
    }

    #[test]
    fn test_bad_transition() {
        let err = parse_err("a @ b");
        assert_eq!(err.detail(), Some("expected an expression after '@'"));
        let err = parse_err("@(1 + )");
        assert_eq!(err.detail(), Some("expected an expression, found ')'"));
    }

    #[test]
    fn test_named_arguments() {
        let tmpl = parse("@RenderSection(\"Scripts\", required: false)", "x").unwrap();
        match &tmpl.children[0].kind {
            StmtKind::EmitExpr(Expr::Call(name, args)) => {
                assert_eq!(name, "RenderSection");
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_recursion_limit() {
        let deep = format!("@({}1{})", "(".repeat(100_000), ")".repeat(100_000));
        let err = parse_err(&deep);
        assert_eq!(err.kind(), ErrorKind::SyntaxError);
        assert_eq!(
            err.detail(),
            Some("template exceeds maximum recursion limits")
        );

        let err = parse_err(&format!("@({}1)", "!".repeat(100_000)));
        assert_eq!(err.kind(), ErrorKind::SyntaxError);

        let blocks = format!("{}x{}", "@if (true) {".repeat(1000), "}".repeat(1000));
        let err = parse_err(&blocks);
        assert_eq!(err.kind(), ErrorKind::SyntaxError);

        parse(&format!("@({}1{})", "(".repeat(40), ")".repeat(40)), "x").unwrap();
        parse(&format!("{}x{}", "@if (true) {".repeat(40), "}".repeat(40)), "x").unwrap();
    }
}

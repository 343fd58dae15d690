use crate::value::Value;

/// A position in the template source.  Lines and columns are 1-based.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

/// The declared model of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelDecl<'a> {
    Dynamic,
    Named(&'a str),
}

/// A parsed template.
#[derive(Debug)]
pub struct Template<'a> {
    pub model: Option<(ModelDecl<'a>, Span)>,
    pub children: Vec<Stmt<'a>>,
    /// Set if any statement anywhere in the template assigns a layout.
    pub assigns_layout: bool,
}

#[derive(Debug)]
pub struct Stmt<'a> {
    pub kind: StmtKind<'a>,
    pub span: Span,
}

#[derive(Debug)]
pub enum StmtKind<'a> {
    /// Literal template text.
    EmitRaw(&'a str),
    /// An expression whose value is written.
    EmitExpr(Expr<'a>),
    If {
        cond: Expr<'a>,
        body: Vec<Stmt<'a>>,
        else_body: Vec<Stmt<'a>>,
    },
    ForEach {
        target: &'a str,
        iter: Expr<'a>,
        body: Vec<Stmt<'a>>,
    },
    Section {
        name: &'a str,
        body: Vec<Stmt<'a>>,
    },
    SetLayout(Expr<'a>),
    SetBag {
        name: &'a str,
        value: Expr<'a>,
    },
    SetLocal {
        name: &'a str,
        value: Expr<'a>,
    },
    /// An expression evaluated for its side effects.
    Do(Expr<'a>),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnaryOpKind {
    Not,
    Neg,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BinOpKind {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug)]
pub enum Expr<'a> {
    Const(Value),
    Var(&'a str),
    GetAttr(Box<Expr<'a>>, &'a str),
    GetItem(Box<Expr<'a>>, Box<Expr<'a>>),
    /// A call to a function by its (possibly dotted) name.
    Call(String, Vec<Expr<'a>>),
    UnaryOp(UnaryOpKind, Box<Expr<'a>>),
    BinOp(BinOpKind, Box<Expr<'a>>, Box<Expr<'a>>),
    And(Box<Expr<'a>>, Box<Expr<'a>>),
    Or(Box<Expr<'a>>, Box<Expr<'a>>),
}

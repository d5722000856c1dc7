// packages/engine/src/script/ast.rs
//! Syntax tree for submitted functions

use crate::codec::Value;
use crate::utils::errors::SourceLocation;

/// A parsed submission: imports plus function definitions, in source order
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub imports: Vec<Import>,
    pub functions: Vec<FnDef>,
}

impl Program {
    pub fn function(&self, name: &str) -> Option<&FnDef> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub module: String,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FnDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Block,
    pub location: SourceLocation,
}

pub type Block = Vec<Stmt>;

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let {
        name: String,
        value: Expr,
    },
    /// `target[path0][path1] = value`
    Assign {
        target: String,
        path: Vec<Expr>,
        value: Expr,
    },
    Return(Option<Expr>),
    Raise(Expr),
    If {
        cond: Expr,
        then: Block,
        otherwise: Option<Block>,
    },
    While {
        cond: Expr,
        body: Block,
        location: SourceLocation,
    },
    For {
        var: String,
        iter: Expr,
        body: Block,
    },
    Try {
        body: Block,
        binding: String,
        handler: Block,
    },
    Break,
    Continue,
    Expr(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Or => "or",
            BinaryOp::And => "and",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(Value),
    Var(String),
    List(Vec<Expr>),
    Map(Vec<(String, Expr)>),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Call(Call),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub callee: Callee,
    pub args: Vec<Expr>,
    pub location: SourceLocation,
}

/// What a call names, as written in the source
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Callee {
    /// `name(...)`: a function of this submission or a builtin
    Local(String),
    /// `module.member(...)`
    Module { module: String, member: String },
    /// `namespace::name(...)`: the entry function of another submission
    Remote { namespace: String, name: String },
}

impl std::fmt::Display for Callee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Callee::Local(name) => f.write_str(name),
            Callee::Module { module, member } => write!(f, "{}.{}", module, member),
            Callee::Remote { namespace, name } => write!(f, "{}::{}", namespace, name),
        }
    }
}

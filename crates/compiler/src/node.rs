//! Expression and statement tree
//!
//! Nodes own their children exclusively. Every node produced by the parser
//! carries a type (statements get `void`), a source token, and a kind with
//! the per-variant payload.
//!
//! Subscripts and `->` are desugared at parse time: `a[b]` becomes
//! `*(a + b)` and `p->m` becomes `(*p).m`, so the code generator only ever
//! sees dereferences and direct member accesses.

use std::rc::Rc;

use crate::errors::{CompileError, ErrorKind, Result};
use crate::symbol::{SymbolKind, SymbolRef};
use crate::token::TokenRef;
use crate::types::{BaseType, Type, TypeRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    BitNot,
    LogNot,
    Deref,
    AddrOf,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    LogAnd,
    LogOr,
}

impl BinaryOp {
    /// Binding power for precedence climbing, per C17 6.5.
    pub fn precedence(self) -> u8 {
        use BinaryOp::*;
        match self {
            Mul | Div | Mod => 10,
            Add | Sub => 9,
            Shl | Shr => 8,
            Lt | Gt | Le | Ge => 7,
            Eq | Ne => 6,
            BitAnd => 5,
            BitXor => 4,
            BitOr => 3,
            LogAnd => 2,
            LogOr => 1,
        }
    }

    pub fn from_token(text: &str) -> Option<BinaryOp> {
        use BinaryOp::*;
        Some(match text {
            "*" => Mul,
            "/" => Div,
            "%" => Mod,
            "+" => Add,
            "-" => Sub,
            "<<" => Shl,
            ">>" => Shr,
            "<" => Lt,
            ">" => Gt,
            "<=" => Le,
            ">=" => Ge,
            "==" => Eq,
            "!=" => Ne,
            "&" => BitAnd,
            "^" => BitXor,
            "|" => BitOr,
            "&&" => LogAnd,
            "||" => LogOr,
            _ => return None,
        })
    }

    /// The operator of a compound assignment token such as `+=`.
    pub fn from_compound_assignment(text: &str) -> Option<BinaryOp> {
        use BinaryOp::*;
        Some(match text {
            "+=" => Add,
            "-=" => Sub,
            "*=" => Mul,
            "/=" => Div,
            "%=" => Mod,
            "<<=" => Shl,
            ">>=" => Shr,
            "&=" => BitAnd,
            "^=" => BitXor,
            "|=" => BitOr,
            _ => return None,
        })
    }

    pub fn is_comparison(self) -> bool {
        use BinaryOp::*;
        matches!(self, Lt | Gt | Le | Ge | Eq | Ne)
    }

    pub fn is_shift(self) -> bool {
        matches!(self, BinaryOp::Shl | BinaryOp::Shr)
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::LogAnd | BinaryOp::LogOr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    VaStart,
    VaArg,
    VaEnd,
    VaCopy,
    /// `__func__`, lazily bound to a string label per function.
    FuncName,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Number(u64),
    Character(u8),
    StringLit {
        label: u32,
        /// The concatenated literal bytes, without the trailing NUL.
        value: Rc<str>,
    },
    Access(SymbolRef),
    Builtin(Builtin),
    Unary(UnaryOp),
    Binary(BinaryOp),
    /// `=` when the payload is None, a compound assignment otherwise.
    Assign(Option<BinaryOp>),
    /// children: callee, then arguments.
    Call,
    /// Member access on the first child; the offset is combined across
    /// anonymous nesting.
    Member {
        name: Rc<str>,
        offset: u32,
    },
    Cast,
    /// Comma operator or statement expression; value of the last child.
    Sequence,
    /// `?:` with children condition, then-value, else-value.
    Conditional,

    // Statements
    If,
    While,
    DoWhile,
    For,
    Switch,
    Case(u64),
    Default,
    Return,
    Goto(Rc<str>),
    Label(Rc<str>),
    Break,
    Continue,
    /// Compound statement; a scope boundary for local storage reuse.
    Block,
    Empty,

    Function,
    Parameter(Option<SymbolRef>),
    /// Local variable declaration; the initializer is the only child.
    Variable(SymbolRef),
    InitList,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub token: TokenRef,
    pub ty: TypeRef,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(kind: NodeKind, token: TokenRef, ty: TypeRef) -> Node {
        Node {
            kind,
            token,
            ty,
            children: Vec::new(),
        }
    }

    pub fn with_children(kind: NodeKind, token: TokenRef, ty: TypeRef, children: Vec<Node>) -> Node {
        Node {
            kind,
            token,
            ty,
            children,
        }
    }

    pub fn append(&mut self, child: Node) {
        self.children.push(child);
    }

    /// True for nodes that only make sense in statement position. A
    /// statement expression's children can mix these with value-producing
    /// expressions.
    pub fn is_statement(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::If
                | NodeKind::While
                | NodeKind::DoWhile
                | NodeKind::For
                | NodeKind::Switch
                | NodeKind::Case(_)
                | NodeKind::Default
                | NodeKind::Return
                | NodeKind::Goto(_)
                | NodeKind::Label(_)
                | NodeKind::Break
                | NodeKind::Continue
                | NodeKind::Block
                | NodeKind::Variable(_)
                | NodeKind::Empty
        )
    }

    /// A node that refers to a storage location: a variable or function
    /// access, a dereference, or a member access. Subscripts qualify
    /// through their dereference desugaring.
    pub fn is_location(&self) -> bool {
        match &self.kind {
            NodeKind::Access(symbol) => symbol.borrow().kind != SymbolKind::Constant,
            NodeKind::Unary(UnaryOp::Deref) => true,
            NodeKind::Member { .. } => true,
            NodeKind::StringLit { .. } => true,
            _ => false,
        }
    }

    /// A literal zero of integer type, or such a zero cast to `void*`.
    pub fn is_null_pointer_constant(&self) -> bool {
        match &self.kind {
            NodeKind::Number(0) => self.ty.is_integer(),
            NodeKind::Cast => {
                let is_void_ptr = self
                    .ty
                    .pointee()
                    .is_some_and(|p| p.is_void())
                    && self.ty.is_pointer();
                is_void_ptr && self.children[0].is_null_pointer_constant()
            }
            _ => false,
        }
    }

    fn const_error<T>(&self) -> Result<T> {
        Err(CompileError::at(
            ErrorKind::ConstantExpressionRequired,
            &self.token,
            "Expected a constant expression.",
        ))
    }

    /// Evaluates a constant expression to its bit pattern, truncated to the
    /// node's type. Used for enum values, case labels, array sizes and
    /// static initializers.
    pub fn eval(&self) -> Result<u64> {
        let value = self.eval_untruncated()?;
        Ok(truncate_to(value, &self.ty))
    }

    fn eval_untruncated(&self) -> Result<u64> {
        match &self.kind {
            NodeKind::Number(v) => Ok(*v),
            NodeKind::Character(c) => Ok(u64::from(*c)),
            NodeKind::Access(symbol) => {
                let symbol = symbol.borrow();
                if symbol.kind == SymbolKind::Constant {
                    Ok(symbol.value)
                } else {
                    self.const_error()
                }
            }
            NodeKind::Cast => self.children[0]
                .eval()
                .map(|v| sign_extend(v, &self.children[0].ty)),
            NodeKind::Unary(op) => {
                let v = self.children[0].eval()?;
                match op {
                    UnaryOp::Plus => Ok(v),
                    UnaryOp::Minus => Ok(v.wrapping_neg()),
                    UnaryOp::BitNot => Ok(!v),
                    UnaryOp::LogNot => Ok(u64::from(v == 0)),
                    _ => self.const_error(),
                }
            }
            NodeKind::Conditional => {
                let cond = self.children[0].eval()?;
                if cond != 0 {
                    self.children[1].eval()
                } else {
                    self.children[2].eval()
                }
            }
            NodeKind::Binary(op) => self.eval_binary(*op),
            _ => self.const_error(),
        }
    }

    fn eval_binary(&self, op: BinaryOp) -> Result<u64> {
        use BinaryOp::*;

        // Logical operators short-circuit even in constant expressions.
        if op == LogAnd {
            let left = self.children[0].eval()?;
            if left == 0 {
                return Ok(0);
            }
            return Ok(u64::from(self.children[1].eval()? != 0));
        }
        if op == LogOr {
            let left = self.children[0].eval()?;
            if left != 0 {
                return Ok(1);
            }
            return Ok(u64::from(self.children[1].eval()? != 0));
        }

        let lhs_node = &self.children[0];
        let rhs_node = &self.children[1];
        let lhs = lhs_node.eval()?;
        let rhs = rhs_node.eval()?;
        let signed = lhs_node.ty.is_signed();
        let sl = sign_extend(lhs, &lhs_node.ty) as i64;
        let sr = sign_extend(rhs, &rhs_node.ty) as i64;

        match op {
            Add => Ok(lhs.wrapping_add(rhs)),
            Sub => Ok(lhs.wrapping_sub(rhs)),
            Mul => Ok(lhs.wrapping_mul(rhs)),
            Div | Mod => {
                if rhs == 0 {
                    return Err(CompileError::at(
                        ErrorKind::ConstantExpressionRequired,
                        &self.token,
                        "Division by zero in constant expression.",
                    ));
                }
                let value = if signed {
                    let (q, r) = (sl.wrapping_div(sr), sl.wrapping_rem(sr));
                    if op == Div { q as u64 } else { r as u64 }
                } else if op == Div {
                    lhs / rhs
                } else {
                    lhs % rhs
                };
                Ok(value)
            }
            Shl => Ok(lhs.wrapping_shl(rhs as u32)),
            Shr => {
                if signed {
                    Ok((sl.wrapping_shr(rhs as u32)) as u64)
                } else {
                    Ok(lhs.wrapping_shr(rhs as u32))
                }
            }
            BitAnd => Ok(lhs & rhs),
            BitOr => Ok(lhs | rhs),
            BitXor => Ok(lhs ^ rhs),
            Lt => Ok(u64::from(if signed { sl < sr } else { lhs < rhs })),
            Gt => Ok(u64::from(if signed { sl > sr } else { lhs > rhs })),
            Le => Ok(u64::from(if signed { sl <= sr } else { lhs <= rhs })),
            Ge => Ok(u64::from(if signed { sl >= sr } else { lhs >= rhs })),
            Eq => Ok(u64::from(lhs == rhs)),
            Ne => Ok(u64::from(lhs != rhs)),
            LogAnd | LogOr => unreachable!(),
        }
    }

    /// Prints the tree for `--dump-ast`.
    pub fn print_tree(&self, out: &mut dyn std::io::Write, depth: usize) -> std::io::Result<()> {
        write!(out, "{:indent$}", "", indent = depth * 2)?;
        match &self.kind {
            NodeKind::Number(v) => write!(out, "number {}", v)?,
            NodeKind::Character(c) => write!(out, "character {}", c)?,
            NodeKind::StringLit { label, .. } => write!(out, "string #{:x}", label)?,
            NodeKind::Access(symbol) => write!(out, "access {}", symbol.borrow().name)?,
            NodeKind::Builtin(b) => write!(out, "builtin {:?}", b)?,
            NodeKind::Unary(op) => write!(out, "unary {:?}", op)?,
            NodeKind::Binary(op) => write!(out, "binary {:?}", op)?,
            NodeKind::Assign(None) => write!(out, "assign")?,
            NodeKind::Assign(Some(op)) => write!(out, "assign {:?}", op)?,
            NodeKind::Member { name, offset } => write!(out, "member {} @{}", name, offset)?,
            NodeKind::Goto(name) => write!(out, "goto {}", name)?,
            NodeKind::Label(name) => write!(out, "label {}", name)?,
            NodeKind::Case(v) => write!(out, "case {}", v)?,
            NodeKind::Variable(symbol) => write!(out, "variable {}", symbol.borrow().name)?,
            NodeKind::Parameter(Some(symbol)) => {
                write!(out, "parameter {}", symbol.borrow().name)?
            }
            other => write!(out, "{}", format!("{:?}", other).to_lowercase())?,
        }
        writeln!(out, " : {}", self.ty)?;
        for child in &self.children {
            child.print_tree(out, depth + 1)?;
        }
        Ok(())
    }
}

/// Masks a value down to the width of the given type.
pub fn truncate_to(value: u64, ty: &TypeRef) -> u64 {
    match ty.size().unwrap_or(8) {
        1 => value & 0xff,
        2 => value & 0xffff,
        4 => value & 0xffff_ffff,
        _ => value,
    }
}

/// Sign-extends a truncated value according to the type's width and
/// signedness.
pub fn sign_extend(value: u64, ty: &TypeRef) -> u64 {
    if !ty.is_signed() {
        return value;
    }
    match ty.size().unwrap_or(8) {
        1 => (value as u8) as i8 as i64 as u64,
        2 => (value as u16) as i16 as i64 as u64,
        4 => (value as u32) as i32 as i64 as u64,
        _ => value,
    }
}

/// Convenience constructor for an int-typed number node.
pub fn number(value: u64, token: TokenRef) -> Node {
    Node::new(
        NodeKind::Number(value),
        token,
        Type::base(BaseType::SignedInt),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Token, TokenKind};

    fn tok() -> TokenRef {
        Token::new(TokenKind::Number, Rc::from("0"), Rc::from("test.i"), 1)
    }

    fn num(v: u64) -> Node {
        number(v, tok())
    }

    fn binary(op: BinaryOp, l: Node, r: Node) -> Node {
        Node::with_children(
            NodeKind::Binary(op),
            tok(),
            Type::base(BaseType::SignedInt),
            vec![l, r],
        )
    }

    #[test]
    fn test_eval_arithmetic() {
        let n = binary(BinaryOp::Add, num(3), binary(BinaryOp::Mul, num(4), num(5)));
        assert_eq!(n.eval().unwrap(), 23);
    }

    #[test]
    fn test_eval_signed_division() {
        let minus_seven = Node::with_children(
            NodeKind::Unary(UnaryOp::Minus),
            tok(),
            Type::base(BaseType::SignedInt),
            vec![num(7)],
        );
        let n = binary(BinaryOp::Div, minus_seven, num(2));
        assert_eq!(n.eval().unwrap() as u32 as i32, -3);
    }

    #[test]
    fn test_eval_division_by_zero() {
        let n = binary(BinaryOp::Div, num(1), num(0));
        assert_eq!(
            n.eval().unwrap_err().kind,
            ErrorKind::ConstantExpressionRequired
        );
    }

    #[test]
    fn test_eval_comparison() {
        let n = binary(BinaryOp::Lt, num(2), num(5));
        assert_eq!(n.eval().unwrap(), 1);
    }

    #[test]
    fn test_eval_truncates_to_type() {
        let mut cast = Node::with_children(
            NodeKind::Cast,
            tok(),
            Type::base(BaseType::SignedChar),
            vec![num(0x123)],
        );
        assert_eq!(cast.eval().unwrap(), 0x23);
        cast.ty = Type::base(BaseType::UnsignedChar);
        assert_eq!(cast.eval().unwrap(), 0x23);
    }

    #[test]
    fn test_eval_logical_short_circuit() {
        // 0 && (1/0) must not evaluate the division
        let n = binary(BinaryOp::LogAnd, num(0), binary(BinaryOp::Div, num(1), num(0)));
        assert_eq!(n.eval().unwrap(), 0);
    }

    #[test]
    fn test_non_constant_rejected() {
        let n = Node::new(NodeKind::Call, tok(), Type::base(BaseType::SignedInt));
        assert_eq!(
            n.eval().unwrap_err().kind,
            ErrorKind::ConstantExpressionRequired
        );
    }

    #[test]
    fn test_null_pointer_constant() {
        assert!(num(0).is_null_pointer_constant());
        assert!(!num(1).is_null_pointer_constant());

        let void_ptr = Type::pointer(Type::base(BaseType::Void), false, false, false);
        let cast = Node::with_children(NodeKind::Cast, tok(), void_ptr, vec![num(0)]);
        assert!(cast.is_null_pointer_constant());
    }
}

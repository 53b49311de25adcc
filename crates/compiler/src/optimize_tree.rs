//! Tree-level optimisation
//!
//! Constant folding on the expression tree, bottom-up. A node folds only
//! when its constant evaluation succeeds, which guarantees no side effects
//! are lost: any call, access or assignment in an operand makes the
//! evaluation fail and the node is left alone. Short-circuit and
//! conditional folding drop statically unreachable operands, matching the
//! language's evaluation rules.

use crate::node::{Node, NodeKind, UnaryOp};

fn foldable(node: &Node) -> bool {
    match &node.kind {
        NodeKind::Binary(_) | NodeKind::Conditional | NodeKind::Cast => true,
        NodeKind::Unary(op) => matches!(
            op,
            UnaryOp::Plus | UnaryOp::Minus | UnaryOp::BitNot | UnaryOp::LogNot
        ),
        _ => false,
    }
}

/// Folds constant subtrees into number nodes in place.
pub fn optimize(node: &mut Node) {
    for child in &mut node.children {
        optimize(child);
    }

    if !foldable(node) {
        return;
    }
    // Only integer-valued results fold; pointer-typed casts stay so the
    // code generator still sees the conversion.
    if !node.ty.is_integer() && !node.ty.is_bool() {
        return;
    }

    if let Ok(value) = node.eval() {
        node.kind = NodeKind::Number(value);
        node.children.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{number, BinaryOp};
    use crate::token::{Token, TokenKind, TokenRef};
    use crate::types::{BaseType, Type};
    use std::rc::Rc;

    fn tok() -> TokenRef {
        Token::new(TokenKind::Number, Rc::from("0"), Rc::from("test.i"), 1)
    }

    fn binary(op: BinaryOp, left: Node, right: Node) -> Node {
        Node::with_children(
            NodeKind::Binary(op),
            tok(),
            Type::base(BaseType::SignedInt),
            vec![left, right],
        )
    }

    #[test]
    fn test_folds_constant_arithmetic() {
        let mut node = binary(
            BinaryOp::Add,
            number(2, tok()),
            binary(BinaryOp::Mul, number(3, tok()), number(4, tok())),
        );
        optimize(&mut node);
        assert!(matches!(node.kind, NodeKind::Number(14)));
        assert!(node.children.is_empty());
    }

    #[test]
    fn test_leaves_non_constant_alone() {
        let call = Node::new(NodeKind::Call, tok(), Type::base(BaseType::SignedInt));
        let mut node = binary(BinaryOp::Add, number(1, tok()), call);
        optimize(&mut node);
        assert!(matches!(node.kind, NodeKind::Binary(BinaryOp::Add)));
        assert_eq!(node.children.len(), 2);
    }

    #[test]
    fn test_folds_nested_constants_under_call() {
        // The call itself cannot fold, but its constant argument can.
        let arg = binary(BinaryOp::Shl, number(1, tok()), number(4, tok()));
        let mut call = Node::with_children(
            NodeKind::Call,
            tok(),
            Type::base(BaseType::SignedInt),
            vec![arg],
        );
        optimize(&mut call);
        assert!(matches!(call.children[0].kind, NodeKind::Number(16)));
    }

    #[test]
    fn test_division_by_zero_not_folded() {
        let mut node = binary(BinaryOp::Div, number(1, tok()), number(0, tok()));
        optimize(&mut node);
        assert!(matches!(node.kind, NodeKind::Binary(BinaryOp::Div)));
    }

    #[test]
    fn test_conditional_drops_dead_branch() {
        let call = Node::new(NodeKind::Call, tok(), Type::base(BaseType::SignedInt));
        let mut node = Node::with_children(
            NodeKind::Conditional,
            tok(),
            Type::base(BaseType::SignedInt),
            vec![number(0, tok()), call, number(7, tok())],
        );
        optimize(&mut node);
        assert!(matches!(node.kind, NodeKind::Number(7)));
    }

    #[test]
    fn test_cast_truncation_folds() {
        let mut node = Node::with_children(
            NodeKind::Cast,
            tok(),
            Type::base(BaseType::SignedChar),
            vec![number(0x123, tok())],
        );
        optimize(&mut node);
        assert!(matches!(node.kind, NodeKind::Number(0x23)));
    }
}

//! Initialiser parsing
//!
//! A scalar initialiser is an assignment expression converted to the
//! declared type. An aggregate initialiser is a brace list with optional
//! `.member` and `[index]` designators; elements sit positionally in the
//! resulting list node, with empty placeholders for gaps that the
//! consumer fills with zeroes. A char array may also be initialised from
//! a string literal.

use crate::errors::{err, ErrorKind, Result};
use crate::node::{Node, NodeKind};
use crate::token::TokenKind;
use crate::types::{BaseType, Type, TypeKind, TypeRef};
use crate::Compiler;

fn is_char_array(ty: &TypeRef) -> bool {
    ty.is_array()
        && ty
            .pointee()
            .is_some_and(|e| matches!(e.as_base(), Some(BaseType::Char | BaseType::SignedChar | BaseType::UnsignedChar)))
}

impl Compiler {
    pub fn parse_initializer(&mut self, ty: &TypeRef) -> Result<Node> {
        if self.lexer.is("{") {
            return self.parse_initializer_list(ty);
        }

        let value = self.parse_assignment_expression()?;

        // A char array takes a string literal directly.
        if is_char_array(ty) {
            if matches!(value.kind, NodeKind::StringLit { .. }) {
                return Ok(value);
            }
            return err(
                ErrorKind::InvalidInitializer,
                &value.token,
                "An array initializer must be a brace list or a string literal.",
            );
        }
        if ty.is_array() {
            return err(
                ErrorKind::InvalidInitializer,
                &value.token,
                "An array initializer must be a brace list or a string literal.",
            );
        }

        let token = value.token.clone();
        self.convert(value, ty, &token)
    }

    fn parse_initializer_list(&mut self, ty: &TypeRef) -> Result<Node> {
        let token = self.lexer.take()?; // `{`

        match &ty.kind {
            TypeKind::Array { element, count } => {
                let element = element.clone();
                let count = Some(*count);
                self.parse_array_initializer(ty, &element, count, token)
            }
            TypeKind::Indeterminate { element } => {
                let element = element.clone();
                self.parse_array_initializer(ty, &element, None, token)
            }
            TypeKind::Record(record) => {
                let record = record.clone();
                if !record.borrow().is_defined {
                    return err(
                        ErrorKind::IncompleteType,
                        &token,
                        "Cannot initialize an incomplete struct or union.",
                    );
                }
                self.parse_record_initializer(ty, record, token)
            }
            _ => {
                // A scalar wrapped in braces.
                let value = self.parse_initializer(ty)?;
                self.lexer.accept(",")?;
                self.lexer
                    .expect("}", "Expected `}` after scalar initializer.")?;
                Ok(value)
            }
        }
    }

    fn parse_array_initializer(
        &mut self,
        ty: &TypeRef,
        element: &TypeRef,
        count: Option<u32>,
        token: crate::token::TokenRef,
    ) -> Result<Node> {
        let mut slots: Vec<Option<Node>> = Vec::new();
        let mut cursor: usize = 0;

        loop {
            if self.lexer.accept("}")? {
                break;
            }

            // `[index] =` designator
            if self.lexer.accept("[")? {
                let index = self.parse_constant_u32()? as usize;
                self.lexer
                    .expect("]", "Expected `]` after designator index.")?;
                self.lexer.expect("=", "Expected `=` after designator.")?;
                cursor = index;
            }

            if let Some(count) = count {
                if cursor >= count as usize {
                    return err(
                        ErrorKind::InvalidInitializer,
                        &self.lexer.token,
                        "Too many elements in array initializer.",
                    );
                }
            }

            let value = self.parse_initializer(element)?;
            if slots.len() <= cursor {
                slots.resize_with(cursor + 1, || None);
            }
            slots[cursor] = Some(value);
            cursor += 1;

            if self.lexer.accept(",")? {
                continue;
            }
            self.lexer
                .expect("}", "Expected `,` or `}` in array initializer.")?;
            break;
        }

        let children = slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Node::new(NodeKind::Empty, token.clone(), element.clone())
                })
            })
            .collect();
        Ok(Node::with_children(
            NodeKind::InitList,
            token,
            ty.clone(),
            children,
        ))
    }

    fn parse_record_initializer(
        &mut self,
        ty: &TypeRef,
        record: crate::types::RecordRef,
        token: crate::token::TokenRef,
    ) -> Result<Node> {
        let member_count = record.borrow().members.len();
        let is_struct = record.borrow().is_struct;
        let mut slots: Vec<Option<Node>> = Vec::new();
        let mut cursor: usize = 0;

        loop {
            if self.lexer.accept("}")? {
                break;
            }

            // `.member =` designator
            if self.lexer.accept(".")? {
                if self.lexer.token.kind != TokenKind::Alphanumeric {
                    return err(
                        ErrorKind::ExpectedToken,
                        &self.lexer.token,
                        "Expected a member name after `.` designator.",
                    );
                }
                let name = self.lexer.take()?;
                let index = record.borrow().members.iter().position(|m| {
                    m.name
                        .as_ref()
                        .is_some_and(|n| n.value == name.value)
                });
                let Some(index) = index else {
                    return err(
                        ErrorKind::UnknownName,
                        &name,
                        format!("No member named `{}`.", name.value),
                    );
                };
                self.lexer.expect("=", "Expected `=` after designator.")?;
                cursor = index;
            }

            if cursor >= member_count {
                return err(
                    ErrorKind::InvalidInitializer,
                    &self.lexer.token,
                    "Too many elements in struct initializer.",
                );
            }
            if !is_struct && cursor != 0 {
                return err(
                    ErrorKind::UnsupportedFeature,
                    &self.lexer.token,
                    "Only the first member of a union can be initialized.",
                );
            }

            let member_ty = record.borrow().members[cursor].ty.clone();
            let value = self.parse_initializer(&member_ty)?;
            if slots.len() <= cursor {
                slots.resize_with(cursor + 1, || None);
            }
            slots[cursor] = Some(value);
            cursor += 1;

            if self.lexer.accept(",")? {
                continue;
            }
            self.lexer
                .expect("}", "Expected `,` or `}` in struct initializer.")?;
            break;
        }

        let children = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    let member_ty = record.borrow().members[index].ty.clone();
                    Node::new(NodeKind::Empty, token.clone(), member_ty)
                })
            })
            .collect();
        Ok(Node::with_children(
            NodeKind::InitList,
            token,
            ty.clone(),
            children,
        ))
    }
}

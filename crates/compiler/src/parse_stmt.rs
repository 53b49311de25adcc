//! Statement parsing
//!
//! Statements are parsed into control-flow nodes appended to the enclosing
//! compound statement. Compound statements push a scope; `switch` tracks
//! its promoted controlling type so `case` constants convert to it.

use crate::errors::{err, CompileError, ErrorKind, Result};
use crate::node::{truncate_to, Node, NodeKind};
use crate::token::TokenKind;
use crate::types::{BaseType, Type};
use crate::Compiler;

impl Compiler {
    /// Parses `{ ... }` into a block node. The caller decides whether a
    /// new scope is needed; function bodies reuse the parameter scope.
    pub fn parse_compound_statement(&mut self, new_scope: bool) -> Result<Node> {
        let token = self.lexer.token.clone();
        self.lexer.expect("{", "Expected `{`.")?;
        if new_scope {
            self.scopes.push();
        }

        let mut block = Node::new(NodeKind::Block, token, Type::base(BaseType::Void));
        while !self.lexer.accept("}")? {
            if self.lexer.token.kind == TokenKind::End {
                return err(
                    ErrorKind::ExpectedToken,
                    &self.lexer.token,
                    "Unexpected end of file inside compound statement.",
                );
            }
            if self.try_parse_declaration(Some(&mut block))? {
                continue;
            }
            self.parse_statement(&mut block)?;
        }

        if new_scope {
            self.scopes.pop();
        }
        Ok(block)
    }

    /// Parses a single statement into its own node (branch bodies).
    fn parse_statement_node(&mut self) -> Result<Node> {
        let token = self.lexer.token.clone();
        let mut wrapper = Node::new(NodeKind::Block, token.clone(), Type::base(BaseType::Void));
        self.parse_statement(&mut wrapper)?;
        match wrapper.children.len() {
            0 => Ok(Node::new(NodeKind::Empty, token, Type::base(BaseType::Void))),
            1 => Ok(wrapper.children.pop().expect("one child")),
            _ => Ok(wrapper),
        }
    }

    fn parse_parenthesized_condition(&mut self) -> Result<Node> {
        self.lexer.expect("(", "Expected `(` before condition.")?;
        let condition = self.parse_expression()?;
        self.lexer.expect(")", "Expected `)` after condition.")?;
        self.make_condition(condition)
    }

    /// Parses one statement and appends its node(s) to `parent`.
    pub fn parse_statement(&mut self, parent: &mut Node) -> Result<()> {
        // Empty statement
        if self.lexer.accept(";")? {
            return Ok(());
        }

        if self.lexer.is("{") {
            let block = self.parse_compound_statement(true)?;
            parent.append(block);
            return Ok(());
        }

        if self.lexer.token.kind == TokenKind::Alphanumeric {
            match &*self.lexer.token.value {
                "if" => return self.parse_if(parent),
                "while" => return self.parse_while(parent),
                "do" => return self.parse_do_while(parent),
                "for" => return self.parse_for(parent),
                "switch" => return self.parse_switch(parent),
                "case" => return self.parse_case(parent),
                "default" => return self.parse_default(parent),
                "return" => return self.parse_return(parent),
                "goto" => return self.parse_goto(parent),
                "break" | "continue" => {
                    let token = self.lexer.take()?;
                    let kind = if token.is("break") {
                        NodeKind::Break
                    } else {
                        NodeKind::Continue
                    };
                    self.lexer.expect(";", "Expected `;` after statement.")?;
                    parent.append(Node::new(kind, token, Type::base(BaseType::Void)));
                    return Ok(());
                }
                _ => {
                    // A label is an identifier immediately followed by `:`.
                    let token = self.lexer.take()?;
                    if self.lexer.is(":") {
                        self.lexer.consume()?;
                        let name = token.value.clone();
                        parent.append(Node::new(
                            NodeKind::Label(name),
                            token,
                            Type::base(BaseType::Void),
                        ));
                        return Ok(());
                    }
                    self.lexer.push(token);
                }
            }
        }

        // Expression statement
        let expression = self.parse_expression()?;
        self.lexer.expect(";", "Expected `;` after expression.")?;
        parent.append(expression);
        Ok(())
    }

    fn parse_if(&mut self, parent: &mut Node) -> Result<()> {
        let token = self.lexer.take()?;
        let condition = self.parse_parenthesized_condition()?;
        let then_branch = self.parse_statement_node()?;

        let mut node = Node::with_children(
            NodeKind::If,
            token,
            Type::base(BaseType::Void),
            vec![condition, then_branch],
        );
        if self.lexer.accept("else")? {
            node.append(self.parse_statement_node()?);
        }
        parent.append(node);
        Ok(())
    }

    fn parse_while(&mut self, parent: &mut Node) -> Result<()> {
        let token = self.lexer.take()?;
        let condition = self.parse_parenthesized_condition()?;
        let body = self.parse_statement_node()?;
        parent.append(Node::with_children(
            NodeKind::While,
            token,
            Type::base(BaseType::Void),
            vec![condition, body],
        ));
        Ok(())
    }

    fn parse_do_while(&mut self, parent: &mut Node) -> Result<()> {
        let token = self.lexer.take()?;
        let body = self.parse_statement_node()?;
        self.lexer.expect("while", "Expected `while` after `do` body.")?;
        let condition = self.parse_parenthesized_condition()?;
        self.lexer.expect(";", "Expected `;` after `do`/`while`.")?;
        parent.append(Node::with_children(
            NodeKind::DoWhile,
            token,
            Type::base(BaseType::Void),
            vec![body, condition],
        ));
        Ok(())
    }

    fn parse_for(&mut self, parent: &mut Node) -> Result<()> {
        let token = self.lexer.take()?;
        self.lexer.expect("(", "Expected `(` after `for`.")?;
        self.scopes.push();

        // Initializer: a declaration, an expression, or nothing.
        let mut init = Node::new(
            NodeKind::Block,
            token.clone(),
            Type::base(BaseType::Void),
        );
        if !self.lexer.accept(";")? {
            if !self.try_parse_declaration(Some(&mut init))? {
                let expression = self.parse_expression()?;
                init.append(expression);
                self.lexer.expect(";", "Expected `;` after `for` initializer.")?;
            }
        }

        let condition = if self.lexer.is(";") {
            Node::new(NodeKind::Empty, token.clone(), Type::base(BaseType::Void))
        } else {
            let c = self.parse_expression()?;
            self.make_condition(c)?
        };
        self.lexer.expect(";", "Expected `;` after `for` condition.")?;

        let step = if self.lexer.is(")") {
            Node::new(NodeKind::Empty, token.clone(), Type::base(BaseType::Void))
        } else {
            self.parse_expression()?
        };
        self.lexer.expect(")", "Expected `)` after `for` clauses.")?;

        let body = self.parse_statement_node()?;
        self.scopes.pop();

        parent.append(Node::with_children(
            NodeKind::For,
            token,
            Type::base(BaseType::Void),
            vec![init, condition, step, body],
        ));
        Ok(())
    }

    fn parse_switch(&mut self, parent: &mut Node) -> Result<()> {
        let token = self.lexer.take()?;
        self.lexer.expect("(", "Expected `(` after `switch`.")?;
        let value = self.parse_expression()?;
        self.lexer.expect(")", "Expected `)` after `switch` value.")?;

        if !value.ty.is_integer() {
            return err(
                ErrorKind::TypeMismatch,
                &token,
                format!("Switch value must be an integer, got `{}`.", value.ty),
            );
        }
        let value = self.promote(value);
        if value.ty.size()? > 4 {
            return err(
                ErrorKind::UnsupportedFeature,
                &token,
                "64-bit switch values are not supported.",
            );
        }

        self.switch_types.push(value.ty.clone());
        let body = self.parse_statement_node()?;
        self.switch_types.pop();

        parent.append(Node::with_children(
            NodeKind::Switch,
            token,
            Type::base(BaseType::Void),
            vec![value, body],
        ));
        Ok(())
    }

    fn parse_case(&mut self, parent: &mut Node) -> Result<()> {
        let token = self.lexer.take()?;
        let Some(switch_ty) = self.switch_types.last().cloned() else {
            return err(
                ErrorKind::ExpectedToken,
                &token,
                "`case` outside of a switch statement.",
            );
        };
        let constant = self.parse_constant_expression()?;
        let value = truncate_to(constant.eval()?, &switch_ty);
        self.lexer.expect(":", "Expected `:` after `case` value.")?;
        parent.append(Node::new(
            NodeKind::Case(value),
            token,
            Type::base(BaseType::Void),
        ));
        Ok(())
    }

    fn parse_default(&mut self, parent: &mut Node) -> Result<()> {
        let token = self.lexer.take()?;
        if self.switch_types.is_empty() {
            return err(
                ErrorKind::ExpectedToken,
                &token,
                "`default` outside of a switch statement.",
            );
        }
        self.lexer.expect(":", "Expected `:` after `default`.")?;
        parent.append(Node::new(
            NodeKind::Default,
            token,
            Type::base(BaseType::Void),
        ));
        Ok(())
    }

    fn parse_return(&mut self, parent: &mut Node) -> Result<()> {
        let token = self.lexer.take()?;
        let return_type = self.current_return_type.clone().ok_or_else(|| {
            CompileError::internal("`return` outside of a function.")
        })?;

        let mut node = Node::new(NodeKind::Return, token.clone(), Type::base(BaseType::Void));
        if !self.lexer.accept(";")? {
            if return_type.is_void() {
                return err(
                    ErrorKind::TypeMismatch,
                    &token,
                    "Cannot return a value from a function returning void.",
                );
            }
            let value = self.parse_expression()?;
            let value = self.convert(value, &return_type, &token)?;
            node.append(value);
            self.lexer.expect(";", "Expected `;` after `return` value.")?;
        } else if !return_type.is_void() {
            return err(
                ErrorKind::TypeMismatch,
                &token,
                "Expected a return value in a function not returning void.",
            );
        }
        parent.append(node);
        Ok(())
    }

    fn parse_goto(&mut self, parent: &mut Node) -> Result<()> {
        let token = self.lexer.take()?;
        if self.lexer.token.kind != TokenKind::Alphanumeric {
            return err(
                ErrorKind::ExpectedToken,
                &self.lexer.token,
                "Expected a label name after `goto`.",
            );
        }
        let label = self.lexer.take()?;
        self.lexer.expect(";", "Expected `;` after `goto` label.")?;
        parent.append(Node::new(
            NodeKind::Goto(label.value.clone()),
            token,
            Type::base(BaseType::Void),
        ));
        Ok(())
    }
}

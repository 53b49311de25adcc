//! Scopes
//!
//! Lexically nested scopes with three independent namespaces: ordinary
//! (variables, functions, enum constants), tag (struct/union/enum tags) and
//! typedef names. Lookup walks outward unless restricted to the current
//! scope. The global scope is pushed at construction and never popped.
//!
//! Function prototypes get their own scope so tags declared inside a
//! parameter list survive to the function definition; the function type
//! captures that scope and a definition re-enters it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::symbol::SymbolRef;
use crate::types::TypeRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Tag,
    Typedef,
}

#[derive(Debug, Default)]
pub struct Scope {
    symbols: HashMap<Rc<str>, SymbolRef>,
    tags: HashMap<Rc<str>, TypeRef>,
    typedefs: HashMap<Rc<str>, TypeRef>,
}

pub type ScopeRef = Rc<RefCell<Scope>>;

impl Scope {
    fn types(&self, namespace: Namespace) -> &HashMap<Rc<str>, TypeRef> {
        match namespace {
            Namespace::Tag => &self.tags,
            Namespace::Typedef => &self.typedefs,
        }
    }

    fn types_mut(&mut self, namespace: Namespace) -> &mut HashMap<Rc<str>, TypeRef> {
        match namespace {
            Namespace::Tag => &mut self.tags,
            Namespace::Typedef => &mut self.typedefs,
        }
    }
}

pub struct ScopeStack {
    scopes: Vec<ScopeRef>,
}

impl ScopeStack {
    pub fn new() -> Self {
        ScopeStack {
            scopes: vec![Rc::new(RefCell::new(Scope::default()))],
        }
    }

    pub fn push(&mut self) {
        self.scopes.push(Rc::new(RefCell::new(Scope::default())));
    }

    /// Re-enters an existing scope (a function prototype scope).
    pub fn push_existing(&mut self, scope: ScopeRef) {
        self.scopes.push(scope);
    }

    pub fn pop(&mut self) -> ScopeRef {
        debug_assert!(self.scopes.len() > 1, "cannot pop the global scope");
        self.scopes.pop().expect("scope stack is never empty")
    }

    pub fn current(&self) -> &ScopeRef {
        self.scopes.last().expect("scope stack is never empty")
    }

    pub fn global(&self) -> &ScopeRef {
        &self.scopes[0]
    }

    pub fn at_file_scope(&self) -> bool {
        self.scopes.len() == 1
    }

    pub fn find_symbol(&self, name: &str, recursive: bool) -> Option<SymbolRef> {
        if recursive {
            for scope in self.scopes.iter().rev() {
                if let Some(symbol) = scope.borrow().symbols.get(name) {
                    return Some(symbol.clone());
                }
            }
            None
        } else {
            self.current().borrow().symbols.get(name).cloned()
        }
    }

    pub fn find_symbol_global(&self, name: &str) -> Option<SymbolRef> {
        self.global().borrow().symbols.get(name).cloned()
    }

    pub fn find_type(&self, namespace: Namespace, name: &str, recursive: bool) -> Option<TypeRef> {
        if recursive {
            for scope in self.scopes.iter().rev() {
                if let Some(ty) = scope.borrow().types(namespace).get(name) {
                    return Some(ty.clone());
                }
            }
            None
        } else {
            self.current().borrow().types(namespace).get(name).cloned()
        }
    }

    pub fn add_symbol(&mut self, symbol: SymbolRef) {
        let name = symbol.borrow().name.clone();
        self.current().borrow_mut().symbols.insert(name, symbol);
    }

    pub fn add_symbol_global(&mut self, symbol: SymbolRef) {
        let name = symbol.borrow().name.clone();
        self.global().borrow_mut().symbols.insert(name, symbol);
    }

    /// Removes a symbol from the current scope (redeclaration supersedes a
    /// tentative definition).
    pub fn remove_symbol(&mut self, name: &str) {
        self.current().borrow_mut().symbols.remove(name);
    }

    pub fn add_type(&mut self, namespace: Namespace, name: Rc<str>, ty: TypeRef) {
        self.current()
            .borrow_mut()
            .types_mut(namespace)
            .insert(name, ty);
    }
}

impl Default for ScopeStack {
    fn default() -> Self {
        ScopeStack::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::{Symbol, SymbolKind};
    use crate::token::{Token, TokenKind};
    use crate::types::{BaseType, Type};

    fn symbol(name: &str) -> SymbolRef {
        let token = Token::new(
            TokenKind::Alphanumeric,
            Rc::from(name),
            Rc::from("test.i"),
            1,
        );
        let asm_name = token.value.clone();
        Symbol::new(
            SymbolKind::Variable,
            Type::base(BaseType::SignedInt),
            token,
            asm_name,
        )
    }

    #[test]
    fn test_shadowing() {
        let mut scopes = ScopeStack::new();
        let outer = symbol("x");
        scopes.add_symbol(outer.clone());

        scopes.push();
        let inner = symbol("x");
        scopes.add_symbol(inner.clone());

        let found = scopes.find_symbol("x", true).unwrap();
        assert!(Rc::ptr_eq(&found, &inner));

        scopes.pop();
        let found = scopes.find_symbol("x", true).unwrap();
        assert!(Rc::ptr_eq(&found, &outer));
    }

    #[test]
    fn test_lookup_idempotent() {
        let mut scopes = ScopeStack::new();
        scopes.add_symbol(symbol("x"));
        let a = scopes.find_symbol("x", true).unwrap();
        let b = scopes.find_symbol("x", true).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_namespaces_independent() {
        let mut scopes = ScopeStack::new();
        scopes.add_symbol(symbol("foo"));
        scopes.add_type(
            Namespace::Tag,
            Rc::from("foo"),
            Type::base(BaseType::SignedInt),
        );
        scopes.add_type(
            Namespace::Typedef,
            Rc::from("foo"),
            Type::base(BaseType::UnsignedInt),
        );

        assert!(scopes.find_symbol("foo", true).is_some());
        let tag = scopes.find_type(Namespace::Tag, "foo", true).unwrap();
        let td = scopes.find_type(Namespace::Typedef, "foo", true).unwrap();
        assert!(tag.matches_base(BaseType::SignedInt));
        assert!(td.matches_base(BaseType::UnsignedInt));
    }

    #[test]
    fn test_non_recursive_lookup() {
        let mut scopes = ScopeStack::new();
        scopes.add_symbol(symbol("x"));
        scopes.push();
        assert!(scopes.find_symbol("x", false).is_none());
        assert!(scopes.find_symbol("x", true).is_some());
    }

    #[test]
    fn test_prototype_scope_reentry() {
        let mut scopes = ScopeStack::new();
        scopes.push();
        scopes.add_type(
            Namespace::Tag,
            Rc::from("point"),
            Type::base(BaseType::SignedInt),
        );
        let proto = scopes.pop();

        assert!(scopes.find_type(Namespace::Tag, "point", true).is_none());
        scopes.push_existing(proto);
        assert!(scopes.find_type(Namespace::Tag, "point", true).is_some());
    }
}

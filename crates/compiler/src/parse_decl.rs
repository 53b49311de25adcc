//! Declaration parsing
//!
//! Follows the C17 declaration grammar (6.7): a specifier sequence
//! accumulating flags per category, then a comma-separated list of
//! declarators. Records and enums are declared into the tag namespace with
//! the forward-declaration scoping subtleties of C; file-scope
//! redeclarations merge array sizes and linkage; function definitions
//! drive optimisation, code generation and emission as soon as their body
//! has been parsed.

use std::cell::RefCell;
use std::rc::Rc;

use crate::errors::{err, CompileError, ErrorKind, Result};
use crate::function::Function;
use crate::generate;
use crate::node::{Node, NodeKind};
use crate::optimize_asm;
use crate::optimize_tree;
use crate::options::Warning;
use crate::record::Record;
use crate::scope::{Namespace, ScopeRef};
use crate::symbol::{Linkage, Symbol, SymbolKind, SymbolRef};
use crate::token::{TokenKind, TokenRef};
use crate::types::{BaseType, EnumType, FunctionType, Param, Type, TypeKind, TypeRef};
use crate::Compiler;

/*
 * Specifiers
 */

const TS_VOID: u32 = 1 << 0;
const TS_CHAR: u32 = 1 << 1;
const TS_SHORT: u32 = 1 << 2;
const TS_INT: u32 = 1 << 3;
const TS_LONG: u32 = 1 << 4;
const TS_LONG_LONG: u32 = 1 << 5;
const TS_SIGNED: u32 = 1 << 6;
const TS_UNSIGNED: u32 = 1 << 7;
const TS_RECORD: u32 = 1 << 8;
const TS_ENUM: u32 = 1 << 9;
const TS_TYPEDEF: u32 = 1 << 10;
const TS_BOOL: u32 = 1 << 11;
const TS_FLOAT: u32 = 1 << 12;
const TS_DOUBLE: u32 = 1 << 13;

const USER_TYPE_MASK: u32 = TS_RECORD | TS_ENUM | TS_TYPEDEF;

const TQ_CONST: u32 = 1 << 0;
const TQ_VOLATILE: u32 = 1 << 1;
const TQ_RESTRICT: u32 = 1 << 2;

const FS_INLINE: u32 = 1 << 0;
const FS_NORETURN: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageSpecifier {
    None,
    Typedef,
    Extern,
    Static,
    Auto,
    Register,
}

/// The specifier sequence of a declaration (the part before the
/// declarators).
struct Specifiers {
    storage: StorageSpecifier,
    type_specifiers: u32,
    type_qualifiers: u32,
    function_specifiers: u32,
    /// A user-defined type: typedef target, record or enum.
    ty: Option<TypeRef>,
}

impl Specifiers {
    fn new() -> Specifiers {
        Specifiers {
            storage: StorageSpecifier::None,
            type_specifiers: 0,
            type_qualifiers: 0,
            function_specifiers: 0,
            ty: None,
        }
    }
}

/*
 * Declarator syntax, recorded before types are built so that postfix
 * operators can associate through parenthesized declarators.
 */

struct DeclPointer {
    is_const: bool,
    is_volatile: bool,
    restrict: bool,
}

enum DeclSuffix {
    Array(Option<u32>),
    Function {
        params: Vec<Param>,
        variadic: bool,
        scope: ScopeRef,
    },
}

enum DeclDirect {
    Name(Option<TokenRef>),
    Paren(Box<DeclaratorSyntax>),
}

struct DeclaratorSyntax {
    pointers: Vec<DeclPointer>,
    direct: DeclDirect,
    suffixes: Vec<DeclSuffix>,
}

impl DeclaratorSyntax {
    fn is_empty(&self) -> bool {
        self.pointers.is_empty()
            && self.suffixes.is_empty()
            && matches!(self.direct, DeclDirect::Name(None))
    }
}

/// How a declarator position treats names.
#[derive(Clone, Copy, PartialEq, Eq)]
enum DeclMode {
    /// A name (or parenthesized declarator) is required.
    Named,
    /// No name may appear (casts, sizeof).
    Abstract,
    /// A name is optional (parameters, struct members).
    Either,
}

impl Compiler {
    fn specifiers_convert(&mut self, spec: &Specifiers) -> Result<BaseType> {
        debug_assert!(spec.ty.is_none());
        let ts = spec.type_specifiers;

        if ts == 0 {
            let token = self.lexer.token.clone();
            self.warn(
                Warning::ImplicitInt,
                &token,
                "Unrecognized type, or no type specifiers for this declaration.",
            )?;
            return Ok(BaseType::SignedInt);
        }

        let base = if ts == TS_VOID {
            BaseType::Void
        } else if ts == TS_CHAR {
            BaseType::Char
        } else if ts == TS_SIGNED | TS_CHAR {
            BaseType::SignedChar
        } else if ts == TS_UNSIGNED | TS_CHAR {
            BaseType::UnsignedChar
        } else if ts == TS_SHORT
            || ts == TS_SIGNED | TS_SHORT
            || ts == TS_SHORT | TS_INT
            || ts == TS_SIGNED | TS_SHORT | TS_INT
        {
            BaseType::SignedShort
        } else if ts == TS_UNSIGNED | TS_SHORT || ts == TS_UNSIGNED | TS_SHORT | TS_INT {
            BaseType::UnsignedShort
        } else if ts == TS_INT || ts == TS_SIGNED || ts == TS_SIGNED | TS_INT {
            BaseType::SignedInt
        } else if ts == TS_UNSIGNED || ts == TS_UNSIGNED | TS_INT {
            BaseType::UnsignedInt
        } else if ts == TS_LONG
            || ts == TS_SIGNED | TS_LONG
            || ts == TS_LONG | TS_INT
            || ts == TS_SIGNED | TS_LONG | TS_INT
        {
            // long collapses to the 32-bit int rank in this dialect.
            BaseType::SignedInt
        } else if ts == TS_UNSIGNED | TS_LONG || ts == TS_UNSIGNED | TS_LONG | TS_INT {
            BaseType::UnsignedInt
        } else if ts == TS_LONG_LONG
            || ts == TS_SIGNED | TS_LONG_LONG
            || ts == TS_LONG_LONG | TS_INT
            || ts == TS_SIGNED | TS_LONG_LONG | TS_INT
        {
            BaseType::SignedLongLong
        } else if ts == TS_UNSIGNED | TS_LONG_LONG || ts == TS_UNSIGNED | TS_LONG_LONG | TS_INT {
            BaseType::UnsignedLongLong
        } else if ts == TS_FLOAT {
            BaseType::Float
        } else if ts == TS_DOUBLE || ts == TS_LONG | TS_DOUBLE {
            // long double collapses to double.
            BaseType::Double
        } else if ts == TS_BOOL {
            BaseType::Bool
        } else {
            return err(
                ErrorKind::InvalidTypeSpecifierCombo,
                &self.lexer.token,
                "Invalid combination of type specifiers.",
            );
        };
        Ok(base)
    }

    /// Validates the accumulated specifiers. There is no valid combination
    /// whose subset is invalid, so checking after each keyword puts the
    /// error on the first wrong token.
    fn specifiers_check(&mut self, spec: &Specifiers) -> Result<()> {
        if spec.ty.is_some() {
            if spec.type_specifiers & !USER_TYPE_MASK != 0 {
                return err(
                    ErrorKind::InvalidTypeSpecifierCombo,
                    &self.lexer.token,
                    "Invalid combination of type specifiers.",
                );
            }
            return Ok(());
        }
        if spec.type_specifiers != 0 {
            self.specifiers_convert(spec)?;
        }
        Ok(())
    }

    fn try_parse_storage_specifier(
        &mut self,
        spec: &mut Specifiers,
        storage: StorageSpecifier,
        keyword: &str,
    ) -> Result<bool> {
        if !self.lexer.is(keyword) {
            return Ok(false);
        }
        if spec.storage != StorageSpecifier::None {
            return err(
                ErrorKind::RedundantSpecifier,
                &self.lexer.token,
                "At most one storage specifier can be provided for a declaration.",
            );
        }
        spec.storage = storage;
        self.lexer.consume()?;
        Ok(true)
    }

    fn try_parse_type_specifier(
        &mut self,
        spec: &mut Specifiers,
        flag: u32,
        keyword: &str,
    ) -> Result<bool> {
        if !self.lexer.is(keyword) {
            return Ok(false);
        }
        if spec.type_specifiers & flag != 0 {
            return err(
                ErrorKind::RedundantSpecifier,
                &self.lexer.token,
                format!("Redundant type specifier: {}", keyword),
            );
        }
        spec.type_specifiers |= flag;
        self.specifiers_check(spec)?;
        self.lexer.consume()?;
        Ok(true)
    }

    fn try_parse_flag(&mut self, flags: &mut u32, flag: u32, keyword: &str) -> Result<bool> {
        if !self.lexer.is(keyword) {
            return Ok(false);
        }
        if *flags & flag != 0 {
            return err(
                ErrorKind::RedundantSpecifier,
                &self.lexer.token,
                format!("Redundant declaration specifier: {}", keyword),
            );
        }
        *flags |= flag;
        self.lexer.consume()?;
        Ok(true)
    }

    fn try_parse_type_qualifier(&mut self, qualifiers: &mut u32) -> Result<bool> {
        if self.try_parse_flag(qualifiers, TQ_CONST, "const")? {
            return Ok(true);
        }
        if self.try_parse_flag(qualifiers, TQ_VOLATILE, "volatile")? {
            return Ok(true);
        }
        if self.try_parse_flag(qualifiers, TQ_RESTRICT, "restrict")? {
            return Ok(true);
        }
        Ok(false)
    }

    fn try_parse_declaration_specifier_keywords(
        &mut self,
        spec: &mut Specifiers,
    ) -> Result<bool> {
        use StorageSpecifier::*;

        // storage specifiers
        if self.try_parse_storage_specifier(spec, Typedef, "typedef")? {
            return Ok(true);
        }
        if self.try_parse_storage_specifier(spec, Extern, "extern")? {
            return Ok(true);
        }
        if self.try_parse_storage_specifier(spec, Static, "static")? {
            return Ok(true);
        }
        if self.try_parse_storage_specifier(spec, Auto, "auto")? {
            return Ok(true);
        }
        if self.try_parse_storage_specifier(spec, Register, "register")? {
            return Ok(true);
        }
        if self.lexer.is("_Thread_local") {
            return err(
                ErrorKind::UnsupportedFeature,
                &self.lexer.token,
                "_Thread_local is not supported.",
            );
        }

        // type specifiers (except `long` and user types)
        if self.try_parse_type_specifier(spec, TS_VOID, "void")? {
            return Ok(true);
        }
        if self.try_parse_type_specifier(spec, TS_CHAR, "char")? {
            return Ok(true);
        }
        if self.try_parse_type_specifier(spec, TS_SHORT, "short")? {
            return Ok(true);
        }
        if self.try_parse_type_specifier(spec, TS_INT, "int")? {
            return Ok(true);
        }
        if self.try_parse_type_specifier(spec, TS_SIGNED, "signed")? {
            return Ok(true);
        }
        if self.try_parse_type_specifier(spec, TS_UNSIGNED, "unsigned")? {
            return Ok(true);
        }
        if self.try_parse_type_specifier(spec, TS_FLOAT, "float")? {
            return Ok(true);
        }
        if self.try_parse_type_specifier(spec, TS_DOUBLE, "double")? {
            return Ok(true);
        }
        if self.try_parse_type_specifier(spec, TS_BOOL, "_Bool")? {
            return Ok(true);
        }

        // type qualifiers
        if self.try_parse_type_qualifier(&mut spec.type_qualifiers)? {
            return Ok(true);
        }

        // function specifiers
        if self.try_parse_flag(&mut spec.function_specifiers, FS_INLINE, "inline")? {
            return Ok(true);
        }
        if self.try_parse_flag(&mut spec.function_specifiers, FS_NORETURN, "_Noreturn")? {
            return Ok(true);
        }

        // `long` can appear at most twice.
        if self.lexer.is("long") {
            if spec.type_specifiers & TS_LONG_LONG != 0 {
                return err(
                    ErrorKind::InvalidTypeSpecifierCombo,
                    &self.lexer.token,
                    "`long long long` is invalid.",
                );
            }
            if spec.type_specifiers & TS_LONG != 0 {
                spec.type_specifiers &= !TS_LONG;
                spec.type_specifiers |= TS_LONG_LONG;
            } else {
                spec.type_specifiers |= TS_LONG;
            }
            self.specifiers_check(spec)?;
            self.lexer.consume()?;
            return Ok(true);
        }

        if self.lexer.is("_Atomic") {
            return err(
                ErrorKind::UnsupportedFeature,
                &self.lexer.token,
                "_Atomic is not supported.",
            );
        }
        if self.lexer.is("_Alignas") || self.lexer.is("alignas") {
            return err(
                ErrorKind::UnsupportedFeature,
                &self.lexer.token,
                "_Alignas is not supported.",
            );
        }

        Ok(false)
    }

    fn try_parse_declaration_specifiers(&mut self, spec: &mut Specifiers) -> Result<bool> {
        let mut found = false;

        // All declaration specifiers are alphanumeric, which lets the loop
        // short-circuit on anything else.
        while self.lexer.token.kind == TokenKind::Alphanumeric {
            if self.try_parse_declaration_specifier_keywords(spec)? {
                found = true;
                continue;
            }

            if self.lexer.is("struct") || self.lexer.is("union") {
                found = true;
                self.parse_record(spec)?;
                continue;
            }

            if self.lexer.is("enum") {
                found = true;
                self.parse_enum(spec)?;
                continue;
            }

            // The builtin va_list type, exposed for the libc's stdarg.h
            if self.lexer.is("__builtin_va_list") && spec.ty.is_none() {
                if spec.type_specifiers != 0 {
                    return err(
                        ErrorKind::InvalidTypeSpecifierCombo,
                        &self.lexer.token,
                        "Invalid combination of type specifiers.",
                    );
                }
                found = true;
                self.lexer.consume()?;
                spec.type_specifiers |= TS_TYPEDEF;
                spec.ty = Some(Type::base(BaseType::VaList));
                continue;
            }

            // A typedef name, only if no type specifier has appeared yet
            if spec.type_specifiers == 0 && spec.ty.is_none() {
                if let Some(ty) =
                    self.scopes
                        .find_type(Namespace::Typedef, &self.lexer.token.value, true)
                {
                    found = true;
                    self.lexer.consume()?;
                    spec.type_specifiers |= TS_TYPEDEF;
                    spec.ty = Some(ty);
                    continue;
                }
            }

            break;
        }

        Ok(found)
    }

    fn specifiers_make_type(&mut self, spec: &Specifiers) -> Result<TypeRef> {
        let ty = match &spec.ty {
            Some(user) => {
                if spec.type_specifiers & !USER_TYPE_MASK != 0 {
                    return err(
                        ErrorKind::InvalidTypeSpecifierCombo,
                        &self.lexer.token,
                        "Unsupported combination of type specifiers.",
                    );
                }
                user.clone()
            }
            None => Type::base(self.specifiers_convert(spec)?),
        };
        Ok(Type::qualified(
            &ty,
            spec.type_qualifiers & TQ_CONST != 0,
            spec.type_qualifiers & TQ_VOLATILE != 0,
        ))
    }

    /*
     * Records and enums
     */

    fn parse_record(&mut self, spec: &mut Specifiers) -> Result<()> {
        if spec.type_specifiers & TS_RECORD != 0 {
            return err(
                ErrorKind::RedundantSpecifier,
                &self.lexer.token,
                "Redundant struct/union specifier.",
            );
        }
        spec.type_specifiers |= TS_RECORD;
        let is_struct = self.lexer.is("struct");
        let keyword = self.lexer.take()?;

        // optional tag
        let tag = if self.lexer.token.kind == TokenKind::Alphanumeric {
            Some(self.lexer.take()?)
        } else if !self.lexer.is("{") {
            return err(
                ErrorKind::ExpectedToken,
                &self.lexer.token,
                format!(
                    "Expected tag or `{{` after `{}`.",
                    if is_struct { "struct" } else { "union" }
                ),
            );
        } else {
            None
        };
        drop(keyword);

        // A definition or a forward declaration searches only the current
        // scope, since either declares the record there if it does not
        // already exist. A forward declaration is a tag with nothing else
        // in the declaration, not even a qualifier.
        let is_definition = self.lexer.is("{");
        let is_forward = self.lexer.is(";")
            && spec.type_qualifiers == 0
            && spec.storage == StorageSpecifier::None;
        let find_recursive = !is_definition && !is_forward;

        let mut ty = None;
        if let Some(tag) = &tag {
            if let Some(found) = self.scopes.find_type(Namespace::Tag, &tag.value, find_recursive)
            {
                let matches = match &found.kind {
                    TypeKind::Record(record) => record.borrow().is_struct == is_struct,
                    _ => false,
                };
                if !matches {
                    return err(
                        ErrorKind::KindMismatch,
                        tag,
                        if is_struct {
                            "This tag does not name a struct in this scope."
                        } else {
                            "This tag does not name a union in this scope."
                        },
                    );
                }
                ty = Some(found);
            }
        }

        let ty = match ty {
            Some(ty) => ty,
            None => {
                let record = Rc::new(RefCell::new(Record::new(tag.clone(), is_struct)));
                let ty = Type::record(record);
                if let Some(tag) = &tag {
                    self.scopes
                        .add_type(Namespace::Tag, tag.value.clone(), ty.clone());
                }
                ty
            }
        };
        spec.ty = Some(ty.clone());

        // parse a definition if given
        if self.lexer.is("{") {
            let TypeKind::Record(record) = &ty.kind else {
                return Err(CompileError::internal("Tag type is not a record."));
            };
            let record = record.clone();
            if record.borrow().is_defined {
                return err(
                    ErrorKind::DuplicateSymbol,
                    &self.lexer.token,
                    "Duplicate definition of struct/union.",
                );
            }
            record.borrow_mut().is_defined = true;
            self.lexer.consume()?;

            while !self.lexer.accept("}")? {
                if self.lexer.token.kind == TokenKind::End {
                    return err(
                        ErrorKind::ExpectedToken,
                        &self.lexer.token,
                        "Unexpected end of file inside struct/union definition.",
                    );
                }
                self.parse_record_member(&record)?;
            }

            if record.borrow().members.is_empty() {
                return err(
                    ErrorKind::UnsupportedFeature,
                    &self.lexer.token,
                    "An empty struct/union is not supported.",
                );
            }

            // A zero-length trailing array is accepted as a flexible array
            // member with a warning.
            let zero_length_member = {
                let record = record.borrow();
                let last = record.members.last().expect("non-empty");
                match last.ty.kind {
                    TypeKind::Array { count: 0, .. } => {
                        Some(last.name.clone().unwrap_or_else(|| self.lexer.token.clone()))
                    }
                    _ => None,
                }
            };
            if let Some(name) = zero_length_member {
                self.warn(
                    Warning::ZeroLengthArray,
                    &name,
                    "A zero-length array as a flexible array member is a GNU extension.",
                )?;
            }
        }

        Ok(())
    }

    fn parse_record_member(&mut self, record: &crate::types::RecordRef) -> Result<()> {
        let error_token = self.lexer.token.clone();

        let mut spec = Specifiers::new();
        if !self.try_parse_declaration_specifiers(&mut spec)? {
            return err(
                ErrorKind::ExpectedToken,
                &self.lexer.token,
                "Expected a declaration.",
            );
        }
        let base_ty = self.specifiers_make_type(&spec)?;

        if spec.storage != StorageSpecifier::None {
            return err(
                ErrorKind::ExpectedToken,
                &error_token,
                "Storage specifiers are not allowed in a struct or union definition.",
            );
        }
        if spec.function_specifiers != 0 {
            return err(
                ErrorKind::ExpectedToken,
                &error_token,
                "Function specifiers are not allowed in a struct or union definition.",
            );
        }

        loop {
            let syntax = self
                .parse_declarator_syntax(DeclMode::Either)?
                .expect("Either mode always yields a declarator");
            let (ty, name) = self.apply_declarator(syntax, base_ty.clone())?;

            if self.lexer.is(":") {
                return err(
                    ErrorKind::UnsupportedFeature,
                    &self.lexer.token,
                    "Bitfields are not supported.",
                );
            }

            // Anonymous members must be untagged structs or unions.
            if name.is_none() {
                let anon_record = match &ty.kind {
                    TypeKind::Record(r) => Some(r.clone()),
                    _ => None,
                };
                let Some(anon) = anon_record else {
                    return err(
                        ErrorKind::ExpectedDeclarator,
                        &error_token,
                        "This struct/union member needs a name.",
                    );
                };
                if anon.borrow().tag.is_some() {
                    self.warn(
                        Warning::AnonymousTags,
                        &error_token,
                        "Anonymous struct/union members with tag names are an extension.",
                    )?;
                }
            }

            record.borrow_mut().add(name, ty)?;

            if self.lexer.is("=") {
                return err(
                    ErrorKind::InvalidInitializer,
                    &self.lexer.token,
                    "An initializer is not allowed in a struct or union member declaration.",
                );
            }
            if self.lexer.accept(",")? {
                continue;
            }
            self.lexer
                .expect(";", "Expected `;` or `,` at end of member declaration.")?;
            break;
        }

        Ok(())
    }

    fn parse_enum(&mut self, spec: &mut Specifiers) -> Result<()> {
        if spec.type_specifiers & TS_ENUM != 0 {
            return err(
                ErrorKind::RedundantSpecifier,
                &self.lexer.token,
                "Redundant enum specifier. (Are you missing `;` between these enums?)",
            );
        }
        spec.type_specifiers |= TS_ENUM;
        let keyword = self.lexer.take()?;

        let tag = if self.lexer.token.kind == TokenKind::Alphanumeric {
            Some(self.lexer.take()?)
        } else {
            None
        };

        // Without a definition the enum must already exist; there are no
        // forward declarations of enums.
        if !self.lexer.accept("{")? {
            let Some(tag) = tag else {
                return err(
                    ErrorKind::ExpectedToken,
                    &keyword,
                    "Expected `{` or a tag name after `enum`.",
                );
            };
            let Some(ty) = self.scopes.find_type(Namespace::Tag, &tag.value, true) else {
                if self.lexer.is(";") {
                    return err(
                        ErrorKind::UnsupportedFeature,
                        &tag,
                        "Forward declarations of enums are not allowed.",
                    );
                }
                return err(
                    ErrorKind::UnknownName,
                    &tag,
                    "An enum with this tag has not been defined.",
                );
            };
            if !matches!(ty.kind, TypeKind::Enum(_)) {
                return err(
                    ErrorKind::KindMismatch,
                    &tag,
                    "This tag refers to a struct or union; it cannot be referred to as `enum`.",
                );
            }
            spec.ty = Some(ty);
            return Ok(());
        }

        // This is a definition. Check the current scope for a duplicate.
        if let Some(tag) = &tag {
            if self
                .scopes
                .find_type(Namespace::Tag, &tag.value, false)
                .is_some()
            {
                return err(
                    ErrorKind::DuplicateSymbol,
                    tag,
                    "A struct, union or enum with this tag is already defined in this scope.",
                );
            }
        }

        let ty = Type::enumeration(Rc::new(EnumType { tag: tag.clone() }));
        spec.ty = Some(ty.clone());
        if let Some(tag) = &tag {
            self.scopes
                .add_type(Namespace::Tag, tag.value.clone(), ty.clone());
        }

        // Enumerators chain from zero, each one more than the last unless
        // assigned. Values are signed int.
        let mut found = false;
        let mut value: i32 = 0;
        while !self.lexer.is("}") {
            if self.lexer.token.kind != TokenKind::Alphanumeric {
                return err(
                    ErrorKind::ExpectedToken,
                    &self.lexer.token,
                    "Expected an identifier for this enum value.",
                );
            }
            let name = self.lexer.take()?;

            if self.lexer.accept("=")? {
                let node = self.parse_constant_expression()?;
                value = node.eval()? as u32 as i32;
            }

            if self.scopes.find_symbol(&name.value, false).is_some() {
                return err(
                    ErrorKind::DuplicateSymbol,
                    &name,
                    format!("`{}` is already declared in this scope.", name.value),
                );
            }
            let symbol = Symbol::new(
                SymbolKind::Constant,
                ty.clone(),
                name.clone(),
                name.value.clone(),
            );
            symbol.borrow_mut().value = u64::from(value as u32);
            self.scopes.add_symbol(symbol);
            value = value.wrapping_add(1);

            found = true;
            if self.lexer.is("}") {
                break;
            }
            self.lexer
                .expect(",", "Expected `,` or `}` after this enum value.")?;
        }

        if !found {
            return err(
                ErrorKind::ExpectedDeclarator,
                &self.lexer.token,
                "An empty enum is not allowed.",
            );
        }
        self.lexer.consume()?;
        Ok(())
    }

    /*
     * Declarators
     */

    /// True if the current token could begin a declaration specifier
    /// sequence (used to tell function parameter lists apart from
    /// parenthesized declarators).
    fn at_type_start(&self) -> bool {
        if self.lexer.token.kind != TokenKind::Alphanumeric {
            return false;
        }
        matches!(
            &*self.lexer.token.value,
            "void"
                | "char"
                | "short"
                | "int"
                | "long"
                | "signed"
                | "unsigned"
                | "float"
                | "double"
                | "_Bool"
                | "struct"
                | "union"
                | "enum"
                | "const"
                | "volatile"
                | "restrict"
        ) || self
            .scopes
            .find_type(Namespace::Typedef, &self.lexer.token.value, true)
            .is_some()
    }

    fn parse_declarator_syntax(&mut self, mode: DeclMode) -> Result<Option<DeclaratorSyntax>> {
        // Collect pointers with their qualifiers.
        let mut pointers = Vec::new();
        while self.lexer.accept("*")? {
            let mut qualifiers = 0;
            while self.try_parse_type_qualifier(&mut qualifiers)? {}
            pointers.push(DeclPointer {
                is_const: qualifiers & TQ_CONST != 0,
                is_volatile: qualifiers & TQ_VOLATILE != 0,
                restrict: qualifiers & TQ_RESTRICT != 0,
            });
        }

        // Direct declarator: a parenthesized declarator, a name, or (when
        // abstract) nothing. A `(` starting a parameter list rather than a
        // declarator is left for the suffix loop.
        let mut direct = DeclDirect::Name(None);
        let mut direct_found = false;
        if self.lexer.is("(") {
            let paren = self.lexer.take()?;
            if self.lexer.is(")") || self.at_type_start() {
                self.lexer.push(paren);
            } else {
                let inner = self.parse_declarator_syntax(mode)?.ok_or_else(|| {
                    CompileError::at(
                        ErrorKind::ExpectedDeclarator,
                        &self.lexer.token,
                        "Expected declarator after `(`.",
                    )
                })?;
                self.lexer
                    .expect(")", "Expected `)` after parenthesized declarator.")?;
                direct = DeclDirect::Paren(Box::new(inner));
                direct_found = true;
            }
        }
        if !direct_found
            && mode != DeclMode::Abstract
            && self.lexer.token.kind == TokenKind::Alphanumeric
            && !self.at_type_start()
        {
            direct = DeclDirect::Name(Some(self.lexer.take()?));
            direct_found = true;
        }

        if mode == DeclMode::Named && !direct_found {
            return Ok(None);
        }

        // Postfix arrays and parameter lists, left to right.
        let mut suffixes = Vec::new();
        loop {
            if self.lexer.accept("[")? {
                if self.lexer.accept("]")? {
                    suffixes.push(DeclSuffix::Array(None));
                } else {
                    let expr = self.parse_assignment_expression()?;
                    let count = expr.eval().map_err(|_| {
                        CompileError::at(
                            ErrorKind::UnsupportedFeature,
                            &expr.token,
                            "Variable-length arrays are not supported.",
                        )
                    })?;
                    self.lexer
                        .expect("]", "Expected `]` after array length in declarator.")?;
                    suffixes.push(DeclSuffix::Array(Some(count as u32)));
                }
                continue;
            }

            if self.lexer.accept("(")? {
                let (params, variadic, scope) = self.parse_function_arguments()?;
                suffixes.push(DeclSuffix::Function {
                    params,
                    variadic,
                    scope,
                });
                continue;
            }

            break;
        }

        Ok(Some(DeclaratorSyntax {
            pointers,
            direct,
            suffixes,
        }))
    }

    /// Builds the declared type from a declarator's recorded syntax.
    fn apply_declarator(
        &mut self,
        syntax: DeclaratorSyntax,
        base: TypeRef,
    ) -> Result<(TypeRef, Option<TokenRef>)> {
        let mut ty = base;
        for pointer in syntax.pointers {
            ty = Type::pointer(ty, pointer.is_const, pointer.is_volatile, pointer.restrict);
        }
        for suffix in syntax.suffixes.into_iter().rev() {
            match suffix {
                DeclSuffix::Array(count) => {
                    if ty.is_function() {
                        return err(
                            ErrorKind::KindMismatch,
                            &self.lexer.token,
                            "An array of functions is not allowed.",
                        );
                    }
                    ty = match count {
                        Some(count) => Type::array(ty, count),
                        None => Type::indeterminate(ty),
                    };
                }
                DeclSuffix::Function {
                    params,
                    variadic,
                    scope,
                } => {
                    if ty.is_function() {
                        return err(
                            ErrorKind::KindMismatch,
                            &self.lexer.token,
                            "A function cannot return a function.",
                        );
                    }
                    if ty.is_array() {
                        return err(
                            ErrorKind::KindMismatch,
                            &self.lexer.token,
                            "A function cannot return an array.",
                        );
                    }
                    ty = Type::function(Rc::new(FunctionType {
                        ret: ty,
                        params,
                        variadic,
                        scope: RefCell::new(Some(scope)),
                    }));
                }
            }
        }
        match syntax.direct {
            DeclDirect::Name(name) => Ok((ty, name)),
            DeclDirect::Paren(inner) => self.apply_declarator(*inner, ty),
        }
    }

    /// Parses a parameter list after `(`. Pushes a prototype scope so tags
    /// declared among the parameters survive to a following definition.
    fn parse_function_arguments(&mut self) -> Result<(Vec<Param>, bool, ScopeRef)> {
        let mut params: Vec<Param> = Vec::new();
        let mut variadic = false;

        self.scopes.push();

        loop {
            if self.lexer.accept(")")? {
                break;
            }
            if !params.is_empty() {
                self.lexer
                    .expect(",", "Expected `,` or `)` after function parameter.")?;
            }

            if self.lexer.accept("...")? {
                if params.is_empty() {
                    return err(
                        ErrorKind::ExpectedDeclarator,
                        &self.lexer.token,
                        "At least one named parameter is required before `...`.",
                    );
                }
                self.lexer.expect(")", "Expected `)` after `...`.")?;
                variadic = true;
                break;
            }

            let mut spec = Specifiers::new();
            if !self.try_parse_declaration_specifiers(&mut spec)? {
                return err(
                    ErrorKind::ExpectedToken,
                    &self.lexer.token,
                    "Expected a type for this function parameter.",
                );
            }
            if spec.storage != StorageSpecifier::None || spec.function_specifiers != 0 {
                return err(
                    ErrorKind::ExpectedToken,
                    &self.lexer.token,
                    "Storage and function specifiers are not allowed on function parameters.",
                );
            }

            let base = self.specifiers_make_type(&spec)?;
            let syntax = self
                .parse_declarator_syntax(DeclMode::Either)?
                .expect("Either mode always yields a declarator");
            let empty_declarator = syntax.is_empty();
            let (ty, name) = self.apply_declarator(syntax, base)?;

            // `(void)` means no parameters.
            if params.is_empty()
                && empty_declarator
                && name.is_none()
                && ty.is_void()
                && self.lexer.accept(")")?
            {
                break;
            }

            params.push(Param { name, ty });
        }

        let scope = self.scopes.pop();
        Ok((params, variadic, scope))
    }

    /// Parses an abstract type (casts, sizeof, va_arg). Returns None when
    /// the tokens do not start a type.
    pub fn try_parse_type(&mut self) -> Result<Option<TypeRef>> {
        let mut spec = Specifiers::new();
        if !self.try_parse_declaration_specifiers(&mut spec)? {
            return Ok(None);
        }
        if spec.storage != StorageSpecifier::None {
            return err(
                ErrorKind::ExpectedToken,
                &self.lexer.token,
                "Storage specifiers are not allowed on this type declaration.",
            );
        }
        if spec.function_specifiers != 0 {
            return err(
                ErrorKind::ExpectedToken,
                &self.lexer.token,
                "Function specifiers are not allowed on this type declaration.",
            );
        }

        let base = self.specifiers_make_type(&spec)?;
        let syntax = self
            .parse_declarator_syntax(DeclMode::Abstract)?
            .expect("Abstract mode always yields a declarator");
        let (ty, _) = self.apply_declarator(syntax, base)?;
        Ok(Some(ty))
    }

    /*
     * Declarations
     */

    fn parse_asm_name(
        &mut self,
        is_local: bool,
        spec: &Specifiers,
        name: &TokenRef,
        ty: &TypeRef,
    ) -> Result<Rc<str>> {
        let is_plain_asm = self.lexer.is("asm");
        if !is_plain_asm && !self.lexer.is("__asm__") {
            return Ok(name.value.clone());
        }

        if is_plain_asm {
            let token = self.lexer.token.clone();
            self.warn(
                Warning::ExtraKeywords,
                &token,
                "`asm` is a GNU extension; use `__asm__`.",
            )?;
        }
        if is_local
            && spec.storage != StorageSpecifier::Extern
            && !(ty.is_function() && spec.storage == StorageSpecifier::None)
        {
            return err(
                ErrorKind::ExpectedToken,
                &self.lexer.token,
                "Cannot provide an asm name for a local symbol.",
            );
        }

        self.lexer.consume()?;
        self.lexer
            .expect("(", "Expected `(` for an asm name declaration.")?;
        if self.lexer.token.kind != TokenKind::String {
            return err(
                ErrorKind::ExpectedToken,
                &self.lexer.token,
                "Expected a string in this asm name declaration.",
            );
        }
        let mut asm_name = self.lexer.token.value.to_string();
        self.lexer.consume()?;

        // Adjacent string fragments concatenate.
        while self.lexer.token.kind == TokenKind::String {
            asm_name.push_str(&self.lexer.token.value);
            self.lexer.consume()?;
        }

        self.lexer
            .expect(")", "Expected `)` after asm name declaration.")?;
        Ok(self.lexer.interner.intern(&asm_name))
    }

    /// Parses one declaration. Returns false when the tokens do not start
    /// a declaration and `parent` is a block (at file scope a missing type
    /// means implicit int).
    pub fn try_parse_declaration(&mut self, mut parent: Option<&mut Node>) -> Result<bool> {
        let mut spec = Specifiers::new();
        let found = self.try_parse_declaration_specifiers(&mut spec)?;
        if !found && parent.is_some() {
            return Ok(false);
        }
        let base_ty = self.specifiers_make_type(&spec)?;

        let mut first_declarator = true;
        loop {
            let syntax = self
                .parse_declarator_syntax(DeclMode::Either)?
                .expect("Either mode always yields a declarator");
            let empty_declarator = syntax.is_empty();
            let (ty, name) = self.apply_declarator(syntax, base_ty.clone())?;

            let Some(name) = name else {
                if empty_declarator {
                    // A bare struct, union or enum declaration needs no
                    // declarator.
                    if spec.type_specifiers & (TS_RECORD | TS_ENUM) == 0 {
                        return err(
                            ErrorKind::ExpectedDeclarator,
                            &self.lexer.token,
                            "Expected a declarator for this declaration.",
                        );
                    }
                } else {
                    return err(
                        ErrorKind::ExpectedDeclarator,
                        &self.lexer.token,
                        "Expected a name in this declarator.",
                    );
                }
                if self.lexer.accept(",")? {
                    first_declarator = false;
                    continue;
                }
                self.lexer
                    .expect(";", "Expected `;` or `,` at end of declarator.")?;
                break;
            };

            // typedef
            if spec.storage == StorageSpecifier::Typedef {
                if self.lexer.is("=") || self.lexer.is("{") {
                    return err(
                        ErrorKind::InvalidInitializer,
                        &name,
                        "A definition cannot be provided for a typedef declaration.",
                    );
                }
                self.scopes
                    .add_type(Namespace::Typedef, name.value.clone(), ty);
                if self.lexer.accept(",")? {
                    first_declarator = false;
                    continue;
                }
                self.lexer
                    .expect(";", "Expected `;` or `,` at end of declarator.")?;
                break;
            }

            let asm_name = self.parse_asm_name(parent.is_some(), &spec, &name, &ty)?;

            if ty.is_function() {
                if !first_declarator && self.lexer.is("{") {
                    return err(
                        ErrorKind::ExpectedToken,
                        &self.lexer.token,
                        "A function definition cannot appear on a declaration with multiple \
                         declarators.",
                    );
                }
                self.parse_function_declaration(&spec, ty, name, asm_name, parent.is_none())?;
                break;
            }

            self.parse_variable_declaration(parent.as_deref_mut(), &spec, ty, name, asm_name)?;

            if self.lexer.accept(",")? {
                first_declarator = false;
                continue;
            }
            self.lexer
                .expect(";", "Expected `;` or `,` at end of declarator.")?;
            break;
        }

        Ok(true)
    }

    pub fn parse_global(&mut self) -> Result<()> {
        if !self.try_parse_declaration(None)? {
            return err(
                ErrorKind::ExpectedToken,
                &self.lexer.token,
                "Expected a declaration at file scope.",
            );
        }
        Ok(())
    }

    /*
     * Functions
     */

    fn parse_function_declaration(
        &mut self,
        spec: &Specifiers,
        ty: TypeRef,
        name: TokenRef,
        asm_name: Rc<str>,
        is_file_scope: bool,
    ) -> Result<()> {
        let linkage = if spec.storage == StorageSpecifier::Static {
            Linkage::Internal
        } else {
            Linkage::External
        };

        let symbol = match self.scopes.find_symbol(&name.value, false) {
            Some(previous) => {
                {
                    let prev = previous.borrow();
                    if prev.kind != SymbolKind::Function {
                        return err(
                            ErrorKind::KindMismatch,
                            &name,
                            format!("`{}` re-declared as a different kind of symbol.", name.value),
                        );
                    }
                    if !Type::equal_unqual(&prev.ty, &ty) {
                        return err(
                            ErrorKind::TypeMismatch,
                            &name,
                            format!("Function `{}` re-declared with a different type.", name.value),
                        );
                    }
                    if linkage == Linkage::Internal && prev.linkage == Linkage::External {
                        return err(
                            ErrorKind::DuplicateSymbol,
                            &name,
                            "A function declared with external linkage cannot be re-declared \
                             static.",
                        );
                    }
                }
                // Adopt the new declaration's type so a definition sees
                // its own parameter names.
                previous.borrow_mut().ty = ty.clone();
                previous
            }
            None => {
                let symbol = Symbol::new(
                    SymbolKind::Function,
                    ty.clone(),
                    name.clone(),
                    asm_name.clone(),
                );
                symbol.borrow_mut().linkage = linkage;
                self.scopes.add_symbol(symbol.clone());
                symbol
            }
        };

        if !self.lexer.is("{") {
            self.lexer
                .expect(";", "Expected `;` or `{` after function declaration.")?;
            return Ok(());
        }

        if !is_file_scope {
            return err(
                ErrorKind::ExpectedToken,
                &self.lexer.token,
                "Function definitions can only appear at file scope.",
            );
        }
        if symbol.borrow().is_defined {
            return err(
                ErrorKind::DuplicateSymbol,
                &name,
                format!("Function `{}` is already defined.", name.value),
            );
        }
        symbol.borrow_mut().is_defined = true;
        self.parse_function_definition(ty, name, asm_name)
    }

    fn parse_function_definition(
        &mut self,
        ty: TypeRef,
        name: TokenRef,
        asm_name: Rc<str>,
    ) -> Result<()> {
        let TypeKind::Function(signature) = &ty.kind else {
            return Err(CompileError::internal("Function symbol has no function type."));
        };
        let signature = signature.clone();

        // Re-enter the prototype scope so tags and typedefs declared in
        // the parameter list are visible, then push a fresh scope for the
        // parameters themselves.
        let prototype_scope = signature
            .scope
            .borrow()
            .clone()
            .ok_or_else(|| CompileError::internal("Function type has no prototype scope."))?;
        self.scopes.push_existing(prototype_scope);
        self.scopes.push();

        let mut root = Node::new(
            NodeKind::Function,
            name.clone(),
            signature.ret.clone(),
        );
        for param in &signature.params {
            let param_ty = Type::decayed(&param.ty);
            let symbol = match &param.name {
                Some(param_name) => {
                    if self.scopes.find_symbol(&param_name.value, false).is_some() {
                        return err(
                            ErrorKind::DuplicateSymbol,
                            param_name,
                            format!("Duplicate parameter name `{}`.", param_name.value),
                        );
                    }
                    let symbol = Symbol::new(
                        SymbolKind::Variable,
                        param_ty.clone(),
                        param_name.clone(),
                        param_name.value.clone(),
                    );
                    symbol.borrow_mut().is_defined = true;
                    self.scopes.add_symbol(symbol.clone());
                    Some(symbol)
                }
                None => None,
            };
            root.append(Node::new(
                NodeKind::Parameter(symbol),
                param.name.clone().unwrap_or_else(|| name.clone()),
                param_ty,
            ));
        }

        self.current_function_name = Some(name.value.clone());
        self.current_return_type = Some(signature.ret.clone());

        let body = self.parse_compound_statement(false)?;
        root.append(body);

        if self.options.dump_ast {
            let mut stdout = std::io::stdout();
            let _ = root.print_tree(&mut stdout, 0);
        }

        let mut function = Function::new(signature, name, asm_name, root);
        if self.options.optimize {
            optimize_tree::optimize(&mut function.root);
        }
        generate::generate_function(self, &mut function)?;
        if self.options.optimize {
            optimize_asm::optimize(&mut function);
        }
        self.emitter.function(&function);

        self.scopes.pop();
        self.scopes.pop();
        self.current_function_name = None;
        self.current_return_type = None;
        Ok(())
    }

    /*
     * Variables
     */

    fn parse_variable_declaration(
        &mut self,
        parent: Option<&mut Node>,
        spec: &Specifiers,
        ty: TypeRef,
        name: TokenRef,
        asm_name: Rc<str>,
    ) -> Result<()> {
        if self.lexer.is("{") {
            return err(
                ErrorKind::ExpectedToken,
                &self.lexer.token,
                "Cannot initialize a variable with `{`. (Is this meant to be a function?)",
            );
        }

        let mut initializer = None;
        if self.lexer.is("=") {
            if spec.storage == StorageSpecifier::Extern {
                return err(
                    ErrorKind::InvalidInitializer,
                    &self.lexer.token,
                    "Cannot initialize a variable declared `extern`.",
                );
            }
            self.lexer.consume()?;
            initializer = Some(self.parse_initializer(&ty)?);
        }

        let symbol = Symbol::new(SymbolKind::Variable, ty, name.clone(), asm_name);

        let is_local = parent.is_some();
        let symbol = if is_local {
            if spec.storage == StorageSpecifier::Extern {
                self.declare_local_extern_variable(symbol)?
            } else {
                self.declare_local_variable(spec, symbol, initializer.is_some())?
            }
        } else {
            self.declare_global_variable(spec, symbol, initializer.is_some())?
        };

        // An initializer fixes the size of an indeterminate array. This
        // has to happen after redeclaration merging, since a previous
        // declaration may have supplied the size.
        let symbol_ty = symbol.borrow().ty.clone();
        if let (Some(init), TypeKind::Indeterminate { element }) = (&initializer, &symbol_ty.kind)
        {
            let count = match &init.kind {
                NodeKind::InitList => init.children.len() as u32,
                NodeKind::StringLit { .. } => init.ty.size()?,
                _ => {
                    return err(
                        ErrorKind::InvalidInitializer,
                        &name,
                        "Invalid initializer for array of indeterminate length.",
                    );
                }
            };
            symbol.borrow_mut().ty = Type::array(element.clone(), count);
        }

        // Definitions with linkage are emitted now.
        let emit = {
            let s = symbol.borrow();
            s.is_defined && s.linkage != Linkage::None
        };
        if emit {
            generate::generate_static_variable(self, &symbol, initializer.as_ref())?;
        }

        // Plain locals get a tree node carrying their initializer.
        if is_local && spec.storage != StorageSpecifier::Extern {
            if symbol.borrow().linkage == Linkage::None {
                let mut node = Node::new(
                    NodeKind::Variable(symbol.clone()),
                    name,
                    Type::base(BaseType::Void),
                );
                if let Some(init) = initializer {
                    node.append(init);
                }
                parent.expect("locals have a parent").append(node);
            }
        }

        Ok(())
    }

    /// Checks and merges the types of a re-declared variable. An
    /// indeterminate array takes its size from a sized declaration on the
    /// other side; the older symbol is updated in place.
    fn merge_redeclaration_types(&self, old: &SymbolRef, new: &SymbolRef) -> Result<()> {
        let old_ty = old.borrow().ty.clone();
        let new_ty = new.borrow().ty.clone();

        let mismatch = || {
            err(
                ErrorKind::TypeMismatch,
                &new.borrow().token,
                format!(
                    "`{}` re-declared with a different type.",
                    new.borrow().name
                ),
            )
        };

        if let (TypeKind::Array { element: oe, .. }, TypeKind::Indeterminate { element: ne }) =
            (&old_ty.kind, &new_ty.kind)
        {
            if !Type::equal(oe, ne) {
                return mismatch();
            }
            new.borrow_mut().ty = old_ty;
            return Ok(());
        }
        if let (TypeKind::Indeterminate { element: oe }, TypeKind::Array { element: ne, .. }) =
            (&old_ty.kind, &new_ty.kind)
        {
            if !Type::equal(oe, ne) {
                return mismatch();
            }
            old.borrow_mut().ty = new_ty;
            return Ok(());
        }

        if !Type::equal_unqual(&old_ty, &new_ty) {
            return mismatch();
        }
        Ok(())
    }

    fn declare_local_extern_variable(&mut self, symbol: SymbolRef) -> Result<SymbolRef> {
        // A matching declaration may already exist in this scope.
        let name = symbol.borrow().name.clone();
        if let Some(previous) = self.scopes.find_symbol(&name, false) {
            if previous.borrow().linkage == Linkage::None {
                return err(
                    ErrorKind::DuplicateSymbol,
                    &symbol.borrow().token,
                    "Variable re-declared in block scope.",
                );
            }
            self.merge_redeclaration_types(&previous, &symbol)?;
            return Ok(previous);
        }
        self.scopes.add_symbol(symbol.clone());

        // The declaration must agree with any file-scope symbol; if there
        // is none, a hidden shadow is created there so later declarations
        // can still be checked after this one goes out of scope.
        match self.scopes.find_symbol_global(&name) {
            Some(global) => {
                if !Type::equal_unqual(&global.borrow().ty, &symbol.borrow().ty) {
                    return err(
                        ErrorKind::TypeMismatch,
                        &symbol.borrow().token,
                        "`extern` variable re-declared with a different type.",
                    );
                }
                let linkage = global.borrow().linkage;
                symbol.borrow_mut().linkage = linkage;
            }
            None => {
                symbol.borrow_mut().linkage = Linkage::External;
                let hidden = symbol.borrow().clone_detached();
                hidden.borrow_mut().is_hidden = true;
                self.scopes.add_symbol_global(hidden);
            }
        }
        Ok(symbol)
    }

    fn declare_local_variable(
        &mut self,
        spec: &Specifiers,
        symbol: SymbolRef,
        _has_initializer: bool,
    ) -> Result<SymbolRef> {
        let name = symbol.borrow().name.clone();
        if self.scopes.find_symbol(&name, false).is_some() {
            return err(
                ErrorKind::DuplicateSymbol,
                &symbol.borrow().token,
                "Variable re-declared in block scope.",
            );
        }

        match spec.storage {
            StorageSpecifier::None | StorageSpecifier::Auto | StorageSpecifier::Register => {
                symbol.borrow_mut().is_defined = true;
            }
            StorageSpecifier::Static => {
                let label = self.alloc_label();
                let unique = {
                    let s = symbol.borrow();
                    format!("{}{:x}_{}", crate::emit::MISC_LABEL_PREFIX, label, s.asm_name)
                };
                let unique = self.lexer.interner.intern(&unique);
                let mut s = symbol.borrow_mut();
                s.is_defined = true;
                s.linkage = Linkage::Internal;
                s.asm_name = unique;
            }
            _ => {
                return Err(CompileError::internal(
                    "Invalid storage specifier for a local variable.",
                ));
            }
        }

        self.scopes.add_symbol(symbol.clone());
        Ok(symbol)
    }

    fn declare_global_variable(
        &mut self,
        spec: &Specifiers,
        symbol: SymbolRef,
        has_initializer: bool,
    ) -> Result<SymbolRef> {
        {
            let mut s = symbol.borrow_mut();
            s.linkage = if spec.storage == StorageSpecifier::Static {
                Linkage::Internal
            } else {
                Linkage::External
            };
            s.is_tentative = !has_initializer && spec.storage != StorageSpecifier::Extern;
            s.is_defined = has_initializer;
        }

        let name = symbol.borrow().name.clone();
        if let Some(previous) = self.scopes.find_symbol_global(&name) {
            if previous.borrow().kind != SymbolKind::Variable {
                return err(
                    ErrorKind::KindMismatch,
                    &symbol.borrow().token,
                    format!("`{}` re-declared as a different kind of symbol.", name),
                );
            }
            self.merge_redeclaration_types(&previous, &symbol)?;

            // `extern` adopts the existing linkage; otherwise it must
            // match.
            if spec.storage == StorageSpecifier::Extern {
                let linkage = previous.borrow().linkage;
                symbol.borrow_mut().linkage = linkage;
            } else if previous.borrow().linkage != symbol.borrow().linkage {
                return err(
                    ErrorKind::DuplicateSymbol,
                    &symbol.borrow().token,
                    "Variable re-declared at file scope with a different linkage.",
                );
            }

            if previous.borrow().is_defined && symbol.borrow().is_defined {
                return err(
                    ErrorKind::DuplicateSymbol,
                    &symbol.borrow().token,
                    "Variable re-defined at file scope.",
                );
            }

            // The new declaration replaces the old one if it is a
            // definition, or if it is tentative and the old one was a
            // plain extern declaration. Otherwise it is discarded.
            let replace = {
                let prev = previous.borrow();
                let new = symbol.borrow();
                new.is_defined || (new.is_tentative && !prev.is_defined && !prev.is_tentative)
            };
            if replace {
                self.scopes.remove_symbol(&name);
                self.scopes.add_symbol(symbol.clone());
                if symbol.borrow().is_tentative {
                    self.pending_globals.push(symbol.clone());
                }
                return Ok(symbol);
            }
            return Ok(previous);
        }

        self.scopes.add_symbol(symbol.clone());
        if symbol.borrow().is_tentative {
            self.pending_globals.push(symbol.clone());
        }
        Ok(symbol)
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::ErrorKind;
    use crate::options::Options;
    use crate::{compile_source, Compiler};

    fn compile(source: &str) -> crate::Result<String> {
        compile_source(source, "test.i", &Options::default())
    }

    fn parse_type_of(source: &str) -> crate::Result<String> {
        let mut c = Compiler::new(source.as_bytes().to_vec(), "test.i", Options::default())?;
        let ty = c.try_parse_type()?.expect("expected a type");
        Ok(format!("{}", ty))
    }

    #[test]
    fn test_declarator_shapes() {
        assert_eq!(parse_type_of("int").unwrap(), "int");
        assert_eq!(parse_type_of("int*").unwrap(), "int*");
        assert_eq!(parse_type_of("int*[3]").unwrap(), "int*[3]");
        assert_eq!(parse_type_of("int(*)[3]").unwrap(), "int[3]*");
        assert_eq!(parse_type_of("int(*)(void)").unwrap(), "int()*");
        assert_eq!(parse_type_of("char**").unwrap(), "char**");
        assert_eq!(parse_type_of("int[2][3]").unwrap(), "int[3][2]");
    }

    #[test]
    fn test_array_of_functions_rejected() {
        let e = parse_type_of("int(void)[3]").unwrap_err();
        assert_eq!(e.kind, ErrorKind::KindMismatch);
    }

    #[test]
    fn test_double_long() {
        assert_eq!(parse_type_of("long long").unwrap(), "long long");
        assert_eq!(parse_type_of("unsigned long long int").unwrap(), "unsigned long long");
        // long collapses to int in this dialect
        assert_eq!(parse_type_of("long").unwrap(), "int");
        assert_eq!(parse_type_of("unsigned long").unwrap(), "unsigned int");
        assert_eq!(parse_type_of("long double").unwrap(), "double");
    }

    #[test]
    fn test_triple_long_rejected() {
        let e = parse_type_of("long long long").unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidTypeSpecifierCombo);
    }

    #[test]
    fn test_invalid_combo_rejected() {
        let e = parse_type_of("short char").unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidTypeSpecifierCombo);
    }

    #[test]
    fn test_redundant_specifier_rejected() {
        let e = parse_type_of("int int").unwrap_err();
        assert_eq!(e.kind, ErrorKind::RedundantSpecifier);
    }

    #[test]
    fn test_unsupported_keywords() {
        for src in ["_Atomic int x;", "_Thread_local int x;", "_Alignas(4) int x;"] {
            let e = compile(src).unwrap_err();
            assert_eq!(e.kind, ErrorKind::UnsupportedFeature, "{}", src);
        }
    }

    #[test]
    fn test_typedef() {
        let asm = compile(
            "typedef unsigned int size_t;\n\
             size_t f(size_t n) { return n + 1; }\n\
             int main(void) { return f(1) == 2 ? 0 : 1; }",
        );
        assert!(asm.is_ok());
    }

    #[test]
    fn test_struct_definition_and_use() {
        let asm = compile(
            "struct point { int x; int y; };\n\
             int main(void) { struct point p; p.x = 1; p.y = 2; return p.x + p.y - 3; }",
        );
        assert!(asm.is_ok());
    }

    #[test]
    fn test_struct_kind_mismatch() {
        let e = compile("struct s { int x; }; union s u;").unwrap_err();
        assert_eq!(e.kind, ErrorKind::KindMismatch);
    }

    #[test]
    fn test_duplicate_record_definition() {
        let e = compile("struct s { int x; }; struct s { int y; };").unwrap_err();
        assert_eq!(e.kind, ErrorKind::DuplicateSymbol);
    }

    #[test]
    fn test_enum_no_forward_declaration() {
        let e = compile("enum e;").unwrap_err();
        assert_eq!(e.kind, ErrorKind::UnsupportedFeature);
    }

    #[test]
    fn test_variable_redeclaration_merges_array_size() {
        let asm = compile(
            "int arr[];\n\
             int arr[4];\n\
             int main(void) { return sizeof(arr) == 16 ? 0 : 1; }",
        );
        assert!(asm.is_ok());
    }

    #[test]
    fn test_conflicting_redeclaration() {
        let e = compile("int x; char x;").unwrap_err();
        assert_eq!(e.kind, ErrorKind::TypeMismatch);
    }

    #[test]
    fn test_double_definition_rejected() {
        let e = compile("int x = 1; int x = 2;").unwrap_err();
        assert_eq!(e.kind, ErrorKind::DuplicateSymbol);
    }

    #[test]
    fn test_tentative_then_definition() {
        let asm = compile("int x; int x = 3; int main(void) { return 0; }").unwrap();
        // Exactly one definition of x is emitted.
        assert_eq!(asm.matches("@x ").count(), 1);
    }

    #[test]
    fn test_asm_name_override() {
        let asm = compile(
            "int real_name(void) __asm__(\"alias_name\");\n\
             int real_name(void) { return 0; }\n\
             int main(void) { return real_name(); }",
        )
        .unwrap();
        assert!(asm.contains("@alias_name"));
        assert!(asm.contains("call ^_F_alias_name") || asm.contains("call ^alias_name"));
    }

    #[test]
    fn test_local_static_gets_unique_label() {
        let asm = compile(
            "int counter(void) { static int n; n = n + 1; return n; }\n\
             int main(void) { counter(); return counter() - 2; }",
        )
        .unwrap();
        assert!(asm.contains(crate::emit::MISC_LABEL_PREFIX));
    }

    #[test]
    fn test_function_definition_only_at_file_scope() {
        let e = compile("int main(void) { int f(void) { return 1; } return 0; }").unwrap_err();
        assert_eq!(e.kind, ErrorKind::ExpectedToken);
    }

    #[test]
    fn test_prototype_arity_checked() {
        let e = compile(
            "int f(int a, int b);\n\
             int main(void) { return f(1); }",
        )
        .unwrap_err();
        assert_eq!(e.kind, ErrorKind::ArityMismatch);
    }

    #[test]
    fn test_variadic_accepts_extra_arguments() {
        let asm = compile(
            "int printf(const char* fmt, ...);\n\
             int main(void) { printf(\"%d %d\", 1, 2); return 0; }",
        );
        assert!(asm.is_ok());
    }

    #[test]
    fn test_implicit_int_at_file_scope() {
        // Implicit int produces a warning but compiles.
        let asm = compile("x; int main(void) { return x; }");
        assert!(asm.is_ok());
    }
}

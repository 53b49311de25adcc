//! Type graph
//!
//! Types are immutable once built and shared by reference. The only
//! mutation in the graph is the definition of a record after a forward
//! declaration, which goes through the record's interior mutability rather
//! than replacing the type node.
//!
//! `long` and `unsigned long` collapse to the 32-bit int bases and
//! `long double` collapses to `double` at specifier conversion, so the
//! graph carries no distinct long rank. `long long` keeps its own 64-bit
//! bases.

use std::cell::RefCell;
use std::rc::Rc;

use crate::errors::{CompileError, Result};
use crate::record::Record;
use crate::scope::ScopeRef;
use crate::token::TokenRef;

pub const WORD_SIZE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseType {
    Void,
    Bool,
    Char,
    SignedChar,
    UnsignedChar,
    SignedShort,
    UnsignedShort,
    SignedInt,
    UnsignedInt,
    SignedLongLong,
    UnsignedLongLong,
    Float,
    Double,
    VaList,
}

impl BaseType {
    pub fn size(self) -> Option<u32> {
        match self {
            BaseType::Void => None,
            BaseType::Bool | BaseType::Char | BaseType::SignedChar | BaseType::UnsignedChar => {
                Some(1)
            }
            BaseType::SignedShort | BaseType::UnsignedShort => Some(2),
            BaseType::SignedInt | BaseType::UnsignedInt | BaseType::Float | BaseType::VaList => {
                Some(4)
            }
            BaseType::SignedLongLong | BaseType::UnsignedLongLong | BaseType::Double => Some(8),
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            BaseType::Bool
                | BaseType::Char
                | BaseType::SignedChar
                | BaseType::UnsignedChar
                | BaseType::SignedShort
                | BaseType::UnsignedShort
                | BaseType::SignedInt
                | BaseType::UnsignedInt
                | BaseType::SignedLongLong
                | BaseType::UnsignedLongLong
        )
    }

    /// True for signed integer bases. Plain `char` is signed in this
    /// dialect.
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            BaseType::Char
                | BaseType::SignedChar
                | BaseType::SignedShort
                | BaseType::SignedInt
                | BaseType::SignedLongLong
        )
    }
}

/// An enumeration. Constants live in the ordinary namespace as symbols;
/// the enum itself only identifies the tag. The back-references from the
/// enum to its constants are non-owning, which breaks the only potential
/// ownership cycle in the graph.
#[derive(Debug)]
pub struct EnumType {
    pub tag: Option<TokenRef>,
}

pub type EnumRef = Rc<EnumType>;

#[derive(Debug)]
pub struct Param {
    pub name: Option<TokenRef>,
    pub ty: TypeRef,
}

/// A function signature. The scope captures tags and typedefs declared
/// inside the prototype's parameter list so a following definition can
/// re-enter it.
#[derive(Debug)]
pub struct FunctionType {
    pub ret: TypeRef,
    pub params: Vec<Param>,
    pub variadic: bool,
    pub scope: RefCell<Option<ScopeRef>>,
}

pub type RecordRef = Rc<RefCell<Record>>;
pub type FunctionRef = Rc<FunctionType>;

#[derive(Debug, Clone)]
pub enum TypeKind {
    Base(BaseType),
    Record(RecordRef),
    Enum(EnumRef),
    Pointer {
        target: TypeRef,
        restrict: bool,
    },
    Array {
        element: TypeRef,
        count: u32,
    },
    /// An array whose size has not been written yet (`int x[]`). The size
    /// may later be fixed by an initialiser or a redeclaration.
    Indeterminate {
        element: TypeRef,
    },
    Function(FunctionRef),
}

#[derive(Debug, Clone)]
pub struct Type {
    pub kind: TypeKind,
    pub is_const: bool,
    pub is_volatile: bool,
}

pub type TypeRef = Rc<Type>;

impl Type {
    pub fn base(base: BaseType) -> TypeRef {
        Rc::new(Type {
            kind: TypeKind::Base(base),
            is_const: false,
            is_volatile: false,
        })
    }

    pub fn record(record: RecordRef) -> TypeRef {
        Rc::new(Type {
            kind: TypeKind::Record(record),
            is_const: false,
            is_volatile: false,
        })
    }

    pub fn enumeration(en: EnumRef) -> TypeRef {
        Rc::new(Type {
            kind: TypeKind::Enum(en),
            is_const: false,
            is_volatile: false,
        })
    }

    pub fn pointer(target: TypeRef, is_const: bool, is_volatile: bool, restrict: bool) -> TypeRef {
        Rc::new(Type {
            kind: TypeKind::Pointer { target, restrict },
            is_const,
            is_volatile,
        })
    }

    pub fn array(element: TypeRef, count: u32) -> TypeRef {
        Rc::new(Type {
            kind: TypeKind::Array { element, count },
            is_const: false,
            is_volatile: false,
        })
    }

    pub fn indeterminate(element: TypeRef) -> TypeRef {
        Rc::new(Type {
            kind: TypeKind::Indeterminate { element },

            is_const: false,
            is_volatile: false,
        })
    }

    pub fn function(function: FunctionRef) -> TypeRef {
        Rc::new(Type {
            kind: TypeKind::Function(function),
            is_const: false,
            is_volatile: false,
        })
    }

    /// Returns a copy of this type with the given qualifiers added.
    pub fn qualified(ty: &TypeRef, is_const: bool, is_volatile: bool) -> TypeRef {
        if (!is_const || ty.is_const) && (!is_volatile || ty.is_volatile) {
            return ty.clone();
        }
        Rc::new(Type {
            kind: ty.kind.clone(),
            is_const: ty.is_const || is_const,
            is_volatile: ty.is_volatile || is_volatile,
        })
    }

    pub fn as_base(&self) -> Option<BaseType> {
        match self.kind {
            TypeKind::Base(b) => Some(b),
            _ => None,
        }
    }

    pub fn matches_base(&self, base: BaseType) -> bool {
        self.as_base() == Some(base)
    }

    pub fn is_void(&self) -> bool {
        self.matches_base(BaseType::Void)
    }

    pub fn is_bool(&self) -> bool {
        self.matches_base(BaseType::Bool)
    }

    pub fn is_integer(&self) -> bool {
        match self.kind {
            TypeKind::Base(b) => b.is_integer(),
            TypeKind::Enum(_) => true,
            _ => false,
        }
    }

    pub fn is_arithmetic(&self) -> bool {
        match self.kind {
            TypeKind::Base(b) => {
                b.is_integer() || matches!(b, BaseType::Float | BaseType::Double)
            }
            TypeKind::Enum(_) => true,
            _ => false,
        }
    }

    pub fn is_signed(&self) -> bool {
        match self.kind {
            TypeKind::Base(b) => b.is_signed(),
            // Enum constants are stored as signed int.
            TypeKind::Enum(_) => true,
            _ => false,
        }
    }

    pub fn is_floating(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Base(BaseType::Float) | TypeKind::Base(BaseType::Double)
        )
    }

    pub fn is_long_long(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Base(BaseType::SignedLongLong) | TypeKind::Base(BaseType::UnsignedLongLong)
        )
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.kind, TypeKind::Pointer { .. })
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Array { .. } | TypeKind::Indeterminate { .. }
        )
    }

    /// Pointer or array: anything that refers to other storage.
    pub fn is_indirection(&self) -> bool {
        self.is_pointer() || self.is_array()
    }

    pub fn is_function(&self) -> bool {
        matches!(self.kind, TypeKind::Function(_))
    }

    pub fn is_record(&self) -> bool {
        matches!(self.kind, TypeKind::Record(_))
    }

    /// True for types a call expression can be applied to.
    pub fn is_callable(&self) -> bool {
        match &self.kind {
            TypeKind::Function(_) => true,
            TypeKind::Pointer { target, .. } => target.is_function(),
            _ => false,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionRef> {
        match &self.kind {
            TypeKind::Function(f) => Some(f),
            TypeKind::Pointer { target, .. } => match &target.kind {
                TypeKind::Function(f) => Some(f),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&RecordRef> {
        match &self.kind {
            TypeKind::Record(r) => Some(r),
            _ => None,
        }
    }

    /// The type referred to by a pointer or array.
    pub fn pointee(&self) -> Option<&TypeRef> {
        match &self.kind {
            TypeKind::Pointer { target, .. } => Some(target),
            TypeKind::Array { element, .. } => Some(element),
            TypeKind::Indeterminate { element } => Some(element),
            _ => None,
        }
    }

    /// A flexible array member: zero or indeterminate length.
    pub fn is_flexible_array(&self) -> bool {
        match self.kind {
            TypeKind::Indeterminate { .. } => true,
            TypeKind::Array { count, .. } => count == 0,
            _ => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        match &self.kind {
            TypeKind::Base(b) => b.size().is_some(),
            TypeKind::Record(r) => r.borrow().is_defined,
            TypeKind::Enum(_) | TypeKind::Pointer { .. } => true,
            TypeKind::Array { element, .. } => element.is_complete(),
            TypeKind::Indeterminate { .. } => false,
            TypeKind::Function(_) => false,
        }
    }

    /// Size in bytes. Calling this on an incomplete type is an internal
    /// error: user-facing completeness checks happen before layout.
    pub fn size(&self) -> Result<u32> {
        match &self.kind {
            TypeKind::Base(b) => b
                .size()
                .ok_or_else(|| CompileError::internal("Cannot take the size of void.")),
            TypeKind::Enum(_) => Ok(4),
            TypeKind::Pointer { .. } => Ok(WORD_SIZE),
            TypeKind::Array { element, count } => Ok(element.size()?.saturating_mul(*count)),
            TypeKind::Indeterminate { .. } => Err(CompileError::internal(
                "Cannot take the size of an array of indeterminate length.",
            )),
            TypeKind::Function(_) => {
                Err(CompileError::internal("Cannot take the size of a function."))
            }
            TypeKind::Record(r) => {
                let record = r.borrow();
                if !record.is_defined {
                    return Err(CompileError::internal(
                        "Cannot take the size of a record that has not been defined.",
                    ));
                }
                Ok(record.size)
            }
        }
    }

    pub fn alignment(&self) -> Result<u32> {
        match &self.kind {
            TypeKind::Record(r) => {
                let record = r.borrow();
                if !record.is_defined {
                    return Err(CompileError::internal(
                        "Cannot take the alignment of a record that has not been defined.",
                    ));
                }
                Ok(record.alignment.max(1))
            }
            TypeKind::Array { element, .. } | TypeKind::Indeterminate { element } => {
                element.alignment()
            }
            _ => Ok(self.size()?.min(WORD_SIZE)),
        }
    }

    /// Array-to-pointer decay; other types pass through unchanged.
    pub fn decayed(ty: &TypeRef) -> TypeRef {
        match ty.pointee() {
            Some(element) if ty.is_array() => Type::pointer(element.clone(), false, false, false),
            _ => ty.clone(),
        }
    }

    /// Structural equality including qualifiers.
    pub fn equal(a: &TypeRef, b: &TypeRef) -> bool {
        a.is_const == b.is_const && a.is_volatile == b.is_volatile && Type::equal_unqual(a, b)
    }

    /// Structural equality ignoring top-level qualifiers.
    pub fn equal_unqual(a: &TypeRef, b: &TypeRef) -> bool {
        match (&a.kind, &b.kind) {
            (TypeKind::Base(x), TypeKind::Base(y)) => x == y,
            (TypeKind::Record(x), TypeKind::Record(y)) => Rc::ptr_eq(x, y),
            (TypeKind::Enum(x), TypeKind::Enum(y)) => Rc::ptr_eq(x, y),
            (TypeKind::Pointer { target: x, .. }, TypeKind::Pointer { target: y, .. }) => {
                Type::equal(x, y)
            }
            (
                TypeKind::Array {
                    element: x,
                    count: m,
                },
                TypeKind::Array {
                    element: y,
                    count: n,
                },
            ) => m == n && Type::equal(x, y),
            (TypeKind::Indeterminate { element: x }, TypeKind::Indeterminate { element: y }) => {
                Type::equal(x, y)
            }
            (TypeKind::Function(x), TypeKind::Function(y)) => {
                x.variadic == y.variadic
                    && x.params.len() == y.params.len()
                    && Type::equal(&x.ret, &y.ret)
                    && x.params
                        .iter()
                        .zip(y.params.iter())
                        .all(|(p, q)| Type::equal_unqual(&p.ty, &q.ty))
            }
            _ => false,
        }
    }

    /// Integer promotion. Integer types smaller than int promote to int;
    /// enums decay to int; everything else is unchanged. Idempotent.
    pub fn promoted(ty: &TypeRef) -> TypeRef {
        match ty.kind {
            TypeKind::Base(b) if b.is_integer() => match b {
                BaseType::SignedInt
                | BaseType::UnsignedInt
                | BaseType::SignedLongLong
                | BaseType::UnsignedLongLong => ty.clone(),
                _ => Type::base(BaseType::SignedInt),
            },
            TypeKind::Enum(_) => Type::base(BaseType::SignedInt),
            _ => ty.clone(),
        }
    }

    /// The usual arithmetic conversions of C17 6.3.1.8, applied to two
    /// already-promoted arithmetic types. Symmetric in its arguments.
    pub fn usual_arithmetic(a: &TypeRef, b: &TypeRef) -> TypeRef {
        use BaseType::*;
        let ab = a.as_base().unwrap_or(SignedInt);
        let bb = b.as_base().unwrap_or(SignedInt);

        if ab == Double || bb == Double {
            return Type::base(Double);
        }
        if ab == Float || bb == Float {
            return Type::base(Float);
        }

        // Integer ranks: long long above int. Unsigned wins at equal rank;
        // a wider signed type absorbs a narrower unsigned one.
        let rank = |t: BaseType| match t {
            SignedLongLong | UnsignedLongLong => 2,
            _ => 1,
        };
        let (ra, rb) = (rank(ab), rank(bb));
        if ra == rb {
            if ra == 2 {
                if ab == UnsignedLongLong || bb == UnsignedLongLong {
                    return Type::base(UnsignedLongLong);
                }
                return Type::base(SignedLongLong);
            }
            if ab == UnsignedInt || bb == UnsignedInt {
                return Type::base(UnsignedInt);
            }
            return Type::base(SignedInt);
        }
        let (hi, lo) = if ra > rb { (ab, bb) } else { (bb, ab) };
        if hi == UnsignedLongLong {
            return Type::base(UnsignedLongLong);
        }
        // Signed long long represents every unsigned int value.
        let _ = lo;
        Type::base(SignedLongLong)
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_const {
            write!(f, "const ")?;
        }
        if self.is_volatile {
            write!(f, "volatile ")?;
        }
        match &self.kind {
            TypeKind::Base(b) => {
                let name = match b {
                    BaseType::Void => "void",
                    BaseType::Bool => "_Bool",
                    BaseType::Char => "char",
                    BaseType::SignedChar => "signed char",
                    BaseType::UnsignedChar => "unsigned char",
                    BaseType::SignedShort => "short",
                    BaseType::UnsignedShort => "unsigned short",
                    BaseType::SignedInt => "int",
                    BaseType::UnsignedInt => "unsigned int",
                    BaseType::SignedLongLong => "long long",
                    BaseType::UnsignedLongLong => "unsigned long long",
                    BaseType::Float => "float",
                    BaseType::Double => "double",
                    BaseType::VaList => "va_list",
                };
                write!(f, "{}", name)
            }
            TypeKind::Record(r) => {
                let record = r.borrow();
                let keyword = if record.is_struct { "struct" } else { "union" };
                match &record.tag {
                    Some(tag) => write!(f, "{} {}", keyword, tag.value),
                    None => write!(f, "{} <anonymous>", keyword),
                }
            }
            TypeKind::Enum(e) => match &e.tag {
                Some(tag) => write!(f, "enum {}", tag.value),
                None => write!(f, "enum <anonymous>"),
            },
            TypeKind::Pointer { target, .. } => write!(f, "{}*", target),
            TypeKind::Array { element, count } => write!(f, "{}[{}]", element, count),
            TypeKind::Indeterminate { element } => write!(f, "{}[]", element),
            TypeKind::Function(func) => {
                write!(f, "{}(", func.ret)?;
                for (i, param) in func.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", param.ty)?;
                }
                if func.variadic {
                    if !func.params.is_empty() {
                        write!(f, ", ")?;
                    }
                    write!(f, "...")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_sizes() {
        assert_eq!(Type::base(BaseType::Char).size().unwrap(), 1);
        assert_eq!(Type::base(BaseType::SignedShort).size().unwrap(), 2);
        assert_eq!(Type::base(BaseType::SignedInt).size().unwrap(), 4);
        assert_eq!(Type::base(BaseType::SignedLongLong).size().unwrap(), 8);
        assert_eq!(Type::base(BaseType::Double).size().unwrap(), 8);
        assert!(Type::base(BaseType::Void).size().is_err());
    }

    #[test]
    fn test_pointer_sizes_all_equal() {
        // sizeof(T*) == sizeof(void*) for every T
        let void_ptr = Type::pointer(Type::base(BaseType::Void), false, false, false);
        for base in [
            BaseType::Char,
            BaseType::SignedInt,
            BaseType::Double,
            BaseType::SignedLongLong,
        ] {
            let ptr = Type::pointer(Type::base(base), false, false, false);
            assert_eq!(ptr.size().unwrap(), void_ptr.size().unwrap());
        }
    }

    #[test]
    fn test_array_size() {
        // sizeof(T[N]) == N * sizeof(T)
        let arr = Type::array(Type::base(BaseType::SignedShort), 7);
        assert_eq!(arr.size().unwrap(), 14);
    }

    #[test]
    fn test_promotion_idempotent() {
        for base in [
            BaseType::Bool,
            BaseType::Char,
            BaseType::UnsignedShort,
            BaseType::SignedInt,
            BaseType::UnsignedInt,
            BaseType::UnsignedLongLong,
        ] {
            let once = Type::promoted(&Type::base(base));
            let twice = Type::promoted(&once);
            assert!(Type::equal(&once, &twice), "promotion of {:?}", base);
        }
    }

    #[test]
    fn test_small_types_promote_to_int() {
        for base in [
            BaseType::Bool,
            BaseType::Char,
            BaseType::SignedChar,
            BaseType::UnsignedChar,
            BaseType::SignedShort,
            BaseType::UnsignedShort,
        ] {
            let p = Type::promoted(&Type::base(base));
            assert!(p.matches_base(BaseType::SignedInt), "{:?}", base);
        }
    }

    #[test]
    fn test_usual_arithmetic_symmetric() {
        let cases = [
            (BaseType::SignedInt, BaseType::UnsignedInt),
            (BaseType::SignedInt, BaseType::SignedLongLong),
            (BaseType::UnsignedInt, BaseType::SignedLongLong),
            (BaseType::UnsignedInt, BaseType::UnsignedLongLong),
            (BaseType::Float, BaseType::SignedInt),
            (BaseType::Double, BaseType::Float),
        ];
        for (x, y) in cases {
            let a = Type::base(x);
            let b = Type::base(y);
            let ab = Type::usual_arithmetic(&a, &b);
            let ba = Type::usual_arithmetic(&b, &a);
            assert!(Type::equal(&ab, &ba), "{:?} vs {:?}", x, y);
        }
    }

    #[test]
    fn test_usual_arithmetic_results() {
        let int = Type::base(BaseType::SignedInt);
        let uint = Type::base(BaseType::UnsignedInt);
        let sll = Type::base(BaseType::SignedLongLong);

        assert!(Type::usual_arithmetic(&int, &uint).matches_base(BaseType::UnsignedInt));
        // signed long long can represent every unsigned int
        assert!(Type::usual_arithmetic(&uint, &sll).matches_base(BaseType::SignedLongLong));
    }

    #[test]
    fn test_equality_ignores_qualifiers_when_asked() {
        let a = Type::base(BaseType::SignedInt);
        let b = Type::qualified(&Type::base(BaseType::SignedInt), true, false);
        assert!(!Type::equal(&a, &b));
        assert!(Type::equal_unqual(&a, &b));
    }

    #[test]
    fn test_decay() {
        let arr = Type::array(Type::base(BaseType::Char), 10);
        let decayed = Type::decayed(&arr);
        assert!(decayed.is_pointer());
        assert!(decayed.pointee().unwrap().matches_base(BaseType::Char));
    }
}

//! Records (structs and unions)
//!
//! A record owns its ordered member list and a name-to-member map used for
//! lookup. Members of anonymous sub-records are re-keyed into the parent's
//! map at combined offsets, so `record_find` resolves a leaf member across
//! any depth of anonymous nesting in one step.

use std::collections::HashMap;
use std::rc::Rc;

use crate::errors::{CompileError, ErrorKind, Result};
use crate::token::TokenRef;
use crate::types::{TypeKind, TypeRef};

#[derive(Debug)]
pub struct Member {
    /// None for anonymous sub-records.
    pub name: Option<TokenRef>,
    pub ty: TypeRef,
    pub offset: u32,
}

#[derive(Debug)]
pub struct Record {
    pub tag: Option<TokenRef>,
    pub is_struct: bool,
    pub is_defined: bool,
    pub alignment: u32,
    pub size: u32,
    pub members: Vec<Member>,
    map: HashMap<Rc<str>, (TypeRef, u32)>,
}

fn align_up(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

impl Record {
    pub fn new(tag: Option<TokenRef>, is_struct: bool) -> Record {
        Record {
            tag,
            is_struct,
            is_defined: false,
            alignment: 0,
            size: 0,
            members: Vec::new(),
            map: HashMap::new(),
        }
    }

    fn add_to_map(&mut self, name: &TokenRef, ty: TypeRef, offset: u32) -> Result<()> {
        if self.map.contains_key(&name.value) {
            return Err(CompileError::at(
                ErrorKind::DuplicateMember,
                name,
                format!(
                    "Member `{}` defined with the same name as a previous member.",
                    name.value
                ),
            ));
        }
        self.map.insert(name.value.clone(), (ty, offset));
        Ok(())
    }

    /// Re-keys all named members of an anonymous record member into this
    /// record's map. The child's map already contains its own anonymous
    /// members recursively, so one level of merging is enough.
    fn add_anonymous_to_map(&mut self, member_ty: &TypeRef, base_offset: u32) -> Result<()> {
        let TypeKind::Record(child) = &member_ty.kind else {
            return Err(CompileError::internal(
                "Anonymous member is not a struct or union.",
            ));
        };
        let child = child.borrow();
        for (name, (ty, offset)) in &child.map {
            if self.map.contains_key(name) {
                let location = self.tag.as_ref().or(child.tag.as_ref());
                let message = format!(
                    "Member `{}` defined with the same name as a previous member.",
                    name
                );
                return Err(match location {
                    Some(token) => CompileError::at(ErrorKind::DuplicateMember, token, message),
                    None => CompileError::new(ErrorKind::DuplicateMember, message),
                });
            }
            self.map
                .insert(name.clone(), (ty.clone(), base_offset + offset));
        }
        Ok(())
    }

    /// Appends a member, updating the record's alignment and size.
    pub fn add(&mut self, name: Option<TokenRef>, ty: TypeRef) -> Result<()> {
        // A flexible array member must be last, and only structs can have
        // one.
        if let Some(last) = self.members.last() {
            if last.ty.is_flexible_array() {
                let token = name.as_ref().or(self.tag.as_ref());
                let message =
                    "Only the last member in a struct is allowed to be an array of zero or \
                     indeterminate length.";
                return Err(match token {
                    Some(t) => CompileError::at(ErrorKind::InvalidInitializer, t, message),
                    None => CompileError::new(ErrorKind::InvalidInitializer, message),
                });
            }
        }
        if ty.is_flexible_array() && !self.is_struct {
            let token = name.as_ref().or(self.tag.as_ref());
            let message = "Unions cannot contain flexible array members.";
            return Err(match token {
                Some(t) => CompileError::at(ErrorKind::InvalidInitializer, t, message),
                None => CompileError::new(ErrorKind::InvalidInitializer, message),
            });
        }

        // Offset: end of the previous member in a struct, zero in a union.
        let mut offset = 0;
        if self.is_struct {
            if let Some(last) = self.members.last() {
                let last_size = if last.ty.is_flexible_array() {
                    0
                } else {
                    last.ty.size()?
                };
                offset = last.offset + last_size;
            }
        }

        let alignment = ty.alignment()?;
        if self.alignment < alignment {
            self.alignment = alignment;
        }
        offset = align_up(offset, alignment);

        match &name {
            Some(token) => self.add_to_map(token, ty.clone(), offset)?,
            None => self.add_anonymous_to_map(&ty, offset)?,
        }

        let extent = if ty.is_flexible_array() { 0 } else { ty.size()? };
        let end = align_up(offset + extent, self.alignment);
        if end > self.size {
            self.size = end;
        }

        self.members.push(Member { name, ty, offset });
        Ok(())
    }

    /// Finds a member by name, returning its leaf type and combined offset
    /// across anonymous nesting.
    pub fn find(&self, name: &str) -> Result<Option<(TypeRef, u32)>> {
        if !self.is_defined {
            return Err(CompileError::internal(
                "Cannot look up a member of an incomplete record.",
            ));
        }
        Ok(self.map.get(name).map(|(ty, off)| (ty.clone(), *off)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Token, TokenKind};
    use crate::types::{BaseType, Type};
    use std::cell::RefCell;

    fn name(text: &str) -> TokenRef {
        Token::new(
            TokenKind::Alphanumeric,
            Rc::from(text),
            Rc::from("test.i"),
            1,
        )
    }

    #[test]
    fn test_struct_layout() {
        let mut r = Record::new(None, true);
        r.add(Some(name("c")), Type::base(BaseType::Char)).unwrap();
        r.add(Some(name("i")), Type::base(BaseType::SignedInt))
            .unwrap();
        r.add(Some(name("s")), Type::base(BaseType::SignedShort))
            .unwrap();
        r.is_defined = true;

        assert_eq!(r.find("c").unwrap().unwrap().1, 0);
        assert_eq!(r.find("i").unwrap().unwrap().1, 4);
        assert_eq!(r.find("s").unwrap().unwrap().1, 8);
        assert_eq!(r.alignment, 4);
        assert_eq!(r.size, 12);
        assert_eq!(r.size % r.alignment, 0);
    }

    #[test]
    fn test_member_offsets_aligned() {
        let mut r = Record::new(None, true);
        r.add(Some(name("a")), Type::base(BaseType::Char)).unwrap();
        r.add(Some(name("b")), Type::base(BaseType::SignedShort))
            .unwrap();
        r.add(Some(name("c")), Type::base(BaseType::Char)).unwrap();
        r.add(Some(name("d")), Type::base(BaseType::SignedInt))
            .unwrap();
        r.is_defined = true;

        for member in &r.members {
            let alignment = member.ty.alignment().unwrap();
            assert_eq!(member.offset % alignment, 0);
        }
        assert_eq!(r.size % r.alignment, 0);
    }

    #[test]
    fn test_union_layout() {
        let mut r = Record::new(None, false);
        r.add(Some(name("c")), Type::base(BaseType::Char)).unwrap();
        r.add(Some(name("i")), Type::base(BaseType::SignedInt))
            .unwrap();
        r.is_defined = true;

        assert_eq!(r.find("c").unwrap().unwrap().1, 0);
        assert_eq!(r.find("i").unwrap().unwrap().1, 0);
        assert_eq!(r.size, 4);
    }

    #[test]
    fn test_anonymous_flattening() {
        // struct { int a; struct { short b; int c; }; }
        let mut inner = Record::new(None, true);
        inner
            .add(Some(name("b")), Type::base(BaseType::SignedShort))
            .unwrap();
        inner
            .add(Some(name("c")), Type::base(BaseType::SignedInt))
            .unwrap();
        inner.is_defined = true;
        let inner_offset_c = inner.find("c").unwrap().unwrap().1;
        let inner_ty = Type::record(Rc::new(RefCell::new(inner)));

        let mut outer = Record::new(None, true);
        outer
            .add(Some(name("a")), Type::base(BaseType::SignedInt))
            .unwrap();
        outer.add(None, inner_ty).unwrap();
        outer.is_defined = true;

        // offset(outer, c via anon) == offset(outer, anon) + offset(anon, c)
        let anon_offset = outer.members[1].offset;
        let combined = outer.find("c").unwrap().unwrap().1;
        assert_eq!(combined, anon_offset + inner_offset_c);
        assert!(outer.find("b").unwrap().is_some());
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let mut r = Record::new(None, true);
        r.add(Some(name("x")), Type::base(BaseType::SignedInt))
            .unwrap();
        let err = r
            .add(Some(name("x")), Type::base(BaseType::Char))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateMember);
    }

    #[test]
    fn test_duplicate_through_anonymous_rejected() {
        let mut inner = Record::new(None, true);
        inner
            .add(Some(name("x")), Type::base(BaseType::SignedInt))
            .unwrap();
        inner.is_defined = true;
        let inner_ty = Type::record(Rc::new(RefCell::new(inner)));

        let mut outer = Record::new(None, true);
        outer
            .add(Some(name("x")), Type::base(BaseType::SignedInt))
            .unwrap();
        let err = outer.add(None, inner_ty).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateMember);
    }

    #[test]
    fn test_flexible_array_must_be_last() {
        let mut r = Record::new(None, true);
        r.add(Some(name("n")), Type::base(BaseType::SignedInt))
            .unwrap();
        r.add(
            Some(name("data")),
            Type::indeterminate(Type::base(BaseType::Char)),
        )
        .unwrap();
        let err = r
            .add(Some(name("tail")), Type::base(BaseType::SignedInt))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInitializer);
    }

    #[test]
    fn test_flexible_array_not_counted_in_size() {
        let mut r = Record::new(None, true);
        r.add(Some(name("n")), Type::base(BaseType::SignedInt))
            .unwrap();
        r.add(
            Some(name("data")),
            Type::indeterminate(Type::base(BaseType::Char)),
        )
        .unwrap();
        r.is_defined = true;
        assert_eq!(r.size, 4);
    }

    #[test]
    fn test_union_rejects_flexible_array() {
        let mut r = Record::new(None, false);
        let err = r
            .add(
                Some(name("data")),
                Type::indeterminate(Type::base(BaseType::Char)),
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInitializer);
    }
}

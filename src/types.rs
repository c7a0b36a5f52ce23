//! The abstract type model reconstructed from DWARF.
//!
//! All `Type` nodes live in a [`TypeTable`] arena and refer to each other by
//! [`TypeId`]. Struct members can point back at their owner through pointers
//! and references (`struct A { A* next; }`), so inner references are plain
//! indices and the table is the single owner of every node.

use std::collections::BTreeMap;

use crate::Error;

/// Sizes and offsets above this are treated as corrupt input.
pub const MAX_SIZE: u64 = 1024 * 1024;
/// Names above this are treated as corrupt input.
pub const MAX_NAME_LEN: usize = 8 * 1024;

pub fn validate_size(size: u64) -> Result<(), Error> {
    if size < 1 {
        return Err(Error::TypeNotWellDefined(
            "Size can not be <1".to_string(),
        ));
    }
    if size > MAX_SIZE {
        return Err(Error::TypeNotWellDefined(
            "Size can not be >1MB".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_name(name: &str) -> Result<(), Error> {
    // internal g++ names can begin with digits or '.', only length matters
    if name.is_empty() {
        return Err(Error::TypeNotWellDefined(
            "Type name can not be empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::TypeNotWellDefined(format!(
            "Type name is too long: ({name})"
        )));
    }
    Ok(())
}

pub fn validate_offset(offset: u64, alignment: u64) -> Result<(), Error> {
    if offset > MAX_SIZE {
        return Err(Error::TypeNotWellDefined(
            "Offset can not be >1024*1024".to_string(),
        ));
    }
    if alignment == 0 || offset % alignment != 0 {
        return Err(Error::TypeNotWellDefined(format!(
            "Offset ({offset}) is not valid for alignment ({alignment})"
        )));
    }
    Ok(())
}

pub fn validate_alignment(alignment: u64, size: u64) -> Result<(), Error> {
    if ![1, 2, 4, 8].contains(&alignment) {
        return Err(Error::TypeNotWellDefined(format!(
            "Alignment ({alignment}) is not one of [1,2,4,8]"
        )));
    }
    if size % alignment != 0 {
        return Err(Error::TypeNotWellDefined(format!(
            "Size ({size}) has to be a multiple of alignment ({alignment})"
        )));
    }
    Ok(())
}

/// Handle into a [`TypeTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(usize);

/// A reconstructed type. Sizes are `None` until inferred for the
/// placeholder variants (Unknown, Declaration, Array); alignments start
/// `None` everywhere and are tightened by the layout fixer.
#[derive(Clone, Debug)]
pub enum Type {
    /// A type the reconstructor could not resolve; `reason` is diagnostic.
    Unknown { reason: String, size: Option<u64> },
    /// A forward declaration whose body is absent from this file.
    Declaration { name: String, size: Option<u64>, alignment: Option<u64> },
    Base { name: String, size: u64, alignment: Option<u64> },
    Enum { name: String, size: u64, alignment: Option<u64> },
    Union { name: String, size: u64, alignment: Option<u64> },
    Pointer { pointee: TypeId, size: u64, alignment: Option<u64> },
    Reference { pointee: TypeId, size: u64, alignment: Option<u64> },
    Const { inner: TypeId },
    Volatile { inner: TypeId },
    /// Element counts are not recoverable here, so the size starts unknown
    /// and each array site is a distinct node.
    Array { element: TypeId, size: Option<u64> },
    Struct(StructType),
}

/// One slot of a struct layout.
#[derive(Clone, Debug)]
pub enum Slot {
    /// A non-empty base subobject; never moved by the repacker.
    Inheritance { base: TypeId, offset: u64 },
    /// An empty base sharing its offset with the following member.
    EboInheritance { base: TypeId, offset: u64 },
    Member(MemberSlot),
    /// Synthesized filler bytes, alignment 1.
    Padding { size: u64, offset: u64 },
}

/// A data member. `file_id`/`line_no` are -1 when the DIE lacks them and
/// are not preserved through repacking.
#[derive(Clone, Debug)]
pub struct MemberSlot {
    pub name: String,
    pub file_id: i64,
    pub line_no: i64,
    pub type_id: TypeId,
    pub offset: u64,
}

impl Slot {
    pub fn offset(&self) -> u64 {
        match self {
            Slot::Inheritance { offset, .. } => *offset,
            Slot::EboInheritance { offset, .. } => *offset,
            Slot::Member(member) => member.offset,
            Slot::Padding { offset, .. } => *offset,
        }
    }

    /// Occupied bytes. EboInheritance occupies none regardless of the base
    /// type's own size.
    pub fn size(&self, table: &TypeTable) -> Option<u64> {
        match self {
            Slot::Inheritance { base, .. } => table.size_of(*base),
            Slot::EboInheritance { .. } => Some(0),
            Slot::Member(member) => table.size_of(member.type_id),
            Slot::Padding { size, .. } => Some(*size),
        }
    }

    pub fn end(&self, table: &TypeTable) -> Option<u64> {
        Some(self.offset() + self.size(table)?)
    }

    pub fn type_id(&self) -> Option<TypeId> {
        match self {
            Slot::Inheritance { base, .. } => Some(*base),
            Slot::EboInheritance { base, .. } => Some(*base),
            Slot::Member(member) => Some(member.type_id),
            Slot::Padding { .. } => None,
        }
    }

    pub fn is_padding(&self) -> bool {
        matches!(self, Slot::Padding { .. })
    }

    pub fn display_name(&self) -> &str {
        match self {
            Slot::Inheritance { .. } => "__inheritance",
            Slot::EboInheritance { .. } => "__ebo_inheritance",
            Slot::Member(member) => &member.name,
            Slot::Padding { .. } => "",
        }
    }
}

/// An aggregate with a declared size and an ordered slot list.
///
/// Constructing one never fails: malformed input produces a struct that is
/// `valid() == false` but still present in the table, so the tool can keep
/// processing everything else.
#[derive(Clone, Debug)]
pub struct StructType {
    name: String,
    size: u64,
    alignment: Option<u64>,
    valid: bool,
    slots: Vec<Slot>,
}

impl StructType {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        let name = name.into();
        let valid = validate_name(&name).is_ok() && validate_size(size).is_ok();
        StructType { name, size, alignment: None, valid, slots: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn alignment(&self) -> Option<u64> {
        self.alignment
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [Slot] {
        &mut self.slots
    }

    /// Lower the alignment toward the tightest consistent value; never
    /// raises an already-set alignment.
    pub fn try_set_alignment(&mut self, alignment: u64) -> Result<(), Error> {
        match self.alignment {
            Some(current) if current <= alignment => Ok(()),
            _ => {
                validate_alignment(alignment, self.size)?;
                self.alignment = Some(alignment);
                Ok(())
            }
        }
    }

    /// Append a slot, enforcing the construction invariants: the first slot
    /// sits at offset 0 and no slot starts at or past the struct's end.
    pub fn push_slot(&mut self, slot: Slot) -> Result<(), Error> {
        let begin = slot.offset();

        if self.slots.is_empty() {
            if begin != 0 {
                return Err(Error::TypeNotWellDefined(format!(
                    "Member {} in struct {} has to be at (this+0/{})",
                    slot.display_name(), self.name, begin
                )));
            }
        } else if begin >= self.size {
            return Err(Error::TypeNotWellDefined(format!(
                "Member {} in struct {} is outside struct (this+{}/{})",
                slot.display_name(), self.name, begin, self.size
            )));
        }

        self.slots.push(slot);
        Ok(())
    }

    /// Replace the whole slot list, re-validating each entry.
    pub fn set_slots(&mut self, slots: Vec<Slot>) -> Result<(), Error> {
        self.slots.clear();
        for slot in slots {
            self.push_slot(slot)?;
        }
        Ok(())
    }
}

/// Arena owning every [`Type`]. The DIE-offset map is a `BTreeMap` so the
/// pipeline visits types in DIE-offset order.
#[derive(Debug, Default)]
pub struct TypeTable {
    types: Vec<Type>,
    by_offset: BTreeMap<usize, TypeId>,
}

impl TypeTable {
    pub fn new() -> Self {
        TypeTable::default()
    }

    /// Add a node without associating it with a DIE offset (array sites,
    /// placeholders for unresolvable references).
    pub fn insert(&mut self, ty: Type) -> TypeId {
        let id = TypeId(self.types.len());
        self.types.push(ty);
        id
    }

    /// Add a node and cache it under a DIE offset so later references
    /// resolve to the same canonical entry.
    pub fn insert_at(&mut self, offset: usize, ty: Type) -> TypeId {
        let id = self.insert(ty);
        self.by_offset.insert(offset, id);
        id
    }

    pub fn lookup(&self, offset: usize) -> Option<TypeId> {
        self.by_offset.get(&offset).copied()
    }

    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id.0]
    }

    pub fn get_mut(&mut self, id: TypeId) -> &mut Type {
        &mut self.types[id.0]
    }

    /// Cached types in DIE-offset order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, TypeId)> + '_ {
        self.by_offset.iter().map(|(offset, id)| (*offset, *id))
    }

    /// Structs in DIE-offset order.
    pub fn structs(&self) -> impl Iterator<Item = (usize, TypeId)> + '_ {
        self.iter()
            .filter(|(_, id)| matches!(self.get(*id), Type::Struct(_)))
    }

    pub fn struct_ref(&self, id: TypeId) -> Option<&StructType> {
        match self.get(id) {
            Type::Struct(st) => Some(st),
            _ => None,
        }
    }

    pub fn struct_mut(&mut self, id: TypeId) -> Option<&mut StructType> {
        match self.get_mut(id) {
            Type::Struct(st) => Some(st),
            _ => None,
        }
    }

    /// Undecorated name, looking through wrappers and qualifiers.
    pub fn name_of(&self, id: TypeId) -> &str {
        match self.get(id) {
            Type::Unknown { .. } => "Unknown",
            Type::Declaration { name, .. } => name,
            Type::Base { name, .. } => name,
            Type::Enum { name, .. } => name,
            Type::Union { name, .. } => name,
            Type::Pointer { pointee, .. } => self.name_of(*pointee),
            Type::Reference { pointee, .. } => self.name_of(*pointee),
            Type::Const { inner } => self.name_of(*inner),
            Type::Volatile { inner } => self.name_of(*inner),
            Type::Array { element, .. } => self.name_of(*element),
            Type::Struct(st) => st.name(),
        }
    }

    pub fn size_of(&self, id: TypeId) -> Option<u64> {
        match self.get(id) {
            Type::Unknown { size, .. } => *size,
            Type::Declaration { size, .. } => *size,
            Type::Base { size, .. } => Some(*size),
            Type::Enum { size, .. } => Some(*size),
            Type::Union { size, .. } => Some(*size),
            Type::Pointer { size, .. } => Some(*size),
            Type::Reference { size, .. } => Some(*size),
            Type::Const { inner } => self.size_of(*inner),
            Type::Volatile { inner } => self.size_of(*inner),
            Type::Array { size, .. } => *size,
            Type::Struct(st) => Some(st.size()),
        }
    }

    /// Set an inferred size. Only the placeholder variants accept one;
    /// qualifiers forward to the type they wrap.
    pub fn set_size(&mut self, id: TypeId, size: u64) -> Result<(), Error> {
        validate_size(size)?;
        match self.get_mut(id) {
            Type::Unknown { size: slot, .. } => {
                *slot = Some(size);
                Ok(())
            }
            Type::Declaration { size: slot, .. } => {
                *slot = Some(size);
                Ok(())
            }
            Type::Array { size: slot, .. } => {
                *slot = Some(size);
                Ok(())
            }
            Type::Const { inner } => {
                let inner = *inner;
                self.set_size(inner, size)
            }
            Type::Volatile { inner } => {
                let inner = *inner;
                self.set_size(inner, size)
            }
            Type::Pointer { .. } => Err(Error::TypeNotWellDefined(
                "set_size is not allowed for Pointer".to_string(),
            )),
            Type::Reference { .. } => Err(Error::TypeNotWellDefined(
                "set_size is not allowed for Reference".to_string(),
            )),
            _ => Err(Error::TypeNotWellDefined(
                "size is already fixed".to_string(),
            )),
        }
    }

    pub fn alignment_of(&self, id: TypeId) -> Option<u64> {
        match self.get(id) {
            Type::Unknown { .. } => Some(1),
            Type::Declaration { alignment, .. } => *alignment,
            Type::Base { alignment, .. } => *alignment,
            Type::Enum { alignment, .. } => *alignment,
            Type::Union { alignment, .. } => *alignment,
            Type::Pointer { alignment, .. } => *alignment,
            Type::Reference { alignment, .. } => *alignment,
            Type::Const { inner } => self.alignment_of(*inner),
            Type::Volatile { inner } => self.alignment_of(*inner),
            Type::Array { element, .. } => self.alignment_of(*element),
            Type::Struct(st) => st.alignment(),
        }
    }

    /// Lower a type's alignment toward the tightest consistent value.
    ///
    /// Unknown is pinned at 1 and Array inherits from its element, so both
    /// ignore the request; qualifiers forward to what they wrap.
    pub fn try_set_alignment(&mut self, id: TypeId, alignment: u64)
    -> Result<(), Error> {
        if let Some(current) = self.alignment_of(id) {
            if current <= alignment {
                return Ok(());
            }
        }

        let size = self.size_of(id).ok_or_else(|| {
            Error::TypeNotWellDefined(
                "Size can not be None for alignment validation".to_string(),
            )
        })?;

        match self.get_mut(id) {
            Type::Unknown { .. } | Type::Array { .. } => Ok(()),
            Type::Const { inner } => {
                let inner = *inner;
                self.try_set_alignment(inner, alignment)
            }
            Type::Volatile { inner } => {
                let inner = *inner;
                self.try_set_alignment(inner, alignment)
            }
            Type::Struct(st) => st.try_set_alignment(alignment),
            Type::Declaration { alignment: slot, .. }
            | Type::Base { alignment: slot, .. }
            | Type::Enum { alignment: slot, .. }
            | Type::Union { alignment: slot, .. }
            | Type::Pointer { alignment: slot, .. }
            | Type::Reference { alignment: slot, .. } => {
                validate_alignment(alignment, size)?;
                *slot = Some(alignment);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualifier_forwards_size_and_alignment() {
        let mut table = TypeTable::new();
        let base = table.insert(Type::Base {
            name: "int".to_string(),
            size: 4,
            alignment: None,
        });
        let constant = table.insert(Type::Const { inner: base });

        assert_eq!(table.size_of(constant), Some(4));
        table.try_set_alignment(constant, 4).unwrap();
        assert_eq!(table.alignment_of(base), Some(4));
        assert_eq!(table.alignment_of(constant), Some(4));
    }

    #[test]
    fn alignment_only_decreases() {
        let mut table = TypeTable::new();
        let base = table.insert(Type::Base {
            name: "long".to_string(),
            size: 8,
            alignment: None,
        });
        table.try_set_alignment(base, 8).unwrap();
        table.try_set_alignment(base, 4).unwrap();
        assert_eq!(table.alignment_of(base), Some(4));
        // raising is silently ignored
        table.try_set_alignment(base, 8).unwrap();
        assert_eq!(table.alignment_of(base), Some(4));
    }

    #[test]
    fn fixed_sizes_are_immutable() {
        let mut table = TypeTable::new();
        let base = table.insert(Type::Base {
            name: "int".to_string(),
            size: 4,
            alignment: None,
        });
        assert!(table.set_size(base, 8).is_err());

        let unknown = table.insert(Type::Unknown {
            reason: "type_id is None".to_string(),
            size: None,
        });
        table.set_size(unknown, 2).unwrap();
        assert_eq!(table.size_of(unknown), Some(2));
    }

    #[test]
    fn struct_slot_validation() {
        let mut table = TypeTable::new();
        let base = table.insert(Type::Base {
            name: "int".to_string(),
            size: 4,
            alignment: None,
        });

        let mut st = StructType::new("S", 8);
        assert!(st.valid());

        // first slot must be at offset 0
        let bad = st.push_slot(Slot::Member(MemberSlot {
            name: "a".to_string(),
            file_id: -1,
            line_no: -1,
            type_id: base,
            offset: 4,
        }));
        assert!(bad.is_err());

        st.push_slot(Slot::Member(MemberSlot {
            name: "a".to_string(),
            file_id: -1,
            line_no: -1,
            type_id: base,
            offset: 0,
        })).unwrap();

        // slots may not start past the struct's end
        let bad = st.push_slot(Slot::Member(MemberSlot {
            name: "b".to_string(),
            file_id: -1,
            line_no: -1,
            type_id: base,
            offset: 8,
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn zero_sized_struct_starts_invalid() {
        let st = StructType::new("empty", 0);
        assert!(!st.valid());
    }
}

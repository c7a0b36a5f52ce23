//! Reconstruction of the abstract type model from a DIE index.
//!
//! Every resolved type is cached in the [`TypeTable`] under its DIE offset,
//! with two deliberate exceptions: transparent wrappers (typedef, member,
//! inheritance) resolve to the type they reference so the referenced entry
//! stays canonical, and array sites are always distinct because DWARF does
//! not give us their element counts here.

use crate::die::{Die, DieIndex, DieTag};
use crate::types::{validate_name, validate_size};
use crate::types::{MemberSlot, Slot, StructType, Type, TypeId, TypeTable};
use crate::Error;

/// Convert every struct/class DIE in the index, in offset order.
///
/// Per-struct failures mark the struct invalid and are reported on stderr
/// when `warnings` is set; they never abort the walk.
pub fn reconstruct_types(index: &DieIndex, warnings: bool) -> TypeTable {
    let mut reconstructor = TypeReconstructor::new(index, warnings);
    reconstructor.run();
    reconstructor.table
}

struct TypeReconstructor<'a> {
    index: &'a DieIndex,
    table: TypeTable,
    word_size: u64,
    warnings: bool,
}

impl<'a> TypeReconstructor<'a> {
    fn new(index: &'a DieIndex, warnings: bool) -> Self {
        TypeReconstructor {
            index,
            table: TypeTable::new(),
            word_size: index.word_size(),
            warnings,
        }
    }

    fn run(&mut self) {
        let struct_offsets: Vec<usize> = self.index.iter()
            .filter(|die| die.tag.is_struct())
            .map(|die| die.offset)
            .collect();

        for offset in struct_offsets {
            if let Some(die) = self.index.get(offset) {
                self.convert_struct(die);
            }
        }
    }

    /// Get-or-create the type for a DIE.
    fn resolve(&mut self, die: &Die) -> Result<TypeId, Error> {
        if let Some(id) = self.table.lookup(die.offset) {
            return Ok(id);
        }
        self.resolve_impl(die)
    }

    fn resolve_impl(&mut self, die: &Die) -> Result<TypeId, Error> {
        if die.tag.is_struct() {
            return Ok(self.convert_struct(die));
        }

        match die.tag {
            DieTag::BaseType
            | DieTag::UnionType
            | DieTag::EnumerationType => self.convert_sized_leaf(die),

            // transparent wrappers: hand back the referenced type itself
            DieTag::Member
            | DieTag::Inheritance
            | DieTag::Typedef => self.resolve_type_ref(die),

            DieTag::ArrayType => {
                let element = self.resolve_type_ref(die)?;
                Ok(self.table.insert(Type::Array { element, size: None }))
            }

            DieTag::PointerType => {
                let pointee = self.resolve_type_ref(die)?;
                Ok(self.table.insert_at(die.offset, Type::Pointer {
                    pointee,
                    size: self.word_size,
                    alignment: None,
                }))
            }
            DieTag::ReferenceType => {
                let pointee = self.resolve_type_ref(die)?;
                Ok(self.table.insert_at(die.offset, Type::Reference {
                    pointee,
                    size: self.word_size,
                    alignment: None,
                }))
            }

            DieTag::ConstType => {
                let inner = self.resolve_type_ref(die)?;
                Ok(self.table.insert_at(die.offset, Type::Const { inner }))
            }
            DieTag::VolatileType => {
                let inner = self.resolve_type_ref(die)?;
                Ok(self.table.insert_at(die.offset, Type::Volatile { inner }))
            }

            _ => Ok(self.table.insert(Type::Unknown {
                reason: "wrong tag".to_string(),
                size: None,
            })),
        }
    }

    fn convert_sized_leaf(&mut self, die: &Die) -> Result<TypeId, Error> {
        let name = self.index.name_of(die);
        validate_name(&name)?;

        let size = die.byte_size.ok_or_else(|| {
            Error::TypeNotWellDefined(format!("Size can not be None ({name})"))
        })?;
        validate_size(size)?;

        let ty = match die.tag {
            DieTag::BaseType => Type::Base { name, size, alignment: None },
            DieTag::UnionType => Type::Union { name, size, alignment: None },
            _ => Type::Enum { name, size, alignment: None },
        };
        Ok(self.table.insert_at(die.offset, ty))
    }

    /// Resolve the type a DIE refers to through `DW_AT_type`. A missing or
    /// dangling reference is represented, not reported: layout inference
    /// may still recover the size later.
    fn resolve_type_ref(&mut self, die: &Die) -> Result<TypeId, Error> {
        let target_offset = match self.index.type_ref_of(die) {
            Some(offset) => offset,
            None => {
                return Ok(self.table.insert(Type::Unknown {
                    reason: "type_id is None".to_string(),
                    size: None,
                }));
            }
        };

        match self.index.get(target_offset) {
            Some(target) => self.resolve(target),
            None => Ok(self.table.insert(Type::Unknown {
                reason: "dangling type reference".to_string(),
                size: None,
            })),
        }
    }

    /// Convert a struct/class DIE. Infallible by design: a malformed struct
    /// is cached invalid so every reference to it still resolves.
    fn convert_struct(&mut self, die: &Die) -> TypeId {
        if let Some(id) = self.table.lookup(die.offset) {
            return id;
        }

        let name = self.index.name_of(die);

        // forward declarations and bodyless structs become placeholders
        let size = match die.byte_size {
            Some(size) if !die.declaration => size,
            _ => {
                return self.table.insert_at(die.offset, Type::Declaration {
                    name,
                    size: None,
                    alignment: None,
                });
            }
        };

        // cache the struct before recursing into children, otherwise
        // self-referential types recurse forever
        let id = self.table
            .insert_at(die.offset, Type::Struct(StructType::new(name, size)));

        for child_offset in &die.children {
            let child = match self.index.get(*child_offset) {
                Some(child) => child,
                None => continue,
            };

            let result = match child.tag {
                DieTag::Inheritance => {
                    self.convert_inheritance(child)
                        .and_then(|slot| self.push_slot(id, slot))
                }
                // static members occupy no storage in the aggregate
                DieTag::Member if !child.external => {
                    self.convert_member(child)
                        .and_then(|slot| self.push_slot(id, slot))
                }
                tag if tag.is_struct() => {
                    // nested aggregates live at the table's top level and
                    // are not slots of the enclosing struct
                    self.convert_struct(child);
                    Ok(())
                }
                _ => Ok(()),
            };

            if let Err(err) = result {
                if self.warnings {
                    eprintln!("Warning: {err}");
                }
                if let Some(st) = self.table.struct_mut(id) {
                    st.invalidate();
                }
                break;
            }
        }

        id
    }

    fn convert_member(&mut self, die: &Die) -> Result<Slot, Error> {
        let name = self.index.name_of(die);
        let file_id = die.decl_file.unwrap_or(-1);
        let line_no = die.decl_line.unwrap_or(-1);
        let type_id = self.resolve_type_ref(die)?;

        let offset = die.member_location.as_ref().ok_or_else(|| {
            Error::TypeNotWellDefined(format!(
                "Member {name} has no data member location"
            ))
        })?.byte_offset();

        Ok(Slot::Member(MemberSlot { name, file_id, line_no, type_id, offset }))
    }

    fn convert_inheritance(&mut self, die: &Die) -> Result<Slot, Error> {
        let base = self.resolve_type_ref(die)?;

        let offset = die.member_location.as_ref().ok_or_else(|| {
            Error::TypeNotWellDefined(
                "Inheritance has no data member location".to_string(),
            )
        })?.byte_offset();

        Ok(Slot::Inheritance { base, offset })
    }

    fn push_slot(&mut self, id: TypeId, slot: Slot) -> Result<(), Error> {
        match self.table.struct_mut(id) {
            Some(st) => st.push_slot(slot),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::die::MemberLocation;

    fn member_die(offset: usize, name: &str, type_ref: usize, at: u64)
    -> Die {
        let mut die = Die::new(offset, DieTag::Member);
        die.name = Some(name.to_string());
        die.type_ref = Some(type_ref);
        die.member_location = Some(MemberLocation::Offset(at));
        die
    }

    #[test]
    fn self_referential_struct_resolves() {
        let mut index = DieIndex::new(8);

        let mut node = Die::new(0x10, DieTag::StructureType);
        node.name = Some("node".to_string());
        node.byte_size = Some(16);
        node.children = vec![0x20, 0x30];
        index.insert(node);

        index.insert(member_die(0x20, "value", 0x50, 0));
        index.insert(member_die(0x30, "next", 0x40, 8));

        let mut ptr = Die::new(0x40, DieTag::PointerType);
        ptr.type_ref = Some(0x10);
        index.insert(ptr);

        let mut base = Die::new(0x50, DieTag::BaseType);
        base.name = Some("long".to_string());
        base.byte_size = Some(8);
        index.insert(base);

        let table = reconstruct_types(&index, false);
        let id = table.lookup(0x10).expect("struct cached");
        let st = table.struct_ref(id).expect("is a struct");
        assert!(st.valid());
        assert_eq!(st.slots().len(), 2);

        // the pointer member resolves back to the cached struct
        let next_type = st.slots()[1].type_id().unwrap();
        match table.get(next_type) {
            Type::Pointer { pointee, size, .. } => {
                assert_eq!(*size, 8);
                assert_eq!(*pointee, id);
            }
            other => panic!("expected pointer, got {other:?}"),
        }
    }

    #[test]
    fn declaration_becomes_placeholder() {
        let mut index = DieIndex::new(8);

        let mut decl = Die::new(0x10, DieTag::ClassType);
        decl.name = Some("fwd".to_string());
        decl.declaration = true;
        index.insert(decl);

        let table = reconstruct_types(&index, false);
        let id = table.lookup(0x10).expect("placeholder cached");
        assert!(matches!(table.get(id), Type::Declaration { .. }));
    }

    #[test]
    fn static_members_are_skipped() {
        let mut index = DieIndex::new(8);

        let mut st = Die::new(0x10, DieTag::StructureType);
        st.name = Some("has_static".to_string());
        st.byte_size = Some(4);
        st.children = vec![0x20, 0x30];
        index.insert(st);

        let mut stat = member_die(0x20, "instance_count", 0x50, 0);
        stat.external = true;
        stat.member_location = None;
        index.insert(stat);

        index.insert(member_die(0x30, "value", 0x50, 0));

        let mut base = Die::new(0x50, DieTag::BaseType);
        base.name = Some("int".to_string());
        base.byte_size = Some(4);
        index.insert(base);

        let table = reconstruct_types(&index, false);
        let id = table.lookup(0x10).unwrap();
        let st = table.struct_ref(id).unwrap();
        assert!(st.valid());
        assert_eq!(st.slots().len(), 1);
        assert_eq!(st.slots()[0].display_name(), "value");
    }

    #[test]
    fn member_offset_out_of_range_invalidates() {
        let mut index = DieIndex::new(8);

        let mut st = Die::new(0x10, DieTag::StructureType);
        st.name = Some("broken".to_string());
        st.byte_size = Some(4);
        st.children = vec![0x20, 0x30];
        index.insert(st);

        index.insert(member_die(0x20, "a", 0x50, 0));
        index.insert(member_die(0x30, "b", 0x50, 4));

        let mut base = Die::new(0x50, DieTag::BaseType);
        base.name = Some("int".to_string());
        base.byte_size = Some(4);
        index.insert(base);

        let table = reconstruct_types(&index, false);
        let id = table.lookup(0x10).unwrap();
        let st = table.struct_ref(id).unwrap();
        assert!(!st.valid());
    }
}

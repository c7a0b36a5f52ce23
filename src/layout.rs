//! Layout inference over reconstructed structs.
//!
//! DWARF tells us where members sit but not always how big their types are;
//! the fixer recovers sizes from neighboring offsets and derives the
//! tightest alignments consistent with the observed layout. The padding
//! detector then makes every hole explicit as a [`Slot::Padding`].

use crate::types::{Slot, StructType, Type, TypeId, TypeTable};
use crate::Error;

pub fn is_aligned(offset: u64, alignment: u64) -> bool {
    offset % alignment == 0
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) / alignment * alignment
}

pub fn align_down(value: u64, alignment: u64) -> u64 {
    value / alignment * alignment
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// The largest `a ∈ {8,4,2,1}` a member's placement is consistent with:
/// `a` must divide both the member's offset and its type's size, and may
/// not exceed the size.
pub fn alignment_from_position_and_size(offset: u64, type_size: u64) -> u64 {
    for alignment in [8, 4, 2, 1] {
        if alignment > type_size {
            continue;
        }
        if offset % alignment != 0 {
            continue;
        }
        if type_size % alignment != 0 {
            continue;
        }
        return alignment;
    }
    1
}

/// Infer member-type sizes and alignments for one struct, then derive the
/// struct's own alignment.
///
/// A member whose effective extent is ≤ 0 is an empty base the compiler
/// optimized away; it is replaced with [`Slot::EboInheritance`]. Any
/// validation failure marks the struct invalid and is returned for optional
/// warning output; it never aborts the run.
pub fn fix_struct_layout(table: &mut TypeTable, id: TypeId)
-> Result<(), Error> {
    let result = fix_struct_layout_impl(table, id);
    if result.is_err() {
        if let Some(st) = table.struct_mut(id) {
            st.invalidate();
        }
    }
    result
}

fn fix_struct_layout_impl(table: &mut TypeTable, id: TypeId)
-> Result<(), Error> {
    let (struct_size, slots): (u64, Vec<(u64, Option<TypeId>)>) =
        match table.struct_ref(id) {
            Some(st) if st.valid() => (
                st.size(),
                st.slots().iter()
                    .map(|slot| (slot.offset(), slot.type_id()))
                    .collect(),
            ),
            _ => return Ok(()),
        };

    if slots.is_empty() {
        let alignment = struct_size.min(8);
        if let Some(st) = table.struct_mut(id) {
            st.try_set_alignment(alignment)?;
        }
        return Ok(());
    }

    let mut ebo_indices: Vec<usize> = Vec::new();

    for i in 0..slots.len() {
        let (offset, type_id) = slots[i];
        let next_offset = if i + 1 < slots.len() {
            slots[i + 1].0
        } else {
            struct_size
        };
        let effective = next_offset as i64 - offset as i64;

        if effective <= 0 {
            ebo_indices.push(i);
        }
        if let Some(type_id) = type_id {
            fix_slot_type(table, type_id, offset, effective)?;
        }
    }

    if !ebo_indices.is_empty() {
        if let Some(st) = table.struct_mut(id) {
            for &i in &ebo_indices {
                let slot = &mut st.slots_mut()[i];
                if let Some(base) = slot.type_id() {
                    let offset = slot.offset();
                    *slot = Slot::EboInheritance { base, offset };
                }
            }
        }
    }

    let mut max_alignment: u64 = 1;
    for (_, type_id) in &slots {
        if let Some(type_id) = type_id {
            if let Some(alignment) = table.alignment_of(*type_id) {
                max_alignment = max_alignment.max(alignment);
            }
        }
    }

    let alignment = gcd(max_alignment, struct_size);
    if let Some(st) = table.struct_mut(id) {
        st.try_set_alignment(alignment)?;
    }
    Ok(())
}

// One member: recover a missing type size from the effective extent, then
// tighten the type's alignment toward what the placement allows.
fn fix_slot_type(table: &mut TypeTable, type_id: TypeId, offset: u64,
                 effective: i64)
-> Result<(), Error> {
    if table.size_of(type_id).is_none() {
        if effective <= 0 {
            return Err(Error::TypeNotWellDefined(format!(
                "can not infer a size of {effective} bytes"
            )));
        }
        table.set_size(type_id, effective as u64)?;
    }

    let type_size = match table.size_of(type_id) {
        Some(size) => size,
        None => return Ok(()),
    };
    let alignment = alignment_from_position_and_size(offset, type_size);
    table.try_set_alignment(type_id, alignment)
}

/// Rebuild a struct's slot list with every gap made explicit as padding:
/// between consecutive members and between the last member and the
/// struct's end. Overlapping members are a negative gap, which invalidates
/// the struct.
pub fn insert_padding(table: &mut TypeTable, id: TypeId) -> Result<(), Error> {
    let result = insert_padding_impl(table, id);
    if result.is_err() {
        if let Some(st) = table.struct_mut(id) {
            st.invalidate();
        }
    }
    result
}

fn insert_padding_impl(table: &mut TypeTable, id: TypeId)
-> Result<(), Error> {
    let (struct_size, name, slots): (u64, String, Vec<Slot>) =
        match table.struct_ref(id) {
            Some(st) if st.valid() => (
                st.size(),
                st.name().to_string(),
                st.slots().to_vec(),
            ),
            _ => return Ok(()),
        };

    if slots.is_empty() {
        return Ok(());
    }

    let mut interleaved: Vec<Slot> = Vec::new();

    for i in 0..slots.len() {
        let current = &slots[i];
        let size = current.size(table).ok_or_else(|| {
            Error::TypeNotWellDefined(format!(
                "Member {} in type {} has no size",
                current.display_name(), name
            ))
        })?;
        let end = current.offset() + size;

        let next_offset = if i + 1 < slots.len() {
            slots[i + 1].offset()
        } else {
            struct_size
        };
        let gap = next_offset as i64 - end as i64;

        if gap < 0 {
            return Err(Error::TypeNotWellDefined(format!(
                "Padding size < 0 in type {name}"
            )));
        }

        interleaved.push(current.clone());
        if gap > 0 {
            interleaved.push(Slot::Padding { size: gap as u64, offset: end });
        }
    }

    match table.struct_mut(id) {
        Some(st) => st.set_slots(interleaved),
        None => Ok(()),
    }
}

/// Bytes lost to padding across the whole struct.
pub fn total_padding(st: &StructType) -> u64 {
    st.slots().iter()
        .filter_map(|slot| match slot {
            Slot::Padding { size, .. } => Some(*size),
            _ => None,
        })
        .sum()
}

pub fn is_template(name: &str) -> bool {
    name.contains('<')
}

pub fn is_stl_internal(name: &str) -> bool {
    name.starts_with('_')
}

/// Virtual-table pointers are pinned: the repacker never relocates them.
pub fn is_vptr(name: &str) -> bool {
    name.starts_with("_vptr.")
}

/// A template instance is dependent when a member's type could change with
/// the template parameters. Pointers, references and enums have a fixed
/// layout regardless; qualifiers and arrays delegate to what they wrap.
pub fn is_template_param_dependent(table: &TypeTable, st: &StructType)
-> bool {
    st.slots().iter().any(|slot| match slot.type_id() {
        Some(type_id) => type_is_dependent(table, type_id),
        None => false,
    })
}

fn type_is_dependent(table: &TypeTable, id: TypeId) -> bool {
    match table.get(id) {
        Type::Unknown { .. }
        | Type::Declaration { .. }
        | Type::Base { .. }
        | Type::Union { .. }
        | Type::Struct(_) => true,

        Type::Pointer { .. }
        | Type::Reference { .. }
        | Type::Enum { .. } => false,

        Type::Const { inner } | Type::Volatile { inner } => {
            type_is_dependent(table, *inner)
        }
        Type::Array { element, .. } => type_is_dependent(table, *element),
    }
}

/// Structs the repacker leaves alone: STL internals, and template
/// instances whose layout depends on their parameters.
pub fn should_skip_repacking(table: &TypeTable, st: &StructType) -> bool {
    if is_stl_internal(st.name()) {
        return true;
    }
    if is_template(st.name()) && is_template_param_dependent(table, st) {
        return true;
    }
    false
}

/// Every size needed to lay the type out is known and positive.
pub fn is_type_well_defined(table: &TypeTable, id: TypeId) -> bool {
    match table.get(id) {
        Type::Unknown { size, .. } => matches!(size, Some(s) if *s > 0),
        Type::Declaration { size, .. } => matches!(size, Some(s) if *s > 0),

        Type::Base { .. }
        | Type::Enum { .. }
        | Type::Union { .. }
        | Type::Pointer { .. }
        | Type::Reference { .. } => true,

        Type::Const { inner } | Type::Volatile { inner } => {
            is_type_well_defined(table, *inner)
        }
        Type::Array { element, .. } => is_type_well_defined(table, *element),

        Type::Struct(st) => {
            if st.size() == 0 || st.alignment().is_none() {
                return false;
            }
            st.slots().iter().all(|slot| match slot.type_id() {
                Some(type_id) => is_type_well_defined(table, type_id),
                None => true,
            })
        }
    }
}

/// No Unknown or Declaration remains anywhere in the type's slot graph.
pub fn is_type_completely_defined(table: &TypeTable, id: TypeId) -> bool {
    match table.get(id) {
        Type::Unknown { .. } | Type::Declaration { .. } => false,

        Type::Base { .. }
        | Type::Enum { .. }
        | Type::Union { .. }
        | Type::Pointer { .. }
        | Type::Reference { .. } => true,

        Type::Const { inner } | Type::Volatile { inner } => {
            is_type_completely_defined(table, *inner)
        }
        Type::Array { element, .. } => {
            is_type_completely_defined(table, *element)
        }

        Type::Struct(st) => {
            st.slots().iter().all(|slot| match slot.type_id() {
                Some(type_id) => is_type_completely_defined(table, type_id),
                None => true,
            })
        }
    }
}

//! Member repacking.
//!
//! The packer replays a struct's slots through a doubly-linked node list
//! with a pairwise transition on (kind of the current tail, kind of the
//! incoming node). Data members try to sink into padding holes opened
//! earlier in the list; padding coalesces and is trimmed modulo the
//! struct's alignment at the end. The list is an index arena: splicing a
//! hole into up-to-three pieces is pointer surgery on `prev`/`next` slots,
//! and erased entries simply go unreferenced.

use crate::layout::{align_up, is_aligned, is_vptr, total_padding};
use crate::types::{validate_alignment, validate_offset};
use crate::types::{MemberSlot, Slot, StructType, TypeId, TypeTable};
use crate::Error;

#[derive(Clone, Debug)]
enum Node {
    Head,
    Inheritance { base: TypeId, offset: u64 },
    EboInheritance { base: TypeId, offset: u64 },
    Member { name: String, type_id: TypeId, offset: u64 },
    Padding { size: u64, offset: u64 },
}

/// Discriminant used by the transition dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Head,
    Inheritance,
    Ebo,
    Member,
    Padding,
}

impl Node {
    fn kind(&self) -> Kind {
        match self {
            Node::Head => Kind::Head,
            Node::Inheritance { .. } => Kind::Inheritance,
            Node::EboInheritance { .. } => Kind::Ebo,
            Node::Member { .. } => Kind::Member,
            Node::Padding { .. } => Kind::Padding,
        }
    }

    fn offset(&self) -> u64 {
        match self {
            Node::Head => 0,
            Node::Inheritance { offset, .. } => *offset,
            Node::EboInheritance { offset, .. } => *offset,
            Node::Member { offset, .. } => *offset,
            Node::Padding { offset, .. } => *offset,
        }
    }

    fn set_offset(&mut self, new_offset: u64) {
        match self {
            Node::Head => {}
            Node::Inheritance { offset, .. } => *offset = new_offset,
            Node::EboInheritance { offset, .. } => *offset = new_offset,
            Node::Member { offset, .. } => *offset = new_offset,
            Node::Padding { offset, .. } => *offset = new_offset,
        }
    }

    /// Occupied bytes. An inheritance node without a positive base size
    /// should have been turned into EboInheritance by the layout fixer;
    /// seeing one here is an empty-base anomaly.
    fn size(&self, table: &TypeTable) -> Result<u64, Error> {
        match self {
            Node::Head | Node::EboInheritance { .. } => Ok(0),
            Node::Inheritance { base, .. } => match table.size_of(*base) {
                Some(size) if size > 0 => Ok(size),
                _ => Err(Error::Ebo(format!(
                    "base {} has no occupied bytes", table.name_of(*base)
                ))),
            },
            Node::Member { name, type_id, .. } => {
                table.size_of(*type_id).ok_or_else(|| {
                    Error::TypeNotWellDefined(format!(
                        "member {name} has no size"
                    ))
                })
            }
            Node::Padding { size, .. } => Ok(*size),
        }
    }

    fn end(&self, table: &TypeTable) -> Result<u64, Error> {
        Ok(self.offset() + self.size(table)?)
    }

    fn alignment(&self, table: &TypeTable) -> Result<u64, Error> {
        match self {
            Node::Head
            | Node::EboInheritance { .. }
            | Node::Padding { .. } => Ok(1),
            Node::Inheritance { base, .. } => {
                table.alignment_of(*base).ok_or_else(|| {
                    Error::TypeNotWellDefined(format!(
                        "base {} has no alignment", table.name_of(*base)
                    ))
                })
            }
            Node::Member { name, type_id, .. } => {
                table.alignment_of(*type_id).ok_or_else(|| {
                    Error::TypeNotWellDefined(format!(
                        "member {name} has no alignment"
                    ))
                })
            }
        }
    }
}

struct NodeEntry {
    node: Node,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly-linked list over a `Vec` arena. Indices are stable; unlinked
/// entries stay allocated but unreachable.
struct NodeList {
    entries: Vec<NodeEntry>,
    head: usize,
    tail: usize,
}

impl NodeList {
    fn new() -> Self {
        let head = NodeEntry { node: Node::Head, prev: None, next: None };
        NodeList { entries: vec![head], head: 0, tail: 0 }
    }

    fn back(&self) -> &Node {
        &self.entries[self.tail].node
    }

    fn node(&self, at: usize) -> &Node {
        &self.entries[at].node
    }

    fn node_mut(&mut self, at: usize) -> &mut Node {
        &mut self.entries[at].node
    }

    fn append(&mut self, node: Node) -> usize {
        let at = self.entries.len();
        self.entries.push(NodeEntry {
            node,
            prev: Some(self.tail),
            next: None,
        });
        self.entries[self.tail].next = Some(at);
        self.tail = at;
        at
    }

    fn pop_back(&mut self) {
        if let Some(prev) = self.entries[self.tail].prev {
            self.entries[prev].next = None;
            self.tail = prev;
        }
    }

    fn erase(&mut self, at: usize) {
        if at == self.tail {
            self.pop_back();
            return;
        }
        let prev = self.entries[at].prev;
        let next = self.entries[at].next;
        if let Some(prev) = prev {
            self.entries[prev].next = next;
        }
        if let Some(next) = next {
            self.entries[next].prev = prev;
        }
    }

    fn insert_after(&mut self, pos: usize, node: Node) -> usize {
        if pos == self.tail {
            return self.append(node);
        }
        let at = self.entries.len();
        let next = self.entries[pos].next;
        self.entries.push(NodeEntry { node, prev: Some(pos), next });
        if let Some(next) = next {
            self.entries[next].prev = Some(at);
        }
        self.entries[pos].next = Some(at);
        at
    }

    fn insert_before(&mut self, pos: usize, node: Node) -> usize {
        match self.entries[pos].prev {
            Some(prev) => self.insert_after(prev, node),
            // pos is the head sentinel; nothing sits before it
            None => self.insert_after(pos, node),
        }
    }

    /// Live indices from front to back, excluding the head sentinel.
    fn indices(&self) -> Vec<usize> {
        let mut result = Vec::new();
        let mut cursor = self.entries[self.head].next;
        while let Some(at) = cursor {
            result.push(at);
            cursor = self.entries[at].next;
        }
        result
    }
}

/// Repack one struct.
///
/// Returns `Ok(None)` when the struct is skipped (invalid, too little
/// padding to save an alignment unit) or when repacking found no smaller
/// layout. The produced struct carries the original's alignment; the
/// original is left untouched.
pub fn repack_struct(table: &TypeTable, st: &StructType)
-> Result<Option<StructType>, Error> {
    if !st.valid() {
        return Ok(None);
    }
    let alignment = match st.alignment() {
        Some(alignment) => alignment,
        None => return Ok(None),
    };
    if total_padding(st) < alignment {
        return Ok(None);
    }

    let mut packer = Packer {
        table,
        list: NodeList::new(),
        alignment,
    };

    for slot in st.slots() {
        let node = packer.convert_slot(slot)?;
        packer.step(node)?;
    }
    packer.finish()?;

    let packed_size = packer.end()?;
    if packed_size == st.size() {
        return Ok(None);
    }
    if packed_size == 0 {
        return Err(Error::TypeNotWellDefined(format!(
            "packed {} to nothing", st.name()
        )));
    }

    let mut packed = StructType::new(st.name(), packed_size);
    packed.try_set_alignment(alignment)?;
    packed.set_slots(packer.into_slots())?;

    Ok(Some(packed))
}

struct Packer<'a> {
    table: &'a TypeTable,
    list: NodeList,
    /// The original struct's alignment; padding arithmetic is modulo this.
    alignment: u64,
}

impl<'a> Packer<'a> {
    fn convert_slot(&self, slot: &Slot) -> Result<Node, Error> {
        match slot {
            Slot::Inheritance { base, .. } => {
                Ok(Node::Inheritance { base: *base, offset: 0 })
            }
            Slot::EboInheritance { base, .. } => {
                Ok(Node::EboInheritance { base: *base, offset: 0 })
            }
            Slot::Member(member) => Ok(Node::Member {
                name: member.name.clone(),
                type_id: member.type_id,
                offset: 0,
            }),
            Slot::Padding { size, .. } => {
                Ok(Node::Padding { size: *size, offset: 0 })
            }
        }
    }

    fn end(&self) -> Result<u64, Error> {
        self.list.back().end(self.table)
    }

    /// One transition of the packing state machine.
    fn step(&mut self, incoming: Node) -> Result<(), Error> {
        match (self.list.back().kind(), incoming.kind()) {
            // the first node lands at offset zero whatever it is
            (Kind::Head, _) => self.place_and_append(incoming, 0),

            (Kind::Inheritance, Kind::Inheritance | Kind::Member)
            | (Kind::Ebo, Kind::Member | Kind::Padding) => {
                self.append_unaligned(incoming)
            }

            // padding realigns to wherever the layout currently ends
            (Kind::Inheritance | Kind::Member, Kind::Padding) => {
                let end = self.end()?;
                self.place_and_append(incoming, end)
            }

            // zero-size nodes append at the end without disturbing it
            (Kind::Ebo, Kind::Inheritance) | (_, Kind::Ebo) => {
                let end = self.end()?;
                self.place_and_append(incoming, end)
            }

            (Kind::Member, Kind::Member) => {
                self.place_member(incoming, false)
            }
            (Kind::Padding, Kind::Member) => {
                self.place_member(incoming, true)
            }

            (Kind::Padding, Kind::Padding) => {
                self.coalesce_padding(incoming)
            }

            (Kind::Member | Kind::Padding, Kind::Inheritance) => {
                Err(Error::TypeNotWellDefined(
                    "inheritance after data members".to_string(),
                ))
            }

            (_, Kind::Head) => Err(Error::TypeNotWellDefined(
                "head can not be an incoming node".to_string(),
            )),
        }
    }

    /// Trim or complete the trailing padding once every slot is consumed.
    fn finish(&mut self) -> Result<(), Error> {
        match self.list.back().kind() {
            Kind::Head => Ok(()),
            Kind::Inheritance | Kind::Ebo | Kind::Member => {
                let end = self.end()?;
                let aligned = align_up(end, self.alignment);
                if aligned > end {
                    self.list.append(Node::Padding {
                        size: aligned - end,
                        offset: end,
                    });
                }
                Ok(())
            }
            Kind::Padding => {
                let offset = self.list.back().offset();
                let aligned = align_up(offset, self.alignment);
                let new_size = (aligned - offset) % self.alignment;
                if new_size == 0 {
                    self.list.pop_back();
                } else {
                    self.set_padding(self.list.tail, new_size, offset)?;
                }
                Ok(())
            }
        }
    }

    fn place_and_append(&mut self, mut node: Node, offset: u64)
    -> Result<(), Error> {
        let alignment = node.alignment(self.table)?;
        validate_offset(offset, alignment)?;
        node.set_offset(offset);
        self.list.append(node);
        Ok(())
    }

    /// Append after the current end, synthesizing alignment padding first.
    /// The padding is dispatched like any other node so it coalesces with
    /// a trailing hole instead of stacking.
    fn append_unaligned(&mut self, mut node: Node) -> Result<(), Error> {
        let alignment = node.alignment(self.table)?;
        let end = self.end()?;
        let offset = align_up(end, alignment);
        node.set_offset(offset);

        if offset > end {
            self.step(Node::Padding { size: offset - end, offset: end })?;
        }
        self.list.append(node);
        Ok(())
    }

    /// An incoming data member: sink it into the first hole that can take
    /// it, otherwise append. Virtual-table pointers never move.
    fn place_member(&mut self, incoming: Node, tail_is_padding: bool)
    -> Result<(), Error> {
        let size = incoming.size(self.table)?;
        let alignment = incoming.alignment(self.table)?;
        validate_alignment(alignment, size)?;

        let pinned = matches!(
            &incoming,
            Node::Member { name, .. } if is_vptr(name)
        );

        if !pinned {
            if let Some(hole) = self.find_matching_padding(size, alignment) {
                return self.move_into_padding(hole, incoming, size, alignment);
            }
        }

        if tail_is_padding {
            self.shrink_trailing_padding(alignment)?;
        }
        self.append_unaligned(incoming)
    }

    /// First padding hole, front to back, that can take `size` bytes at
    /// `alignment` once its start is aligned up.
    fn find_matching_padding(&self, size: u64, alignment: u64)
    -> Option<usize> {
        for at in self.list.indices() {
            if let Node::Padding { size: hole_size, offset } =
                self.list.node(at)
            {
                if *hole_size < size {
                    continue;
                }
                let lead = align_up(*offset, alignment) - offset;
                if *hole_size >= lead + size {
                    return Some(at);
                }
            }
        }
        None
    }

    fn move_into_padding(&mut self, hole: usize, mut node: Node, size: u64,
                         alignment: u64)
    -> Result<(), Error> {
        let (hole_size, hole_offset) = match self.list.node(hole) {
            Node::Padding { size, offset } => (*size, *offset),
            _ => {
                return Err(Error::TypeNotWellDefined(
                    "matched hole is not padding".to_string(),
                ));
            }
        };

        // exact fit: the member takes the hole's place outright
        if hole_size == size {
            validate_offset(hole_offset, alignment)?;
            node.set_offset(hole_offset);
            self.list.insert_after(hole, node);
            self.list.erase(hole);
            return Ok(());
        }

        let new_offset = align_up(hole_offset, alignment);
        let front_gap = new_offset - hole_offset;
        let back_gap = (hole_offset + hole_size) - (new_offset + size);
        node.set_offset(new_offset);

        if front_gap > 0 && back_gap > 0 {
            self.set_padding(hole, front_gap, hole_offset)?;
            let member = self.list.insert_after(hole, node);
            self.list.insert_after(member, Node::Padding {
                size: back_gap,
                offset: new_offset + size,
            });
        } else if front_gap > 0 {
            self.set_padding(hole, front_gap, hole_offset)?;
            self.list.insert_after(hole, node);
        } else {
            // the member sits flush at the hole's start, the remainder
            // slides right; the moved padding must stay in the old extent
            let moved_offset = hole_offset + size;
            if moved_offset + back_gap > hole_offset + hole_size {
                return Err(Error::TypeNotWellDefined(
                    "padding moved outside its extent".to_string(),
                ));
            }
            self.set_padding(hole, back_gap, moved_offset)?;
            self.list.insert_before(hole, node);
        }
        Ok(())
    }

    /// The tail padding could not host the incoming member. Release the
    /// bytes the member's alignment makes unusable: drop the padding
    /// entirely when the member can sit at its start, otherwise keep only
    /// the remainder modulo the member's alignment.
    fn shrink_trailing_padding(&mut self, alignment: u64)
    -> Result<(), Error> {
        let (size, offset) = match self.list.back() {
            Node::Padding { size, offset } => (*size, *offset),
            _ => return Ok(()),
        };

        if is_aligned(offset, alignment) {
            self.list.pop_back();
        } else if size < alignment {
            // too small to matter, the append realigns past it
        } else {
            let remainder = size % alignment;
            if remainder == 0 {
                self.list.pop_back();
            } else {
                self.set_padding(self.list.tail, remainder, offset)?;
            }
        }
        Ok(())
    }

    fn coalesce_padding(&mut self, incoming: Node) -> Result<(), Error> {
        let incoming_size = incoming.size(self.table)?;
        let (size, offset) = match self.list.back() {
            Node::Padding { size, offset } => (*size, *offset),
            _ => return Ok(()),
        };

        let total = (size + incoming_size) % self.alignment;
        if total == 0 {
            self.list.pop_back();
        } else if total != size {
            self.set_padding(self.list.tail, total, offset)?;
        }
        Ok(())
    }

    fn set_padding(&mut self, at: usize, size: u64, offset: u64)
    -> Result<(), Error> {
        match self.list.node_mut(at) {
            Node::Padding { size: s, offset: o } => {
                *s = size;
                *o = offset;
                Ok(())
            }
            _ => Err(Error::TypeNotWellDefined(
                "node is not padding".to_string(),
            )),
        }
    }

    fn into_slots(self) -> Vec<Slot> {
        let mut slots = Vec::new();
        for at in self.list.indices() {
            let slot = match self.list.node(at) {
                Node::Head => continue,
                Node::Inheritance { base, offset } => {
                    Slot::Inheritance { base: *base, offset: *offset }
                }
                Node::EboInheritance { base, offset } => {
                    Slot::EboInheritance { base: *base, offset: *offset }
                }
                Node::Member { name, type_id, offset } => {
                    Slot::Member(MemberSlot {
                        name: name.clone(),
                        file_id: -1,
                        line_no: -1,
                        type_id: *type_id,
                        offset: *offset,
                    })
                }
                Node::Padding { size, offset } => {
                    Slot::Padding { size: *size, offset: *offset }
                }
            };
            slots.push(slot);
        }
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{fix_struct_layout, insert_padding};
    use crate::types::Type;

    fn base(table: &mut TypeTable, name: &str, size: u64) -> TypeId {
        table.insert(Type::Base {
            name: name.to_string(),
            size,
            alignment: None,
        })
    }

    fn member(name: &str, type_id: TypeId, offset: u64) -> Slot {
        Slot::Member(MemberSlot {
            name: name.to_string(),
            file_id: -1,
            line_no: -1,
            type_id,
            offset,
        })
    }

    // (offset, type) member tuples through the full fix/pad/repack chain
    fn packed(table: &mut TypeTable, name: &str, size: u64,
              members: &[(&str, TypeId, u64)])
    -> Option<StructType> {
        let mut st = StructType::new(name, size);
        for (member_name, type_id, offset) in members {
            st.push_slot(member(member_name, *type_id, *offset)).unwrap();
        }
        let id = table.insert_at(0x1000, Type::Struct(st));
        fix_struct_layout(table, id).unwrap();
        insert_padding(table, id).unwrap();
        let st = table.struct_ref(id).unwrap().clone();
        repack_struct(table, &st).unwrap()
    }

    #[test]
    fn too_little_padding_is_skipped() {
        // 7 bytes of padding but an 8-byte alignment unit: nothing to save
        let mut table = TypeTable::new();
        let tiny = base(&mut table, "char", 1);
        let wide = base(&mut table, "long", 8);

        let result = packed(&mut table, "no_room", 16,
                            &[("c", tiny, 0), ("l", wide, 8)]);
        assert!(result.is_none());
    }

    #[test]
    fn hole_takes_trailing_member() {
        let mut table = TypeTable::new();
        let tiny = base(&mut table, "char", 1);
        let medium = base(&mut table, "int", 4);

        let result = packed(&mut table, "shuffled", 12,
                            &[("a", tiny, 0), ("b", medium, 4), ("c", tiny, 8)])
            .expect("repacking should shrink this");

        assert_eq!(result.size(), 8);
        assert_eq!(result.alignment(), Some(4));

        let offsets: Vec<(String, u64)> = result.slots().iter()
            .map(|slot| (slot.display_name().to_string(), slot.offset()))
            .collect();
        assert_eq!(offsets, vec![
            ("a".to_string(), 0),
            ("c".to_string(), 1),
            ("".to_string(), 2),
            ("b".to_string(), 4),
        ]);
    }

    #[test]
    fn exact_fit_replaces_the_hole() {
        let mut table = TypeTable::new();
        let medium = base(&mut table, "int", 4);
        let wide = base(&mut table, "long", 8);

        // [int, 4 bytes hole, long] — the trailing int drops exactly in
        let result = packed(&mut table, "snug", 24,
                            &[("a", medium, 0), ("b", wide, 8),
                              ("c", medium, 16)])
            .expect("repacking should shrink this");

        assert_eq!(result.size(), 16);
        let offsets: Vec<(String, u64)> = result.slots().iter()
            .map(|slot| (slot.display_name().to_string(), slot.offset()))
            .collect();
        assert_eq!(offsets, vec![
            ("a".to_string(), 0),
            ("c".to_string(), 4),
            ("b".to_string(), 8),
        ]);
    }

    #[test]
    fn vptr_stays_put() {
        let mut table = TypeTable::new();
        let tiny = base(&mut table, "char", 1);
        let wide = base(&mut table, "long", 8);
        let table_ptr = base(&mut table, "__vtbl_ptr_type", 8);

        let result = packed(&mut table, "virtual_heavy", 32,
                            &[("_vptr.virtual_heavy", table_ptr, 0),
                              ("a", tiny, 8), ("b", wide, 16),
                              ("c", tiny, 24)])
            .expect("repacking should shrink this");

        assert_eq!(result.slots()[0].display_name(), "_vptr.virtual_heavy");
        assert_eq!(result.slots()[0].offset(), 0);
        assert_eq!(result.size(), 24);
    }

    #[test]
    fn repacking_is_idempotent() {
        let mut table = TypeTable::new();
        let tiny = base(&mut table, "char", 1);
        let medium = base(&mut table, "int", 4);

        let first = packed(&mut table, "stable", 12,
                           &[("a", tiny, 0), ("b", medium, 4),
                             ("c", tiny, 8)])
            .expect("first pass shrinks");

        // a second pass over the packed layout finds nothing to improve
        let second = repack_struct(&table, &first).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn ebo_base_then_member() {
        let mut table = TypeTable::new();
        let empty = table.insert_at(0x20, Type::Struct(
            StructType::new("empty_base", 1),
        ));
        let medium = base(&mut table, "int", 4);

        let mut st = StructType::new("derived", 12);
        st.push_slot(Slot::Inheritance { base: empty, offset: 0 }).unwrap();
        st.push_slot(member("a", medium, 0)).unwrap();
        st.push_slot(member("b", medium, 8)).unwrap();
        let id = table.insert_at(0x1000, Type::Struct(st));
        fix_struct_layout(&mut table, id).unwrap();
        insert_padding(&mut table, id).unwrap();

        let st = table.struct_ref(id).unwrap().clone();
        let result = repack_struct(&table, &st).unwrap()
            .expect("the interior hole closes");

        assert!(matches!(result.slots()[0], Slot::EboInheritance { .. }));
        assert_eq!(result.slots()[0].offset(), 0);
        assert_eq!(result.slots()[1].offset(), 0);
        assert_eq!(result.size(), 8);
    }

    #[test]
    fn unsubstituted_empty_base_is_an_ebo_error() {
        let mut table = TypeTable::new();
        let phantom = table.insert(Type::Unknown {
            reason: "type_id is None".to_string(),
            size: None,
        });
        let medium = base(&mut table, "int", 4);
        table.try_set_alignment(medium, 4).unwrap();

        let mut st = StructType::new("anomalous", 12);
        st.push_slot(Slot::Inheritance { base: phantom, offset: 0 }).unwrap();
        st.push_slot(member("a", medium, 4)).unwrap();
        st.push_slot(Slot::Padding { size: 4, offset: 8 }).unwrap();
        st.try_set_alignment(4).unwrap();

        let result = repack_struct(&table, &st);
        assert!(matches!(result, Err(Error::Ebo(_))));
    }
}

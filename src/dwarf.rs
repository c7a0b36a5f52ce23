//! Loading of DWARF information from an ELF object file.
//!
//! This is the only module that touches `gimli` and `object`. Its job is to
//! reduce the raw sections to the [`DieIndex`] abstraction in [`crate::die`],
//! after which the rest of the crate never sees a DWARF byte again.
use std::borrow::Cow;

use fallible_iterator::FallibleIterator;
use gimli::{AttributeValue, RunTimeEndian};
use object::{Object, ObjectSection, ReadRef};

use crate::die::{Die, DieIndex, DieTag, MemberLocation};
use crate::Error;

// Abbreviations for some lengthy gimli types
type R<'a> = gimli::EndianSlice<'a, RunTimeEndian>;
type DIE<'a> = gimli::DebuggingInformationEntry<'a, 'a, R<'a>, usize>;
type CU<'a> = gimli::Unit<R<'a>, usize>;
type GimliDwarf<'a> = gimli::Dwarf<R<'a>>;

/// Represents DWARF data
pub struct Dwarf<'a> {
    dwarf_cow: gimli::Dwarf<Cow<'a, [u8]>>,
    endianness: RunTimeEndian,
}

impl<'a> Dwarf<'a> {
    pub fn load(data: impl ReadRef<'a>) -> Result<Self, Error> {
        let object = object::File::parse(data)?;

        let endianness = if object.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        let load_section = |id: gimli::SectionId|
        -> Result<Cow<[u8]>, gimli::Error> {
            match object.section_by_name(id.name()) {
                Some(ref section) => Ok(section
                    .uncompressed_data()
                    .unwrap_or(Cow::Borrowed(&[][..]))),
                None => Ok(Cow::Borrowed(&[][..])),
            }
        };

        // Load all of the sections.
        let dwarf_cow = gimli::Dwarf::load(&load_section)?;

        Ok(Self { dwarf_cow, endianness })
    }

    fn borrow_dwarf(&self) -> GimliDwarf {
        let borrow_section: &dyn for<'b> Fn(&'b Cow<[u8]>,
        ) -> gimli::EndianSlice<'b, gimli::RunTimeEndian> =
        &|section| gimli::EndianSlice::new(section, self.endianness);

        self.dwarf_cow.borrow(borrow_section)
    }

    /// Flatten every compilation unit into a single offset-keyed index.
    ///
    /// The word size is taken from the first CU header; a file with no CUs
    /// has no DWARF info and is a fatal error.
    pub fn die_index(&self) -> Result<DieIndex, Error> {
        let dwarf = self.borrow_dwarf();

        let word_size = {
            let header = dwarf.units().nth(0)?.ok_or_else(|| {
                Error::DwarfLoad("no compilation units found".to_string())
            })?;
            u64::from(header.address_size())
        };

        let mut index = DieIndex::new(word_size);
        let mut unit_headers = dwarf.units();
        while let Some(header) = unit_headers.next()? {
            let unit = match dwarf.unit(header) {
                Ok(unit) => unit,
                Err(_) => continue,
            };
            index_unit(&dwarf, &unit, &mut index)?;
        }

        Ok(index)
    }
}

// One DFS pass over a unit: convert each entry, link it to its parent
fn index_unit(dwarf: &GimliDwarf, unit: &CU, index: &mut DieIndex)
-> Result<(), Error> {
    // (depth, offset) of the ancestors of the entry being visited
    let mut ancestry: Vec<(isize, usize)> = Vec::new();
    let mut depth: isize = 0;

    let mut entries = unit.entries();
    while let Some((delta_depth, entry)) = entries.next_dfs()? {
        depth += delta_depth;

        let offset = match entry.offset().to_debug_info_offset(&unit.header) {
            Some(offset) => offset.0,
            // offsets in .debug_types cannot be keys here, skip the unit
            None => return Ok(()),
        };

        let die = convert_entry(dwarf, unit, entry, offset);

        while let Some((ancestor_depth, _)) = ancestry.last() {
            if *ancestor_depth >= depth {
                ancestry.pop();
            } else {
                break;
            }
        }
        if let Some((_, parent)) = ancestry.last() {
            index.add_child(*parent, offset);
        }
        ancestry.push((depth, offset));

        index.insert(die);
    }
    Ok(())
}

fn convert_entry(dwarf: &GimliDwarf, unit: &CU, entry: &DIE, offset: usize)
-> Die {
    let mut die = Die::new(offset, convert_tag(entry.tag()));

    let mut attrs = entry.attrs();
    while let Ok(Some(attr)) = attrs.next() {
        match attr.name() {
            gimli::DW_AT_name => {
                die.name = attr_to_string(dwarf, unit, &attr);
            }
            gimli::DW_AT_byte_size => {
                die.byte_size = attr.udata_value();
            }
            gimli::DW_AT_type => {
                die.type_ref = attr_to_die_ref(unit, &attr);
            }
            gimli::DW_AT_data_member_location => {
                die.member_location = attr_to_member_location(&attr);
            }
            gimli::DW_AT_decl_file => {
                die.decl_file = attr.udata_value().map(|v| v as i64);
            }
            gimli::DW_AT_decl_line => {
                die.decl_line = attr.udata_value().map(|v| v as i64);
            }
            gimli::DW_AT_external => {
                die.external = true;
            }
            gimli::DW_AT_specification => {
                die.specification = attr_to_die_ref(unit, &attr);
            }
            gimli::DW_AT_declaration => {
                die.declaration = true;
            }
            _ => {}
        }
    }

    die
}

fn convert_tag(tag: gimli::DwTag) -> DieTag {
    match tag {
        gimli::DW_TAG_class_type => DieTag::ClassType,
        gimli::DW_TAG_structure_type => DieTag::StructureType,
        gimli::DW_TAG_base_type => DieTag::BaseType,
        gimli::DW_TAG_union_type => DieTag::UnionType,
        gimli::DW_TAG_enumeration_type => DieTag::EnumerationType,
        gimli::DW_TAG_pointer_type => DieTag::PointerType,
        gimli::DW_TAG_reference_type => DieTag::ReferenceType,
        gimli::DW_TAG_array_type => DieTag::ArrayType,
        gimli::DW_TAG_const_type => DieTag::ConstType,
        gimli::DW_TAG_volatile_type => DieTag::VolatileType,
        gimli::DW_TAG_typedef => DieTag::Typedef,
        gimli::DW_TAG_member => DieTag::Member,
        gimli::DW_TAG_inheritance => DieTag::Inheritance,
        _ => DieTag::Other,
    }
}

// Try to retrieve an attribute as a string, whichever section it lives in
fn attr_to_string(dwarf: &GimliDwarf, unit: &CU, attr: &gimli::Attribute<R>)
-> Option<String> {
    let slice = dwarf.attr_string(unit, attr.value()).ok()?;
    Some(slice.to_string_lossy().into_owned())
}

fn attr_to_die_ref(unit: &CU, attr: &gimli::Attribute<R>) -> Option<usize> {
    match attr.value() {
        AttributeValue::UnitRef(offset) => {
            offset.to_debug_info_offset(&unit.header).map(|o| o.0)
        }
        AttributeValue::DebugInfoRef(offset) => Some(offset.0),
        _ => None,
    }
}

fn attr_to_member_location(attr: &gimli::Attribute<R>)
-> Option<MemberLocation> {
    match attr.value() {
        AttributeValue::Udata(v) => Some(MemberLocation::Offset(v)),
        AttributeValue::Sdata(v) if v >= 0 => {
            Some(MemberLocation::Offset(v as u64))
        }
        AttributeValue::Exprloc(expr) => {
            Some(MemberLocation::Expr(expr.0.slice().to_vec()))
        }
        AttributeValue::Block(data) => {
            Some(MemberLocation::Expr(data.slice().to_vec()))
        }
        _ => None,
    }
}

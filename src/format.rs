//! Formatting of struct layouts: single layouts, side-by-side diffs, and
//! the verbose per-struct summary.
//!
//! Rows are budgeted into a fixed column width so old and new layouts line
//! up: half the width for the member name and offset, half for the type
//! description. Names that do not fit are cut with a `...` marker.

use crate::layout::{
    is_template, is_template_param_dependent, is_type_completely_defined,
    is_type_well_defined, total_padding,
};
use crate::types::{Slot, StructType, Type, TypeId, TypeTable};

/// Cut `text` to at most `length` characters, marking the cut with `...`.
/// Widths too small to hold the marker leave the text alone.
pub fn abbrev(text: &str, length: usize) -> String {
    if text.chars().count() <= length {
        return text.to_string();
    }
    if length <= 3 {
        return text.to_string();
    }
    let kept: String = text.chars().take(length - 3).collect();
    format!("{kept}...")
}

/// A type name in the compact notation used by every report: `T*`/`T&`
/// for pointers and references, `c{T}`/`v{T}` for qualifiers, `u{T}`,
/// `e{T}`, `{T}` and `d{T}` for unions, enums, structs and declarations,
/// and `T[?]` for arrays of unknown length.
pub fn decorated_type_name(table: &TypeTable, id: TypeId, width: usize)
-> String {
    match table.get(id) {
        Type::Unknown { .. } => abbrev("Unknown", width),
        Type::Base { name, .. } => abbrev(name, width),
        Type::Declaration { name, .. } => {
            format!("d{{{}}}", abbrev(name, width.saturating_sub(3)))
        }
        Type::Enum { name, .. } => {
            format!("e{{{}}}", abbrev(name, width.saturating_sub(3)))
        }
        Type::Union { name, .. } => {
            format!("u{{{}}}", abbrev(name, width.saturating_sub(3)))
        }
        Type::Pointer { pointee, .. } => {
            let name = table.name_of(*pointee);
            format!("{}*", abbrev(name, width.saturating_sub(1)))
        }
        Type::Reference { pointee, .. } => {
            let name = table.name_of(*pointee);
            format!("{}&", abbrev(name, width.saturating_sub(1)))
        }
        Type::Const { inner } => {
            let name = table.name_of(*inner);
            format!("c{{{}}}", abbrev(name, width.saturating_sub(3)))
        }
        Type::Volatile { inner } => {
            let name = table.name_of(*inner);
            format!("v{{{}}}", abbrev(name, width.saturating_sub(3)))
        }
        Type::Array { element, .. } => {
            let name = table.name_of(*element);
            format!("{}[?]", abbrev(name, width.saturating_sub(3)))
        }
        Type::Struct(st) => {
            format!("{{{}}}", abbrev(st.name(), width.saturating_sub(2)))
        }
    }
}

fn opt_to_string(value: Option<u64>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "?".to_string(),
    }
}

/// `[name (size:alignment)]`, fitted to `width`.
fn slot_type_desc(table: &TypeTable, slot: &Slot, width: usize) -> String {
    let (size, alignment) = match slot {
        Slot::Padding { size, .. } => (Some(*size), Some(1)),
        _ => match slot.type_id() {
            Some(id) => (table.size_of(id), table.alignment_of(id)),
            None => (None, None),
        },
    };
    let suffix = format!(" ({}:{})]", opt_to_string(size),
                         opt_to_string(alignment));

    let name_width = width.saturating_sub(1 + suffix.len());
    let name = match slot {
        Slot::Padding { size, .. } => abbrev(&format!("char[{size}]"),
                                             name_width),
        _ => match slot.type_id() {
            Some(id) => decorated_type_name(table, id, name_width),
            None => String::new(),
        },
    };

    format!("[{name}{suffix}")
}

/// One member row: name, `(+offset)`, type description, padded to
/// `width / 2` on each side.
pub fn format_slot(table: &TypeTable, slot: &Slot, width: usize) -> String {
    let offset = format!(" (+{})", slot.offset());
    let offset_len = offset.len();
    let name_len = (width / 2).saturating_sub(offset_len);
    let name = abbrev(slot.display_name(), name_len);
    let type_len = width / 2;
    let desc = slot_type_desc(table, slot, type_len);

    format!("{name:<name_len$}{offset:>offset_len$}{desc:<type_len$}")
}

/// A whole layout, one row per slot.
pub fn format_struct(table: &TypeTable, st: &StructType, width: usize)
-> String {
    let mut out = String::new();
    for slot in st.slots() {
        out.push_str(&format_slot(table, slot, width));
        out.push('\n');
    }
    out
}

/// Side-by-side diff of an original layout and its packed counterpart.
/// Rows without a counterpart get a `-` on the empty side.
pub fn format_diff(table: &TypeTable, original: &StructType,
                   packed: &StructType, width: usize)
-> String {
    let mut out = String::new();
    out.push_str(&format!("{{{}}}({}/{})\n", original.name(),
                          original.size(), packed.size()));

    let left = original.slots();
    let right = packed.slots();
    let common = left.len().min(right.len());

    for i in 0..common {
        out.push_str(&format!("{} | {}\n",
                              format_slot(table, &left[i], width),
                              format_slot(table, &right[i], width)));
    }

    let row_len = format_row_len(width);
    let empty = format!("{:<row_len$}", "-");

    for slot in &left[common..] {
        out.push_str(&format!("{} | {empty}\n",
                              format_slot(table, slot, width)));
    }
    for slot in &right[common..] {
        out.push_str(&format!("{empty} | {}\n",
                              format_slot(table, slot, width)));
    }

    out
}

// a row is name+offset (width/2) plus the type column (width/2)
fn format_row_len(width: usize) -> usize {
    (width / 2) * 2
}

/// The `--verbose` summary: one header line per struct with its DIE
/// offset, size, total padding, alignment and state flags, followed by a
/// brief line per slot.
///
/// Flags: `V` valid, `W` well-defined, `C` completely defined, `T`
/// template-parameter-dependent template.
pub fn format_struct_details(table: &TypeTable, die_offset: usize,
                             id: TypeId)
-> String {
    let st = match table.struct_ref(id) {
        Some(st) => st,
        None => return String::new(),
    };

    let mut flags = String::new();
    flags.push(if st.valid() { 'V' } else { ' ' });
    flags.push(if is_type_well_defined(table, id) { 'W' } else { ' ' });
    flags.push(if is_type_completely_defined(table, id) { 'C' } else { ' ' });
    let dependent = is_template(st.name())
        && is_template_param_dependent(table, st);
    flags.push(if dependent { 'T' } else { ' ' });

    let mut out = format!(
        "{:x} {} ({}/{}/{})({})",
        die_offset,
        abbrev(st.name(), 50),
        st.size(),
        total_padding(st),
        opt_to_string(st.alignment()),
        flags,
    );

    for slot in st.slots() {
        out.push_str(&format!(
            "\n\t{:<30} {} [this+{}]",
            abbrev(slot.display_name(), 30),
            slot_type_desc(table, slot, 30),
            slot.offset(),
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemberSlot;

    fn sample_table() -> (TypeTable, TypeId, TypeId) {
        let mut table = TypeTable::new();
        let base = table.insert(Type::Base {
            name: "int".to_string(),
            size: 4,
            alignment: Some(4),
        });
        let pointer = table.insert(Type::Pointer {
            pointee: base,
            size: 8,
            alignment: Some(8),
        });
        (table, base, pointer)
    }

    #[test]
    fn abbrev_cuts_with_marker() {
        assert_eq!(abbrev("short", 10), "short");
        assert_eq!(abbrev("a_rather_long_name", 10), "a_rathe...");
        assert_eq!(abbrev("abcd", 3), "abcd");
    }

    #[test]
    fn names_are_decorated_by_variant() {
        let (mut table, base, pointer) = sample_table();
        assert_eq!(decorated_type_name(&table, base, 30), "int");
        assert_eq!(decorated_type_name(&table, pointer, 30), "int*");

        let constant = table.insert(Type::Const { inner: base });
        assert_eq!(decorated_type_name(&table, constant, 30), "c{int}");

        let array = table.insert(Type::Array { element: base, size: None });
        assert_eq!(decorated_type_name(&table, array, 30), "int[?]");

        let decl = table.insert(Type::Declaration {
            name: "fwd".to_string(),
            size: None,
            alignment: None,
        });
        assert_eq!(decorated_type_name(&table, decl, 30), "d{fwd}");
    }

    #[test]
    fn member_rows_are_budgeted() {
        let (table, base, _) = sample_table();
        let slot = Slot::Member(MemberSlot {
            name: "counter".to_string(),
            file_id: -1,
            line_no: -1,
            type_id: base,
            offset: 4,
        });

        let row = format_slot(&table, &slot, 50);
        assert!(row.starts_with("counter"));
        assert!(row.contains("(+4)"));
        assert!(row.contains("[int (4:4)]"));
        assert_eq!(row.len(), 50);
    }

    #[test]
    fn padding_rows_show_char_arrays() {
        let (table, _, _) = sample_table();
        let slot = Slot::Padding { size: 3, offset: 5 };
        let row = format_slot(&table, &slot, 50);
        assert!(row.contains("(+5)"));
        assert!(row.contains("[char[3] (3:1)]"));
    }

    #[test]
    fn diff_header_and_filler() {
        let (table, base, _) = sample_table();

        let mut original = StructType::new("sample", 8);
        original.push_slot(Slot::Member(MemberSlot {
            name: "a".to_string(),
            file_id: -1,
            line_no: -1,
            type_id: base,
            offset: 0,
        })).unwrap();
        original.push_slot(Slot::Padding { size: 4, offset: 4 }).unwrap();

        let mut packed = StructType::new("sample", 4);
        packed.push_slot(Slot::Member(MemberSlot {
            name: "a".to_string(),
            file_id: -1,
            line_no: -1,
            type_id: base,
            offset: 0,
        })).unwrap();

        let diff = format_diff(&table, &original, &packed, 30);
        let lines: Vec<&str> = diff.lines().collect();
        assert_eq!(lines[0], "{sample}(8/4)");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains(" | "));
        // the packed side ran out of rows, the filler takes over
        assert!(lines[2].ends_with("-") || lines[2].contains("| -"));
    }
}

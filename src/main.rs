use std::fs;
use std::fs::File;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use memmap2::Mmap;

use dwpack::{format, layout, parse, repack};
use dwpack::{Dwarf, StructType, TypeId, TypeTable};

#[derive(Parser)]
#[command(about = "Reads an object file in ELF format and, using its DWARF \
                   debug info, detects structs and their members, \
                   calculates padding, and tries to shuffle members to \
                   minimize padding and save memory.")]
struct CmdArgs {
    /// Process only particular types (eg.: MyType); a common prefix may be
    /// given with an asterisk (eg.: vector*).
    #[clap(short, long, num_args = 1..)]
    types: Vec<String>,

    /// Print struct layouts before compaction.
    #[clap(short, long, action)]
    verbose: bool,

    /// Redirect output to stdout instead of creating file(s). Implies
    /// --diff.
    #[clap(short, long, action)]
    stdout: bool,

    /// Show warnings.
    #[clap(short, long, action)]
    warnings: bool,

    /// Width of the output in columns; names are cut (eg. memb...) to
    /// fit. The minimum is 30.
    #[clap(short, long, default_value_t = 50)]
    columns: usize,

    /// Create one file (*.sc) with a simple diff instead of two files
    /// (*.old.sc/*.new.sc).
    #[clap(short, long, action)]
    diff: bool,

    /// Object file to be processed.
    file: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let mut args = CmdArgs::parse();
    args.columns = args.columns.max(30);
    if args.stdout {
        args.diff = true;
    }

    let file = File::open(&args.file).with_context(|| {
        format!("could not open {}", args.file.display())
    })?;
    let mmap = unsafe { Mmap::map(&file) }?;

    println!("Reading DWARF (may take some time)...");
    let dwarf = Dwarf::load(&*mmap)?;
    let index = dwarf.die_index()?;
    let mut table = parse::reconstruct_types(&index, args.warnings);

    println!("Fixing types...");
    let struct_ids: Vec<(usize, TypeId)> = table.structs().collect();
    for (_, id) in &struct_ids {
        if let Err(err) = layout::fix_struct_layout(&mut table, *id) {
            if args.warnings {
                eprintln!("Warning: {err}");
            }
        }
    }

    println!("Finding paddings...");
    for (_, id) in &struct_ids {
        if let Err(err) = layout::insert_padding(&mut table, *id) {
            if args.warnings {
                eprintln!("Warning: {err}");
            }
        }
    }

    if args.verbose {
        for (offset, id) in &struct_ids {
            let st = match table.struct_ref(*id) {
                Some(st) => st,
                None => continue,
            };
            if !matches_filter(&args.types, st.name()) {
                continue;
            }
            println!("{}", format::format_struct_details(&table, *offset, *id));
        }
    }

    println!("Compacting structs...");
    let packed_structs = compact_structs(&table, &struct_ids, &args)?;

    println!("... and finally:");
    if args.diff {
        emit_diffs(&table, &packed_structs, &args)?;
    } else {
        emit_layout_files(&table, &packed_structs, &args)?;
    }

    println!("Done.");
    Ok(())
}

fn compact_structs(table: &TypeTable, struct_ids: &[(usize, TypeId)],
                   args: &CmdArgs)
-> anyhow::Result<Vec<(TypeId, StructType)>> {
    let mut packed_structs = Vec::new();

    for (_, id) in struct_ids {
        let st = match table.struct_ref(*id) {
            Some(st) => st,
            None => continue,
        };
        if !matches_filter(&args.types, st.name()) {
            continue;
        }
        if layout::should_skip_repacking(table, st) {
            continue;
        }

        match repack::repack_struct(table, st) {
            Ok(Some(packed)) => packed_structs.push((*id, packed)),
            Ok(None) => {}
            Err(err) if !err.is_fatal() => {
                if args.warnings {
                    eprintln!("Warning: {err}");
                }
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(packed_structs)
}

fn matches_filter(patterns: &[String], name: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns.iter().any(|pattern| match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => name == pattern,
    })
}

fn emit_diffs(table: &TypeTable, pairs: &[(TypeId, StructType)],
              args: &CmdArgs)
-> anyhow::Result<()> {
    for (id, packed) in pairs {
        let st = match table.struct_ref(*id) {
            Some(st) => st,
            None => continue,
        };
        let diff = format::format_diff(table, st, packed, args.columns);

        if args.stdout {
            println!("{diff}");
        } else {
            let file_name = format!("{}.sc", st.name());
            fs::write(&file_name, &diff).with_context(|| {
                format!("could not write {file_name}")
            })?;
            println!("File {file_name} created.");
        }
    }
    Ok(())
}

fn emit_layout_files(table: &TypeTable, pairs: &[(TypeId, StructType)],
                     args: &CmdArgs)
-> anyhow::Result<()> {
    for (id, packed) in pairs {
        let st = match table.struct_ref(*id) {
            Some(st) => st,
            None => continue,
        };

        let old_name = format!("{}.old.{}.sc", st.name(), st.size());
        let new_name = format!("{}.new.{}.sc", st.name(), packed.size());

        fs::write(&old_name, format::format_struct(table, st, args.columns))
            .with_context(|| format!("could not write {old_name}"))?;
        fs::write(&new_name,
                  format::format_struct(table, packed, args.columns))
            .with_context(|| format!("could not write {new_name}"))?;

        println!("Files {old_name} {new_name} created");
    }
    Ok(())
}

//! Debug-info oracle: pc ⇄ source line queries over the target's embedded
//! DWARF tables and symbol table.
//!
//! Everything is parsed eagerly at construction into flat lookup tables; the
//! oracle is read-only afterwards and owned by the engine thread.

use crate::debugger::error::Error;
use gimli::RunTimeEndian;
use log::debug;
use nix::unistd::{getpgid, Pid};
use object::{Object, ObjectKind, ObjectSection, ObjectSymbol, SymbolKind};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};

/// File id marking a gap after an end-of-sequence row: addresses falling into
/// it have no source mapping.
const GAP: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct LineRow {
    address: u64,
    file_id: u32,
    line: u64,
    is_stmt: bool,
}

#[derive(Debug, Clone)]
struct FuncSym {
    name: String,
    entry: u64,
    size: u64,
}

pub struct DebugInfo {
    files: Vec<PathBuf>,
    rows: Vec<LineRow>,
    funcs: Vec<FuncSym>,
    funcs_by_name: HashMap<String, u64>,
    main_source: PathBuf,
    dynamic: bool,
}

impl DebugInfo {
    /// Parse the executable at `path`. Fails if the object or its DWARF is
    /// unreadable, or if the `main` symbol is missing (stripped binary).
    pub fn new(path: &Path) -> Result<DebugInfo, Error> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;
        let endian = if object.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let load_section = |id: gimli::SectionId| -> Result<Cow<[u8]>, gimli::Error> {
            Ok(object
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(Cow::Borrowed(&[][..])))
        };
        let dwarf_cow = gimli::Dwarf::load(load_section)?;
        let dwarf = dwarf_cow.borrow(|section| gimli::EndianSlice::new(section, endian));

        let mut files: Vec<PathBuf> = vec![];
        let mut rows: Vec<LineRow> = vec![];

        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            let Some(ref line_program) = unit.line_program else {
                continue;
            };

            // unit-local file index -> id in the global file table
            let mut file_ids: HashMap<u64, u32> = HashMap::new();
            let mut row_iter = line_program.clone().rows();
            while let Some((header, row)) = row_iter.next_row()? {
                if row.end_sequence() {
                    rows.push(LineRow {
                        address: row.address(),
                        file_id: GAP,
                        line: 0,
                        is_stmt: false,
                    });
                    continue;
                }

                let file_id = match file_ids.get(&row.file_index()) {
                    Some(id) => *id,
                    None => {
                        let path = match header.file(row.file_index()) {
                            Some(entry) => render_file_path(&unit, entry, header, &dwarf)?,
                            None => PathBuf::default(),
                        };
                        let id = files.len() as u32;
                        files.push(path);
                        file_ids.insert(row.file_index(), id);
                        id
                    }
                };

                rows.push(LineRow {
                    address: row.address(),
                    file_id,
                    line: row.line().map(NonZeroU64::get).unwrap_or(0),
                    is_stmt: row.is_stmt(),
                });
            }
        }
        rows.sort_unstable_by_key(|row| row.address);

        let mut funcs: Vec<FuncSym> = object
            .symbols()
            .filter(|sym| sym.kind() == SymbolKind::Text)
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                (!name.is_empty()).then(|| FuncSym {
                    name: name.to_string(),
                    entry: sym.address(),
                    size: sym.size(),
                })
            })
            .collect();
        funcs.sort_unstable_by_key(|func| func.entry);
        let funcs_by_name: HashMap<String, u64> = funcs
            .iter()
            .map(|func| (func.name.clone(), func.entry))
            .collect();

        debug!(
            target: "debugger",
            "loaded debug info: {} line rows, {} functions",
            rows.len(),
            funcs.len()
        );

        let mut info = DebugInfo {
            files,
            rows,
            funcs,
            funcs_by_name,
            main_source: PathBuf::new(),
            dynamic: object.kind() == ObjectKind::Dynamic,
        };

        // The entry function's source file, resolved once: controllers may
        // address breakpoints against it without knowing the full path.
        let main_entry = info.entry_pc("main")?;
        let (main_file, _, _) = info.pc_to_line(main_entry);
        info.main_source = PathBuf::from(main_file);

        Ok(info)
    }

    /// The pc of a named function's first instruction.
    pub fn entry_pc(&self, symbol: &str) -> Result<u64, Error> {
        self.funcs_by_name
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::SymbolMissing(symbol.to_string()))
    }

    /// Nearest source location for `pc`. Total: unmapped addresses come back
    /// as empty strings and line zero.
    pub fn pc_to_line(&self, pc: u64) -> (String, u64, String) {
        let function = self.function_at(pc).unwrap_or_default();
        let idx = self.rows.partition_point(|row| row.address <= pc);
        if idx == 0 {
            return (String::new(), 0, function);
        }
        let row = &self.rows[idx - 1];
        if row.file_id == GAP {
            return (String::new(), 0, function);
        }
        (
            self.files[row.file_id as usize].display().to_string(),
            row.line,
            function,
        )
    }

    /// First pc attributable to `file:line`. Statement rows win over
    /// non-statement rows; ties resolve to the lowest address.
    pub fn line_to_pc(&self, file: &str, line: u64) -> Result<u64, Error> {
        let requested = Path::new(file);
        let mut best: Option<(u64, bool)> = None;
        for row in &self.rows {
            if row.file_id == GAP || row.line != line {
                continue;
            }
            let path = &self.files[row.file_id as usize];
            if !path_matches(path, requested) {
                continue;
            }
            best = match best {
                None => Some((row.address, row.is_stmt)),
                Some((addr, stmt)) => {
                    if (row.is_stmt && !stmt) || (row.is_stmt == stmt && row.address < addr) {
                        Some((row.address, row.is_stmt))
                    } else {
                        Some((addr, stmt))
                    }
                }
            };
        }
        best.map(|(addr, _)| addr)
            .ok_or_else(|| Error::LineUnmapped(file.to_string(), line))
    }

    /// Source file of the target's entry function.
    pub fn main_source_path(&self) -> &Path {
        &self.main_source
    }

    /// Thread-group identifier used to wait for any child thread.
    pub fn process_group(&self, pid: Pid) -> Result<Pid, Error> {
        getpgid(Some(pid)).map_err(|e| Error::Syscall("getpgid", e))
    }

    /// Whether the object is position independent and needs the runtime load
    /// bias applied to its addresses.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    fn function_at(&self, pc: u64) -> Option<String> {
        let idx = self.funcs.partition_point(|func| func.entry <= pc);
        if idx == 0 {
            return None;
        }
        let func = &self.funcs[idx - 1];
        if func.size > 0 && pc >= func.entry + func.size {
            return None;
        }
        Some(func.name.clone())
    }
}

/// True when `path` names the requested file: either exactly or by trailing
/// components ("main.c", "src/main.c").
fn path_matches(path: &Path, requested: &Path) -> bool {
    path == requested || path.ends_with(requested)
}

fn render_file_path<R: gimli::Reader>(
    unit: &gimli::Unit<R>,
    file: &gimli::FileEntry<R, R::Offset>,
    header: &gimli::LineProgramHeader<R, R::Offset>,
    dwarf: &gimli::Dwarf<R>,
) -> Result<PathBuf, gimli::Error> {
    let mut path = match unit.comp_dir {
        Some(ref comp_dir) => PathBuf::from(comp_dir.to_string_lossy()?.as_ref()),
        None => PathBuf::new(),
    };

    if file.directory_index() != 0 {
        if let Some(directory) = file.directory(header) {
            path.push(
                dwarf
                    .attr_string(unit, directory)?
                    .to_string_lossy()?
                    .as_ref(),
            );
        }
    }

    path.push(
        dwarf
            .attr_string(unit, file.path_name())?
            .to_string_lossy()?
            .as_ref(),
    );

    Ok(path)
}

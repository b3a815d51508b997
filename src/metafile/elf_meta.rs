use std::fs::File;
use std::path::Path;
use std::sync::OnceLock;

use log::debug;
use object::{Object, ObjectKind, ObjectSymbol, SymbolKind};
use regex::Regex;

use crate::error::MetafileError;

use super::binary_format::{BinaryMetadata, FunctionRecord};

/// The seam to the binary-analysis front-end. The full-disassembly path
/// (loop hierarchies, basic blocks) is provided by the external patcher
/// subsystem; the built-in provider covers the validity probe and the
/// symbol-table "parse only" path.
pub trait Disassembler {
    /// Cheap validity check: is this file something we can model?
    fn probe(&mut self, path: &Path) -> bool;

    /// Full function/loop model. Only binaries in the user's
    /// disassemble set go through here.
    fn full_metadata(&mut self, path: &Path) -> Result<BinaryMetadata, MetafileError>;

    /// Function labels only, address ranges derived from the next
    /// label; loops empty.
    fn labels_metadata(&mut self, path: &Path) -> Result<BinaryMetadata, MetafileError>;
}

/// `object`-backed provider reading the ELF symbol tables.
#[derive(Default)]
pub struct ElfSymbolProvider;

impl ElfSymbolProvider {
    fn with_object<T>(
        &self,
        path: &Path,
        read: impl FnOnce(&object::File) -> T,
    ) -> Result<T, MetafileError> {
        let file = File::open(path).map_err(|source| MetafileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(|source| MetafileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let object = object::File::parse(&*mmap).map_err(|e| MetafileError::InvalidObject {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(read(&object))
    }
}

impl Disassembler for ElfSymbolProvider {
    fn probe(&mut self, path: &Path) -> bool {
        self.with_object(path, |_| ()).is_ok()
    }

    fn full_metadata(&mut self, path: &Path) -> Result<BinaryMetadata, MetafileError> {
        // Loop reconstruction lives in the patcher front-end; the
        // built-in fallback degrades to labels.
        debug!(
            "no external disassembler configured, {} gets label-only metadata",
            path.display()
        );
        self.labels_metadata(path)
    }

    fn labels_metadata(&mut self, path: &Path) -> Result<BinaryMetadata, MetafileError> {
        self.with_object(path, |object| {
            let mut labels: Vec<(u64, u64, String)> = Vec::new();
            let symbols = object.symbols();
            let dynamic = object.dynamic_symbols();
            for symbol in symbols.chain(dynamic) {
                if symbol.kind() != SymbolKind::Text || symbol.address() == 0 {
                    continue;
                }
                let name = match symbol.name() {
                    Ok(name) if !name.is_empty() => name,
                    _ => continue,
                };
                labels.push((symbol.address(), symbol.size(), display_name(name)));
            }
            labels.sort_by_key(|(address, _, _)| *address);
            labels.dedup_by(|a, b| a.0 == b.0);

            let mut functions = Vec::with_capacity(labels.len());
            for index in 0..labels.len() {
                let (address, size, ref name) = labels[index];
                // The stop address comes from the next label; the
                // symbol size wins when present and smaller.
                let next = labels
                    .get(index + 1)
                    .map(|(next_address, _, _)| next_address - 1);
                let stop = match (size, next) {
                    (0, Some(next)) => next,
                    (0, None) => address,
                    (size, Some(next)) => (address + size - 1).min(next),
                    (size, None) => address + size - 1,
                };
                functions.push(FunctionRecord {
                    name: name.clone(),
                    ranges: vec![(address, stop)],
                    src_file: None,
                    src_line: 0,
                    outermost_loops: Vec::new(),
                });
            }
            BinaryMetadata {
                functions,
                loops: Vec::new(),
            }
        })
    }
}

/// A position-independent executable maps at an arbitrary base, so its
/// smallest mapped address must be recorded; classic executables get 0.
pub fn is_position_independent(path: &Path) -> Result<bool, MetafileError> {
    ElfSymbolProvider.with_object(path, |object| object.kind() == ObjectKind::Dynamic)
}

fn omp_region_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"L_([a-zA-Z0-9_]+)__[0-9]+__par_region([0-9]+)_[0-9]+_[0-9]+").unwrap()
    })
}

fn omp_loop_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"L_([a-zA-Z0-9_]+)__[0-9]+__par_loop([0-9]+)_[0-9]+_[0-9]+").unwrap()
    })
}

/// Rewrites OpenMP outlined-region/loop names to their compact form
/// (`<outer_fn>#omp_region_<n>` / `<outer_fn>#omp_loop_<n>`); anything
/// else is demangled when possible.
pub fn display_name(raw: &str) -> String {
    if let Some(captures) = omp_region_re().captures(raw) {
        return format!("{}#omp_region_{}", &captures[1], &captures[2]);
    }
    if let Some(captures) = omp_loop_re().captures(raw) {
        return format!("{}#omp_loop_{}", &captures[1], &captures[2]);
    }
    demangle(raw)
}

fn demangle(raw: &str) -> String {
    if raw.starts_with("_Z") {
        if let Ok(symbol) = cpp_demangle::Symbol::new(raw) {
            if let Ok(text) = symbol.demangle() {
                return text;
            }
        }
    }
    if let Ok(demangled) = rustc_demangle::try_demangle(raw) {
        return format!("{demangled:#}");
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omp_region_names_are_rewritten() {
        assert_eq!(
            display_name("L_solver_main__12__par_region3_2_7"),
            "solver_main#omp_region_3"
        );
        assert_eq!(
            display_name("L_solver_main__12__par_loop0_2_7"),
            "solver_main#omp_loop_0"
        );
    }

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(display_name("compute_kernel"), "compute_kernel");
    }

    #[test]
    fn cpp_names_are_demangled() {
        assert_eq!(display_name("_ZN3foo3barEv"), "foo::bar()");
    }

    #[test]
    fn probe_rejects_non_objects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_an_elf");
        std::fs::write(&path, b"#!/bin/sh\necho hi\n").unwrap();
        assert!(!ElfSymbolProvider.probe(&path));
    }
}

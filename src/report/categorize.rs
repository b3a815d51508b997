use indexmap::IndexMap;
use serde_derive::Serialize;

/// Sample attribution categories. Every sample lands in exactly one,
/// plus optionally one user-declared extra library category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Binary,
    Mpi,
    Openmp,
    Math,
    System,
    Pthread,
    Io,
    String,
    Memory,
    Other,
}

pub const CATEGORY_COUNT: usize = 10;

impl Category {
    pub fn index(self) -> usize {
        match self {
            Category::Binary => 0,
            Category::Mpi => 1,
            Category::Openmp => 2,
            Category::Math => 3,
            Category::System => 4,
            Category::Pthread => 5,
            Category::Io => 6,
            Category::String => 7,
            Category::Memory => 8,
            Category::Other => 9,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Category::Binary => "binary",
            Category::Mpi => "mpi",
            Category::Openmp => "openmp",
            Category::Math => "math",
            Category::System => "system",
            Category::Pthread => "pthread",
            Category::Io => "io",
            Category::String => "string",
            Category::Memory => "memory",
            Category::Other => "other",
        }
    }
}

/// Where one sample was attributed: a fixed category or one of the
/// user-declared extra library categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    Fixed(Category),
    Extra(usize),
}

const MPI_LIBRARY_GLOBS: &[&str] = &[
    "libmpi",
    "libmpi_usempi.so",
    "libopen-rte.so",
    "libmca_",
    "mca_",
    "libpami.so",
    "libpsm_infinipath.so",
    "libopen-pal.so",
];

const OMP_LIBRARY_GLOBS: &[&str] = &["libiomp5.", "libcraymp", "libgomp"];

const MATH_LIBRARY_GLOBS: &[&str] = &[
    "libmkl_",
    "libm.",
    "libm-",
    "libcraymath",
    "libblas",
    "libimf.",
    "libquadmath.",
    "libfft",
];

const MEMORY_LIBRARY_GLOBS: &[&str] = &["libtcmalloc_minimal"];

const LIBC_FAMILY_GLOBS: &[&str] = &["libdl", "libc-", "libc.", "ld-", "ld-linux."];

const PTHREAD_LIBRARY_GLOBS: &[&str] = &["libpthread-"];

fn matches_any(library_name: &str, globs: &[&str]) -> bool {
    globs.iter().any(|g| library_name.contains(g))
}

pub fn matches_mpi_library(library_name: &str) -> bool {
    matches_any(library_name, MPI_LIBRARY_GLOBS)
}

pub fn matches_omp_library(library_name: &str) -> bool {
    matches_any(library_name, OMP_LIBRARY_GLOBS)
}

pub fn matches_pthread_library(library_name: &str) -> bool {
    matches_any(library_name, PTHREAD_LIBRARY_GLOBS)
}

pub fn is_libc_family(library_name: &str) -> bool {
    matches_any(library_name, LIBC_FAMILY_GLOBS)
}

/// libc/ld function sub-categories, consulted to split the libc family
/// into io/string/memory; anything unlisted stays `system`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibcCategory {
    Io,
    String,
    Memory,
    Unknown,
}

pub const LIBC_CATEGORY_NAMES: &[&str] = &["io", "string", "memory", "unknown"];

impl LibcCategory {
    pub fn index(self) -> usize {
        match self {
            LibcCategory::Io => 0,
            LibcCategory::String => 1,
            LibcCategory::Memory => 2,
            LibcCategory::Unknown => 3,
        }
    }
}

static LIBC_IO_FUNCTIONS: &[&str] = &[
    "read", "write", "open", "close", "fread", "fwrite", "fopen", "fclose", "fflush", "printf",
    "fprintf", "vfprintf", "sprintf", "snprintf", "scanf", "fscanf", "sscanf", "puts", "fputs",
    "fgets", "getc", "putc", "fgetc", "fputc", "ungetc", "lseek", "llseek", "pread", "pwrite",
    "readv", "writev", "dup", "dup2", "pipe", "select", "poll", "epoll_wait", "fsync", "fseek",
    "ftell", "rewind", "_IO_file_xsgetn", "_IO_file_xsputn", "_IO_file_overflow",
    "_IO_file_underflow", "_IO_do_write", "_IO_fwrite", "_IO_fread",
];

static LIBC_STRING_FUNCTIONS: &[&str] = &[
    "strlen", "strcmp", "strncmp", "strcasecmp", "strcpy", "strncpy", "strcat", "strncat",
    "strchr", "strrchr", "strstr", "strtok", "strdup", "strndup", "strspn", "strcspn", "strpbrk",
    "strcoll", "strxfrm", "strerror", "index", "rindex", "__strlen_sse2", "__strcmp_sse2",
    "__strcpy_sse2", "__strstr_sse2",
];

static LIBC_MEMORY_FUNCTIONS: &[&str] = &[
    "malloc", "free", "calloc", "realloc", "memcpy", "memmove", "memset", "memcmp", "memchr",
    "mmap", "mmap64", "munmap", "mremap", "brk", "sbrk", "posix_memalign", "aligned_alloc",
    "valloc", "pvalloc", "_int_malloc", "_int_free", "malloc_consolidate", "__memcpy_sse2",
    "__memset_sse2", "__memmove_sse2", "__memcmp_sse2",
];

pub fn libc_function_category(function_name: &str) -> LibcCategory {
    if LIBC_IO_FUNCTIONS.contains(&function_name) {
        LibcCategory::Io
    } else if LIBC_STRING_FUNCTIONS.contains(&function_name) {
        LibcCategory::String
    } else if LIBC_MEMORY_FUNCTIONS.contains(&function_name) {
        LibcCategory::Memory
    } else {
        LibcCategory::Unknown
    }
}

/// MPI functions announce themselves in the first two characters:
/// `MPI_Send`, `PMPI_Send`, `mpi_send_`, `pmpi_send_`.
pub fn is_mpi_function_name(function_name: &str) -> bool {
    ["MPI", "mpi", "PMI", "pmi"]
        .iter()
        .any(|prefix| matches!(function_name.find(*prefix), Some(0) | Some(1)))
}

/// OpenMP runtime entry points and outlined regions: `__kmp*`/`kmp*`
/// (Intel), `gomp*`/`GOMP*` (GNU), `mpcomp*` (MPC), plus the compact
/// `#omp_` names produced by the metadata writer.
pub fn is_omp_function_name(function_name: &str) -> bool {
    function_name.starts_with("__kmp")
        || function_name.starts_with("kmp")
        || function_name.starts_with("gomp")
        || function_name.starts_with("GOMP")
        || function_name.starts_with("mpcomp")
        || function_name.contains("#omp_")
}

/// Category of a sample resolved inside the executable.
pub fn categorize_binary_function(function_name: &str) -> Category {
    if is_omp_function_name(function_name) {
        Category::Openmp
    } else if is_mpi_function_name(function_name) {
        Category::Mpi
    } else {
        Category::Binary
    }
}

/// Category of a sample resolved in a library, by library name and (for
/// the libc family) function name.
pub fn categorize_library_function(library_name: &str, function_name: &str) -> Category {
    if matches_mpi_library(library_name) {
        return Category::Mpi;
    }
    if matches_omp_library(library_name) {
        return Category::Openmp;
    }
    if matches_any(library_name, MATH_LIBRARY_GLOBS) {
        return Category::Math;
    }
    if matches_any(library_name, MEMORY_LIBRARY_GLOBS) {
        return Category::Memory;
    }
    if is_libc_family(library_name) {
        return match libc_function_category(function_name) {
            LibcCategory::Io => Category::Io,
            LibcCategory::String => Category::String,
            LibcCategory::Memory => Category::Memory,
            LibcCategory::Unknown => Category::System,
        };
    }
    if matches_pthread_library(library_name) {
        return Category::Pthread;
    }
    Category::Other
}

/// Full categorization of one library/kernel sample, in rule order:
/// call-chain refinement, user extras, fixed globs, kernel fallback.
pub fn categorize_non_binary(
    library_name: Option<&str>,
    function_name: &str,
    chain_library_names: &[&str],
    is_kernel: bool,
    extra_categories: &IndexMap<String, usize>,
) -> Attribution {
    for chain_library in chain_library_names {
        if matches_mpi_library(chain_library) {
            return Attribution::Fixed(Category::Mpi);
        }
        if matches_omp_library(chain_library) {
            return Attribution::Fixed(Category::Openmp);
        }
        if matches_pthread_library(chain_library) {
            return Attribution::Fixed(Category::Pthread);
        }
    }

    if let Some(library_name) = library_name {
        if let Some(&extra) = extra_categories.get(library_name) {
            return Attribution::Extra(extra);
        }
        let category = categorize_library_function(library_name, function_name);
        if category != Category::Other || !is_kernel {
            return Attribution::Fixed(category);
        }
    }

    if is_kernel {
        return Attribution::Fixed(Category::System);
    }
    Attribution::Fixed(Category::Other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mpi_prefixes_within_first_two_chars() {
        assert!(is_mpi_function_name("MPI_Send"));
        assert!(is_mpi_function_name("PMPI_Send"));
        assert!(is_mpi_function_name("mpi_allreduce_"));
        assert!(is_mpi_function_name("pmi_barrier"));
        assert!(!is_mpi_function_name("compute_mpi_tile"));
    }

    #[test]
    fn omp_prefixes_are_leading_tokens() {
        assert!(is_omp_function_name("__kmp_invoke_microtask"));
        assert!(is_omp_function_name("GOMP_parallel"));
        assert!(is_omp_function_name("gomp_barrier_wait"));
        assert!(is_omp_function_name("mpcomp_start"));
        assert!(is_omp_function_name("solver#omp_region_3"));
        assert!(!is_omp_function_name("make_gomp_wrapper"));
    }

    #[test]
    fn binary_functions_default_to_binary() {
        assert_eq!(categorize_binary_function("main"), Category::Binary);
        assert_eq!(
            categorize_binary_function("MPI_Allreduce"),
            Category::Mpi
        );
        assert_eq!(
            categorize_binary_function("GOMP_parallel"),
            Category::Openmp
        );
    }

    #[test]
    fn library_glob_table() {
        assert_eq!(
            categorize_library_function("libmpi.so.40", "x"),
            Category::Mpi
        );
        assert_eq!(
            categorize_library_function("libiomp5.so", "x"),
            Category::Openmp
        );
        assert_eq!(
            categorize_library_function("libmkl_core.so", "x"),
            Category::Math
        );
        assert_eq!(
            categorize_library_function("libtcmalloc_minimal.so.4", "x"),
            Category::Memory
        );
        assert_eq!(
            categorize_library_function("libpthread-2.31.so", "x"),
            Category::Pthread
        );
        assert_eq!(
            categorize_library_function("libwhatever.so", "x"),
            Category::Other
        );
    }

    #[test]
    fn libc_family_splits_by_function() {
        assert_eq!(
            categorize_library_function("libc-2.31.so", "fwrite"),
            Category::Io
        );
        assert_eq!(
            categorize_library_function("libc.so.6", "strlen"),
            Category::String
        );
        assert_eq!(
            categorize_library_function("libc.so.6", "malloc"),
            Category::Memory
        );
        assert_eq!(
            categorize_library_function("ld-linux.so.2", "_dl_relocate"),
            Category::System
        );
    }

    #[test]
    fn chain_refinement_beats_library_globs() {
        let extras = IndexMap::new();
        let result = categorize_non_binary(
            Some("libc.so.6"),
            "memcpy",
            &["libmpi.so.40"],
            false,
            &extras,
        );
        assert_eq!(result, Attribution::Fixed(Category::Mpi));
    }

    #[test]
    fn extras_beat_fixed_globs() {
        let mut extras = IndexMap::new();
        extras.insert("libhdf5.so".to_string(), 0usize);
        let result =
            categorize_non_binary(Some("libhdf5.so"), "h5write", &[], false, &extras);
        assert_eq!(result, Attribution::Extra(0));
    }

    #[test]
    fn kernel_defaults_to_system() {
        let extras = IndexMap::new();
        assert_eq!(
            categorize_non_binary(None, "do_page_fault", &[], true, &extras),
            Attribution::Fixed(Category::System)
        );
        // A chain through the OpenMP runtime refines a kernel sample.
        assert_eq!(
            categorize_non_binary(None, "futex_wait", &["libiomp5.so"], true, &extras),
            Attribution::Fixed(Category::Openmp)
        );
    }

    #[test]
    fn categorization_is_deterministic() {
        let extras = IndexMap::new();
        let run = || {
            categorize_non_binary(
                Some("libm.so.6"),
                "cos",
                &["libwhatever.so"],
                false,
                &extras,
            )
        };
        assert_eq!(run(), run());
        assert_eq!(run(), Attribution::Fixed(Category::Math));
    }
}

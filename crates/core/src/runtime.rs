//! Locating ONNX Runtime, GPU runtime libraries and the ffmpeg tools.
//!
//! Bundled layouts ship these next to the executable (`lib/`, `bin/`), so
//! exe-relative directories are probed before system locations and `PATH`.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchKind {
    Libraries,
    Binaries,
}

impl SearchKind {
    fn subdir(self) -> &'static str {
        match self {
            Self::Libraries => "lib",
            Self::Binaries => "bin",
        }
    }
}

fn push_unique(dirs: &mut Vec<PathBuf>, dir: PathBuf) {
    if !dirs.contains(&dir) {
        dirs.push(dir);
    }
}

/// Directories probed in order: the exe dir (binaries, and libraries on
/// Windows), `<exe>/<sub>`, `<exe>/../<sub>`, the working dir (binaries),
/// `<cwd>/<sub>`, then system library dirs on Unix.
fn search_dirs(kind: SearchKind) -> Vec<PathBuf> {
    let sub = kind.subdir();
    let mut dirs = Vec::new();

    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            if kind == SearchKind::Binaries || cfg!(windows) {
                push_unique(&mut dirs, exe_dir.to_path_buf());
            }
            push_unique(&mut dirs, exe_dir.join(sub));
            if let Some(parent) = exe_dir.parent() {
                push_unique(&mut dirs, parent.join(sub));
            }
        }
    }

    if let Ok(cwd) = env::current_dir() {
        if kind == SearchKind::Binaries {
            push_unique(&mut dirs, cwd.clone());
        }
        push_unique(&mut dirs, cwd.join(sub));
    }

    if kind == SearchKind::Libraries && cfg!(unix) {
        push_unique(&mut dirs, PathBuf::from("/usr/local/lib"));
        push_unique(&mut dirs, PathBuf::from("/usr/lib"));
    }

    dirs
}

fn binary_names(binary: &str) -> Vec<String> {
    if cfg!(windows) && Path::new(binary).extension().is_none() {
        vec![format!("{binary}.exe"), binary.to_string()]
    } else {
        vec![binary.to_string()]
    }
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = binary_names(binary);
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// `Command` for an external tool, preferring a bundled copy over `PATH`.
pub fn command_for(binary: &str) -> Command {
    match find_binary_in_dirs(binary, &search_dirs(SearchKind::Binaries)) {
        Some(path) => Command::new(path),
        None => Command::new(binary),
    }
}

/// Load order for GPU runtime libraries: CUDA, then cuDNN, then TensorRT.
/// ONNX Runtime and its providers are left to the `ort` crate.
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    let name = name.strip_prefix("lib").unwrap_or(&name);
    const TIERS: [(u8, &[&str]); 3] = [
        (0, &["cudart", "cublas", "cufft", "curand"]),
        (1, &["cudnn"]),
        (2, &["nvinfer", "nvonnxparser"]),
    ];
    TIERS
        .iter()
        .find(|(_, prefixes)| prefixes.iter().any(|p| name.starts_with(p)))
        .map(|(tier, _)| *tier)
}

fn is_shared_library(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if cfg!(windows) {
        name.ends_with(".dll")
    } else {
        name.contains(".so") && !path.is_symlink()
    }
}

/// GPU libraries under `dirs` in load order. The first directory holding a
/// given file name wins.
fn preload_plan(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut plan: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_shared_library(&path) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(tier) = load_priority(&name) else {
                continue;
            };
            if seen.insert(name.clone()) {
                plan.push((tier, name, path));
            }
        }
    }

    plan.sort();
    plan.into_iter().map(|(_, _, path)| path).collect()
}

#[cfg(unix)]
fn load_library(path: &Path) -> bool {
    // SAFETY: loading a shared library runs its initializers; these are the
    // vendor GPU runtimes ONNX Runtime would load itself.
    match unsafe {
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    } {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
fn load_library(path: &Path) -> bool {
    // SAFETY: see the unix variant.
    match unsafe { libloading::Library::new(path) } {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// What [`setup_runtime_libs`] found, for logging once tracing is up.
#[derive(Debug, Clone, Default)]
pub struct RuntimeReport {
    /// Set by us (`true`) or inherited from the environment (`false`).
    pub ort_dylib_discovered: bool,
    pub preloaded: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Points `ORT_DYLIB_PATH` at a bundled ONNX Runtime when unset and preloads
/// GPU runtime libraries with global symbol visibility.
///
/// Call at the very start of `main()`, before any ORT use.
pub fn setup_runtime_libs() -> RuntimeReport {
    let dirs = search_dirs(SearchKind::Libraries);
    let mut report = RuntimeReport::default();

    if env::var_os(ORT_DYLIB_ENV).is_none() {
        if let Some(path) = dirs
            .iter()
            .map(|dir| dir.join(ORT_LIB_NAME))
            .find(|p| p.is_file())
        {
            env::set_var(ORT_DYLIB_ENV, &path);
            report.ort_dylib_discovered = true;
        }
    }

    for path in preload_plan(&dirs) {
        if load_library(&path) {
            report.preloaded.push(path);
        } else {
            report.failed.push(path);
        }
    }

    report
}

pub fn log_runtime_lib_status(report: &RuntimeReport) {
    match env::var(ORT_DYLIB_ENV) {
        Ok(ort) if Path::new(&ort).is_file() => {
            info!(path = %ort, discovered = report.ort_dylib_discovered, "ONNX Runtime library");
        }
        Ok(ort) => warn!(path = %ort, "ORT_DYLIB_PATH points to a missing file"),
        Err(_) => warn!("ORT_DYLIB_PATH not set, ONNX Runtime uses default search paths"),
    }

    for path in &report.preloaded {
        debug!(path = %path.display(), "Preloaded runtime library");
    }
    for path in &report.failed {
        warn!(path = %path.display(), "Failed to preload runtime library");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn library_search_ends_with_system_paths() {
        let dirs = search_dirs(SearchKind::Libraries);
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert_eq!(dirs.last(), Some(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn binary_search_includes_cwd_and_cwd_bin() {
        let dirs = search_dirs(SearchKind::Binaries);
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd));
            assert!(dirs.contains(&cwd.join("bin")));
        }
    }

    #[test]
    fn find_binary_in_dirs_prefers_first_match() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();

        let file_name = if cfg!(windows) { "ffprobe.exe" } else { "ffprobe" };
        std::fs::write(first.join(file_name), b"first").unwrap();
        std::fs::write(second.join(file_name), b"second").unwrap();

        let resolved = find_binary_in_dirs("ffprobe", &[first.clone(), second])
            .expect("binary should be resolved");
        assert_eq!(resolved, first.join(file_name));
    }

    #[test]
    fn load_priority_orders_cuda_before_cudnn_before_trt() {
        assert!(load_priority("libcudart.so.12") < load_priority("libcudnn.so.9"));
        assert!(load_priority("libcublasLt.so.12") < load_priority("libcudnn_ops.so.9"));
        assert!(load_priority("cudnn64_9.dll") < load_priority("nvinfer_10.dll"));
        assert_eq!(load_priority("libnvonnxparser.so.10"), Some(2));
    }

    #[test]
    fn load_priority_excludes_ort_and_unknown_libs() {
        assert_eq!(load_priority("libonnxruntime.so.1.23.2"), None);
        assert_eq!(load_priority("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(load_priority("libsomething_else.so"), None);
    }

    #[cfg(unix)]
    #[test]
    fn preload_plan_sorts_by_tier_and_dedups_by_name() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        for name in ["libnvinfer.so.10", "libcudnn.so.9", "libonnxruntime.so"] {
            std::fs::write(a.join(name), b"").unwrap();
        }
        std::fs::write(b.join("libcudnn.so.9"), b"").unwrap();
        std::fs::write(b.join("libcudart.so.12"), b"").unwrap();

        let plan = preload_plan(&[a.clone(), b.clone()]);
        assert_eq!(
            plan,
            vec![
                b.join("libcudart.so.12"),
                a.join("libcudnn.so.9"),
                a.join("libnvinfer.so.10"),
            ]
        );
    }
}

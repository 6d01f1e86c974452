//! Locating the external runtime pieces: the dynamically loaded ONNX Runtime
//! library and the `ffmpeg`/`ffprobe` executables.

use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

/// `<exe_dir>/<sub>`, `<exe_dir>/../<sub>` and `<cwd>/<sub>`, deduplicated,
/// in that order. An empty `sub` yields the directories themselves.
fn bundle_dirs(sub: &str) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Some(exe_dir) = env::current_exe()
        .and_then(|p| p.canonicalize())
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        push(exe_dir.join(sub));
        if let Some(parent) = exe_dir.parent() {
            push(parent.join(sub));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join(sub));
    }
    dirs
}

fn ort_search_dirs() -> Vec<PathBuf> {
    #[allow(unused_mut)]
    let mut dirs = bundle_dirs("lib");
    #[cfg(unix)]
    dirs.extend(["/usr/local/lib", "/usr/lib"].map(PathBuf::from));
    dirs
}

/// A bundled `ffmpeg` may sit next to the binary or in a `bin/` folder.
fn tool_search_dirs() -> Vec<PathBuf> {
    let mut dirs = bundle_dirs("");
    dirs.extend(bundle_dirs("bin"));
    dirs
}

fn executable_names(binary: &str) -> Vec<String> {
    if cfg!(windows) && !binary.to_ascii_lowercase().ends_with(".exe") {
        vec![format!("{binary}.exe"), binary.to_string()]
    } else {
        vec![binary.to_string()]
    }
}

fn first_file_in(dirs: &[PathBuf], names: &[String]) -> Option<PathBuf> {
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// `Command` for an external tool, preferring a bundled copy over `PATH`.
pub fn command_for(binary: &str) -> Command {
    match first_file_in(&tool_search_dirs(), &executable_names(binary)) {
        Some(path) => Command::new(path),
        None => Command::new(binary),
    }
}

/// First line of `<binary> -version`, or `None` when the tool cannot be run.
pub fn tool_version(binary: &str) -> Option<String> {
    let output = command_for(binary)
        .arg("-version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
}

/// Points `ort`'s loader at a bundled `libonnxruntime` unless
/// `ORT_DYLIB_PATH` is already set. Call first thing in `main`.
pub fn setup_runtime_libs() {
    if env::var_os(ORT_DYLIB_ENV).is_some() {
        return;
    }
    if let Some(path) = first_file_in(&ort_search_dirs(), &[ORT_LIB_NAME.to_string()]) {
        env::set_var(ORT_DYLIB_ENV, &path);
    }
}

/// Logs what [`setup_runtime_libs`] and [`command_for`] resolved. Needs
/// tracing to be initialized.
pub fn log_runtime_lib_status() {
    match env::var(ORT_DYLIB_ENV) {
        Ok(ort) if Path::new(&ort).is_file() => info!("ORT library: {ort}"),
        Ok(ort) => warn!("{ORT_DYLIB_ENV} set to {ort} but file not found"),
        Err(_) => warn!("{ORT_DYLIB_ENV} not set; ORT will try default search paths"),
    }

    for tool in ["ffmpeg", "ffprobe"] {
        match tool_version(tool) {
            Some(version) => info!("{tool}: {version}"),
            None => warn!("{tool} not found; video upload will fail until it is installed"),
        }
    }
}

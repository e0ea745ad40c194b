use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path is not representable on this platform")]
    Unrepresentable,
}

/// Conversion between portable UTF-8 paths and the filesystem's native byte
/// encoding. The separator is opaque bytes of length >= 1; it only matches at
/// offsets that are multiples of its length.
pub trait PathCodec: Send + Sync {
    fn separator(&self) -> &[u8];

    fn to_native(&self, utf8: &str) -> Vec<u8>;

    fn to_utf8(&self, native: &[u8]) -> String;

    /// UTF-8 rendering of a single native name, for callbacks and gating.
    fn to_display_name(&self, native: &[u8]) -> String {
        self.to_utf8(native)
    }

    /// Byte offset of the last path component, i.e. one past the last
    /// aligned separator (0 if the path has no separator).
    fn last_component_offset(&self, native: &[u8]) -> usize {
        let sep = self.separator();
        match rfind_separator(native, sep) {
            Some(idx) => idx + sep.len(),
            None => 0,
        }
    }
}

/// Codec for filesystems whose native encoding is byte-oriented UTF-8 with a
/// single-byte separator (Unix). `to_native` and `to_utf8` are byte-exact
/// inverses for paths that originated from the filesystem.
pub struct NativeCodec {
    separator: Vec<u8>,
}

impl NativeCodec {
    pub fn new() -> Self {
        Self {
            separator: vec![std::path::MAIN_SEPARATOR as u8],
        }
    }

    /// Codec with an arbitrary separator; used by tests exercising
    /// multi-byte separator alignment.
    pub fn with_separator(separator: Vec<u8>) -> Self {
        Self { separator }
    }
}

impl Default for NativeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PathCodec for NativeCodec {
    fn separator(&self) -> &[u8] {
        &self.separator
    }

    fn to_native(&self, utf8: &str) -> Vec<u8> {
        utf8.as_bytes().to_vec()
    }

    fn to_utf8(&self, native: &[u8]) -> String {
        String::from_utf8_lossy(native).into_owned()
    }
}

/// First aligned occurrence of `sep` in `hay` at or after `from`.
pub fn find_separator(hay: &[u8], sep: &[u8], from: usize) -> Option<usize> {
    if sep.is_empty() {
        return None;
    }
    let mut idx = from.next_multiple_of(sep.len());
    while idx + sep.len() <= hay.len() {
        if &hay[idx..idx + sep.len()] == sep {
            return Some(idx);
        }
        idx += sep.len();
    }
    None
}

/// Last aligned occurrence of `sep` in `hay`.
pub fn rfind_separator(hay: &[u8], sep: &[u8]) -> Option<usize> {
    let mut found = None;
    let mut from = 0;
    while let Some(idx) = find_separator(hay, sep, from) {
        found = Some(idx);
        from = idx + sep.len();
    }
    found
}

/// Whether `path` equals `prefix` or extends it across a separator boundary.
/// Used to keep scans out of the debris folder.
pub fn within(path: &[u8], prefix: &[u8], sep: &[u8]) -> bool {
    if path.len() < prefix.len() || &path[..prefix.len()] != prefix {
        return false;
    }
    path.len() == prefix.len()
        || (path.len() >= prefix.len() + sep.len() && &path[prefix.len()..prefix.len() + sep.len()] == sep)
}

/// Join a native directory path and a native name with the separator.
pub fn join(dir: &[u8], name: &[u8], sep: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(dir.len() + sep.len() + name.len());
    out.extend_from_slice(dir);
    if !dir.is_empty() {
        out.extend_from_slice(sep);
    }
    out.extend_from_slice(name);
    out
}

/// Native bytes of a `Path`, for watcher events crossing into the engine.
pub fn path_to_native(path: &Path) -> Result<Vec<u8>, PathError> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        Ok(path.as_os_str().as_bytes().to_vec())
    }
    #[cfg(not(unix))]
    {
        path.to_str()
            .map(|s| s.as_bytes().to_vec())
            .ok_or(PathError::Unrepresentable)
    }
}

/// `PathBuf` from native bytes, for handing paths to `std::fs`.
pub fn native_to_path(native: &[u8]) -> Result<PathBuf, PathError> {
    if native.is_empty() {
        return Err(PathError::Empty);
    }
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        Ok(PathBuf::from(std::ffi::OsStr::from_bytes(native)))
    }
    #[cfg(not(unix))]
    {
        std::str::from_utf8(native)
            .map(PathBuf::from)
            .map_err(|_| PathError::Unrepresentable)
    }
}

//! Dynamic library loading and symbol resolution
//!
//! Platform-agnostic wrapper around dlopen/LoadLibrary via `libloading`.
//! Handles are reference counted: function descriptors keep their library
//! loaded for as long as they exist.

use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{FfiError, Result};

#[cfg(unix)]
use libloading::os::unix::Library as RawLibrary;
#[cfg(windows)]
use libloading::os::windows::Library as RawLibrary;

struct Handle {
    raw: RawLibrary,
    path: Option<PathBuf>,
}

/// Handle to a dynamically loaded library
#[derive(Clone)]
pub struct Library {
    handle: Arc<Handle>,
}

impl Library {
    /// Load library by name or path
    ///
    /// Bare names go through the platform search paths.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = unsafe { RawLibrary::new(path) }.map_err(|err| {
            FfiError::resolution(format!("Failed to load shared library '{}': {}", path.display(), err))
        })?;

        Ok(Self {
            handle: Arc::new(Handle {
                raw,
                path: Some(path.to_path_buf()),
            }),
        })
    }

    /// The running executable and the libraries it already loaded
    pub fn this() -> Result<Self> {
        #[cfg(unix)]
        let raw = RawLibrary::this();
        #[cfg(windows)]
        let raw = RawLibrary::this()?;

        Ok(Self {
            handle: Arc::new(Handle { raw, path: None }),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.handle.path.as_deref()
    }

    /// Entry address of symbol `name`
    pub fn symbol(&self, name: &str) -> Result<usize> {
        let not_found = |detail: String| {
            FfiError::resolution(format!("Cannot find symbol '{}' in shared library: {}", name, detail))
        };

        let symbol = unsafe { self.handle.raw.get::<*mut c_void>(name.as_bytes()) }
            .map_err(|err| not_found(err.to_string()))?;
        let address = *symbol as usize;

        if address == 0 {
            return Err(not_found("null address".into()));
        }
        Ok(address)
    }

    /// Entry address of the export with ordinal `ordinal`
    #[cfg(windows)]
    pub fn ordinal(&self, ordinal: u16) -> Result<usize> {
        let symbol = unsafe { self.handle.raw.get_ordinal::<*mut c_void>(ordinal) }.map_err(|err| {
            FfiError::resolution(format!("Cannot find ordinal {} in shared library: {}", ordinal, err))
        })?;
        Ok(*symbol as usize)
    }

    /// Ordinal lookup only exists on Windows
    #[cfg(not(windows))]
    pub fn ordinal(&self, ordinal: u16) -> Result<usize> {
        Err(FfiError::resolution(format!(
            "Ordinal exports ({}) are only supported on Windows",
            ordinal
        )))
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library").field("path", &self.handle.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_missing_library() {
        let err = Library::load("/nonexistent/libdynffi-missing.so").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
    }

    #[cfg(unix)]
    #[test]
    fn test_process_symbols() {
        let lib = Library::this().unwrap();
        assert!(lib.symbol("malloc").unwrap() != 0);
        assert!(lib.path().is_none());

        let err = lib.symbol("dynffi_no_such_symbol_42").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
    }

    #[cfg(not(windows))]
    #[test]
    fn test_ordinal_unsupported() {
        let lib = Library::this().unwrap();
        assert_eq!(lib.ordinal(1).unwrap_err().kind(), ErrorKind::Resolution);
    }
}

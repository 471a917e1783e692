//! Environment construction for launched children.
//!
//! `execve` wants a NULL-terminated array of `KEY=VALUE` C strings. The array
//! is built in the parent before forking, because the child may not allocate.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString, OsStr, OsString};
use std::io;
use std::os::raw::c_char;
use std::os::unix::ffi::{OsStrExt, OsStringExt};

/// Environment changes applied on top of the current process environment.
///
/// A non-empty value sets or overrides the variable; an empty value removes it.
pub type EnvironmentMap = BTreeMap<String, String>;

/// Owned `KEY=VALUE` strings plus the NULL-terminated pointer array `execve`
/// consumes.
#[derive(Debug)]
pub struct EnvironmentArray {
    entries: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl EnvironmentArray {
    /// Use the given `KEY=VALUE` entries verbatim.
    pub fn from_entries<I, S>(entries: I) -> io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut owned = Vec::new();
        for entry in entries {
            let entry = entry.as_ref();
            if !entry.contains('=') {
                return Err(invalid(format!(
                    "environment entry {:?} is not KEY=VALUE",
                    entry
                )));
            }
            owned.push(to_cstring(entry.as_bytes())?);
        }
        Ok(Self::from_cstrings(owned))
    }

    fn from_cstrings(entries: Vec<CString>) -> Self {
        let mut ptrs: Vec<*const c_char> = entries.iter().map(|e| e.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        Self { entries, ptrs }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CStr> {
        self.entries.iter().map(|e| e.as_c_str())
    }

    /// Look up a variable's value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find_map(|entry| {
            let text = entry.to_str().ok()?;
            let (k, v) = text.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// Pointer suitable for the `envp` argument of `execve`.
    ///
    /// Valid for as long as `self` is alive and unmodified.
    pub fn as_ptr(&self) -> *const *const c_char {
        self.ptrs.as_ptr()
    }
}

/// Merge `changes` into the current process environment.
pub fn build_environment_array(changes: &EnvironmentMap) -> io::Result<EnvironmentArray> {
    let mut merged: BTreeMap<OsString, OsString> = std::env::vars_os().collect();

    for (key, value) in changes {
        if key.is_empty() || key.contains('=') {
            return Err(invalid(format!("invalid environment variable name {:?}", key)));
        }
        if value.is_empty() {
            merged.remove(OsStr::new(key));
        } else {
            merged.insert(OsString::from(key), OsString::from(value));
        }
    }

    let mut entries = Vec::with_capacity(merged.len());
    for (key, value) in merged {
        let mut bytes = key.into_vec();
        bytes.push(b'=');
        bytes.extend_from_slice(value.as_bytes());
        entries.push(to_cstring(&bytes)?);
    }

    Ok(EnvironmentArray::from_cstrings(entries))
}

fn to_cstring(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|_| invalid("environment entry contains a NUL byte".to_string()))
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}

//! C-linkage entry points.
//!
//! Every function checks its pointers, decodes UTF-8 and catches panics, so
//! bad input yields the failure value (`false`, null, `-1`) instead of
//! undefined behaviour. Errors are reported through `tracing`.
//!
//! Strings returned by [`ListDylibs`] are owned by Rust and must be released
//! with [`FreeDylibList`].

#![allow(non_snake_case)]

use crate::builder::ZSign;
use crate::macho;
use crate::{Error, Result};
use std::ffi::{c_char, c_int, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use tracing::error;

/// Borrow a required string argument.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string that outlives `'a`.
unsafe fn required<'a>(ptr: *const c_char, name: &str) -> Result<&'a str> {
    match optional(ptr, name)? {
        Some(s) => Ok(s),
        None => Err(Error::InvalidArgument(format!("{name} is null or empty"))),
    }
}

/// Borrow an optional string argument; null and `""` are both `None`.
///
/// # Safety
///
/// Same as [`required`].
unsafe fn optional<'a>(ptr: *const c_char, name: &str) -> Result<Option<&'a str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    let s = CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| Error::InvalidArgument(format!("{name} is not valid UTF-8")))?;
    Ok((!s.is_empty()).then_some(s))
}

/// Run `f`, turning errors and panics into `fallback`.
fn guard<T>(call: &str, fallback: T, f: impl FnOnce() -> Result<T>) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            error!(call, error = %e, "call failed");
            fallback
        }
        Err(_) => {
            error!(call, "call panicked");
            fallback
        }
    }
}

/// Add a load command for `dylib_path` to the binary at `file_path`.
///
/// `file_path` may be a Mach-O file or an app bundle directory.
///
/// # Safety
///
/// Pointer arguments must be null or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn InjectDyLib(
    file_path: *const c_char,
    dylib_path: *const c_char,
    weak_inject: bool,
) -> bool {
    guard("InjectDyLib", false, || {
        let file = required(file_path, "file_path")?;
        let dylib = required(dylib_path, "dylib_path")?;
        macho::inject_dylib(file, dylib, weak_inject)?;
        Ok(true)
    })
}

/// Remove the load commands for `count` paths from the binary at
/// `file_path`. Fails when none of them is referenced.
///
/// # Safety
///
/// `dylib_paths` must be null or point to `count` string pointers, each null
/// or a valid NUL-terminated string. Null entries are skipped.
#[no_mangle]
pub unsafe extern "C" fn UninstallDylibs(
    file_path: *const c_char,
    dylib_paths: *const *const c_char,
    count: usize,
) -> bool {
    guard("UninstallDylibs", false, || {
        let file = required(file_path, "file_path")?;
        if dylib_paths.is_null() || count == 0 {
            return Err(Error::InvalidArgument("no dylib paths".into()));
        }
        let mut paths = Vec::with_capacity(count);
        for &p in std::slice::from_raw_parts(dylib_paths, count) {
            if let Some(path) = optional(p, "dylib_paths")? {
                paths.push(path);
            }
        }
        macho::uninstall_dylibs(file, &paths)?;
        Ok(true)
    })
}

/// List the dependency paths of the binary at `file_path`.
///
/// Returns an array of `*out_count` strings, or null on failure with
/// `*out_count` set to 0. An empty list is a non-null array of length 0.
///
/// # Safety
///
/// `file_path` must be null or a valid NUL-terminated string; `out_count`
/// must be null or writable. The result must be passed to [`FreeDylibList`].
#[no_mangle]
pub unsafe extern "C" fn ListDylibs(
    file_path: *const c_char,
    out_count: *mut usize,
) -> *mut *mut c_char {
    if !out_count.is_null() {
        *out_count = 0;
    }
    let list = guard("ListDylibs", None, || {
        let file = required(file_path, "file_path")?;
        let paths = macho::list_dylibs(file)?
            .into_iter()
            .map(|p| CString::new(p).map_err(|e| Error::macho(e.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(paths))
    });

    let Some(list) = list else {
        return ptr::null_mut();
    };
    if !out_count.is_null() {
        *out_count = list.len();
    }
    let raw: Box<[*mut c_char]> = list.into_iter().map(CString::into_raw).collect();
    Box::into_raw(raw) as *mut *mut c_char
}

/// Release a list returned by [`ListDylibs`].
///
/// # Safety
///
/// `list` and `count` must come from one [`ListDylibs`] call, and the list
/// must not be used afterwards. Null is ignored.
#[no_mangle]
pub unsafe extern "C" fn FreeDylibList(list: *mut *mut c_char, count: usize) {
    if list.is_null() {
        return;
    }
    let raw = Box::from_raw(ptr::slice_from_raw_parts_mut(list, count));
    for &s in raw.iter() {
        if !s.is_null() {
            drop(CString::from_raw(s));
        }
    }
}

/// Rename the dependency `old_path` to `new_path` in the binary at
/// `file_path`.
///
/// # Safety
///
/// Pointer arguments must be null or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn ChangeDylibPath(
    file_path: *const c_char,
    old_path: *const c_char,
    new_path: *const c_char,
) -> bool {
    guard("ChangeDylibPath", false, || {
        let file = required(file_path, "file_path")?;
        let old = required(old_path, "old_path")?;
        let new = required(new_path, "new_path")?;
        macho::change_dylib_path(file, old, new)?;
        Ok(true)
    })
}

/// Re-sign the app at `app` in place. Returns 0 on success, -1 on failure.
///
/// `app` is an `.app`, a directory with `Payload/*.app`, or an `.ipa`.
/// `key` is a PKCS#12 container or a PEM file holding key and certificate,
/// unlocked with `pass`; it is ignored when `adhoc` is set. `prov`,
/// `bundleid`, `displayname` and `bundleversion` may be null or empty.
///
/// # Safety
///
/// Pointer arguments must be null or valid NUL-terminated strings.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn zsign(
    app: *const c_char,
    prov: *const c_char,
    key: *const c_char,
    pass: *const c_char,
    bundleid: *const c_char,
    displayname: *const c_char,
    bundleversion: *const c_char,
    adhoc: bool,
    dontGenerateEmbeddedMobileProvision: bool,
) -> c_int {
    guard("zsign", -1, || {
        let app = required(app, "app")?;
        let mut signer = ZSign::new()
            .adhoc(adhoc)
            .embed_profile(!dontGenerateEmbeddedMobileProvision);

        if !adhoc {
            signer = signer.private_key(required(key, "key")?);
            if let Some(pass) = optional(pass, "pass")? {
                signer = signer.password(pass);
            }
        }
        if let Some(prov) = optional(prov, "prov")? {
            signer = signer.provisioning_profile(prov);
        }
        if let Some(id) = optional(bundleid, "bundleid")? {
            signer = signer.bundle_id(id);
        }
        if let Some(name) = optional(displayname, "displayname")? {
            signer = signer.display_name(name);
        }
        if let Some(version) = optional(bundleversion, "bundleversion")? {
            signer = signer.bundle_version(version);
        }

        signer.sign(app, None)?;
        Ok(0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::testutil::MachOBuilder;
    use plist::{Dictionary, Value};
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    fn c_path(path: &Path) -> CString {
        c(path.to_str().unwrap())
    }

    unsafe fn list(path: &CString) -> Vec<String> {
        let mut count = 0usize;
        let raw = ListDylibs(path.as_ptr(), &mut count);
        assert!(!raw.is_null());
        let out = std::slice::from_raw_parts(raw, count)
            .iter()
            .map(|&s| CStr::from_ptr(s).to_str().unwrap().to_string())
            .collect();
        FreeDylibList(raw, count);
        out
    }

    #[test]
    fn test_null_and_empty_arguments() {
        let empty = c("");
        let dylib = c("@rpath/Tweak.dylib");
        unsafe {
            assert!(!InjectDyLib(ptr::null(), dylib.as_ptr(), false));
            assert!(!InjectDyLib(empty.as_ptr(), dylib.as_ptr(), false));
            assert!(!UninstallDylibs(ptr::null(), ptr::null(), 0));
            assert!(!ChangeDylibPath(empty.as_ptr(), dylib.as_ptr(), dylib.as_ptr()));

            let mut count = 7usize;
            assert!(ListDylibs(ptr::null(), &mut count).is_null());
            assert_eq!(count, 0);
            assert!(ListDylibs(empty.as_ptr(), ptr::null_mut()).is_null());
            FreeDylibList(ptr::null_mut(), 0);

            let nulls = [ptr::null::<c_char>(); 9];
            assert_eq!(
                zsign(nulls[0], nulls[1], nulls[2], nulls[3], nulls[4], nulls[5], nulls[6], true, false),
                -1
            );
        }
    }

    #[test]
    fn test_invalid_utf8() {
        let bad = CString::new(vec![0xff, 0xfe]).unwrap();
        let dylib = c("@rpath/Tweak.dylib");
        unsafe {
            assert!(!InjectDyLib(bad.as_ptr(), dylib.as_ptr(), false));
        }
    }

    #[test]
    fn test_inject_list_uninstall() {
        let dir = tempdir().unwrap();
        let binary = dir.path().join("App");
        fs::write(&binary, MachOBuilder::new().build()).unwrap();
        let path = c_path(&binary);
        let tweak = c("@executable_path/Tweak.dylib");

        unsafe {
            assert!(InjectDyLib(path.as_ptr(), tweak.as_ptr(), true));
            assert!(list(&path).contains(&"@executable_path/Tweak.dylib".to_string()));

            let renamed = c("@rpath/Tweak.dylib");
            assert!(ChangeDylibPath(path.as_ptr(), tweak.as_ptr(), renamed.as_ptr()));
            assert!(!ChangeDylibPath(path.as_ptr(), tweak.as_ptr(), renamed.as_ptr()));

            let paths = [renamed.as_ptr(), ptr::null()];
            assert!(UninstallDylibs(path.as_ptr(), paths.as_ptr(), paths.len()));
            assert!(!list(&path).contains(&"@rpath/Tweak.dylib".to_string()));
            assert!(!UninstallDylibs(path.as_ptr(), paths.as_ptr(), paths.len()));
        }
    }

    #[test]
    fn test_list_missing_file() {
        let dir = tempdir().unwrap();
        let path = c_path(&dir.path().join("missing"));
        let mut count = 3usize;
        unsafe {
            assert!(ListDylibs(path.as_ptr(), &mut count).is_null());
        }
        assert_eq!(count, 0);
    }

    #[test]
    fn test_zsign_adhoc() {
        let dir = tempdir().unwrap();
        let app = dir.path().join("Demo.app");
        fs::create_dir_all(&app).unwrap();
        let mut d = Dictionary::new();
        d.insert("CFBundleIdentifier".into(), Value::String("com.example.demo".into()));
        d.insert("CFBundleExecutable".into(), Value::String("Demo".into()));
        Value::Dictionary(d).to_file_xml(app.join("Info.plist")).unwrap();
        fs::write(app.join("Demo"), MachOBuilder::new().build()).unwrap();

        let app_path = c_path(&app);
        let version = c("3.1");
        let empty = c("");
        let status = unsafe {
            zsign(
                app_path.as_ptr(),
                ptr::null(),
                ptr::null(),
                ptr::null(),
                empty.as_ptr(),
                ptr::null(),
                version.as_ptr(),
                true,
                true,
            )
        };
        assert_eq!(status, 0);
        assert!(app.join("_CodeSignature/CodeResources").is_file());
        assert!(!app.join("embedded.mobileprovision").exists());

        let info = crate::bundle::InfoPlist::load(&app).unwrap();
        assert_eq!(info.get("CFBundleVersion"), Some("3.1"));
        assert_eq!(info.bundle_identifier(), Some("com.example.demo"));
    }

    #[test]
    fn test_zsign_needs_key_unless_adhoc() {
        let dir = tempdir().unwrap();
        let app = c_path(&dir.path().join("Demo.app"));
        let status = unsafe {
            zsign(
                app.as_ptr(),
                ptr::null(),
                ptr::null(),
                ptr::null(),
                ptr::null(),
                ptr::null(),
                ptr::null(),
                false,
                false,
            )
        };
        assert_eq!(status, -1);
    }
}

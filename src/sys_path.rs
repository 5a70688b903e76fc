//! Kernel-native ↔ drive-letter path translation.
//!
//! The drive table comes from the process's device map and is re-queried
//! on every conversion: the map can change under us (network drives come
//! and go) and a stale cache silently misroutes paths. Conversion is pure
//! string work; no symbolic link is ever followed.

use crate::nt::{DriveEntry, Kernel};

const OBJECT_PREFIX: &str = "\\??\\";
const UNC_PREFIX: &str = "\\??\\UNC\\";
const REDIRECTOR_PREFIX: &str = "\\Device\\LanmanRedirector\\";
const LOCAL_DEVICE_PREFIX: &str = "\\\\.\\";

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn is_drive_letter(b: u8) -> bool {
    b.is_ascii_alphabetic()
}

/// Convert a kernel-native path to user-visible drive-letter form.
pub fn to_dos(kernel: &dyn Kernel, native: &str) -> Option<String> {
    // \??\UNC\server\share\… → \\server\share\…
    if starts_with_ignore_case(native, UNC_PREFIX) {
        return Some(format!("\\\\{}", &native[UNC_PREFIX.len()..]));
    }
    // \??\X:\… → X:\…
    if starts_with_ignore_case(native, OBJECT_PREFIX) {
        let rest = &native[OBJECT_PREFIX.len()..];
        let bytes = rest.as_bytes();
        if bytes.len() >= 2 && is_drive_letter(bytes[0]) && bytes[1] == b':' {
            return Some(rest.to_string());
        }
        return None;
    }
    // \Device\LanmanRedirector\server\share\… → \\server\share\…
    if starts_with_ignore_case(native, REDIRECTOR_PREFIX) {
        return Some(format!("\\\\{}", &native[REDIRECTOR_PREFIX.len()..]));
    }
    // \Device\HarddiskVolumeN\… → the drive whose device-map target
    // prefixes the path.
    if starts_with_ignore_case(native, "\\Device\\") {
        for DriveEntry { letter, target } in kernel.device_map().ok()? {
            if starts_with_ignore_case(native, &target) {
                let rest = &native[target.len()..];
                if rest.is_empty() || rest.starts_with('\\') {
                    return Some(format!("{}:{}", letter as char, rest));
                }
            }
        }
    }
    None
}

/// Convert a user-visible path to kernel-native form.
pub fn to_native(dos: &str) -> Option<String> {
    // Already native.
    if starts_with_ignore_case(dos, OBJECT_PREFIX) {
        return Some(dos.to_string());
    }
    // \\.\foo → \??\foo
    if starts_with_ignore_case(dos, LOCAL_DEVICE_PREFIX) {
        return Some(format!(
            "{}{}",
            OBJECT_PREFIX,
            &dos[LOCAL_DEVICE_PREFIX.len()..]
        ));
    }
    // \\server\share\… → \??\UNC\server\share\…
    if dos.starts_with("\\\\") {
        return Some(format!("{}{}", UNC_PREFIX, &dos[2..]));
    }
    // X:\…  (also a bare "X:")
    let bytes = dos.as_bytes();
    if bytes.len() >= 2 && is_drive_letter(bytes[0]) && bytes[1] == b':' {
        return Some(format!("{}{}", OBJECT_PREFIX, dos));
    }
    // Relative paths have no native form.
    None
}

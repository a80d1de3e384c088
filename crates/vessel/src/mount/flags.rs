//! Mount option string codec.
//!
//! Mount points carry their options as a list of string tokens so the plan
//! can be inspected and serialized; the mounters translate tokens to kernel
//! flag bits just before issuing `mount(2)`. Tokens the codec does not
//! recognize pass through unchanged and end up comma-joined in the kernel
//! data string.

use vessel_common::{VesselError, VesselResult};

/// `MS_RDONLY`
pub const MS_RDONLY: u64 = libc::MS_RDONLY as u64;
/// `MS_NOSUID`
pub const MS_NOSUID: u64 = libc::MS_NOSUID as u64;
/// `MS_NODEV`
pub const MS_NODEV: u64 = libc::MS_NODEV as u64;
/// `MS_NOEXEC`
pub const MS_NOEXEC: u64 = libc::MS_NOEXEC as u64;
/// `MS_SYNCHRONOUS`
pub const MS_SYNCHRONOUS: u64 = libc::MS_SYNCHRONOUS as u64;
/// `MS_REMOUNT`
pub const MS_REMOUNT: u64 = libc::MS_REMOUNT as u64;
/// `MS_DIRSYNC`
pub const MS_DIRSYNC: u64 = libc::MS_DIRSYNC as u64;
/// `MS_NOATIME`
pub const MS_NOATIME: u64 = libc::MS_NOATIME as u64;
/// `MS_BIND`
pub const MS_BIND: u64 = libc::MS_BIND as u64;
/// `MS_REC`
pub const MS_REC: u64 = libc::MS_REC as u64;
/// `MS_PRIVATE`
pub const MS_PRIVATE: u64 = libc::MS_PRIVATE as u64;
/// `MS_SLAVE`
pub const MS_SLAVE: u64 = libc::MS_SLAVE as u64;
/// `MS_SHARED`
pub const MS_SHARED: u64 = libc::MS_SHARED as u64;
/// `MS_UNBINDABLE`
pub const MS_UNBINDABLE: u64 = libc::MS_UNBINDABLE as u64;
/// `MS_RELATIME`
pub const MS_RELATIME: u64 = libc::MS_RELATIME as u64;
/// `MS_STRICTATIME`
pub const MS_STRICTATIME: u64 = libc::MS_STRICTATIME as u64;

/// Token table in emission order.
///
/// Compound tokens (`rbind`, `rprivate`, ...) come before their plain
/// counterparts so [`options_from_flags`] consumes `MS_REC` together with
/// the flag it modifies. Tokens mapping to zero (`rw`, `async`, ...) name
/// kernel defaults and are accepted but never emitted.
const OPTION_TOKENS: &[(&str, u64)] = &[
    ("rbind", MS_BIND | MS_REC),
    ("bind", MS_BIND),
    ("ro", MS_RDONLY),
    ("rw", 0),
    ("nosuid", MS_NOSUID),
    ("nodev", MS_NODEV),
    ("noexec", MS_NOEXEC),
    ("sync", MS_SYNCHRONOUS),
    ("async", 0),
    ("remount", MS_REMOUNT),
    ("rprivate", MS_PRIVATE | MS_REC),
    ("private", MS_PRIVATE),
    ("rslave", MS_SLAVE | MS_REC),
    ("slave", MS_SLAVE),
    ("rshared", MS_SHARED | MS_REC),
    ("shared", MS_SHARED),
    ("runbindable", MS_UNBINDABLE | MS_REC),
    ("unbindable", MS_UNBINDABLE),
    ("dirsync", MS_DIRSYNC),
    ("atime", 0),
    ("noatime", MS_NOATIME),
    ("relatime", MS_RELATIME),
    ("norelatime", 0),
    ("strictatime", MS_STRICTATIME),
    ("nostrictatime", 0),
];

/// Translate option tokens into kernel mount flags plus the passthrough
/// tokens destined for the kernel data string.
#[must_use]
pub fn convert_options(options: &[String]) -> (u64, Vec<String>) {
    let mut flags = 0u64;
    let mut passthrough = Vec::new();

    for option in options {
        match OPTION_TOKENS.iter().find(|(tok, _)| tok == option) {
            Some((_, bits)) => flags |= bits,
            None => passthrough.push(option.clone()),
        }
    }
    (flags, passthrough)
}

/// Translate kernel mount flags back into canonical option tokens,
/// appending the passthrough tokens unchanged.
///
/// Inverse of [`convert_options`] over every flag value that function can
/// produce.
#[must_use]
pub fn options_from_flags(flags: u64, passthrough: &[String]) -> Vec<String> {
    let mut remaining = flags;
    let mut options = Vec::new();

    for (token, bits) in OPTION_TOKENS {
        if *bits != 0 && remaining & bits == *bits {
            options.push((*token).to_string());
            remaining &= !bits;
        }
    }
    options.extend(passthrough.iter().cloned());
    options
}

/// Read the `offset=<bytes>` internal option, if present.
///
/// Presence of an offset marks a mount point as loop-device backed.
///
/// # Errors
///
/// Returns [`VesselError::InvalidOption`] on a malformed numeric value.
pub fn offset(internal_options: &[String]) -> VesselResult<Option<u64>> {
    parse_internal(internal_options, "offset")
}

/// Read the `sizelimit=<bytes>` internal option, if present.
///
/// # Errors
///
/// Returns [`VesselError::InvalidOption`] on a malformed numeric value.
pub fn size_limit(internal_options: &[String]) -> VesselResult<Option<u64>> {
    parse_internal(internal_options, "sizelimit")
}

fn parse_internal(options: &[String], key: &str) -> VesselResult<Option<u64>> {
    for option in options {
        if let Some(value) = option
            .strip_prefix(key)
            .and_then(|rest| rest.strip_prefix('='))
        {
            return value
                .parse::<u64>()
                .map(Some)
                .map_err(|_| VesselError::InvalidOption {
                    option: option.clone(),
                });
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| (*t).to_string()).collect()
    }

    #[test]
    fn convert_known_tokens() {
        let (flags, passthrough) = convert_options(&opts(&["ro", "nosuid", "nodev"]));
        assert_eq!(flags, MS_RDONLY | MS_NOSUID | MS_NODEV);
        assert!(passthrough.is_empty());
    }

    #[test]
    fn unknown_tokens_pass_through() {
        let (flags, passthrough) = convert_options(&opts(&["bind", "mode=1777", "size=16m"]));
        assert_eq!(flags, MS_BIND);
        assert_eq!(passthrough, opts(&["mode=1777", "size=16m"]));
    }

    #[test]
    fn compound_tokens() {
        let (flags, _) = convert_options(&opts(&["rbind", "rprivate"]));
        assert_eq!(flags, MS_BIND | MS_REC | MS_PRIVATE);
    }

    #[test]
    fn zero_tokens_accepted() {
        let (flags, passthrough) = convert_options(&opts(&["rw", "async", "atime"]));
        assert_eq!(flags, 0);
        assert!(passthrough.is_empty());
    }

    #[test]
    fn round_trip() {
        for tokens in [
            vec!["ro", "nosuid", "nodev", "noexec"],
            vec!["rbind", "nosuid"],
            vec!["bind", "remount", "ro"],
            vec!["rslave", "noatime", "lowerdir=/a:/b"],
        ] {
            let (flags, passthrough) = convert_options(&opts(&tokens));
            let rebuilt = options_from_flags(flags, &passthrough);
            let (flags2, passthrough2) = convert_options(&rebuilt);
            assert_eq!(flags, flags2, "flags diverged for {tokens:?}");
            assert_eq!(passthrough, passthrough2, "passthrough diverged for {tokens:?}");
        }
    }

    #[test]
    fn offset_parses() {
        let internal = opts(&["offset=4096", "sizelimit=1048576"]);
        assert_eq!(offset(&internal).unwrap(), Some(4096));
        assert_eq!(size_limit(&internal).unwrap(), Some(1_048_576));
    }

    #[test]
    fn offset_absent() {
        assert_eq!(offset(&opts(&["sizelimit=1"])).unwrap(), None);
        assert_eq!(size_limit(&[]).unwrap(), None);
    }

    #[test]
    fn malformed_offset_rejected() {
        let err = offset(&opts(&["offset=4k"])).unwrap_err();
        assert!(matches!(err, VesselError::InvalidOption { .. }));
    }
}

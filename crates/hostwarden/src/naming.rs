//! Shared naming rules for agent-managed resources.
//!
//! A tenant uuid is 16 lowercase hex characters. The same `hw-` prefixed
//! name is used for the managed container, the OS user, and the hosted
//! directory, so every subsystem correlates resources through one rule.

use std::path::{Path, PathBuf};

/// Prefix reserved for agent-managed containers, users, and directories.
pub const MANAGED_PREFIX: &str = "hw-";

/// Length of a tenant uuid (lowercase hex).
pub const UUID_LEN: usize = 16;

/// Check that a tenant uuid is exactly 16 lowercase hex characters.
pub fn is_valid_uuid(uuid: &str) -> bool {
    uuid.len() == UUID_LEN
        && uuid
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// The managed name (container name, OS username, directory name) for a uuid.
pub fn managed_name(uuid: &str) -> String {
    format!("{MANAGED_PREFIX}{uuid}")
}

/// Extract the tenant uuid from a managed name.
///
/// Accepts a leading `/` (the runtime reports names that way) and returns
/// `None` for anything that does not follow the `hw-<16 hex>` rule.
pub fn extract_uuid(name: &str) -> Option<&str> {
    let name = name.strip_prefix('/').unwrap_or(name);
    let uuid = name.strip_prefix(MANAGED_PREFIX)?;
    if is_valid_uuid(uuid) { Some(uuid) } else { None }
}

/// Per-tenant home directory under the hosted root.
pub fn home_dir(hosted_root: &Path, uuid: &str) -> PathBuf {
    hosted_root.join(managed_name(uuid))
}

/// Per-tenant data directory (the bind-mount source for the container).
pub fn data_dir(hosted_root: &Path, uuid: &str) -> PathBuf {
    home_dir(hosted_root, uuid).join("data")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_uuids() {
        assert!(is_valid_uuid("0123456789abcdef"));
        assert!(is_valid_uuid("ffffffffffffffff"));
    }

    #[test]
    fn invalid_uuids() {
        assert!(!is_valid_uuid(""));
        assert!(!is_valid_uuid("0123456789abcde")); // too short
        assert!(!is_valid_uuid("0123456789abcdef0")); // too long
        assert!(!is_valid_uuid("0123456789ABCDEF")); // uppercase
        assert!(!is_valid_uuid("0123456789abcdeg")); // non-hex
    }

    #[test]
    fn managed_name_round_trip() {
        let name = managed_name("0123456789abcdef");
        assert_eq!(name, "hw-0123456789abcdef");
        assert_eq!(extract_uuid(&name), Some("0123456789abcdef"));
        assert_eq!(extract_uuid("/hw-0123456789abcdef"), Some("0123456789abcdef"));
    }

    #[test]
    fn extract_rejects_foreign_names() {
        assert_eq!(extract_uuid("nginx"), None);
        assert_eq!(extract_uuid("hw-"), None);
        assert_eq!(extract_uuid("hw-not-a-uuid"), None);
        assert_eq!(extract_uuid("other-0123456789abcdef"), None);
        // prefix must match exactly, not merely appear in the name
        assert_eq!(extract_uuid("xhw-0123456789abcdef"), None);
    }

    #[test]
    fn data_dir_layout() {
        let dir = data_dir(Path::new("/var/lib/hostwarden/hosted"), "0123456789abcdef");
        assert_eq!(
            dir,
            PathBuf::from("/var/lib/hostwarden/hosted/hw-0123456789abcdef/data")
        );
    }
}

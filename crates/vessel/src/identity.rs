//! User/group database access and container identity-file synthesis.
//!
//! When the engine runs for a user the container image knows nothing
//! about, the assembler synthesizes `/etc/passwd` and `/etc/group` files
//! merging the image's entries with the invoking user's identity, then
//! bind-mounts them into place.

use std::path::Path;

use vessel_common::{VesselError, VesselResult};

/// One `/etc/passwd` entry.
#[derive(Debug, Clone)]
pub struct PwEntry {
    /// Login name.
    pub name: String,
    /// User ID.
    pub uid: u32,
    /// Primary group ID.
    pub gid: u32,
    /// GECOS field.
    pub gecos: String,
    /// Home directory.
    pub dir: String,
    /// Login shell.
    pub shell: String,
}

/// One `/etc/group` entry.
#[derive(Debug, Clone)]
pub struct GroupEntry {
    /// Group name.
    pub name: String,
    /// Group ID.
    pub gid: u32,
    /// Member login names.
    pub members: Vec<String>,
}

/// Look up a user by UID in the host user database.
pub fn user_by_uid(uid: u32) -> VesselResult<Option<PwEntry>> {
    let content = std::fs::read_to_string("/etc/passwd")?;
    Ok(parse_passwd(&content).into_iter().find(|pw| pw.uid == uid))
}

/// Look up a group by name in the host group database.
pub fn group_by_name(name: &str) -> VesselResult<Option<GroupEntry>> {
    let content = std::fs::read_to_string("/etc/group")?;
    Ok(parse_group(&content).into_iter().find(|gr| gr.name == name))
}

/// Groups of which `user` is a member, by primary GID or membership list.
pub fn groups_of(user: &PwEntry) -> VesselResult<Vec<GroupEntry>> {
    let content = std::fs::read_to_string("/etc/group")?;
    Ok(parse_group(&content)
        .into_iter()
        .filter(|gr| gr.gid == user.gid || gr.members.iter().any(|m| m == &user.name))
        .collect())
}

fn parse_passwd(content: &str) -> Vec<PwEntry> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 {
                return None;
            }
            Some(PwEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                gecos: fields[4].to_string(),
                dir: fields[5].to_string(),
                shell: fields[6].to_string(),
            })
        })
        .collect()
}

fn parse_group(content: &str) -> Vec<GroupEntry> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 4 {
                return None;
            }
            Some(GroupEntry {
                name: fields[0].to_string(),
                gid: fields[2].parse().ok()?,
                members: fields[3]
                    .split(',')
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
        })
        .collect()
}

/// Synthesize the container's `/etc/passwd`.
///
/// Existing entries of the image's file (if any) are kept, minus any entry
/// sharing the invoking user's UID; the user's entry is appended with the
/// home directory forced to the resolved container home.
pub fn container_passwd(image_passwd: &Path, uid: u32, container_home: &str) -> VesselResult<Vec<u8>> {
    let user = user_by_uid(uid)?.ok_or_else(|| {
        VesselError::config(format!("no user database entry for UID {uid}"))
    })?;

    let mut out = String::new();
    if image_passwd.exists() {
        let existing = std::fs::read_to_string(image_passwd)?;
        for entry in parse_passwd(&existing) {
            if entry.uid == uid {
                continue;
            }
            out.push_str(&format_pw(&entry));
        }
    }
    let mut user = user;
    user.dir = container_home.to_string();
    out.push_str(&format_pw(&user));
    Ok(out.into_bytes())
}

/// Synthesize the container's `/etc/group`.
///
/// Keeps the image's entries and appends the invoking user's groups that
/// the image does not already define, with the user as sole listed member.
pub fn container_group(image_group: &Path, uid: u32) -> VesselResult<Vec<u8>> {
    let user = user_by_uid(uid)?.ok_or_else(|| {
        VesselError::config(format!("no user database entry for UID {uid}"))
    })?;

    let mut out = String::new();
    let mut known_gids = Vec::new();
    if image_group.exists() {
        let existing = std::fs::read_to_string(image_group)?;
        for entry in parse_group(&existing) {
            known_gids.push(entry.gid);
            out.push_str(&format_group(&entry));
        }
    }
    for group in groups_of(&user)? {
        if known_gids.contains(&group.gid) {
            continue;
        }
        out.push_str(&format!("{}:x:{}:{}\n", group.name, group.gid, user.name));
    }
    Ok(out.into_bytes())
}

fn format_pw(entry: &PwEntry) -> String {
    format!(
        "{}:x:{}:{}:{}:{}:{}\n",
        entry.name, entry.uid, entry.gid, entry.gecos, entry.dir, entry.shell
    )
}

fn format_group(entry: &GroupEntry) -> String {
    format!(
        "{}:x:{}:{}\n",
        entry.name,
        entry.gid,
        entry.members.join(",")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
alice:x:1000:1000:Alice:/home/alice:/bin/zsh
";

    const GROUP: &str = "\
root:x:0:
adm:x:4:alice,bob
alice:x:1000:
";

    #[test]
    fn passwd_parses() {
        let entries = parse_passwd(PASSWD);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].name, "alice");
        assert_eq!(entries[2].uid, 1000);
        assert_eq!(entries[2].dir, "/home/alice");
    }

    #[test]
    fn group_parses_members() {
        let entries = parse_group(GROUP);
        assert_eq!(entries[1].name, "adm");
        assert_eq!(entries[1].members, vec!["alice", "bob"]);
        assert!(entries[0].members.is_empty());
    }

    #[test]
    fn malformed_lines_skipped() {
        let entries = parse_passwd("not-a-passwd-line\nroot:x:0:0:r:/root:/bin/sh\n");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn passwd_merge_replaces_uid_and_forces_home() {
        // Merge against a synthetic image passwd using the real host
        // user database for the invoking UID.
        let uid = rustix::process::getuid().as_raw();
        let dir = tempfile::tempdir().unwrap();
        let image_passwd = dir.path().join("passwd");
        std::fs::write(
            &image_passwd,
            format!("root:x:0:0:root:/root:/bin/bash\nstale:x:{uid}:99::/stale:/bin/false\n"),
        )
        .unwrap();

        let merged = container_passwd(&image_passwd, uid, "/home/container").unwrap();
        let merged = String::from_utf8(merged).unwrap();

        let uid_entries: Vec<&str> = merged
            .lines()
            .filter(|line| line.split(':').nth(2) == Some(&uid.to_string()))
            .collect();
        assert_eq!(uid_entries.len(), 1, "exactly one entry per UID");
        assert!(uid_entries[0].contains(":/home/container:"));
        if uid != 0 {
            assert!(merged.contains("root:x:0:0"));
        }
    }

    #[test]
    fn group_merge_keeps_image_groups() {
        let uid = rustix::process::getuid().as_raw();
        let dir = tempfile::tempdir().unwrap();
        let image_group = dir.path().join("group");
        std::fs::write(&image_group, "wheel:x:10:somebody\n").unwrap();

        let merged = container_group(&image_group, uid).unwrap();
        let merged = String::from_utf8(merged).unwrap();
        assert!(merged.starts_with("wheel:x:10:somebody\n"));
    }
}

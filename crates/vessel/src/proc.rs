//! Helpers for reading `/proc`.

use std::collections::BTreeMap;
use std::path::Path;

use vessel_common::{VesselError, VesselResult};

/// Whether the kernel knows the named filesystem (per `/proc/filesystems`).
pub fn has_filesystem(name: &str) -> VesselResult<bool> {
    let content = std::fs::read_to_string("/proc/filesystems")?;
    Ok(filesystems_contains(&content, name))
}

fn filesystems_contains(content: &str, name: &str) -> bool {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .any(|fs| fs == name)
}

/// Parse a `mountinfo` file into a parent mount point → child mount
/// points map, children in file order.
pub fn parse_mount_info(path: &Path) -> VesselResult<BTreeMap<String, Vec<String>>> {
    let content = std::fs::read_to_string(path)?;
    parse_mount_info_content(&content)
}

fn parse_mount_info_content(content: &str) -> VesselResult<BTreeMap<String, Vec<String>>> {
    // Format per proc(5):
    //   36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw
    //   ^id ^parent        ^mount point
    let mut mount_points = BTreeMap::new();
    let mut parents = Vec::new();

    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            return Err(VesselError::mount(format!(
                "malformed mountinfo entry: {line}"
            )));
        }
        let id = fields[0].to_string();
        let parent = fields[1].to_string();
        let mount_point = fields[4].to_string();
        mount_points.insert(id.clone(), mount_point);
        parents.push((id, parent));
    }

    let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (id, parent) in parents {
        if let Some(parent_point) = mount_points.get(&parent) {
            let point = mount_points[&id].clone();
            if point != *parent_point {
                children.entry(parent_point.clone()).or_default().push(point);
            }
        }
    }
    Ok(children)
}

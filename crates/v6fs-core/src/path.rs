//! Absolute path resolution.

use tracing::debug;
use v6fs_block::SectorStore;
use v6fs_dir::find_by_name;
use v6fs_error::{Result, V6Error};
use v6fs_inode::InodeGeometry;
use v6fs_ondisk::names_equal;
use v6fs_types::InodeNumber;

/// Walk `path` from the root directory and return the inode it names.
///
/// Components are matched with the 14-byte name rule, so a component
/// longer than 14 bytes resolves to the entry sharing its first 14 bytes.
/// `/` names the root. Empty components (`//`, trailing `/`) never match.
pub fn resolve_path(
    dev: &mut dyn SectorStore,
    geom: &InodeGeometry,
    path: &str,
) -> Result<InodeNumber> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(V6Error::InvalidArgument(format!(
            "path must be absolute: {path:?}"
        )));
    };
    if rest.is_empty() {
        return Ok(InodeNumber::ROOT);
    }

    let components: Vec<&str> = rest.split('/').collect();
    let mut current = InodeNumber::ROOT;
    let mut last_entry = None;
    for (depth, component) in components.iter().enumerate() {
        if component.is_empty() {
            return Err(V6Error::NotFound(path.to_owned()));
        }
        let entry = match find_by_name(dev, geom, current, component.as_bytes()) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(target: "v6fs::path", path, component, depth, "component not found");
                return Err(V6Error::NotFound(path.to_owned()));
            }
            Err(V6Error::NotDirectory(_)) => {
                debug!(target: "v6fs::path", path, component, depth, "parent is not a directory");
                return Err(V6Error::NotDirectory(format!("/{}", components[..depth].join("/"))));
            }
            Err(err) => return Err(err),
        };
        debug!(
            target: "v6fs::path",
            component,
            parent = current.0,
            ino = entry.inode,
            "step"
        );
        current = entry.inode_number();
        last_entry = Some(entry);
    }

    // The entry that produced the final inode must carry the last component's
    // name under the same truncated comparison used during the walk.
    let last = components.last().copied().unwrap_or_default();
    match last_entry {
        Some(entry) if names_equal(last.as_bytes(), &entry.name) => Ok(current),
        _ => Err(V6Error::NotFound(path.to_owned())),
    }
}

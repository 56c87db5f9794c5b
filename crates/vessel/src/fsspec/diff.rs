//! Tree diffing.
//!
//! `base.diff(next)` produces a third tree holding exactly what a layer must
//! contain to turn `base` into `next`: nodes that are new or changed in
//! `next`, whiteouts for nodes that disappeared, and — so hardlink groups
//! survive layering — the unchanged members of any hardlink group that has a
//! changed member. Directories that only provide the path to a changed
//! descendant are included with their unchanged attributes, so re-applying
//! the layer leaves them exactly as they were.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::error::Result;
use crate::fsspec::node::{FsSpec, NodeId, NodeKind};
use crate::fsspec::source::{same_source, underlying, Source};

impl FsSpec {
    /// The layer tree turning `self` into `other`.
    pub fn diff(&self, other: &FsSpec) -> Result<FsSpec> {
        let mut out = FsSpec::new();
        let mut included: HashSet<usize> = HashSet::new();
        let out_root = out.root();

        diff_dir(
            self,
            Some(self.root()),
            other,
            other.root(),
            &mut out,
            out_root,
            &mut included,
        )?;

        preserve_hardlink_groups(other, &mut out, &mut included)?;
        Ok(out)
    }
}

/// Compare two nodes under the comparison projection.
fn nodes_equal(a: &FsSpec, a_id: NodeId, b: &FsSpec, b_id: NodeId) -> bool {
    if a.kind(a_id) != b.kind(b_id) {
        return false;
    }
    let (fa, fb) = (a.attrs(a_id), b.attrs(b_id));
    if fa.mode != fb.mode
        || fa.uid != fb.uid
        || fa.gid != fb.gid
        || fa.size != fb.size
        || fa.mtime != fb.mtime
        || fa.link_target != fb.link_target
        || fa.device != fb.device
        || fa.xattrs != fb.xattrs
    {
        return false;
    }
    if a.kind(a_id) == NodeKind::File {
        match (&a.derived(a_id).hash, &b.derived(b_id).hash) {
            (Some(ha), Some(hb)) => ha == hb,
            // without digests the only equality we can prove is shared identity
            _ => same_source(a.source(a_id), b.source(b_id)),
        }
    } else {
        true
    }
}

fn diff_dir(
    a: &FsSpec,
    a_dir: Option<NodeId>,
    b: &FsSpec,
    b_dir: NodeId,
    out: &mut FsSpec,
    out_dir: NodeId,
    included: &mut HashSet<usize>,
) -> Result<()> {
    // removed entries become whiteouts
    if let Some(a_dir) = a_dir {
        for a_child in a.children(a_dir) {
            if b.child_by_name(b_dir, a.name(*a_child)).is_none() {
                out.insert_child(
                    out_dir,
                    a.name(*a_child).to_os_string(),
                    NodeKind::Whiteout,
                    Rc::new(Source::Whiteout),
                    Default::default(),
                    false,
                );
            }
        }
    }

    for b_child in b.children(b_dir).to_vec() {
        let name = b.name(b_child).to_os_string();
        let a_child = a_dir.and_then(|d| a.child_by_name(d, &name));

        match (a_child, b.kind(b_child).is_dir_like()) {
            (None, _) => {
                // new entry: include the whole subtree
                copy_subtree(b, b_child, out, out_dir, included);
            }
            (Some(a_child), true) if a.kind(a_child).is_dir_like() => {
                let changed = !nodes_equal(a, a_child, b, b_child);
                // context dirs keep their real attributes: re-applying them
                // must not disturb the extracted state
                let out_child = out.insert_child(
                    out_dir,
                    name,
                    b.kind(b_child),
                    Rc::clone(b.source(b_child)),
                    b.attrs(b_child).clone(),
                    false,
                );
                if changed {
                    included.insert(b_child.0);
                }
                diff_dir(a, Some(a_child), b, b_child, out, out_child, included)?;
                if !changed && out.children(out_child).is_empty() {
                    // nothing below changed either: drop the context dir again
                    out.remove_child(out_dir, out_child);
                }
            }
            (Some(_), true) => {
                // a non-directory became a directory
                copy_subtree(b, b_child, out, out_dir, included);
            }
            (Some(a_child), false) => {
                if !nodes_equal(a, a_child, b, b_child) {
                    copy_subtree(b, b_child, out, out_dir, included);
                }
            }
        }
    }
    Ok(())
}

/// Deep-copy a subtree from `b` into the diff, sharing source `Rc`s so
/// hardlink identity survives the copy.
fn copy_subtree(
    b: &FsSpec,
    b_id: NodeId,
    out: &mut FsSpec,
    out_parent: NodeId,
    included: &mut HashSet<usize>,
) {
    let out_id = out.insert_child(
        out_parent,
        b.name(b_id).to_os_string(),
        b.kind(b_id),
        Rc::clone(b.source(b_id)),
        b.attrs(b_id).clone(),
        false,
    );
    *out.derived_mut(out_id) = b.derived(b_id).clone();
    included.insert(b_id.0);
    for child in b.children(b_id).to_vec() {
        copy_subtree(b, child, out, out_id, included);
    }
}

/// Re-include unchanged members of hardlink groups with a changed member.
///
/// A layer containing only the changed link would dangle: the tar hardlink
/// entry needs its target in the same archive.
fn preserve_hardlink_groups(
    b: &FsSpec,
    out: &mut FsSpec,
    included: &mut HashSet<usize>,
) -> Result<()> {
    let mut groups: HashMap<*const Source, Vec<NodeId>> = HashMap::new();
    collect_leaf_groups(b, b.root(), &mut groups);

    for group in groups.values() {
        if group.len() < 2 || !group.iter().any(|id| included.contains(&id.0)) {
            continue;
        }
        for member in group {
            if included.contains(&member.0) {
                continue;
            }
            let out_parent = ensure_context_chain(b, b.parent(*member), out)?;
            let out_id = out.insert_child(
                out_parent,
                b.name(*member).to_os_string(),
                b.kind(*member),
                Rc::clone(b.source(*member)),
                b.attrs(*member).clone(),
                false,
            );
            *out.derived_mut(out_id) = b.derived(*member).clone();
            included.insert(member.0);
        }
    }
    Ok(())
}

fn collect_leaf_groups(b: &FsSpec, id: NodeId, groups: &mut HashMap<*const Source, Vec<NodeId>>) {
    for child in b.children(id) {
        if b.kind(*child).is_dir_like() {
            collect_leaf_groups(b, *child, groups);
        } else if b.kind(*child) != NodeKind::Whiteout {
            groups
                .entry(Rc::as_ptr(underlying(b.source(*child))))
                .or_default()
                .push(*child);
        }
    }
}

/// Walk `b`'s directory chain down to `b_dir`, mirroring it in `out` as
/// context (lower) directories; returns the mirrored dir id.
fn ensure_context_chain(b: &FsSpec, b_dir: Option<NodeId>, out: &mut FsSpec) -> Result<NodeId> {
    let Some(b_dir) = b_dir else {
        return Ok(out.root());
    };
    if b.parent(b_dir).is_none() {
        return Ok(out.root());
    }
    let out_parent = ensure_context_chain(b, b.parent(b_dir), out)?;
    let name = b.name(b_dir).to_os_string();
    if let Some(existing) = out.child_by_name(out_parent, &name) {
        return Ok(existing);
    }
    Ok(out.insert_child(
        out_parent,
        name,
        b.kind(b_dir),
        Rc::clone(b.source(b_dir)),
        b.attrs(b_dir).clone(),
        false,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::fsspec::attrs::FileAttrs;

    fn file_with_hash(tree: &mut FsSpec, path: &str, content: &[u8], mtime: i64) -> NodeId {
        let id = tree
            .add_upper(path, Source::file_from_bytes(content.to_vec()), {
                let mut a = FileAttrs::with_mode(0o644);
                a.size = Some(content.len() as u64);
                a.mtime = Some(mtime);
                a
            })
            .unwrap();
        tree.derived_mut(id).hash = Some(Digest::sha256_of(content));
        id
    }

    #[test]
    fn test_self_diff_is_empty() {
        let mut tree = FsSpec::new();
        file_with_hash(&mut tree, "/etc/a", b"one", 1);
        file_with_hash(&mut tree, "/etc/b", b"two", 1);
        tree.link("/etc/b-link", "/etc/b").unwrap();

        let diff = tree.diff(&tree).unwrap();
        assert!(diff.is_empty(), "self-diff produced {diff:?}");
    }

    #[test]
    fn test_added_file() {
        let mut base = FsSpec::new();
        file_with_hash(&mut base, "/a", b"same", 1);
        let mut next = FsSpec::new();
        file_with_hash(&mut next, "/a", b"same", 1);
        file_with_hash(&mut next, "/sub/new", b"fresh", 2);

        let diff = base.diff(&next).unwrap();
        assert!(diff.node("/sub/new").is_ok());
        // /a is unchanged and must not be in the layer
        assert!(diff.node("/a").is_err());
        // /sub is context only
        let sub = diff.node("/sub").unwrap();
        assert!(!diff.is_lower(diff.node("/sub/new").unwrap()));
        assert_eq!(diff.kind(sub), NodeKind::Dir);
    }

    #[test]
    fn test_removed_file_becomes_whiteout() {
        let mut base = FsSpec::new();
        file_with_hash(&mut base, "/gone", b"bye", 1);
        let next = FsSpec::new();

        let diff = base.diff(&next).unwrap();
        let wh = diff.node("/gone").unwrap();
        assert_eq!(diff.kind(wh), NodeKind::Whiteout);
    }

    #[test]
    fn test_modified_file_included() {
        let mut base = FsSpec::new();
        file_with_hash(&mut base, "/f", b"old", 1);
        let mut next = FsSpec::new();
        file_with_hash(&mut next, "/f", b"new", 1);

        let diff = base.diff(&next).unwrap();
        assert!(diff.node("/f").is_ok());
    }

    #[test]
    fn test_mtime_only_change_included() {
        let mut base = FsSpec::new();
        file_with_hash(&mut base, "/f", b"same", 1);
        let mut next = FsSpec::new();
        file_with_hash(&mut next, "/f", b"same", 99);

        let diff = base.diff(&next).unwrap();
        assert!(diff.node("/f").is_ok());
    }

    #[test]
    fn test_dir_attr_change_included_without_children() {
        let mut base = FsSpec::new();
        base.mkdirs("/d").unwrap();
        file_with_hash(&mut base, "/d/kept", b"kept", 1);

        let mut next = FsSpec::new();
        next.add_upper("/d", Rc::new(Source::Dir), FileAttrs::with_mode(0o700))
            .unwrap();
        file_with_hash(&mut next, "/d/kept", b"kept", 1);

        let diff = base.diff(&next).unwrap();
        let d = diff.node("/d").unwrap();
        assert!(!diff.is_lower(d));
        assert!(diff.node("/d/kept").is_err());
    }

    #[test]
    fn test_unchanged_hardlink_target_reincluded() {
        // base: target and link, both unchanged content
        let mut base = FsSpec::new();
        file_with_hash(&mut base, "/data/target", b"payload", 1);
        base.link("/data/link", "/data/target").unwrap();

        // next: same target, but the link moved to a new path
        let mut next = FsSpec::new();
        file_with_hash(&mut next, "/data/target", b"payload", 1);
        next.link("/data/newlink", "/data/target").unwrap();

        let diff = base.diff(&next).unwrap();
        // old link path is whited out, new link included
        assert_eq!(diff.kind(diff.node("/data/link").unwrap()), NodeKind::Whiteout);
        let newlink = diff.node("/data/newlink").unwrap();
        assert!(!diff.is_lower(newlink));
        // the unchanged target is re-included so the link can resolve
        let target = diff.node("/data/target").unwrap();
        assert!(same_source(diff.source(target), diff.source(newlink)));
    }
}

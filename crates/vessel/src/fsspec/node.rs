//! The virtual filesystem tree.
//!
//! Nodes live in an arena indexed by [`NodeId`]; parents are back-references
//! by id, so the tree has no reference cycles and removal is O(1) (a detached
//! node simply becomes unreachable). Children are kept sorted by name, which
//! makes serialization and hashing deterministic.
//!
//! Upper nodes (added by the builder) override lower nodes (from the base
//! image) at the same path; whiteouts mark removals; overlay nodes expand an
//! archive source below themselves at write time.

use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::fsspec::attrs::FileAttrs;
use crate::fsspec::attrs::DerivedAttrs;
use crate::fsspec::source::Source;

/// Maximum number of symlinks resolved in a single lookup.
const MAX_LINK_DEPTH: u32 = 40;

/// Stable index of a node in its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// The variant of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Dir,
    File,
    Symlink,
    Device,
    Fifo,
    Overlay,
    Whiteout,
}

impl NodeKind {
    pub fn is_dir_like(&self) -> bool {
        matches!(self, NodeKind::Dir | NodeKind::Overlay)
    }
}

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) name: OsString,
    pub(crate) kind: NodeKind,
    pub(crate) attrs: FileAttrs,
    pub(crate) derived: DerivedAttrs,
    pub(crate) source: Rc<Source>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    /// Node comes from the lower (base image) layer: it provides path context
    /// and link targets but is not itself emitted into a layer.
    pub(crate) lower: bool,
}

/// A virtual filesystem tree.
#[derive(Debug)]
pub struct FsSpec {
    pub(crate) nodes: Vec<Node>,
    pub(crate) root: NodeId,
}

impl Default for FsSpec {
    fn default() -> Self {
        Self::new()
    }
}

impl FsSpec {
    /// An empty tree: a root directory with default attributes.
    pub fn new() -> Self {
        FsSpec {
            nodes: vec![Node {
                name: OsString::new(),
                kind: NodeKind::Dir,
                attrs: FileAttrs::default_dir(),
                derived: DerivedAttrs::default(),
                source: Rc::new(Source::ParentDir),
                parent: None,
                children: Vec::new(),
                lower: false,
            }],
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// True if the tree contains nothing but the root directory.
    pub fn is_empty(&self) -> bool {
        self.nodes[self.root.0].children.is_empty()
    }

    // accessors

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.nodes[id.0].kind
    }

    pub fn name(&self, id: NodeId) -> &OsStr {
        &self.nodes[id.0].name
    }

    pub fn attrs(&self, id: NodeId) -> &FileAttrs {
        &self.nodes[id.0].attrs
    }

    pub fn attrs_mut(&mut self, id: NodeId) -> &mut FileAttrs {
        &mut self.nodes[id.0].attrs
    }

    pub fn derived(&self, id: NodeId) -> &DerivedAttrs {
        &self.nodes[id.0].derived
    }

    pub fn derived_mut(&mut self, id: NodeId) -> &mut DerivedAttrs {
        &mut self.nodes[id.0].derived
    }

    pub fn source(&self, id: NodeId) -> &Rc<Source> {
        &self.nodes[id.0].source
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    /// True if this node comes from the lower (base) layer.
    pub fn is_lower(&self, id: NodeId) -> bool {
        self.nodes[id.0].lower
    }

    /// True if this node is a hardlink to another node's source.
    pub fn is_hardlink(&self, id: NodeId) -> bool {
        matches!(&*self.nodes[id.0].source, Source::Link(..))
    }

    /// Full path of a node from the root.
    pub fn path_of(&self, id: NodeId) -> PathBuf {
        let mut segments = Vec::new();
        let mut cur = Some(id);
        while let Some(node_id) = cur {
            let node = &self.nodes[node_id.0];
            if node.parent.is_some() {
                segments.push(node.name.clone());
            }
            cur = node.parent;
        }
        let mut path = PathBuf::from("/");
        for segment in segments.iter().rev() {
            path.push(segment);
        }
        path
    }

    // mutation

    /// Add an upper (builder-provided) node at `path`.
    ///
    /// Missing parent directories are created with default attributes. An
    /// existing directory-like node at the final segment keeps its children;
    /// a file-like replacement drops them.
    pub fn add_upper(
        &mut self,
        path: impl AsRef<Path>,
        source: Rc<Source>,
        attrs: FileAttrs,
    ) -> Result<NodeId> {
        self.add(path.as_ref(), source, attrs, false)
    }

    /// Like [`FsSpec::add_upper`] but marks the node and any created parents
    /// as coming from the lower layer.
    pub fn add_lower(
        &mut self,
        path: impl AsRef<Path>,
        source: Rc<Source>,
        attrs: FileAttrs,
    ) -> Result<NodeId> {
        self.add(path.as_ref(), source, attrs, true)
    }

    /// Mark `path` as removed: on tar emission this becomes a `.wh.` entry.
    pub fn add_whiteout(&mut self, path: impl AsRef<Path>) -> Result<NodeId> {
        self.add(
            path.as_ref(),
            Rc::new(Source::Whiteout),
            FileAttrs::default(),
            false,
        )
    }

    fn add(&mut self, path: &Path, source: Rc<Source>, attrs: FileAttrs, lower: bool) -> Result<NodeId> {
        let kind = source.node_kind();
        let Some((dir, name)) = self.walk_to_parent(path, true, lower)? else {
            // adding at "/" replaces the root's own metadata
            if !kind.is_dir_like() {
                return Err(Error::invalid_input("the tree root must be a directory"));
            }
            let root = self.root;
            let node = &mut self.nodes[root.0];
            node.kind = kind;
            node.attrs = attrs;
            node.source = source;
            node.lower = lower;
            return Ok(root);
        };

        if let Some(existing) = self.child_by_name(dir, &name) {
            if !kind.is_dir_like() {
                self.detach_children(existing);
            }
            let node = &mut self.nodes[existing.0];
            node.kind = kind;
            node.attrs = attrs;
            node.derived = DerivedAttrs::default();
            node.source = source;
            node.lower = lower;
            Ok(existing)
        } else {
            Ok(self.insert_child(dir, name, kind, source, attrs, lower))
        }
    }

    /// Create the directory chain for `path`, leaving existing nodes alone.
    ///
    /// Fails if an existing node on the chain is not a directory.
    pub fn mkdirs(&mut self, path: impl AsRef<Path>) -> Result<NodeId> {
        let path = path.as_ref();
        let Some((dir, name)) = self.walk_to_parent(path, true, false)? else {
            return Ok(self.root);
        };
        match self.child_by_name(dir, &name) {
            Some(existing) if self.nodes[existing.0].kind.is_dir_like() => Ok(existing),
            Some(_) => Err(Error::invalid_input(format!(
                "{} exists and is not a directory",
                path.display()
            ))),
            None => Ok(self.insert_child(
                dir,
                name,
                NodeKind::Dir,
                Rc::new(Source::ParentDir),
                FileAttrs::default_dir(),
                false,
            )),
        }
    }

    /// Add a hardlink at `path` to the node at `target`.
    ///
    /// A relative `target` is resolved against `path`'s directory. The target
    /// must exist and must not be a directory; the new node shares the
    /// target's source so writers emit a link record for whichever occurrence
    /// comes second.
    pub fn link(&mut self, path: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<NodeId> {
        let path = path.as_ref();
        let target = target.as_ref();

        let target_abs = if target.is_absolute() {
            target.to_path_buf()
        } else {
            path.parent().unwrap_or(Path::new("/")).join(target)
        };
        let target_id = self.node(&target_abs)?;
        if self.nodes[target_id.0].kind.is_dir_like() {
            return Err(Error::invalid_input(format!(
                "cannot hardlink directory {}",
                target_abs.display()
            )));
        }

        let source = Rc::new(Source::Link(Rc::clone(&self.nodes[target_id.0].source)));
        let attrs = self.nodes[target_id.0].attrs.clone();
        let derived = self.nodes[target_id.0].derived.clone();
        let id = self.add(path, source, attrs, false)?;
        self.nodes[id.0].derived = derived;
        Ok(id)
    }

    /// Look up the node at `path`, following symlinks.
    ///
    /// Symlink targets resolve against the link's parent directory; absolute
    /// targets re-root at the tree root. Traversal that would escape the root
    /// via `..` is an error.
    pub fn node(&self, path: impl AsRef<Path>) -> Result<NodeId> {
        let path = path.as_ref();
        let mut depth = 0;
        let id = self.resolve(self.root, path, true, &mut depth)?;
        id.ok_or_else(|| Error::not_found(format!("node {}", path.display())))
    }

    /// Like [`FsSpec::node`] but does not follow a symlink at the final
    /// segment.
    pub fn node_nofollow(&self, path: impl AsRef<Path>) -> Result<NodeId> {
        let path = path.as_ref();
        let mut depth = 0;
        let id = self.resolve(self.root, path, false, &mut depth)?;
        id.ok_or_else(|| Error::not_found(format!("node {}", path.display())))
    }

    /// Unlink the node at `path` from its parent. Missing nodes are fine.
    pub fn remove(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut depth = 0;
        let id = match self.resolve(self.root, path, false, &mut depth) {
            Ok(Some(id)) => id,
            Ok(None) => return Ok(()),
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        self.detach(id);
        Ok(())
    }

    // internals

    fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id.0].parent {
            self.nodes[parent.0].children.retain(|c| *c != id);
            self.nodes[id.0].parent = None;
        }
    }

    /// Unlink a specific child from a directory.
    pub(crate) fn remove_child(&mut self, dir: NodeId, child: NodeId) {
        self.nodes[dir.0].children.retain(|c| *c != child);
        self.nodes[child.0].parent = None;
    }

    fn detach_children(&mut self, id: NodeId) {
        let children = std::mem::take(&mut self.nodes[id.0].children);
        for child in children {
            self.nodes[child.0].parent = None;
        }
    }

    pub(crate) fn child_by_name(&self, dir: NodeId, name: &OsStr) -> Option<NodeId> {
        let children = &self.nodes[dir.0].children;
        children
            .binary_search_by(|c| self.nodes[c.0].name.as_os_str().cmp(name))
            .ok()
            .map(|idx| children[idx])
    }

    pub(crate) fn insert_child(
        &mut self,
        dir: NodeId,
        name: OsString,
        kind: NodeKind,
        source: Rc<Source>,
        attrs: FileAttrs,
        lower: bool,
    ) -> NodeId {
        // find the sorted position before the arena borrow for the push
        let pos = {
            let children = &self.nodes[dir.0].children;
            let mut lo = 0;
            let mut hi = children.len();
            while lo < hi {
                let mid = (lo + hi) / 2;
                if self.nodes[children[mid].0].name < name {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            lo
        };

        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name,
            kind,
            attrs,
            derived: DerivedAttrs::default(),
            source,
            parent: Some(dir),
            children: Vec::new(),
            lower,
        });
        self.nodes[dir.0].children.insert(pos, id);
        id
    }

    /// Walk to the parent directory of `path`, optionally creating missing
    /// directories. Returns `None` when `path` is the root itself.
    fn walk_to_parent(
        &mut self,
        path: &Path,
        create: bool,
        lower: bool,
    ) -> Result<Option<(NodeId, OsString)>> {
        let mut segments: Vec<OsString> = Vec::new();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Prefix(..) => {
                    return Err(Error::invalid_input(format!(
                        "unsupported path {}",
                        path.display()
                    )))
                }
                Component::ParentDir => {
                    if segments.pop().is_none() {
                        return Err(Error::invalid_input(format!(
                            "path {} escapes the root",
                            path.display()
                        )));
                    }
                }
                Component::Normal(name) => segments.push(name.to_os_string()),
            }
        }

        let Some(final_name) = segments.pop() else {
            return Ok(None);
        };

        let mut cur = self.root;
        for name in segments {
            match self.child_by_name(cur, &name) {
                Some(child) => {
                    let mut depth = 0;
                    let resolved = self.follow(child, &mut depth)?;
                    if !self.nodes[resolved.0].kind.is_dir_like() {
                        return Err(Error::invalid_input(format!(
                            "{:?} in {} is not a directory",
                            name,
                            path.display()
                        )));
                    }
                    cur = resolved;
                }
                None if create => {
                    cur = self.insert_child(
                        cur,
                        name,
                        NodeKind::Dir,
                        Rc::new(Source::ParentDir),
                        FileAttrs::default_dir(),
                        lower,
                    );
                }
                None => {
                    return Err(Error::not_found(format!("node {}", path.display())));
                }
            }
        }
        Ok(Some((cur, final_name)))
    }

    /// Resolve `path` relative to `base`. Returns `Ok(None)` if a component
    /// is missing.
    fn resolve(
        &self,
        base: NodeId,
        path: &Path,
        follow_final: bool,
        depth: &mut u32,
    ) -> Result<Option<NodeId>> {
        let components: Vec<Component> = path.components().collect();
        let mut cur = base;

        for (idx, component) in components.iter().enumerate() {
            let last = idx == components.len() - 1;
            match component {
                Component::RootDir => cur = self.root,
                Component::CurDir => {}
                Component::Prefix(..) => {
                    return Err(Error::invalid_input(format!(
                        "unsupported path {}",
                        path.display()
                    )))
                }
                Component::ParentDir => match self.nodes[cur.0].parent {
                    Some(parent) => cur = parent,
                    None => {
                        return Err(Error::invalid_input(format!(
                            "path {} escapes the root",
                            path.display()
                        )))
                    }
                },
                Component::Normal(name) => {
                    let Some(child) = self.child_by_name(cur, name) else {
                        return Ok(None);
                    };
                    cur = if !last || follow_final {
                        self.follow(child, depth)?
                    } else {
                        child
                    };
                }
            }
        }
        Ok(Some(cur))
    }

    /// Follow symlinks until a non-symlink node is reached.
    fn follow(&self, mut id: NodeId, depth: &mut u32) -> Result<NodeId> {
        while self.nodes[id.0].kind == NodeKind::Symlink {
            *depth += 1;
            if *depth > MAX_LINK_DEPTH {
                return Err(Error::invalid_input("too many levels of symbolic links"));
            }
            let target = match &*self.nodes[id.0].source {
                Source::Symlink(target) => target.clone(),
                _ => {
                    return Err(Error::corrupt(format!(
                        "symlink node {} has no target",
                        self.path_of(id).display()
                    )))
                }
            };
            let base = if target.is_absolute() {
                self.root
            } else {
                self.nodes[id.0].parent.unwrap_or(self.root)
            };
            id = self
                .resolve(base, &target, true, depth)?
                .ok_or_else(|| Error::not_found(format!("symlink target {}", target.display())))?;
        }
        Ok(id)
    }
}

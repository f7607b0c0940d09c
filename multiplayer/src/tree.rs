//! The object directory: a tree of named nodes addressable by path.
//!
//! Parents own their children (keyed by name); children only hold a weak
//! link back to their parent. Dropping a child entry drops the whole subtree
//! once in-flight calls release their handles.
//!
//! Each node also carries the procedures callable on it: native procedure
//! factories and dynamic methods, see [`crate::rpc`].

use crate::rpc::{DynamicMethod, NativeFactory};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use thiserror::Error;

pub const DEFAULT_ROOT_NAME: &str = "root";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("invalid node path {0:?}")]
    InvalidPath(String),
    #[error("no node at path {0:?}")]
    NotFound(String),
    #[error("the root node cannot be removed")]
    RemoveRoot,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub struct Node {
    name: String,
    parent: Weak<Node>,
    children: RwLock<BTreeMap<String, Arc<Node>>>,
    native: RwLock<HashMap<String, NativeFactory>>,
    methods: RwLock<HashMap<String, DynamicMethod>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("path", &self.path())
            .field("children", &read(&self.children).keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Node {
    fn new(name: &str, parent: Weak<Node>) -> Arc<Node> {
        Arc::new(Node {
            name: name.to_owned(),
            parent,
            children: RwLock::new(BTreeMap::new()),
            native: RwLock::new(HashMap::new()),
            methods: RwLock::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.upgrade()
    }

    /// Absolute path, root name included: `/root/Level/Player`.
    pub fn path(&self) -> String {
        let mut names = vec![self.name.clone()];
        let mut current = self.parent();
        while let Some(node) = current {
            names.push(node.name.clone());
            current = node.parent();
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    pub fn root(self: &Arc<Self>) -> Arc<Node> {
        let mut node = Arc::clone(self);
        while let Some(parent) = node.parent() {
            node = parent;
        }
        node
    }

    pub fn child(&self, name: &str) -> Option<Arc<Node>> {
        read(&self.children).get(name).cloned()
    }

    pub fn children(&self) -> Vec<Arc<Node>> {
        read(&self.children).values().cloned().collect()
    }

    /// Returns the child called `name`, creating it if needed.
    pub fn add_child(self: &Arc<Self>, name: &str) -> Result<Arc<Node>, TreeError> {
        if name.is_empty() || name.contains('/') {
            return Err(TreeError::InvalidPath(name.to_owned()));
        }
        let mut children = write(&self.children);
        let child = children
            .entry(name.to_owned())
            .or_insert_with(|| Node::new(name, Arc::downgrade(self)));
        Ok(Arc::clone(child))
    }

    pub fn remove_child(&self, name: &str) -> Option<Arc<Node>> {
        write(&self.children).remove(name)
    }

    /// Resolves `path` from this node. Absolute paths restart at the root;
    /// a leading root name is optional, so `/root/X` and `/X` are the same.
    pub fn get_node(self: &Arc<Self>, path: &str) -> Option<Arc<Node>> {
        if let Some(absolute) = path.strip_prefix('/') {
            let root = self.root();
            let segments = root.absolute_segments(absolute);
            return root.walk(&segments);
        }
        if path.is_empty() {
            return Some(Arc::clone(self));
        }
        self.walk(&path.split('/').collect::<Vec<_>>())
    }

    fn absolute_segments<'p>(&self, absolute: &'p str) -> Vec<&'p str> {
        if absolute.is_empty() {
            return Vec::new();
        }
        let mut segments: Vec<&str> = absolute.split('/').collect();
        if segments[0] == self.name {
            segments.remove(0);
        }
        segments
    }

    fn walk(self: &Arc<Self>, segments: &[&str]) -> Option<Arc<Node>> {
        let mut node = Arc::clone(self);
        for segment in segments {
            node = node.child(segment)?;
        }
        Some(node)
    }

    pub fn register_native(&self, name: &str, factory: NativeFactory) {
        write(&self.native).insert(name.to_owned(), factory);
    }

    pub fn native(&self, name: &str) -> Option<NativeFactory> {
        read(&self.native).get(name).cloned()
    }

    pub fn register_method(&self, name: &str, method: DynamicMethod) {
        write(&self.methods).insert(name.to_owned(), method);
    }

    pub fn method(&self, name: &str) -> Option<DynamicMethod> {
        read(&self.methods).get(name).cloned()
    }
}

/// Handle to one independent node tree. Clones share the same tree.
#[derive(Debug, Clone)]
pub struct SceneTree {
    root: Arc<Node>,
}

impl Default for SceneTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneTree {
    pub fn new() -> Self {
        Self::with_root_name(DEFAULT_ROOT_NAME)
    }

    pub fn with_root_name(name: &str) -> Self {
        Self {
            root: Node::new(name, Weak::new()),
        }
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    pub fn get_node(&self, path: &str) -> Option<Arc<Node>> {
        self.root.get_node(path)
    }

    /// Walks `path` from the root, creating every missing node on the way.
    pub fn create_node(&self, path: &str) -> Result<Arc<Node>, TreeError> {
        let relative = path.strip_prefix('/').unwrap_or(path);
        let segments = self.root.absolute_segments(relative);
        if segments.iter().any(|s| s.is_empty()) {
            return Err(TreeError::InvalidPath(path.to_owned()));
        }

        let mut node = Arc::clone(&self.root);
        for segment in segments {
            node = node.add_child(segment)?;
        }
        Ok(node)
    }

    /// Detaches the node at `path` (and its subtree) from the tree.
    pub fn remove_node(&self, path: &str) -> Result<Arc<Node>, TreeError> {
        let node = self
            .get_node(path)
            .ok_or_else(|| TreeError::NotFound(path.to_owned()))?;
        let parent = node.parent().ok_or(TreeError::RemoveRoot)?;
        parent
            .remove_child(node.name())
            .ok_or_else(|| TreeError::NotFound(path.to_owned()))
    }

    pub fn register_native_handler(
        &self,
        path: &str,
        name: &str,
        factory: NativeFactory,
    ) -> Result<Arc<Node>, TreeError> {
        let node = self.create_node(path)?;
        node.register_native(name, factory);
        Ok(node)
    }

    pub fn register_method(
        &self,
        path: &str,
        name: &str,
        method: DynamicMethod,
    ) -> Result<Arc<Node>, TreeError> {
        let node = self.create_node(path)?;
        node.register_method(name, method);
        Ok(node)
    }
}

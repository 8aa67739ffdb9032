//! Node directory collaborator.
//!
//! Backends ask the directory which nodes may run storage commands and how to
//! reach a node by id. The control plane provides the real directory; the
//! [`StaticNodeDirectory`] serves tests and single-host deployments.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use crate::backend::BackendFuture;

/// A compute node known to the control plane.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Node {
    /// Stable node identifier.
    pub id: String,
    /// Host name, used for logs.
    pub hostname: String,
    /// Address commands are sent to.
    pub ip: String,
    /// Whether the node is currently running.
    pub running: bool,
    /// Whether the Ceph client tools are installed on the node.
    pub ceph_installed: bool,
}

impl Node {
    /// Creates a running node without Ceph tooling.
    #[must_use]
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            ip: ip.into(),
            running: true,
            ceph_installed: false,
        }
    }

    /// Marks the node as carrying the Ceph client tools.
    #[must_use]
    pub const fn with_ceph(mut self) -> Self {
        self.ceph_installed = true;
        self
    }

    /// Sets the running flag.
    #[must_use]
    pub const fn running(mut self, value: bool) -> Self {
        self.running = value;
        self
    }
}

/// Selects nodes from the directory.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NodeFilter {
    /// Only nodes that are running.
    pub running_only: bool,
    /// Only nodes with the Ceph client installed.
    pub ceph_only: bool,
}

impl NodeFilter {
    /// Matches every node.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            running_only: false,
            ceph_only: false,
        }
    }

    /// Matches running nodes able to talk to the clustered store.
    #[must_use]
    pub const fn clustered() -> Self {
        Self {
            running_only: true,
            ceph_only: true,
        }
    }

    /// Matches running nodes.
    #[must_use]
    pub const fn running() -> Self {
        Self {
            running_only: true,
            ceph_only: false,
        }
    }

    /// Returns `true` when `node` passes the filter.
    #[must_use]
    pub const fn matches(&self, node: &Node) -> bool {
        (!self.running_only || node.running) && (!self.ceph_only || node.ceph_installed)
    }
}

/// Errors raised by node directory lookups.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NodeDirectoryError {
    /// Raised when the node id is not known.
    #[error("node {node_id} not found")]
    UnknownNode {
        /// Requested node id.
        node_id: String,
    },
    /// Raised when the directory cannot be queried.
    #[error("node directory unavailable: {message}")]
    Unavailable {
        /// Underlying error message.
        message: String,
    },
}

/// Read access to the cluster's node inventory.
pub trait NodeDirectory: Send + Sync {
    /// Lists nodes matching `filter`, in a stable order.
    ///
    /// # Errors
    ///
    /// Returns [`NodeDirectoryError::Unavailable`] when the directory cannot
    /// be read.
    fn list_nodes(&self, filter: NodeFilter) -> BackendFuture<'_, Vec<Node>, NodeDirectoryError>;

    /// Looks up a single node.
    ///
    /// # Errors
    ///
    /// Returns [`NodeDirectoryError::UnknownNode`] for unknown ids.
    fn node<'a>(&'a self, node_id: &'a str) -> BackendFuture<'a, Node, NodeDirectoryError>;
}

/// In-memory node directory.
#[derive(Clone, Debug, Default)]
pub struct StaticNodeDirectory {
    nodes: Arc<RwLock<BTreeMap<String, Node>>>,
}

impl StaticNodeDirectory {
    /// Creates a directory holding `nodes`.
    #[must_use]
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Self {
        let directory = Self::default();
        for node in nodes {
            directory.add(node);
        }
        directory
    }

    /// Adds or replaces a node.
    pub fn add(&self, node: Node) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.id.clone(), node);
    }

    /// Removes a node, returning it when present.
    pub fn remove(&self, node_id: &str) -> Option<Node> {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_id)
    }
}

impl NodeDirectory for StaticNodeDirectory {
    fn list_nodes(&self, filter: NodeFilter) -> BackendFuture<'_, Vec<Node>, NodeDirectoryError> {
        Box::pin(async move {
            let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
            Ok(nodes
                .values()
                .filter(|node| filter.matches(node))
                .cloned()
                .collect())
        })
    }

    fn node<'a>(&'a self, node_id: &'a str) -> BackendFuture<'a, Node, NodeDirectoryError> {
        Box::pin(async move {
            self.nodes
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(node_id)
                .cloned()
                .ok_or_else(|| NodeDirectoryError::UnknownNode {
                    node_id: node_id.to_owned(),
                })
        })
    }
}

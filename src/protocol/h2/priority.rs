//! Stream scheduling by HTTP/2 priority (RFC 7540 §5.3).
//!
//! Streams form a dependency tree rooted at stream 0. [`PriorityTree::next`]
//! walks it from the root: an unblocked stream is served before anything
//! that depends on it, and siblings share their parent's turn by weighted
//! fair queueing.

use std::collections::HashMap;

use thiserror::Error;

pub const DEFAULT_WEIGHT: u16 = 16;

/// Virtual time added per turn for a stream of weight 1.
const TURN: u64 = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PriorityError {
    #[error("stream {0} is not in the priority tree")]
    Missing(u32),
    #[error("stream {0} is already in the priority tree")]
    Duplicate(u32),
    /// Every stream in the tree is blocked.
    #[error("no stream is ready to send")]
    Deadlock,
}

#[derive(Debug)]
struct Node {
    parent: u32,
    children: Vec<u32>,
    weight: u16,
    active: bool,
    /// Weighted time this stream has consumed among its siblings.
    vtime: u64,
}

impl Node {
    fn new(parent: u32, weight: u16) -> Self {
        Self {
            parent,
            children: Vec::new(),
            weight: weight.clamp(1, 256),
            active: true,
            vtime: 0,
        }
    }
}

#[derive(Debug)]
pub struct PriorityTree {
    nodes: HashMap<u32, Node>,
}

impl Default for PriorityTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityTree {
    pub fn new() -> Self {
        let mut root = Node::new(0, DEFAULT_WEIGHT);
        root.active = false;
        Self {
            nodes: HashMap::from([(0, root)]),
        }
    }

    pub fn contains(&self, stream_id: u32) -> bool {
        stream_id != 0 && self.nodes.contains_key(&stream_id)
    }

    /// Adds an active stream. An unknown parent means the root.
    pub fn insert_stream(
        &mut self,
        stream_id: u32,
        depends_on: Option<u32>,
        weight: u16,
        exclusive: bool,
    ) -> Result<(), PriorityError> {
        if self.nodes.contains_key(&stream_id) {
            return Err(PriorityError::Duplicate(stream_id));
        }
        let parent = depends_on
            .filter(|id| *id != stream_id && self.nodes.contains_key(id))
            .unwrap_or(0);
        self.nodes.insert(stream_id, Node::new(parent, weight));
        self.attach(stream_id, parent, exclusive);
        Ok(())
    }

    /// Moves a stream under a new parent with a new weight.
    pub fn reprioritize(
        &mut self,
        stream_id: u32,
        depends_on: Option<u32>,
        weight: u16,
        exclusive: bool,
    ) -> Result<(), PriorityError> {
        if !self.contains(stream_id) {
            return Err(PriorityError::Missing(stream_id));
        }
        let parent = depends_on
            .filter(|id| *id != stream_id && self.nodes.contains_key(id))
            .unwrap_or(0);

        // Depending on one of our own descendants: that descendant first
        // moves up to take our old place.
        if self.is_descendant(parent, stream_id) {
            let old_parent = self.nodes[&stream_id].parent;
            self.detach(parent);
            self.attach(parent, old_parent, false);
        }

        self.detach(stream_id);
        if let Some(node) = self.nodes.get_mut(&stream_id) {
            node.weight = weight.clamp(1, 256);
        }
        self.attach(stream_id, parent, exclusive);
        Ok(())
    }

    /// Removes a stream; its children move to its parent.
    pub fn remove_stream(&mut self, stream_id: u32) -> Result<(), PriorityError> {
        if !self.contains(stream_id) {
            return Err(PriorityError::Missing(stream_id));
        }
        let parent = self.nodes[&stream_id].parent;
        self.detach(stream_id);
        if let Some(node) = self.nodes.remove(&stream_id) {
            for child in node.children {
                if let Some(child_node) = self.nodes.get_mut(&child) {
                    child_node.parent = parent;
                }
                if let Some(parent_node) = self.nodes.get_mut(&parent) {
                    parent_node.children.push(child);
                }
            }
        }
        Ok(())
    }

    pub fn block(&mut self, stream_id: u32) -> Result<(), PriorityError> {
        self.set_active(stream_id, false)
    }

    pub fn unblock(&mut self, stream_id: u32) -> Result<(), PriorityError> {
        self.set_active(stream_id, true)
    }

    /// The stream that should send next.
    pub fn next(&mut self) -> Result<u32, PriorityError> {
        self.schedule(0).ok_or(PriorityError::Deadlock)
    }

    fn set_active(&mut self, stream_id: u32, active: bool) -> Result<(), PriorityError> {
        match self.nodes.get_mut(&stream_id) {
            Some(node) if stream_id != 0 => {
                node.active = active;
                Ok(())
            }
            _ => Err(PriorityError::Missing(stream_id)),
        }
    }

    fn schedule(&mut self, id: u32) -> Option<u32> {
        let mut children: Vec<(u64, u32)> = self.nodes[&id]
            .children
            .iter()
            .map(|child| (self.nodes[child].vtime, *child))
            .collect();
        children.sort_unstable();

        for (_, child) in children {
            let picked = if self.nodes[&child].active {
                Some(child)
            } else {
                self.schedule(child)
            };
            if let Some(picked) = picked {
                if let Some(node) = self.nodes.get_mut(&child) {
                    node.vtime += TURN / u64::from(node.weight);
                }
                return Some(picked);
            }
        }
        None
    }

    /// Where a newly attached child starts, so it does not starve its
    /// siblings after joining late.
    fn min_vtime(&self, parent: u32) -> u64 {
        self.nodes[&parent]
            .children
            .iter()
            .map(|child| self.nodes[child].vtime)
            .min()
            .unwrap_or(0)
    }

    fn is_descendant(&self, mut id: u32, ancestor: u32) -> bool {
        while id != 0 {
            id = self.nodes[&id].parent;
            if id == ancestor {
                return true;
            }
        }
        false
    }

    fn detach(&mut self, stream_id: u32) {
        let parent = self.nodes[&stream_id].parent;
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.retain(|child| *child != stream_id);
        }
    }

    fn attach(&mut self, stream_id: u32, parent: u32, exclusive: bool) {
        let adopted = if exclusive {
            self.nodes
                .get_mut(&parent)
                .map(|node| std::mem::take(&mut node.children))
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        for child in &adopted {
            if let Some(node) = self.nodes.get_mut(child) {
                node.parent = stream_id;
            }
        }
        let vtime = self.min_vtime(parent);
        if let Some(node) = self.nodes.get_mut(&stream_id) {
            node.parent = parent;
            node.vtime = vtime;
            node.children.extend(adopted);
        }
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.push(stream_id);
        }
    }
}

//! Image dependency forest
//!
//! Built from an unordered image listing. Nodes live in an arena and refer
//! to each other by index. An image is placed once its parent is placed;
//! until then it is re-queued. Images whose parent is absent from the
//! listing become roots, and so does anything left when a full pass over
//! the queue places nothing (a parent cycle).

use crate::runtime::ImageInfo;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone)]
struct ForestNode {
    id: String,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Parent to children relation over a set of images
#[derive(Debug, Clone, Default)]
pub struct DependencyForest {
    nodes: Vec<ForestNode>,
    index: HashMap<String, usize>,
    roots: Vec<usize>,
}

impl DependencyForest {
    pub fn build(images: &[ImageInfo]) -> Self {
        let listed: HashSet<&str> = images.iter().map(|i| i.id.as_str()).collect();
        let mut forest = Self::default();
        let mut queue: VecDeque<(&str, Option<&str>)> = images
            .iter()
            .map(|i| {
                let parent = i
                    .parent_id
                    .as_deref()
                    .filter(|p| !p.is_empty() && listed.contains(p) && *p != i.id);
                (i.id.as_str(), parent)
            })
            .collect();

        let mut stalled = 0;
        while let Some((id, parent)) = queue.pop_front() {
            if forest.index.contains_key(id) {
                continue;
            }
            match parent {
                None => {
                    forest.insert(id, None);
                    stalled = 0;
                }
                Some(parent) => match forest.index.get(parent).copied() {
                    Some(parent_index) => {
                        forest.insert(id, Some(parent_index));
                        stalled = 0;
                    }
                    None if stalled > queue.len() => {
                        forest.insert(id, None);
                        stalled = 0;
                    }
                    None => {
                        queue.push_back((id, Some(parent)));
                        stalled += 1;
                    }
                },
            }
        }
        forest
    }

    fn insert(&mut self, id: &str, parent: Option<usize>) {
        let index = self.nodes.len();
        self.nodes.push(ForestNode {
            id: id.to_string(),
            parent,
            children: Vec::new(),
        });
        self.index.insert(id.to_string(), index);
        match parent {
            Some(p) => self.nodes[p].children.push(index),
            None => self.roots.push(index),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> Vec<&str> {
        self.roots.iter().map(|&i| self.nodes[i].id.as_str()).collect()
    }

    pub fn parent_of(&self, id: &str) -> Option<&str> {
        let node = &self.nodes[*self.index.get(id)?];
        node.parent.map(|p| self.nodes[p].id.as_str())
    }

    pub fn children_of(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| {
                self.nodes[i]
                    .children
                    .iter()
                    .map(|&c| self.nodes[c].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every image below `id`, excluding `id` itself
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut stack: Vec<usize> = self.nodes[start].children.iter().rev().copied().collect();
        while let Some(index) = stack.pop() {
            out.push(self.nodes[index].id.clone());
            stack.extend(self.nodes[index].children.iter().rev().copied());
        }
        out
    }

    /// All images with every child before its parent
    pub fn post_order(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.nodes.len());
        // (node, children already pushed)
        let mut stack: Vec<(usize, bool)> = self.roots.iter().rev().map(|&r| (r, false)).collect();
        while let Some((index, expanded)) = stack.pop() {
            if expanded {
                out.push(self.nodes[index].id.clone());
                continue;
            }
            stack.push((index, true));
            stack.extend(self.nodes[index].children.iter().rev().map(|&c| (c, false)));
        }
        out
    }
}

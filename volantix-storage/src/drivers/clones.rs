//! Copy-on-write clone dependency tracking.
//!
//! Drivers that implement copies as lightweight clones cannot reclaim a
//! volume's storage while clones still reference it. The tracker keeps the
//! dependency graph: deleting a volume with live clones defers reclamation,
//! and deleting the last clone cascades upward, releasing every deferred
//! ancestor whose references are gone.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
struct Node {
    parent: Option<String>,
    clones: HashSet<String>,
    deferred: bool,
}

#[derive(Debug, Default)]
pub struct CloneTracker {
    nodes: HashMap<String, Node>,
}

impl CloneTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `clone` was created as a copy-on-write child of `parent`.
    pub fn record_clone(&mut self, parent: &str, clone: &str) {
        self.nodes
            .entry(parent.to_string())
            .or_default()
            .clones
            .insert(clone.to_string());
        self.nodes.entry(clone.to_string()).or_default().parent = Some(parent.to_string());
    }

    pub fn has_clones(&self, name: &str) -> bool {
        self.nodes
            .get(name)
            .map(|n| !n.clones.is_empty())
            .unwrap_or(false)
    }

    /// True when the volume was deleted but its storage is still held for
    /// clones.
    pub fn is_deferred(&self, name: &str) -> bool {
        self.nodes.get(name).map(|n| n.deferred).unwrap_or(false)
    }

    /// Handle deletion of `name`.
    ///
    /// Returns the names whose physical storage can be reclaimed now,
    /// `name` first when its own reclamation is immediate, followed by any
    /// deferred ancestors freed by the cascade. An empty result means the
    /// deletion was deferred.
    pub fn release(&mut self, name: &str) -> Vec<String> {
        let node = self.nodes.entry(name.to_string()).or_default();
        if !node.clones.is_empty() {
            node.deferred = true;
            return Vec::new();
        }

        let mut reclaimed = Vec::new();
        let mut current = Some(name.to_string());

        while let Some(cur) = current {
            let node = match self.nodes.remove(&cur) {
                Some(node) => node,
                None => break,
            };
            reclaimed.push(cur.clone());

            current = match node.parent {
                Some(parent) => {
                    let freed = match self.nodes.get_mut(&parent) {
                        Some(parent_node) => {
                            parent_node.clones.remove(&cur);
                            parent_node.deferred && parent_node.clones.is_empty()
                        }
                        None => false,
                    };
                    freed.then_some(parent)
                }
                None => None,
            };
        }

        reclaimed
    }

    /// Keep the graph consistent across a volume rename.
    pub fn rename(&mut self, from: &str, to: &str) {
        let Some(node) = self.nodes.remove(from) else {
            return;
        };

        if let Some(parent) = &node.parent {
            if let Some(parent_node) = self.nodes.get_mut(parent) {
                parent_node.clones.remove(from);
                parent_node.clones.insert(to.to_string());
            }
        }

        for clone in &node.clones {
            if let Some(clone_node) = self.nodes.get_mut(clone) {
                clone_node.parent = Some(to.to_string());
            }
        }

        self.nodes.insert(to.to_string(), node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_without_clones_is_immediate() {
        let mut tracker = CloneTracker::new();
        assert_eq!(tracker.release("vol1"), vec!["vol1".to_string()]);
    }

    #[test]
    fn test_release_defers_while_clones_live() {
        let mut tracker = CloneTracker::new();
        tracker.record_clone("parent", "clone1");
        tracker.record_clone("parent", "clone2");

        assert!(tracker.release("parent").is_empty());
        assert!(tracker.is_deferred("parent"));

        // First clone gone, parent still referenced.
        assert_eq!(tracker.release("clone1"), vec!["clone1".to_string()]);
        assert!(tracker.is_deferred("parent"));

        // Last clone gone, parent reclaimed in the same pass.
        assert_eq!(
            tracker.release("clone2"),
            vec!["clone2".to_string(), "parent".to_string()]
        );
        assert!(!tracker.is_deferred("parent"));
    }

    #[test]
    fn test_cascade_walks_ancestors() {
        let mut tracker = CloneTracker::new();
        tracker.record_clone("grandparent", "parent");
        tracker.record_clone("parent", "child");

        assert!(tracker.release("grandparent").is_empty());
        assert!(tracker.release("parent").is_empty());

        assert_eq!(
            tracker.release("child"),
            vec![
                "child".to_string(),
                "parent".to_string(),
                "grandparent".to_string()
            ]
        );
    }

    #[test]
    fn test_rename_keeps_edges() {
        let mut tracker = CloneTracker::new();
        tracker.record_clone("parent", "clone1");
        tracker.rename("clone1", "clone1b");

        assert!(tracker.release("parent").is_empty());
        assert_eq!(
            tracker.release("clone1b"),
            vec!["clone1b".to_string(), "parent".to_string()]
        );
    }

    #[test]
    fn test_live_parent_not_reclaimed_by_cascade() {
        let mut tracker = CloneTracker::new();
        tracker.record_clone("parent", "clone1");

        // Parent was never deleted, so releasing the clone must not free it.
        assert_eq!(tracker.release("clone1"), vec!["clone1".to_string()]);
        assert!(!tracker.is_deferred("parent"));
        assert!(!tracker.has_clones("parent"));
    }
}

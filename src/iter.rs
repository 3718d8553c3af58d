//! Tree traversal cursors.
//!
//! The dispatcher walks the state tree in two orders: pre-order when
//! entering states (ancestors before descendants) and post-order when
//! exiting states and selecting transitions (descendants first, so the
//! innermost transition wins). Both cursors are bounded to the subtree they
//! were started on; the pre-order cursor can additionally prune the subtree
//! of the state it just yielded via [`PreOrder::skip_children`].

use crate::state::{StateId, Tree};

/// Pre-order cursor over a subtree.
pub struct PreOrder<'a> {
    tree: &'a Tree,
    root: StateId,
    next: Option<StateId>,
    last: Option<StateId>,
}

impl<'a> PreOrder<'a> {
    pub(crate) fn new(tree: &'a Tree, root: StateId) -> Self {
        Self {
            tree,
            root,
            next: Some(root),
            last: None,
        }
    }

    /// Prunes the subtree of the most recently yielded state.
    pub fn skip_children(&mut self) {
        if let Some(last) = self.last {
            self.next = successor(self.tree, last, self.root, false);
        }
    }
}

impl Iterator for PreOrder<'_> {
    type Item = StateId;

    fn next(&mut self) -> Option<StateId> {
        let current = self.next?;
        self.last = Some(current);
        self.next = successor(self.tree, current, self.root, true);
        Some(current)
    }
}

/// Computes the pre-order successor of `current` within the subtree of
/// `root`. With `descend` unset, the children of `current` are skipped.
fn successor(tree: &Tree, current: StateId, root: StateId, descend: bool) -> Option<StateId> {
    if descend {
        if let Some(child) = tree.node(current).first_child {
            return Some(child);
        }
    }
    let mut cursor = current;
    loop {
        if cursor == root {
            return None;
        }
        if let Some(sibling) = tree.node(cursor).next_sibling {
            return Some(sibling);
        }
        cursor = tree.node(cursor).parent?;
    }
}

/// Post-order cursor over a subtree.
pub struct PostOrder<'a> {
    tree: &'a Tree,
    root: StateId,
    next: Option<StateId>,
}

impl<'a> PostOrder<'a> {
    pub(crate) fn new(tree: &'a Tree, root: StateId) -> Self {
        Self {
            tree,
            root,
            next: Some(leftmost_leaf(tree, root)),
        }
    }
}

impl Iterator for PostOrder<'_> {
    type Item = StateId;

    fn next(&mut self) -> Option<StateId> {
        let current = self.next?;
        self.next = if current == self.root {
            None
        } else if let Some(sibling) = self.tree.node(current).next_sibling {
            Some(leftmost_leaf(self.tree, sibling))
        } else {
            self.tree.node(current).parent
        };
        Some(current)
    }
}

fn leftmost_leaf(tree: &Tree, mut state: StateId) -> StateId {
    while let Some(child) = tree.node(state).first_child {
        state = child;
    }
    state
}

/// Cursor over the direct children of a state, in insertion order.
pub struct Children<'a> {
    tree: &'a Tree,
    next: Option<StateId>,
}

impl<'a> Children<'a> {
    pub(crate) fn new(tree: &'a Tree, parent: StateId) -> Self {
        Self {
            tree,
            next: tree.node(parent).first_child,
        }
    }
}

impl Iterator for Children<'_> {
    type Item = StateId;

    fn next(&mut self) -> Option<StateId> {
        let current = self.next?;
        self.next = self.tree.node(current).next_sibling;
        Some(current)
    }
}

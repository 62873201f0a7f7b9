//! An intrusive AVL tree over nodes that carry their own linkage.
//!
//! The tree indexes `Free` regions by payload size for best-fit
//! lookups, but it never owns its nodes: callers link regions in and
//! out as their kind changes.  Nodes expose their linkage through the
//! `AvlNode` trait, which also lets the balance factor live in the
//! two spare header bits (offset by +2); the rebalancing code keeps
//! transient +/-2 factors in locals and only ever persists -1..=1.
use std::ptr::NonNull;

/// Link accessors an intrusive node must provide.  `key` drives the
/// ordering; duplicates are permitted.
pub(crate) trait AvlNode: Sized {
    fn parent(&self) -> *mut Self;
    fn set_parent(&mut self, parent: *mut Self);

    fn child(&self, right: bool) -> *mut Self;
    fn set_child(&mut self, right: bool, child: *mut Self);

    fn balance(&self) -> i8;
    fn set_balance(&mut self, balance: i8);

    fn key(&self) -> usize;
}

pub(crate) struct AvlTree<N: AvlNode> {
    root: *mut N,
}

impl<N: AvlNode> AvlTree<N> {
    pub fn new() -> AvlTree<N> {
        AvlTree {
            root: std::ptr::null_mut(),
        }
    }

    /// Links `node` into the tree.
    ///
    /// # Safety
    ///
    /// `node` must be valid, not currently linked into any tree, and
    /// must stay pinned while linked.
    pub unsafe fn insert(&mut self, node: NonNull<N>) {
        let node = node.as_ptr();

        (*node).set_child(false, std::ptr::null_mut());
        (*node).set_child(true, std::ptr::null_mut());
        (*node).set_balance(0);

        if self.root.is_null() {
            (*node).set_parent(std::ptr::null_mut());
            self.root = node;
            return;
        }

        let key = (*node).key();
        let mut current = self.root;

        loop {
            // Duplicates descend to the right so `lower_bound` finds
            // the leftmost match.
            let right = (*current).key() <= key;
            let child = (*current).child(right);

            if child.is_null() {
                (*current).set_child(right, node);
                (*node).set_parent(current);
                break;
            }

            current = child;
        }

        self.retrace_insert(node);
    }

    /// Links `node` into the tree near `hint` (typically the erased
    /// node's successor).  Falls back to a root descent when the hint
    /// position would break the ordering.
    ///
    /// # Safety
    ///
    /// Same as `insert`; `hint`, when provided, must be linked into
    /// this tree.
    pub unsafe fn insert_near(&mut self, hint: Option<NonNull<N>>, node: NonNull<N>) {
        if let Some(hint) = hint {
            let hint = hint.as_ptr();
            let n = node.as_ptr();

            if (*n).key() <= (*hint).key() && (*hint).child(false).is_null() {
                // With no left child, the hint's in-order predecessor
                // is the nearest ancestor holding it in its right
                // subtree.
                let mut current = hint;
                let mut predecessor = std::ptr::null_mut();

                loop {
                    let parent = (*current).parent();
                    if parent.is_null() {
                        break;
                    }
                    if (*parent).child(true) == current {
                        predecessor = parent;
                        break;
                    }
                    current = parent;
                }

                if predecessor.is_null() || (*predecessor).key() <= (*n).key() {
                    (*n).set_child(false, std::ptr::null_mut());
                    (*n).set_child(true, std::ptr::null_mut());
                    (*n).set_balance(0);
                    (*hint).set_child(false, n);
                    (*n).set_parent(hint);
                    self.retrace_insert(n);
                    return;
                }
            }
        }

        self.insert(node);
    }

    /// Unlinks `node` from the tree.
    ///
    /// # Safety
    ///
    /// `node` must be linked into this tree.
    pub unsafe fn erase(&mut self, node: NonNull<N>) {
        let node = node.as_ptr();
        let left = (*node).child(false);
        let right = (*node).child(true);

        if !left.is_null() && !right.is_null() {
            // Two children: relink the in-order successor into the
            // node's place (nodes are intrusive, so no payload swap).
            let mut succ = right;
            while !(*succ).child(false).is_null() {
                succ = (*succ).child(false);
            }

            let succ_parent = (*succ).parent();
            let succ_right = (*succ).child(true);
            let retrace_parent;
            let retrace_right;

            if succ_parent == node {
                // The successor is the right child itself.
                retrace_parent = succ;
                retrace_right = true;
            } else {
                (*succ_parent).set_child(false, succ_right);
                if !succ_right.is_null() {
                    (*succ_right).set_parent(succ_parent);
                }

                (*succ).set_child(true, right);
                (*right).set_parent(succ);

                retrace_parent = succ_parent;
                retrace_right = false;
            }

            (*succ).set_child(false, left);
            (*left).set_parent(succ);
            (*succ).set_balance((*node).balance());

            let parent = (*node).parent();
            self.replace_child(parent, node, succ);
            (*succ).set_parent(parent);

            self.retrace_delete(retrace_parent, retrace_right);
            return;
        }

        // At most one child: splice it into the node's slot.
        let child = if left.is_null() { right } else { left };
        let parent = (*node).parent();

        if parent.is_null() {
            self.root = child;
            if !child.is_null() {
                (*child).set_parent(std::ptr::null_mut());
            }
            return;
        }

        let was_right = (*parent).child(true) == node;
        (*parent).set_child(was_right, child);
        if !child.is_null() {
            (*child).set_parent(parent);
        }

        self.retrace_delete(parent, was_right);
    }

    /// Smallest node whose key is `>= key`, i.e. the best fit.
    ///
    /// # Safety
    ///
    /// All linked nodes must be valid.
    pub unsafe fn lower_bound(&self, key: usize) -> Option<NonNull<N>> {
        let mut best = std::ptr::null_mut();
        let mut current = self.root;

        while !current.is_null() {
            if (*current).key() >= key {
                best = current;
                current = (*current).child(false);
            } else {
                current = (*current).child(true);
            }
        }

        NonNull::new(best)
    }

    /// In-order successor of `node`, if any.
    ///
    /// # Safety
    ///
    /// `node` must be linked into this tree.
    pub unsafe fn successor(&self, node: NonNull<N>) -> Option<NonNull<N>> {
        let node = node.as_ptr();
        let right = (*node).child(true);

        if !right.is_null() {
            let mut current = right;
            while !(*current).child(false).is_null() {
                current = (*current).child(false);
            }
            return NonNull::new(current);
        }

        let mut current = node;
        loop {
            let parent = (*current).parent();
            if parent.is_null() {
                return None;
            }
            if (*parent).child(false) == current {
                return NonNull::new(parent);
            }
            current = parent;
        }
    }

    /// First node in key order, if any.
    ///
    /// # Safety
    ///
    /// All linked nodes must be valid.
    pub unsafe fn first(&self) -> Option<NonNull<N>> {
        let mut current = self.root;

        if current.is_null() {
            return None;
        }

        while !(*current).child(false).is_null() {
            current = (*current).child(false);
        }

        NonNull::new(current)
    }

    /// In-order iteration, for the debug dump and for invariant
    /// walks.
    ///
    /// # Safety
    ///
    /// The tree must not be mutated while the iterator is live.
    pub unsafe fn iter(&self) -> Iter<'_, N> {
        Iter {
            tree: self,
            next: self.first(),
        }
    }

    fn replace_child(&mut self, parent: *mut N, old: *mut N, new: *mut N) {
        unsafe {
            if parent.is_null() {
                self.root = new;
            } else if (*parent).child(true) == old {
                (*parent).set_child(true, new);
            } else {
                (*parent).set_child(false, new);
            }
        }
    }

    /// Walks up from a freshly linked `node`, adjusting balance
    /// factors and rotating at the first node that tips to +/-2.
    unsafe fn retrace_insert(&mut self, mut node: *mut N) {
        let mut parent = (*node).parent();

        while !parent.is_null() {
            let right = (*parent).child(true) == node;
            let balance = (*parent).balance() + if right { 1 } else { -1 };

            match balance {
                0 => {
                    (*parent).set_balance(0);
                    break;
                }
                1 | -1 => {
                    (*parent).set_balance(balance);
                    node = parent;
                    parent = (*node).parent();
                }
                _ => {
                    // The subtree regains its pre-insert height after
                    // one rotation; no ancestor changes.
                    let heavy = balance > 0;
                    let child = (*parent).child(heavy);
                    let opposite = if heavy { -1 } else { 1 };

                    if (*child).balance() == opposite {
                        self.rotate_double(parent, heavy);
                    } else {
                        self.rotate_single(parent, heavy);
                    }
                    break;
                }
            }
        }
    }

    /// Walks up from `parent`, whose `right` subtree just lost one
    /// level, rebalancing until the height change stops propagating.
    unsafe fn retrace_delete(&mut self, mut parent: *mut N, mut right: bool) {
        loop {
            let balance = (*parent).balance();
            let shrunk;

            if balance == 0 {
                (*parent).set_balance(if right { -1 } else { 1 });
                return;
            } else if balance == if right { 1 } else { -1 } {
                (*parent).set_balance(0);
                shrunk = parent;
            } else {
                // The untouched side was already heavier; rotate.
                let heavy = !right;
                let child = (*parent).child(heavy);
                let child_balance = (*child).balance();
                let opposite = if heavy { -1 } else { 1 };

                let new_sub = if child_balance == opposite {
                    self.rotate_double(parent, heavy)
                } else {
                    self.rotate_single(parent, heavy)
                };

                if child_balance == 0 {
                    // Single rotation with an even child keeps the
                    // subtree height.
                    return;
                }
                shrunk = new_sub;
            }

            let grandparent = (*shrunk).parent();
            if grandparent.is_null() {
                return;
            }
            right = (*grandparent).child(true) == shrunk;
            parent = grandparent;
        }
    }

    /// Single rotation of `node`, whose `right` side is too tall.
    /// Returns the subtree's new root, already linked to the old
    /// parent.
    unsafe fn rotate_single(&mut self, node: *mut N, right: bool) -> *mut N {
        let pivot = (*node).child(right);
        let inner = (*pivot).child(!right);

        (*node).set_child(right, inner);
        if !inner.is_null() {
            (*inner).set_parent(node);
        }

        (*pivot).set_child(!right, node);

        let parent = (*node).parent();
        (*pivot).set_parent(parent);
        self.replace_child(parent, node, pivot);
        (*node).set_parent(pivot);

        if (*pivot).balance() == 0 {
            // Only happens on the deletion path.
            (*node).set_balance(if right { 1 } else { -1 });
            (*pivot).set_balance(if right { -1 } else { 1 });
        } else {
            (*node).set_balance(0);
            (*pivot).set_balance(0);
        }

        pivot
    }

    /// Double rotation of `node`, whose `right` child leans the other
    /// way.  Returns the subtree's new root.
    unsafe fn rotate_double(&mut self, node: *mut N, right: bool) -> *mut N {
        let pivot = (*node).child(right);
        let tip = (*pivot).child(!right);

        let outer = (*tip).child(right);
        (*pivot).set_child(!right, outer);
        if !outer.is_null() {
            (*outer).set_parent(pivot);
        }
        (*tip).set_child(right, pivot);
        (*pivot).set_parent(tip);

        let inner = (*tip).child(!right);
        (*node).set_child(right, inner);
        if !inner.is_null() {
            (*inner).set_parent(node);
        }
        (*tip).set_child(!right, node);

        let parent = (*node).parent();
        (*tip).set_parent(parent);
        self.replace_child(parent, node, tip);
        (*node).set_parent(tip);

        let lean = (*tip).balance();
        if lean == 0 {
            (*node).set_balance(0);
            (*pivot).set_balance(0);
        } else if lean == if right { 1 } else { -1 } {
            (*node).set_balance(if right { -1 } else { 1 });
            (*pivot).set_balance(0);
        } else {
            (*node).set_balance(0);
            (*pivot).set_balance(if right { 1 } else { -1 });
        }
        (*tip).set_balance(0);

        tip
    }
}

pub(crate) struct Iter<'a, N: AvlNode> {
    tree: &'a AvlTree<N>,
    next: Option<NonNull<N>>,
}

impl<'a, N: AvlNode> Iterator for Iter<'a, N> {
    type Item = NonNull<N>;

    fn next(&mut self) -> Option<NonNull<N>> {
        let current = self.next?;

        self.next = unsafe { self.tree.successor(current) };
        Some(current)
    }
}

#[cfg(any(test, feature = "check_contracts"))]
impl<N: AvlNode> AvlTree<N> {
    /// Exhaustively checks ordering, parent links, and balance
    /// factors.  Returns the number of linked nodes.
    pub unsafe fn check_invariants(&self) -> usize {
        if self.root.is_null() {
            return 0;
        }

        assert!((*self.root).parent().is_null(), "root has a parent");

        let mut count = 0;
        let _ = self.check_subtree(self.root, &mut count);
        count
    }

    unsafe fn check_subtree(&self, node: *mut N, count: &mut usize) -> usize {
        *count += 1;

        let mut heights = [0usize; 2];

        for &right in &[false, true] {
            let child = (*node).child(right);
            if child.is_null() {
                continue;
            }

            assert_eq!((*child).parent(), node, "stale parent link");
            if right {
                assert!((*child).key() >= (*node).key(), "misordered right child");
            } else {
                assert!((*child).key() <= (*node).key(), "misordered left child");
            }

            heights[right as usize] = self.check_subtree(child, count);
        }

        let balance = heights[1] as i64 - heights[0] as i64;
        assert!(balance.abs() <= 1, "unbalanced node");
        assert_eq!(
            balance as i8,
            (*node).balance(),
            "stored balance factor disagrees with heights"
        );

        1 + heights[0].max(heights[1])
    }
}

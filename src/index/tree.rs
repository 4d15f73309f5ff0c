//! An arena-backed AVL tree with caller-supplied comparators, augmented
//! with a max-end item per subtree for interval overlap search.
//!
//! Interval keys are dynamic (they resolve through sequence references), so
//! this tree takes its ordering as an argument on every call rather than
//! via `Ord`. Callers guarantee keys are stable between mutations: any
//! operation that moves an endpoint removes the interval first and
//! re-inserts it afterwards.
//!
//! Nodes live in a `Vec` arena and are referenced by index, with a free
//! list for recycling. Equal keys are permitted; removal identifies the
//! exact element via `TreeOps::same`.

use std::cmp::Ordering;

pub(crate) trait TreeOps<T> {
    /// Primary key order.
    fn cmp_key(&self, a: &T, b: &T) -> Ordering;

    /// Order used by the max augmentation (end-position order). Trees that
    /// never run overlap queries can alias this to `cmp_key`.
    fn cmp_aug(&self, a: &T, b: &T) -> Ordering;

    /// Element identity, for removal among equal keys.
    fn same(&self, a: &T, b: &T) -> bool;

    /// start(item) vs end(query); only needed for overlap search.
    fn cmp_item_start_to_query_end(&self, _item: &T, _query: &T) -> Ordering {
        panic!("Internal consistency error: overlap search on a non-interval tree")
    }

    /// end(item) vs start(query); only needed for overlap search.
    fn cmp_item_end_to_query_start(&self, _item: &T, _query: &T) -> Ordering {
        panic!("Internal consistency error: overlap search on a non-interval tree")
    }
}

struct Node<T> {
    item: T,
    left: Option<u32>,
    right: Option<u32>,
    height: u8,
    /// The item with the greatest `cmp_aug` order in this subtree.
    max: T,
}

pub(crate) struct AvlTree<T: Clone> {
    nodes: Vec<Node<T>>,
    free: Vec<u32>,
    root: Option<u32>,
    len: usize,
}

impl<T: Clone> Default for AvlTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> AvlTree<T> {
    pub fn new() -> Self {
        AvlTree {
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node(&self, idx: u32) -> &Node<T> {
        &self.nodes[idx as usize]
    }

    fn node_mut(&mut self, idx: u32) -> &mut Node<T> {
        &mut self.nodes[idx as usize]
    }

    fn height_of(&self, idx: Option<u32>) -> i32 {
        idx.map_or(0, |i| self.node(i).height as i32)
    }

    fn alloc(&mut self, item: T) -> u32 {
        let node = Node {
            max: item.clone(),
            item,
            left: None,
            right: None,
            height: 1,
        };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = node;
            idx
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as u32
        }
    }

    /// Recompute height and max from children.
    fn update(&mut self, idx: u32, ops: &dyn TreeOps<T>) {
        let (left, right) = {
            let n = self.node(idx);
            (n.left, n.right)
        };
        let height = 1 + self.height_of(left).max(self.height_of(right));
        let mut max = self.node(idx).item.clone();
        for child in [left, right].into_iter().flatten() {
            let child_max = self.node(child).max.clone();
            if ops.cmp_aug(&child_max, &max) == Ordering::Greater {
                max = child_max;
            }
        }
        let n = self.node_mut(idx);
        n.height = height as u8;
        n.max = max;
    }

    fn rotate_left(&mut self, idx: u32, ops: &dyn TreeOps<T>) -> u32 {
        let pivot = self.node(idx).right.expect("rotate_left without right child");
        let moved = self.node(pivot).left;
        self.node_mut(idx).right = moved;
        self.node_mut(pivot).left = Some(idx);
        self.update(idx, ops);
        self.update(pivot, ops);
        pivot
    }

    fn rotate_right(&mut self, idx: u32, ops: &dyn TreeOps<T>) -> u32 {
        let pivot = self.node(idx).left.expect("rotate_right without left child");
        let moved = self.node(pivot).right;
        self.node_mut(idx).left = moved;
        self.node_mut(pivot).right = Some(idx);
        self.update(idx, ops);
        self.update(pivot, ops);
        pivot
    }

    fn rebalance(&mut self, idx: u32, ops: &dyn TreeOps<T>) -> u32 {
        self.update(idx, ops);
        let (left, right) = {
            let n = self.node(idx);
            (n.left, n.right)
        };
        let balance = self.height_of(left) - self.height_of(right);
        if balance > 1 {
            let left = left.expect("left-heavy without left child");
            let (ll, lr) = {
                let n = self.node(left);
                (n.left, n.right)
            };
            if self.height_of(ll) < self.height_of(lr) {
                let new_left = self.rotate_left(left, ops);
                self.node_mut(idx).left = Some(new_left);
            }
            self.rotate_right(idx, ops)
        } else if balance < -1 {
            let right = right.expect("right-heavy without right child");
            let (rl, rr) = {
                let n = self.node(right);
                (n.left, n.right)
            };
            if self.height_of(rr) < self.height_of(rl) {
                let new_right = self.rotate_right(right, ops);
                self.node_mut(idx).right = Some(new_right);
            }
            self.rotate_left(idx, ops)
        } else {
            idx
        }
    }

    pub fn insert(&mut self, item: T, ops: &dyn TreeOps<T>) {
        self.root = Some(self.insert_rec(self.root, item, ops));
        self.len += 1;
    }

    fn insert_rec(&mut self, node: Option<u32>, item: T, ops: &dyn TreeOps<T>) -> u32 {
        let Some(idx) = node else {
            return self.alloc(item);
        };
        // Equal keys descend right so insertion order is stable in-order.
        if ops.cmp_key(&item, &self.node(idx).item) == Ordering::Less {
            let new_left = self.insert_rec(self.node(idx).left, item, ops);
            self.node_mut(idx).left = Some(new_left);
        } else {
            let new_right = self.insert_rec(self.node(idx).right, item, ops);
            self.node_mut(idx).right = Some(new_right);
        }
        self.rebalance(idx, ops)
    }

    pub fn remove(&mut self, item: &T, ops: &dyn TreeOps<T>) -> bool {
        let (new_root, removed) = self.remove_rec(self.root, item, ops);
        self.root = new_root;
        if removed {
            self.len -= 1;
        }
        removed
    }

    fn remove_rec(
        &mut self,
        node: Option<u32>,
        item: &T,
        ops: &dyn TreeOps<T>,
    ) -> (Option<u32>, bool) {
        let Some(idx) = node else {
            return (None, false);
        };
        match ops.cmp_key(item, &self.node(idx).item) {
            Ordering::Less => {
                let (new_left, removed) = self.remove_rec(self.node(idx).left, item, ops);
                self.node_mut(idx).left = new_left;
                if removed {
                    (Some(self.rebalance(idx, ops)), true)
                } else {
                    (Some(idx), false)
                }
            }
            Ordering::Greater => {
                let (new_right, removed) = self.remove_rec(self.node(idx).right, item, ops);
                self.node_mut(idx).right = new_right;
                if removed {
                    (Some(self.rebalance(idx, ops)), true)
                } else {
                    (Some(idx), false)
                }
            }
            Ordering::Equal => {
                if ops.same(item, &self.node(idx).item) {
                    (self.remove_node(idx, ops), true)
                } else {
                    // Rotations scatter equal keys to both sides; search
                    // right first (insertion leans right), then left.
                    let (new_right, removed) = self.remove_rec(self.node(idx).right, item, ops);
                    if removed {
                        self.node_mut(idx).right = new_right;
                        return (Some(self.rebalance(idx, ops)), true);
                    }
                    let (new_left, removed) = self.remove_rec(self.node(idx).left, item, ops);
                    if removed {
                        self.node_mut(idx).left = new_left;
                        return (Some(self.rebalance(idx, ops)), true);
                    }
                    (Some(idx), false)
                }
            }
        }
    }

    fn remove_node(&mut self, idx: u32, ops: &dyn TreeOps<T>) -> Option<u32> {
        let (left, right) = {
            let n = self.node(idx);
            (n.left, n.right)
        };
        let replacement = match (left, right) {
            (None, None) => None,
            (Some(child), None) | (None, Some(child)) => Some(child),
            (Some(_), Some(right)) => {
                let (new_right, successor) = self.remove_min(right, ops);
                self.node_mut(idx).item = successor;
                self.node_mut(idx).right = new_right;
                return Some(self.rebalance(idx, ops));
            }
        };
        self.free.push(idx);
        replacement
    }

    fn remove_min(&mut self, idx: u32, ops: &dyn TreeOps<T>) -> (Option<u32>, T) {
        match self.node(idx).left {
            Some(left) => {
                let (new_left, min) = self.remove_min(left, ops);
                self.node_mut(idx).left = new_left;
                (Some(self.rebalance(idx, ops)), min)
            }
            None => {
                let right = self.node(idx).right;
                let item = self.node(idx).item.clone();
                self.free.push(idx);
                (right, item)
            }
        }
    }

    /// Greatest item with key <= probe.
    pub fn floor(&self, probe: &T, ops: &dyn TreeOps<T>) -> Option<T> {
        let mut candidate = None;
        let mut current = self.root;
        while let Some(idx) = current {
            if ops.cmp_key(&self.node(idx).item, probe) != Ordering::Greater {
                candidate = Some(self.node(idx).item.clone());
                current = self.node(idx).right;
            } else {
                current = self.node(idx).left;
            }
        }
        candidate
    }

    /// Least item with key >= probe.
    pub fn ceil(&self, probe: &T, ops: &dyn TreeOps<T>) -> Option<T> {
        let mut candidate = None;
        let mut current = self.root;
        while let Some(idx) = current {
            if ops.cmp_key(&self.node(idx).item, probe) != Ordering::Less {
                candidate = Some(self.node(idx).item.clone());
                current = self.node(idx).left;
            } else {
                current = self.node(idx).right;
            }
        }
        candidate
    }

    pub fn for_each(&self, f: &mut dyn FnMut(&T)) {
        self.in_order(self.root, f);
    }

    fn in_order(&self, node: Option<u32>, f: &mut dyn FnMut(&T)) {
        let Some(idx) = node else { return };
        self.in_order(self.node(idx).left, f);
        f(&self.node(idx).item);
        self.in_order(self.node(idx).right, f);
    }

    pub fn for_each_rev(&self, f: &mut dyn FnMut(&T)) {
        self.in_order_rev(self.root, f);
    }

    fn in_order_rev(&self, node: Option<u32>, f: &mut dyn FnMut(&T)) {
        let Some(idx) = node else { return };
        self.in_order_rev(self.node(idx).right, f);
        f(&self.node(idx).item);
        self.in_order_rev(self.node(idx).left, f);
    }

    /// In-order visit of every item with `lo <= key <= hi`.
    pub fn for_each_in_range(&self, lo: &T, hi: &T, ops: &dyn TreeOps<T>, f: &mut dyn FnMut(&T)) {
        self.range_rec(self.root, lo, hi, ops, f);
    }

    fn range_rec(
        &self,
        node: Option<u32>,
        lo: &T,
        hi: &T,
        ops: &dyn TreeOps<T>,
        f: &mut dyn FnMut(&T),
    ) {
        let Some(idx) = node else { return };
        let item_vs_lo = ops.cmp_key(&self.node(idx).item, lo);
        let item_vs_hi = ops.cmp_key(&self.node(idx).item, hi);
        if item_vs_lo != Ordering::Less {
            self.range_rec(self.node(idx).left, lo, hi, ops, f);
        }
        if item_vs_lo != Ordering::Less && item_vs_hi != Ordering::Greater {
            f(&self.node(idx).item);
        }
        if item_vs_hi != Ordering::Greater {
            self.range_rec(self.node(idx).right, lo, hi, ops, f);
        }
    }

    /// Visit every item overlapping `query`:
    /// `start(item) <= end(query) && end(item) >= start(query)`.
    pub fn for_each_overlapping(&self, query: &T, ops: &dyn TreeOps<T>, f: &mut dyn FnMut(&T)) {
        self.overlap_rec(self.root, query, ops, f);
    }

    fn overlap_rec(
        &self,
        node: Option<u32>,
        query: &T,
        ops: &dyn TreeOps<T>,
        f: &mut dyn FnMut(&T),
    ) {
        let Some(idx) = node else { return };
        // Nothing in this subtree ends at or after the query start.
        if ops.cmp_item_end_to_query_start(&self.node(idx).max, query) == Ordering::Less {
            return;
        }
        self.overlap_rec(self.node(idx).left, query, ops, f);
        if ops.cmp_item_start_to_query_end(&self.node(idx).item, query) != Ordering::Greater {
            if ops.cmp_item_end_to_query_start(&self.node(idx).item, query) != Ordering::Less {
                f(&self.node(idx).item);
            }
            self.overlap_rec(self.node(idx).right, query, ops, f);
        }
    }

    #[cfg(test)]
    fn check_invariants(&self, ops: &dyn TreeOps<T>) {
        fn rec<T: Clone>(tree: &AvlTree<T>, node: Option<u32>, ops: &dyn TreeOps<T>) -> i32 {
            let Some(idx) = node else { return 0 };
            let n = tree.node(idx);
            let lh = rec(tree, n.left, ops);
            let rh = rec(tree, n.right, ops);
            assert!((lh - rh).abs() <= 1, "AVL balance violated");
            assert_eq!(n.height as i32, 1 + lh.max(rh), "height stale");
            if let Some(left) = n.left {
                assert_ne!(
                    ops.cmp_key(&tree.node(left).item, &n.item),
                    Ordering::Greater,
                    "BST order violated"
                );
                assert_ne!(
                    ops.cmp_aug(&tree.node(left).max, &n.max),
                    Ordering::Greater,
                    "max augmentation stale"
                );
            }
            if let Some(right) = n.right {
                assert_ne!(
                    ops.cmp_key(&n.item, &tree.node(right).item),
                    Ordering::Greater,
                    "BST order violated"
                );
                assert_ne!(
                    ops.cmp_aug(&tree.node(right).max, &n.max),
                    Ordering::Greater,
                    "max augmentation stale"
                );
            }
            1 + lh.max(rh)
        }
        rec(self, self.root, ops);
    }
}

//! Interval index: runs ordered by start address.
//!
//! The index is a red-black tree stored in a `Vec` arena (indices instead of pointers), keyed by
//! [`Keyed::key`]. It answers three questions in a single descent:
//!
//! - is there an entry starting exactly at an address,
//! - which entry has the greatest start `<=` the address,
//! - which entry has the least start `>=` the address.
//!
//! Red-black rules maintained by every operation:
//!
//! 1. The root is black.
//! 2. A red node never has a red child.
//! 3. Every path from a node down to a missing child crosses the same number of black nodes.

/// Something that can be stored in an [`IntervalIndex`].
pub trait Keyed {
    /// Ordering key (the start address for runs).
    fn key(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

type Link = Option<usize>;

#[derive(Debug, Clone)]
struct Node<T> {
    item: T,
    color: Color,
    parent: Link,
    left: Link,
    right: Link,
}

/// Result of [`IntervalIndex::find`].
#[derive(Debug)]
pub struct Lookup<'a, T> {
    /// Entry whose key equals the address.
    pub exact: Option<&'a T>,
    /// Entry with the greatest key `<=` the address (equals `exact` when there is one).
    pub before: Option<&'a T>,
    /// Entry with the least key `>=` the address (equals `exact` when there is one).
    pub after: Option<&'a T>,
}

/// Result of [`IntervalIndex::remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed<T> {
    /// The removed entry.
    pub item: T,
    /// Whether the tree's black height shrank as a result of the removal.
    pub black_height_decreased: bool,
}

/// Balanced ordered index over [`Keyed`] entries.
#[derive(Debug, Clone)]
pub struct IntervalIndex<T> {
    nodes: Vec<Node<T>>,
    root: Link,
}

impl<T> Default for IntervalIndex<T> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
        }
    }
}

impl<T: Keyed> IntervalIndex<T> {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the index has no entries.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root = None;
    }

    /// Insert an entry. Fails (returning the entry) if its key is already present.
    pub fn insert(&mut self, item: T) -> Result<(), T> {
        let key = item.key();
        let mut parent = None;
        let mut cursor = self.root;
        let mut go_left = false;

        while let Some(id) = cursor {
            let existing = self.key_of(id);
            if key == existing {
                return Err(item);
            }
            parent = Some(id);
            go_left = key < existing;
            cursor = if go_left {
                self.nodes[id].left
            } else {
                self.nodes[id].right
            };
        }

        let id = self.nodes.len();
        self.nodes.push(Node {
            item,
            color: Color::Red,
            parent,
            left: None,
            right: None,
        });

        match parent {
            None => self.root = Some(id),
            Some(p) if go_left => self.nodes[p].left = Some(id),
            Some(p) => self.nodes[p].right = Some(id),
        }

        self.insert_fixup(id);
        Ok(())
    }

    /// Remove the entry with the given key, if present.
    pub fn remove(&mut self, key: usize) -> Option<Removed<T>> {
        let z = self.find_node(key)?;
        let height_before = self.black_height();

        let mut removed_color = self.nodes[z].color;
        let x;
        let x_parent;

        match (self.nodes[z].left, self.nodes[z].right) {
            (None, right) => {
                x = right;
                x_parent = self.nodes[z].parent;
                self.transplant(z, right);
            }
            (left, None) => {
                x = left;
                x_parent = self.nodes[z].parent;
                self.transplant(z, left);
            }
            (Some(left), Some(right)) => {
                let y = self.minimum(right);
                removed_color = self.nodes[y].color;
                x = self.nodes[y].right;

                if self.nodes[y].parent == Some(z) {
                    x_parent = Some(y);
                } else {
                    x_parent = self.nodes[y].parent;
                    self.transplant(y, x);
                    self.nodes[y].right = Some(right);
                    self.nodes[right].parent = Some(y);
                }

                self.transplant(z, Some(y));
                self.nodes[y].left = Some(left);
                self.nodes[left].parent = Some(y);
                self.nodes[y].color = self.nodes[z].color;
            }
        }

        if removed_color == Color::Black {
            self.delete_fixup(x, x_parent);
        }

        let item = self.release(z)?;
        let height_after = self.black_height();
        Some(Removed {
            item,
            black_height_decreased: height_after < height_before,
        })
    }

    /// Locate `key` and its neighbors in one descent.
    pub fn find(&self, key: usize) -> Lookup<'_, T> {
        let mut lookup = Lookup {
            exact: None,
            before: None,
            after: None,
        };

        let mut cursor = self.root;
        while let Some(id) = cursor {
            let node = &self.nodes[id];
            let existing = node.item.key();
            if existing == key {
                lookup.exact = Some(&node.item);
                lookup.before = Some(&node.item);
                lookup.after = Some(&node.item);
                break;
            }
            if existing < key {
                lookup.before = Some(&node.item);
                cursor = node.right;
            } else {
                lookup.after = Some(&node.item);
                cursor = node.left;
            }
        }

        lookup
    }

    /// Entry whose key equals `key`.
    pub fn get(&self, key: usize) -> Option<&T> {
        self.find_node(key).map(|id| &self.nodes[id].item)
    }

    /// Entry with the greatest key `<= key`.
    pub fn at_or_before(&self, key: usize) -> Option<&T> {
        self.find(key).before
    }

    /// Entry with the least key `>= key`.
    pub fn at_or_after(&self, key: usize) -> Option<&T> {
        self.find(key).after
    }

    /// Entry with the smallest key.
    pub fn first(&self) -> Option<&T> {
        self.root.map(|root| &self.nodes[self.minimum(root)].item)
    }

    /// Entry with the largest key.
    pub fn last(&self) -> Option<&T> {
        let mut id = self.root?;
        while let Some(right) = self.nodes[id].right {
            id = right;
        }
        Some(&self.nodes[id].item)
    }

    /// In-order iteration over all entries.
    pub fn iter(&self) -> Iter<'_, T> {
        self.iter_from(0)
    }

    /// In-order iteration over entries with key `>= key`.
    pub fn iter_from(&self, key: usize) -> Iter<'_, T> {
        let mut stack = Vec::new();
        let mut cursor = self.root;
        while let Some(id) = cursor {
            if self.key_of(id) >= key {
                stack.push(id);
                cursor = self.nodes[id].left;
            } else {
                cursor = self.nodes[id].right;
            }
        }
        Iter { index: self, stack }
    }

    /// Number of nodes on the longest root-to-leaf path.
    pub fn height(&self) -> usize {
        fn depth<T>(nodes: &[Node<T>], link: Link) -> usize {
            match link {
                None => 0,
                Some(id) => 1 + depth(nodes, nodes[id].left).max(depth(nodes, nodes[id].right)),
            }
        }
        depth(&self.nodes, self.root)
    }

    /// Number of black nodes on the path from the root to the leftmost leaf.
    pub fn black_height(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.root;
        while let Some(id) = cursor {
            if self.nodes[id].color == Color::Black {
                count += 1;
            }
            cursor = self.nodes[id].left;
        }
        count
    }

    /// Verify ordering, parent links, and the red-black rules.
    ///
    /// Returns the black height on success and a description of the first violation otherwise.
    pub fn check_invariants(&self) -> Result<usize, String> {
        if let Some(root) = self.root {
            if self.nodes[root].color != Color::Black {
                return Err("root is red".to_string());
            }
            if self.nodes[root].parent.is_some() {
                return Err("root has a parent".to_string());
            }
        }

        let mut visited = 0usize;
        let height = self.check_subtree(self.root, None, None, &mut visited)?;
        if visited != self.nodes.len() {
            return Err(format!(
                "{} nodes reachable from the root but {} stored",
                visited,
                self.nodes.len()
            ));
        }
        Ok(height)
    }

    fn check_subtree(
        &self,
        link: Link,
        lower: Option<usize>,
        upper: Option<usize>,
        visited: &mut usize,
    ) -> Result<usize, String> {
        let Some(id) = link else {
            return Ok(0);
        };
        *visited += 1;

        let node = &self.nodes[id];
        let key = node.item.key();
        if lower.is_some_and(|lower| key <= lower) || upper.is_some_and(|upper| key >= upper) {
            return Err(format!("key {:#X} is out of order", key));
        }

        for child in [node.left, node.right].into_iter().flatten() {
            if self.nodes[child].parent != Some(id) {
                return Err(format!("child of {:#X} has a stale parent link", key));
            }
            if node.color == Color::Red && self.nodes[child].color == Color::Red {
                return Err(format!("red node {:#X} has a red child", key));
            }
        }

        let left = self.check_subtree(node.left, lower, Some(key), visited)?;
        let right = self.check_subtree(node.right, Some(key), upper, visited)?;
        if left != right {
            return Err(format!(
                "black height differs under {:#X} ({} vs {})",
                key, left, right
            ));
        }

        Ok(left + usize::from(node.color == Color::Black))
    }

    fn key_of(&self, id: usize) -> usize {
        self.nodes[id].item.key()
    }

    fn is_red(&self, link: Link) -> bool {
        link.is_some_and(|id| self.nodes[id].color == Color::Red)
    }

    fn find_node(&self, key: usize) -> Option<usize> {
        let mut cursor = self.root;
        while let Some(id) = cursor {
            let existing = self.key_of(id);
            if existing == key {
                return Some(id);
            }
            cursor = if key < existing {
                self.nodes[id].left
            } else {
                self.nodes[id].right
            };
        }
        None
    }

    fn minimum(&self, mut id: usize) -> usize {
        while let Some(left) = self.nodes[id].left {
            id = left;
        }
        id
    }

    fn replace_child(&mut self, parent: Link, old: usize, new: Link) {
        match parent {
            None => self.root = new,
            Some(p) if self.nodes[p].left == Some(old) => self.nodes[p].left = new,
            Some(p) => self.nodes[p].right = new,
        }
    }

    fn transplant(&mut self, old: usize, new: Link) {
        let parent = self.nodes[old].parent;
        self.replace_child(parent, old, new);
        if let Some(new) = new {
            self.nodes[new].parent = parent;
        }
    }

    fn rotate_left(&mut self, x: usize) {
        let Some(y) = self.nodes[x].right else {
            return;
        };
        let inner = self.nodes[y].left;
        self.nodes[x].right = inner;
        if let Some(inner) = inner {
            self.nodes[inner].parent = Some(x);
        }
        let parent = self.nodes[x].parent;
        self.nodes[y].parent = parent;
        self.replace_child(parent, x, Some(y));
        self.nodes[y].left = Some(x);
        self.nodes[x].parent = Some(y);
    }

    fn rotate_right(&mut self, x: usize) {
        let Some(y) = self.nodes[x].left else {
            return;
        };
        let inner = self.nodes[y].right;
        self.nodes[x].left = inner;
        if let Some(inner) = inner {
            self.nodes[inner].parent = Some(x);
        }
        let parent = self.nodes[x].parent;
        self.nodes[y].parent = parent;
        self.replace_child(parent, x, Some(y));
        self.nodes[y].right = Some(x);
        self.nodes[x].parent = Some(y);
    }

    fn insert_fixup(&mut self, mut z: usize) {
        while let Some(p) = self.nodes[z].parent
            && self.nodes[p].color == Color::Red
        {
            // A red parent is never the root, so the grandparent exists.
            let Some(g) = self.nodes[p].parent else {
                break;
            };

            if self.nodes[g].left == Some(p) {
                let uncle = self.nodes[g].right;
                if let Some(u) = uncle
                    && self.nodes[u].color == Color::Red
                {
                    self.nodes[p].color = Color::Black;
                    self.nodes[u].color = Color::Black;
                    self.nodes[g].color = Color::Red;
                    z = g;
                    continue;
                }
                if self.nodes[p].right == Some(z) {
                    z = p;
                    self.rotate_left(z);
                }
                let Some(p) = self.nodes[z].parent else {
                    break;
                };
                let Some(g) = self.nodes[p].parent else {
                    break;
                };
                self.nodes[p].color = Color::Black;
                self.nodes[g].color = Color::Red;
                self.rotate_right(g);
            } else {
                let uncle = self.nodes[g].left;
                if let Some(u) = uncle
                    && self.nodes[u].color == Color::Red
                {
                    self.nodes[p].color = Color::Black;
                    self.nodes[u].color = Color::Black;
                    self.nodes[g].color = Color::Red;
                    z = g;
                    continue;
                }
                if self.nodes[p].left == Some(z) {
                    z = p;
                    self.rotate_right(z);
                }
                let Some(p) = self.nodes[z].parent else {
                    break;
                };
                let Some(g) = self.nodes[p].parent else {
                    break;
                };
                self.nodes[p].color = Color::Black;
                self.nodes[g].color = Color::Red;
                self.rotate_left(g);
            }
        }

        if let Some(root) = self.root {
            self.nodes[root].color = Color::Black;
        }
    }

    fn delete_fixup(&mut self, mut x: Link, mut parent: Link) {
        while x != self.root && !self.is_red(x) {
            let Some(p) = parent else {
                break;
            };

            if self.nodes[p].left == x {
                let mut w = self.nodes[p].right;
                if let Some(sibling) = w
                    && self.nodes[sibling].color == Color::Red
                {
                    self.nodes[sibling].color = Color::Black;
                    self.nodes[p].color = Color::Red;
                    self.rotate_left(p);
                    w = self.nodes[p].right;
                }
                // A doubly-black position always has a sibling.
                let Some(mut sibling) = w else {
                    x = Some(p);
                    parent = self.nodes[p].parent;
                    continue;
                };

                if !self.is_red(self.nodes[sibling].left) && !self.is_red(self.nodes[sibling].right) {
                    self.nodes[sibling].color = Color::Red;
                    x = Some(p);
                    parent = self.nodes[p].parent;
                } else {
                    if !self.is_red(self.nodes[sibling].right) {
                        if let Some(near) = self.nodes[sibling].left {
                            self.nodes[near].color = Color::Black;
                        }
                        self.nodes[sibling].color = Color::Red;
                        self.rotate_right(sibling);
                        let Some(rotated) = self.nodes[p].right else {
                            break;
                        };
                        sibling = rotated;
                    }
                    self.nodes[sibling].color = self.nodes[p].color;
                    self.nodes[p].color = Color::Black;
                    if let Some(far) = self.nodes[sibling].right {
                        self.nodes[far].color = Color::Black;
                    }
                    self.rotate_left(p);
                    x = self.root;
                    parent = None;
                }
            } else {
                let mut w = self.nodes[p].left;
                if let Some(sibling) = w
                    && self.nodes[sibling].color == Color::Red
                {
                    self.nodes[sibling].color = Color::Black;
                    self.nodes[p].color = Color::Red;
                    self.rotate_right(p);
                    w = self.nodes[p].left;
                }
                let Some(mut sibling) = w else {
                    x = Some(p);
                    parent = self.nodes[p].parent;
                    continue;
                };

                if !self.is_red(self.nodes[sibling].left) && !self.is_red(self.nodes[sibling].right) {
                    self.nodes[sibling].color = Color::Red;
                    x = Some(p);
                    parent = self.nodes[p].parent;
                } else {
                    if !self.is_red(self.nodes[sibling].left) {
                        if let Some(near) = self.nodes[sibling].right {
                            self.nodes[near].color = Color::Black;
                        }
                        self.nodes[sibling].color = Color::Red;
                        self.rotate_left(sibling);
                        let Some(rotated) = self.nodes[p].left else {
                            break;
                        };
                        sibling = rotated;
                    }
                    self.nodes[sibling].color = self.nodes[p].color;
                    self.nodes[p].color = Color::Black;
                    if let Some(far) = self.nodes[sibling].left {
                        self.nodes[far].color = Color::Black;
                    }
                    self.rotate_right(p);
                    x = self.root;
                    parent = None;
                }
            }
        }

        if let Some(x) = x {
            self.nodes[x].color = Color::Black;
        }
    }

    /// Drop an unlinked node from the arena, moving the last slot into its place.
    fn release(&mut self, id: usize) -> Option<T> {
        let last = self.nodes.len().checked_sub(1)?;
        if id != last {
            self.nodes.swap(id, last);
            let (parent, left, right) = {
                let moved = &self.nodes[id];
                (moved.parent, moved.left, moved.right)
            };
            match parent {
                None => self.root = Some(id),
                Some(p) if self.nodes[p].left == Some(last) => self.nodes[p].left = Some(id),
                Some(p) => self.nodes[p].right = Some(id),
            }
            for child in [left, right].into_iter().flatten() {
                self.nodes[child].parent = Some(id);
            }
        }
        self.nodes.pop().map(|node| node.item)
    }
}

/// In-order iterator returned by [`IntervalIndex::iter`] and [`IntervalIndex::iter_from`].
pub struct Iter<'a, T> {
    index: &'a IntervalIndex<T>,
    stack: Vec<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let nodes = &self.index.nodes;
        let mut cursor = nodes[id].right;
        while let Some(child) = cursor {
            self.stack.push(child);
            cursor = nodes[child].left;
        }
        Some(&nodes[id].item)
    }
}

//! Red-black tree over directory siblings.
//!
//! The tree is persistent in the directory records themselves: a parent
//! entry's `child` SID points at the tree root, each node's `left`/`right`
//! SIDs are its tree children, and the color bit lives in the record. Parent
//! pointers are not on disk; a transient map is rebuilt whenever a tree is
//! loaded.

use super::entry::{name_cmp, Color};
use super::Directory;
use crate::consts::NOSTREAM;
use crate::error::{CfbError, Result};
use std::cmp::Ordering;
use std::collections::HashMap;

/// A view over one storage's children, rooted at the SID stored in the
/// parent entry. Mutations rebalance in place; the caller re-publishes
/// `root()` into the parent's child SID afterwards.
pub struct RbTree<'d> {
    dir: &'d mut Directory,
    root: u32,
    parent: HashMap<u32, u32>,
}

impl<'d> RbTree<'d> {
    /// Load the tree rooted at `root`, rebuilding transient parent pointers.
    ///
    /// Sibling SIDs that are out of range, reference invalid entries, or
    /// close a cycle fail with `CorruptedFile` under `strict`; otherwise the
    /// offending link is cut and traversal continues on the intact portion.
    pub fn load(dir: &'d mut Directory, root: u32, strict: bool) -> Result<RbTree<'d>> {
        let mut tree = RbTree { dir, root, parent: HashMap::new() };
        if tree.root == NOSTREAM {
            return Ok(tree);
        }
        if !tree.link_ok(tree.root) {
            if strict {
                return Err(CfbError::CorruptedFile(format!(
                    "child SID {} does not reference a live entry",
                    tree.root
                )));
            }
            log::warn!("skipping unreadable child SID {}", tree.root);
            tree.root = NOSTREAM;
            return Ok(tree);
        }
        tree.parent.insert(tree.root, NOSTREAM);
        let mut stack = vec![tree.root];
        while let Some(sid) = stack.pop() {
            for go_left in [true, false] {
                let child = if go_left { tree.left(sid) } else { tree.right(sid) };
                if child == NOSTREAM {
                    continue;
                }
                if !tree.link_ok(child) || tree.parent.contains_key(&child) {
                    if strict {
                        return Err(CfbError::CorruptedFile(format!(
                            "sibling SID {child} is invalid or closes a cycle"
                        )));
                    }
                    log::warn!("cutting suspicious sibling link to SID {child}");
                    if go_left {
                        tree.set_left(sid, NOSTREAM);
                    } else {
                        tree.set_right(sid, NOSTREAM);
                    }
                    continue;
                }
                tree.parent.insert(child, sid);
                stack.push(child);
            }
        }
        Ok(tree)
    }

    /// SID of the current tree root (NOSTREAM for an empty tree).
    pub fn root(&self) -> u32 {
        self.root
    }

    /// Locate a child by name using the invariant ordering.
    pub fn find(&self, name: &str) -> Option<u32> {
        let mut current = self.root;
        while current != NOSTREAM {
            let entry = self.dir.get(current)?;
            match name_cmp(name, &entry.name) {
                Ordering::Equal => return Some(current),
                Ordering::Less => current = entry.left,
                Ordering::Greater => current = entry.right,
            }
        }
        None
    }

    /// SIDs of all nodes in key order.
    pub fn in_order(&self) -> Vec<u32> {
        let mut out = Vec::new();
        let mut stack = Vec::new();
        let mut current = self.root;
        while current != NOSTREAM || !stack.is_empty() {
            while current != NOSTREAM {
                stack.push(current);
                current = self.left(current);
            }
            let sid = stack.pop().unwrap();
            out.push(sid);
            current = self.right(sid);
        }
        out
    }

    /// Insert the entry at `sid` into the tree. The entry's links must have
    /// been reset. Fails with `DuplicatedItem` on a name collision.
    pub fn insert(&mut self, sid: u32) -> Result<()> {
        let name = self.dir.entry(sid)?.name.clone();
        let mut parent = NOSTREAM;
        let mut current = self.root;
        let mut went_left = false;
        while current != NOSTREAM {
            parent = current;
            match name_cmp(&name, &self.dir.entry(current)?.name) {
                Ordering::Equal => return Err(CfbError::DuplicatedItem(name)),
                Ordering::Less => {
                    current = self.left(current);
                    went_left = true;
                }
                Ordering::Greater => {
                    current = self.right(current);
                    went_left = false;
                }
            }
        }

        self.set_left(sid, NOSTREAM);
        self.set_right(sid, NOSTREAM);
        self.set_color(sid, Color::Red);
        self.parent.insert(sid, parent);
        if parent == NOSTREAM {
            self.root = sid;
        } else if went_left {
            self.set_left(parent, sid);
        } else {
            self.set_right(parent, sid);
        }

        self.insert_fixup(sid);
        Ok(())
    }

    /// Remove the node at `sid`, rebalancing and clearing its links.
    pub fn remove(&mut self, sid: u32) -> Result<()> {
        if !self.parent.contains_key(&sid) {
            return Err(CfbError::CorruptedFile(format!(
                "SID {sid} is not part of this sibling tree"
            )));
        }

        let z = sid;
        let mut y = z;
        let mut y_color = self.color(y);
        let x;
        let x_parent;

        if self.left(z) == NOSTREAM {
            x = self.right(z);
            x_parent = self.node_parent(z);
            self.transplant(z, x);
        } else if self.right(z) == NOSTREAM {
            x = self.left(z);
            x_parent = self.node_parent(z);
            self.transplant(z, x);
        } else {
            y = self.minimum(self.right(z));
            y_color = self.color(y);
            x = self.right(y);
            if self.node_parent(y) == z {
                x_parent = y;
                if x != NOSTREAM {
                    self.parent.insert(x, y);
                }
            } else {
                x_parent = self.node_parent(y);
                self.transplant(y, x);
                let zr = self.right(z);
                self.set_right(y, zr);
                self.parent.insert(zr, y);
            }
            self.transplant(z, y);
            let zl = self.left(z);
            self.set_left(y, zl);
            self.parent.insert(zl, y);
            self.set_color(y, self.color(z));
        }

        if y_color == Color::Black {
            self.delete_fixup(x, x_parent);
        }

        self.parent.remove(&z);
        self.set_left(z, NOSTREAM);
        self.set_right(z, NOSTREAM);
        self.set_color(z, Color::Black);
        Ok(())
    }

    // --- record accessors -------------------------------------------------

    fn link_ok(&self, sid: u32) -> bool {
        matches!(self.dir.get(sid), Some(entry) if entry.is_valid())
    }

    fn left(&self, sid: u32) -> u32 {
        if sid == NOSTREAM {
            return NOSTREAM;
        }
        self.dir.get(sid).map(|e| e.left).unwrap_or(NOSTREAM)
    }

    fn right(&self, sid: u32) -> u32 {
        if sid == NOSTREAM {
            return NOSTREAM;
        }
        self.dir.get(sid).map(|e| e.right).unwrap_or(NOSTREAM)
    }

    fn set_left(&mut self, sid: u32, value: u32) {
        if let Some(entry) = self.dir.get_mut(sid) {
            entry.left = value;
        }
    }

    fn set_right(&mut self, sid: u32, value: u32) {
        if let Some(entry) = self.dir.get_mut(sid) {
            entry.right = value;
        }
    }

    fn color(&self, sid: u32) -> Color {
        if sid == NOSTREAM {
            return Color::Black;
        }
        self.dir.get(sid).map(|e| e.color).unwrap_or(Color::Black)
    }

    fn set_color(&mut self, sid: u32, color: Color) {
        if sid == NOSTREAM {
            return;
        }
        if let Some(entry) = self.dir.get_mut(sid) {
            entry.color = color;
        }
    }

    fn node_parent(&self, sid: u32) -> u32 {
        self.parent.get(&sid).copied().unwrap_or(NOSTREAM)
    }

    fn minimum(&self, mut sid: u32) -> u32 {
        while self.left(sid) != NOSTREAM {
            sid = self.left(sid);
        }
        sid
    }

    /// Replace the subtree rooted at `u` with the one rooted at `v`.
    fn transplant(&mut self, u: u32, v: u32) {
        let p = self.node_parent(u);
        if p == NOSTREAM {
            self.root = v;
        } else if self.left(p) == u {
            self.set_left(p, v);
        } else {
            self.set_right(p, v);
        }
        if v != NOSTREAM {
            self.parent.insert(v, p);
        }
    }

    // --- rebalancing ------------------------------------------------------

    fn rotate_left(&mut self, x: u32) {
        let y = self.right(x);
        let yl = self.left(y);
        self.set_right(x, yl);
        if yl != NOSTREAM {
            self.parent.insert(yl, x);
        }
        let xp = self.node_parent(x);
        if xp == NOSTREAM {
            self.root = y;
            self.parent.insert(y, NOSTREAM);
        } else {
            if self.left(xp) == x {
                self.set_left(xp, y);
            } else {
                self.set_right(xp, y);
            }
            self.parent.insert(y, xp);
        }
        self.set_left(y, x);
        self.parent.insert(x, y);
    }

    fn rotate_right(&mut self, x: u32) {
        let y = self.left(x);
        let yr = self.right(y);
        self.set_left(x, yr);
        if yr != NOSTREAM {
            self.parent.insert(yr, x);
        }
        let xp = self.node_parent(x);
        if xp == NOSTREAM {
            self.root = y;
            self.parent.insert(y, NOSTREAM);
        } else {
            if self.right(xp) == x {
                self.set_right(xp, y);
            } else {
                self.set_left(xp, y);
            }
            self.parent.insert(y, xp);
        }
        self.set_right(y, x);
        self.parent.insert(x, y);
    }

    fn insert_fixup(&mut self, mut z: u32) {
        while self.color(self.node_parent(z)) == Color::Red {
            let p = self.node_parent(z);
            let g = self.node_parent(p);
            if p == self.left(g) {
                let uncle = self.right(g);
                if self.color(uncle) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.right(p) {
                        z = p;
                        self.rotate_left(z);
                    }
                    let p = self.node_parent(z);
                    let g = self.node_parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.rotate_right(g);
                }
            } else {
                let uncle = self.left(g);
                if self.color(uncle) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.left(p) {
                        z = p;
                        self.rotate_right(z);
                    }
                    let p = self.node_parent(z);
                    let g = self.node_parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.rotate_left(g);
                }
            }
        }
        let root = self.root;
        self.set_color(root, Color::Black);
    }

    fn delete_fixup(&mut self, mut x: u32, mut x_parent: u32) {
        while x != self.root && self.color(x) == Color::Black {
            if x == self.left(x_parent) {
                let mut w = self.right(x_parent);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(x_parent, Color::Red);
                    self.rotate_left(x_parent);
                    w = self.right(x_parent);
                }
                if self.color(self.left(w)) == Color::Black
                    && self.color(self.right(w)) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = x_parent;
                    x_parent = self.node_parent(x);
                } else {
                    if self.color(self.right(w)) == Color::Black {
                        let wl = self.left(w);
                        self.set_color(wl, Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_right(w);
                        w = self.right(x_parent);
                    }
                    self.set_color(w, self.color(x_parent));
                    self.set_color(x_parent, Color::Black);
                    let wr = self.right(w);
                    self.set_color(wr, Color::Black);
                    self.rotate_left(x_parent);
                    x = self.root;
                }
            } else {
                let mut w = self.left(x_parent);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(x_parent, Color::Red);
                    self.rotate_right(x_parent);
                    w = self.left(x_parent);
                }
                if self.color(self.right(w)) == Color::Black
                    && self.color(self.left(w)) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = x_parent;
                    x_parent = self.node_parent(x);
                } else {
                    if self.color(self.left(w)) == Color::Black {
                        let wr = self.right(w);
                        self.set_color(wr, Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_left(w);
                        w = self.left(x_parent);
                    }
                    self.set_color(w, self.color(x_parent));
                    self.set_color(x_parent, Color::Black);
                    let wl = self.left(w);
                    self.set_color(wl, Color::Black);
                    self.rotate_right(x_parent);
                    x = self.root;
                }
            }
        }
        self.set_color(x, Color::Black);
    }

    /// Check the red-black invariants: black root, no red node with a red
    /// child, equal black height on every root-to-nil path.
    pub(crate) fn check_invariants(&self) -> std::result::Result<(), String> {
        if self.color(self.root) != Color::Black {
            return Err("root is not black".to_string());
        }
        self.black_height(self.root).map(|_| ())
    }

    fn black_height(&self, sid: u32) -> std::result::Result<usize, String> {
        if sid == NOSTREAM {
            return Ok(1);
        }
        if self.color(sid) == Color::Red {
            if self.color(self.left(sid)) == Color::Red
                || self.color(self.right(sid)) == Color::Red
            {
                return Err(format!("red node {sid} has a red child"));
            }
        }
        let lh = self.black_height(self.left(sid))?;
        let rh = self.black_height(self.right(sid))?;
        if lh != rh {
            return Err(format!("black height mismatch under {sid}: {lh} vs {rh}"));
        }
        Ok(lh + usize::from(self.color(sid) == Color::Black))
    }
}

#[cfg(test)]
mod tests {
    use super::super::entry::DirEntry;
    use super::*;

    fn tree_with(names: &[&str]) -> (Directory, u32) {
        let mut dir = Directory::new();
        let mut root = NOSTREAM;
        for name in names {
            let sid = dir.insert(DirEntry::new_stream(name));
            let mut tree = RbTree::load(&mut dir, root, true).unwrap();
            tree.insert(sid).unwrap();
            tree.check_invariants().unwrap();
            root = tree.root();
        }
        (dir, root)
    }

    #[test]
    fn test_insert_keeps_invariants() {
        let names: Vec<String> = (0..64).map(|i| format!("Entry {i:02}")).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let (mut dir, root) = tree_with(&refs);
        let tree = RbTree::load(&mut dir, root, true).unwrap();
        tree.check_invariants().unwrap();
        assert_eq!(tree.in_order().len(), 64);
    }

    #[test]
    fn test_in_order_matches_name_ordering() {
        let (mut dir, root) = tree_with(&["Bravo", "alpha", "Z", "aa", "Charlie9"]);
        let tree = RbTree::load(&mut dir, root, true).unwrap();
        let ordered: Vec<String> = tree
            .in_order()
            .iter()
            .map(|&sid| tree.dir.get(sid).unwrap().name.clone())
            .collect();
        // Length first, then uppercased units.
        assert_eq!(ordered, vec!["Z", "aa", "alpha", "Bravo", "Charlie9"]);
    }

    #[test]
    fn test_duplicate_rejected_case_invariant() {
        let (mut dir, root) = tree_with(&["Stream"]);
        let sid = dir.insert(DirEntry::new_stream("STREAM"));
        let mut tree = RbTree::load(&mut dir, root, true).unwrap();
        assert!(matches!(
            tree.insert(sid),
            Err(CfbError::DuplicatedItem(_))
        ));
    }

    #[test]
    fn test_find() {
        let (mut dir, root) = tree_with(&["One", "Two", "Three"]);
        let tree = RbTree::load(&mut dir, root, true).unwrap();
        assert!(tree.find("Two").is_some());
        assert!(tree.find("two").is_some());
        assert!(tree.find("Four").is_none());
    }

    #[test]
    fn test_remove_keeps_invariants() {
        let names: Vec<String> = (1..=99).map(|i| format!("Storage {i}")).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let (mut dir, mut root) = tree_with(&refs);

        for victim in &names {
            let mut tree = RbTree::load(&mut dir, root, true).unwrap();
            let sid = tree.find(victim).unwrap();
            tree.remove(sid).unwrap();
            tree.check_invariants()
                .unwrap_or_else(|e| panic!("after removing {victim}: {e}"));
            root = tree.root();
            assert!(tree.find(victim).is_none());
        }
        assert_eq!(root, NOSTREAM);
    }

    #[test]
    fn test_remove_republishes_root() {
        let (mut dir, root) = tree_with(&["A", "B", "C"]);
        let mut tree = RbTree::load(&mut dir, root, true).unwrap();
        let old_root = tree.root();
        let sid = tree.find(&tree.dir.get(old_root).unwrap().name.clone()).unwrap();
        tree.remove(sid).unwrap();
        assert_ne!(tree.root(), old_root);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_load_detects_sibling_cycle() {
        let (mut dir, root) = tree_with(&["A", "B", "C"]);
        // Point a leaf back at the root to close a cycle.
        let leaf = {
            let tree = RbTree::load(&mut dir, root, true).unwrap();
            *tree.in_order().first().unwrap()
        };
        dir.get_mut(leaf).unwrap().left = root;

        assert!(RbTree::load(&mut dir, root, true).is_err());
        // Lenient load cuts the link and keeps the rest readable.
        let tree = RbTree::load(&mut dir, root, false).unwrap();
        assert_eq!(tree.in_order().len(), 3);
    }

    #[test]
    fn test_load_rejects_invalid_target() {
        let (mut dir, root) = tree_with(&["A", "B", "C"]);
        let leaf = {
            let tree = RbTree::load(&mut dir, root, true).unwrap();
            *tree.in_order().last().unwrap()
        };
        dir.remove(leaf);
        assert!(RbTree::load(&mut dir, root, true).is_err());
        let tree = RbTree::load(&mut dir, root, false).unwrap();
        assert_eq!(tree.in_order().len(), 2);
    }
}

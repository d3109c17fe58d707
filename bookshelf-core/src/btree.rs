// src/btree.rs
// In-memory B+ tree with posting lists and split support

use std::ops::Bound;

// B+ Tree Configuration
const BTREE_ORDER: usize = 32;
const MAX_KEYS: usize = BTREE_ORDER - 1;  // 31

/// B+ Tree Node
#[derive(Debug, Clone)]
enum Node<K, V> {
    Internal {
        keys: Vec<K>,
        children: Vec<Box<Node<K, V>>>,
    },
    /// `postings[i]` holds every value stored under `keys[i]`
    Leaf {
        keys: Vec<K>,
        postings: Vec<Vec<V>>,
    },
}

/// Split result when node overflows
#[derive(Debug)]
struct SplitResult<K, V> {
    key: K,                     // Key to push up
    right: Box<Node<K, V>>,     // New right node
}

/// B+ tree mapping each key to a posting list of values.
///
/// Separators are copies of the first key of the right sibling, so a key
/// equal to a separator always lives in the right child. Deletes are lazy:
/// empty leaves stay in place and nodes are never merged.
#[derive(Debug, Clone)]
pub struct BPlusTree<K, V> {
    root: Box<Node<K, V>>,
    num_keys: usize,
    num_entries: usize,
    height: u32,
}

impl<K: Ord + Clone, V: Clone + PartialEq> BPlusTree<K, V> {
    pub fn new() -> Self {
        BPlusTree {
            root: Box::new(Node::Leaf { keys: Vec::new(), postings: Vec::new() }),
            num_keys: 0,
            num_entries: 0,
            height: 1,
        }
    }

    /// Posting list for a key
    pub fn get(&self, key: &K) -> Option<&[V]> {
        let mut node = &*self.root;
        loop {
            match node {
                Node::Internal { keys, children } => node = &children[child_index(keys, key)],
                Node::Leaf { keys, postings } => {
                    return keys.binary_search(key).ok().map(|idx| postings[idx].as_slice());
                }
            }
        }
    }

    /// Append a value to the key's posting list, creating the key if needed
    pub fn insert(&mut self, key: K, value: V) {
        let old_root = std::mem::replace(
            &mut self.root,
            Box::new(Node::Leaf { keys: Vec::new(), postings: Vec::new() }),
        );

        let (node, split, new_key) = Self::insert_into_node(old_root, key, value);
        match split {
            None => self.root = node,
            Some(split) => {
                // Root split - create new root
                self.root = Box::new(Node::Internal {
                    keys: vec![split.key],
                    children: vec![node, split.right],
                });
                self.height += 1;
            }
        }

        if new_key {
            self.num_keys += 1;
        }
        self.num_entries += 1;
    }

    fn insert_into_node(
        mut node: Box<Node<K, V>>,
        key: K,
        value: V,
    ) -> (Box<Node<K, V>>, Option<SplitResult<K, V>>, bool) {
        match *node {
            Node::Leaf { ref mut keys, ref mut postings } => {
                let pos = match keys.binary_search(&key) {
                    Ok(pos) => {
                        postings[pos].push(value);
                        return (node, None, false);
                    }
                    Err(pos) => pos,
                };

                keys.insert(pos, key);
                postings.insert(pos, vec![value]);

                if keys.len() <= MAX_KEYS {
                    return (node, None, true);
                }

                // Split leaf
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid);
                let right_postings = postings.split_off(mid);
                let split_key = right_keys[0].clone();

                let right = Box::new(Node::Leaf { keys: right_keys, postings: right_postings });
                (node, Some(SplitResult { key: split_key, right }), true)
            }
            Node::Internal { ref mut keys, ref mut children } => {
                let idx = child_index(keys, &key);

                let child = children.remove(idx);
                let (new_child, split_opt, new_key) = Self::insert_into_node(child, key, value);
                children.insert(idx, new_child);

                let Some(split) = split_opt else {
                    return (node, None, new_key);
                };

                keys.insert(idx, split.key);
                children.insert(idx + 1, split.right);

                if keys.len() <= MAX_KEYS {
                    return (node, None, new_key);
                }

                // Split internal node; n keys have n+1 children
                let mid = keys.len() / 2;
                let right_children = children.split_off(mid + 1);
                let mid_key = keys.remove(mid);
                let right_keys = keys.split_off(mid);

                let right = Box::new(Node::Internal { keys: right_keys, children: right_children });
                (node, Some(SplitResult { key: mid_key, right }), new_key)
            }
        }
    }

    /// Remove one value from a key's posting list. The key goes away with
    /// its last value. Returns false if the pair was not present.
    pub fn remove(&mut self, key: &K, value: &V) -> bool {
        let (removed, key_gone) = Self::remove_from_node(&mut self.root, key, value);
        if removed {
            self.num_entries -= 1;
        }
        if key_gone {
            self.num_keys -= 1;
        }
        removed
    }

    fn remove_from_node(node: &mut Node<K, V>, key: &K, value: &V) -> (bool, bool) {
        match node {
            Node::Leaf { keys, postings } => {
                let Ok(idx) = keys.binary_search(key) else {
                    return (false, false);
                };
                let Some(pos) = postings[idx].iter().position(|v| v == value) else {
                    return (false, false);
                };
                postings[idx].remove(pos);
                if postings[idx].is_empty() {
                    keys.remove(idx);
                    postings.remove(idx);
                    return (true, true);
                }
                (true, false)
            }
            Node::Internal { keys, children } => {
                let idx = child_index(keys, key);
                Self::remove_from_node(&mut children[idx], key, value)
            }
        }
    }

    /// Every (key, posting list) pair within the bounds, in key order
    pub fn range(&self, lower: Bound<&K>, upper: Bound<&K>) -> Vec<(&K, &[V])> {
        let mut results = Vec::new();
        Self::range_node(&self.root, lower, upper, &mut results);
        results
    }

    fn range_node<'a>(
        node: &'a Node<K, V>,
        lower: Bound<&K>,
        upper: Bound<&K>,
        results: &mut Vec<(&'a K, &'a [V])>,
    ) {
        match node {
            Node::Internal { keys, children } => {
                let start_idx = match lower {
                    Bound::Included(start) | Bound::Excluded(start) => child_index(keys, start),
                    Bound::Unbounded => 0,
                };

                for i in start_idx..children.len() {
                    // Child i starts at separator i-1; stop once that is past the end
                    if i > 0 && above_upper(&keys[i - 1], upper) {
                        break;
                    }
                    Self::range_node(&children[i], lower, upper, results);
                }
            }
            Node::Leaf { keys, postings } => {
                for (key, posting) in keys.iter().zip(postings.iter()) {
                    if below_lower(key, lower) {
                        continue;
                    }
                    if above_upper(key, upper) {
                        break;
                    }
                    results.push((key, posting.as_slice()));
                }
            }
        }
    }

    /// Distinct keys
    pub fn len(&self) -> usize {
        self.num_keys
    }

    pub fn is_empty(&self) -> bool {
        self.num_keys == 0
    }

    /// Values across all posting lists
    pub fn entries(&self) -> usize {
        self.num_entries
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl<K: Ord + Clone, V: Clone + PartialEq> Default for BPlusTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Child to descend into: child[i] has keys < keys[i], child[i+1] has keys >= keys[i]
fn child_index<K: Ord>(keys: &[K], key: &K) -> usize {
    match keys.binary_search(key) {
        Ok(pos) => pos + 1,
        Err(pos) => pos,
    }
}

fn below_lower<K: Ord>(key: &K, lower: Bound<&K>) -> bool {
    match lower {
        Bound::Included(start) => key < start,
        Bound::Excluded(start) => key <= start,
        Bound::Unbounded => false,
    }
}

fn above_upper<K: Ord>(key: &K, upper: Bound<&K>) -> bool {
    match upper {
        Bound::Included(end) => key > end,
        Bound::Excluded(end) => key >= end,
        Bound::Unbounded => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(results: &[(&i64, &[i64])]) -> Vec<i64> {
        results.iter().flat_map(|(_, posting)| posting.iter().copied()).collect()
    }

    #[test]
    fn test_btree_basic_insert_get() {
        let mut tree: BPlusTree<i64, i64> = BPlusTree::new();

        tree.insert(10, 100);
        tree.insert(20, 200);
        tree.insert(5, 50);

        assert_eq!(tree.get(&10), Some(&[100][..]));
        assert_eq!(tree.get(&20), Some(&[200][..]));
        assert_eq!(tree.get(&5), Some(&[50][..]));
        assert_eq!(tree.get(&99), None);
    }

    #[test]
    fn test_btree_posting_lists() {
        let mut tree: BPlusTree<&str, i64> = BPlusTree::new();

        tree.insert("fantasy", 1);
        tree.insert("fantasy", 4);
        tree.insert("history", 2);

        assert_eq!(tree.get(&"fantasy"), Some(&[1, 4][..]));
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.entries(), 3);
    }

    #[test]
    fn test_btree_split() {
        let mut tree: BPlusTree<i64, i64> = BPlusTree::new();

        // MAX_KEYS = 31, so 32 distinct keys force the first split
        for i in 0..100 {
            tree.insert(i, i);
        }

        for i in 0..100 {
            assert_eq!(tree.get(&i), Some(&[i][..]), "Failed to find key {}", i);
        }

        assert_eq!(tree.len(), 100);
        assert!(tree.height() > 1, "Tree should have split and increased height");
    }

    #[test]
    fn test_btree_range_bounds() {
        let mut tree: BPlusTree<i64, i64> = BPlusTree::new();
        for i in 0..100 {
            tree.insert(i, i);
        }

        let results = tree.range(Bound::Included(&10), Bound::Excluded(&20));
        assert_eq!(ids(&results), (10..20).collect::<Vec<_>>());

        let results = tree.range(Bound::Excluded(&95), Bound::Unbounded);
        assert_eq!(ids(&results), vec![96, 97, 98, 99]);

        let results = tree.range(Bound::Unbounded, Bound::Included(&2));
        assert_eq!(ids(&results), vec![0, 1, 2]);

        assert_eq!(tree.range(Bound::Unbounded, Bound::Unbounded).len(), 100);
    }

    #[test]
    fn test_btree_range_starting_on_separator() {
        let mut tree: BPlusTree<i64, i64> = BPlusTree::new();
        for i in 0..1000 {
            tree.insert(i, i);
        }

        // Every start key, including ones copied up as separators
        for start in 0..990 {
            let results = tree.range(Bound::Included(&start), Bound::Included(&(start + 9)));
            assert_eq!(ids(&results), (start..start + 10).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_btree_remove() {
        let mut tree: BPlusTree<i64, i64> = BPlusTree::new();

        tree.insert(10, 100);
        tree.insert(20, 200);
        tree.insert(20, 201);
        tree.insert(30, 300);

        assert!(tree.remove(&20, &200));
        assert_eq!(tree.get(&20), Some(&[201][..]));
        assert_eq!(tree.len(), 3);

        assert!(tree.remove(&20, &201));
        assert_eq!(tree.get(&20), None);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.entries(), 2);

        assert!(!tree.remove(&20, &201));
        assert!(!tree.remove(&10, &999));
    }

    #[test]
    fn test_btree_remove_after_splits() {
        let mut tree: BPlusTree<i64, i64> = BPlusTree::new();
        for i in 0..500 {
            tree.insert(i, i);
        }

        for i in (0..500).step_by(2) {
            assert!(tree.remove(&i, &i), "Failed to remove key {}", i);
        }

        assert_eq!(tree.len(), 250);
        for i in 0..500 {
            let expected = if i % 2 == 0 { None } else { Some(&[i][..]) };
            assert_eq!(tree.get(&i), expected);
        }

        let results = tree.range(Bound::Included(&100), Bound::Excluded(&110));
        assert_eq!(ids(&results), vec![101, 103, 105, 107, 109]);

        // Reinsert into emptied slots
        tree.insert(100, 100);
        assert_eq!(tree.get(&100), Some(&[100][..]));
    }

    #[test]
    fn test_btree_random_order() {
        let mut tree: BPlusTree<i64, i64> = BPlusTree::new();

        let keys = vec![50, 25, 75, 10, 30, 60, 90, 5, 15, 20];
        for &k in &keys {
            tree.insert(k, k);
        }

        for &k in &keys {
            assert_eq!(tree.get(&k), Some(&[k][..]));
        }

        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(ids(&tree.range(Bound::Unbounded, Bound::Unbounded)), sorted);
    }
}

//! Longest-common-prefix grouping of staged paths.
//!
//! Container execution needs every staged input visible inside the task;
//! mounting each file individually explodes the invocation, so source
//! directories are folded into the smallest set of common prefixes.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};

#[derive(Debug, Default)]
pub struct PathTrie {
    root: Node,
}

#[derive(Debug, Default)]
struct Node {
    children: BTreeMap<String, Node>,
    terminal: bool,
}

impl PathTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the parent directory of a staged file (or a directory itself).
    pub fn insert(&mut self, dir: &Utf8Path) {
        let mut node = &mut self.root;
        for component in dir.components() {
            node = node
                .children
                .entry(component.as_str().to_owned())
                .or_default();
        }
        node.terminal = true;
    }

    /// The minimal set of directories covering every inserted path: descend
    /// until a path ends or branches, and emit there.
    pub fn prefixes(&self) -> Vec<Utf8PathBuf> {
        let mut out = Vec::new();
        for (name, child) in &self.root.children {
            collect(child, Utf8PathBuf::from(name), &mut out);
        }
        out
    }
}

fn collect(node: &Node, path: Utf8PathBuf, out: &mut Vec<Utf8PathBuf>) {
    if node.terminal {
        out.push(path);
        return;
    }
    match node.children.len() {
        0 => out.push(path),
        1 => {
            let (name, child) = node.children.iter().next().expect("single child");
            collect(child, path.join(name), out);
        }
        // A branch right at the filesystem root is not a usable prefix;
        // each subtree gets its own.
        _ if path == "/" => {
            for (name, child) in &node.children {
                collect(child, path.join(name), out);
            }
        }
        _ => out.push(path),
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn prefixes(paths: &[&str]) -> Vec<String> {
        let mut trie = PathTrie::new();
        for p in paths {
            trie.insert(Utf8Path::new(p));
        }
        trie.prefixes().into_iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn sibling_dirs_fold_to_common_parent() {
        assert_eq!(
            prefixes(&["/data/run1/a", "/data/run1/b"]),
            vec!["/data/run1"]
        );
    }

    #[test]
    fn distinct_tops_stay_separate() {
        assert_eq!(
            prefixes(&["/data/in", "/scratch/tools"]),
            vec!["/data/in", "/scratch/tools"]
        );
    }

    #[test]
    fn inserted_ancestor_wins_over_descendants() {
        assert_eq!(
            prefixes(&["/data", "/data/run1/a", "/data/run2"]),
            vec!["/data"]
        );
    }

    #[test]
    fn single_path_is_its_own_prefix() {
        assert_eq!(prefixes(&["/data/x/y"]), vec!["/data/x/y"]);
    }
}

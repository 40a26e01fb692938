//! Remote vs. local identifier reconciliation.
//!
//! Pure set arithmetic: the caller supplies the identifiers discovered
//! remotely and the identifiers currently marked `current` for the source,
//! and gets back three disjoint sets.

use std::collections::HashSet;

/// Identifiers classified by what the import stage has to do with them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Remote only.
    pub new: Vec<String>,
    /// Present on both sides.
    pub change: Vec<String>,
    /// Local only.
    pub delete: Vec<String>,
}

impl Reconciliation {
    pub fn len(&self) -> usize {
        self.new.len() + self.change.len() + self.delete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Diff remote identifiers against the locally current ones.
///
/// `new` and `change` keep the remote order; `delete` is sorted so runs are
/// reproducible. Duplicate remote identifiers count once.
pub fn reconcile<'a, I>(remote: &[String], local_current: I) -> Reconciliation
where
    I: IntoIterator<Item = &'a String>,
{
    let local: HashSet<&str> = local_current.into_iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let mut result = Reconciliation::default();

    for guid in remote {
        if !seen.insert(guid.as_str()) {
            continue;
        }
        if local.contains(guid.as_str()) {
            result.change.push(guid.clone());
        } else {
            result.new.push(guid.clone());
        }
    }

    let mut delete: Vec<String> = local
        .into_iter()
        .filter(|guid| !seen.contains(guid))
        .map(str::to_string)
        .collect();
    delete.sort();
    result.delete = delete;

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn classifies_new_change_delete() {
        let remote = ids(&["A", "B", "C"]);
        let local = ids(&["B", "C", "D"]);
        let result = reconcile(&remote, &local);

        assert_eq!(result.new, vec!["A"]);
        assert_eq!(result.change, vec!["B", "C"]);
        assert_eq!(result.delete, vec!["D"]);
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn empty_local_is_all_new() {
        let result = reconcile(&ids(&["x", "y"]), &Vec::<String>::new());
        assert_eq!(result.new, vec!["x", "y"]);
        assert!(result.change.is_empty());
        assert!(result.delete.is_empty());
    }

    #[test]
    fn empty_remote_deletes_everything() {
        let result = reconcile(&[], &ids(&["b", "a"]));
        assert_eq!(result.delete, vec!["a", "b"]);
        assert!(result.new.is_empty());
    }

    #[test]
    fn duplicates_count_once() {
        let result = reconcile(&ids(&["A", "A", "B"]), &ids(&["B"]));
        assert_eq!(result.new, vec!["A"]);
        assert_eq!(result.change, vec!["B"]);
    }

    #[test]
    fn both_empty_is_empty() {
        assert!(reconcile(&[], &Vec::<String>::new()).is_empty());
    }
}

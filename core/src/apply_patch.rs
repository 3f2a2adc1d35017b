//! Minimal `ApplyPatch` data model: just enough for the Mode Controller and
//! Approval Analyzer to reason about *which paths* a patch touches. Parsing
//! patch text into this shape is out of scope here — callers construct
//! `ApplyPatchAction` directly from whatever already-parsed patch
//! representation they have.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub enum ApplyPatchFileChange {
    Add,
    Delete,
    Update { move_path: Option<PathBuf> },
}

/// By construction, all paths here are absolute.
#[derive(Debug, Clone, Default)]
pub struct ApplyPatchAction {
    changes: HashMap<PathBuf, ApplyPatchFileChange>,
}

impl ApplyPatchAction {
    pub fn new(changes: HashMap<PathBuf, ApplyPatchFileChange>) -> Self {
        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> &HashMap<PathBuf, ApplyPatchFileChange> {
        &self.changes
    }

    /// Every target path (and move destination) touched by this patch.
    pub fn target_paths(&self) -> Vec<&Path> {
        let mut paths = Vec::new();
        for (path, change) in &self.changes {
            paths.push(path.as_path());
            if let ApplyPatchFileChange::Update {
                move_path: Some(dest),
            } = change
            {
                paths.push(dest.as_path());
            }
        }
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_paths_includes_move_destination() {
        let mut changes = HashMap::new();
        changes.insert(
            PathBuf::from("/u/p/a.txt"),
            ApplyPatchFileChange::Update {
                move_path: Some(PathBuf::from("/u/p/b.txt")),
            },
        );
        let action = ApplyPatchAction::new(changes);
        let mut paths: Vec<_> = action.target_paths().iter().map(|p| p.to_path_buf()).collect();
        paths.sort();
        assert_eq!(
            paths,
            vec![PathBuf::from("/u/p/a.txt"), PathBuf::from("/u/p/b.txt")]
        );
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Identity-agnostic reconciliation of derived document sets.
//!
//! Newly computed derived documents get fresh identifiers on every run, so
//! the diff ignores identity entirely and compares attribute bags by deep
//! equality. An old document whose content matches a new one is kept
//! untouched; leftovers on both sides are paired in order into in-place
//! updates (the old identity survives); unpaired new items become additions
//! and unpaired old items deletions. Running the same input twice therefore
//! produces zero writes the second time.

use crate::document::Doc;

/// Outcome of diffing the old derived set against the newly computed one.
#[derive(Debug, Default, PartialEq)]
pub struct Reconciliation {
    /// New documents with no counterpart: create as-is.
    pub additions: Vec<Doc>,
    /// (surviving old document, new content to set on it).
    pub updates: Vec<(Doc, Doc)>,
    /// Old documents with no counterpart: remove.
    pub removals: Vec<Doc>,
    /// Count of old documents kept without any write.
    pub kept: usize,
}

impl Reconciliation {
    /// True when the diff requires no writes at all.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.additions.is_empty() && self.updates.is_empty() && self.removals.is_empty()
    }
}

/// Diff `old` (currently stored) against `new` (freshly computed).
#[must_use]
pub fn reconcile(old: &[Doc], new: Vec<Doc>) -> Reconciliation {
    let mut remaining_old: Vec<usize> = (0..old.len()).collect();
    let mut unmatched_new: Vec<Doc> = Vec::new();
    let mut kept = 0usize;

    for new_doc in new {
        let matched = remaining_old
            .iter()
            .position(|&index| same_content(&old[index], &new_doc));
        match matched {
            Some(position) => {
                // Content match: the old document survives untouched.
                remaining_old.remove(position);
                kept += 1;
            }
            None => unmatched_new.push(new_doc),
        }
    }

    let mut reconciliation = Reconciliation {
        kept,
        ..Reconciliation::default()
    };
    // Leftovers pair up in stored order; the old identity survives.
    let mut old_iter = remaining_old.into_iter();
    for new_doc in unmatched_new {
        match old_iter.next() {
            Some(index) => reconciliation.updates.push((old[index].clone(), new_doc)),
            None => reconciliation.additions.push(new_doc),
        }
    }
    reconciliation.removals = old_iter.map(|index| old[index].clone()).collect();
    reconciliation
}

/// Deep equality on everything but identity and modification stamps.
fn same_content(a: &Doc, b: &Doc) -> bool {
    a.class == b.class && a.space == b.space && a.attributes == b.attributes
}

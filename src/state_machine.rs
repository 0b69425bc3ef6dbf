//! The [`DocumentStatus`] transition graph (spec §4.6).
//!
//! Every writer of `source_documents.status` — the ingestion pool, the
//! indexing coordinator, and the CRUD layer's explicit reprocess/reindex
//! operations — calls [`is_allowed`] before issuing the UPDATE, so
//! invariant 6 (§3: "a document's status advances only in the direction
//! allowed by the state machine") is enforced in one place rather than
//! scattered across callers.
//!
//! Open question 1 in spec §9 asks whether `INGEST_FAILED` and
//! `INDEX_FAILED` should be split out of the shared `FAILED` state. This
//! implementation keeps the single `FAILED` state (renaming it would be a
//! breaking, purely cosmetic change) and instead distinguishes the two root
//! causes via `status_detail`'s free-text prefix — see DESIGN.md.

use crate::models::DocumentStatus;

/// Returns true if transitioning a document from `from` to `to` is legal.
pub fn is_allowed(from: DocumentStatus, to: DocumentStatus) -> bool {
    use DocumentStatus::*;
    matches!(
        (from, to),
        (Pending, Processing)
            | (Processing, DocumentStored)
            | (Processing, Failed)
            | (DocumentStored, Indexing)
            | (Indexing, Ready)
            | (Indexing, Failed)
            | (Failed, Pending)
            | (Ready, Indexing)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use DocumentStatus::*;

    #[test]
    fn happy_path_is_allowed() {
        assert!(is_allowed(Pending, Processing));
        assert!(is_allowed(Processing, DocumentStored));
        assert!(is_allowed(DocumentStored, Indexing));
        assert!(is_allowed(Indexing, Ready));
    }

    #[test]
    fn failure_exits_are_allowed() {
        assert!(is_allowed(Processing, Failed));
        assert!(is_allowed(Indexing, Failed));
    }

    #[test]
    fn terminal_states_only_leave_via_explicit_user_action() {
        assert!(is_allowed(Failed, Pending));
        assert!(is_allowed(Ready, Indexing));
        assert!(!is_allowed(Ready, Processing));
        assert!(!is_allowed(Failed, Processing));
    }

    #[test]
    fn no_skipping_phases() {
        assert!(!is_allowed(Pending, DocumentStored));
        assert!(!is_allowed(Pending, Ready));
        assert!(!is_allowed(Processing, Ready));
        assert!(!is_allowed(Processing, Indexing));
        assert!(!is_allowed(DocumentStored, Ready));
    }

    #[test]
    fn self_transitions_are_not_allowed() {
        for s in [Pending, Processing, DocumentStored, Indexing, Ready, Failed] {
            assert!(!is_allowed(s, s));
        }
    }
}

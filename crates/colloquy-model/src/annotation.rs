//! Annotations attached to descriptors.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use colloquy_types::{AnnotationKind, DatabaseId};

/// One stored annotation row.
///
/// `peer_twincode` is `None` for our own annotation; any participant may
/// annotate any descriptor once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Owning conversation row id.
    pub conversation_id: DatabaseId,
    /// Annotated descriptor row id.
    pub descriptor_id: DatabaseId,
    /// Annotating member; `None` means us.
    pub peer_twincode: Option<Uuid>,
    /// Annotation kind.
    pub kind: AnnotationKind,
    /// Kind-specific value (which emoji, which poll choice).
    pub value: i64,
    /// When the annotation was applied.
    pub creation_date: i64,
    /// Host notification handle, when one was raised.
    pub notification_id: Option<i64>,
}

/// Aggregated view attached to a loaded descriptor: one row per
/// `(kind, value)` with the number of members that applied it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationSummary {
    pub kind: AnnotationKind,
    pub value: i64,
    pub count: i64,
}

/// Aggregate raw rows into the summary form.
///
/// Equivalent to the SQL `GROUP BY kind, value` with a count; kept here so
/// in-memory updates can refresh a descriptor without a reload.
pub fn summarize(rows: &[Annotation]) -> Vec<AnnotationSummary> {
    let mut summary: Vec<AnnotationSummary> = Vec::new();
    for row in rows {
        match summary
            .iter_mut()
            .find(|s| s.kind == row.kind && s.value == row.value)
        {
            Some(entry) => entry.count += 1,
            None => summary.push(AnnotationSummary {
                kind: row.kind,
                value: row.value,
                count: 1,
            }),
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotation(peer: Option<Uuid>, kind: AnnotationKind, value: i64) -> Annotation {
        Annotation {
            conversation_id: 1,
            descriptor_id: 2,
            peer_twincode: peer,
            kind,
            value,
            creation_date: 0,
            notification_id: None,
        }
    }

    #[test]
    fn test_summarize_groups_by_kind_and_value() {
        let rows = vec![
            annotation(None, AnnotationKind::Like, 3),
            annotation(Some(Uuid::new_v4()), AnnotationKind::Like, 3),
            annotation(Some(Uuid::new_v4()), AnnotationKind::Like, 7),
            annotation(Some(Uuid::new_v4()), AnnotationKind::Save, 0),
        ];
        let summary = summarize(&rows);
        assert_eq!(summary.len(), 3);
        let likes_3 = summary
            .iter()
            .find(|s| s.kind == AnnotationKind::Like && s.value == 3)
            .expect("like/3 entry");
        assert_eq!(likes_3.count, 2);
    }

    #[test]
    fn test_summarize_empty() {
        assert!(summarize(&[]).is_empty());
    }
}

use crate::catalog::{CandidateQuery, SortDirection};
use crate::types::{FileId, FileStatus, JobKind};

/// Builds the candidate query for a given pool. Transcode and integrity
/// use the same `pending` base predicate plus their own eligibility
/// clause and sort direction.
pub fn candidate_query(
    kind: JobKind,
    target_encode_version: &str,
    exclude_ids: Vec<FileId>,
    limit: i64,
) -> CandidateQuery {
    let mut query = CandidateQuery {
        status: Some(FileStatus::Pending),
        exclude_ids,
        limit,
        ..Default::default()
    };
    match kind {
        JobKind::Transcode => {
            query.encode_version_ne = Some(target_encode_version.to_string());
            query.size_sort = SortDirection::Descending;
            query.width_sort = SortDirection::Descending;
        }
        JobKind::Integrity => {
            query.integrity_checked = Some(false);
            query.size_sort = SortDirection::Ascending;
            query.width_sort = SortDirection::Ascending;
        }
    }
    query
}

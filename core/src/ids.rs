/// Canonical task identifiers.
///
/// A root-level task id is one uppercase segment (`ABCD`). A subtask id is
/// its parent's id, a dash, and another segment (`ABCD-EFGH`). The synthetic
/// project root uses a fixed sentinel that is only ever accepted as an exact
/// match. Tracking overlays mint `temp-<n>` placeholders that the store
/// replaces with canonical ids at flush time.
use crate::errors::{TaskError, TaskResult};
use rand::Rng;

/// Fixed id of the synthetic project root.
pub const PROJECT_ROOT_ID: &str = "__PROJECT_ROOT__";

/// Prefix marking ids that only exist inside a tracking overlay.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Length of a generated id segment.
pub const SEGMENT_LEN: usize = 4;

/// True for the project-root sentinel (exact match only).
pub fn is_project_root(id: &str) -> bool {
    id == PROJECT_ROOT_ID
}

/// True for overlay-local temporary ids.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// True for a canonical persisted id: dash-joined non-empty `[A-Z]+`
/// segments. The sentinel never matches, so it cannot appear as an infix or
/// suffix of any other id.
pub fn is_canonical_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .split('-')
            .all(|segment| !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_uppercase()))
}

/// True for any id the store accepts as a task reference.
pub fn is_valid_id(id: &str) -> bool {
    is_project_root(id) || is_canonical_id(id)
}

/// Validate an id used to reference an existing task.
pub fn validate_id(id: &str) -> TaskResult<()> {
    if is_valid_id(id) {
        Ok(())
    } else {
        Err(TaskError::Validation(format!("invalid task id: {id:?}")))
    }
}

/// Validate an id used as the parent of a new task.
pub fn validate_parent_id(id: &str) -> TaskResult<()> {
    validate_id(id)
}

/// Generate one random `[A-Z]` segment.
pub fn random_segment() -> String {
    let mut rng = rand::thread_rng();
    (0..SEGMENT_LEN)
        .map(|_| (b'A' + rng.gen_range(0..26u8)) as char)
        .collect()
}

/// Compose a candidate id for a new child of `parent_id`. Children of the
/// project root get a fresh root-level segment.
pub fn compose_child_id(parent_id: &str) -> String {
    if is_project_root(parent_id) {
        random_segment()
    } else {
        format!("{parent_id}-{}", random_segment())
    }
}

/// Monotonic allocator for overlay-local temporary ids.
#[derive(Debug, Clone, Default)]
pub struct TempIdAllocator {
    next: u64,
}

impl TempIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next `temp-<n>` id.
    pub fn allocate(&mut self) -> String {
        self.next += 1;
        format!("{TEMP_ID_PREFIX}{}", self.next)
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_id_format() {
        assert!(is_canonical_id("ABCD"));
        assert!(is_canonical_id("ABCD-EFGH"));
        assert!(is_canonical_id("ABCD-EFGH-IJKL"));
        assert!(is_canonical_id("A"));

        assert!(!is_canonical_id(""));
        assert!(!is_canonical_id("abcd"));
        assert!(!is_canonical_id("ABCD-"));
        assert!(!is_canonical_id("-ABCD"));
        assert!(!is_canonical_id("AB1D"));
        assert!(!is_canonical_id("ABCD EFGH"));
    }

    #[test]
    fn test_sentinel_is_exact_match_only() {
        assert!(is_project_root(PROJECT_ROOT_ID));
        assert!(is_valid_id(PROJECT_ROOT_ID));

        // The sentinel cannot be embedded in a canonical id.
        assert!(!is_canonical_id(PROJECT_ROOT_ID));
        assert!(!is_valid_id(&format!("ABCD-{PROJECT_ROOT_ID}")));
        assert!(!is_valid_id(&format!("{PROJECT_ROOT_ID}-ABCD")));
    }

    #[test]
    fn test_temp_ids() {
        let mut alloc = TempIdAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert_eq!(a, "temp-1");
        assert_eq!(b, "temp-2");
        assert!(is_temp_id(&a));
        assert!(!is_temp_id("ABCD"));
        assert!(!is_valid_id(&a));
    }

    #[test]
    fn test_compose_child_id() {
        let root_child = compose_child_id(PROJECT_ROOT_ID);
        assert_eq!(root_child.len(), SEGMENT_LEN);
        assert!(is_canonical_id(&root_child));

        let sub = compose_child_id("ABCD");
        assert!(sub.starts_with("ABCD-"));
        assert!(is_canonical_id(&sub));
    }

    #[test]
    fn test_random_segment_charset() {
        for _ in 0..50 {
            let segment = random_segment();
            assert_eq!(segment.len(), SEGMENT_LEN);
            assert!(segment.bytes().all(|b| b.is_ascii_uppercase()));
        }
    }
}

// src/utils/questions.rs

use crate::error::StagingError;

/// Canonicalize a question-index list for an extra page: sorted, deduped,
/// every index within [1, n_questions].
pub fn canonicalize_question_list(
    questions: &[i64],
    n_questions: i64,
) -> Result<Vec<i64>, StagingError> {
    if questions.is_empty() {
        return Err(StagingError::InvalidExtraData(
            "question list cannot be empty".to_string(),
        ));
    }
    for &q in questions {
        if q < 1 || q > n_questions {
            return Err(StagingError::InvalidExtraData(format!(
                "question index {q} out of range [1, {n_questions}]"
            )));
        }
    }
    let mut canonical = questions.to_vec();
    canonical.sort_unstable();
    canonical.dedup();
    Ok(canonical)
}

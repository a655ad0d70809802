//! Error type for resolution failures.
//!
//! One taxonomy covers the whole public surface: exhausted mandatory
//! requirements, unresolvable uses constraints, cooperative cancellation and
//! dynamic requests that produce no new wire. Optional failures are never
//! errors; they surface as omissions in the delta.

use crate::resource::RequirementId;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolutionError {
    /// A mandatory requirement exhausted its candidates. The listed
    /// requirements are those unsatisfied at failure time; the set is not
    /// guaranteed to be exhaustive.
    #[error("unable to resolve {resource}: no provider for {} mandatory requirement(s)", requirements.len())]
    Unsatisfiable {
        resource: String,
        requirements: Vec<RequirementId>,
    },

    /// Every candidate permutation violated a uses constraint.
    #[error("uses constraint violation on '{identity}': {detail}")]
    UsesConflict {
        identity: String,
        requirements: Vec<RequirementId>,
        detail: String,
    },

    /// The cancellation callback fired; partial progress was discarded.
    #[error("resolution cancelled")]
    Cancelled,

    /// The dynamic entry point found no viable new candidate for the host.
    #[error("dynamic resolution produced no new wire")]
    DynamicFailed { requirements: Vec<RequirementId> },
}

impl ResolutionError {
    /// Requirements that could not be satisfied at failure time. Empty for
    /// cancellation.
    pub fn unresolved_requirements(&self) -> &[RequirementId] {
        match self {
            ResolutionError::Unsatisfiable { requirements, .. } => requirements,
            ResolutionError::UsesConflict { requirements, .. } => requirements,
            ResolutionError::Cancelled => &[],
            ResolutionError::DynamicFailed { requirements } => requirements,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ResolutionError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_reports_no_requirements() {
        assert!(ResolutionError::Cancelled.unresolved_requirements().is_empty());
        assert!(ResolutionError::Cancelled.is_cancelled());
    }

    #[test]
    fn unsatisfiable_lists_requirements() {
        let err = ResolutionError::Unsatisfiable {
            resource: "app".to_string(),
            requirements: vec![RequirementId(3)],
        };
        assert_eq!(err.unresolved_requirements(), &[RequirementId(3)]);
        assert!(err.to_string().contains("app"));
    }
}

//! Capability namespaces and their conflict-detection strategies.
//!
//! Namespaces form a closed set: handling differences between, say, a
//! package-style namespace and a bundle-style namespace are expressed as a
//! strategy table rather than per-namespace subtypes. Adding a namespace means
//! adding a variant here and a row to [`Namespace::strategy`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// The category a capability or requirement belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Namespace {
    /// Identity-bearing namespace: at most one provider per identity value may
    /// be visible from any resource's transitive wiring closure.
    Package,
    /// Aggregating namespace: wiring to one of its capabilities pulls the
    /// provider's exclusive capabilities into the requirer's space.
    Bundle,
    /// Fragment attachment: a resource with a requirement in this namespace is
    /// a fragment of whichever host satisfies it.
    Host,
    /// Resource identity; wires in this namespace always point at the
    /// declaring resource, never at a hosting resource.
    Identity,
    /// Execution-environment prerequisites; non-payload, no space
    /// participation.
    ExecutionEnvironment,
}

/// How a namespace participates in capability spaces and uses validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// Capabilities carry an identity attribute; identity values must stay
    /// singular across a resource's space.
    Exclusive,
    /// Wires aggregate the provider's exclusive capabilities into the
    /// requirer's space; `reexport` directives chain transitively.
    Aggregate,
    /// Fragment attachment; capabilities of the fragment surface as hosted
    /// capabilities of the host.
    Attach,
    /// No space participation.
    None,
}

impl Namespace {
    /// Attribute key that carries a capability's identity value.
    pub fn key(&self) -> &'static str {
        match self {
            Namespace::Package => "package",
            Namespace::Bundle => "bundle",
            Namespace::Host => "host",
            Namespace::Identity => "identity",
            Namespace::ExecutionEnvironment => "ee",
        }
    }

    /// Conflict-detection strategy table.
    pub fn strategy(&self) -> ConflictStrategy {
        match self {
            Namespace::Package => ConflictStrategy::Exclusive,
            Namespace::Bundle => ConflictStrategy::Aggregate,
            Namespace::Host => ConflictStrategy::Attach,
            Namespace::Identity | Namespace::ExecutionEnvironment => ConflictStrategy::None,
        }
    }

    /// Whether capabilities in this namespace are fragment payload: payload
    /// capabilities surface on the host when their declaring fragment
    /// attaches. Identity always stays with the declaring resource.
    pub fn is_payload(&self) -> bool {
        !matches!(
            self,
            Namespace::Host | Namespace::ExecutionEnvironment | Namespace::Identity
        )
    }

    /// Whether self-wires (provider == requirer) are suppressed. Identity
    /// namespaces allow them; wiring-style namespaces do not.
    pub fn suppresses_self_wires(&self) -> bool {
        matches!(
            self.strategy(),
            ConflictStrategy::Exclusive | ConflictStrategy::Aggregate
        )
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_table_is_total() {
        assert_eq!(Namespace::Package.strategy(), ConflictStrategy::Exclusive);
        assert_eq!(Namespace::Bundle.strategy(), ConflictStrategy::Aggregate);
        assert_eq!(Namespace::Host.strategy(), ConflictStrategy::Attach);
        assert_eq!(Namespace::Identity.strategy(), ConflictStrategy::None);
        assert_eq!(
            Namespace::ExecutionEnvironment.strategy(),
            ConflictStrategy::None
        );
    }

    #[test]
    fn payload_excludes_attachment_and_identity() {
        assert!(!Namespace::Host.is_payload());
        assert!(!Namespace::ExecutionEnvironment.is_payload());
        assert!(!Namespace::Identity.is_payload());
        assert!(Namespace::Package.is_payload());
        assert!(Namespace::Bundle.is_payload());
    }
}

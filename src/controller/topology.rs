//! Replication topology of a member set
//!
//! A `MemberSnapshot` is built fresh every cycle by discovery, filled in by
//! the prober, and gated by `check` before anything is written back.

use serde::Serialize;
use thiserror::Error;

/// Label key carrying the replication role on pods and Service selectors
pub const ROLE_LABEL_KEY: &str = "pg-selector/replication-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Unknown,
    Primary,
    Standby,
}

impl Role {
    /// Map the result of `pg_is_in_recovery()` to a role
    pub fn from_recovery(in_recovery: bool) -> Self {
        if in_recovery {
            Role::Standby
        } else {
            Role::Primary
        }
    }

    /// Value for `ROLE_LABEL_KEY`, `None` while unresolved
    pub fn label_value(&self) -> Option<&'static str> {
        match self {
            Role::Primary => Some("primary"),
            Role::Standby => Some("standby"),
            Role::Unknown => None,
        }
    }
}

/// One database replica: a pod and its endpoint addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    /// Pod name
    pub identity: String,
    pub addresses: Vec<String>,
    pub role: Role,
}

impl Member {
    pub fn new(identity: impl Into<String>, addresses: Vec<String>) -> Self {
        Member {
            identity: identity.into(),
            addresses,
            role: Role::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberSnapshot {
    /// EndpointSlices the members were read from
    pub endpoint_slices: Vec<String>,
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleCounts {
    pub primary: usize,
    pub standby: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("Found {primary} primary members, expected exactly one; unable to determine the primary")]
    PrimaryCount { primary: usize },

    #[error("{resolved} of {members} members have a resolved role")]
    UnresolvedMembers { members: usize, resolved: usize },
}

/// Count roles in a snapshot
pub fn count_roles(snapshot: &MemberSnapshot) -> RoleCounts {
    snapshot
        .members
        .iter()
        .fold(RoleCounts { primary: 0, standby: 0 }, |mut counts, member| {
            match member.role {
                Role::Primary => counts.primary += 1,
                Role::Standby => counts.standby += 1,
                Role::Unknown => {}
            }
            counts
        })
}

/// Validate that the snapshot describes a well-defined topology
///
/// Requires exactly one primary, and every member resolved to a role.
/// Labels and Service selectors are only written when this passes.
pub fn check(snapshot: &MemberSnapshot) -> Result<RoleCounts, InvariantViolation> {
    let counts = count_roles(snapshot);

    if counts.primary != 1 {
        return Err(InvariantViolation::PrimaryCount {
            primary: counts.primary,
        });
    }

    let resolved = counts.primary + counts.standby;
    if resolved != snapshot.members.len() {
        return Err(InvariantViolation::UnresolvedMembers {
            members: snapshot.members.len(),
            resolved,
        });
    }

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(roles: &[Role]) -> MemberSnapshot {
        MemberSnapshot {
            endpoint_slices: vec!["pg-set-abc12".to_string()],
            members: roles
                .iter()
                .enumerate()
                .map(|(i, role)| Member {
                    identity: format!("pg-{}", i),
                    addresses: vec![format!("10.0.0.{}", i + 1)],
                    role: *role,
                })
                .collect(),
        }
    }

    #[test]
    fn test_role_from_recovery() {
        assert_eq!(Role::from_recovery(true), Role::Standby);
        assert_eq!(Role::from_recovery(false), Role::Primary);
    }

    #[test]
    fn test_role_label_values() {
        assert_eq!(Role::Primary.label_value(), Some("primary"));
        assert_eq!(Role::Standby.label_value(), Some("standby"));
        assert_eq!(Role::Unknown.label_value(), None);
    }

    #[test]
    fn test_check_accepts_single_primary() {
        for roles in [
            vec![Role::Primary],
            vec![Role::Standby, Role::Primary, Role::Standby],
            vec![Role::Primary, Role::Standby],
        ] {
            let counts = check(&snapshot(&roles)).unwrap_or_else(|e| {
                panic!("{:?} should pass, got {}", roles, e);
            });
            assert_eq!(counts.primary, 1);
            assert_eq!(counts.standby, roles.len() - 1);
        }
    }

    #[test]
    fn test_check_rejects_wrong_primary_count() {
        assert_eq!(
            check(&snapshot(&[Role::Primary, Role::Primary, Role::Standby])),
            Err(InvariantViolation::PrimaryCount { primary: 2 })
        );
        assert_eq!(
            check(&snapshot(&[Role::Standby, Role::Standby])),
            Err(InvariantViolation::PrimaryCount { primary: 0 })
        );
        assert_eq!(
            check(&MemberSnapshot::default()),
            Err(InvariantViolation::PrimaryCount { primary: 0 })
        );
    }

    #[test]
    fn test_check_rejects_unresolved_member() {
        assert_eq!(
            check(&snapshot(&[Role::Primary, Role::Unknown, Role::Standby])),
            Err(InvariantViolation::UnresolvedMembers {
                members: 3,
                resolved: 2
            })
        );
    }

    /// Every combination of up to four members: Ok exactly when there is
    /// one primary and nothing unresolved
    #[test]
    fn test_check_matches_counts_for_all_small_topologies() {
        let roles = [Role::Unknown, Role::Primary, Role::Standby];
        for len in 0..=4u32 {
            for code in 0..3usize.pow(len) {
                let members: Vec<Role> = (0..len)
                    .map(|i| roles[(code / 3usize.pow(i)) % 3])
                    .collect();
                let primary = members.iter().filter(|r| **r == Role::Primary).count();
                let standby = members.iter().filter(|r| **r == Role::Standby).count();
                let expected_ok = primary == 1 && primary + standby == members.len();

                assert_eq!(
                    check(&snapshot(&members)).is_ok(),
                    expected_ok,
                    "roles {:?}",
                    members
                );
            }
        }
    }

    #[test]
    fn test_snapshot_serializes_for_logging() {
        let json = serde_json::to_value(snapshot(&[Role::Primary])).unwrap();
        assert_eq!(json["endpointSlices"][0], "pg-set-abc12");
        assert_eq!(json["members"][0]["role"], "primary");
        assert_eq!(json["members"][0]["identity"], "pg-0");
    }
}

//! Role-based security policies.
//!
//! A policy grants a role a set of actions on maps matching a `*`-glob
//! pattern, optionally restricted to a field whitelist. A request is
//! allowed when at least one policy applies: the role is held by the
//! principal, the pattern matches the map, the action set covers the
//! request, and — when the policy carries `allowed_fields` — every field
//! the request touches is listed.

use lattice_core::Principal;
use serde::{Deserialize, Serialize};

/// Actions a policy can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Reads and queries.
    Read,
    /// LWW set and OR add.
    Put,
    /// LWW remove and OR remove.
    Remove,
    /// Everything above.
    All,
}

impl Action {
    /// Whether a granted action covers a requested one.
    #[must_use]
    pub fn covers(self, requested: Action) -> bool {
        self == Action::All || self == requested
    }
}

/// One grant: role, map pattern, actions, optional field whitelist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Role this policy applies to.
    pub role: String,
    /// Map-name glob; `*` matches any run of characters.
    pub map_name_pattern: String,
    /// Actions granted.
    pub actions: Vec<Action>,
    /// When present, the only value fields the grant covers.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub allowed_fields: Option<Vec<String>>,
}

/// Evaluates policies for the session pipeline.
pub struct PolicyEngine {
    policies: Vec<Policy>,
}

impl PolicyEngine {
    /// Creates an engine over a fixed policy set.
    #[must_use]
    pub fn new(policies: Vec<Policy>) -> Self {
        Self { policies }
    }

    /// An engine that allows everything; for deployments doing their
    /// authorization upstream.
    #[must_use]
    pub fn allow_all() -> Self {
        Self::new(vec![Policy {
            role: "*".to_string(),
            map_name_pattern: "*".to_string(),
            actions: vec![Action::All],
            allowed_fields: None,
        }])
    }

    /// Checks one request.
    ///
    /// `fields` lists the value field paths the request touches (empty
    /// for deletes and whole-value reads).
    ///
    /// # Errors
    ///
    /// Returns a denial reason when no policy grants the request.
    pub fn check(
        &self,
        principal: &Principal,
        map_name: &str,
        action: Action,
        fields: &[String],
    ) -> Result<(), String> {
        for policy in &self.policies {
            if !policy_role_applies(policy, principal) {
                continue;
            }
            if !glob_match(&policy.map_name_pattern, map_name) {
                continue;
            }
            if !policy.actions.iter().any(|a| a.covers(action)) {
                continue;
            }
            if let Some(allowed) = &policy.allowed_fields {
                if !fields.iter().all(|f| allowed.contains(f)) {
                    continue;
                }
            }
            return Ok(());
        }
        Err(format!(
            "no policy grants {action:?} on {map_name} to roles {:?}",
            principal.roles
        ))
    }
}

fn policy_role_applies(policy: &Policy, principal: &Principal) -> bool {
    policy.role == "*" || principal.roles.iter().any(|r| r == &policy.role)
}

/// `*`-glob matcher with linear backtracking.
#[must_use]
pub fn glob_match(pattern: &str, input: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let input: Vec<char> = input.chars().collect();

    let (mut p, mut i) = (0_usize, 0_usize);
    let mut star: Option<(usize, usize)> = None;

    while i < input.len() {
        if p < pattern.len() && (pattern[p] == input[i]) {
            p += 1;
            i += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, i));
            p += 1;
        } else if let Some((star_p, star_i)) = star {
            // Let the last star absorb one more character.
            p = star_p + 1;
            i = star_i + 1;
            star = Some((star_p, star_i + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

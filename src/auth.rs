//! Roles, sessions and the visibility policy applied to every read.
//!
//! Everything here is pure: no I/O, no mutation of the resources checked.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller roles, ordered from least to most privileged.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  #[default]
  Unauthenticated,
  Authenticated,
  Member,
  Admin,
}

impl Role {
  /// Checks if this role has at least the permissions of the required role.
  pub fn has_permission(self, required: Role) -> bool {
    self >= required
  }

  /// Derives a role from organization and team memberships at login.
  ///
  /// Admin needs both membership of the configured organization and of one of
  /// its admin teams. Slugs compare case-insensitively.
  pub fn derive(organizations: &BTreeSet<String>, teams: &BTreeSet<String>, access: &AccessConfig) -> Role {
    if !organizations
      .iter()
      .any(|org| org.eq_ignore_ascii_case(&access.organization))
    {
      return Role::Authenticated;
    }
    let is_admin = teams.iter().any(|team| {
      access
        .admin_teams
        .iter()
        .any(|admin| admin.eq_ignore_ascii_case(team))
    });
    if is_admin {
      Role::Admin
    } else {
      Role::Member
    }
  }
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Unauthenticated => write!(f, "unauthenticated"),
      Self::Authenticated => write!(f, "authenticated"),
      Self::Member => write!(f, "member"),
      Self::Admin => write!(f, "admin"),
    }
  }
}

/// Membership rules used by [`Role::derive`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AccessConfig {
  /// Organization whose members may see private pipelines
  #[serde(default)]
  pub organization: String,
  /// Team slugs whose members are administrators
  #[serde(default)]
  pub admin_teams: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
  Public,
  Private,
}

/// Resources carrying a visibility flag.
pub trait Visible {
  fn visibility(&self) -> Visibility;
}

impl<T: Visible> Visible for &T {
  fn visibility(&self) -> Visibility {
    (**self).visibility()
  }
}

/// Whether `role` may read `resource`.
pub fn can_view<R: Visible + ?Sized>(role: Role, resource: &R) -> bool {
  match resource.visibility() {
    Visibility::Public => true,
    Visibility::Private => role.has_permission(Role::Member),
  }
}

/// Drops the entries `role` may not see, keeping the original order.
pub fn filter_list<R: Visible>(role: Role, resources: Vec<R>) -> Vec<R> {
  resources.into_iter().filter(|r| can_view(role, r)).collect()
}

/// Returned by [`reveal`] when there is nothing the caller may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hidden;

/// Single-resource gate: a resource `role` may not view is reported exactly
/// like one that does not exist.
pub fn reveal<R: Visible>(role: Role, resource: Option<R>) -> Result<R, Hidden> {
  match resource {
    Some(r) if can_view(role, &r) => Ok(r),
    _ => Err(Hidden),
  }
}

/// A resolved login, handed to the core by the OAuth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
  pub user: String,
  pub organizations: BTreeSet<String>,
  pub team_memberships: BTreeSet<String>,
  /// Fixed at login
  pub role: Role,
  pub expires_at: DateTime<Utc>,
  pub last_used: Option<DateTime<Utc>>,
}

impl Session {
  /// Builds a session and derives its role once.
  pub fn login(
    user: impl Into<String>,
    organizations: BTreeSet<String>,
    team_memberships: BTreeSet<String>,
    access: &AccessConfig,
    expires_at: DateTime<Utc>,
  ) -> Self {
    let role = Role::derive(&organizations, &team_memberships, access);
    Self {
      user: user.into(),
      organizations,
      team_memberships,
      role,
      expires_at,
      last_used: None,
    }
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }

  pub fn touch(&mut self, now: DateTime<Utc>) {
    self.last_used = Some(now);
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnauthorizedReason {
  NoSession,
  Expired,
  InsufficientRole { required: Role, actual: Role },
}

impl fmt::Display for UnauthorizedReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::NoSession => write!(f, "not logged in"),
      Self::Expired => write!(f, "session expired"),
      Self::InsufficientRole { required, actual } => {
        write!(f, "requires {} role, have {}", required, actual)
      }
    }
  }
}

/// Outcome of the coarse route-level check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
  /// The caller passed; `None` only when the route admits anonymous callers.
  Authorized(Option<Session>),
  Unauthorized(UnauthorizedReason),
}

impl AuthDecision {
  /// Effective role for the fine-grained filter.
  pub fn role(&self) -> Role {
    match self {
      Self::Authorized(Some(session)) => session.role,
      _ => Role::Unauthenticated,
    }
  }
}

/// Checks that the caller holds at least `required` for a route.
///
/// An expired session counts as no session for anonymous routes.
pub fn precheck(session: Option<&Session>, required: Role, now: DateTime<Utc>) -> AuthDecision {
  let live = session.filter(|s| !s.is_expired(now));

  if required == Role::Unauthenticated {
    return AuthDecision::Authorized(live.cloned());
  }

  match (session, live) {
    (None, _) => AuthDecision::Unauthorized(UnauthorizedReason::NoSession),
    (Some(_), None) => AuthDecision::Unauthorized(UnauthorizedReason::Expired),
    (Some(_), Some(s)) if !s.role.has_permission(required) => {
      AuthDecision::Unauthorized(UnauthorizedReason::InsufficientRole {
        required,
        actual: s.role,
      })
    }
    (Some(_), Some(s)) => {
      let mut s = s.clone();
      s.touch(now);
      AuthDecision::Authorized(Some(s))
    }
  }
}

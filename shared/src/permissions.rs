//! Typed permission model
//!
//! Raw permission claims arrive as strings of the form
//! `[base_X[-Y...]/]resource:action` (e.g. `base_2-3/stock:write`). They are
//! parsed once, at authentication time, into a [`PermissionMap`] that
//! answers every authorization question afterwards. A `write` or `edit`
//! grant implies the corresponding `read` grant for the same scope.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

/// Resources whose permission checks ignore any supplied base id
pub const BASE_AGNOSTIC_RESOURCES: &[&str] = &["organisation", "user", "history"];

/// The set of bases a permission grant applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BaseScope {
    AllBases,
    SpecificBases(BTreeSet<i64>),
}

impl BaseScope {
    pub fn covers(&self, base_id: i64) -> bool {
        match self {
            BaseScope::AllBases => true,
            BaseScope::SpecificBases(ids) => ids.contains(&base_id),
        }
    }

    pub fn covers_all(&self, base_ids: &[i64]) -> bool {
        base_ids.iter().all(|id| self.covers(*id))
    }

    fn merge(&mut self, other: BaseScope) {
        match (&mut *self, other) {
            (BaseScope::AllBases, _) => {}
            (_, BaseScope::AllBases) => *self = BaseScope::AllBases,
            (BaseScope::SpecificBases(mine), BaseScope::SpecificBases(theirs)) => {
                mine.extend(theirs);
            }
        }
    }
}

/// The identifiers of the authenticated principal, for identity-based checks
#[derive(Debug, Clone, Copy)]
pub struct Principal {
    pub user_id: i64,
    pub organisation_id: i64,
}

/// Context arguments for an authorization decision, evaluated in priority
/// order: base, bases, organisation, organisations, user
#[derive(Debug, Clone, Default)]
pub struct AuthorizeContext<'a> {
    pub base_id: Option<i64>,
    pub base_ids: Option<&'a [i64]>,
    pub organisation_id: Option<i64>,
    pub organisation_ids: Option<&'a [i64]>,
    pub user_id: Option<i64>,
}

impl<'a> AuthorizeContext<'a> {
    pub fn for_base(base_id: i64) -> Self {
        Self {
            base_id: Some(base_id),
            ..Default::default()
        }
    }

    pub fn for_bases(base_ids: &'a [i64]) -> Self {
        Self {
            base_ids: Some(base_ids),
            ..Default::default()
        }
    }

    pub fn for_organisation(organisation_id: i64) -> Self {
        Self {
            organisation_id: Some(organisation_id),
            ..Default::default()
        }
    }
}

/// A rejected authorization, naming the permission or the deciding argument
/// and its value for diagnostic reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeFailure {
    pub permission: Option<String>,
    /// Which of {permission, base, bases, organisation, organisations, user}
    /// decided the rejection
    pub argument: &'static str,
    pub value: String,
}

/// Permission → base-scope mapping for one authenticated principal
#[derive(Debug, Clone)]
pub struct PermissionMap {
    god: bool,
    grants: HashMap<String, BaseScope>,
}

impl PermissionMap {
    /// The "god" principal is authorized for everything
    pub fn god() -> Self {
        Self {
            god: true,
            grants: HashMap::new(),
        }
    }

    pub fn is_god(&self) -> bool {
        self.god
    }

    /// Build the map from raw claim strings. Malformed claims are dropped; a
    /// claim without a base prefix grants the permission for all bases.
    pub fn from_claims<I, S>(claims: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut grants: HashMap<String, BaseScope> = HashMap::new();
        for claim in claims {
            let Some((scope, resource, action)) = parse_claim(claim.as_ref()) else {
                continue;
            };
            insert_grant(&mut grants, &resource, &action, scope.clone());
            // write/edit implicitly grant read for the same scope
            if action == "write" || action == "edit" {
                insert_grant(&mut grants, &resource, "read", scope);
            }
        }
        Self { god: false, grants }
    }

    /// The base scope granted for a `resource:action` permission, if any
    pub fn scope(&self, permission: &str) -> Option<&BaseScope> {
        self.grants.get(permission)
    }

    /// Decide whether the principal may perform `permission` given the
    /// supplied context arguments; the first failing argument, in priority
    /// order, is reported
    pub fn authorize(
        &self,
        principal: Principal,
        permission: Option<&str>,
        ctx: &AuthorizeContext<'_>,
    ) -> Result<(), AuthorizeFailure> {
        if self.god {
            return Ok(());
        }

        let scope = match permission {
            Some(p) => {
                let Some(scope) = self.grants.get(p) else {
                    return Err(AuthorizeFailure {
                        permission: Some(p.to_string()),
                        argument: "permission",
                        value: p.to_string(),
                    });
                };
                Some(scope)
            }
            None => None,
        };
        let base_agnostic = permission
            .and_then(|p| p.split(':').next())
            .is_some_and(|r| BASE_AGNOSTIC_RESOURCES.contains(&r));

        if let Some(base_id) = ctx.base_id {
            let granted = base_agnostic || scope.is_some_and(|s| s.covers(base_id));
            if !granted {
                return Err(AuthorizeFailure {
                    permission: permission.map(String::from),
                    argument: "base",
                    value: base_id.to_string(),
                });
            }
        } else if let Some(base_ids) = ctx.base_ids {
            let granted = base_agnostic || scope.is_some_and(|s| s.covers_all(base_ids));
            if !granted {
                return Err(AuthorizeFailure {
                    permission: permission.map(String::from),
                    argument: "bases",
                    value: format!("{:?}", base_ids),
                });
            }
        } else if let Some(organisation_id) = ctx.organisation_id {
            if principal.organisation_id != organisation_id {
                return Err(AuthorizeFailure {
                    permission: permission.map(String::from),
                    argument: "organisation",
                    value: organisation_id.to_string(),
                });
            }
        } else if let Some(organisation_ids) = ctx.organisation_ids {
            if !organisation_ids.contains(&principal.organisation_id) {
                return Err(AuthorizeFailure {
                    permission: permission.map(String::from),
                    argument: "organisations",
                    value: format!("{:?}", organisation_ids),
                });
            }
        } else if let Some(user_id) = ctx.user_id {
            if principal.user_id != user_id {
                return Err(AuthorizeFailure {
                    permission: permission.map(String::from),
                    argument: "user",
                    value: user_id.to_string(),
                });
            }
        }

        Ok(())
    }
}

fn insert_grant(grants: &mut HashMap<String, BaseScope>, resource: &str, action: &str, scope: BaseScope) {
    grants
        .entry(format!("{}:{}", resource, action))
        .and_modify(|existing| existing.merge(scope.clone()))
        .or_insert(scope);
}

/// Parse one `[base_X[-Y...]/]resource:action` claim
fn parse_claim(claim: &str) -> Option<(BaseScope, String, String)> {
    let (scope, rest) = match claim.split_once('/') {
        Some((prefix, rest)) => {
            let ids = prefix.strip_prefix("base_")?;
            let ids: BTreeSet<i64> = ids
                .split('-')
                .map(|id| id.parse().ok())
                .collect::<Option<_>>()?;
            if ids.is_empty() {
                return None;
            }
            (BaseScope::SpecificBases(ids), rest)
        }
        None => (BaseScope::AllBases, claim),
    };
    let (resource, action) = rest.split_once(':')?;
    if resource.is_empty() || action.is_empty() {
        return None;
    }
    Some((scope, resource.to_string(), action.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal() -> Principal {
        Principal {
            user_id: 7,
            organisation_id: 1,
        }
    }

    #[test]
    fn test_parse_claim_with_base_prefix() {
        let (scope, resource, action) = parse_claim("base_2-3/stock:write").unwrap();
        assert_eq!(scope, BaseScope::SpecificBases([2, 3].into_iter().collect()));
        assert_eq!(resource, "stock");
        assert_eq!(action, "write");
    }

    #[test]
    fn test_parse_claim_without_prefix_means_all_bases() {
        let (scope, ..) = parse_claim("shipment:edit").unwrap();
        assert_eq!(scope, BaseScope::AllBases);
    }

    #[test]
    fn test_parse_claim_malformed() {
        assert!(parse_claim("base_x/stock:write").is_none());
        assert!(parse_claim("stock").is_none());
        assert!(parse_claim("base_1/stock").is_none());
    }

    #[test]
    fn test_write_implies_read_with_same_scope() {
        let map = PermissionMap::from_claims(["base_2/stock:write"]);
        assert!(map.scope("stock:read").unwrap().covers(2));
        assert!(!map.scope("stock:read").unwrap().covers(3));
    }

    #[test]
    fn test_scope_merging_across_claims() {
        let map = PermissionMap::from_claims(["base_1/stock:read", "base_2/stock:read"]);
        let scope = map.scope("stock:read").unwrap();
        assert!(scope.covers(1) && scope.covers(2));

        let map = PermissionMap::from_claims(["base_1/stock:read", "stock:read"]);
        assert_eq!(map.scope("stock:read"), Some(&BaseScope::AllBases));
    }

    #[test]
    fn test_authorize_base_scoped() {
        let map = PermissionMap::from_claims(["base_2/stock:write"]);
        let ok = map.authorize(
            principal(),
            Some("stock:write"),
            &AuthorizeContext::for_base(2),
        );
        assert!(ok.is_ok());

        let err = map
            .authorize(
                principal(),
                Some("stock:write"),
                &AuthorizeContext::for_base(3),
            )
            .unwrap_err();
        assert_eq!(err.argument, "base");
        assert_eq!(err.value, "3");
    }

    #[test]
    fn test_authorize_missing_permission_names_it() {
        let map = PermissionMap::from_claims(["base_2/stock:read"]);
        let err = map
            .authorize(
                principal(),
                Some("shipment:edit"),
                &AuthorizeContext::for_base(2),
            )
            .unwrap_err();
        assert_eq!(err.argument, "permission");
        assert_eq!(err.permission.as_deref(), Some("shipment:edit"));
    }

    #[test]
    fn test_base_agnostic_resource_ignores_base() {
        let map = PermissionMap::from_claims(["base_99/organisation:read"]);
        assert!(map
            .authorize(
                principal(),
                Some("organisation:read"),
                &AuthorizeContext::for_base(1),
            )
            .is_ok());
    }

    #[test]
    fn test_authorize_organisation_membership() {
        let map = PermissionMap::from_claims(["transfer_agreement:create"]);
        assert!(map
            .authorize(
                principal(),
                Some("transfer_agreement:create"),
                &AuthorizeContext::for_organisation(1),
            )
            .is_ok());
        let err = map
            .authorize(
                principal(),
                Some("transfer_agreement:create"),
                &AuthorizeContext::for_organisation(2),
            )
            .unwrap_err();
        assert_eq!(err.argument, "organisation");
    }

    #[test]
    fn test_authorize_priority_base_before_organisation() {
        let map = PermissionMap::from_claims(["base_1/stock:read"]);
        let ctx = AuthorizeContext {
            base_id: Some(9),
            organisation_id: Some(2),
            ..Default::default()
        };
        // both arguments would fail; base is the deciding one
        let err = map
            .authorize(principal(), Some("stock:read"), &ctx)
            .unwrap_err();
        assert_eq!(err.argument, "base");
    }

    #[test]
    fn test_authorize_user_identity() {
        let map = PermissionMap::from_claims(["user:read"]);
        let ctx = AuthorizeContext {
            user_id: Some(7),
            ..Default::default()
        };
        assert!(map.authorize(principal(), None, &ctx).is_ok());
        let ctx = AuthorizeContext {
            user_id: Some(8),
            ..Default::default()
        };
        let err = map.authorize(principal(), None, &ctx).unwrap_err();
        assert_eq!(err.argument, "user");
    }

    #[test]
    fn test_god_principal_authorized_for_everything() {
        let map = PermissionMap::god();
        let ctx = AuthorizeContext {
            base_id: Some(123),
            ..Default::default()
        };
        assert!(map
            .authorize(principal(), Some("anything:delete"), &ctx)
            .is_ok());
    }
}

use sqlx::AnyPool;

use crate::db::{self, Repository, User};
use crate::error::HubError;

/// Organization membership roles, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrgRole {
    Visitor,
    Member,
    Admin,
    SuperAdmin,
}

impl OrgRole {
    pub fn parse(role: &str) -> Option<Self> {
        match role {
            "visitor" => Some(Self::Visitor),
            "member" => Some(Self::Member),
            "admin" => Some(Self::Admin),
            "super-admin" => Some(Self::SuperAdmin),
            _ => None,
        }
    }

    pub fn can_write(self) -> bool {
        self >= Self::Member
    }

    pub fn can_admin(self) -> bool {
        self >= Self::Admin
    }
}

async fn org_role(
    pool: &AnyPool,
    namespace: &str,
    user: &User,
) -> Result<Option<OrgRole>, HubError> {
    let Some(org) = db::get_organization_by_name(pool, namespace).await? else {
        return Ok(None);
    };
    let Some(membership) = db::get_membership(pool, &user.id, &org.id).await? else {
        return Ok(None);
    };
    Ok(OrgRole::parse(&membership.role))
}

/// Read access: public repos are open; private repos need the owner or
/// any org membership. Anonymous callers get 401, known callers 403.
pub async fn check_repo_read(
    pool: &AnyPool,
    repo: &Repository,
    user: Option<&User>,
) -> Result<(), HubError> {
    if !repo.private {
        return Ok(());
    }

    let Some(user) = user else {
        return Err(HubError::Unauthorized);
    };

    if repo.namespace == user.name {
        return Ok(());
    }
    if org_role(pool, &repo.namespace, user).await?.is_some() {
        return Ok(());
    }

    Err(HubError::Forbidden)
}

/// Write access: own namespace, or member-or-better in the owning org.
pub async fn check_repo_write(
    pool: &AnyPool,
    repo: &Repository,
    user: &User,
) -> Result<(), HubError> {
    if repo.namespace == user.name {
        return Ok(());
    }
    if org_role(pool, &repo.namespace, user)
        .await?
        .is_some_and(OrgRole::can_write)
    {
        return Ok(());
    }
    Err(HubError::Forbidden)
}

/// Delete/rename: like write, but org-owned repos require admin.
pub async fn check_repo_delete(
    pool: &AnyPool,
    repo: &Repository,
    user: &User,
) -> Result<(), HubError> {
    if repo.namespace == user.name {
        return Ok(());
    }
    if org_role(pool, &repo.namespace, user)
        .await?
        .is_some_and(OrgRole::can_admin)
    {
        return Ok(());
    }
    Err(HubError::Forbidden)
}

/// Creating under a namespace: own username, or a writing role in the org.
pub async fn check_namespace_use(
    pool: &AnyPool,
    namespace: &str,
    user: &User,
) -> Result<(), HubError> {
    if namespace == user.name {
        return Ok(());
    }
    if db::get_organization_by_name(pool, namespace).await?.is_none() {
        return Err(HubError::BadRequest(format!(
            "namespace '{namespace}' does not exist"
        )));
    }
    if org_role(pool, namespace, user)
        .await?
        .is_some_and(OrgRole::can_write)
    {
        return Ok(());
    }
    Err(HubError::Forbidden)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering() {
        assert!(OrgRole::SuperAdmin > OrgRole::Admin);
        assert!(OrgRole::Admin > OrgRole::Member);
        assert!(OrgRole::Member > OrgRole::Visitor);
    }

    #[test]
    fn visitor_cannot_write() {
        assert!(!OrgRole::Visitor.can_write());
        assert!(OrgRole::Member.can_write());
        assert!(!OrgRole::Member.can_admin());
        assert!(OrgRole::Admin.can_admin());
    }

    #[test]
    fn unknown_role_parses_to_none() {
        assert_eq!(OrgRole::parse("owner"), None);
        assert_eq!(OrgRole::parse("super-admin"), Some(OrgRole::SuperAdmin));
    }
}

use crate::model::{
    ApiError, ApprovalStatus, Brand, Concept, GenericEntity, UserContext,
};
use crate::store::traits::{EntityStore, PublicationStore};

/// Whether the brand in the request context admits this entity.
///
/// Published (APPROVED) versions bypass brand scoping on direct fetch;
/// list views additionally pre-filter by brand (see the search engine).
pub fn brand_allows(
    entity: &GenericEntity,
    brand: Option<&Brand>,
    status: Option<ApprovalStatus>,
) -> bool {
    let Some(brand) = brand else {
        return true;
    };
    if status == Some(ApprovalStatus::Approved) {
        return true;
    }
    entity.brands.contains(&brand.id)
}

/// Pure access derivation for one entity version.
///
/// `status` is the approval status of the version's latest publication
/// record, if any.
pub fn can_user_view_version(
    user: &UserContext,
    version: &GenericEntity,
    status: Option<ApprovalStatus>,
    brand: Option<&Brand>,
) -> bool {
    if !brand_allows(version, brand, status) {
        return false;
    }
    if status == Some(ApprovalStatus::Approved) {
        return true;
    }
    if user.is_superuser {
        return true;
    }
    if user.is_moderator
        && matches!(
            status,
            Some(ApprovalStatus::Requested)
                | Some(ApprovalStatus::Pending)
                | Some(ApprovalStatus::Rejected)
        )
    {
        return true;
    }
    if user.is_owner(&version.owner_id) {
        return true;
    }
    if let Some(group_id) = version.group_id {
        if user.is_member_of(group_id) && version.group_access.can_view() {
            return true;
        }
    }
    if user.is_authenticated() && version.world_access.can_view() {
        return true;
    }
    false
}

/// Edit derivation: superuser, owner, or group member with EDIT, and the
/// entity must belong to the current brand.
pub fn can_user_edit(user: &UserContext, entity: &GenericEntity, brand: Option<&Brand>) -> bool {
    if let Some(brand) = brand {
        if !entity.brands.contains(&brand.id) {
            return false;
        }
    }
    if user.is_superuser {
        return true;
    }
    if user.is_owner(&entity.owner_id) {
        return true;
    }
    if let Some(group_id) = entity.group_id {
        if user.is_member_of(group_id) && entity.group_access.can_edit() {
            return true;
        }
    }
    false
}

/// Concept access mirrors entity access, additionally allowing access when
/// the concept has any published version through its phenotype owner, or
/// when the user can view the phenotype-owner entity itself.
pub async fn can_user_view_concept<S>(
    store: &S,
    user: &UserContext,
    concept: &Concept,
    brand: Option<&Brand>,
) -> Result<bool, ApiError>
where
    S: EntityStore + PublicationStore + ?Sized,
{
    if user.is_superuser {
        return Ok(true);
    }
    if user.is_owner(&concept.owner_id) {
        return Ok(true);
    }
    if let Some(group_id) = concept.group_id {
        if user.is_member_of(group_id) && concept.group_access.can_view() {
            return Ok(true);
        }
    }
    if user.is_authenticated() && concept.world_access.can_view() {
        return Ok(true);
    }

    let Some(owner_id) = &concept.phenotype_owner_id else {
        return Ok(false);
    };
    let records = store.publication_records(owner_id).await?;
    if records
        .iter()
        .any(|r| r.approval_status == ApprovalStatus::Approved)
    {
        return Ok(true);
    }
    if let Some(owner) = store.get_entity(owner_id).await? {
        let status = latest_status(store, &owner).await?;
        return Ok(can_user_view_version(user, &owner, status, brand));
    }
    Ok(false)
}

/// Edit access to a concept: owner, group EDIT, or edit rights on the
/// phenotype-owner entity.
pub async fn can_user_edit_concept<S>(
    store: &S,
    user: &UserContext,
    concept: &Concept,
    brand: Option<&Brand>,
) -> Result<bool, ApiError>
where
    S: EntityStore + PublicationStore + ?Sized,
{
    if user.is_superuser {
        return Ok(true);
    }
    if user.is_owner(&concept.owner_id) {
        return Ok(true);
    }
    if let Some(group_id) = concept.group_id {
        if user.is_member_of(group_id) && concept.group_access.can_edit() {
            return Ok(true);
        }
    }
    if let Some(owner_id) = &concept.phenotype_owner_id {
        if let Some(owner) = store.get_entity(owner_id).await? {
            return Ok(can_user_edit(user, &owner, brand));
        }
    }
    Ok(false)
}

/// Approval status of an entity's latest history row, if a publication
/// record exists for it.
pub async fn latest_status<S>(
    store: &S,
    entity: &GenericEntity,
) -> Result<Option<ApprovalStatus>, ApiError>
where
    S: EntityStore + PublicationStore + ?Sized,
{
    let Some(latest) = store.latest_entity_version_id(&entity.public_id).await? else {
        return Ok(None);
    };
    Ok(store
        .latest_publication_record(&entity.public_id, latest)
        .await?
        .map(|r| r.approval_status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessLevel, PublicId};
    use chrono::Utc;

    fn entity(owner: &str) -> GenericEntity {
        let now = Utc::now();
        GenericEntity {
            public_id: PublicId::new("PH", 1),
            entity_class_id: 1,
            name: "test".to_string(),
            author: None,
            definition: None,
            implementation: None,
            validation: None,
            publications: Vec::new(),
            tags: Vec::new(),
            collections: Vec::new(),
            citation_requirements: None,
            internal_comments: None,
            template_id: 1,
            template_version: 1,
            template_data: serde_json::json!({}),
            brands: Vec::new(),
            owner_id: owner.to_string(),
            group_id: None,
            owner_access: AccessLevel::Edit,
            group_access: AccessLevel::None,
            world_access: AccessLevel::None,
            is_deleted: false,
            publish_status: None,
            created_by: owner.to_string(),
            created_at: now,
            updated_by: owner.to_string(),
            updated_at: now,
        }
    }

    #[test]
    fn approved_versions_are_visible_to_everyone() {
        let version = entity("alice");
        let anon = UserContext::anonymous();
        assert!(can_user_view_version(
            &anon,
            &version,
            Some(ApprovalStatus::Approved),
            None
        ));
        // Published content also bypasses brand scoping.
        let brand = Brand::new(2, "other", "Other");
        assert!(can_user_view_version(
            &anon,
            &version,
            Some(ApprovalStatus::Approved),
            Some(&brand)
        ));
    }

    #[test]
    fn unpublished_versions_hide_from_strangers() {
        let version = entity("alice");
        assert!(!can_user_view_version(
            &UserContext::user("bob"),
            &version,
            None,
            None
        ));
        assert!(can_user_view_version(
            &UserContext::user("alice"),
            &version,
            None,
            None
        ));
        assert!(can_user_view_version(
            &UserContext::superuser("root"),
            &version,
            None,
            None
        ));
    }

    #[test]
    fn moderators_see_versions_in_review() {
        let version = entity("alice");
        let moderator = UserContext::moderator("mia");
        assert!(can_user_view_version(
            &moderator,
            &version,
            Some(ApprovalStatus::Requested),
            None
        ));
        assert!(!can_user_view_version(&moderator, &version, None, None));
    }

    #[test]
    fn group_and_world_access_grant_view() {
        let mut version = entity("alice");
        version.group_id = Some(7);
        version.group_access = AccessLevel::View;
        let member = UserContext::user("bob").with_groups(vec![7]);
        assert!(can_user_view_version(&member, &version, None, None));

        let mut world = entity("alice");
        world.world_access = AccessLevel::View;
        assert!(can_user_view_version(
            &UserContext::user("carol"),
            &world,
            None,
            None
        ));
        // World VIEW still requires authentication.
        assert!(!can_user_view_version(
            &UserContext::anonymous(),
            &world,
            None,
            None
        ));
    }

    #[test]
    fn brand_scoping_hides_unpublished_foreign_entities() {
        let mut version = entity("alice");
        version.brands = vec![1];
        let brand2 = Brand::new(2, "b2", "Brand 2");
        assert!(!can_user_view_version(
            &UserContext::user("alice"),
            &version,
            None,
            Some(&brand2)
        ));
    }

    #[test]
    fn edit_requires_ownership_or_group_edit() {
        let mut version = entity("alice");
        assert!(can_user_edit(&UserContext::user("alice"), &version, None));
        assert!(!can_user_edit(&UserContext::user("bob"), &version, None));

        version.group_id = Some(3);
        version.group_access = AccessLevel::Edit;
        let member = UserContext::user("bob").with_groups(vec![3]);
        assert!(can_user_edit(&member, &version, None));

        let view_only = {
            let mut v = version.clone();
            v.group_access = AccessLevel::View;
            v
        };
        assert!(!can_user_edit(&member, &view_only, None));
    }
}

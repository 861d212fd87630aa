use crate::model::{
    ApiError, ApprovalStatus, GenericEntity, PublicId, PublishBlocker, PublishedRecord,
    RequestContext,
};
use crate::store::traits::Store;

use super::permissions::{can_user_edit, can_user_view_concept};

/// Whether the state machine admits `from -> to` for the given actor.
/// `from = None` means the version has never been submitted.
pub fn transition_allowed(
    from: Option<ApprovalStatus>,
    to: ApprovalStatus,
    is_owner: bool,
    is_moderator: bool,
) -> bool {
    use ApprovalStatus::*;
    match (from, to) {
        // First submission, or resubmission after a rejection.
        (None, Requested) | (Some(Rejected), Requested) => is_owner || is_moderator,
        (Some(Requested), Pending) => is_moderator,
        (Some(Requested), Approved) | (Some(Pending), Approved) => is_moderator,
        (Some(Requested), Rejected) | (Some(Pending), Rejected) => is_moderator,
        _ => false,
    }
}

/// Publish-readiness gate. Returns every structured reason the version
/// cannot be published; an empty list means it may proceed.
pub async fn publish_blockers<S: Store + ?Sized>(
    store: &S,
    ctx: &RequestContext,
    version: &GenericEntity,
) -> Result<Vec<PublishBlocker>, ApiError> {
    let mut blockers = Vec::new();

    if version.is_deleted {
        blockers.push(PublishBlocker::entity("Entity is deleted"));
    }
    if version.template_data.as_object().map_or(true, |o| o.is_empty()) {
        blockers.push(PublishBlocker::entity("Entity has no data"));
    }

    for (concept_id, version_id) in version.concept_references() {
        let Some(concept_row) = store.get_concept_version(concept_id, version_id).await? else {
            blockers.push(PublishBlocker::child(
                concept_id,
                version_id,
                format!("Child concept({}) version {} does not exist", concept_id, version_id),
            ));
            continue;
        };
        let concept = &concept_row.row;
        // The live row catches deletions made after this version was pinned.
        let live_deleted = store
            .get_concept(concept_id)
            .await?
            .map_or(true, |live| live.is_deleted);
        if concept.is_deleted || concept_row.history_type.is_delete() || live_deleted {
            blockers.push(PublishBlocker::child(
                concept_id,
                version_id,
                format!("Child concept({}) is deleted", concept_id),
            ));
            continue;
        }
        if !can_user_view_concept(store, &ctx.user, concept, ctx.brand.as_ref()).await? {
            blockers.push(PublishBlocker::child(
                concept_id,
                version_id,
                format!("Child concept({}) is not accessible", concept_id),
            ));
            continue;
        }
        if !child_is_publishable(store, version, concept).await? {
            blockers.push(PublishBlocker::child(
                concept_id,
                version_id,
                format!("Child concept({}) is not published", concept_id),
            ));
        }
    }
    Ok(blockers)
}

/// A referenced child must itself be published, unless the entity under
/// publication owns it (publishing the parent is what publishes an owned
/// child in the first place).
async fn child_is_publishable<S: Store + ?Sized>(
    store: &S,
    version: &GenericEntity,
    concept: &crate::model::Concept,
) -> Result<bool, ApiError> {
    let Some(owner_id) = &concept.phenotype_owner_id else {
        return Ok(false);
    };
    if owner_id == &version.public_id {
        return Ok(true);
    }
    let records = store.publication_records(owner_id).await?;
    Ok(records
        .iter()
        .any(|r| r.approval_status == ApprovalStatus::Approved))
}

/// Owner (or moderator) submits a version for publication. Runs the
/// readiness gate up front so an unpublishable version never enters the
/// queue.
pub async fn submit_for_publication<S: Store + ?Sized>(
    store: &S,
    ctx: &RequestContext,
    public_id: &PublicId,
    history_id: i64,
) -> Result<PublishedRecord, ApiError> {
    if !ctx.user.is_authenticated() {
        return Err(ApiError::Unauthenticated);
    }
    let version = store
        .get_entity_version(public_id, history_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let is_owner = can_user_edit(&ctx.user, &version.row, ctx.brand.as_ref());
    if !is_owner && !ctx.user.is_moderator {
        return Err(ApiError::Forbidden);
    }

    let current = store
        .latest_publication_record(public_id, history_id)
        .await?
        .map(|r| r.approval_status);
    if !transition_allowed(current, ApprovalStatus::Requested, is_owner, ctx.user.is_moderator) {
        return Err(ApiError::validation(
            "approval_status",
            "version is already in the publication queue",
        ));
    }

    let blockers = publish_blockers(store, ctx, &version.row).await?;
    if !blockers.is_empty() {
        return Err(ApiError::PublicationBlocked(blockers));
    }

    store
        .set_publication(
            public_id,
            history_id,
            ApprovalStatus::Requested,
            None,
            &ctx.user.audit_id(),
        )
        .await
        .map_err(ApiError::from)
}

/// Moderator moves a requested version into review.
pub async fn mark_pending<S: Store + ?Sized>(
    store: &S,
    ctx: &RequestContext,
    public_id: &PublicId,
    history_id: i64,
) -> Result<PublishedRecord, ApiError> {
    moderate(store, ctx, public_id, history_id, ApprovalStatus::Pending).await
}

/// Moderator approves a requested or pending version. Re-runs the
/// readiness gate: child state may have changed since submission.
pub async fn approve<S: Store + ?Sized>(
    store: &S,
    ctx: &RequestContext,
    public_id: &PublicId,
    history_id: i64,
) -> Result<PublishedRecord, ApiError> {
    let version = store
        .get_entity_version(public_id, history_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let blockers = publish_blockers(store, ctx, &version.row).await?;
    if !blockers.is_empty() {
        return Err(ApiError::PublicationBlocked(blockers));
    }
    moderate(store, ctx, public_id, history_id, ApprovalStatus::Approved).await
}

/// Moderator rejects a requested or pending version.
pub async fn reject<S: Store + ?Sized>(
    store: &S,
    ctx: &RequestContext,
    public_id: &PublicId,
    history_id: i64,
) -> Result<PublishedRecord, ApiError> {
    moderate(store, ctx, public_id, history_id, ApprovalStatus::Rejected).await
}

async fn moderate<S: Store + ?Sized>(
    store: &S,
    ctx: &RequestContext,
    public_id: &PublicId,
    history_id: i64,
    to: ApprovalStatus,
) -> Result<PublishedRecord, ApiError> {
    if !ctx.user.is_authenticated() {
        return Err(ApiError::Unauthenticated);
    }
    if !ctx.user.is_moderator && !ctx.user.is_superuser {
        return Err(ApiError::Forbidden);
    }
    if store.get_entity_version(public_id, history_id).await?.is_none() {
        return Err(ApiError::NotFound);
    }
    let current = store
        .latest_publication_record(public_id, history_id)
        .await?
        .map(|r| r.approval_status);
    if !transition_allowed(current, to, false, true) {
        return Err(ApiError::validation(
            "approval_status",
            format!("cannot move version to {} from its current state", to),
        ));
    }
    store
        .set_publication(
            public_id,
            history_id,
            to,
            Some(&ctx.user.audit_id()),
            &ctx.user.audit_id(),
        )
        .await
        .map_err(ApiError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ApprovalStatus::*;

    #[test]
    fn owners_submit_and_resubmit_only() {
        assert!(transition_allowed(None, Requested, true, false));
        assert!(transition_allowed(Some(Rejected), Requested, true, false));
        assert!(!transition_allowed(Some(Requested), Requested, true, false));
        assert!(!transition_allowed(Some(Approved), Requested, true, false));
        assert!(!transition_allowed(None, Requested, false, false));
    }

    #[test]
    fn moderation_requires_the_moderator_role() {
        assert!(transition_allowed(Some(Requested), Pending, false, true));
        assert!(!transition_allowed(Some(Requested), Pending, true, false));
        assert!(transition_allowed(Some(Pending), Approved, false, true));
        assert!(transition_allowed(Some(Requested), Approved, false, true));
        assert!(transition_allowed(Some(Pending), Rejected, false, true));
    }

    #[test]
    fn terminal_states_do_not_advance() {
        for to in [Pending, Approved, Rejected] {
            assert!(!transition_allowed(Some(Approved), to, false, true));
        }
        assert!(!transition_allowed(Some(Rejected), Approved, false, true));
    }
}

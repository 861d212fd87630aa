use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

use crate::api::handlers;
use crate::store::traits::Store;

/// Build the versioned API router. When `read_only` is set every write
/// endpoint answers 403 without touching the store.
pub fn create_router<S: Store + 'static>(read_only: bool) -> Router<Arc<S>> {
    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        // Phenotypes (generic entities)
        .route("/api/v1/phenotypes/", get(handlers::list_phenotypes::<S>))
        .route(
            "/api/v1/phenotypes/:public_id/",
            get(handlers::get_phenotype::<S>),
        )
        .route(
            "/api/v1/phenotypes/:public_id/versions/",
            get(handlers::list_phenotype_versions::<S>),
        )
        .route(
            "/api/v1/phenotypes/:public_id/version/:history_id/",
            get(handlers::get_phenotype_version::<S>),
        )
        .route(
            "/api/v1/phenotypes/:public_id/version/:history_id/:field/",
            get(handlers::get_phenotype_field::<S>),
        )
        // Concepts
        .route("/api/v1/concepts/", get(handlers::list_concepts::<S>))
        .route(
            "/api/v1/concepts/:concept_id/",
            get(handlers::get_concept::<S>),
        )
        .route(
            "/api/v1/concepts/:concept_id/version/:history_id/",
            get(handlers::get_concept_version::<S>),
        )
        .route(
            "/api/v1/concepts/:concept_id/version/:history_id/export/codes/",
            get(handlers::export_concept_codes::<S>),
        )
        // Templates
        .route("/api/v1/templates/", get(handlers::list_templates::<S>))
        .route(
            "/api/v1/templates/:template_id/",
            get(handlers::get_template::<S>),
        )
        .route(
            "/api/v1/templates/:template_id/version/:version/",
            get(handlers::get_template_version::<S>),
        )
        // Taxonomy
        .route("/api/v1/tags/", get(handlers::list_tags::<S>))
        .route("/api/v1/tags/:id/", get(handlers::get_tag::<S>))
        .route("/api/v1/collections/", get(handlers::list_collections::<S>))
        .route(
            "/api/v1/collections/:id/",
            get(handlers::get_collection::<S>),
        )
        // Ontology browse
        .route("/api/v1/ontology/", get(handlers::list_ontology_groups::<S>))
        .route(
            "/api/v1/ontology/:type_id/",
            get(handlers::get_ontology_group::<S>),
        )
        .route(
            "/api/v1/ontology/:type_id/:node_id/",
            get(handlers::get_ontology_node::<S>),
        );

    router = if read_only {
        router
            .route(
                "/api/v1/phenotypes/create/",
                post(handlers::read_only_rejected),
            )
            .route(
                "/api/v1/phenotypes/update/",
                put(handlers::read_only_rejected),
            )
            .route(
                "/api/v1/phenotypes/:public_id/version/:history_id/publish/request/",
                post(handlers::read_only_rejected),
            )
            .route(
                "/api/v1/phenotypes/:public_id/version/:history_id/publish/pending/",
                post(handlers::read_only_rejected),
            )
            .route(
                "/api/v1/phenotypes/:public_id/version/:history_id/publish/approve/",
                post(handlers::read_only_rejected),
            )
            .route(
                "/api/v1/phenotypes/:public_id/version/:history_id/publish/reject/",
                post(handlers::read_only_rejected),
            )
    } else {
        router
            .route(
                "/api/v1/phenotypes/create/",
                post(handlers::create_phenotype::<S>),
            )
            .route(
                "/api/v1/phenotypes/update/",
                put(handlers::update_phenotype::<S>),
            )
            .route(
                "/api/v1/phenotypes/:public_id/version/:history_id/publish/request/",
                post(handlers::request_publication::<S>),
            )
            .route(
                "/api/v1/phenotypes/:public_id/version/:history_id/publish/pending/",
                post(handlers::mark_publication_pending::<S>),
            )
            .route(
                "/api/v1/phenotypes/:public_id/version/:history_id/publish/approve/",
                post(handlers::approve_publication::<S>),
            )
            .route(
                "/api/v1/phenotypes/:public_id/version/:history_id/publish/reject/",
                post(handlers::reject_publication::<S>),
            )
    };

    router
}

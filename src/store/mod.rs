pub mod memory;
pub mod postgres;
pub mod template_cache;
pub mod traits;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use template_cache::TemplateCache;
pub use traits::{
    CodingSystemStore, ConceptStore, EntityStore, OntologyStore, PublicationStore, Store,
    TaxonomyStore, TemplateStore,
};

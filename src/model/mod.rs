pub mod code;
pub mod coding_system;
pub mod common;
pub mod component;
pub mod concept;
pub mod entity;
pub mod error;
pub mod ontology;
pub mod publication;
pub mod tags;
pub mod template;
pub mod user_context;

pub use code::*;
pub use coding_system::*;
pub use common::*;
pub use component::*;
pub use concept::*;
pub use entity::*;
pub use error::*;
pub use ontology::*;
pub use publication::*;
pub use tags::*;
pub use template::*;
pub use user_context::*;

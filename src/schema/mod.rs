//! Schema compilation and the compiled-schema registry.

mod cpt;
mod property;
mod registry;
mod source;

pub use cpt::{
    compile, compile_source, ClassDef, CompileError, CompiledSchema, RuleBook, SchemaSource,
    ShapeDef,
};
pub use property::{
    ClassDescriptor, ClassKind, ObjectStructure, PrimitiveKind, Property, PropertyContent, Rule,
    RuleFn,
};
pub use registry::{build_default, build_registry, SchemaRegistry, SEARCH_DELIMITER};
pub use source::{load_dir, SourceError};

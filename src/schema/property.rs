//! Compiled property descriptors.
//!
//! PrimitiveKind: closed set of leaf kinds.
//! Property: one declared field (kind or nested shape + modifiers).
//! ObjectStructure: ordered field list plus attached semantic rules.
//! ClassDescriptor: one item class, dynamic or static.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Leaf content kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimitiveKind {
    ShortText,
    LongText,
    Integer,
    Boolean,
    Date,
    Reference,
    FileRef,
    Choice,
}

impl PrimitiveKind {
    /// Human description used in validation messages.
    pub fn describe(self) -> &'static str {
        match self {
            PrimitiveKind::ShortText => "text",
            PrimitiveKind::LongText => "text",
            PrimitiveKind::Integer => "a whole number",
            PrimitiveKind::Boolean => "a boolean",
            PrimitiveKind::Date => "a calendar date (YYYY-MM-DD)",
            PrimitiveKind::Reference => "a reference id",
            PrimitiveKind::FileRef => "a file name",
            PrimitiveKind::Choice => "one of the allowed options",
        }
    }
}

/// Content of a property: exactly one primitive kind, or exactly one nested
/// reusable shape. Never both.
#[derive(Clone, Debug)]
pub enum PropertyContent {
    Primitive(PrimitiveKind),
    /// Shared, not copied: shapes are immutable after compilation.
    Structure(Arc<ObjectStructure>),
}

/// One declared field.
#[derive(Clone, Debug)]
pub struct Property {
    pub name: String,
    /// 0 = scalar, 1 = list, 2 = matrix.
    pub array_depth: u8,
    pub content: PropertyContent,
    /// Kind-specific parameters: referenced class for Reference, option set
    /// for Choice.
    pub arguments: Vec<String>,
    pub is_queryable: bool,
    pub is_openly_editable: bool,
    pub display_name: String,
    pub description: Option<String>,
}

impl Property {
    pub fn is_array(&self) -> bool {
        self.array_depth > 0
    }

    /// Target class name for Reference properties.
    pub fn reference_target(&self) -> Option<&str> {
        match self.content {
            PropertyContent::Primitive(PrimitiveKind::Reference) => {
                self.arguments.first().map(String::as_str)
            }
            _ => None,
        }
    }
}

/// Semantic rule attached to an object level.
///
/// `check` receives the local sub-record and returns whether it holds; an
/// `Err` is converted by the validator into a reported violation, never a
/// crash.
#[derive(Clone)]
pub struct Rule {
    pub message: String,
    pub check: RuleFn,
}

pub type RuleFn = Arc<dyn Fn(&Value) -> Result<bool, String> + Send + Sync>;

impl Rule {
    pub fn new(
        message: impl Into<String>,
        check: impl Fn(&Value) -> Result<bool, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            check: Arc::new(check),
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rule({:?})", self.message)
    }
}

/// Ordered field list for one shape or class root, plus attached rules.
#[derive(Clone, Debug, Default)]
pub struct ObjectStructure {
    pub name: String,
    pub properties: Vec<Property>,
    pub rules: Vec<Rule>,
}

impl ObjectStructure {
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Dynamic classes have many instances; static classes exactly one,
/// keyed by class name and never created or deleted by users.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassKind {
    Dynamic,
    Static,
}

/// Compiled schema for one item class.
#[derive(Clone, Debug)]
pub struct ClassDescriptor {
    pub name: String,
    pub kind: ClassKind,
    pub structure: Arc<ObjectStructure>,
}

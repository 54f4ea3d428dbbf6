//! CPT: the schema-declaration mini-language.
//!
//! A block is a sequence of `;`-separated statements, one per field:
//!
//! ```text
//! name KIND[(args)][[]...] [QUERY] [OPEN] ["Display Name"] ['description']
//! ```
//!
//! Kinds: `TEXT`, `LONGTEXT`, `INT`, `BOOL`, `DATE`, `REF(Class)`, `FILE`,
//! `CHOICE(a|b|c)`, or `{ShapeName}` for a reusable shape. One or two `[]`
//! suffixes make the field a list or a matrix.
//!
//! Compilation failures are fatal: the process must not start with a
//! partially-compiled schema.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;

use super::property::{
    ClassDescriptor, ClassKind, ObjectStructure, PrimitiveKind, Property, PropertyContent, Rule,
};

/// Semantic rules keyed by the shape or class name they attach to.
pub type RuleBook = BTreeMap<String, Vec<Rule>>;

/// One reusable shape declaration.
#[derive(Clone, Debug)]
pub struct ShapeDef {
    pub name: String,
    pub text: String,
}

/// One class declaration.
#[derive(Clone, Debug)]
pub struct ClassDef {
    pub name: String,
    pub kind: ClassKind,
    pub text: String,
}

/// Full schema input: reusable shapes plus classes.
#[derive(Clone, Debug, Default)]
pub struct SchemaSource {
    pub shapes: Vec<ShapeDef>,
    pub classes: Vec<ClassDef>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CompileError {
    #[error("{context}: unknown kind `{kind}` in `{statement}`")]
    UnknownKind {
        context: String,
        statement: String,
        kind: String,
    },
    #[error("{context}: reference to undefined shape `{reference}`")]
    UndefinedShape { context: String, reference: String },
    #[error("cyclic reusable shapes: {remaining:?}")]
    ShapeCycle { remaining: Vec<String> },
    #[error("{context}: malformed statement `{statement}`: {reason}")]
    Malformed {
        context: String,
        statement: String,
        reason: String,
    },
    #[error("{context}: duplicate field `{name}`")]
    DuplicateField { context: String, name: String },
}

/// Everything the registry needs from one compiler run.
#[derive(Clone, Debug)]
pub struct CompiledSchema {
    pub shapes: BTreeMap<String, Arc<ObjectStructure>>,
    pub classes: Vec<ClassDescriptor>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    DoubleQuoted(String),
    SingleQuoted(String),
}

fn tokenize(statement: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = statement.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' || c == '\'' {
            chars.next();
            let mut s = String::new();
            let mut closed = false;
            for d in chars.by_ref() {
                if d == c {
                    closed = true;
                    break;
                }
                s.push(d);
            }
            if !closed {
                return Err(format!("unterminated {c} quote"));
            }
            tokens.push(if c == '"' {
                Token::DoubleQuoted(s)
            } else {
                Token::SingleQuoted(s)
            });
        } else {
            let mut s = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_whitespace() {
                    break;
                }
                s.push(d);
                chars.next();
            }
            tokens.push(Token::Word(s));
        }
    }
    Ok(tokens)
}

/// Strip trailing `[]` suffixes, returning (base, depth).
fn strip_array_suffix<'a>(context: &str, statement: &str, kind: &'a str) -> Result<(&'a str, u8), CompileError> {
    let mut base = kind;
    let mut depth = 0u8;
    while let Some(stripped) = base.strip_suffix("[]") {
        base = stripped;
        depth += 1;
        if depth > 2 {
            return Err(CompileError::Malformed {
                context: context.to_string(),
                statement: statement.to_string(),
                reason: "more than two array dimensions".into(),
            });
        }
    }
    Ok((base, depth))
}

/// Derive a display name from an identifier: split on case transitions and
/// underscores, capitalize each word (`unofficialNames` -> `Unofficial Names`).
fn display_name_from(name: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut word = String::new();
    let mut prev_lower = false;
    for c in name.chars() {
        if c == '_' {
            if !word.is_empty() {
                words.push(std::mem::take(&mut word));
            }
            prev_lower = false;
        } else if c.is_uppercase() && prev_lower {
            words.push(std::mem::take(&mut word));
            word.push(c);
            prev_lower = false;
        } else {
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
            word.push(c);
        }
    }
    if !word.is_empty() {
        words.push(word);
    }
    words
        .iter()
        .map(|w| {
            let mut cs = w.chars();
            match cs.next() {
                Some(first) => first.to_uppercase().collect::<String>() + cs.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_kind(
    context: &str,
    statement: &str,
    base: &str,
    shapes: &BTreeMap<String, Arc<ObjectStructure>>,
) -> Result<(PropertyContent, Vec<String>), CompileError> {
    if let Some(inner) = base.strip_prefix('{') {
        let Some(name) = inner.strip_suffix('}') else {
            return Err(CompileError::Malformed {
                context: context.to_string(),
                statement: statement.to_string(),
                reason: "unterminated shape reference".into(),
            });
        };
        let Some(shape) = shapes.get(name) else {
            return Err(CompileError::UndefinedShape {
                context: context.to_string(),
                reference: name.to_string(),
            });
        };
        return Ok((PropertyContent::Structure(Arc::clone(shape)), Vec::new()));
    }

    let (keyword, args) = match base.split_once('(') {
        Some((kw, rest)) => {
            let Some(inner) = rest.strip_suffix(')') else {
                return Err(CompileError::Malformed {
                    context: context.to_string(),
                    statement: statement.to_string(),
                    reason: "unterminated argument list".into(),
                });
            };
            let args: Vec<String> = inner.split('|').map(|a| a.trim().to_string()).collect();
            (kw, args)
        }
        None => (base, Vec::new()),
    };

    let kind = match keyword {
        "TEXT" => PrimitiveKind::ShortText,
        "LONGTEXT" => PrimitiveKind::LongText,
        "INT" => PrimitiveKind::Integer,
        "BOOL" => PrimitiveKind::Boolean,
        "DATE" => PrimitiveKind::Date,
        "REF" => PrimitiveKind::Reference,
        "FILE" => PrimitiveKind::FileRef,
        "CHOICE" => PrimitiveKind::Choice,
        _ => {
            return Err(CompileError::UnknownKind {
                context: context.to_string(),
                statement: statement.to_string(),
                kind: keyword.to_string(),
            });
        }
    };

    let arg_ok = match kind {
        PrimitiveKind::Reference => args.len() == 1 && !args[0].is_empty(),
        PrimitiveKind::Choice => !args.is_empty() && args.iter().all(|a| !a.is_empty()),
        _ => args.is_empty(),
    };
    if !arg_ok {
        return Err(CompileError::Malformed {
            context: context.to_string(),
            statement: statement.to_string(),
            reason: format!("wrong arguments for {keyword}"),
        });
    }

    Ok((PropertyContent::Primitive(kind), args))
}

fn parse_statement(
    context: &str,
    statement: &str,
    shapes: &BTreeMap<String, Arc<ObjectStructure>>,
) -> Result<Property, CompileError> {
    let malformed = |reason: String| CompileError::Malformed {
        context: context.to_string(),
        statement: statement.to_string(),
        reason,
    };

    let tokens = tokenize(statement).map_err(&malformed)?;
    let mut iter = tokens.into_iter();

    let name = match iter.next() {
        Some(Token::Word(w)) if is_identifier(&w) => w,
        Some(other) => return Err(malformed(format!("expected field name, got {other:?}"))),
        None => return Err(malformed("empty statement".into())),
    };
    let raw_kind = match iter.next() {
        Some(Token::Word(w)) => w,
        _ => return Err(malformed("expected a kind after the field name".into())),
    };

    let (base, array_depth) = strip_array_suffix(context, statement, &raw_kind)?;
    let (content, arguments) = parse_kind(context, statement, base, shapes)?;

    let mut prop = Property {
        display_name: display_name_from(&name),
        name,
        array_depth,
        content,
        arguments,
        is_queryable: false,
        is_openly_editable: false,
        description: None,
    };

    for token in iter {
        match token {
            Token::Word(w) if w == "QUERY" => prop.is_queryable = true,
            Token::Word(w) if w == "OPEN" || w == "*" => prop.is_openly_editable = true,
            Token::DoubleQuoted(s) => prop.display_name = s,
            Token::SingleQuoted(s) => prop.description = Some(s),
            other => return Err(malformed(format!("unexpected modifier {other:?}"))),
        }
    }

    Ok(prop)
}

fn compile_block(
    context: &str,
    text: &str,
    shapes: &BTreeMap<String, Arc<ObjectStructure>>,
    rules: Vec<Rule>,
) -> Result<ObjectStructure, CompileError> {
    let mut properties: Vec<Property> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for statement in text.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        let prop = parse_statement(context, statement, shapes)?;
        if !seen.insert(prop.name.clone()) {
            return Err(CompileError::DuplicateField {
                context: context.to_string(),
                name: prop.name,
            });
        }
        properties.push(prop);
    }
    Ok(ObjectStructure {
        name: context.to_string(),
        properties,
        rules,
    })
}

/// Shape names referenced by a block, without fully compiling it.
fn shape_refs(text: &str) -> Vec<String> {
    let mut refs = Vec::new();
    for statement in text.split(';') {
        let Ok(tokens) = tokenize(statement) else {
            continue;
        };
        if let Some(Token::Word(raw)) = tokens.get(1) {
            let base = raw.trim_end_matches("[]");
            if let Some(inner) = base.strip_prefix('{') {
                if let Some(name) = inner.strip_suffix('}') {
                    refs.push(name.to_string());
                }
            }
        }
    }
    refs
}

/// Compile one standalone block with no reusable shapes and no rules.
pub fn compile(text: &str) -> Result<ObjectStructure, CompileError> {
    compile_block("<schema>", text, &BTreeMap::new(), Vec::new())
}

/// Compile a full schema source: shapes in dependency order, then classes.
///
/// Shapes may reference other shapes but must not form a cycle; the worklist
/// fails when no shape without outstanding dependencies remains.
pub fn compile_source(source: &SchemaSource, rules: &RuleBook) -> Result<CompiledSchema, CompileError> {
    let mut shapes: BTreeMap<String, Arc<ObjectStructure>> = BTreeMap::new();
    let pending_names: BTreeSet<&str> = source.shapes.iter().map(|s| s.name.as_str()).collect();

    // Pre-scan references so a genuinely undefined shape fails as such
    // instead of being misreported as a cycle.
    let mut deps: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for def in &source.shapes {
        let refs = shape_refs(&def.text);
        for r in &refs {
            if !pending_names.contains(r.as_str()) {
                return Err(CompileError::UndefinedShape {
                    context: def.name.clone(),
                    reference: r.clone(),
                });
            }
        }
        deps.insert(&def.name, refs);
    }

    let mut pending: Vec<&ShapeDef> = source.shapes.iter().collect();
    while !pending.is_empty() {
        let mut next = Vec::new();
        let mut progressed = false;
        for def in pending {
            let ready = deps[def.name.as_str()]
                .iter()
                .all(|d| shapes.contains_key(d));
            if ready {
                let rule_set = rules.get(&def.name).cloned().unwrap_or_default();
                let structure = compile_block(&def.name, &def.text, &shapes, rule_set)?;
                shapes.insert(def.name.clone(), Arc::new(structure));
                progressed = true;
            } else {
                next.push(def);
            }
        }
        if !progressed {
            return Err(CompileError::ShapeCycle {
                remaining: next.iter().map(|d| d.name.clone()).collect(),
            });
        }
        pending = next;
    }

    let mut classes = Vec::new();
    for def in &source.classes {
        let rule_set = rules.get(&def.name).cloned().unwrap_or_default();
        let structure = compile_block(&def.name, &def.text, &shapes, rule_set)?;
        classes.push(ClassDescriptor {
            name: def.name.clone(),
            kind: def.kind,
            structure: Arc::new(structure),
        });
    }

    Ok(CompiledSchema { shapes, classes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_queryable_text_array() {
        let structure = compile("tags TEXT[] QUERY;").unwrap();
        let prop = structure.property("tags").unwrap();
        assert!(prop.is_array());
        assert_eq!(prop.array_depth, 1);
        assert!(matches!(
            prop.content,
            PropertyContent::Primitive(PrimitiveKind::ShortText)
        ));
        assert!(prop.is_queryable);
        assert!(!prop.is_openly_editable);
    }

    #[test]
    fn derives_display_name_from_case_transitions() {
        let structure = compile("unofficialNames TEXT[];").unwrap();
        assert_eq!(
            structure.property("unofficialNames").unwrap().display_name,
            "Unofficial Names"
        );
    }

    #[test]
    fn explicit_display_name_and_description() {
        let structure = compile("releaseDate DATE \"Released\" 'first public release';").unwrap();
        let prop = structure.property("releaseDate").unwrap();
        assert_eq!(prop.display_name, "Released");
        assert_eq!(prop.description.as_deref(), Some("first public release"));
    }

    #[test]
    fn reference_and_choice_arguments() {
        let structure = compile("album REF(Album); mood CHOICE(calm|tense|weird) OPEN;").unwrap();
        let album = structure.property("album").unwrap();
        assert_eq!(album.reference_target(), Some("Album"));
        let mood = structure.property("mood").unwrap();
        assert_eq!(mood.arguments, vec!["calm", "tense", "weird"]);
        assert!(mood.is_openly_editable);
    }

    #[test]
    fn unknown_kind_is_fatal() {
        let err = compile("x BLOB;").unwrap_err();
        assert!(matches!(err, CompileError::UnknownKind { kind, .. } if kind == "BLOB"));
    }

    #[test]
    fn duplicate_field_is_fatal() {
        let err = compile("x INT; x TEXT;").unwrap_err();
        assert!(matches!(err, CompileError::DuplicateField { name, .. } if name == "x"));
    }

    #[test]
    fn three_array_dimensions_rejected() {
        assert!(compile("x INT[][][];").is_err());
    }

    #[test]
    fn shapes_compile_in_dependency_order() {
        let source = SchemaSource {
            shapes: vec![
                ShapeDef {
                    name: "Track".into(),
                    text: "title TEXT; credits {Credit}[];".into(),
                },
                ShapeDef {
                    name: "Credit".into(),
                    text: "role TEXT; person REF(Artist);".into(),
                },
            ],
            classes: vec![ClassDef {
                name: "Album".into(),
                kind: ClassKind::Dynamic,
                text: "name TEXT QUERY; tracks {Track}[];".into(),
            }],
        };
        let compiled = compile_source(&source, &RuleBook::new()).unwrap();
        assert_eq!(compiled.shapes.len(), 2);
        let album = &compiled.classes[0];
        let tracks = album.structure.property("tracks").unwrap();
        assert!(matches!(tracks.content, PropertyContent::Structure(_)));
    }

    #[test]
    fn shape_cycle_is_fatal() {
        let source = SchemaSource {
            shapes: vec![
                ShapeDef {
                    name: "A".into(),
                    text: "b {B};".into(),
                },
                ShapeDef {
                    name: "B".into(),
                    text: "a {A};".into(),
                },
            ],
            classes: vec![],
        };
        let err = compile_source(&source, &RuleBook::new()).unwrap_err();
        assert!(matches!(err, CompileError::ShapeCycle { .. }));
    }

    #[test]
    fn undefined_shape_is_not_a_cycle() {
        let source = SchemaSource {
            shapes: vec![ShapeDef {
                name: "A".into(),
                text: "b {Missing};".into(),
            }],
            classes: vec![],
        };
        let err = compile_source(&source, &RuleBook::new()).unwrap_err();
        assert!(matches!(err, CompileError::UndefinedShape { reference, .. } if reference == "Missing"));
    }
}

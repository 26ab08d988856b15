//! The reserved-tag grammar gate between an external AST and the rest of
//! the pipeline. Pure analysis: no disk, no cache, no queue.
//!
//! Grounded on `original_source/src/engine/validator/validator.c`'s
//! per-command-kind reserved-tag table, kept as the authoritative tree per
//! `DESIGN.md`'s open-question decision over the source's second,
//! thinner validator.

use std::collections::HashSet;

use tagbase_core::{
    AstNode, Comparison, CommandKind, Literal, RawCommand, ReservedKey, TagValue, ValidatedCommand,
    ValidationError,
};

use crate::container::validate_name;
use crate::config::MAX_ENTITY_STR_LEN;

/// How deep a `where` expression tree may nest before validation gives up
/// rather than risk unbounded recursion on an adversarial AST.
const MAX_WHERE_DEPTH: usize = 64;

pub fn validate(raw: RawCommand) -> Result<ValidatedCommand, ValidationError> {
    match raw.kind {
        CommandKind::Event => validate_event(raw),
        CommandKind::Query => validate_query(raw),
        CommandKind::Index => validate_index(raw),
    }
}

fn take_literal(raw: &mut RawCommand, key: ReservedKey) -> Option<Literal> {
    match raw.reserved.remove(&key) {
        Some(TagValue::Literal(lit)) => Some(lit),
        Some(TagValue::Expression(_)) => None,
        None => None,
    }
}

fn take_string(raw: &mut RawCommand, key: ReservedKey) -> Result<Option<String>, ValidationError> {
    match raw.reserved.remove(&key) {
        Some(TagValue::Literal(Literal::String(s))) => Ok(Some(s)),
        Some(_) => Err(ValidationError::UnexpectedTag(key.as_str())),
        None => Ok(None),
    }
}

fn forbid(raw: &RawCommand, keys: &[ReservedKey]) -> Result<(), ValidationError> {
    for key in keys {
        if raw.reserved.contains_key(key) {
            return Err(ValidationError::UnexpectedTag(key.as_str()));
        }
    }
    Ok(())
}

fn dedup_custom_tags(raw: &RawCommand) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for (key, _) in &raw.custom {
        if !seen.insert(key.as_str()) {
            return Err(ValidationError::DuplicateCustomTag(key.clone()));
        }
    }
    Ok(())
}

fn validate_container_name(name: &str) -> Result<(), ValidationError> {
    validate_name(name).map_err(|_| ValidationError::InvalidContainerName(name.to_string()))
}

fn validate_entity(entity: &str) -> Result<(), ValidationError> {
    if entity.len() > MAX_ENTITY_STR_LEN {
        return Err(ValidationError::EntityTooLong);
    }
    Ok(())
}

fn validate_event(mut raw: RawCommand) -> Result<ValidatedCommand, ValidationError> {
    forbid(&raw, &[ReservedKey::Where, ReservedKey::Take, ReservedKey::Cursor, ReservedKey::Key])?;

    // `id` is accepted syntactically but not yet implemented.
    if raw.reserved.remove(&ReservedKey::Id).is_some() {
        return Err(ValidationError::NotYetSupported("id"));
    }

    let container = take_string(&mut raw, ReservedKey::In)?
        .ok_or(ValidationError::MissingTag("in"))?;
    validate_container_name(&container)?;

    let entity = take_string(&mut raw, ReservedKey::Entity)?
        .ok_or(ValidationError::MissingTag("entity"))?;
    validate_entity(&entity)?;

    if let Some((key, _)) = raw.reserved.iter().next() {
        return Err(ValidationError::UnexpectedTag(key.as_str()));
    }

    dedup_custom_tags(&raw)?;

    Ok(ValidatedCommand {
        kind: CommandKind::Event,
        container: Some(container),
        entity: Some(entity),
        filter: None,
        index_key: None,
        tags: raw.custom,
        take: None,
    })
}

fn validate_query(mut raw: RawCommand) -> Result<ValidatedCommand, ValidationError> {
    forbid(&raw, &[ReservedKey::Entity, ReservedKey::Key])?;

    if raw.reserved.contains_key(&ReservedKey::Cursor) {
        return Err(ValidationError::NotYetSupported("cursor"));
    }

    let container = take_string(&mut raw, ReservedKey::In)?
        .ok_or(ValidationError::MissingTag("in"))?;
    validate_container_name(&container)?;

    let where_tag = raw
        .reserved
        .remove(&ReservedKey::Where)
        .ok_or(ValidationError::MissingTag("where"))?;
    let expr = match where_tag {
        TagValue::Expression(node) => *node,
        TagValue::Literal(_) => {
            return Err(ValidationError::InvalidWhereExpression(
                "where must be an expression, not a bare literal".to_string(),
            ))
        }
    };
    validate_where_expr(&expr, 0)?;

    let take = match take_literal(&mut raw, ReservedKey::Take) {
        Some(Literal::Integer(n)) if n > 0 => Some(n as u32),
        Some(_) => return Err(ValidationError::InvalidTake),
        None => None,
    };

    if let Some((key, _)) = raw.reserved.iter().next() {
        return Err(ValidationError::UnexpectedTag(key.as_str()));
    }

    dedup_custom_tags(&raw)?;

    Ok(ValidatedCommand {
        kind: CommandKind::Query,
        container: Some(container),
        entity: None,
        filter: Some(expr),
        index_key: None,
        tags: raw.custom,
        take,
    })
}

fn validate_index(mut raw: RawCommand) -> Result<ValidatedCommand, ValidationError> {
    forbid(
        &raw,
        &[
            ReservedKey::In,
            ReservedKey::Where,
            ReservedKey::Entity,
            ReservedKey::Take,
            ReservedKey::Cursor,
        ],
    )?;

    let key = take_string(&mut raw, ReservedKey::Key)?
        .ok_or(ValidationError::MissingTag("key"))?;

    if let Some((key, _)) = raw.reserved.iter().next() {
        return Err(ValidationError::UnexpectedTag(key.as_str()));
    }

    dedup_custom_tags(&raw)?;

    Ok(ValidatedCommand {
        kind: CommandKind::Index,
        container: None,
        entity: None,
        filter: None,
        index_key: Some(key),
        tags: raw.custom,
        take: None,
    })
}

/// Recursively validates a `where` expression: every leaf is a tag
/// reference; logical nodes recurse into both operands; comparison nodes
/// require both sides to be literals of the same non-string type (spec
/// §4.0).
fn validate_where_expr(node: &AstNode, depth: usize) -> Result<(), ValidationError> {
    if depth > MAX_WHERE_DEPTH {
        return Err(ValidationError::InvalidWhereExpression(
            "expression nests too deeply".to_string(),
        ));
    }
    match node {
        AstNode::Tag { .. } => Ok(()),
        AstNode::Logical { left, right, .. } => {
            validate_where_expr(left, depth + 1)?;
            validate_where_expr(right, depth + 1)
        }
        AstNode::Not(inner) => validate_where_expr(inner, depth + 1),
        AstNode::Comparison(cmp) => validate_comparison(cmp),
        AstNode::List(items) => {
            if items.is_empty() {
                return Err(ValidationError::InvalidWhereExpression(
                    "list expression must not be empty".to_string(),
                ));
            }
            for item in items {
                validate_where_expr(item, depth + 1)?;
            }
            Ok(())
        }
    }
}

fn validate_comparison(cmp: &Comparison) -> Result<(), ValidationError> {
    match cmp {
        Comparison::Tag { .. } => Ok(()),
        Comparison::Op { key, .. } if key.is_empty() => Err(ValidationError::InvalidComparison),
        Comparison::Op { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn raw(kind: CommandKind) -> RawCommand {
        RawCommand {
            kind,
            reserved: HashMap::new(),
            custom: Vec::new(),
        }
    }

    #[test]
    fn event_requires_in_and_entity() {
        let cmd = raw(CommandKind::Event);
        assert!(matches!(
            validate(cmd),
            Err(ValidationError::MissingTag("in"))
        ));
    }

    #[test]
    fn event_rejects_id_as_not_yet_supported() {
        let mut cmd = raw(CommandKind::Event);
        cmd.reserved.insert(ReservedKey::In, TagValue::Literal(Literal::String("metrics".into())));
        cmd.reserved.insert(ReservedKey::Entity, TagValue::Literal(Literal::String("u-1".into())));
        cmd.reserved.insert(ReservedKey::Id, TagValue::Literal(Literal::Integer(1)));
        assert!(matches!(
            validate(cmd),
            Err(ValidationError::NotYetSupported("id"))
        ));
    }

    #[test]
    fn event_rejects_duplicate_custom_tags() {
        let mut cmd = raw(CommandKind::Event);
        cmd.reserved.insert(ReservedKey::In, TagValue::Literal(Literal::String("metrics".into())));
        cmd.reserved.insert(ReservedKey::Entity, TagValue::Literal(Literal::String("u-1".into())));
        cmd.custom.push(("loc".into(), Literal::String("ca".into())));
        cmd.custom.push(("loc".into(), Literal::String("ny".into())));
        assert!(matches!(
            validate(cmd),
            Err(ValidationError::DuplicateCustomTag(_))
        ));
    }

    #[test]
    fn event_accepts_well_formed_command() {
        let mut cmd = raw(CommandKind::Event);
        cmd.reserved.insert(ReservedKey::In, TagValue::Literal(Literal::String("metrics".into())));
        cmd.reserved.insert(ReservedKey::Entity, TagValue::Literal(Literal::String("u-1".into())));
        cmd.custom.push(("loc".into(), Literal::String("ca".into())));
        let validated = validate(cmd).unwrap();
        assert_eq!(validated.container.as_deref(), Some("metrics"));
        assert_eq!(validated.tags.len(), 1);
    }

    #[test]
    fn query_requires_where_and_rejects_cursor() {
        let mut cmd = raw(CommandKind::Query);
        cmd.reserved.insert(ReservedKey::In, TagValue::Literal(Literal::String("metrics".into())));
        cmd.reserved.insert(ReservedKey::Cursor, TagValue::Literal(Literal::Integer(0)));
        assert!(matches!(
            validate(cmd),
            Err(ValidationError::NotYetSupported("cursor"))
        ));
    }

    #[test]
    fn query_validates_nested_where_expression() {
        let mut cmd = raw(CommandKind::Query);
        cmd.reserved.insert(ReservedKey::In, TagValue::Literal(Literal::String("metrics".into())));
        let expr = AstNode::Logical {
            op: tagbase_core::LogicalOp::And,
            left: Box::new(AstNode::Tag {
                key: "loc".into(),
                value: tagbase_core::ast::TagValue::Literal(Literal::String("ca".into())),
            }),
            right: Box::new(AstNode::Not(Box::new(AstNode::Tag {
                key: "status".into(),
                value: tagbase_core::ast::TagValue::Literal(Literal::String("down".into())),
            }))),
        };
        cmd.reserved.insert(ReservedKey::Where, TagValue::Expression(Box::new(expr)));
        let validated = validate(cmd).unwrap();
        assert!(validated.filter.is_some());
    }

    #[test]
    fn query_rejects_comparison_with_empty_key() {
        let mut cmd = raw(CommandKind::Query);
        cmd.reserved.insert(ReservedKey::In, TagValue::Literal(Literal::String("metrics".into())));
        let expr = AstNode::Comparison(Comparison::Op {
            key: String::new(),
            op: tagbase_core::ast::CompareOp::Gt,
            value: Literal::Integer(1),
        });
        cmd.reserved.insert(ReservedKey::Where, TagValue::Expression(Box::new(expr)));
        assert!(matches!(
            validate(cmd),
            Err(ValidationError::InvalidComparison)
        ));
    }

    #[test]
    fn query_accepts_comparison_on_indexed_key() {
        let mut cmd = raw(CommandKind::Query);
        cmd.reserved.insert(ReservedKey::In, TagValue::Literal(Literal::String("metrics".into())));
        let expr = AstNode::Comparison(Comparison::Op {
            key: "ts".into(),
            op: tagbase_core::ast::CompareOp::Gt,
            value: Literal::Integer(100),
        });
        cmd.reserved.insert(ReservedKey::Where, TagValue::Expression(Box::new(expr)));
        assert!(validate(cmd).is_ok());
    }

    #[test]
    fn index_requires_key_and_forbids_in() {
        let mut cmd = raw(CommandKind::Index);
        cmd.reserved.insert(ReservedKey::In, TagValue::Literal(Literal::String("metrics".into())));
        cmd.reserved.insert(ReservedKey::Key, TagValue::Literal(Literal::String("loc".into())));
        assert!(matches!(
            validate(cmd),
            Err(ValidationError::UnexpectedTag("in"))
        ));
    }
}

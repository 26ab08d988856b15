//! AST types consumed (not produced) by this crate. The tokenizer and
//! parser are out of scope; they hand a tree shaped like this to
//! [`crate::command::ValidatedCommand::validate`].
//!
//! Grounded on `original_source/include/query/ast.h` and
//! `src/query/ast.c` (node variants `COMMAND_NODE` / `LOGICAL_NODE` /
//! `NOT_NODE` / `IDENTIFIER_NODE` / `LIST_NODE`) and on the reserved-tag
//! grammar documented in `original_source/src/engine/validator/validator.c`.

use std::collections::HashMap;

/// The three command kinds the grammar supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Event,
    Query,
    Index,
}

/// A literal value attached to a tag or used as a comparison operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Integer(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Lt,
    Gt,
    Le,
    Ge,
}

/// A node in a `where`-expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Tag { key: String, value: Literal },
    /// `key OP literal`, e.g. `ts > 100`. Resolved at evaluation time
    /// against the container's secondary index for `key`.
    Op {
        key: String,
        op: CompareOp,
        value: Literal,
    },
}

/// The unvalidated AST handed in by the out-of-scope parser.
#[derive(Debug, Clone, PartialEq)]
pub enum AstNode {
    /// A tag attached to the top-level command: `key: value`.
    Tag { key: String, value: TagValue },
    Logical {
        op: LogicalOp,
        left: Box<AstNode>,
        right: Box<AstNode>,
    },
    Not(Box<AstNode>),
    Comparison(Comparison),
    List(Vec<AstNode>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Literal(Literal),
    Expression(Box<AstNode>),
}

/// The reserved tag keys recognized by the grammar, independent of which
/// command kind they end up being valid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservedKey {
    In,
    Id,
    Where,
    Entity,
    Take,
    Cursor,
    Key,
}

impl ReservedKey {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservedKey::In => "in",
            ReservedKey::Id => "id",
            ReservedKey::Where => "where",
            ReservedKey::Entity => "entity",
            ReservedKey::Take => "take",
            ReservedKey::Cursor => "cursor",
            ReservedKey::Key => "key",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "in" => Some(ReservedKey::In),
            "id" => Some(ReservedKey::Id),
            "where" => Some(ReservedKey::Where),
            "entity" => Some(ReservedKey::Entity),
            "take" => Some(ReservedKey::Take),
            "cursor" => Some(ReservedKey::Cursor),
            "key" => Some(ReservedKey::Key),
            _ => None,
        }
    }
}

/// A flat top-level command: a kind plus an ordered list of tags, as the
/// out-of-scope parser would hand to us. Reserved tags are separated from
/// custom ones here purely for ergonomics; the validator still enforces
/// the grammar.
#[derive(Debug, Clone)]
pub struct RawCommand {
    pub kind: CommandKind,
    pub reserved: HashMap<ReservedKey, TagValue>,
    /// Custom tags in encounter order, duplicates included — the
    /// validator is responsible for rejecting duplicates, not this type.
    pub custom: Vec<(String, Literal)>,
}

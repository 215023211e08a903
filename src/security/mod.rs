// # Security Subsystem
//
// Input and SQL validation, the compiled threat-pattern detector and
// the RBAC authorizer.

pub mod patterns;
pub mod rbac;
pub mod validator;

pub use patterns::{DetectionReport, PatternDetector, PatternMatch, ThreatKind};
pub use rbac::RbacAuthorizer;
pub use validator::{InputValidator, SqlValidator};

use serde::Serialize;

/// First-keyword classification of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryVerb {
    Select,
    Insert,
    Update,
    Delete,
    Replace,
    Show,
    Describe,
    Explain,
    Create,
    Alter,
    Drop,
    Truncate,
}

impl QueryVerb {
    /// Classify by the statement's first keyword.
    pub fn parse(sql: &str) -> Option<QueryVerb> {
        let first = sql.trim().split_whitespace().next()?.to_uppercase();
        match first.as_str() {
            "SELECT" => Some(QueryVerb::Select),
            "INSERT" => Some(QueryVerb::Insert),
            "UPDATE" => Some(QueryVerb::Update),
            "DELETE" => Some(QueryVerb::Delete),
            "REPLACE" => Some(QueryVerb::Replace),
            "SHOW" => Some(QueryVerb::Show),
            "DESCRIBE" | "DESC" => Some(QueryVerb::Describe),
            "EXPLAIN" => Some(QueryVerb::Explain),
            "CREATE" => Some(QueryVerb::Create),
            "ALTER" => Some(QueryVerb::Alter),
            "DROP" => Some(QueryVerb::Drop),
            "TRUNCATE" => Some(QueryVerb::Truncate),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueryVerb::Select => "SELECT",
            QueryVerb::Insert => "INSERT",
            QueryVerb::Update => "UPDATE",
            QueryVerb::Delete => "DELETE",
            QueryVerb::Replace => "REPLACE",
            QueryVerb::Show => "SHOW",
            QueryVerb::Describe => "DESCRIBE",
            QueryVerb::Explain => "EXPLAIN",
            QueryVerb::Create => "CREATE",
            QueryVerb::Alter => "ALTER",
            QueryVerb::Drop => "DROP",
            QueryVerb::Truncate => "TRUNCATE",
        }
    }

    /// Verbs that never mutate data.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            QueryVerb::Select | QueryVerb::Show | QueryVerb::Describe | QueryVerb::Explain
        )
    }

    /// Data definition statements.
    pub fn is_ddl(self) -> bool {
        matches!(
            self,
            QueryVerb::Create | QueryVerb::Alter | QueryVerb::Drop | QueryVerb::Truncate
        )
    }

    /// Anything that can change data or schema.
    pub fn is_mutating(self) -> bool {
        !self.is_read()
    }
}

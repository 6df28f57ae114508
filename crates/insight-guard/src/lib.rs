//! SQL safety gate for model-generated analytics queries.
//!
//! [`SqlSafetyValidator`] splits a statement into its CTE bodies, main query
//! and nested subqueries, rejects injection-shaped fragments and checks every
//! referenced table against an allow-list.

pub mod authorize;
pub mod config;
pub mod decompose;
pub mod nested;
pub mod patterns;
pub mod scanner;
pub mod tables;
pub mod validator;

pub use authorize::{TableAllowList, UnauthorizedTable};
pub use config::ValidationConfig;
pub use decompose::{decompose, CteDefinition, DecomposeError, Decomposition};
pub use nested::{extract_nested_queries, NestedKind, NestedQuery};
pub use patterns::{check_fragment, SecurityCheck, SecurityViolation};
pub use tables::{extract_tables, Fragment, RESERVED_WORDS};
pub use validator::{GuardError, PolicyMode, SqlSafetyValidator, ValidationOutcome};

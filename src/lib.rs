//! relq compiles lazily-composed relational operator chains into executable
//! plans.
//!
//! As much of a query as possible runs inside a relational database; the
//! rest degrades, operator by operator, to in-process evaluation.  Compiled
//! plans are cached by the structural hash of the parameterized query shape,
//! so repeated invocations with different captured values skip the whole
//! translation pipeline.
//!
//! The stages, in the order one call to [`engine::QueryEngine::execute`]
//! runs them:
//! - [`normalize`]: captured values become parameters; the shape is hashed.
//! - [`cache`]: hash to compiled plan; a hit skips straight to invocation.
//! - [`inline`]: captured sub-queries are spliced into the main tree.
//! - [`compose`] (with [`translate`], [`rewrite`], [`grouping`],
//!   [`optimize`]): operator applications fold into relational IR ([`ir`])
//!   or fall back to client operators.
//! - [`lower`]: every relational node renders to a command via a
//!   [`dialect`], leaving an executable tree.
//! - [`client`]: invocation; residual operators and materialization run
//!   here, database calls go through the executor collaborator.
//!
//! [`memdb`] is a bundled executor that interprets the finalized IR over
//! in-memory tables, standing in for a real database.

pub mod cache;
pub mod client;
pub mod compose;
pub mod context;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod expr;
pub mod grouping;
pub mod inline;
pub mod ir;
pub mod lower;
pub mod memdb;
pub mod metadata;
pub mod normalize;
pub mod optimize;
pub mod rewrite;
pub mod translate;
pub mod types;
pub mod value;

pub use engine::{CommandExecutor, QueryEngine};
pub use error::{Error, Result};
pub use expr::{Capture, CapturedValue, ClientFn, Expr, Lambda, OpArg, OpKind};
pub use metadata::{Catalog, TableShape};
pub use types::ValueType;
pub use value::{Row, Value};

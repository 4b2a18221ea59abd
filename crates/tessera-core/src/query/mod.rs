//! Filter, expression, accumulator and sort grammar.

pub mod accumulator;
pub mod expression;
pub mod selector;
pub mod sort;
pub mod value;

pub use accumulator::{Accumulator, PercentileMode, UnaryOp};
pub use expression::{ComparisonOp, ConditionalOp, DistanceKind, Expression};
pub use selector::{FieldExpr, Selector, SELF_KEY};
pub use sort::{Sort, SortExpression, SortOrder};

//! Operational transformation for plain text.
//!
//! This crate holds the edit algebra shared by every site of a collaborative
//! session:
//!
//! - `operation`: the [`Operation`] sum type and how it is applied to text
//! - `transform`: reconciling two concurrent operations so both sites converge
//! - `compose`: folding two sequential operations into one
//! - `error`: errors raised when an operation does not fit a document
//!
//! Offsets and lengths are counted in Unicode scalar values.
//!
//! # Example
//!
//! ```
//! use text_ot::{transform, Operation, Priority};
//!
//! let base = "hello";
//! let a = Operation::insert(0, ">> ");
//! let b = Operation::delete(1, "ell");
//!
//! let (a2, b2) = transform(&a, &b, Priority::Left);
//! let left = b2.apply(&a.apply(base).unwrap()).unwrap();
//! let right = a2.apply(&b.apply(base).unwrap()).unwrap();
//!
//! assert_eq!(left, right);
//! assert_eq!(left, ">> ho");
//! ```

pub mod compose;
pub mod error;
pub mod operation;
pub mod transform;

pub use compose::compose;
pub use error::{OtError, OtResult};
pub use operation::{char_len, Operation};
pub use transform::{transform, Priority};

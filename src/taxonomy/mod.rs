//! # Process and Step Type Taxonomy
//!
//! Each process domain declares two closed enumerations: its process types and its step
//! types. The engine only needs to convert them to and from their persisted integer codes,
//! which is what [`TypeCode`] captures. The per-domain metadata (which step types a process
//! type executes, which step type retriggers which) lives in a [`StepTaxonomy`] built once by
//! explicit registration code.

mod step_taxonomy;

pub use step_taxonomy::{StepTaxonomy, StepTaxonomyBuilder};

use std::fmt;
use std::hash::Hash;

/// A closed enumeration persisted as a stable integer code.
///
/// Codes must never be renumbered once deployed.
pub trait TypeCode:
    Copy + Eq + Hash + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    fn code(self) -> i32;

    fn from_code(code: i32) -> Option<Self>;
}

/// Declares a `TypeCode` enumeration with stable codes and upper snake case display names.
///
/// ```
/// portal_processes::type_code_enum! {
///     /// Example step types
///     pub enum ExampleStepTypeId {
///         Fetch = 1 => "FETCH",
///         Store = 2 => "STORE",
///     }
/// }
///
/// use portal_processes::taxonomy::TypeCode;
/// assert_eq!(ExampleStepTypeId::from_code(2), Some(ExampleStepTypeId::Store));
/// assert_eq!(ExampleStepTypeId::Fetch.to_string(), "FETCH");
/// ```
#[macro_export]
macro_rules! type_code_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $code:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[ $( $name::$variant ),+ ];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $label ),+
                }
            }
        }

        impl $crate::taxonomy::TypeCode for $name {
            fn code(self) -> i32 {
                match self {
                    $( $name::$variant => $code ),+
                }
            }

            fn from_code(code: i32) -> Option<Self> {
                match code {
                    $( $code => Some($name::$variant), )+
                    _ => None,
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $label => Ok($name::$variant), )+
                    _ => Err(format!("Invalid {}: {s}", stringify!($name))),
                }
            }
        }
    };
}

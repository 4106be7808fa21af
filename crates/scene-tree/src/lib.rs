//! Immutable scene graph for a live app session.
//!
//! The tree is rebuilt, never mutated: every delta produces a new [`AppRoot`]
//! whose untouched subtrees are shared with the previous one. Nodes carry the
//! [`Generation`] of the run that last touched them so a finished run can
//! prune whatever it did not re-emit.
//!
//! ```
//! use scene_tree::{AppRoot, Delta, Element, Generation, MAIN};
//!
//! let root = AppRoot::empty(None);
//! let run = Generation::from("run-1");
//! let delta = Delta::NewElement(Element::Text { body: "hello".into() });
//! let next = root.apply_delta(&run, &delta, &[MAIN, 0]).unwrap();
//! assert_eq!(next.elements().len(), 1);
//! assert!(root.elements().is_empty());
//! ```

pub mod element;
pub mod error;
pub mod node;
pub mod root;

pub use element::{
    AlertFormat, Chart, Column, ColumnTable, Element, NamedDataSet, RowTable, Tabular,
};
pub use error::{TreeError, TreeResult};
pub use node::{
    AppNode, BlockLayout, BlockNode, BlockSpec, ElementMetadata, ElementNode, Generation,
};
pub use root::{AppRoot, Delta, MAIN, SIDEBAR};

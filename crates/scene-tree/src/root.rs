use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::element::{ColumnTable, Element, NamedDataSet, RowTable};
use crate::error::{TreeError, TreeResult};
use crate::node::{AppNode, BlockNode, BlockSpec, ElementMetadata, ElementNode, Generation};

pub const MAIN: usize = 0;
pub const SIDEBAR: usize = 1;

/// A single tree mutation addressed by a delta path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delta {
    NewElement(Element),
    AddBlock(BlockSpec),
    AddRows(NamedDataSet<RowTable>),
    ArrowAddRows(NamedDataSet<ColumnTable>),
}

impl Delta {
    pub fn label(&self) -> &'static str {
        match self {
            Delta::NewElement(_) => "new_element",
            Delta::AddBlock(_) => "add_block",
            Delta::AddRows(_) => "add_rows",
            Delta::ArrowAddRows(_) => "arrow_add_rows",
        }
    }
}

/// Immutable scene root: a block holding exactly the `main` and `sidebar`
/// containers. Every update returns a new root and leaves `self` untouched, so
/// `Arc::ptr_eq` on subtrees is a valid change check.
#[derive(Debug, Clone)]
pub struct AppRoot {
    root: Arc<AppNode>,
}

impl AppRoot {
    pub fn new(root: Arc<AppNode>) -> TreeResult<Self> {
        let block = root
            .as_block()
            .ok_or_else(|| TreeError::MalformedRoot("root must be a block".into()))?;
        if block.children().len() != 2 {
            return Err(TreeError::MalformedRoot(format!(
                "expected main and sidebar, found {} children",
                block.children().len()
            )));
        }
        for (name, child) in ["main", "sidebar"].iter().zip(block.children()) {
            if child.as_block().is_none() {
                return Err(TreeError::MalformedRoot(format!("{name} must be a block")));
            }
        }
        Ok(Self { root })
    }

    /// Empty root for a fresh session, optionally showing `placeholder` at the
    /// top of `main` until the first run replaces it.
    pub fn empty(placeholder: Option<Element>) -> Self {
        let generation = Generation::none();
        let main_children = placeholder
            .map(|element| {
                let metadata = ElementMetadata {
                    delta_path: vec![MAIN, 0],
                };
                Arc::new(AppNode::from(ElementNode::new(
                    element,
                    metadata,
                    generation.clone(),
                )))
            })
            .into_iter()
            .collect();
        let main = BlockNode::new(main_children, BlockSpec::default(), generation.clone());
        let sidebar = BlockNode::empty(BlockSpec::default(), generation.clone());
        Self::from_containers(main, sidebar, generation)
    }

    fn from_containers(main: BlockNode, sidebar: BlockNode, generation: Generation) -> Self {
        let root = BlockNode::new(
            vec![Arc::new(main.into()), Arc::new(sidebar.into())],
            BlockSpec::allowing_empty(),
            generation,
        );
        Self {
            root: Arc::new(root.into()),
        }
    }

    pub fn root(&self) -> &Arc<AppNode> {
        &self.root
    }

    pub fn main(&self) -> &BlockNode {
        self.container(MAIN)
    }

    pub fn sidebar(&self) -> &BlockNode {
        self.container(SIDEBAR)
    }

    fn container(&self, index: usize) -> &BlockNode {
        self.root
            .get_in(&[index])
            .and_then(|node| node.as_block())
            .expect("app root always holds main and sidebar blocks")
    }

    pub fn get_in(&self, path: &[usize]) -> Option<&Arc<AppNode>> {
        self.root.get_in(path)
    }

    pub fn elements(&self) -> Vec<Arc<Element>> {
        self.root.elements()
    }

    pub fn apply_delta(
        &self,
        generation: &Generation,
        delta: &Delta,
        delta_path: &[usize],
    ) -> TreeResult<Self> {
        if delta_path.len() < 2 {
            return Err(TreeError::InvalidDeltaPath(delta_path.to_vec()));
        }
        let container = delta_path[0];
        if container != MAIN && container != SIDEBAR {
            return Err(TreeError::UnknownContainer(container));
        }
        debug!(
            target = "scene_tree",
            delta = delta.label(),
            path = ?delta_path,
            generation = %generation,
            "applying delta"
        );

        match delta {
            Delta::NewElement(element) => {
                self.add_element(delta_path, generation, element.clone())
            }
            Delta::AddBlock(spec) => self.add_block(delta_path, generation, spec),
            Delta::AddRows(batch) => self.add_rows_or_report(delta_path, generation, |node| {
                node.add_rows(batch, generation)
            }),
            Delta::ArrowAddRows(batch) => {
                self.add_rows_or_report(delta_path, generation, |node| {
                    node.arrow_add_rows(batch, generation)
                })
            }
        }
    }

    /// Drops everything not touched by the run tagged `current`. `main` and
    /// `sidebar` are always kept, empty if nothing in them survived.
    pub fn clear_stale_nodes(&self, current: &Generation) -> Self {
        let keep = |index: usize| {
            self.container(index)
                .clear_stale_nodes(current)
                .unwrap_or_else(|| BlockNode::empty(BlockSpec::default(), current.clone()))
        };
        Self::from_containers(keep(MAIN), keep(SIDEBAR), current.clone())
    }

    fn add_element(
        &self,
        delta_path: &[usize],
        generation: &Generation,
        element: Element,
    ) -> TreeResult<Self> {
        let metadata = ElementMetadata {
            delta_path: delta_path.to_vec(),
        };
        let node = ElementNode::new(element, metadata, generation.clone());
        self.replace(delta_path, node.into(), generation)
    }

    fn add_block(
        &self,
        delta_path: &[usize],
        generation: &Generation,
        spec: &BlockSpec,
    ) -> TreeResult<Self> {
        // A re-declared block keeps its children; only its config and tag change.
        let children = self
            .root
            .get_in(delta_path)
            .and_then(|node| node.as_block())
            .map(|existing| existing.children().to_vec())
            .unwrap_or_default();
        let block = BlockNode::new(children, spec.clone(), generation.clone());
        self.replace(delta_path, block.into(), generation)
    }

    fn add_rows_or_report(
        &self,
        delta_path: &[usize],
        generation: &Generation,
        append: impl FnOnce(&ElementNode) -> TreeResult<ElementNode>,
    ) -> TreeResult<Self> {
        let existing = self
            .root
            .get_in(delta_path)
            .and_then(|node| node.as_element())
            .ok_or_else(|| TreeError::NoElementAtPath(delta_path.to_vec()))?;

        match append(existing) {
            Ok(node) => self.replace(delta_path, node.into(), generation),
            Err(err) => {
                warn!(
                    target = "scene_tree",
                    path = ?delta_path,
                    kind = existing.element().kind(),
                    error = %err,
                    "add_rows failed, replacing element with an error alert"
                );
                self.add_element(delta_path, generation, Element::error_alert(err.to_string()))
            }
        }
    }

    fn replace(
        &self,
        delta_path: &[usize],
        node: AppNode,
        generation: &Generation,
    ) -> TreeResult<Self> {
        let root = self.root.set_in(delta_path, Arc::new(node), generation)?;
        Ok(Self { root })
    }
}

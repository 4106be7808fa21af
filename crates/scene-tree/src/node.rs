use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::element::{ColumnTable, Element, NamedDataSet, RowTable};
use crate::error::{TreeError, TreeResult};

/// Identifies the run that produced or last touched a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Generation(Arc<str>);

impl Generation {
    pub const NONE: &'static str = "NO_SCRIPT_RUN_ID";

    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Tag for nodes that exist before any run has started.
    pub fn none() -> Self {
        Self::new(Self::NONE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Generation {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Generation {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockLayout {
    #[default]
    Vertical,
    Horizontal,
    Expandable {
        label: String,
        #[serde(default)]
        expanded: bool,
    },
    Form {
        form_id: String,
    },
}

/// Block-level configuration carried by an add-block delta.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSpec {
    /// Keeps the block alive through stale pruning even with no children.
    #[serde(default)]
    pub allow_empty: bool,
    #[serde(default)]
    pub layout: BlockLayout,
}

impl BlockSpec {
    pub fn allowing_empty() -> Self {
        Self {
            allow_empty: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementMetadata {
    pub delta_path: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct ElementNode {
    element: Arc<Element>,
    metadata: ElementMetadata,
    generation: Generation,
}

impl ElementNode {
    pub fn new(element: Element, metadata: ElementMetadata, generation: Generation) -> Self {
        Self {
            element: Arc::new(element),
            metadata,
            generation,
        }
    }

    pub fn element(&self) -> &Arc<Element> {
        &self.element
    }

    pub fn metadata(&self) -> &ElementMetadata {
        &self.metadata
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn add_rows(
        &self,
        batch: &NamedDataSet<RowTable>,
        generation: &Generation,
    ) -> TreeResult<Self> {
        let element = self.element.add_rows(batch)?;
        Ok(self.replaced(element, generation))
    }

    pub fn arrow_add_rows(
        &self,
        batch: &NamedDataSet<ColumnTable>,
        generation: &Generation,
    ) -> TreeResult<Self> {
        let element = self.element.arrow_add_rows(batch)?;
        Ok(self.replaced(element, generation))
    }

    fn replaced(&self, element: Element, generation: &Generation) -> Self {
        Self {
            element: Arc::new(element),
            metadata: self.metadata.clone(),
            generation: generation.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlockNode {
    children: Vec<Arc<AppNode>>,
    spec: BlockSpec,
    generation: Generation,
}

impl BlockNode {
    pub fn new(children: Vec<Arc<AppNode>>, spec: BlockSpec, generation: Generation) -> Self {
        Self {
            children,
            spec,
            generation,
        }
    }

    pub fn empty(spec: BlockSpec, generation: Generation) -> Self {
        Self::new(Vec::new(), spec, generation)
    }

    pub fn children(&self) -> &[Arc<AppNode>] {
        &self.children
    }

    pub fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn get_in(&self, path: &[usize]) -> Option<&Arc<AppNode>> {
        let (&index, rest) = path.split_first()?;
        let child = self.children.get(index)?;
        if rest.is_empty() {
            Some(child)
        } else {
            child.get_in(rest)
        }
    }

    /// Returns a copy of this block with `node` placed at `path`. Every block
    /// on the way down is reallocated and re-tagged with `generation`; all
    /// other children are shared with `self`.
    pub fn set_in(
        &self,
        path: &[usize],
        node: Arc<AppNode>,
        generation: &Generation,
    ) -> TreeResult<Self> {
        let (&index, rest) = path.split_first().ok_or(TreeError::EmptyPath)?;
        let len = self.children.len();
        if index > len {
            return Err(TreeError::IndexOutOfRange { index, len });
        }

        let replacement = if rest.is_empty() {
            node
        } else {
            let child = self
                .children
                .get(index)
                .ok_or(TreeError::MissingParent(index))?;
            child.set_in(rest, node, generation)?
        };

        let mut children = self.children.clone();
        if index == len {
            children.push(replacement);
        } else {
            children[index] = replacement;
        }

        Ok(Self {
            children,
            spec: self.spec.clone(),
            generation: generation.clone(),
        })
    }

    pub fn clear_stale_nodes(&self, current: &Generation) -> Option<Self> {
        if !self.spec.allow_empty && &self.generation != current {
            return None;
        }
        let children: Vec<_> = self
            .children
            .iter()
            .filter_map(|child| child.clear_stale_nodes(current))
            .collect();
        if children.is_empty() && !self.spec.allow_empty {
            return None;
        }
        Some(Self {
            children,
            spec: self.spec.clone(),
            generation: current.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub enum AppNode {
    Element(ElementNode),
    Block(BlockNode),
}

impl AppNode {
    pub fn generation(&self) -> &Generation {
        match self {
            AppNode::Element(node) => node.generation(),
            AppNode::Block(node) => node.generation(),
        }
    }

    pub fn as_element(&self) -> Option<&ElementNode> {
        match self {
            AppNode::Element(node) => Some(node),
            AppNode::Block(_) => None,
        }
    }

    pub fn as_block(&self) -> Option<&BlockNode> {
        match self {
            AppNode::Block(node) => Some(node),
            AppNode::Element(_) => None,
        }
    }

    pub fn get_in(&self, path: &[usize]) -> Option<&Arc<AppNode>> {
        match self {
            AppNode::Element(_) => None,
            AppNode::Block(block) => block.get_in(path),
        }
    }

    pub fn set_in(
        &self,
        path: &[usize],
        node: Arc<AppNode>,
        generation: &Generation,
    ) -> TreeResult<Arc<AppNode>> {
        match self {
            AppNode::Element(_) => Err(TreeError::SetInOnElement),
            AppNode::Block(block) => Ok(Arc::new(AppNode::Block(
                block.set_in(path, node, generation)?,
            ))),
        }
    }

    /// Drops every node not tagged with `current`. Surviving leaves are
    /// shared with the input tree.
    pub fn clear_stale_nodes(self: &Arc<Self>, current: &Generation) -> Option<Arc<AppNode>> {
        match self.as_ref() {
            AppNode::Element(node) => (node.generation() == current).then(|| Arc::clone(self)),
            AppNode::Block(block) => block
                .clear_stale_nodes(current)
                .map(|block| Arc::new(AppNode::Block(block))),
        }
    }

    /// Every leaf payload below this node, in tree order, each listed once.
    pub fn elements(&self) -> Vec<Arc<Element>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        self.collect_elements(&mut seen, &mut out);
        out
    }

    fn collect_elements(&self, seen: &mut HashSet<*const Element>, out: &mut Vec<Arc<Element>>) {
        match self {
            AppNode::Element(node) => {
                if seen.insert(Arc::as_ptr(node.element())) {
                    out.push(Arc::clone(node.element()));
                }
            }
            AppNode::Block(block) => {
                for child in block.children() {
                    child.collect_elements(seen, out);
                }
            }
        }
    }
}

impl From<ElementNode> for AppNode {
    fn from(node: ElementNode) -> Self {
        AppNode::Element(node)
    }
}

impl From<BlockNode> for AppNode {
    fn from(node: BlockNode) -> Self {
        AppNode::Block(node)
    }
}

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity of a block, unique within one document
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub String);

impl BlockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh random identity for a locally created block
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlockId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for BlockId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Closed set of block kinds; decides which renderer draws a block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Page,
    Text,
    Heading,
    List,
    Code,
}

impl BlockType {
    /// Whether blocks of this type may have a child list
    pub fn accepts_children(self) -> bool {
        !matches!(self, BlockType::Heading | BlockType::Code)
    }

    pub fn name(self) -> &'static str {
        match self {
            BlockType::Page => "page",
            BlockType::Text => "text",
            BlockType::Heading => "heading",
            BlockType::List => "list",
            BlockType::Code => "code",
        }
    }
}

/// One formatted run of text (an insert plus its inline attributes)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRun {
    pub insert: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl TextRun {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            insert: text.into(),
            attributes: BTreeMap::new(),
        }
    }
}

/// Type-specific payload of a block.
///
/// The core treats this as opaque apart from its length, which bounds
/// selection offsets.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockContent {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runs: Vec<TextRun>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl BlockContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            runs: vec![TextRun::plain(text)],
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Length in chars across all runs
    pub fn len(&self) -> usize {
        self.runs.iter().map(|run| run.insert.chars().count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn plain_text(&self) -> String {
        self.runs.iter().map(|run| run.insert.as_str()).collect()
    }
}

/// A single document node.
///
/// Relations are identities looked up in the owning [`crate::BlockChain`];
/// only the chain rewrites them.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub id: BlockId,
    pub block_type: BlockType,
    pub content: BlockContent,
    pub(crate) parent: Option<BlockId>,
    pub(crate) prev: Option<BlockId>,
    pub(crate) next: Option<BlockId>,
    pub(crate) first_child: Option<BlockId>,
}

impl Block {
    /// Create a detached block with no relations
    pub fn new(id: impl Into<BlockId>, block_type: BlockType, content: BlockContent) -> Self {
        Self {
            id: id.into(),
            block_type,
            content,
            parent: None,
            prev: None,
            next: None,
            first_child: None,
        }
    }

    pub fn parent(&self) -> Option<&BlockId> {
        self.parent.as_ref()
    }

    pub fn prev(&self) -> Option<&BlockId> {
        self.prev.as_ref()
    }

    pub fn next(&self) -> Option<&BlockId> {
        self.next.as_ref()
    }

    pub fn first_child(&self) -> Option<&BlockId> {
        self.first_child.as_ref()
    }

    pub fn has_children(&self) -> bool {
        self.first_child.is_some()
    }

    pub(crate) fn detach_links(&mut self) {
        self.parent = None;
        self.prev = None;
        self.next = None;
    }

    pub(crate) fn from_record(id: BlockId, record: BlockRecord) -> Self {
        Self {
            id,
            block_type: record.block_type,
            content: record.content,
            parent: record.parent,
            prev: None,
            next: record.next,
            first_child: record.first_child,
        }
    }

    pub(crate) fn to_record(&self) -> BlockRecord {
        BlockRecord {
            block_type: self.block_type,
            content: self.content.clone(),
            parent: self.parent.clone(),
            next: self.next.clone(),
            first_child: self.first_child.clone(),
        }
    }
}

/// Flat-map form of a block used to (re)load a whole document.
///
/// `prev` is not part of the record; it is derived from `next` links.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    #[serde(rename = "type")]
    pub block_type: BlockType,
    #[serde(default)]
    pub content: BlockContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<BlockId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<BlockId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_child: Option<BlockId>,
}

impl BlockRecord {
    pub fn new(block_type: BlockType) -> Self {
        Self {
            block_type,
            content: BlockContent::default(),
            parent: None,
            next: None,
            first_child: None,
        }
    }

    pub fn with_content(mut self, content: BlockContent) -> Self {
        self.content = content;
        self
    }

    pub fn with_parent(mut self, parent: impl Into<BlockId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_next(mut self, next: impl Into<BlockId>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_first_child(mut self, child: impl Into<BlockId>) -> Self {
        self.first_child = Some(child.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_length_counts_chars_across_runs() {
        let content = BlockContent {
            runs: vec![TextRun::plain("héllo"), TextRun::plain(" wörld")],
            attributes: BTreeMap::new(),
        };
        assert_eq!(content.len(), 11);
        assert_eq!(content.plain_text(), "héllo wörld");
    }

    #[test]
    fn headings_and_code_are_leaves() {
        assert!(!BlockType::Heading.accepts_children());
        assert!(!BlockType::Code.accepts_children());
        assert!(BlockType::Text.accepts_children());
        assert!(BlockType::Page.accepts_children());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(BlockId::generate(), BlockId::generate());
    }

    #[test]
    fn record_deserializes_with_defaults() {
        let record: BlockRecord = toml::from_str(
            r#"
type = "text"
parent = "root"
"#,
        )
        .unwrap();
        assert_eq!(record.block_type, BlockType::Text);
        assert_eq!(record.parent, Some(BlockId::from("root")));
        assert!(record.content.is_empty());
        assert_eq!(record.next, None);
    }
}

//! # Block Chain
//!
//! Canonical owning store for every [`Block`] of one document. Blocks live in
//! a single identity-keyed map; parent/sibling/child relations are identities
//! looked up in that map, so pointer surgery on insert/move/delete touches
//! only the handful of neighbours involved.
//!
//! Every successful mutation returns the [`ChangeEvent`] describing it. The
//! chain never calls out to dependents itself: the editor facade dispatches
//! the returned event so dependents can read the chain while reacting.

use std::collections::{HashMap, HashSet};

use crate::block::{Block, BlockContent, BlockId, BlockRecord, BlockType};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChainError {
    #[error("block {0} does not exist")]
    UnknownBlock(BlockId),
    #[error("parent block {0} does not exist")]
    MissingParent(BlockId),
    #[error("anchor block {0} does not exist")]
    MissingAnchor(BlockId),
    #[error("anchor block {anchor} is not a child of {parent}")]
    AnchorNotChild { anchor: BlockId, parent: BlockId },
    #[error("block {0} already exists")]
    DuplicateBlock(BlockId),
    #[error("{block_type:?} block {parent} cannot hold children")]
    ChildrenNotAllowed {
        parent: BlockId,
        block_type: BlockType,
    },
    #[error("the root block {0} cannot be moved or deleted")]
    RootImmovable(BlockId),
    #[error("cannot move {block} into its own subtree at {parent}")]
    CyclicMove { block: BlockId, parent: BlockId },
    #[error("{start}..{end} is not a run of siblings")]
    RangeNotSiblings { start: BlockId, end: BlockId },
    #[error("document root {0} is missing from the block map")]
    MissingRoot(BlockId),
    #[error("malformed document at block {block}: {reason}")]
    MalformedDocument { block: BlockId, reason: String },
}

/// Command tag carried by every change event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockCommand {
    Insert,
    Update,
    Move,
    Delete,
}

/// Description of one structural or content mutation
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Insert {
        block: BlockId,
        parent: BlockId,
    },
    Update {
        block: BlockId,
    },
    Move {
        block: BlockId,
        parent: BlockId,
        old_parent: Option<BlockId>,
        old_prev: Option<BlockId>,
    },
    /// Contiguous siblings `start..=end` moved together
    MoveRange {
        start: BlockId,
        end: BlockId,
        parent: BlockId,
        old_parent: Option<BlockId>,
        old_prev: Option<BlockId>,
    },
    Delete {
        block: BlockId,
        old_parent: Option<BlockId>,
        old_prev: Option<BlockId>,
        old_next: Option<BlockId>,
        /// Former children, now detached with `parent = None`
        orphaned: Vec<BlockId>,
    },
}

impl ChangeEvent {
    pub fn command(&self) -> BlockCommand {
        match self {
            ChangeEvent::Insert { .. } => BlockCommand::Insert,
            ChangeEvent::Update { .. } => BlockCommand::Update,
            ChangeEvent::Move { .. } | ChangeEvent::MoveRange { .. } => BlockCommand::Move,
            ChangeEvent::Delete { .. } => BlockCommand::Delete,
        }
    }

    /// The block most specific to this event (range moves report their start)
    pub fn block(&self) -> &BlockId {
        match self {
            ChangeEvent::Insert { block, .. }
            | ChangeEvent::Update { block }
            | ChangeEvent::Move { block, .. }
            | ChangeEvent::Delete { block, .. } => block,
            ChangeEvent::MoveRange { start, .. } => start,
        }
    }
}

/// Owning store of one document's blocks
#[derive(Debug, Default)]
pub struct BlockChain {
    doc_id: Option<BlockId>,
    root: Option<BlockId>,
    blocks: HashMap<BlockId, Block>,
    /// Identities removed since the last rebuild
    tombstones: HashSet<BlockId>,
}

impl BlockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn doc_id(&self) -> Option<&BlockId> {
        self.doc_id.as_ref()
    }

    pub fn root_id(&self) -> Option<&BlockId> {
        self.root.as_ref()
    }

    pub fn get_block(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.blocks.contains_key(id)
    }

    /// Whether `id` existed in this document and has since been deleted
    pub fn was_deleted(&self, id: &BlockId) -> bool {
        self.tombstones.contains(id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Iterate the child list of `id` in link order
    pub fn children<'a>(&'a self, id: &BlockId) -> Children<'a> {
        let next = self.blocks.get(id).and_then(|b| b.first_child.as_ref());
        Children { chain: self, next }
    }

    pub fn last_child(&self, id: &BlockId) -> Option<&Block> {
        self.children(id).last()
    }

    /// Whether `ancestor` is `id` itself or one of its ancestors
    pub fn is_ancestor(&self, ancestor: &BlockId, id: &BlockId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.blocks.get(current).and_then(|b| b.parent.as_ref());
        }
        false
    }

    /// Detached blocks left behind by deletes (no parent, not the root)
    pub fn orphans(&self) -> Vec<&BlockId> {
        let mut orphans: Vec<&BlockId> = self
            .blocks
            .values()
            .filter(|b| b.parent.is_none() && self.root.as_ref() != Some(&b.id))
            .map(|b| &b.id)
            .collect();
        orphans.sort();
        orphans
    }

    /// Pre-order walk from the root: parents before children, siblings in link order
    pub fn traverse(&self, visit: impl FnMut(&Block)) {
        if let Some(root) = self.root.clone() {
            self.traverse_from(&root, visit);
        }
    }

    pub fn traverse_from(&self, start: &BlockId, mut visit: impl FnMut(&Block)) {
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let Some(block) = self.blocks.get(id) else {
                continue;
            };
            visit(block);
            let first = stack.len();
            stack.extend(self.children(id).map(|child| &child.id));
            stack[first..].reverse();
        }
    }

    /// Replace the whole document. Prior contents survive if `data` is rejected.
    pub fn rebuild(
        &mut self,
        doc_id: impl Into<BlockId>,
        data: HashMap<BlockId, BlockRecord>,
    ) -> Result<(), ChainError> {
        let doc_id = doc_id.into();
        let mut blocks: HashMap<BlockId, Block> = data
            .into_iter()
            .map(|(id, record)| (id.clone(), Block::from_record(id, record)))
            .collect();

        validate_document(&doc_id, &mut blocks)?;

        log::info!("rebuilt document {} with {} blocks", doc_id, blocks.len());
        self.root = Some(doc_id.clone());
        self.doc_id = Some(doc_id);
        self.blocks = blocks;
        self.tombstones.clear();
        Ok(())
    }

    /// Inverse of [`BlockChain::rebuild`].
    ///
    /// Only blocks reachable from the root are exported; detached subtrees
    /// left by deletes are dropped.
    pub fn to_records(&self) -> HashMap<BlockId, BlockRecord> {
        let mut records = HashMap::new();
        self.traverse(|block| {
            records.insert(block.id.clone(), block.to_record());
        });
        records
    }

    pub fn destroy(&mut self) {
        self.blocks.clear();
        self.tombstones.clear();
        self.root = None;
        self.doc_id = None;
    }

    /// Insert a new block under `parent`, after `after` (or first when `None`)
    pub fn insert(
        &mut self,
        mut block: Block,
        parent: &BlockId,
        after: Option<&BlockId>,
    ) -> Result<ChangeEvent, ChainError> {
        if self.blocks.contains_key(&block.id) {
            return Err(ChainError::DuplicateBlock(block.id));
        }
        self.check_parent(parent)?;
        if let Some(after) = after {
            self.check_anchor(after, parent)?;
        }

        let id = block.id.clone();
        block.detach_links();
        block.first_child = None;
        self.blocks.insert(id.clone(), block);
        self.link(&id, parent, after);

        Ok(ChangeEvent::Insert {
            block: id,
            parent: parent.clone(),
        })
    }

    pub fn update(
        &mut self,
        id: &BlockId,
        content: BlockContent,
    ) -> Result<ChangeEvent, ChainError> {
        let block = self
            .blocks
            .get_mut(id)
            .ok_or_else(|| ChainError::UnknownBlock(id.clone()))?;
        block.content = content;
        Ok(ChangeEvent::Update { block: id.clone() })
    }

    /// Change a block's type; leaf types are refused while children remain
    pub fn retype(
        &mut self,
        id: &BlockId,
        block_type: BlockType,
    ) -> Result<ChangeEvent, ChainError> {
        let block = self
            .blocks
            .get_mut(id)
            .ok_or_else(|| ChainError::UnknownBlock(id.clone()))?;
        if block.has_children() && !block_type.accepts_children() {
            return Err(ChainError::ChildrenNotAllowed {
                parent: id.clone(),
                block_type,
            });
        }
        block.block_type = block_type;
        Ok(ChangeEvent::Update { block: id.clone() })
    }

    /// Relocate `id` (with its subtree) under `parent`, after `after`
    pub fn move_block(
        &mut self,
        id: &BlockId,
        parent: &BlockId,
        after: Option<&BlockId>,
    ) -> Result<ChangeEvent, ChainError> {
        self.check_movable(id)?;
        self.check_parent(parent)?;
        if self.is_ancestor(id, parent) {
            return Err(ChainError::CyclicMove {
                block: id.clone(),
                parent: parent.clone(),
            });
        }
        if let Some(after) = after {
            if after == id {
                return Err(ChainError::AnchorNotChild {
                    anchor: after.clone(),
                    parent: parent.clone(),
                });
            }
            self.check_anchor(after, parent)?;
        }

        let (old_parent, old_prev) = {
            let block = &self.blocks[id];
            (block.parent.clone(), block.prev.clone())
        };
        self.unlink(id);
        self.link(id, parent, after);

        Ok(ChangeEvent::Move {
            block: id.clone(),
            parent: parent.clone(),
            old_parent,
            old_prev,
        })
    }

    /// Relocate the contiguous sibling run `start..=end` as one unit
    pub fn move_range(
        &mut self,
        start: &BlockId,
        end: &BlockId,
        parent: &BlockId,
        after: Option<&BlockId>,
    ) -> Result<ChangeEvent, ChainError> {
        self.check_movable(start)?;
        self.check_movable(end)?;
        self.check_parent(parent)?;
        let run = self.sibling_run(start, end)?;
        for member in &run {
            if self.is_ancestor(member, parent) {
                return Err(ChainError::CyclicMove {
                    block: member.clone(),
                    parent: parent.clone(),
                });
            }
        }
        if let Some(after) = after {
            if run.contains(after) {
                return Err(ChainError::AnchorNotChild {
                    anchor: after.clone(),
                    parent: parent.clone(),
                });
            }
            self.check_anchor(after, parent)?;
        }

        let (old_parent, old_prev, old_next) = {
            let first = &self.blocks[start];
            let last = &self.blocks[end];
            (first.parent.clone(), first.prev.clone(), last.next.clone())
        };

        // Close the gap left behind
        match &old_prev {
            Some(prev) => self.edit(prev, |b| b.next = old_next.clone()),
            None => {
                if let Some(p) = &old_parent {
                    self.edit(p, |b| b.first_child = old_next.clone());
                }
            }
        }
        if let Some(next) = &old_next {
            self.edit(next, |b| b.prev = old_prev.clone());
        }

        // Splice the run in at its destination
        let new_next = match after {
            Some(a) => self.blocks[a].next.clone(),
            None => self.blocks[parent].first_child.clone(),
        };
        for member in &run {
            self.edit(member, |b| b.parent = Some(parent.clone()));
        }
        self.edit(start, |b| b.prev = after.cloned());
        self.edit(end, |b| b.next = new_next.clone());
        match after {
            Some(a) => self.edit(a, |b| b.next = Some(start.clone())),
            None => self.edit(parent, |b| b.first_child = Some(start.clone())),
        }
        if let Some(next) = &new_next {
            self.edit(next, |b| b.prev = Some(end.clone()));
        }

        Ok(ChangeEvent::MoveRange {
            start: start.clone(),
            end: end.clone(),
            parent: parent.clone(),
            old_parent,
            old_prev,
        })
    }

    /// Remove one block. Its children are orphaned, not deleted.
    pub fn delete(&mut self, id: &BlockId) -> Result<ChangeEvent, ChainError> {
        self.check_movable(id)?;

        let (old_parent, old_prev, old_next) = {
            let block = &self.blocks[id];
            (block.parent.clone(), block.prev.clone(), block.next.clone())
        };
        let orphaned: Vec<BlockId> = self.children(id).map(|c| c.id.clone()).collect();
        for child in &orphaned {
            self.edit(child, |b| b.parent = None);
        }
        self.unlink(id);
        self.blocks.remove(id);
        self.tombstones.insert(id.clone());

        Ok(ChangeEvent::Delete {
            block: id.clone(),
            old_parent,
            old_prev,
            old_next,
            orphaned,
        })
    }

    /// Rewrite relations of an already validated block
    fn edit(&mut self, id: &BlockId, f: impl FnOnce(&mut Block)) {
        if let Some(block) = self.blocks.get_mut(id) {
            f(block);
        }
    }

    fn check_parent(&self, parent: &BlockId) -> Result<(), ChainError> {
        let block = self
            .blocks
            .get(parent)
            .ok_or_else(|| ChainError::MissingParent(parent.clone()))?;
        if !block.block_type.accepts_children() {
            return Err(ChainError::ChildrenNotAllowed {
                parent: parent.clone(),
                block_type: block.block_type,
            });
        }
        Ok(())
    }

    fn check_anchor(&self, anchor: &BlockId, parent: &BlockId) -> Result<(), ChainError> {
        let block = self
            .blocks
            .get(anchor)
            .ok_or_else(|| ChainError::MissingAnchor(anchor.clone()))?;
        if block.parent.as_ref() != Some(parent) {
            return Err(ChainError::AnchorNotChild {
                anchor: anchor.clone(),
                parent: parent.clone(),
            });
        }
        Ok(())
    }

    fn check_movable(&self, id: &BlockId) -> Result<(), ChainError> {
        if !self.blocks.contains_key(id) {
            return Err(ChainError::UnknownBlock(id.clone()));
        }
        if self.root.as_ref() == Some(id) {
            return Err(ChainError::RootImmovable(id.clone()));
        }
        Ok(())
    }

    fn sibling_run(&self, start: &BlockId, end: &BlockId) -> Result<Vec<BlockId>, ChainError> {
        let mut run = Vec::new();
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            run.push(id.clone());
            if id == end {
                return Ok(run);
            }
            cursor = self.blocks.get(id).and_then(|b| b.next.as_ref());
        }
        Err(ChainError::RangeNotSiblings {
            start: start.clone(),
            end: end.clone(),
        })
    }

    /// Splice a detached block into `parent`'s child list after `after`
    fn link(&mut self, id: &BlockId, parent: &BlockId, after: Option<&BlockId>) {
        let next = match after {
            Some(a) => self.blocks[a].next.clone(),
            None => self.blocks[parent].first_child.clone(),
        };
        self.edit(id, |block| {
            block.parent = Some(parent.clone());
            block.prev = after.cloned();
            block.next = next.clone();
        });
        match after {
            Some(a) => self.edit(a, |b| b.next = Some(id.clone())),
            None => self.edit(parent, |b| b.first_child = Some(id.clone())),
        }
        if let Some(next) = next {
            self.edit(&next, |b| b.prev = Some(id.clone()));
        }
    }

    /// Detach a block from whichever sibling list holds it
    fn unlink(&mut self, id: &BlockId) {
        let (parent, prev, next) = {
            let block = &self.blocks[id];
            (block.parent.clone(), block.prev.clone(), block.next.clone())
        };
        match &prev {
            Some(prev) => self.edit(prev, |b| b.next = next.clone()),
            None => {
                if let Some(parent) = &parent {
                    self.edit(parent, |b| b.first_child = next.clone());
                }
            }
        }
        if let Some(next) = &next {
            self.edit(next, |b| b.prev = prev.clone());
        }
        self.edit(id, Block::detach_links);
    }
}

/// Iterator over one child list, following `next` links
pub struct Children<'a> {
    chain: &'a BlockChain,
    next: Option<&'a BlockId>,
}

impl<'a> Iterator for Children<'a> {
    type Item = &'a Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.chain.blocks.get(self.next?)?;
        self.next = block.next.as_ref();
        Some(block)
    }
}

/// Check a freshly loaded block map and derive `prev` links.
///
/// Walks child lists from the root with a visited set, so cycles and blocks
/// claimed by two lists are caught instead of looping.
fn validate_document(
    doc_id: &BlockId,
    blocks: &mut HashMap<BlockId, Block>,
) -> Result<(), ChainError> {
    let malformed = |block: &BlockId, reason: String| ChainError::MalformedDocument {
        block: block.clone(),
        reason,
    };

    let root = blocks
        .get(doc_id)
        .ok_or_else(|| ChainError::MissingRoot(doc_id.clone()))?;
    if let Some(parent) = &root.parent {
        return Err(malformed(doc_id, format!("root has parent {parent}")));
    }
    if root.next.is_some() {
        return Err(malformed(doc_id, "root has a sibling".to_string()));
    }

    for block in blocks.values() {
        for (relation, target) in [
            ("parent", &block.parent),
            ("next", &block.next),
            ("first_child", &block.first_child),
        ] {
            if let Some(target) = target
                && !blocks.contains_key(target)
            {
                return Err(malformed(
                    &block.id,
                    format!("{relation} refers to missing block {target}"),
                ));
            }
        }
    }

    let mut visited: HashSet<BlockId> = HashSet::new();
    let mut prev_links: Vec<(BlockId, Option<BlockId>)> = Vec::new();
    let mut pending = vec![doc_id.clone()];
    visited.insert(doc_id.clone());

    while let Some(parent_id) = pending.pop() {
        let parent = &blocks[&parent_id];
        if parent.first_child.is_some() && !parent.block_type.accepts_children() {
            return Err(ChainError::ChildrenNotAllowed {
                parent: parent_id.clone(),
                block_type: parent.block_type,
            });
        }

        let mut prev: Option<BlockId> = None;
        let mut cursor = parent.first_child.clone();
        while let Some(child_id) = cursor {
            if !visited.insert(child_id.clone()) {
                return Err(malformed(
                    &child_id,
                    "reached twice (cycle or multiple parents)".to_string(),
                ));
            }
            let child = &blocks[&child_id];
            if child.parent.as_ref() != Some(&parent_id) {
                return Err(malformed(
                    &child_id,
                    format!("linked under {parent_id} but parent is {:?}", child.parent),
                ));
            }
            prev_links.push((child_id.clone(), prev.take()));
            pending.push(child_id.clone());
            cursor = child.next.clone();
            prev = Some(child_id);
        }
    }

    if let Some(stray) = blocks.keys().find(|id| !visited.contains(*id)) {
        return Err(malformed(stray, "not reachable from the root".to_string()));
    }

    for (id, prev) in prev_links {
        if let Some(block) = blocks.get_mut(&id) {
            block.prev = prev;
        }
    }
    Ok(())
}

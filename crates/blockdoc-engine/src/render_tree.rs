//! # Render Tree
//!
//! A cached projection of the [`BlockChain`] shaped for rendering. Each
//! [`TreeNode`] mirrors one block's child list and carries the render
//! trigger registered by whichever presentation component draws it.
//!
//! The cache is never ground truth: a node's children are always re-derived
//! from the chain's `first_child`/`next` links when the node is rebuilt, so
//! re-rendering a parent is enough to reflect any change to its child list.

use std::collections::HashMap;
use std::fmt::Write;

use crate::block::{BlockId, BlockType};
use crate::chain::{BlockChain, ChangeEvent};
use crate::position::{BlockElement, ObserverHandle, PositionManager, Rect};

type RenderTrigger = Box<dyn FnMut()>;

/// Cached render-side view of one block
pub struct TreeNode {
    pub id: BlockId,
    pub block_type: BlockType,
    /// Weak back-reference, resolved through the tree's cache
    pub parent: Option<BlockId>,
    pub children: Vec<BlockId>,
    /// Incremented on every re-render
    pub version: u64,
    trigger: Option<RenderTrigger>,
}

impl TreeNode {
    fn new(id: BlockId, block_type: BlockType) -> Self {
        Self {
            id,
            block_type,
            parent: None,
            children: Vec::new(),
            version: 0,
            trigger: None,
        }
    }

    /// Register the hook a presentation component uses to repaint this node
    pub fn register_update(&mut self, trigger: impl FnMut() + 'static) {
        self.trigger = Some(Box::new(trigger));
    }

    pub fn unregister_update(&mut self) {
        self.trigger = None;
    }

    pub fn has_trigger(&self) -> bool {
        self.trigger.is_some()
    }

    fn fire(&mut self) {
        self.version += 1;
        if let Some(trigger) = self.trigger.as_mut() {
            trigger();
        }
    }
}

/// One row of the flattened outline, in pre-order
#[derive(Debug, Clone, PartialEq)]
pub struct OutlineRow {
    pub id: BlockId,
    pub block_type: BlockType,
    pub depth: usize,
}

pub struct RenderTree {
    map: HashMap<BlockId, TreeNode>,
    root: Option<BlockId>,
    positions: PositionManager,
}

impl Default for RenderTree {
    fn default() -> Self {
        Self::new(PositionManager::default())
    }
}

impl RenderTree {
    pub fn new(positions: PositionManager) -> Self {
        Self {
            map: HashMap::new(),
            root: None,
            positions,
        }
    }

    pub fn root(&self) -> Option<&TreeNode> {
        self.root.as_ref().and_then(|id| self.map.get(id))
    }

    pub fn get_tree_node(&self, id: &BlockId) -> Option<&TreeNode> {
        self.map.get(id)
    }

    pub fn get_tree_node_mut(&mut self, id: &BlockId) -> Option<&mut TreeNode> {
        self.map.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    /// Full rebuild of the cache in one pre-order traversal
    pub fn build_deep(&mut self, chain: &BlockChain, root_id: &BlockId) -> Option<&TreeNode> {
        self.map.clear();
        self.root = Some(root_id.clone());

        chain.traverse_from(root_id, |block| {
            let mut node = TreeNode::new(block.id.clone(), block.block_type);
            node.parent = if block.id == *root_id {
                None
            } else {
                block.parent().cloned()
            };
            node.children = chain.children(&block.id).map(|c| c.id.clone()).collect();
            self.map.insert(block.id.clone(), node);
        });

        self.map.get(root_id)
    }

    /// Re-derive one node's child list from the chain, reusing cached children
    pub fn rebuild(&mut self, chain: &BlockChain, node_id: &BlockId) -> Option<&TreeNode> {
        let block = chain.get_block(node_id)?;
        let block_type = block.block_type;
        let parent = block.parent().cloned();

        let children: Vec<BlockId> = chain.children(node_id).map(|c| c.id.clone()).collect();
        for child in &children {
            match self.map.get_mut(child) {
                Some(node) => {
                    node.parent = Some(node_id.clone());
                    if let Some(current) = chain.get_block(child) {
                        node.block_type = current.block_type;
                    }
                }
                None => self.create_subtree(chain, child),
            }
        }

        let stale: Vec<BlockId> = match self.map.get(node_id) {
            Some(node) => node
                .children
                .iter()
                .filter(|old| !chain.contains(old))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        for gone in &stale {
            self.evict(gone);
        }

        let node = self
            .map
            .entry(node_id.clone())
            .or_insert_with(|| TreeNode::new(node_id.clone(), block_type));
        node.block_type = block_type;
        node.children = children;
        if self.root.as_ref() != Some(node_id) {
            node.parent = parent;
        }
        Some(&*node)
    }

    /// Rebuild then fire the node's render trigger
    pub fn re_render(&mut self, chain: &BlockChain, node_id: &BlockId) {
        if self.rebuild(chain, node_id).is_some()
            && let Some(node) = self.map.get_mut(node_id)
        {
            node.fire();
        }
    }

    /// Incremental update driven by one chain event
    pub fn on_block_change(&mut self, chain: &BlockChain, event: &ChangeEvent) {
        log::debug!("render tree reacting to {:?}", event.command());
        let mut targets: Vec<&BlockId> = Vec::new();
        let invalidate: Option<&BlockId> = match event {
            ChangeEvent::Insert { block, parent } => {
                targets.push(parent);
                Some(block)
            }
            ChangeEvent::Update { block } => {
                targets.push(block);
                Some(block)
            }
            ChangeEvent::Move {
                block,
                parent,
                old_parent,
                ..
            } => {
                targets.extend(old_parent.iter());
                targets.push(parent);
                Some(block)
            }
            ChangeEvent::MoveRange {
                start,
                parent,
                old_parent,
                ..
            } => {
                targets.extend(old_parent.iter());
                targets.push(parent);
                Some(start)
            }
            ChangeEvent::Delete {
                block,
                old_parent,
                old_prev,
                orphaned,
                ..
            } => {
                self.evict(block);
                // Detached subtrees are unreachable until re-homed
                for orphan in orphaned {
                    self.evict_subtree(orphan);
                }
                targets.extend(old_parent.iter());
                old_parent.as_ref().or(old_prev.as_ref())
            }
        };

        targets.dedup();
        for target in targets {
            // Uncached parents sit under a detached subtree
            if self.map.contains_key(target) {
                self.re_render(chain, target);
            }
        }

        match event {
            ChangeEvent::Move { block, parent, .. } if !self.map.contains_key(parent) => {
                self.evict_subtree(block);
            }
            ChangeEvent::MoveRange {
                start, end, parent, ..
            } if !self.map.contains_key(parent) => {
                let mut run = Vec::new();
                let mut cursor = chain.get_block(start);
                while let Some(block) = cursor {
                    run.push(block.id.clone());
                    if block.id == *end {
                        break;
                    }
                    cursor = block.next().and_then(|next| chain.get_block(next));
                }
                for member in &run {
                    self.evict_subtree(member);
                }
            }
            _ => {}
        }

        if let Some(id) = invalidate {
            self.positions.update_block(id);
        }
    }

    pub fn observe_node(
        &self,
        id: &BlockId,
        element: Option<Box<dyn BlockElement>>,
    ) -> Option<ObserverHandle> {
        if !self.map.contains_key(id) {
            return None;
        }
        Some(self.positions.observe(id.clone(), element))
    }

    pub fn update_block_position(&self, id: &BlockId) {
        if self.map.contains_key(id) {
            self.positions.update_block(id);
        }
    }

    pub fn update_viewport_blocks(&self) {
        self.positions.update_viewport_blocks();
    }

    pub fn block_position(&self, id: &BlockId) -> Option<Rect> {
        self.positions.get_block_position(id)
    }

    /// Pre-order rows with nesting depth, for list-style presentation
    pub fn flatten(&self) -> Vec<OutlineRow> {
        let mut rows = Vec::new();
        let Some(root) = self.root.as_ref() else {
            return rows;
        };
        let mut stack = vec![(root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let Some(node) = self.map.get(id) else {
                continue;
            };
            rows.push(OutlineRow {
                id: node.id.clone(),
                block_type: node.block_type,
                depth,
            });
            stack.extend(node.children.iter().rev().map(|child| (child, depth + 1)));
        }
        rows
    }

    /// Indented text rendering of the cached tree
    pub fn format_outline(&self, chain: &BlockChain) -> String {
        let mut out = String::new();
        for row in self.flatten() {
            let text = chain
                .get_block(&row.id)
                .map(|b| b.content.plain_text())
                .unwrap_or_default();
            let _ = write!(out, "{}{} {}", "  ".repeat(row.depth), row.block_type.name(), row.id);
            if !text.is_empty() {
                let _ = write!(out, " {text:?}");
            }
            out.push('\n');
        }
        out
    }

    pub fn destroy(&mut self) {
        self.map.clear();
        self.root = None;
        self.positions.destroy();
    }

    /// First touch of a block: derive its node and every descendant's
    fn create_subtree(&mut self, chain: &BlockChain, id: &BlockId) {
        chain.traverse_from(id, |block| {
            if self.map.contains_key(&block.id) {
                return;
            }
            let mut node = TreeNode::new(block.id.clone(), block.block_type);
            node.parent = block.parent().cloned();
            node.children = chain.children(&block.id).map(|c| c.id.clone()).collect();
            self.map.insert(block.id.clone(), node);
        });
    }

    fn evict(&mut self, id: &BlockId) {
        if self.map.remove(id).is_some() {
            self.positions.forget(id);
        }
    }

    fn evict_subtree(&mut self, id: &BlockId) {
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.map.remove(&current) {
                self.positions.forget(&current);
                stack.extend(node.children);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, BlockContent, BlockRecord};
    use pretty_assertions::assert_eq;
    use std::cell::Cell;
    use std::rc::Rc;

    fn id(s: &str) -> BlockId {
        BlockId::from(s)
    }

    fn text(s: &str) -> Block {
        Block::new(s, BlockType::Text, BlockContent::text(s))
    }

    fn chain_rabc() -> BlockChain {
        let mut data = std::collections::HashMap::new();
        data.insert(id("R"), BlockRecord::new(BlockType::Page).with_first_child("A"));
        data.insert(id("A"), BlockRecord::new(BlockType::Text).with_parent("R").with_next("B"));
        data.insert(id("B"), BlockRecord::new(BlockType::Text).with_parent("R").with_next("C"));
        data.insert(id("C"), BlockRecord::new(BlockType::Text).with_parent("R"));
        let mut chain = BlockChain::new();
        chain.rebuild("R", data).unwrap();
        chain
    }

    fn children_of(tree: &RenderTree, node: &str) -> Vec<String> {
        tree.get_tree_node(&id(node))
            .unwrap()
            .children
            .iter()
            .map(|c| c.0.clone())
            .collect()
    }

    /// Render counter wired to a node's trigger
    fn count_renders(tree: &mut RenderTree, node: &str) -> Rc<Cell<u32>> {
        let count = Rc::new(Cell::new(0));
        let hook = count.clone();
        tree.get_tree_node_mut(&id(node))
            .unwrap()
            .register_update(move || hook.set(hook.get() + 1));
        count
    }

    #[test]
    fn build_deep_mirrors_chain() {
        let mut chain = chain_rabc();
        chain.insert(text("A1"), &id("A"), None).unwrap();
        let mut tree = RenderTree::default();
        let root = tree.build_deep(&chain, &id("R")).unwrap();
        assert_eq!(root.children, vec![id("A"), id("B"), id("C")]);
        assert_eq!(children_of(&tree, "A"), vec!["A1"]);
        assert_eq!(tree.get_tree_node(&id("A1")).unwrap().parent, Some(id("A")));
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn move_rerenders_old_and_new_parent() {
        let mut chain = chain_rabc();
        let mut tree = RenderTree::default();
        tree.build_deep(&chain, &id("R"));
        let root_renders = count_renders(&mut tree, "R");
        let a_renders = count_renders(&mut tree, "A");

        let event = chain.move_block(&id("C"), &id("A"), None).unwrap();
        tree.on_block_change(&chain, &event);

        assert_eq!(children_of(&tree, "R"), vec!["A", "B"]);
        assert_eq!(children_of(&tree, "A"), vec!["C"]);
        assert_eq!(tree.get_tree_node(&id("C")).unwrap().parent, Some(id("A")));
        assert_eq!(root_renders.get(), 1);
        assert_eq!(a_renders.get(), 1);
    }

    #[test]
    fn reorder_within_parent_renders_once() {
        let mut chain = chain_rabc();
        let mut tree = RenderTree::default();
        tree.build_deep(&chain, &id("R"));
        let root_renders = count_renders(&mut tree, "R");

        let event = chain.move_block(&id("C"), &id("R"), Some(&id("A"))).unwrap();
        tree.on_block_change(&chain, &event);

        assert_eq!(children_of(&tree, "R"), vec!["A", "C", "B"]);
        assert_eq!(root_renders.get(), 1);
    }

    #[test]
    fn update_rerenders_only_the_block() {
        let mut chain = chain_rabc();
        let mut tree = RenderTree::default();
        tree.build_deep(&chain, &id("R"));
        let root_renders = count_renders(&mut tree, "R");
        let b_renders = count_renders(&mut tree, "B");

        let event = chain.update(&id("B"), BlockContent::text("new")).unwrap();
        tree.on_block_change(&chain, &event);

        assert_eq!(root_renders.get(), 0);
        assert_eq!(b_renders.get(), 1);
        assert_eq!(tree.get_tree_node(&id("B")).unwrap().version, 1);
    }

    #[test]
    fn reused_nodes_keep_their_triggers() {
        let mut chain = chain_rabc();
        let mut tree = RenderTree::default();
        tree.build_deep(&chain, &id("R"));
        let c_renders = count_renders(&mut tree, "C");

        let event = chain.move_block(&id("C"), &id("A"), None).unwrap();
        tree.on_block_change(&chain, &event);
        let event = chain.update(&id("C"), BlockContent::text("x")).unwrap();
        tree.on_block_change(&chain, &event);

        assert!(tree.get_tree_node(&id("C")).unwrap().has_trigger());
        assert_eq!(c_renders.get(), 1);
    }

    #[test]
    fn delete_evicts_node_and_rerenders_parent() {
        let mut chain = chain_rabc();
        let mut tree = RenderTree::default();
        tree.build_deep(&chain, &id("R"));
        let root_renders = count_renders(&mut tree, "R");

        let event = chain.delete(&id("B")).unwrap();
        tree.on_block_change(&chain, &event);

        assert!(tree.get_tree_node(&id("B")).is_none());
        assert_eq!(children_of(&tree, "R"), vec!["A", "C"]);
        assert_eq!(root_renders.get(), 1);
    }

    #[test]
    fn delete_evicts_orphaned_subtrees() {
        let mut chain = chain_rabc();
        chain.insert(text("B1"), &id("B"), None).unwrap();
        chain.insert(text("B1a"), &id("B1"), None).unwrap();
        let mut tree = RenderTree::default();
        tree.build_deep(&chain, &id("R"));
        let _b1_observer = tree.observe_node(&id("B1"), None).unwrap();
        tree.positions().report(&id("B1"), Rect::new(0.0, 1.0, 10.0, 1.0));

        let event = chain.delete(&id("B")).unwrap();
        tree.on_block_change(&chain, &event);

        let mut full = RenderTree::default();
        full.build_deep(&chain, &id("R"));
        assert_eq!(tree.len(), full.len());
        assert!(tree.get_tree_node(&id("B1")).is_none());
        assert!(tree.get_tree_node(&id("B1a")).is_none());
        assert_eq!(tree.block_position(&id("B1")), None);

        let event = chain.move_block(&id("B1"), &id("A"), None).unwrap();
        tree.on_block_change(&chain, &event);
        assert_eq!(children_of(&tree, "B1"), vec!["B1a"]);
        assert_eq!(tree.get_tree_node(&id("B1")).unwrap().parent, Some(id("A")));
    }

    #[test]
    fn edits_under_detached_blocks_stay_out_of_the_cache() {
        let mut chain = chain_rabc();
        chain.insert(text("B1"), &id("B"), None).unwrap();
        let mut tree = RenderTree::default();
        tree.build_deep(&chain, &id("R"));
        let event = chain.delete(&id("B")).unwrap();
        tree.on_block_change(&chain, &event);

        let event = chain.insert(text("B1a"), &id("B1"), None).unwrap();
        tree.on_block_change(&chain, &event);
        let event = chain.move_block(&id("C"), &id("B1"), None).unwrap();
        tree.on_block_change(&chain, &event);

        assert!(tree.get_tree_node(&id("B1a")).is_none());
        assert!(tree.get_tree_node(&id("C")).is_none());
        assert_eq!(children_of(&tree, "R"), vec!["A"]);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn moved_in_orphan_brings_its_subtree() {
        let mut chain = chain_rabc();
        chain.insert(text("B1"), &id("B"), None).unwrap();
        chain.insert(text("B1a"), &id("B1"), None).unwrap();
        chain.delete(&id("B")).unwrap();

        let mut tree = RenderTree::default();
        tree.build_deep(&chain, &id("R"));
        assert!(tree.get_tree_node(&id("B1")).is_none());

        let event = chain.move_block(&id("B1"), &id("C"), None).unwrap();
        tree.on_block_change(&chain, &event);
        assert_eq!(children_of(&tree, "C"), vec!["B1"]);
        assert_eq!(children_of(&tree, "B1"), vec!["B1a"]);
    }

    #[test]
    fn flatten_reports_depths() {
        let mut chain = chain_rabc();
        chain.insert(text("A1"), &id("A"), None).unwrap();
        let mut tree = RenderTree::default();
        tree.build_deep(&chain, &id("R"));
        let rows: Vec<(String, usize)> = tree
            .flatten()
            .into_iter()
            .map(|row| (row.id.0, row.depth))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("R".to_string(), 0),
                ("A".to_string(), 1),
                ("A1".to_string(), 2),
                ("B".to_string(), 1),
                ("C".to_string(), 1),
            ]
        );
    }

    #[test]
    fn format_outline_snapshot() {
        let mut chain = chain_rabc();
        chain.insert(text("A1"), &id("A"), None).unwrap();
        chain.update(&id("B"), BlockContent::text("bee")).unwrap();
        let mut tree = RenderTree::default();
        tree.build_deep(&chain, &id("R"));
        insta::assert_snapshot!(tree.format_outline(&chain).trim_end(), @r#"
        page R
          text A
            text A1 "A1"
          text B "bee"
          text C
        "#);
    }

    #[test]
    fn position_of_moved_block_is_refreshed() {
        struct Fixed(Rect);
        impl BlockElement for Fixed {
            fn measure(&self) -> Option<Rect> {
                Some(self.0)
            }
        }

        let mut chain = chain_rabc();
        let mut tree = RenderTree::default();
        tree.build_deep(&chain, &id("R"));
        let _handle = tree
            .observe_node(&id("C"), Some(Box::new(Fixed(Rect::new(0.0, 5.0, 10.0, 1.0)))))
            .unwrap();
        tree.positions().report(&id("C"), Rect::new(0.0, 2.0, 10.0, 1.0));
        assert_eq!(tree.block_position(&id("C")).unwrap().y, 2.0);

        let event = chain.move_block(&id("C"), &id("R"), None).unwrap();
        tree.on_block_change(&chain, &event);
        assert_eq!(tree.block_position(&id("C")).unwrap().y, 5.0);
    }

    #[test]
    fn observing_unknown_node_is_refused() {
        let chain = chain_rabc();
        let mut tree = RenderTree::default();
        tree.build_deep(&chain, &id("R"));
        assert!(tree.observe_node(&id("nope"), None).is_none());
    }
}

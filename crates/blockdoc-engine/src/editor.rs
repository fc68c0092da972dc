//! # Editor Facade
//!
//! [`BlockEditor`] owns one open document: the [`BlockChain`], its
//! [`RenderTree`] (and through it the position manager), the
//! [`SelectionManager`], the [`SyncLayer`] and the outbound [`EventBus`].
//!
//! Every mutation, whether local, command-driven or remote, goes through the
//! same chain entry points and the resulting event is dispatched
//! synchronously in a fixed order:
//!
//! 1. render tree patch (and position invalidation)
//! 2. selection adjustment
//! 3. outbox translation (skipped for remote-origin events)
//! 4. external subscribers
//!
//! The editor moves through `Empty -> Loaded -> ... -> Disposed`; after
//! [`BlockEditor::destroy`] every fallible call returns
//! [`EditorError::Disposed`].

use std::collections::HashMap;

use crate::block::{Block, BlockContent, BlockId, BlockRecord, BlockType};
use crate::chain::{BlockChain, ChainError, ChangeEvent};
use crate::commands::Cmd;
use crate::events::{EventBus, SubscriptionId};
use crate::position::{BlockElement, ObserverHandle, PositionManager, Rect};
use crate::render_tree::{OutlineRow, RenderTree};
use crate::selection::{Selection, SelectionManager, SelectionPoint};
use crate::sync::{Disposition, Operation, Outbound, RemotePeer, SyncError, SyncLayer, classify};

#[derive(Debug, thiserror::Error)]
pub enum EditorError {
    #[error("editor has been destroyed")]
    Disposed,
    #[error("no document is loaded")]
    NotLoaded,
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorState {
    Empty,
    Loaded,
    Disposed,
}

/// Tunables handed in by the embedding application
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EditorOptions {
    /// Extra distance around the viewport that still counts as visible
    pub viewport_overscan: f64,
    /// Maximum operations handed to the transport per flush
    pub flush_batch_size: usize,
}

impl Default for EditorOptions {
    fn default() -> Self {
        Self {
            viewport_overscan: 1.0,
            flush_batch_size: 64,
        }
    }
}

pub struct BlockEditor {
    state: EditorState,
    chain: BlockChain,
    tree: RenderTree,
    selection: SelectionManager,
    sync: SyncLayer,
    events: EventBus,
}

impl Default for BlockEditor {
    fn default() -> Self {
        Self::new(EditorOptions::default())
    }
}

impl BlockEditor {
    pub fn new(options: EditorOptions) -> Self {
        Self {
            state: EditorState::Empty,
            chain: BlockChain::new(),
            tree: RenderTree::new(PositionManager::new(options.viewport_overscan)),
            selection: SelectionManager::new(),
            sync: SyncLayer::new(options.flush_batch_size),
            events: EventBus::new(),
        }
    }

    /// Create an editor and load `data` in one step
    pub fn open(
        doc_id: impl Into<BlockId>,
        data: HashMap<BlockId, BlockRecord>,
        options: EditorOptions,
    ) -> Result<Self, EditorError> {
        let mut editor = Self::new(options);
        editor.change_doc(doc_id, data)?;
        Ok(editor)
    }

    pub fn state(&self) -> EditorState {
        self.state
    }

    pub fn chain(&self) -> &BlockChain {
        &self.chain
    }

    pub fn render_tree(&self) -> &RenderTree {
        &self.tree
    }

    /// Mutable access for registering render triggers on tree nodes
    pub fn render_tree_mut(&mut self) -> &mut RenderTree {
        &mut self.tree
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(
        &self,
        handler: impl FnMut(&ChangeEvent) + 'static,
    ) -> Result<SubscriptionId, EditorError> {
        self.ensure_live()?;
        Ok(self.events.subscribe(handler))
    }

    /// Replace the open document.
    ///
    /// Subscribers and selection are torn down before the chain is touched.
    /// If `data` is rejected the previous document stays loaded.
    pub fn change_doc(
        &mut self,
        doc_id: impl Into<BlockId>,
        data: HashMap<BlockId, BlockRecord>,
    ) -> Result<(), EditorError> {
        self.ensure_live()?;
        let doc_id = doc_id.into();
        log::info!("switching to document {doc_id}");

        self.events.clear();
        self.selection.destroy();
        self.sync.reset();
        self.chain.rebuild(doc_id.clone(), data)?;

        self.tree.destroy();
        self.tree.build_deep(&self.chain, &doc_id);
        self.state = EditorState::Loaded;
        Ok(())
    }

    /// Release everything. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        if self.state == EditorState::Disposed {
            return;
        }
        log::info!("destroying editor");
        self.events.close();
        self.selection.destroy();
        self.tree.destroy();
        self.chain.destroy();
        self.sync.reset();
        self.state = EditorState::Disposed;
    }

    pub fn insert_block(
        &mut self,
        block: Block,
        parent: &BlockId,
        after: Option<&BlockId>,
    ) -> Result<(), EditorError> {
        self.ensure_loaded()?;
        let event = self.chain.insert(block, parent, after)?;
        self.dispatch(&event);
        Ok(())
    }

    pub fn update_block(&mut self, id: &BlockId, content: BlockContent) -> Result<(), EditorError> {
        self.ensure_loaded()?;
        let event = self.chain.update(id, content)?;
        self.dispatch(&event);
        Ok(())
    }

    pub fn retype_block(&mut self, id: &BlockId, block_type: BlockType) -> Result<(), EditorError> {
        self.ensure_loaded()?;
        let event = self.chain.retype(id, block_type)?;
        self.dispatch(&event);
        Ok(())
    }

    pub fn move_block(
        &mut self,
        id: &BlockId,
        parent: &BlockId,
        after: Option<&BlockId>,
    ) -> Result<(), EditorError> {
        self.ensure_loaded()?;
        let event = self.chain.move_block(id, parent, after)?;
        self.dispatch(&event);
        Ok(())
    }

    pub fn move_range(
        &mut self,
        start: &BlockId,
        end: &BlockId,
        parent: &BlockId,
        after: Option<&BlockId>,
    ) -> Result<(), EditorError> {
        self.ensure_loaded()?;
        let event = self.chain.move_range(start, end, parent, after)?;
        self.dispatch(&event);
        Ok(())
    }

    pub fn delete_block(&mut self, id: &BlockId) -> Result<(), EditorError> {
        self.ensure_loaded()?;
        let event = self.chain.delete(id)?;
        self.dispatch(&event);
        Ok(())
    }

    /// Run a compound command as a sequence of primitive operations
    pub fn apply(&mut self, cmd: Cmd) -> Result<(), EditorError> {
        self.ensure_loaded()?;
        let ops = cmd.compile(&self.chain)?;
        log::debug!("{cmd:?} compiled to {} operations", ops.len());
        for op in &ops {
            self.apply_operation(op)?;
        }
        Ok(())
    }

    /// Apply an operation as a local edit; it will be queued for the peer
    pub fn apply_local(&mut self, op: Operation) -> Result<(), EditorError> {
        self.ensure_loaded()?;
        self.apply_operation(&op)
    }

    /// Apply an inbound operation from the peer.
    ///
    /// Returns `Ok(false)` when the operation was already in effect.
    pub fn apply_remote(&mut self, op: Operation) -> Result<bool, EditorError> {
        self.ensure_loaded()?;
        log::debug!("inbound {op:?}");
        match classify(&self.chain, &op) {
            Disposition::Duplicate => {
                log::debug!("skipping duplicate operation on {}", op.target());
                Ok(false)
            }
            Disposition::Conflict(reason) => {
                log::warn!("rejected remote operation on {}: {reason}", op.target());
                Err(SyncError::Conflict {
                    id: op.target().clone(),
                    reason,
                }
                .into())
            }
            Disposition::Apply => {
                self.sync.begin_remote();
                let result = self.apply_operation(&op);
                self.sync.end_remote();
                match result {
                    Ok(()) => Ok(true),
                    Err(EditorError::Chain(err)) => {
                        log::warn!("remote operation on {} failed: {err}", op.target());
                        Err(SyncError::Structural(err).into())
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Apply one sequenced operation from the peer's outbox.
    ///
    /// Sequence numbers at or below the last one applied are skipped, so a
    /// whole unacknowledged batch can be redelivered. Returns `Ok(false)`
    /// when nothing changed.
    pub fn receive(&mut self, outbound: &Outbound) -> Result<bool, EditorError> {
        self.ensure_loaded()?;
        if self.sync.already_received(outbound.seq) {
            log::debug!("skipping redelivered #{}", outbound.seq);
            return Ok(false);
        }
        let applied = self.apply_remote(outbound.op.clone())?;
        self.sync.mark_received(outbound.seq);
        Ok(applied)
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.get()
    }

    /// Set the selection after checking its endpoints against the chain.
    /// Offsets past the end of a block's content are clamped.
    pub fn set_selection(&mut self, selection: Option<Selection>) -> Result<(), EditorError> {
        self.ensure_loaded()?;
        let checked = match selection {
            Some(sel) => Some(Selection::new(
                self.checked_point(sel.anchor)?,
                self.checked_point(sel.focus)?,
            )),
            None => None,
        };
        self.selection.set(checked);
        Ok(())
    }

    pub fn on_selection_change(
        &mut self,
        listener: impl FnMut(Option<&Selection>) + 'static,
    ) -> Result<(), EditorError> {
        self.ensure_live()?;
        self.selection.on_change(listener);
        Ok(())
    }

    /// Track the on-screen geometry of a rendered block
    pub fn observe(
        &self,
        id: &BlockId,
        element: Option<Box<dyn BlockElement>>,
    ) -> Result<ObserverHandle, EditorError> {
        self.ensure_loaded()?;
        self.tree
            .observe_node(id, element)
            .ok_or_else(|| ChainError::UnknownBlock(id.clone()).into())
    }

    pub fn report_rect(&self, id: &BlockId, rect: Rect) -> Result<(), EditorError> {
        self.ensure_loaded()?;
        self.tree.positions().report(id, rect);
        Ok(())
    }

    pub fn set_viewport(&self, viewport: Rect) -> Result<(), EditorError> {
        self.ensure_loaded()?;
        self.tree.positions().set_viewport(viewport);
        Ok(())
    }

    pub fn update_viewport_blocks(&self) -> Result<(), EditorError> {
        self.ensure_loaded()?;
        self.tree.update_viewport_blocks();
        Ok(())
    }

    /// Last known rectangle; `None` once destroyed
    pub fn block_position(&self, id: &BlockId) -> Option<Rect> {
        self.tree.block_position(id)
    }

    pub fn blocks_in_viewport(&self) -> Vec<BlockId> {
        self.tree.positions().blocks_in_viewport()
    }

    /// Hand queued operations to the transport
    pub fn flush(&mut self, peer: &mut dyn RemotePeer) -> Result<usize, EditorError> {
        self.ensure_live()?;
        Ok(self.sync.flush(peer)?)
    }

    pub fn acknowledge(&mut self, seq: u64) -> Result<usize, EditorError> {
        self.ensure_live()?;
        Ok(self.sync.acknowledge(seq))
    }

    pub fn pending_operations(&self) -> usize {
        self.sync.pending()
    }

    pub fn outline(&self) -> Vec<OutlineRow> {
        self.tree.flatten()
    }

    pub fn format_outline(&self) -> String {
        self.tree.format_outline(&self.chain)
    }

    /// Flat-map snapshot of the open document
    pub fn records(&self) -> Result<HashMap<BlockId, BlockRecord>, EditorError> {
        self.ensure_loaded()?;
        Ok(self.chain.to_records())
    }

    fn apply_operation(&mut self, op: &Operation) -> Result<(), EditorError> {
        match op {
            Operation::Insert {
                id,
                block_type,
                content,
                parent,
                after,
            } => self.insert_block(
                Block::new(id.clone(), *block_type, content.clone()),
                parent,
                after.as_ref(),
            ),
            Operation::Update {
                id,
                block_type,
                content,
            } => {
                let current = self
                    .chain
                    .get_block(id)
                    .ok_or_else(|| ChainError::UnknownBlock(id.clone()))?;
                let retype = current.block_type != *block_type;
                let rewrite = !retype || current.content != *content;
                if retype {
                    self.retype_block(id, *block_type)?;
                }
                if rewrite {
                    self.update_block(id, content.clone())?;
                }
                Ok(())
            }
            Operation::Move { id, parent, after } => self.move_block(id, parent, after.as_ref()),
            Operation::MoveRange {
                start,
                end,
                parent,
                after,
            } => self.move_range(start, end, parent, after.as_ref()),
            Operation::Delete { id } => self.delete_block(id),
        }
    }

    fn dispatch(&mut self, event: &ChangeEvent) {
        log::debug!("dispatching {event:?}");
        self.tree.on_block_change(&self.chain, event);
        self.selection.on_block_change(&self.chain, event);
        self.sync.on_local_change(&self.chain, event);
        self.events.emit(event);
    }

    fn checked_point(&self, point: SelectionPoint) -> Result<SelectionPoint, EditorError> {
        let block = self
            .chain
            .get_block(&point.block)
            .ok_or_else(|| ChainError::UnknownBlock(point.block.clone()))?;
        let offset = point.offset.min(block.content.len());
        Ok(SelectionPoint::new(point.block, offset))
    }

    fn ensure_live(&self) -> Result<(), EditorError> {
        match self.state {
            EditorState::Disposed => Err(EditorError::Disposed),
            _ => Ok(()),
        }
    }

    fn ensure_loaded(&self) -> Result<(), EditorError> {
        match self.state {
            EditorState::Disposed => Err(EditorError::Disposed),
            EditorState::Empty => Err(EditorError::NotLoaded),
            EditorState::Loaded => Ok(()),
        }
    }
}

impl Drop for BlockEditor {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn id(s: &str) -> BlockId {
        BlockId::from(s)
    }

    fn rabc() -> HashMap<BlockId, BlockRecord> {
        let mut data = HashMap::new();
        data.insert(id("R"), BlockRecord::new(BlockType::Page).with_first_child("A"));
        data.insert(id("A"), BlockRecord::new(BlockType::Text).with_parent("R").with_next("B"));
        data.insert(
            id("B"),
            BlockRecord::new(BlockType::Text)
                .with_parent("R")
                .with_next("C")
                .with_content(BlockContent::text("bee")),
        );
        data.insert(id("C"), BlockRecord::new(BlockType::Text).with_parent("R"));
        data
    }

    fn editor() -> BlockEditor {
        BlockEditor::open("R", rabc(), EditorOptions::default()).unwrap()
    }

    #[test]
    fn new_editor_is_empty_until_loaded() {
        let mut editor = BlockEditor::default();
        assert_eq!(editor.state(), EditorState::Empty);
        assert!(matches!(
            editor.delete_block(&id("A")),
            Err(EditorError::NotLoaded)
        ));
        editor.change_doc("R", rabc()).unwrap();
        assert_eq!(editor.state(), EditorState::Loaded);
        assert_eq!(editor.render_tree().len(), 4);
    }

    #[test]
    fn dependents_see_event_before_subscribers() {
        let mut editor = editor();
        editor
            .set_selection(Some(Selection::collapsed(SelectionPoint::new("B", 1))))
            .unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        editor
            .subscribe(move |event| sink.borrow_mut().push(event.block().clone()))
            .unwrap();

        editor.delete_block(&id("B")).unwrap();

        assert_eq!(*seen.borrow(), vec![id("B")]);
        assert_eq!(
            editor.selection(),
            Some(&Selection::collapsed(SelectionPoint::new("C", 0)))
        );
        assert!(editor.render_tree().get_tree_node(&id("B")).is_none());
        assert_eq!(editor.pending_operations(), 1);
    }

    #[test]
    fn set_selection_rejects_unknown_blocks_and_clamps_offsets() {
        let mut editor = editor();
        let err = editor
            .set_selection(Some(Selection::collapsed(SelectionPoint::new("X", 0))))
            .unwrap_err();
        assert!(matches!(err, EditorError::Chain(ChainError::UnknownBlock(_))));

        editor
            .set_selection(Some(Selection::collapsed(SelectionPoint::new("B", 99))))
            .unwrap();
        assert_eq!(editor.selection().unwrap().focus.offset, 3);
    }

    #[test]
    fn change_doc_tears_down_subscribers_and_selection() {
        let mut editor = editor();
        let hits = Rc::new(RefCell::new(0));
        let counter = hits.clone();
        editor.subscribe(move |_| *counter.borrow_mut() += 1).unwrap();
        editor
            .set_selection(Some(Selection::collapsed(SelectionPoint::new("A", 0))))
            .unwrap();
        editor.delete_block(&id("C")).unwrap();

        editor.change_doc("R", rabc()).unwrap();
        editor.delete_block(&id("A")).unwrap();

        assert_eq!(*hits.borrow(), 1);
        assert_eq!(editor.selection(), None);
        assert_eq!(editor.pending_operations(), 1);
    }

    #[test]
    fn rejected_document_keeps_previous_one() {
        let mut editor = editor();
        let err = editor.change_doc("missing", rabc()).unwrap_err();
        assert!(matches!(err, EditorError::Chain(ChainError::MissingRoot(_))));
        assert_eq!(editor.state(), EditorState::Loaded);
        assert!(editor.chain().contains(&id("B")));
    }

    #[test]
    fn destroy_is_idempotent_and_final() {
        let mut editor = editor();
        editor.destroy();
        editor.destroy();
        assert_eq!(editor.state(), EditorState::Disposed);
        assert!(editor.chain().is_empty());
        assert!(matches!(
            editor.change_doc("R", rabc()),
            Err(EditorError::Disposed)
        ));
        assert!(matches!(
            editor.subscribe(|_| {}),
            Err(EditorError::Disposed)
        ));
        assert!(matches!(
            editor.apply(Cmd::Indent { id: id("B") }),
            Err(EditorError::Disposed)
        ));
    }

    #[test]
    fn remote_operations_apply_once_and_are_not_echoed() {
        let mut editor = editor();
        let op = Operation::Move {
            id: id("C"),
            parent: id("R"),
            after: Some(id("A")),
        };
        assert!(editor.apply_remote(op.clone()).unwrap());
        assert!(!editor.apply_remote(op).unwrap());
        assert_eq!(editor.pending_operations(), 0);
        let order: Vec<&str> = editor
            .chain()
            .children(&id("R"))
            .map(|b| b.id.as_str())
            .collect();
        assert_eq!(order, vec!["A", "C", "B"]);
    }

    #[test]
    fn remote_conflict_is_reported() {
        let mut editor = editor();
        let err = editor
            .apply_remote(Operation::Update {
                id: id("gone"),
                block_type: BlockType::Text,
                content: BlockContent::default(),
            })
            .unwrap_err();
        assert!(matches!(
            err,
            EditorError::Sync(SyncError::Conflict { .. })
        ));
    }

    #[test]
    fn commands_queue_each_primitive() {
        let mut editor = editor();
        editor.apply(Cmd::Indent { id: id("B") }).unwrap();
        editor
            .apply(Cmd::TurnInto {
                id: id("A"),
                block_type: BlockType::Heading,
            })
            .unwrap();
        assert_eq!(editor.pending_operations(), 3);
        assert_eq!(editor.chain().get_block(&id("B")).unwrap().parent(), Some(&id("R")));
        assert_eq!(
            editor.chain().get_block(&id("A")).unwrap().block_type,
            BlockType::Heading
        );
    }

    #[test]
    fn update_operation_retypes_without_touching_content() {
        let mut editor = editor();
        editor
            .apply_local(Operation::Update {
                id: id("B"),
                block_type: BlockType::Code,
                content: BlockContent::text("bee"),
            })
            .unwrap();
        assert_eq!(editor.pending_operations(), 1);
        assert_eq!(
            editor.chain().get_block(&id("B")).unwrap().block_type,
            BlockType::Code
        );
    }
}

use serde::{Deserialize, Serialize};

use crate::block::BlockId;
use crate::chain::{BlockChain, ChangeEvent};

/// One end of a selection: a block and an offset into its content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectionPoint {
    pub block: BlockId,
    pub offset: usize,
}

impl SelectionPoint {
    pub fn new(block: impl Into<BlockId>, offset: usize) -> Self {
        Self {
            block: block.into(),
            offset,
        }
    }

    pub fn start_of(block: BlockId) -> Self {
        Self { block, offset: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: SelectionPoint,
    pub focus: SelectionPoint,
}

impl Selection {
    pub fn new(anchor: SelectionPoint, focus: SelectionPoint) -> Self {
        Self { anchor, focus }
    }

    pub fn collapsed(point: SelectionPoint) -> Self {
        Self {
            anchor: point.clone(),
            focus: point,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }

    pub fn references(&self, id: &BlockId) -> bool {
        self.anchor.block == *id || self.focus.block == *id
    }
}

/// A selection endpoint survived an adjustment pass while naming a deleted block
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("selection endpoint references missing block {block}")]
pub struct DanglingSelectionWarning {
    pub block: BlockId,
}

type SelectionListener = Box<dyn FnMut(Option<&Selection>)>;

/// Holds the active selection and keeps it valid across structural edits
#[derive(Default)]
pub struct SelectionManager {
    current: Option<Selection>,
    listeners: Vec<SelectionListener>,
}

impl SelectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<&Selection> {
        self.current.as_ref()
    }

    pub fn set(&mut self, selection: Option<Selection>) {
        if self.current != selection {
            self.current = selection;
            self.notify();
        }
    }

    /// Listen for selection changes; cleared by [`SelectionManager::destroy`]
    pub fn on_change(&mut self, listener: impl FnMut(Option<&Selection>) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn destroy(&mut self) {
        self.current = None;
        self.listeners.clear();
    }

    /// Keep the selection valid after `event` has been applied to `chain`
    pub fn on_block_change(&mut self, chain: &BlockChain, event: &ChangeEvent) {
        let Some(current) = self.current.as_ref() else {
            return;
        };

        let adjusted = match event {
            ChangeEvent::Delete {
                block,
                old_parent,
                old_next,
                ..
            } => {
                if !current.references(block) {
                    return;
                }
                let fallback = old_next
                    .iter()
                    .chain(old_parent.iter())
                    .find(|candidate| chain.contains(candidate))
                    .cloned()
                    .map(SelectionPoint::start_of);
                let remap = |point: &SelectionPoint| {
                    if point.block == *block {
                        fallback.clone()
                    } else {
                        Some(point.clone())
                    }
                };
                match (remap(&current.anchor), remap(&current.focus)) {
                    (Some(anchor), Some(focus)) => Some(Selection::new(anchor, focus)),
                    (Some(survivor), None) | (None, Some(survivor)) => {
                        Some(Selection::collapsed(survivor))
                    }
                    (None, None) => None,
                }
            }
            ChangeEvent::Update { block } => {
                let Some(limit) = chain.get_block(block).map(|b| b.content.len()) else {
                    return;
                };
                let clamp = |point: &SelectionPoint| {
                    if point.block == *block && point.offset > limit {
                        SelectionPoint::new(point.block.clone(), limit)
                    } else {
                        point.clone()
                    }
                };
                Some(Selection::new(clamp(&current.anchor), clamp(&current.focus)))
            }
            // Identity and content travel with moved blocks; inserts touch nothing referenced
            ChangeEvent::Insert { .. } | ChangeEvent::Move { .. } | ChangeEvent::MoveRange { .. } => {
                return;
            }
        };

        if adjusted.as_ref() != Some(current) {
            log::debug!("selection adjusted after {:?}: {:?}", event.command(), adjusted);
            self.set(adjusted);
        }

        if let Err(warning) = self.verify(chain) {
            log::error!("{warning}");
            debug_assert!(false, "{warning}");
        }
    }

    /// Check that no endpoint names a block missing from `chain`
    pub fn verify(&self, chain: &BlockChain) -> Result<(), DanglingSelectionWarning> {
        let Some(current) = self.current.as_ref() else {
            return Ok(());
        };
        for point in [&current.anchor, &current.focus] {
            if !chain.contains(&point.block) {
                return Err(DanglingSelectionWarning {
                    block: point.block.clone(),
                });
            }
        }
        Ok(())
    }

    fn notify(&mut self) {
        let current = self.current.as_ref();
        for listener in &mut self.listeners {
            listener(current);
        }
    }
}

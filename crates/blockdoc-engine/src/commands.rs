//! Compound editing commands.
//!
//! A [`Cmd`] compiles against the current chain into primitive
//! [`Operation`]s. The editor applies them one at a time, so every dependent
//! reacts to each primitive exactly as it would to a remote edit.

use crate::block::{Block, BlockContent, BlockId, BlockType};
use crate::chain::BlockChain;
use crate::editor::EditorError;
use crate::sync::Operation;

/// Editing commands understood by [`crate::BlockEditor::apply`]
#[derive(Debug, Clone, PartialEq)]
pub enum Cmd {
    /// New block directly after `target`, under the same parent
    InsertBelow {
        target: BlockId,
        block_type: BlockType,
        content: BlockContent,
    },
    /// Become the last child of the previous sibling
    Indent { id: BlockId },
    /// Move out to follow the current parent
    Outdent { id: BlockId },
    /// Swap places with the previous sibling
    MoveUp { id: BlockId },
    /// Swap places with the next sibling
    MoveDown { id: BlockId },
    /// Change type; children of a leaf type are hoisted to follow the block
    TurnInto { id: BlockId, block_type: BlockType },
    /// Delete the block together with every descendant
    DeleteSubtree { id: BlockId },
}

impl Cmd {
    /// Compile into the primitive operations that carry out this command
    pub fn compile(&self, chain: &BlockChain) -> Result<Vec<Operation>, EditorError> {
        match self {
            Cmd::InsertBelow {
                target,
                block_type,
                content,
            } => {
                let block = lookup(chain, target)?;
                let (parent, after) = match block.parent() {
                    Some(parent) => (parent.clone(), Some(target.clone())),
                    None if chain.root_id() == Some(target) => (target.clone(), None),
                    None => return Err(invalid(format!("{target} is detached"))),
                };
                Ok(vec![Operation::Insert {
                    id: BlockId::generate(),
                    block_type: *block_type,
                    content: content.clone(),
                    parent,
                    after,
                }])
            }
            Cmd::Indent { id } => {
                let block = lookup(chain, id)?;
                let Some(prev) = block.prev() else {
                    return Err(invalid(format!("{id} has no previous sibling to indent under")));
                };
                let after = chain.last_child(prev).map(|last| last.id.clone());
                Ok(vec![Operation::Move {
                    id: id.clone(),
                    parent: prev.clone(),
                    after,
                }])
            }
            Cmd::Outdent { id } => {
                let block = lookup(chain, id)?;
                let grandparent = block
                    .parent()
                    .and_then(|parent| chain.get_block(parent))
                    .and_then(|parent| Some((parent.id.clone(), parent.parent()?.clone())));
                let Some((parent, grandparent)) = grandparent else {
                    return Err(invalid(format!("{id} is already at the top level")));
                };
                Ok(vec![Operation::Move {
                    id: id.clone(),
                    parent: grandparent,
                    after: Some(parent),
                }])
            }
            Cmd::MoveUp { id } => {
                let block = lookup(chain, id)?;
                let (Some(parent), Some(prev)) = (block.parent(), block.prev()) else {
                    return Err(invalid(format!("{id} is already first")));
                };
                let after = chain.get_block(prev).and_then(|p| p.prev()).cloned();
                Ok(vec![Operation::Move {
                    id: id.clone(),
                    parent: parent.clone(),
                    after,
                }])
            }
            Cmd::MoveDown { id } => {
                let block = lookup(chain, id)?;
                let (Some(parent), Some(next)) = (block.parent(), block.next()) else {
                    return Err(invalid(format!("{id} is already last")));
                };
                Ok(vec![Operation::Move {
                    id: id.clone(),
                    parent: parent.clone(),
                    after: Some(next.clone()),
                }])
            }
            Cmd::TurnInto { id, block_type } => {
                let block = lookup(chain, id)?;
                let mut ops = Vec::new();
                if !block_type.accepts_children()
                    && let (Some(first), Some(last)) = (block.first_child(), chain.last_child(id))
                {
                    let Some(parent) = block.parent() else {
                        return Err(invalid(format!("{id} cannot shed its children here")));
                    };
                    ops.push(Operation::MoveRange {
                        start: first.clone(),
                        end: last.id.clone(),
                        parent: parent.clone(),
                        after: Some(id.clone()),
                    });
                }
                ops.push(Operation::Update {
                    id: id.clone(),
                    block_type: *block_type,
                    content: block.content.clone(),
                });
                Ok(ops)
            }
            Cmd::DeleteSubtree { id } => {
                lookup(chain, id)?;
                if chain.root_id() == Some(id) {
                    return Err(invalid("the document root cannot be deleted".to_string()));
                }
                let mut preorder = Vec::new();
                chain.traverse_from(id, |block| preorder.push(block.id.clone()));
                Ok(preorder
                    .into_iter()
                    .rev()
                    .map(|id| Operation::Delete { id })
                    .collect())
            }
        }
    }
}

fn lookup<'a>(chain: &'a BlockChain, id: &BlockId) -> Result<&'a Block, EditorError> {
    chain
        .get_block(id)
        .ok_or_else(|| invalid(format!("unknown block {id}")))
}

fn invalid(reason: String) -> EditorError {
    EditorError::InvalidCommand(reason)
}

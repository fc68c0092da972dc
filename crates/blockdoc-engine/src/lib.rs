pub mod block;
pub mod chain;
pub mod commands;
pub mod editor;
pub mod events;
pub mod io;
pub mod position;
pub mod render_tree;
pub mod selection;
pub mod sync;

// Re-export key types for easier usage
pub use block::{Block, BlockContent, BlockId, BlockRecord, BlockType, TextRun};
pub use chain::{BlockChain, BlockCommand, ChainError, ChangeEvent};
pub use commands::Cmd;
pub use editor::{BlockEditor, EditorError, EditorOptions, EditorState};
pub use events::{EventBus, SubscriptionId};
pub use io::{DocumentFile, IoError, load_document, save_document};
pub use position::{BlockElement, ObserverHandle, PositionManager, PositionRecord, Rect};
pub use render_tree::{OutlineRow, RenderTree, TreeNode};
pub use selection::{DanglingSelectionWarning, Selection, SelectionManager, SelectionPoint};
pub use sync::{Disposition, Operation, Outbound, RemotePeer, SyncError, SyncLayer, classify};

use anyhow::Result;
use blockdoc_config::Config;
use blockdoc_engine::{
    BlockContent, BlockEditor, BlockId, BlockRecord, BlockType, Cmd, DocumentFile, EditorOptions,
    ObserverHandle, OutlineRow, Outbound, Rect, RemotePeer, Selection, SelectionPoint, SyncError,
    io::{self, IoError},
};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph},
};
use std::{
    cell::Cell,
    collections::HashMap,
    env,
    fs::OpenOptions,
    io::stdout,
    path::{Path, PathBuf},
    process,
    rc::Rc,
};

/// Stand-in transport: logs each batch and acknowledges it at once
#[derive(Default)]
struct LoggingPeer {
    last_seq: Option<u64>,
}

impl RemotePeer for LoggingPeer {
    fn send(&mut self, batch: &[Outbound]) -> Result<(), SyncError> {
        for outbound in batch {
            log::info!("-> #{} {:?}", outbound.seq, outbound.op);
        }
        self.last_seq = batch.last().map(|outbound| outbound.seq);
        Ok(())
    }
}

struct App {
    doc_path: PathBuf,
    doc_id: BlockId,
    editor: BlockEditor,
    rows: Vec<OutlineRow>,
    list_state: ListState,
    observers: HashMap<BlockId, ObserverHandle>,
    /// Set by render triggers and the change-event stream
    dirty: Rc<Cell<bool>>,
    peer: LoggingPeer,
    sent: u64,
    status: String,
}

impl App {
    fn new(doc_path: PathBuf, options: EditorOptions) -> Result<Self> {
        let document = match io::load_document(&doc_path) {
            Ok(document) => document,
            Err(IoError::NotFound(_)) => {
                log::info!("{} not found, starting a new document", doc_path.display());
                starter_document()
            }
            Err(e) => return Err(e.into()),
        };
        let (doc_id, blocks) = document.into_parts();
        let editor = BlockEditor::open(doc_id.clone(), blocks, options)?;

        let mut app = Self {
            doc_path,
            doc_id,
            editor,
            rows: Vec::new(),
            list_state: ListState::default(),
            observers: HashMap::new(),
            dirty: Rc::new(Cell::new(true)),
            peer: LoggingPeer::default(),
            sent: 0,
            status: String::new(),
        };

        let dirty = app.dirty.clone();
        app.editor.subscribe(move |_| dirty.set(true))?;
        app.refresh();
        // Start on the first block below the page
        if app.rows.len() > 1 {
            app.select_row(1);
        }
        Ok(app)
    }

    /// Re-read the outline after the render tree changed
    fn refresh(&mut self) {
        if !self.dirty.replace(false) {
            return;
        }
        self.rows = self.editor.outline();

        let tree = self.editor.render_tree_mut();
        for row in &self.rows {
            if let Some(node) = tree.get_tree_node_mut(&row.id)
                && !node.has_trigger()
            {
                let dirty = self.dirty.clone();
                node.register_update(move || dirty.set(true));
            }
        }

        self.observers
            .retain(|id, _| self.rows.iter().any(|row| row.id == *id));
        for row in &self.rows {
            if !self.observers.contains_key(&row.id)
                && let Ok(handle) = self.editor.observe(&row.id, None)
            {
                self.observers.insert(row.id.clone(), handle);
            }
        }

        let focus = self.editor.selection().map(|sel| sel.focus.block.clone());
        let index = focus
            .and_then(|id| self.rows.iter().position(|row| row.id == id))
            .or_else(|| self.list_state.selected())
            .map(|i| i.min(self.rows.len().saturating_sub(1)));
        self.list_state.select(index);
    }

    fn select_row(&mut self, index: usize) {
        let Some(row) = self.rows.get(index) else {
            return;
        };
        let point = SelectionPoint::new(row.id.clone(), 0);
        if let Err(e) = self.editor.set_selection(Some(Selection::collapsed(point))) {
            self.status = format!("Error: {e}");
        }
        self.list_state.select(Some(index));
    }

    fn next_row(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(i) => (i + 1) % self.rows.len(),
            None => 0,
        };
        self.select_row(i);
    }

    fn previous_row(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(0) | None => self.rows.len() - 1,
            Some(i) => i - 1,
        };
        self.select_row(i);
    }

    fn selected_id(&self) -> Option<BlockId> {
        self.list_state
            .selected()
            .and_then(|i| self.rows.get(i))
            .map(|row| row.id.clone())
    }

    fn run(&mut self, build: impl FnOnce(BlockId) -> Cmd) {
        let Some(id) = self.selected_id() else {
            return;
        };
        let cmd = build(id);
        self.status = match self.editor.apply(cmd) {
            Ok(()) => String::new(),
            Err(e) => format!("Error: {e}"),
        };
        if let Err(e) = self.sync() {
            self.status = format!("Sync error: {e}");
        }
    }

    fn insert_below(&mut self) {
        let before = self.rows.len();
        self.run(|target| Cmd::InsertBelow {
            target,
            block_type: BlockType::Text,
            content: BlockContent::default(),
        });
        self.refresh();
        // Follow the new block
        if self.rows.len() > before
            && let Some(i) = self.list_state.selected()
        {
            let depth = self.rows[i].depth;
            let next = self.rows[i + 1..]
                .iter()
                .position(|row| row.depth <= depth)
                .map(|offset| i + 1 + offset);
            if let Some(next) = next {
                self.select_row(next);
            }
        }
    }

    fn sync(&mut self) -> Result<()> {
        let sent = self.editor.flush(&mut self.peer)?;
        if let Some(seq) = self.peer.last_seq.take() {
            self.editor.acknowledge(seq)?;
        }
        self.sent += sent as u64;
        Ok(())
    }

    fn save(&mut self) {
        let result = self
            .editor
            .records()
            .map_err(anyhow::Error::from)
            .and_then(|records| {
                let document = DocumentFile::new(self.doc_id.clone(), records);
                io::save_document(&self.doc_path, &document)?;
                Ok(())
            });
        self.status = match result {
            Ok(()) => format!("Saved {}", self.doc_path.display()),
            Err(e) => format!("Save failed: {e}"),
        };
    }

    fn row_label(&self, row: &OutlineRow) -> String {
        let text = self
            .editor
            .chain()
            .get_block(&row.id)
            .map(|block| block.content.plain_text())
            .unwrap_or_default();
        let marker = match row.block_type {
            BlockType::Page => "▣",
            BlockType::Heading => "#",
            BlockType::List => "•",
            BlockType::Code => "`",
            BlockType::Text => "·",
        };
        let text = if text.is_empty() { "(empty)".to_string() } else { text };
        format!("{}{} {}", "  ".repeat(row.depth), marker, text)
    }
}

/// Page with one empty text block
fn starter_document() -> DocumentFile {
    let root = BlockId::from("root");
    let first = BlockId::generate();
    let mut blocks = HashMap::new();
    blocks.insert(
        root.clone(),
        BlockRecord::new(BlockType::Page)
            .with_first_child(first.clone())
            .with_content(BlockContent::text("Untitled")),
    );
    blocks.insert(first, BlockRecord::new(BlockType::Text).with_parent(root.clone()));
    DocumentFile::new(root, blocks)
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(path) = log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
        if env::var_os("RUST_LOG").is_none() {
            builder.filter_level(log::LevelFilter::Info);
        }
    }
    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    // Determine document path from CLI args or config file
    let args: Vec<String> = env::args().collect();
    let config_path = Config::config_path();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: Failed to load config file: {e}");
            process::exit(1);
        }
    };

    let doc_path = if args.len() == 2 {
        PathBuf::from(&args[1])
    } else if args.len() == 1 {
        match &config {
            Some(config) => config.document_path.clone(),
            None => {
                eprintln!("Error: No document path provided and no config file found");
                eprintln!("Usage: {} <document.toml>", args[0]);
                eprintln!("Or create a config file at {}", config_path.display());
                process::exit(1);
            }
        }
    } else {
        eprintln!("Usage: {} [document.toml]", args[0]);
        process::exit(1);
    };

    init_logging(config.as_ref().and_then(|c| c.log_file.as_deref()))?;
    let options = config
        .as_ref()
        .map(|c| EditorOptions {
            viewport_overscan: c.viewport_overscan,
            flush_batch_size: c.flush_batch_size,
        })
        .unwrap_or_default();

    let mut app = match App::new(doc_path.clone(), options) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("Error: Document '{}' could not be opened: {e}", doc_path.display());
            process::exit(1);
        }
    };

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, &mut app);

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    app.editor.destroy();
    if let Err(err) = res {
        println!("{err:?}");
    }

    Ok(())
}

fn run_app<B: ratatui::backend::Backend>(terminal: &mut Terminal<B>, app: &mut App) -> Result<()>
where
    B::Error: Send + Sync + 'static,
{
    loop {
        app.refresh();
        terminal.draw(|f| ui(f, app))?;

        if let Event::Key(key) = event::read()? {
            match key.code {
                KeyCode::Char('q') => return Ok(()),
                KeyCode::Down | KeyCode::Char('j') => app.next_row(),
                KeyCode::Up | KeyCode::Char('k') => app.previous_row(),
                KeyCode::Tab => app.run(|id| Cmd::Indent { id }),
                KeyCode::BackTab => app.run(|id| Cmd::Outdent { id }),
                KeyCode::Enter => app.insert_below(),
                KeyCode::Char('d') => app.run(|id| Cmd::DeleteSubtree { id }),
                KeyCode::Char('h') => app.run(|id| Cmd::TurnInto {
                    id,
                    block_type: BlockType::Heading,
                }),
                KeyCode::Char('t') => app.run(|id| Cmd::TurnInto {
                    id,
                    block_type: BlockType::Text,
                }),
                KeyCode::Char('J') => app.run(|id| Cmd::MoveDown { id }),
                KeyCode::Char('K') => app.run(|id| Cmd::MoveUp { id }),
                KeyCode::Char('s') => app.save(),
                _ => {}
            }
        }
    }
}

fn ui(f: &mut Frame, app: &mut App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([Constraint::Min(0), Constraint::Length(3)].as_ref())
        .split(f.area());

    let items: Vec<ListItem> = app
        .rows
        .iter()
        .map(|row| ListItem::new(vec![Line::from(vec![Span::raw(app.row_label(row))])]))
        .collect();

    let title = format!("Outline: {}", app.doc_path.display());
    let outline = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(Style::default().bg(Color::Yellow).fg(Color::Black));

    f.render_stateful_widget(outline, chunks[0], &mut app.list_state);

    // Report row geometry in outline coordinates: one row per block
    let inner = chunks[0].inner(ratatui::layout::Margin::new(1, 1));
    let offset = app.list_state.offset();
    let width = f64::from(inner.width);
    for (i, row) in app.rows.iter().enumerate() {
        let _ = app
            .editor
            .report_rect(&row.id, Rect::new(0.0, i as f64, width, 1.0));
    }
    let viewport = Rect::new(0.0, offset as f64, width, f64::from(inner.height));
    if app.editor.set_viewport(viewport).is_ok() {
        let _ = app.editor.update_viewport_blocks();
    }

    let status = Line::from(vec![
        Span::raw(format!(
            "pending: {} | sent: {} | in view: {} | ",
            app.editor.pending_operations(),
            app.sent,
            app.editor.blocks_in_viewport().len()
        )),
        Span::raw("q: Quit | j/k: Move | Tab/S-Tab: Indent | Enter: New | d: Delete | h/t: Heading/Text | J/K: Reorder | s: Save"),
    ]);
    let mut lines = vec![status];
    if !app.status.is_empty() {
        lines.push(Line::from(Span::styled(
            app.status.clone(),
            Style::default().fg(Color::Red),
        )));
    }

    f.render_widget(Paragraph::new(lines).block(Block::default()), chunks[1]);
}

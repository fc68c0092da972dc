//! Incremental render-tree patching must always agree with a full rebuild.

use std::collections::{HashMap, HashSet};

use blockdoc_engine::{
    Block, BlockContent, BlockEditor, BlockId, BlockRecord, BlockType, EditorOptions, RenderTree,
};
use pretty_assertions::assert_eq;
use rstest::rstest;

/// Small deterministic generator so failures reproduce from the seed
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn pick<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        &items[self.next() as usize % items.len()]
    }
}

fn seed_document() -> HashMap<BlockId, BlockRecord> {
    let mut data = HashMap::new();
    data.insert(
        BlockId::from("root"),
        BlockRecord::new(BlockType::Page).with_first_child("b0"),
    );
    for i in 0..6 {
        let mut record = BlockRecord::new(BlockType::Text).with_parent("root");
        if i < 5 {
            record = record.with_next(format!("b{}", i + 1));
        }
        data.insert(BlockId::from(format!("b{i}")), record);
    }
    data
}

/// `(id, type, parent, children)` for every node reachable from the root
fn projection(tree: &RenderTree) -> Vec<(BlockId, BlockType, Option<BlockId>, Vec<BlockId>)> {
    tree.flatten()
        .into_iter()
        .map(|row| {
            let node = tree.get_tree_node(&row.id).unwrap();
            (
                node.id.clone(),
                node.block_type,
                node.parent.clone(),
                node.children.clone(),
            )
        })
        .collect()
}

fn random_edit(editor: &mut BlockEditor, rng: &mut Lcg, step: usize) {
    // Detached blocks are fair targets too
    let chain = editor.chain();
    let mut ids = Vec::new();
    chain.traverse(|b| ids.push(b.id.clone()));
    for orphan in chain.orphans() {
        chain.traverse_from(orphan, |b| ids.push(b.id.clone()));
    }
    ids.sort();
    let target = rng.pick(&ids).clone();
    let other = rng.pick(&ids).clone();
    let anchor = editor
        .chain()
        .children(&other)
        .map(|b| b.id.clone())
        .collect::<Vec<_>>();
    let after = if anchor.is_empty() || rng.next() % 3 == 0 {
        None
    } else {
        Some(rng.pick(&anchor).clone())
    };

    // Rejected edits leave everything untouched, which is also worth checking
    let _ = match rng.next() % 6 {
        0 | 1 => editor.insert_block(
            Block::new(
                format!("n{step}"),
                *rng.pick(&[BlockType::Text, BlockType::List, BlockType::Heading]),
                BlockContent::text(format!("n{step}")),
            ),
            &other,
            after.as_ref(),
        ),
        2 => editor.move_block(&target, &other, after.as_ref()),
        3 => editor.delete_block(&target),
        4 => editor.update_block(&target, BlockContent::text(format!("u{step}"))),
        _ => editor.retype_block(&target, *rng.pick(&[BlockType::Text, BlockType::Code])),
    };
}

#[rstest]
#[case(1)]
#[case(7)]
#[case(42)]
#[case(2024)]
fn incremental_matches_full_rebuild(#[case] seed: u64) {
    let mut editor = BlockEditor::open("root", seed_document(), EditorOptions::default()).unwrap();
    let mut rng = Lcg(seed);

    for step in 0..200 {
        random_edit(&mut editor, &mut rng, step);

        let mut full = RenderTree::default();
        full.build_deep(editor.chain(), &BlockId::from("root"));
        assert_eq!(
            projection(editor.render_tree()),
            projection(&full),
            "diverged at step {step} (seed {seed})"
        );
        assert_eq!(
            editor.render_tree().len(),
            full.len(),
            "detached nodes cached at step {step} (seed {seed})"
        );
    }
}

#[rstest]
#[case(3)]
#[case(99)]
fn traverse_visits_reachable_blocks_once(#[case] seed: u64) {
    let mut editor = BlockEditor::open("root", seed_document(), EditorOptions::default()).unwrap();
    let mut rng = Lcg(seed);

    for step in 0..150 {
        random_edit(&mut editor, &mut rng, step);

        let mut visited = Vec::new();
        editor.chain().traverse(|b| visited.push(b.id.clone()));
        let unique: HashSet<&BlockId> = visited.iter().collect();
        assert_eq!(unique.len(), visited.len(), "duplicate visit at step {step}");

        let rows: Vec<BlockId> = editor.outline().into_iter().map(|row| row.id).collect();
        assert_eq!(rows, visited);

        // Everything is either reachable or under an orphaned subtree
        let mut detached = 0;
        for orphan in editor.chain().orphans() {
            editor.chain().traverse_from(orphan, |_| detached += 1);
        }
        assert_eq!(visited.len() + detached, editor.chain().len());
    }
}

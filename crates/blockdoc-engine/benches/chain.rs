use std::collections::HashMap;

use blockdoc_engine::{
    Block, BlockChain, BlockContent, BlockEditor, BlockId, BlockRecord, BlockType, EditorOptions,
    RenderTree,
};
use criterion::{Criterion, criterion_group, criterion_main};

/// Root with `sections` children, each holding `items` text blocks
fn generate_document(sections: usize, items: usize) -> HashMap<BlockId, BlockRecord> {
    let mut data = HashMap::new();
    data.insert(
        BlockId::from("root"),
        BlockRecord::new(BlockType::Page).with_first_child("s0"),
    );
    for s in 0..sections {
        let mut section = BlockRecord::new(BlockType::List)
            .with_parent("root")
            .with_content(BlockContent::text(format!("Section {s}")));
        if s + 1 < sections {
            section = section.with_next(format!("s{}", s + 1));
        }
        if items > 0 {
            section = section.with_first_child(format!("s{s}i0"));
        }
        data.insert(BlockId::from(format!("s{s}")), section);

        for i in 0..items {
            let mut item = BlockRecord::new(BlockType::Text)
                .with_parent(format!("s{s}"))
                .with_content(BlockContent::text("Paragraph with some content."));
            if i + 1 < items {
                item = item.with_next(format!("s{s}i{}", i + 1));
            }
            data.insert(BlockId::from(format!("s{s}i{i}")), item);
        }
    }
    data
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain");
    group.sample_size(10);
    let data = generate_document(100, 20);

    group.bench_function("rebuild", |b| {
        b.iter(|| {
            let mut chain = BlockChain::new();
            chain
                .rebuild("root", std::hint::black_box(data.clone()))
                .unwrap();
            std::hint::black_box(chain.len());
        });
    });

    group.bench_function("move_round_trip", |b| {
        let mut chain = BlockChain::new();
        chain.rebuild("root", data.clone()).unwrap();
        let item = BlockId::from("s50i10");
        let (home, away) = (BlockId::from("s50"), BlockId::from("s0"));
        let anchor = BlockId::from("s50i9");
        b.iter(|| {
            chain.move_block(&item, &away, None).unwrap();
            chain.move_block(&item, &home, Some(&anchor)).unwrap();
        });
    });

    group.bench_function("build_deep", |b| {
        let mut chain = BlockChain::new();
        chain.rebuild("root", data.clone()).unwrap();
        b.iter(|| {
            let mut tree = RenderTree::default();
            tree.build_deep(&chain, &BlockId::from("root"));
            std::hint::black_box(tree.len());
        });
    });

    group.finish();
}

fn bench_incremental(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental");
    group.sample_size(10);

    group.bench_function("insert_and_delete_through_editor", |b| {
        let mut editor =
            BlockEditor::open("root", generate_document(100, 20), EditorOptions::default())
                .unwrap();
        let parent = BlockId::from("s10");
        let after = BlockId::from("s10i5");
        b.iter(|| {
            let id = BlockId::generate();
            editor
                .insert_block(
                    Block::new(id.clone(), BlockType::Text, BlockContent::text("new")),
                    &parent,
                    Some(&after),
                )
                .unwrap();
            editor.delete_block(&id).unwrap();
            editor.acknowledge(u64::MAX).unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_chain, bench_incremental);
criterion_main!(benches);

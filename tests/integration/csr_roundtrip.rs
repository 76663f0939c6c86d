#![allow(missing_docs)]

use std::fs;

use proptest::prelude::*;
use relsage::{
    primitives::io::write_array,
    storage::{build_reverse, CsrBuilder, CsrGraph},
    types::{KgError, NodeId, RelId, Result},
};
use tempfile::tempdir;

type Edge = (NodeId, RelId, NodeId);

fn arb_graph() -> impl Strategy<Value = (u32, u32, Vec<Edge>)> {
    (1u32..24, 1u32..6).prop_flat_map(|(n, r)| {
        let edge = (1..=n, 1..=r as u16, 1..=n);
        (Just(n), Just(r), prop::collection::vec(edge, 0..80))
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn neighbors_reproduce_written_adjacency((n, r, edges) in arb_graph()) {
        let dir = tempdir().unwrap();
        let mut builder = CsrBuilder::new(n, r);
        for &(src, rel, dst) in &edges {
            builder.add_edge(src, rel, dst);
        }
        builder.write(dir.path()).unwrap();
        let graph = CsrGraph::load(dir.path()).unwrap();

        prop_assert_eq!(graph.num_nodes(), n);
        prop_assert_eq!(graph.num_edges() as usize, edges.len());
        prop_assert_eq!(graph.num_relations(), r);
        for v in 1..=n {
            let expected: Vec<(NodeId, RelId)> = edges
                .iter()
                .filter(|e| e.0 == v)
                .map(|&(_, rel, dst)| (dst, rel))
                .collect();
            let got: Vec<(NodeId, RelId)> = graph.neighbors(v).iter().collect();
            prop_assert_eq!(&got, &expected, "node {}", v);
            prop_assert_eq!(graph.out_degree(v) as usize, expected.len());
        }
        prop_assert!(graph.neighbors(0).is_empty());
        prop_assert!(graph.neighbors(n + 1).is_empty());
    }

    #[test]
    fn offsets_are_monotone_and_end_at_edge_count((n, r, edges) in arb_graph()) {
        let dir = tempdir().unwrap();
        let mut builder = CsrBuilder::new(n, r);
        for &(src, rel, dst) in &edges {
            builder.add_edge(src, rel, dst);
        }
        builder.write(dir.path()).unwrap();
        let graph = CsrGraph::load(dir.path()).unwrap();

        let offsets = graph.offsets();
        prop_assert_eq!(offsets.len(), n as usize + 2);
        for w in offsets.windows(2) {
            prop_assert!(w[0] <= w[1]);
        }
        prop_assert_eq!(offsets[n as usize + 1], graph.num_edges());
    }

    #[test]
    fn reverse_graph_flips_every_edge((n, r, edges) in arb_graph()) {
        let dir = tempdir().unwrap();
        let mut builder = CsrBuilder::new(n, r);
        for &(src, rel, dst) in &edges {
            builder.add_edge(src, rel, dst);
        }
        builder.write(dir.path()).unwrap();
        let graph = CsrGraph::load(dir.path()).unwrap();
        build_reverse(&graph).write(dir.path()).unwrap();
        let reverse = CsrGraph::load_reverse(dir.path()).unwrap();

        prop_assert_eq!(reverse.num_edges(), graph.num_edges());
        for v in 1..=n {
            let mut expected: Vec<(NodeId, RelId)> = edges
                .iter()
                .filter(|e| e.2 == v)
                .map(|&(src, rel, _)| (src, rel))
                .collect();
            let mut got: Vec<(NodeId, RelId)> = reverse.neighbors(v).iter().collect();
            expected.sort_unstable();
            got.sort_unstable();
            prop_assert_eq!(got, expected, "node {}", v);
        }
    }
}

#[test]
fn entity_and_property_ids_are_exposed() -> Result<()> {
    let dir = tempdir()?;
    let mut builder = CsrBuilder::new(3, 1);
    builder
        .add_edge(1, 1, 2)
        .add_edge(2, 1, 3)
        .add_edge(3, 1, 1)
        .entities(vec![100, 200, 300])
        .props(vec![10]);
    builder.write(dir.path())?;
    let graph = CsrGraph::load(dir.path())?;

    assert_eq!(graph.entity_of(2), 200);
    assert_eq!(graph.entity_of(0), 0);
    assert_eq!(graph.entity_of(4), 0);
    assert_eq!(graph.prop_of(1), 10);
    assert_eq!(graph.prop_of(2), 0);
    Ok(())
}

#[test]
fn missing_array_fails_the_whole_load() -> Result<()> {
    let dir = tempdir()?;
    let mut builder = CsrBuilder::new(2, 1);
    builder.add_edge(1, 1, 2);
    builder.write(dir.path())?;
    fs::remove_file(dir.path().join("rels.bin"))?;

    match CsrGraph::load(dir.path()) {
        Err(KgError::MissingFile { path }) => assert!(path.ends_with("rels.bin")),
        other => panic!("expected missing file, got {other:?}"),
    }
    Ok(())
}

#[test]
fn inconsistent_lengths_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let mut builder = CsrBuilder::new(2, 1);
    builder.add_edge(1, 1, 2).add_edge(2, 1, 1);
    builder.write(dir.path())?;

    write_array(dir.path().join("rels.bin"), &[1u16])?;
    assert!(matches!(
        CsrGraph::load(dir.path()),
        Err(KgError::Format { .. })
    ));

    write_array(dir.path().join("rels.bin"), &[1u16, 1])?;
    write_array(dir.path().join("entities.bin"), &[1u32, 2, 3])?;
    assert!(matches!(
        CsrGraph::load(dir.path()),
        Err(KgError::Format { .. })
    ));
    Ok(())
}

#[test]
fn missing_reverse_graph_is_reported() {
    let dir = tempdir().unwrap();
    assert!(matches!(
        CsrGraph::load_reverse(dir.path()),
        Err(KgError::MissingFile { .. })
    ));
}

//! Building and executing programs.

mod common;

use common::*;
use graphforge::ir::{Dimension, ElementType, Graph, Op, PartialShape, RecurrentDirection, Tensor};
use graphforge::program::{BufferKind, PrimitiveKind, ProgramBuilder};
use graphforge::{compile, CompileConfig, ErrorCategory, GraphForgeError, ImplementationRegistry};
use std::collections::BTreeMap;

fn build(graph: &Graph) -> graphforge::Program {
    let registry = ImplementationRegistry::with_defaults();
    let config = CompileConfig::new().with_device(reference_device());
    ProgramBuilder::new(&registry, &config).build(graph).unwrap()
}

fn elementwise_inputs() -> BTreeMap<String, Tensor> {
    let mut inputs = BTreeMap::new();
    inputs.insert(
        "a".to_string(),
        Tensor::new(ElementType::F32, vec![2, 3], vec![0.1, -0.4, 0.3, 1.0, -2.0, 0.0]).unwrap(),
    );
    inputs.insert(
        "b".to_string(),
        Tensor::new(ElementType::F32, vec![2, 3], vec![0.1, 0.2, -0.1, 0.5, 0.5, 0.25]).unwrap(),
    );
    inputs
}

#[test]
fn test_execute_elementwise_chain() {
    init_test_logging();
    let program = build(&elementwise_graph());
    let results = program.execute(&elementwise_inputs()).unwrap();
    let out = &results["out"];
    assert_eq!(out.shape(), &[2, 3]);
    let expected = [0.4, -0.4, 0.4, 1.0, -1.0, 0.5];
    for (a, e) in out.data().iter().zip(expected) {
        assert!((a - e).abs() < 1e-6, "{} vs {}", a, e);
    }
}

#[test]
fn test_processing_order_reads_earlier_buffers() {
    let program = build(&LstmFixture::new(RecurrentDirection::Bidirectional).graph());
    let mut written = std::collections::HashSet::new();
    for (handle, info) in program.pool().iter() {
        if matches!(info.kind, BufferKind::Constant | BufferKind::Input | BufferKind::Shared) {
            written.insert(handle);
        }
    }
    for instance in program.instances() {
        for input in &instance.inputs {
            assert!(written.contains(input), "{} reads {} too early", instance.id, input);
        }
        written.extend(instance.outputs.iter().copied());
    }
}

#[test]
fn test_memory_estimate_counts_constants_on_both_sides() {
    let program = build(&elementwise_graph());
    let (host, device) = program.estimated_device_mem_usage();
    // One f32 scalar constant; a, b, add, mul and clamp are [2,3] f32.
    assert_eq!(host, 4);
    assert_eq!(device, 4 + 5 * 24);
    assert_eq!(program.stats().memory.host_bytes, host);
}

#[test]
fn test_memory_estimate_uses_upper_bounds() {
    let mut graph = Graph::new();
    let x = graph
        .add_parameter(
            "x",
            ElementType::F32,
            PartialShape::from(vec![Dimension::bounded(1, 4), Dimension::fixed(8)]),
        )
        .unwrap();
    let y = graph
        .add_node("clamp", Op::Clamp { min: 0.0, max: 1.0 }, vec![x.into()])
        .unwrap();
    graph.add_result("y", y.into()).unwrap();
    let (host, device) = build(&graph).estimated_device_mem_usage();
    assert_eq!(host, 0);
    assert_eq!(device, 2 * 4 * 8 * 4);
}

#[test]
fn test_bounded_input_executes_at_actual_size() {
    let mut graph = Graph::new();
    let x = graph
        .add_parameter(
            "x",
            ElementType::F32,
            PartialShape::from(vec![Dimension::bounded(1, 4), Dimension::fixed(2)]),
        )
        .unwrap();
    let y = graph
        .add_node("clamp", Op::Clamp { min: 0.0, max: 1.0 }, vec![x.into()])
        .unwrap();
    graph.add_result("y", y.into()).unwrap();
    let program = build(&graph);

    let mut inputs = BTreeMap::new();
    inputs.insert(
        "x".to_string(),
        Tensor::new(ElementType::F32, vec![3, 2], vec![-1.0, 0.5, 2.0, 0.25, 0.0, 7.0]).unwrap(),
    );
    let results = program.execute(&inputs).unwrap();
    assert_eq!(results["y"].data(), &[0.0, 0.5, 1.0, 0.25, 0.0, 1.0]);
}

#[test]
fn test_missing_input_is_execution_error() {
    let program = build(&elementwise_graph());
    let mut inputs = elementwise_inputs();
    inputs.remove("b");
    let err = program.execute(&inputs).unwrap_err();
    assert!(matches!(err, GraphForgeError::Execution(_)));
    assert_eq!(err.category(), ErrorCategory::Backend);
    assert!(err.to_string().contains("'b'"));
}

#[test]
fn test_wrong_input_size_is_rejected() {
    let program = build(&elementwise_graph());
    let mut inputs = elementwise_inputs();
    inputs.insert("a".to_string(), Tensor::filled(ElementType::F32, vec![4], 1.0));
    assert!(matches!(
        program.execute(&inputs).unwrap_err(),
        GraphForgeError::Execution(_)
    ));
}

#[test]
fn test_program_ports_follow_graph() {
    let program = build(&LstmFixture::new(RecurrentDirection::Forward).graph());
    let inputs: Vec<_> = program.inputs().iter().map(|p| p.name.as_str()).collect();
    assert_eq!(inputs, ["X", "H0", "C0"]);
    let outputs: Vec<_> = program.outputs().iter().map(|p| p.name.as_str()).collect();
    assert_eq!(outputs, ["Y", "Ho", "Co"]);
    assert_eq!(program.stats().count(PrimitiveKind::LstmSeq), 1);
    assert_eq!(program.stats().count(PrimitiveKind::Input), 3);
}

#[test]
fn test_compile_runs_pipeline_first() {
    let registry = ImplementationRegistry::with_defaults();
    let config = CompileConfig::new().with_device(reference_device());
    let mut graph = dequantized_conv_graph();
    let program = compile(&mut graph, &registry, &config).unwrap();
    let conv = program.instances_of(PrimitiveKind::Convolution).next().unwrap();
    assert_eq!(conv.input_layouts.len(), 4);
    assert_eq!(program.stats().count(PrimitiveKind::Convert), 0);

    let results = program.execute(&inputs_for(&graph, 9)).unwrap();
    assert_eq!(results["out"].shape(), &[1, 3, 5, 2]);
}

#[test]
fn test_gru_sequence_executes() {
    for lbr in [false, true] {
        let graph = gru_graph(RecurrentDirection::Bidirectional, lbr);
        let program = build(&graph);
        let results = program.execute(&inputs_for(&graph, 3)).unwrap();
        assert_eq!(results["Y"].shape(), &[1, 2, 4, 2]);
        assert_eq!(results["Ho"].shape(), &[1, 2, 2]);
        // Ho is the last step of the forward direction and the first of
        // the reverse one.
        let y = results["Y"].data();
        let ho = results["Ho"].data();
        assert_eq!(&ho[0..2], &y[6..8]);
        assert_eq!(&ho[2..4], &y[8..10]);
    }
}

//! Fused and unrolled lowering of recurrent operators.

mod common;

use common::*;
use graphforge::ir::{
    Dimension, ElementType, Graph, Op, PartialShape, RecurrentAttrs, RecurrentDirection,
    SequenceAttrs, Tensor,
};
use graphforge::program::{Primitive, PrimitiveKind, ProgramBuilder};
use graphforge::{CompileConfig, ImplementationRegistry, Program};
use std::collections::BTreeMap;

fn build(graph: &Graph, unroll: bool) -> Program {
    let registry = ImplementationRegistry::with_defaults();
    let config = CompileConfig::new()
        .with_device(reference_device())
        .with_allow_new_shape_infer(!unroll);
    ProgramBuilder::new(&registry, &config).build(graph).unwrap()
}

fn assert_close(actual: &Tensor, expected: &Tensor, what: &str) {
    assert_eq!(actual.shape(), expected.shape(), "{}", what);
    for (a, e) in actual.data().iter().zip(expected.data()) {
        assert!((a - e).abs() < 1e-6, "{}: {} vs {}", what, a, e);
    }
}

#[test]
fn test_fused_lowering_emits_one_primitive() {
    let program = build(&LstmFixture::new(RecurrentDirection::Forward).graph(), false);
    let stats = program.stats();
    assert_eq!(stats.count(PrimitiveKind::LstmSeq), 1);
    assert_eq!(stats.count(PrimitiveKind::LstmCell), 0);
    assert_eq!(stats.count(PrimitiveKind::MutableData), 0);
}

#[test]
fn test_unrolled_forward_structure() {
    let program = build(&LstmFixture::new(RecurrentDirection::Forward).graph(), true);
    let stats = program.stats();
    assert_eq!(stats.count(PrimitiveKind::LstmSeq), 0);
    assert_eq!(stats.count(PrimitiveKind::FullyConnected), 1);
    assert_eq!(stats.count(PrimitiveKind::Crop), 3);
    assert_eq!(stats.count(PrimitiveKind::LstmCell), 3);
    assert_eq!(stats.count(PrimitiveKind::MutableData), 6);
    assert_eq!(stats.count(PrimitiveKind::Concatenation), 1);

    for name in ["lstm_fully_connected", "lstm0_md_write.1", "lstm0.out0", "lstm1.out1", "lstm.out1", "lstm.out2"] {
        assert!(program.find_instance(name).is_some(), "missing {}", name);
    }
    // Each cell reads the previous step's hidden state and writes its cell
    // state through a shared buffer.
    let cell = program.find_instance("lstm1.out0").unwrap();
    let previous = program.find_instance("lstm0.out0").unwrap();
    assert_eq!(cell.inputs[1], previous.outputs[0]);
    let buffer = program.find_instance("lstm1_md_write.1").unwrap();
    assert_eq!(cell.dependencies, buffer.outputs);
    let reader = program.find_instance("lstm1.out1").unwrap();
    assert_eq!(reader.outputs, buffer.outputs);
}

#[test]
fn test_unrolled_reverse_reads_time_backwards() {
    let program = build(&LstmFixture::new(RecurrentDirection::Reverse).graph(), true);
    let offsets: Vec<usize> = (0..3)
        .map(|i| match &program.find_instance(&format!("lstm{}_input", i)).unwrap().primitive {
            Primitive::Crop { axis: 1, offset, size: 1 } => *offset,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(offsets, vec![2, 1, 0]);

    // Y is concatenated in time order: last step first.
    let concat = program.find_instance("lstm.out0").unwrap();
    let steps: Vec<_> = ["lstm.out1", "lstm1.out0", "lstm0.out0"]
        .iter()
        .map(|id| program.find_instance(id).unwrap().outputs[0])
        .collect();
    assert_eq!(concat.inputs, steps);
}

#[test]
fn test_unrolled_bidirectional_structure() {
    let program = build(&LstmFixture::new(RecurrentDirection::Bidirectional).graph(), true);
    let stats = program.stats();
    assert_eq!(stats.count(PrimitiveKind::FullyConnected), 2);
    assert_eq!(stats.count(PrimitiveKind::LstmCell), 6);
    // W, R, B, H0, C0 per direction plus one crop per step.
    assert_eq!(stats.count(PrimitiveKind::Crop), 16);
    assert_eq!(stats.count(PrimitiveKind::Concatenation), 5);
    for name in ["lstm_dir0_W", "lstm_dir1_C0", "lstm_dir0.out0", "lstm_dir1.out0", "lstm.out0", "lstm.out1", "lstm.out2"] {
        assert!(program.find_instance(name).is_some(), "missing {}", name);
    }
}

#[test]
fn test_unrolled_matches_fused() {
    init_test_logging();
    for direction in [
        RecurrentDirection::Forward,
        RecurrentDirection::Reverse,
        RecurrentDirection::Bidirectional,
    ] {
        for clip in [0.0, 0.5] {
            let graph = LstmFixture::new(direction).with_clip(clip).graph();
            let inputs = inputs_for(&graph, 41);
            let fused = build(&graph, false).execute(&inputs).unwrap();
            let unrolled = build(&graph, true).execute(&inputs).unwrap();
            for name in ["Y", "Ho", "Co"] {
                assert_close(&unrolled[name], &fused[name], &format!("{:?} clip {} {}", direction, clip, name));
            }
        }
    }
}

#[test]
fn test_dynamic_input_stays_fused() {
    let fixture = LstmFixture::new(RecurrentDirection::Forward);
    let reference = fixture.graph();
    let mut graph = Graph::new();
    let x = graph
        .add_parameter(
            "X",
            ElementType::F32,
            PartialShape::from(vec![Dimension::fixed(2), Dimension::dynamic(), Dimension::fixed(4)]),
        )
        .unwrap();
    let h0 = graph
        .add_parameter("H0", ElementType::F32, PartialShape::from_static(&[2, 1, 3]))
        .unwrap();
    let c0 = graph
        .add_parameter("C0", ElementType::F32, PartialShape::from_static(&[2, 1, 3]))
        .unwrap();
    let mut inputs = vec![x.into(), h0.into(), c0.into()];
    for name in ["seq_len", "W", "R", "B"] {
        let id = reference.find_by_name(name).unwrap();
        let tensor = reference.constant_value(id.into()).unwrap().clone();
        inputs.push(graph.add_constant(name, tensor).unwrap().into());
    }
    let lstm = graph
        .add_node("lstm", Op::LstmSequence(fixture.attrs()), inputs)
        .unwrap();
    graph.add_result("Y", lstm.out(0)).unwrap();

    let program = build(&graph, true);
    assert_eq!(program.stats().count(PrimitiveKind::LstmSeq), 1);
    assert_eq!(program.stats().count(PrimitiveKind::LstmCell), 0);
}

#[test]
fn test_lstm_cell_matches_single_step_sequence() {
    let (batch, input, hidden) = (2, 4, 3);
    let cell_graph = lstm_cell_graph(batch, input, hidden);
    let program = build(&cell_graph, false);
    assert_eq!(program.stats().count(PrimitiveKind::FullyConnected), 1);
    assert_eq!(program.stats().count(PrimitiveKind::LstmCell), 1);
    assert!(program.find_instance("cell_md_write.1").is_some());

    // Same weights as a one-step forward sequence.
    let mut seq = Graph::new();
    let x = seq
        .add_parameter("X", ElementType::F32, PartialShape::from_static(&[batch, 1, input]))
        .unwrap();
    let h = seq
        .add_parameter("H", ElementType::F32, PartialShape::from_static(&[batch, 1, hidden]))
        .unwrap();
    let c = seq
        .add_parameter("C", ElementType::F32, PartialShape::from_static(&[batch, 1, hidden]))
        .unwrap();
    let lengths = seq
        .add_constant("seq_len", Tensor::from_i64(ElementType::I32, vec![batch], &[1, 1]).unwrap())
        .unwrap();
    let w = seq.add_constant("W", det_tensor(ElementType::F32, &[1, 4 * hidden, input], 21)).unwrap();
    let r = seq.add_constant("R", det_tensor(ElementType::F32, &[1, 4 * hidden, hidden], 22)).unwrap();
    let b = seq.add_constant("B", det_tensor(ElementType::F32, &[1, 4 * hidden], 23)).unwrap();
    let lstm = seq
        .add_node(
            "lstm",
            Op::LstmSequence(SequenceAttrs {
                cell: RecurrentAttrs::lstm(hidden),
                direction: RecurrentDirection::Forward,
            }),
            vec![x.into(), h.into(), c.into(), lengths.into(), w.into(), r.into(), b.into()],
        )
        .unwrap();
    seq.add_result("Ho", lstm.out(1)).unwrap();
    seq.add_result("Co", lstm.out(2)).unwrap();

    let cell_inputs = inputs_for(&cell_graph, 60);
    let seq_inputs: BTreeMap<String, Tensor> = cell_inputs
        .iter()
        .map(|(name, t)| {
            let dims = match name.as_str() {
                "X" => vec![batch, 1, input],
                _ => vec![batch, 1, hidden],
            };
            (name.clone(), t.reshaped(dims).unwrap())
        })
        .collect();

    let cell_out = program.execute(&cell_inputs).unwrap();
    let seq_out = build(&seq, false).execute(&seq_inputs).unwrap();
    assert_close(
        &cell_out["H_out"].reshaped(vec![batch, 1, hidden]).unwrap(),
        &seq_out["Ho"],
        "hidden",
    );
    assert_close(
        &cell_out["C_out"].reshaped(vec![batch, 1, hidden]).unwrap(),
        &seq_out["Co"],
        "cell",
    );
}

#[test]
fn test_short_sequence_lengths_stay_fused() {
    for direction in [RecurrentDirection::Forward, RecurrentDirection::Reverse] {
        let graph = LstmFixture::new(direction).with_seq_lengths(vec![2, 3]).graph();
        let legacy = build(&graph, true);
        assert_eq!(legacy.stats().count(PrimitiveKind::LstmSeq), 1);
        assert_eq!(legacy.stats().count(PrimitiveKind::LstmCell), 0);

        let inputs = inputs_for(&graph, 43);
        let fused = build(&graph, false).execute(&inputs).unwrap();
        let legacy = legacy.execute(&inputs).unwrap();
        for name in ["Y", "Ho", "Co"] {
            assert_close(&legacy[name], &fused[name], &format!("{:?} {}", direction, name));
        }
        // Y is [batch, dirs, seq, hidden]; batch 0 stops after two steps.
        assert!(fused["Y"].data()[6..9].iter().all(|v| *v == 0.0));
        assert!(fused["Y"].data()[15..18].iter().any(|v| *v != 0.0));
    }
}

//! Graph fixtures and deterministic tensors.

use graphforge::ir::{
    ConvolutionAttrs, ElementType, Graph, GruSequenceAttrs, Op, Output, PartialShape,
    RecurrentActivation, RecurrentAttrs, RecurrentDirection, RuntimeTag, SequenceAttrs, Tensor,
};
use std::collections::BTreeMap;

// ============================================================================
// Deterministic data
// ============================================================================

/// Values in `[-0.5, 0.5)` from a fixed LCG, so failures reproduce.
pub fn det_values(n: usize, seed: u32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
        })
        .collect()
}

pub fn det_tensor(element_type: ElementType, shape: &[usize], seed: u32) -> Tensor {
    let n = shape.iter().product();
    Tensor::new(element_type, shape.to_vec(), det_values(n, seed)).expect("fixture tensor")
}

/// Deterministic tensors for every parameter of `graph`, keyed by name.
pub fn inputs_for(graph: &Graph, seed: u32) -> BTreeMap<String, Tensor> {
    graph
        .parameters()
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let node = graph.node(*id).expect("parameter node");
            let desc = &node.outputs[0];
            let shape = desc.shape.to_shape().expect("fixture parameters are static");
            (node.name.clone(), det_tensor(desc.element_type, &shape, seed + i as u32))
        })
        .collect()
}

// ============================================================================
// Dequantized convolution
// ============================================================================

pub const CONV_IN: [usize; 4] = [1, 2, 5, 5];
pub const CONV_WEIGHTS: [usize; 4] = [3, 2, 3, 3];

pub fn conv_attrs() -> ConvolutionAttrs {
    ConvolutionAttrs {
        strides: vec![1, 2],
        pads_begin: vec![1, 0],
        pads_end: vec![1, 0],
        dilations: vec![1, 1],
        ..ConvolutionAttrs::unit(2)
    }
}

pub fn int8_weights() -> Tensor {
    let n: usize = CONV_WEIGHTS.iter().product();
    let values: Vec<i64> = (0..n as i64).map(|i| (i * 7) % 23 - 11).collect();
    Tensor::from_i64(ElementType::I8, CONV_WEIGHTS.to_vec(), &values).expect("weights")
}

pub fn zero_point() -> Tensor {
    Tensor::new(ElementType::F32, vec![3, 1, 1, 1], vec![1.0, -2.0, 0.0]).expect("zero point")
}

pub fn scale() -> Tensor {
    Tensor::new(ElementType::F32, vec![3, 1, 1, 1], vec![0.5, 0.25, 0.125]).expect("scale")
}

/// `Convert(i8 const) -> Subtract(zp) -> Multiply(scale) -> Convolution`.
pub fn dequantized_conv_graph() -> Graph {
    let mut g = Graph::new();
    let data = g
        .add_parameter("data", ElementType::F32, PartialShape::from_static(&CONV_IN))
        .unwrap();
    let weights = g.add_constant("weights", int8_weights()).unwrap();
    let convert = g
        .add_node(
            "weights/convert",
            Op::Convert {
                destination: ElementType::F32,
            },
            vec![weights.into()],
        )
        .unwrap();
    let zp = g.add_constant("zero_point", zero_point()).unwrap();
    let sub = g
        .add_node("weights/subtract", Op::Subtract, vec![convert.into(), zp.into()])
        .unwrap();
    let sc = g.add_constant("scale", scale()).unwrap();
    let mul = g
        .add_node("weights/multiply", Op::Multiply, vec![sub.into(), sc.into()])
        .unwrap();
    let conv = g
        .add_node("conv", Op::Convolution(conv_attrs()), vec![data.into(), mul.into()])
        .unwrap();
    g.add_result("out", conv.into()).unwrap();
    g
}

/// What [`dequantized_conv_graph`] should become after fusion.
pub fn compressed_conv_reference() -> Graph {
    use graphforge::ir::CompressedConvolutionAttrs;

    let mut g = Graph::new();
    let data = g
        .add_parameter("data", ElementType::F32, PartialShape::from_static(&CONV_IN))
        .unwrap();
    let weights = g.add_constant("weights", int8_weights()).unwrap();
    g.enable_tag(weights, RuntimeTag::KeepConstPrecision);
    let sc = g.add_constant("scale", scale()).unwrap();
    let zp = g.add_constant("zero_point", zero_point()).unwrap();
    let conv = g
        .add_node(
            "conv",
            Op::ConvolutionCompressed(CompressedConvolutionAttrs {
                conv: conv_attrs(),
                groups: 0,
                output_type: Some(ElementType::F32),
            }),
            vec![data.into(), weights.into(), sc.into(), zp.into()],
        )
        .unwrap();
    g.add_result("out", conv.into()).unwrap();
    g
}

// ============================================================================
// Recurrent graphs
// ============================================================================

#[derive(Debug, Clone)]
pub struct LstmFixture {
    pub batch: usize,
    pub seq: usize,
    pub input: usize,
    pub hidden: usize,
    pub direction: RecurrentDirection,
    pub clip: f32,
    pub activations: Option<Vec<RecurrentActivation>>,
    /// Per-batch lengths; every batch runs the full sequence when unset.
    pub seq_lengths: Option<Vec<i64>>,
    pub weight_seed: u32,
}

impl LstmFixture {
    pub fn new(direction: RecurrentDirection) -> Self {
        Self {
            batch: 2,
            seq: 3,
            input: 4,
            hidden: 3,
            direction,
            clip: 0.0,
            activations: None,
            seq_lengths: None,
            weight_seed: 11,
        }
    }

    pub fn with_clip(mut self, clip: f32) -> Self {
        self.clip = clip;
        self
    }

    pub fn with_activations(mut self, activations: Vec<RecurrentActivation>) -> Self {
        self.activations = Some(activations);
        self
    }

    pub fn with_seq_lengths(mut self, lengths: Vec<i64>) -> Self {
        self.seq_lengths = Some(lengths);
        self
    }

    pub fn with_weight_seed(mut self, seed: u32) -> Self {
        self.weight_seed = seed;
        self
    }

    pub fn dirs(&self) -> usize {
        self.direction.num_directions()
    }

    pub fn attrs(&self) -> SequenceAttrs {
        let mut cell = RecurrentAttrs::lstm(self.hidden).with_clip(self.clip);
        if let Some(activations) = &self.activations {
            cell = cell.with_activations(activations.clone());
        }
        SequenceAttrs {
            cell,
            direction: self.direction,
        }
    }

    pub fn lengths(&self) -> Vec<i64> {
        self.seq_lengths
            .clone()
            .unwrap_or_else(|| vec![self.seq as i64; self.batch])
    }

    /// `lstm = LSTMSequence(X, H0, C0, seq_len, W, R, B)` with results
    /// `Y`, `Ho`, `Co`.
    pub fn graph(&self) -> Graph {
        let (b, d, h) = (self.batch, self.dirs(), self.hidden);
        let mut g = Graph::new();
        let x = g
            .add_parameter("X", ElementType::F32, PartialShape::from_static(&[b, self.seq, self.input]))
            .unwrap();
        let h0 = g
            .add_parameter("H0", ElementType::F32, PartialShape::from_static(&[b, d, h]))
            .unwrap();
        let c0 = g
            .add_parameter("C0", ElementType::F32, PartialShape::from_static(&[b, d, h]))
            .unwrap();
        let lengths = g
            .add_constant(
                "seq_len",
                Tensor::from_i64(ElementType::I32, vec![b], &self.lengths()).unwrap(),
            )
            .unwrap();
        let w = g
            .add_constant("W", det_tensor(ElementType::F32, &[d, 4 * h, self.input], self.weight_seed))
            .unwrap();
        let r = g.add_constant("R", det_tensor(ElementType::F32, &[d, 4 * h, h], 12)).unwrap();
        let bias = g.add_constant("B", det_tensor(ElementType::F32, &[d, 4 * h], 13)).unwrap();
        let inputs: Vec<Output> = vec![
            x.into(),
            h0.into(),
            c0.into(),
            lengths.into(),
            w.into(),
            r.into(),
            bias.into(),
        ];
        let lstm = g.add_node("lstm", Op::LstmSequence(self.attrs()), inputs).unwrap();
        g.add_result("Y", lstm.out(0)).unwrap();
        g.add_result("Ho", lstm.out(1)).unwrap();
        g.add_result("Co", lstm.out(2)).unwrap();
        g
    }
}

/// Single `LSTMCell` with results `H` and `C`.
pub fn lstm_cell_graph(batch: usize, input: usize, hidden: usize) -> Graph {
    let mut g = Graph::new();
    let x = g
        .add_parameter("X", ElementType::F32, PartialShape::from_static(&[batch, input]))
        .unwrap();
    let h = g
        .add_parameter("H", ElementType::F32, PartialShape::from_static(&[batch, hidden]))
        .unwrap();
    let c = g
        .add_parameter("C", ElementType::F32, PartialShape::from_static(&[batch, hidden]))
        .unwrap();
    let w = g.add_constant("W", det_tensor(ElementType::F32, &[4 * hidden, input], 21)).unwrap();
    let r = g.add_constant("R", det_tensor(ElementType::F32, &[4 * hidden, hidden], 22)).unwrap();
    let bias = g.add_constant("B", det_tensor(ElementType::F32, &[4 * hidden], 23)).unwrap();
    let cell = g
        .add_node(
            "cell",
            Op::LstmCell(RecurrentAttrs::lstm(hidden)),
            vec![x.into(), h.into(), c.into(), w.into(), r.into(), bias.into()],
        )
        .unwrap();
    g.add_result("H_out", cell.out(0)).unwrap();
    g.add_result("C_out", cell.out(1)).unwrap();
    g
}

/// GRU sequence `gru(X, H0, seq_len, W, R, B)` with results `Y`, `Ho`.
pub fn gru_graph(direction: RecurrentDirection, linear_before_reset: bool) -> Graph {
    let (b, seq, input, h) = (1, 4, 3, 2);
    let d = direction.num_directions();
    let bias_blocks = if linear_before_reset { 4 } else { 3 };
    let mut g = Graph::new();
    let x = g
        .add_parameter("X", ElementType::F32, PartialShape::from_static(&[b, seq, input]))
        .unwrap();
    let h0 = g
        .add_parameter("H0", ElementType::F32, PartialShape::from_static(&[b, d, h]))
        .unwrap();
    let lengths = g
        .add_constant("seq_len", Tensor::from_i64(ElementType::I32, vec![b], &[seq as i64]).unwrap())
        .unwrap();
    let w = g.add_constant("W", det_tensor(ElementType::F32, &[d, 3 * h, input], 31)).unwrap();
    let r = g.add_constant("R", det_tensor(ElementType::F32, &[d, 3 * h, h], 32)).unwrap();
    let bias = g
        .add_constant("B", det_tensor(ElementType::F32, &[d, bias_blocks * h], 33))
        .unwrap();
    let gru = g
        .add_node(
            "gru",
            Op::GruSequence(GruSequenceAttrs {
                seq: SequenceAttrs {
                    cell: RecurrentAttrs::gru(h),
                    direction,
                },
                linear_before_reset,
            }),
            vec![x.into(), h0.into(), lengths.into(), w.into(), r.into(), bias.into()],
        )
        .unwrap();
    g.add_result("Y", gru.out(0)).unwrap();
    g.add_result("Ho", gru.out(1)).unwrap();
    g
}

// ============================================================================
// Elementwise
// ============================================================================

/// `out = clamp((a + b) * 2, -1, 1)` over `[2, 3]`.
pub fn elementwise_graph() -> Graph {
    let mut g = Graph::new();
    let a = g
        .add_parameter("a", ElementType::F32, PartialShape::from_static(&[2, 3]))
        .unwrap();
    let b = g
        .add_parameter("b", ElementType::F32, PartialShape::from_static(&[2, 3]))
        .unwrap();
    let two = g.add_constant("two", Tensor::scalar(ElementType::F32, 2.0)).unwrap();
    let add = g.add_node("add", Op::Add, vec![a.into(), b.into()]).unwrap();
    let mul = g.add_node("mul", Op::Multiply, vec![add.into(), two.into()]).unwrap();
    let clamp = g
        .add_node("clamp", Op::Clamp { min: -1.0, max: 1.0 }, vec![mul.into()])
        .unwrap();
    g.add_result("out", clamp.into()).unwrap();
    g
}

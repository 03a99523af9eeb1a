//! Recurrent cell and sequence shape rules.
//!
//! Sequence outputs use the axis order `[batch, directions, seq, hidden]`
//! for the per-step output and `[batch, directions, hidden]` for states.

use super::{expect_inputs, expect_rank};
use crate::error::ForgeResult;
use crate::ir::{
    Dimension, ElementType, GruSequenceAttrs, PartialShape, RecurrentAttrs, SequenceAttrs,
    TensorDesc,
};
use crate::shape_error;

pub const LSTM_GATES: i64 = 4;
pub const GRU_GATES: i64 = 3;
/// Activation functions per cell: `f, g, h` for LSTM and `f, g` for GRU.
pub const LSTM_ACTIVATIONS: usize = 3;
pub const GRU_ACTIVATIONS: usize = 2;

/// Dimension `axis` of `desc`, dynamic when the rank is unknown.
fn dim(desc: &TensorDesc, axis: usize) -> Dimension {
    desc.shape.dim(axis).unwrap_or_else(Dimension::dynamic)
}

fn merge_dim(node: &str, what: &str, acc: Dimension, next: Dimension) -> ForgeResult<Dimension> {
    acc.merge(&next)
        .ok_or_else(|| shape_error!(node, "{} mismatch: {} vs {}", what, acc, next))
}

fn merge_types(node: &str, inputs: &[&TensorDesc]) -> ForgeResult<ElementType> {
    let mut et = ElementType::Dynamic;
    for desc in inputs {
        et = ElementType::merge(et, desc.element_type).ok_or_else(|| {
            shape_error!(node, "recurrent inputs have mixed element types")
        })?;
    }
    Ok(et)
}

fn check_hidden(node: &str, attrs: &RecurrentAttrs, activations: usize) -> ForgeResult<Dimension> {
    if attrs.hidden_size == 0 {
        return Err(shape_error!(node, "hidden_size must be positive"));
    }
    if attrs.activations.len() != activations {
        return Err(shape_error!(
            node,
            "expected {} activations, got {}",
            activations,
            attrs.activations.len()
        ));
    }
    Ok(Dimension::fixed(attrs.hidden_size as i64))
}

/// Inputs: X `[b, in]`, H `[b, h]`, C `[b, h]`, W `[4h, in]`, R `[4h, h]`, B `[4h]`.
pub fn infer_lstm_cell(node: &str, inputs: &[TensorDesc], attrs: &RecurrentAttrs) -> ForgeResult<Vec<TensorDesc>> {
    expect_inputs(node, inputs, 6)?;
    let (x, h, c, w, r, b) = (&inputs[0], &inputs[1], &inputs[2], &inputs[3], &inputs[4], &inputs[5]);
    expect_rank(node, "X", x, 2)?;
    expect_rank(node, "initial hidden state", h, 2)?;
    expect_rank(node, "initial cell state", c, 2)?;
    expect_rank(node, "W", w, 2)?;
    expect_rank(node, "R", r, 2)?;
    expect_rank(node, "B", b, 1)?;
    let et = merge_types(node, &[x, h, c, w, r, b])?;
    let hidden = check_hidden(node, attrs, LSTM_ACTIVATIONS)?;
    let gates = hidden.mul_scalar(LSTM_GATES);

    let mut batch = dim(x, 0);
    batch = merge_dim(node, "batch", batch, dim(h, 0))?;
    batch = merge_dim(node, "batch", batch, dim(c, 0))?;
    merge_dim(node, "hidden size", hidden, dim(h, 1))?;
    merge_dim(node, "hidden size", hidden, dim(c, 1))?;
    merge_dim(node, "W gates", gates, dim(w, 0))?;
    merge_dim(node, "R gates", gates, dim(r, 0))?;
    merge_dim(node, "B gates", gates, dim(b, 0))?;
    merge_dim(node, "input size", dim(x, 1), dim(w, 1))?;
    merge_dim(node, "R hidden", hidden, dim(r, 1))?;

    let state = TensorDesc::new(et, PartialShape::Ranked(vec![batch, hidden]));
    Ok(vec![state.clone(), state])
}

struct SequenceDims {
    batch: Dimension,
    seq: Dimension,
    directions: Dimension,
    hidden: Dimension,
}

/// Checks shared by LSTM and GRU sequences. `states` are the initial state
/// inputs `[b, dirs, h]`; `weights` is `(W, R, B)`.
fn check_sequence(
    node: &str,
    x: &TensorDesc,
    states: &[&TensorDesc],
    seq_lengths: &TensorDesc,
    weights: (&TensorDesc, &TensorDesc, &TensorDesc),
    attrs: &SequenceAttrs,
    gates: i64,
    bias_gates: i64,
) -> ForgeResult<SequenceDims> {
    let (w, r, b) = weights;
    expect_rank(node, "X", x, 3)?;
    for s in states {
        expect_rank(node, "initial state", s, 3)?;
    }
    expect_rank(node, "sequence_lengths", seq_lengths, 1)?;
    expect_rank(node, "W", w, 3)?;
    expect_rank(node, "R", r, 3)?;
    expect_rank(node, "B", b, 2)?;
    if !(seq_lengths.element_type.is_integral() || seq_lengths.element_type.is_dynamic()) {
        return Err(shape_error!(node, "sequence_lengths must be integral"));
    }

    let activations = if gates == LSTM_GATES {
        LSTM_ACTIVATIONS
    } else {
        GRU_ACTIVATIONS
    };
    let hidden = check_hidden(node, &attrs.cell, activations)?;
    let directions = Dimension::fixed(attrs.direction.num_directions() as i64);

    let mut batch = dim(x, 0);
    batch = merge_dim(node, "batch", batch, dim(seq_lengths, 0))?;
    for s in states {
        batch = merge_dim(node, "batch", batch, dim(s, 0))?;
        merge_dim(node, "directions", directions, dim(s, 1))?;
        merge_dim(node, "hidden size", hidden, dim(s, 2))?;
    }
    for weight in [w, r, b] {
        merge_dim(node, "directions", directions, dim(weight, 0))?;
    }
    merge_dim(node, "W gates", hidden.mul_scalar(gates), dim(w, 1))?;
    merge_dim(node, "R gates", hidden.mul_scalar(gates), dim(r, 1))?;
    merge_dim(node, "B gates", hidden.mul_scalar(bias_gates), dim(b, 1))?;
    merge_dim(node, "input size", dim(x, 2), dim(w, 2))?;
    merge_dim(node, "R hidden", hidden, dim(r, 2))?;

    Ok(SequenceDims {
        batch,
        seq: dim(x, 1),
        directions,
        hidden,
    })
}

fn sequence_outputs(et: ElementType, dims: &SequenceDims, states: usize) -> Vec<TensorDesc> {
    let y = TensorDesc::new(
        et,
        PartialShape::Ranked(vec![dims.batch, dims.directions, dims.seq, dims.hidden]),
    );
    let state = TensorDesc::new(
        et,
        PartialShape::Ranked(vec![dims.batch, dims.directions, dims.hidden]),
    );
    let mut out = vec![y];
    out.extend(std::iter::repeat(state).take(states));
    out
}

/// Inputs: X, H0, C0, sequence_lengths, W, R, B.
pub fn infer_lstm_sequence(node: &str, inputs: &[TensorDesc], attrs: &SequenceAttrs) -> ForgeResult<Vec<TensorDesc>> {
    expect_inputs(node, inputs, 7)?;
    let et = merge_types(
        node,
        &[&inputs[0], &inputs[1], &inputs[2], &inputs[4], &inputs[5], &inputs[6]],
    )?;
    let dims = check_sequence(
        node,
        &inputs[0],
        &[&inputs[1], &inputs[2]],
        &inputs[3],
        (&inputs[4], &inputs[5], &inputs[6]),
        attrs,
        LSTM_GATES,
        LSTM_GATES,
    )?;
    Ok(sequence_outputs(et, &dims, 2))
}

/// Inputs: X, H0, sequence_lengths, W, R, B. With `linear_before_reset` the
/// bias carries a fourth block for the recurrent candidate term.
pub fn infer_gru_sequence(node: &str, inputs: &[TensorDesc], attrs: &GruSequenceAttrs) -> ForgeResult<Vec<TensorDesc>> {
    expect_inputs(node, inputs, 6)?;
    let et = merge_types(node, &[&inputs[0], &inputs[1], &inputs[3], &inputs[4], &inputs[5]])?;
    let bias_gates = if attrs.linear_before_reset {
        GRU_GATES + 1
    } else {
        GRU_GATES
    };
    let dims = check_sequence(
        node,
        &inputs[0],
        &[&inputs[1]],
        &inputs[2],
        (&inputs[3], &inputs[4], &inputs[5]),
        &attrs.seq,
        GRU_GATES,
        bias_gates,
    )?;
    Ok(sequence_outputs(et, &dims, 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::RecurrentDirection;

    fn f32s(dims: &[usize]) -> TensorDesc {
        TensorDesc::with_static(ElementType::F32, dims)
    }

    fn lstm_inputs(batch: usize, seq: usize, input: usize, hidden: usize, dirs: usize) -> Vec<TensorDesc> {
        vec![
            f32s(&[batch, seq, input]),
            f32s(&[batch, dirs, hidden]),
            f32s(&[batch, dirs, hidden]),
            TensorDesc::with_static(ElementType::I32, &[batch]),
            f32s(&[dirs, 4 * hidden, input]),
            f32s(&[dirs, 4 * hidden, hidden]),
            f32s(&[dirs, 4 * hidden]),
        ]
    }

    #[test]
    fn test_lstm_sequence_bidirectional() {
        let attrs = SequenceAttrs {
            cell: RecurrentAttrs::lstm(5),
            direction: RecurrentDirection::Bidirectional,
        };
        let out = infer_lstm_sequence("l", &lstm_inputs(2, 3, 4, 5, 2), &attrs).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].shape, PartialShape::from_static(&[2, 2, 3, 5]));
        assert_eq!(out[1].shape, PartialShape::from_static(&[2, 2, 5]));
        assert_eq!(out[2], out[1]);
    }

    #[test]
    fn test_lstm_sequence_dynamic_seq() {
        let attrs = SequenceAttrs {
            cell: RecurrentAttrs::lstm(5),
            direction: RecurrentDirection::Forward,
        };
        let mut inputs = lstm_inputs(2, 3, 4, 5, 1);
        inputs[0] = TensorDesc::new(ElementType::F32, PartialShape::from_i64(&[2, -1, 4]));
        let out = infer_lstm_sequence("l", &inputs, &attrs).unwrap();
        assert_eq!(out[0].shape, PartialShape::from_i64(&[2, 1, -1, 5]));
    }

    #[test]
    fn test_lstm_sequence_rejects_bad_gates() {
        let attrs = SequenceAttrs {
            cell: RecurrentAttrs::lstm(5),
            direction: RecurrentDirection::Forward,
        };
        let mut inputs = lstm_inputs(2, 3, 4, 5, 1);
        inputs[4] = f32s(&[1, 15, 4]);
        assert!(infer_lstm_sequence("l", &inputs, &attrs).is_err());
        let inputs = lstm_inputs(2, 3, 4, 5, 2);
        assert!(infer_lstm_sequence("l", &inputs, &attrs).is_err());
    }

    #[test]
    fn test_activation_count_is_checked() {
        use crate::ir::RecurrentActivation::{Sigmoid, Tanh};
        let lstm = |activations| SequenceAttrs {
            cell: RecurrentAttrs::lstm(5).with_activations(activations),
            direction: RecurrentDirection::Forward,
        };
        let inputs = lstm_inputs(2, 3, 4, 5, 1);
        assert!(infer_lstm_sequence("l", &inputs, &lstm(vec![Sigmoid, Tanh])).is_err());
        assert!(infer_lstm_sequence("l", &inputs, &lstm(vec![Sigmoid, Tanh, Tanh, Tanh])).is_err());

        let cell_inputs = vec![
            f32s(&[2, 4]),
            f32s(&[2, 3]),
            f32s(&[2, 3]),
            f32s(&[12, 4]),
            f32s(&[12, 3]),
            f32s(&[12]),
        ];
        let attrs = RecurrentAttrs::lstm(3).with_activations(vec![Sigmoid, Tanh]);
        assert!(infer_lstm_cell("c", &cell_inputs, &attrs).is_err());

        let gru = GruSequenceAttrs {
            seq: SequenceAttrs {
                cell: RecurrentAttrs::gru(4).with_activations(vec![Sigmoid, Tanh, Tanh]),
                direction: RecurrentDirection::Forward,
            },
            linear_before_reset: false,
        };
        let gru_inputs = vec![
            f32s(&[1, 6, 2]),
            f32s(&[1, 1, 4]),
            TensorDesc::with_static(ElementType::I64, &[1]),
            f32s(&[1, 12, 2]),
            f32s(&[1, 12, 4]),
            f32s(&[1, 12]),
        ];
        let err = infer_gru_sequence("g", &gru_inputs, &gru).unwrap_err();
        assert!(err.to_string().contains("expected 2 activations"));
    }

    #[test]
    fn test_lstm_cell() {
        let inputs = vec![
            f32s(&[2, 4]),
            f32s(&[2, 3]),
            f32s(&[2, 3]),
            f32s(&[12, 4]),
            f32s(&[12, 3]),
            f32s(&[12]),
        ];
        let out = infer_lstm_cell("c", &inputs, &RecurrentAttrs::lstm(3)).unwrap();
        assert_eq!(out[0].shape, PartialShape::from_static(&[2, 3]));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_gru_sequence() {
        let attrs = GruSequenceAttrs {
            seq: SequenceAttrs {
                cell: RecurrentAttrs::gru(4),
                direction: RecurrentDirection::Reverse,
            },
            linear_before_reset: true,
        };
        let inputs = vec![
            f32s(&[1, 6, 2]),
            f32s(&[1, 1, 4]),
            TensorDesc::with_static(ElementType::I64, &[1]),
            f32s(&[1, 12, 2]),
            f32s(&[1, 12, 4]),
            f32s(&[1, 16]),
        ];
        let out = infer_gru_sequence("g", &inputs, &attrs).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].shape, PartialShape::from_static(&[1, 1, 6, 4]));
    }
}

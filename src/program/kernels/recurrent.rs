//! LSTM and GRU reference kernels.
//!
//! The fused sequence kernels and the unrolled cell path share
//! [`lstm_project`] and [`lstm_step`], so both lowerings produce identical
//! bits.

use super::basic::dot;
use crate::error::ForgeResult;
use crate::execution_error;
use crate::ir::{
    ElementType, GruSequenceAttrs, RecurrentActivation, RecurrentAttrs, RecurrentDirection,
    SequenceAttrs, Tensor,
};
use crate::program::primitive::LstmWeightsOrder;

const LSTM_GATES: usize = 4;
const GRU_GATES: usize = 3;

/// Read access to `[dirs, gates * hidden, cols]` weights, or the same
/// weights stored as ldigo `[1, dirs, cols, gates, hidden]`.
pub(crate) struct WeightsView<'a> {
    data: &'a [f32],
    rows: usize,
    cols: usize,
    hidden: usize,
    gates: usize,
    ldigo: bool,
}

impl<'a> WeightsView<'a> {
    pub(crate) fn new(tensor: &'a Tensor, gates: usize, ldigo: bool) -> ForgeResult<Self> {
        let shape = tensor.shape();
        let (rows, cols) = match (ldigo, shape.len()) {
            (true, 5) => (shape[3] * shape[4], shape[2]),
            (false, 3) => (shape[1], shape[2]),
            (false, 2) => (shape[0], shape[1]),
            _ => return Err(execution_error!("unexpected recurrent weights shape {:?}", shape)),
        };
        if gates == 0 || rows % gates != 0 {
            return Err(execution_error!("weights rows {} are not {} gate blocks", rows, gates));
        }
        Ok(Self {
            data: tensor.data(),
            rows,
            cols,
            hidden: rows / gates,
            gates,
            ldigo,
        })
    }

    #[inline]
    fn get(&self, dir: usize, row: usize, col: usize) -> f32 {
        if self.ldigo {
            let (g, k) = (row / self.hidden, row % self.hidden);
            self.data[((dir * self.cols + col) * self.gates + g) * self.hidden + k]
        } else {
            self.data[(dir * self.rows + row) * self.cols + col]
        }
    }

    fn directions(&self) -> usize {
        let per_dir = self.rows * self.cols;
        if per_dir == 0 {
            0
        } else {
            self.data.len() / per_dir
        }
    }
}

fn activate(f: RecurrentActivation, x: f32) -> f32 {
    match f {
        RecurrentActivation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        RecurrentActivation::Tanh => x.tanh(),
        RecurrentActivation::Relu => x.max(0.0),
    }
}

fn activations(attrs: &RecurrentAttrs) -> [RecurrentActivation; 3] {
    let pick = |i: usize, default| attrs.activations.get(i).copied().unwrap_or(default);
    [
        pick(0, RecurrentActivation::Sigmoid),
        pick(1, RecurrentActivation::Tanh),
        pick(2, RecurrentActivation::Tanh),
    ]
}

#[inline]
fn clip(x: f32, threshold: f32) -> f32 {
    if threshold > 0.0 {
        x.clamp(-threshold, threshold)
    } else {
        x
    }
}

/// `W x + B` for one batch row of one direction.
pub(crate) fn lstm_project(x: &[f32], w: &WeightsView<'_>, dir: usize, bias: Option<&[f32]>) -> Vec<f32> {
    (0..w.rows)
        .map(|r| {
            let mut acc = dot(x, |j| w.get(dir, r, j));
            if let Some(b) = bias {
                acc += b[r];
            }
            acc
        })
        .collect()
}

/// One LSTM step for one batch row. `proj` is `W x + B` in `order`.
pub(crate) fn lstm_step(
    proj: &[f32],
    h_prev: &[f32],
    c_prev: &[f32],
    r: &WeightsView<'_>,
    dir: usize,
    order: LstmWeightsOrder,
    attrs: &RecurrentAttrs,
) -> (Vec<f32>, Vec<f32>) {
    let hidden = r.hidden;
    let pre: Vec<f32> = (0..r.rows)
        .map(|row| clip(proj[row] + dot(h_prev, |j| r.get(dir, row, j)), attrs.clip))
        .collect();
    let [f, g, h] = activations(attrs);
    let [oi, oo, of, oz] = order.gate_offsets();
    let mut h_next = Vec::with_capacity(hidden);
    let mut c_next = Vec::with_capacity(hidden);
    for k in 0..hidden {
        let input = activate(f, pre[oi * hidden + k]);
        let output = activate(f, pre[oo * hidden + k]);
        let forget = activate(f, pre[of * hidden + k]);
        let cell = activate(g, pre[oz * hidden + k]);
        let c = forget * c_prev[k] + input * cell;
        c_next.push(c);
        h_next.push(output * activate(h, c));
    }
    (h_next, c_next)
}

fn check_len(name: &str, t: &Tensor, expected: usize) -> ForgeResult<()> {
    if t.len() != expected {
        return Err(execution_error!("{} has {} values, expected {}", name, t.len(), expected));
    }
    Ok(())
}

/// LSTM cell over a projected input `[batch, 4 * hidden]`. Returns the new
/// hidden and cell state, each `batch * hidden` values.
pub fn lstm_cell(
    proj: &Tensor,
    h: &Tensor,
    c: &Tensor,
    r: &Tensor,
    r_ldigo: bool,
    attrs: &RecurrentAttrs,
    order: LstmWeightsOrder,
) -> ForgeResult<(Vec<f32>, Vec<f32>)> {
    let r = WeightsView::new(r, LSTM_GATES, r_ldigo)?;
    let hidden = r.hidden;
    if hidden == 0 || h.len() % hidden != 0 {
        return Err(execution_error!("lstm_cell: hidden state of {} values, hidden size {}", h.len(), hidden));
    }
    let batch = h.len() / hidden;
    check_len("lstm_cell cell state", c, batch * hidden)?;
    check_len("lstm_cell projection", proj, batch * r.rows)?;
    let mut h_out = Vec::with_capacity(batch * hidden);
    let mut c_out = Vec::with_capacity(batch * hidden);
    for b in 0..batch {
        let (hn, cn) = lstm_step(
            &proj.data()[b * r.rows..(b + 1) * r.rows],
            &h.data()[b * hidden..(b + 1) * hidden],
            &c.data()[b * hidden..(b + 1) * hidden],
            &r,
            0,
            order,
            attrs,
        );
        h_out.extend(hn);
        c_out.extend(cn);
    }
    Ok((h_out, c_out))
}

fn is_reverse(direction: RecurrentDirection, dir: usize) -> bool {
    match direction {
        RecurrentDirection::Forward => false,
        RecurrentDirection::Reverse => true,
        RecurrentDirection::Bidirectional => dir == 1,
    }
}

fn step_count(lengths: Option<&Tensor>, batch: usize, seq: usize) -> Vec<usize> {
    (0..batch)
        .map(|b| {
            lengths
                .and_then(|t| t.data().get(b))
                .map(|v| (v.max(0.0) as usize).min(seq))
                .unwrap_or(seq)
        })
        .collect()
}

/// Fused LSTM sequence.
///
/// `x [b, seq, in]`, `h0`/`c0 [b, dirs, h]`, `w [dirs, 4h, in]`,
/// `r [dirs, 4h, h]`, `bias [dirs, 4h]`. Returns `Y [b, dirs, seq, h]`,
/// `Ho [b, dirs, h]`, `Co [b, dirs, h]`. Steps past a row's sequence
/// length produce zeros and leave the state unchanged.
#[allow(clippy::too_many_arguments)]
pub fn lstm_sequence(
    x: &Tensor,
    h0: &Tensor,
    c0: &Tensor,
    lengths: Option<&Tensor>,
    w: &Tensor,
    r: &Tensor,
    bias: &Tensor,
    weights_ldigo: bool,
    attrs: &SequenceAttrs,
    order: LstmWeightsOrder,
    output_type: ElementType,
) -> ForgeResult<Vec<Tensor>> {
    let xs = x.shape();
    if xs.len() != 3 {
        return Err(execution_error!("lstm_seq input must be [batch, seq, input], got {:?}", xs));
    }
    let (batch, seq, input) = (xs[0], xs[1], xs[2]);
    let w = WeightsView::new(w, LSTM_GATES, weights_ldigo)?;
    let r = WeightsView::new(r, LSTM_GATES, weights_ldigo)?;
    let dirs = attrs.direction.num_directions();
    let hidden = r.hidden;
    if w.cols != input || w.directions() != dirs || r.directions() != dirs {
        return Err(execution_error!(
            "lstm_seq weights do not match input {} and {} directions",
            input,
            dirs
        ));
    }
    check_len("lstm_seq initial hidden", h0, batch * dirs * hidden)?;
    check_len("lstm_seq initial cell", c0, batch * dirs * hidden)?;
    check_len("lstm_seq bias", bias, dirs * w.rows)?;

    let steps = step_count(lengths, batch, seq);
    let mut y = vec![0.0f32; batch * dirs * seq * hidden];
    let mut ho = vec![0.0f32; batch * dirs * hidden];
    let mut co = vec![0.0f32; batch * dirs * hidden];
    for d in 0..dirs {
        let b_dir = &bias.data()[d * w.rows..(d + 1) * w.rows];
        for b in 0..batch {
            let state = (b * dirs + d) * hidden;
            let mut h = h0.data()[state..state + hidden].to_vec();
            let mut c = c0.data()[state..state + hidden].to_vec();
            let len = steps[b];
            for i in 0..len {
                let t = if is_reverse(attrs.direction, d) { len - 1 - i } else { i };
                let xt = &x.data()[(b * seq + t) * input..(b * seq + t + 1) * input];
                let proj = lstm_project(xt, &w, d, Some(b_dir));
                let (hn, cn) = lstm_step(&proj, &h, &c, &r, d, order, &attrs.cell);
                h = hn;
                c = cn;
                let at = ((b * dirs + d) * seq + t) * hidden;
                y[at..at + hidden].copy_from_slice(&h);
            }
            ho[state..state + hidden].copy_from_slice(&h);
            co[state..state + hidden].copy_from_slice(&c);
        }
    }
    Ok(vec![
        Tensor::new(output_type, vec![batch, dirs, seq, hidden], y)?,
        Tensor::new(output_type, vec![batch, dirs, hidden], ho)?,
        Tensor::new(output_type, vec![batch, dirs, hidden], co)?,
    ])
}

/// Fused GRU sequence, gate order `z, r, h`.
///
/// With `linear_before_reset` the bias has four blocks
/// (`z`, `r`, input `h`, recurrent `h`) and the reset gate scales the
/// recurrent projection instead of the previous state.
#[allow(clippy::too_many_arguments)]
pub fn gru_sequence(
    x: &Tensor,
    h0: &Tensor,
    lengths: Option<&Tensor>,
    w: &Tensor,
    r: &Tensor,
    bias: &Tensor,
    attrs: &GruSequenceAttrs,
    output_type: ElementType,
) -> ForgeResult<Vec<Tensor>> {
    let xs = x.shape();
    if xs.len() != 3 {
        return Err(execution_error!("gru_seq input must be [batch, seq, input], got {:?}", xs));
    }
    let (batch, seq, input) = (xs[0], xs[1], xs[2]);
    let w = WeightsView::new(w, GRU_GATES, false)?;
    let r = WeightsView::new(r, GRU_GATES, false)?;
    let dirs = attrs.seq.direction.num_directions();
    let hidden = r.hidden;
    let bias_blocks = if attrs.linear_before_reset { 4 } else { 3 };
    if w.cols != input || w.directions() != dirs {
        return Err(execution_error!("gru_seq weights do not match input {}", input));
    }
    check_len("gru_seq initial hidden", h0, batch * dirs * hidden)?;
    check_len("gru_seq bias", bias, dirs * bias_blocks * hidden)?;
    let [f, g, _] = activations(&attrs.seq.cell);
    let threshold = attrs.seq.cell.clip;

    let steps = step_count(lengths, batch, seq);
    let mut y = vec![0.0f32; batch * dirs * seq * hidden];
    let mut ho = vec![0.0f32; batch * dirs * hidden];
    for d in 0..dirs {
        let bd = &bias.data()[d * bias_blocks * hidden..(d + 1) * bias_blocks * hidden];
        for b in 0..batch {
            let state = (b * dirs + d) * hidden;
            let mut h = h0.data()[state..state + hidden].to_vec();
            let len = steps[b];
            for i in 0..len {
                let t = if is_reverse(attrs.seq.direction, d) { len - 1 - i } else { i };
                let xt = &x.data()[(b * seq + t) * input..(b * seq + t + 1) * input];
                let gx: Vec<f32> = (0..3 * hidden).map(|row| dot(xt, |j| w.get(d, row, j))).collect();
                let gh: Vec<f32> = (0..3 * hidden).map(|row| dot(&h, |j| r.get(d, row, j))).collect();
                let gate = |block: usize, k: usize| {
                    let row = block * hidden + k;
                    activate(f, clip(gx[row] + gh[row] + bd[row], threshold))
                };
                let z: Vec<f32> = (0..hidden).map(|k| gate(0, k)).collect();
                let reset: Vec<f32> = (0..hidden).map(|k| gate(1, k)).collect();
                let gated_h: Vec<f32> = h.iter().zip(&reset).map(|(hv, rv)| rv * hv).collect();
                let mut next = Vec::with_capacity(hidden);
                for k in 0..hidden {
                    let row = 2 * hidden + k;
                    let n_pre = if attrs.linear_before_reset {
                        gx[row] + bd[row] + reset[k] * (gh[row] + bd[3 * hidden + k])
                    } else {
                        gx[row] + dot(&gated_h, |j| r.get(d, row, j)) + bd[row]
                    };
                    let n = activate(g, clip(n_pre, threshold));
                    next.push((1.0 - z[k]) * n + z[k] * h[k]);
                }
                h = next;
                let at = ((b * dirs + d) * seq + t) * hidden;
                y[at..at + hidden].copy_from_slice(&h);
            }
            ho[state..state + hidden].copy_from_slice(&h);
        }
    }
    Ok(vec![
        Tensor::new(output_type, vec![batch, dirs, seq, hidden], y)?,
        Tensor::new(output_type, vec![batch, dirs, hidden], ho)?,
    ])
}

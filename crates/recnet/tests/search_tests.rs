// Beam search through the recurrent layer: hypothesis selection, backtrace
// of the accumulated outputs, ended hypotheses and length normalization.

use std::sync::Arc;

use recnet::prelude::*;

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {a:?} vs {b:?}");
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() <= tol, "{a:?} vs {b:?}");
    }
}

fn run(net: &str, config: impl FnOnce(RecConfig) -> RecConfig, parent: &ParentNetwork) -> RecOutput {
    run_with_params(net, config, parent, &ParamStore::default())
}

fn run_with_params(
    net: &str,
    config: impl FnOnce(RecConfig) -> RecConfig,
    parent: &ParentNetwork,
    params: &ParamStore,
) -> RecOutput {
    let net = LayerDesc::net_from_json(net).unwrap();
    RecLayer::new("search", config(RecConfig::subnet(net)), Arc::new(LayerRegistry::with_defaults()), parent)
        .unwrap()
        .forward(parent, params)
        .unwrap()
}

/// Scores whose best three paths are [2, 3, 1], [2, 3, 2] and [1, 3, 1].
fn four_class_scores() -> SeqData {
    step_scores(&[[-5.0, 7.0, 8.0, -4.0], [-1.0, 0.0, -2.0, 5.0], [1.0, 4.0, 3.5, -9.0]])
}

/// Log-scores per step for a single batch entry, `[T, 1, classes]`.
fn step_scores<const N: usize>(steps: &[[f32; N]]) -> SeqData {
    let flat: Vec<f32> = steps.iter().flatten().copied().collect();
    let values = Tensor::from_vec(flat, (steps.len(), 1, N), DType::F32).unwrap();
    SeqData::dense(values, vec![steps.len()]).unwrap()
}

#[test]
fn test_beam_search_with_known_length() {
    let parent = ParentNetwork::new(NetworkFlags::searching()).with_data("source", four_class_scores());
    let out = run(
        r#"{"output": {"class": "choice", "from": "data", "beam_size": 3, "input_type": "log_prob"}}"#,
        |c| c,
        &parent,
    );

    // hypotheses [2, 3, 1], [2, 3, 2], [1, 3, 1], time-major
    assert_eq!(out.output.dims(), &[3, 3]);
    assert_eq!(out.output.to_labels(), vec![2, 2, 1, 3, 3, 3, 1, 2, 1]);
    assert_eq!(out.seq_lens, vec![3, 3, 3]);
    assert_eq!(out.meta, TensorMeta::sparse(4).with_beam(Some(3)));

    let beam = out.search.unwrap();
    assert_eq!(beam.beam_size, 3);
    assert_close(&beam.scores.to_vec(), &[17.0, 16.5, 16.0], 1e-5);
    let src: Vec<Vec<usize>> = beam.src_beams.iter().map(Tensor::to_labels).collect();
    assert_eq!(src, vec![vec![0, 0, 0], vec![0, 1, 0], vec![0, 0, 1]]);

    assert_eq!(beam.best(), vec![0]);
    let (best, lens) = beam.decide(&out.output, &out.seq_lens).unwrap();
    assert_eq!(best.to_labels(), vec![2, 3, 1]);
    assert_eq!(lens, vec![3]);
}

#[test]
fn test_prev_reads_after_the_choice_follow_their_hypotheses() {
    let parent = ParentNetwork::new(NetworkFlags::searching()).with_data("source", four_class_scores());
    let out = run(
        r#"{"c":      {"class": "choice", "from": "data", "beam_size": 3, "input_type": "log_prob"},
            "output": {"class": "combine", "kind": "add", "from": ["c", "prev:output"]}}"#,
        |c| c,
        &parent,
    );

    // running label sums of [2, 3, 1], [2, 3, 2], [1, 3, 1]
    assert_eq!(out.output.dims(), &[3, 3]);
    assert_close(&out.output.to_vec(), &[2.0, 2.0, 1.0, 5.0, 5.0, 4.0, 6.0, 7.0, 5.0], 1e-6);
    let beam = out.search.unwrap();
    assert_close(&beam.scores.to_vec(), &[17.0, 16.5, 16.0], 1e-5);
}

/// `x @ w` for one row, `w` stored `[n_in, n_out]`.
fn row_matmul(x: &[f32], w: &[f32], n_out: usize) -> Vec<f32> {
    (0..n_out)
        .map(|j| x.iter().enumerate().map(|(i, v)| v * w[i * n_out + j]).sum())
        .collect()
}

#[test]
fn test_cell_state_after_the_choice_follows_its_hypothesis() {
    let parent = ParentNetwork::new(NetworkFlags::searching()).with_data("source", four_class_scores());
    let params = ParamStore::new(3);
    let out = run_with_params(
        r#"{"c":      {"class": "choice", "from": "data", "beam_size": 3, "input_type": "log_prob"},
            "output": {"class": "rnn_cell", "unit": "rnn", "from": ["c"], "n_out": 3}}"#,
        |c| c,
        &parent,
        &params,
    );
    assert_eq!(out.output.dims(), &[3, 3, 3]);

    let w_ih = params.get("output/W_ih").unwrap().unwrap().to_vec();
    let w_hh = params.get("output/W_hh").unwrap().unwrap().to_vec();
    let bias = params.get("output/b").unwrap().unwrap().to_vec();
    let got = out.output.to_vec();
    let paths = [[2usize, 3, 1], [2, 3, 2], [1, 3, 1]];
    for (slot, path) in paths.iter().enumerate() {
        let mut h = vec![0.0f32; 3];
        for (t, &label) in path.iter().enumerate() {
            let mut x = vec![0.0f32; 4];
            x[label] = 1.0;
            let a = row_matmul(&x, &w_ih, 3);
            let r = row_matmul(&h, &w_hh, 3);
            h = (0..3).map(|j| (a[j] + r[j] + bias[j]).tanh()).collect();
            let start = (t * 3 + slot) * 3;
            assert_close(&got[start..start + 3], &h, 1e-5);
        }
    }
}

#[test]
fn test_beam_search_three_classes() {
    let parent = ParentNetwork::new(NetworkFlags::searching()).with_data(
        "source",
        step_scores(&[[1.0, 2.0, 3.0], [0.0, 4.5, 6.0], [5.0, 8.0, 7.5]]),
    );
    let out = run(
        r#"{"output": {"class": "choice", "from": "data", "beam_size": 3, "input_type": "log_prob"}}"#,
        |c| c,
        &parent,
    );

    // hypotheses [2, 2, 1], [2, 2, 2], [1, 2, 1]
    assert_eq!(out.output.to_labels(), vec![2, 2, 1, 2, 2, 2, 1, 2, 1]);
    let beam = out.search.unwrap();
    assert_close(&beam.scores.to_vec(), &[17.0, 16.5, 16.0], 1e-5);
    let src: Vec<Vec<usize>> = beam.src_beams.iter().map(Tensor::to_labels).collect();
    assert_eq!(src, vec![vec![0, 0, 0], vec![0, 1, 0], vec![0, 0, 1]]);
}

#[test]
fn test_beam_search_with_ended_hypotheses() {
    let parent = ParentNetwork::new(NetworkFlags::searching()).with_data(
        "scores",
        step_scores(&[[-1.0, -2.0, -3.0, -9.0], [-0.6, -6.0, -0.5, -2.0], [-0.4, -0.6, -0.7, -1.0]]),
    );
    let out = run(
        r#"{"output": {"class": "choice", "from": "data:scores", "beam_size": 3, "input_type": "log_prob"},
            "end":    {"class": "compare", "from": "output", "value": 0}}"#,
        |c| c.with_max_seq_len(3),
        &parent,
    );

    // hypotheses [1, 2, 0], [0, 0, 0], [1, 2, 1]; label 0 ends a hypothesis
    // and is not counted in its length
    assert_eq!(out.output.to_labels(), vec![1, 0, 1, 2, 0, 2, 0, 0, 1]);
    assert_eq!(out.seq_lens, vec![2, 0, 3]);
    assert_eq!(out.steps, 3);

    // an ended hypothesis keeps its score scaled by (t + 1) / t
    let beam = out.search.unwrap();
    assert_close(&beam.scores.to_vec(), &[-2.9, -3.0, -3.1], 1e-5);
}

#[test]
fn test_beam_search_without_length_normalization() {
    let parent = ParentNetwork::new(NetworkFlags::searching()).with_data(
        "scores",
        step_scores(&[[-1.0, -2.0, -3.0, -9.0], [-0.6, -6.0, -0.5, -2.0], [-0.4, -0.6, -0.7, -1.0]]),
    );
    let out = run(
        r#"{"output": {"class": "choice", "from": "data:scores", "beam_size": 3, "input_type": "log_prob",
                       "length_normalization": false},
            "end":    {"class": "compare", "from": "output", "value": 0}}"#,
        |c| c.with_max_seq_len(3),
        &parent,
    );

    // hypotheses [0, 0, 0], [1, 0, 0], [1, 2, 0]: ended ones keep their
    // unscaled score, so the earliest end wins
    assert_eq!(out.output.to_labels(), vec![0, 1, 1, 0, 0, 2, 0, 0, 0]);
    assert_eq!(out.seq_lens, vec![0, 1, 2]);
    let beam = out.search.unwrap();
    assert_close(&beam.scores.to_vec(), &[-1.0, -2.6, -2.9], 1e-5);
}

#[test]
fn test_decoder_search_smoke() {
    let net = r#"{
        "output":       {"class": "choice", "from": ["output_prob"], "target": "classes", "beam_size": 4},
        "end":          {"class": "compare", "from": ["output"], "value": 0},
        "target_embed": {"class": "linear", "from": ["output"], "n_out": 6},
        "s":            {"class": "rnn_cell", "unit": "lstm", "from": ["target_embed", "ctx"],
                         "n_out": 10},
        "prev_s_state": {"class": "get_last_hidden_state", "from": ["prev:s"], "n_out": 20},
        "ctx":          {"class": "linear", "from": ["prev_s_state", "base:encoder"], "n_out": 8},
        "readout_in":   {"class": "linear", "from": ["prev:s", "prev:target_embed", "ctx"], "n_out": 10},
        "readout":      {"class": "activation", "from": ["readout_in"], "activation": "tanh"},
        "output_prob":  {"class": "softmax", "from": ["readout"], "target": "classes"}
    }"#;
    let encoder = Tensor::from_vec(
        vec![0.1, -0.2, 0.3, 0.0, 0.5, -0.4, 0.2, 0.0, 0.1, 0.9],
        (2, 5),
        DType::F32,
    )
    .unwrap();
    let parent = ParentNetwork::new(NetworkFlags::searching())
        .with_data_meta("classes", TensorMeta::sparse(5))
        .with_layer("encoder", LayerValue::dense(encoder).unwrap());
    let out = run(net, |c| c.with_target("classes").with_max_seq_len(6), &parent);

    assert_eq!(out.seq_lens.len(), 8);
    assert!(out.steps <= 6);
    assert!(out.seq_lens.iter().all(|&n| n <= 6));
    assert_eq!(out.output.dims()[1], 8);
    assert_eq!(out.output.dims()[0], out.seq_lens.iter().copied().max().unwrap());

    let beam = out.search.unwrap();
    assert_eq!(beam.scores.dims(), &[2, 4]);
    for row in beam.scores.to_vec().chunks(4) {
        assert!(row.windows(2).all(|w| w[0] >= w[1]), "scores not sorted: {row:?}");
    }
    assert_eq!(beam.src_beams.len(), out.steps);
    let (best, lens) = beam.decide(&out.output, &out.seq_lens).unwrap();
    assert_eq!(best.dims()[1], 2);
    assert_eq!(lens.len(), 2);
}

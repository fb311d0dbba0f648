// Template and loop-partition tests: which layers run per step, which
// run before or after the loop, and the configuration errors found while
// building.

use std::collections::BTreeSet;
use std::sync::Arc;

use recnet::prelude::*;

fn decoder_net() -> NetDict {
    LayerDesc::net_from_json(
        r#"{
            "output":       {"class": "choice", "from": ["output_prob"], "target": "classes",
                             "beam_size": 4, "initial_output": 0},
            "end":          {"class": "compare", "from": ["output"], "value": 0},
            "target_embed": {"class": "linear", "from": ["output"], "n_out": 6},
            "s":            {"class": "rnn_cell", "unit": "lstm", "from": ["target_embed", "ctx"],
                             "n_out": 10},
            "prev_s_state": {"class": "get_last_hidden_state", "from": ["prev:s"], "n_out": 20},
            "ctx":          {"class": "linear", "from": ["prev_s_state", "base:encoder"], "n_out": 8},
            "readout_in":   {"class": "linear", "from": ["prev:s", "prev:target_embed", "ctx"], "n_out": 10},
            "readout":      {"class": "activation", "from": ["readout_in"], "activation": "tanh"},
            "output_prob":  {"class": "softmax", "from": ["readout"], "loss": "ce", "target": "classes"}
        }"#,
    )
    .unwrap()
}

fn encoder() -> LayerValue {
    LayerValue::dense(Tensor::ones((2, 5), DType::F32)).unwrap()
}

fn training_net() -> ParentNetwork {
    ParentNetwork::new(NetworkFlags::training())
        .with_data("classes", SeqData::labels(&[vec![1, 2, 3], vec![2, 1]], 4).unwrap())
        .with_layer("encoder", encoder())
}

fn search_net() -> ParentNetwork {
    ParentNetwork::new(NetworkFlags::searching())
        .with_data_meta("classes", TensorMeta::sparse(4))
        .with_layer("encoder", encoder())
}

fn names(xs: &[&str]) -> BTreeSet<String> {
    xs.iter().map(|s| s.to_string()).collect()
}

fn build(config: RecConfig, net: &ParentNetwork) -> Result<RecLayer> {
    RecLayer::new("dec", config, Arc::new(LayerRegistry::with_defaults()), net)
}

// Partition

#[test]
fn test_decoder_partition_training() {
    let config = RecConfig::subnet(decoder_net()).with_target("classes");
    let layer = build(config, &training_net()).unwrap();
    let p = layer.partition();
    assert_eq!(p.in_loop, names(&["ctx", "prev_s_state", "s"]));
    assert_eq!(p.moved_in, names(&["output", "target_embed"]));
    assert_eq!(p.moved_out, names(&["output_prob", "readout", "readout_in"]));
    assert!(p.is_disjoint());
    assert_eq!(p.placement("end"), None);
    assert_eq!(p.placement("s"), Some(Placement::InLoop));
    assert!(!layer.has_dynamic_length());
    assert_eq!(layer.graph().choice(), None);
}

#[test]
fn test_decoder_partition_search_keeps_everything_in_loop() {
    let config = RecConfig::subnet(decoder_net())
        .with_target("classes")
        .with_max_seq_len(5);
    let layer = build(config, &search_net()).unwrap();
    let p = layer.partition();
    assert!(p.moved_in.is_empty());
    assert!(p.moved_out.is_empty());
    assert_eq!(
        p.in_loop,
        names(&[
            "ctx",
            "end",
            "output",
            "output_prob",
            "prev_s_state",
            "readout",
            "readout_in",
            "s",
            "target_embed"
        ])
    );
    assert!(layer.has_dynamic_length());

    let graph = layer.graph();
    assert_eq!(graph.choice(), Some("output"));
    assert!(graph.depends_on_choice("target_embed"));
    assert!(graph.depends_on_choice("end"));
    assert!(graph.depends_on_choice("s"));
    assert!(graph.get("s").unwrap().has_search_choice);
    assert!(!graph.depends_on_choice("ctx"));
    assert!(!graph.depends_on_choice("readout_in"));
    assert!(!graph.depends_on_choice("output_prob"));
    assert_eq!(layer.output_meta().unwrap(), &TensorMeta::sparse(4).with_beam(Some(4)));
}

#[test]
fn test_partition_without_optimization() {
    let config = RecConfig::subnet(decoder_net())
        .with_target("classes")
        .with_optimize(false);
    let layer = build(config, &training_net()).unwrap();
    let p = layer.partition();
    assert!(p.moved_in.is_empty());
    assert!(p.moved_out.is_empty());
    assert_eq!(
        p.in_loop,
        names(&["ctx", "output", "output_prob", "prev_s_state", "readout", "readout_in", "s", "target_embed"])
    );
}

#[test]
fn test_constant_moves_in() {
    let net = LayerDesc::net_from_json(
        r#"{
            "one":    {"class": "constant", "value": 1.0},
            "output": {"class": "combine", "kind": "add", "from": ["prev:output", "one"]}
        }"#,
    )
    .unwrap();
    let data = ParentNetwork::new(NetworkFlags::default()).with_data(
        "source",
        SeqData::dense(Tensor::zeros((3, 1, 2), DType::F32), vec![3]).unwrap(),
    );
    let layer = build(RecConfig::subnet(net), &data).unwrap();
    let p = layer.partition();
    assert_eq!(p.moved_in, names(&["one"]));
    assert_eq!(p.in_loop, names(&["output"]));
}

// Templates

#[test]
fn test_templates_resolve_through_prev_references() {
    let config = RecConfig::subnet(decoder_net()).with_target("classes");
    let layer = build(config, &training_net()).unwrap();
    let graph = layer.graph();
    assert_eq!(graph.get("ctx").unwrap().meta, TensorMeta::dense(8));
    assert_eq!(graph.get("s").unwrap().meta, TensorMeta::dense(10));
    assert_eq!(graph.get("output_prob").unwrap().meta, TensorMeta::dense(4));
    assert_eq!(graph.get("output").unwrap().meta, TensorMeta::sparse(4));
    assert_eq!(graph.get("prev_s_state").unwrap().meta, TensorMeta::dense(20));
    assert_eq!(graph.get("readout_in").unwrap().meta, TensorMeta::dense(10));
    assert!(graph.get("s").unwrap().has_state);
    assert!(!graph.get("s").unwrap().position_wise);
    assert_eq!(graph.prev_needed(), &names(&["s", "target_embed"]));
    assert_eq!(graph.loss_layers().len(), 1);
    assert!(graph.unused().is_empty());
}

#[test]
fn test_deferred_templates_settle_on_final_metadata() {
    // `a` is first inferred from a placeholder for `prev:output`
    let n = net(
        r#"{"output": {"class": "linear", "from": ["a"], "n_out": 3},
            "a":      {"class": "copy", "from": ["prev:output", "data"]},
            "b":      {"class": "linear", "from": ["data"], "n_out": 2}}"#,
    );
    let parent = source_net(NetworkFlags::default());
    let layer = build(RecConfig::subnet(n), &parent).unwrap();
    let graph = layer.graph();
    assert_eq!(graph.get("a").unwrap().meta, TensorMeta::dense(7));
    assert_eq!(graph.get("output").unwrap().meta, TensorMeta::dense(3));
    assert!(graph.get("b").is_err());
    assert_eq!(graph.unused(), &["b".to_string()]);

    let params = ParamStore::new(4);
    let out = layer.forward(&parent, &params).unwrap();
    assert_eq!(out.output.dims(), &[3, 2, 3]);
    assert_eq!(params.get("output/W").unwrap().unwrap().dims(), &[7, 3]);
}

#[test]
fn test_topo_order_puts_dependencies_first() {
    let config = RecConfig::subnet(decoder_net())
        .with_target("classes")
        .with_max_seq_len(5);
    let layer = build(config, &search_net()).unwrap();
    let order = layer.graph().topo_order(&layer.partition().in_loop, false).unwrap();
    let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
    assert!(pos("prev_s_state") < pos("ctx"));
    assert!(pos("ctx") < pos("readout_in"));
    assert!(pos("ctx") < pos("s"));
    assert!(pos("target_embed") < pos("s"));
    assert!(pos("output_prob") < pos("output"));
    assert!(pos("output") < pos("target_embed"));
    assert!(pos("output") < pos("end"));
}

// Configuration errors

fn source_net(flags: NetworkFlags) -> ParentNetwork {
    ParentNetwork::new(flags).with_data(
        "source",
        SeqData::dense(Tensor::ones((3, 2, 4), DType::F32), vec![3, 2]).unwrap(),
    )
}

fn net(json: &str) -> NetDict {
    LayerDesc::net_from_json(json).unwrap()
}

#[test]
fn test_missing_output_layer() {
    let n = net(r#"{"x": {"class": "copy", "from": "data"}}"#);
    let err = build(RecConfig::subnet(n), &source_net(NetworkFlags::default())).err().unwrap();
    assert!(matches!(err, Error::MissingOutputLayer));
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn test_missing_end_layer() {
    let n = net(r#"{"output": {"class": "linear", "from": "prev:output", "n_out": 3}}"#);
    let err = build(RecConfig::subnet(n), &ParentNetwork::new(NetworkFlags::default()))
        .err()
        .unwrap();
    assert!(matches!(err, Error::MissingEndLayer));
}

fn counter_net() -> NetDict {
    net(r#"{"output": {"class": "combine", "from": ["prev:output", "base:inc"]},
            "end": {"class": "compare", "from": "output", "kind": "greater", "value": 1}}"#)
}

fn counter_parent() -> ParentNetwork {
    ParentNetwork::new(NetworkFlags::default())
        .with_layer("inc", LayerValue::dense(Tensor::ones(2, DType::F32)).unwrap())
}

#[test]
fn test_missing_max_seq_len() {
    let err = build(RecConfig::subnet(counter_net()), &counter_parent()).err().unwrap();
    assert!(matches!(err, Error::MissingMaxSeqLen));
}

#[test]
fn test_backward_needs_known_lengths() {
    let config = RecConfig::subnet(counter_net())
        .with_max_seq_len(4)
        .with_direction(Direction::Backward);
    let err = build(config, &counter_parent()).err().unwrap();
    assert!(matches!(err, Error::InvalidOption { ref option, .. } if option == "direction"));
}

#[test]
fn test_unknown_references() {
    let flags = NetworkFlags::default();
    let n = net(r#"{"output": {"class": "copy", "from": "nope"}}"#);
    let err = build(RecConfig::subnet(n), &source_net(flags)).err().unwrap();
    assert!(matches!(err, Error::UnresolvedLayer { ref name, .. } if name == "nope"));

    let n = net(r#"{"output": {"class": "copy", "from": "base:enc"}}"#);
    let err = build(RecConfig::subnet(n), &source_net(flags)).err().unwrap();
    assert!(matches!(err, Error::UnresolvedLayer { .. }));

    let n = net(r#"{"output": {"class": "copy", "from": "data:features"}}"#);
    let err = build(RecConfig::subnet(n), &source_net(flags)).err().unwrap();
    assert!(matches!(err, Error::MissingData { ref key } if key == "features"));
    assert_eq!(err.kind(), ErrorKind::Data);

    let n = net(r#"{"output": {"class": "conv", "from": "data"}}"#);
    let err = build(RecConfig::subnet(n), &source_net(flags)).err().unwrap();
    assert!(matches!(err, Error::UnknownLayerKind { ref kind } if kind == "conv"));
}

#[test]
fn test_end_must_be_a_flag() {
    let n = net(
        r#"{"output": {"class": "linear", "from": "data", "n_out": 3},
            "end": {"class": "linear", "from": "output", "n_out": 1}}"#,
    );
    let err = build(RecConfig::subnet(n).with_max_seq_len(3), &source_net(NetworkFlags::default()))
        .err()
        .unwrap();
    assert!(matches!(err, Error::TemplateMismatch { ref layer, .. } if layer == "end"));
    assert_eq!(err.kind(), ErrorKind::Contract);
}

#[test]
fn test_multiple_choices() {
    let n = net(
        r#"{"first":  {"class": "choice", "from": "data", "beam_size": 2, "input_type": "log_prob"},
            "output": {"class": "choice", "from": "first", "beam_size": 2, "input_type": "log_prob"}}"#,
    );
    let err = build(RecConfig::subnet(n), &source_net(NetworkFlags::searching()))
        .err()
        .unwrap();
    match err {
        Error::MultipleChoices { layers } => assert_eq!(layers, vec!["first".to_string(), "output".to_string()]),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn test_cycle_within_a_step() {
    let n = net(
        r#"{"output": {"class": "copy", "from": "a"},
            "a": {"class": "copy", "from": "b"},
            "b": {"class": "copy", "from": "a"}}"#,
    );
    let parent = source_net(NetworkFlags::default());
    let params = ParamStore::new(0);
    let err = build(RecConfig::subnet(n), &parent)
        .and_then(|layer| layer.forward(&parent, &params))
        .err()
        .unwrap();
    assert!(matches!(err, Error::CyclicDependency { .. }));
}

#[test]
fn test_last_hidden_state_needs_a_stateful_source() {
    let n = net(
        r#"{"h":      {"class": "linear", "from": "data", "n_out": 3},
            "output": {"class": "get_last_hidden_state", "from": ["prev:h"], "n_out": 3}}"#,
    );
    let err = build(RecConfig::subnet(n), &source_net(NetworkFlags::default())).err().unwrap();
    assert!(matches!(err, Error::InvalidOption { ref option, .. } if option == "from"));
}

#[test]
fn test_step_index_is_never_moved() {
    let n = net(r#"{"output": {"class": "copy", "from": [":i"]}}"#);
    let layer = build(RecConfig::subnet(n), &source_net(NetworkFlags::default())).unwrap();
    let p = layer.partition();
    assert_eq!(p.placement(":i"), Some(Placement::InLoop));
    assert_eq!(p.placement("output"), Some(Placement::MovedOut));
    assert_eq!(layer.graph().get(":i").unwrap().meta, TensorMeta::dense(()).with_dtype(DType::I32));
}

#[test]
fn test_config_from_json() {
    let config = RecConfig::from_json(
        r#"{"unit": {"output": {"class": "linear", "from": "data", "n_out": 2}},
            "optimize_move_layers_out": false, "source": "features"}"#,
    )
    .unwrap();
    assert!(!config.optimize_move_layers_out);
    let parent = ParentNetwork::new(NetworkFlags::default()).with_data(
        "features",
        SeqData::dense(Tensor::ones((2, 1, 3), DType::F32), vec![2]).unwrap(),
    );
    let layer = build(config, &parent).unwrap();
    assert_eq!(layer.partition().in_loop, names(&["output"]));
    assert_eq!(layer.output_meta().unwrap(), &TensorMeta::dense(2));
}

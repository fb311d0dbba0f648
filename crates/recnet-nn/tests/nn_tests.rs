// Layer catalog tests: beam step, losses, parameters and the built-in kinds

use std::sync::Arc;

use recnet_core::{DType, Error, ErrorKind, Shape, Tensor, TensorMeta};
use recnet_nn::*;

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {a:?} vs {b:?}");
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() <= tol, "{a:?} vs {b:?}");
    }
}

fn no_lookup(r: &LayerRef) -> recnet_core::Result<Tensor> {
    Err(Error::msg(format!("unexpected lookup of {r}")))
}

// Beam step

#[test]
fn test_beam_step_first_step() {
    // batch 1, beam 2, 3 classes; both rows are copies, only the first is read
    let scores_in = [1.0, 3.0, 2.0, 9.0, 9.0, 9.0];
    let step = beam_step(BeamStepInput {
        scores_base: &[0.0],
        scores_in: &scores_in,
        ended: None,
        batch: 1,
        beam_in: 1,
        beam_size: 2,
        dim: 3,
        step: 0,
        length_normalization: true,
    })
    .unwrap();
    assert_eq!(step.labels, vec![1, 2]);
    assert_eq!(step.src_beams, vec![0, 0]);
    assert_close(&step.scores, &[3.0, 2.0], 1e-6);
}

#[test]
fn test_beam_step_ended_hypothesis() {
    // hypothesis 1 has ended: it can only continue with label 0 at no cost,
    // after its score is rescaled by (t + 1) / t = 1.5
    let scores_in = [-2.5, -3.0, -4.0, -9.0, -9.0, -9.0];
    let ended = [false, true];
    let step = beam_step(BeamStepInput {
        scores_base: &[-1.0, -2.0],
        scores_in: &scores_in,
        ended: Some(&ended),
        batch: 1,
        beam_in: 2,
        beam_size: 2,
        dim: 3,
        step: 2,
        length_normalization: true,
    })
    .unwrap();
    assert_eq!(step.labels, vec![0, 0]);
    assert_eq!(step.src_beams, vec![1, 0]);
    assert_close(&step.scores, &[-3.0, -3.5], 1e-6);
}

#[test]
fn test_beam_step_rejects_bad_sizes() {
    let input = BeamStepInput {
        scores_base: &[0.0, 0.0, 0.0],
        scores_in: &[0.0; 6],
        ended: None,
        batch: 1,
        beam_in: 3,
        beam_size: 2,
        dim: 3,
        step: 1,
        length_normalization: false,
    };
    assert!(beam_step(input).is_err());

    let too_wide = BeamStepInput {
        scores_base: &[0.0],
        scores_in: &[0.0; 8],
        ended: None,
        batch: 1,
        beam_in: 1,
        beam_size: 4,
        dim: 2,
        step: 0,
        length_normalization: false,
    };
    assert!(beam_step(too_wide).is_err());
}

#[test]
fn test_length_norm_factor() {
    assert_eq!(length_norm_factor(0), 1.0);
    assert_eq!(length_norm_factor(1), 2.0);
    assert!((length_norm_factor(3) - 4.0 / 3.0).abs() < 1e-6);
}

#[test]
fn test_filter_ended_scores() {
    assert_eq!(filter_ended_scores(&[-1.0, -2.0], false), vec![-1.0, -2.0]);
    let filtered = filter_ended_scores(&[-1.0, -2.0, -3.0], true);
    assert_eq!(filtered[0], 0.0);
    assert!(filtered[1..].iter().all(|&s| s <= search::ENDED_CANDIDATE_SCORE));
}

#[test]
fn test_source_rows() {
    let choice = BeamChoice::new(3, 2, &[0, 0, 1, 2, 1, 1]).unwrap();
    assert_eq!(choice.source_rows(), vec![0, 0, 1, 5, 4, 4]);
}

// Losses

#[test]
fn test_frame_loss_ce() {
    let probs = Tensor::from_vec(vec![0.6, 0.4, 0.25, 0.75], (2, 2), DType::F32).unwrap();
    let target = Tensor::from_labels(&[1, 1], 2).unwrap();
    let loss = frame_loss(LossKind::Ce, &probs, &target, 1).unwrap();
    assert_close(&loss.to_vec(), &[-(0.4f32).ln(), -(0.75f32).ln()], 1e-6);
    let err = frame_error(LossKind::Ce, &probs, &target, 1).unwrap().unwrap();
    assert_eq!(err.to_vec(), vec![1.0, 0.0]);
}

#[test]
fn test_frame_loss_mse() {
    let out = Tensor::from_vec(vec![1.0, 2.0, 0.5, 0.5], (2, 2), DType::F32).unwrap();
    let target = Tensor::zeros((2, 2), DType::F32);
    let loss = frame_loss(LossKind::Mse, &out, &target, 1).unwrap();
    assert_close(&loss.to_vec(), &[5.0, 0.5], 1e-6);
    assert!(frame_error(LossKind::Mse, &out, &target, 1).unwrap().is_none());
}

#[test]
fn test_masked_sum() {
    // [T=3, B=2]
    let frames = Tensor::from_vec(vec![1., 2., 3., 4., 5., 6.], (3, 2), DType::F32).unwrap();
    assert_eq!(masked_sum(&frames, &[1, 3]).unwrap(), 13.0);
    assert_eq!(norm_factor(&[1, 3]), 0.25);
    assert!(masked_sum(&frames, &[1, 2, 3]).is_err());
}

// Parameters

#[test]
fn test_params_independent_of_creation_order() {
    let a = ParamStore::new(7);
    let b = ParamStore::new(7);
    let a1 = a.get_or_init("x/W", (3, 4), Init::XavierUniform).unwrap();
    let a2 = a.get_or_init("y/W", (3, 4), Init::XavierUniform).unwrap();
    let b2 = b.get_or_init("y/W", (3, 4), Init::XavierUniform).unwrap();
    let b1 = b.get_or_init("x/W", (3, 4), Init::XavierUniform).unwrap();
    assert_eq!(a1.to_vec(), b1.to_vec());
    assert_eq!(a2.to_vec(), b2.to_vec());
    assert_ne!(a1.to_vec(), a2.to_vec());

    let bound = (6.0f32 / 7.0).sqrt();
    assert!(a1.to_vec().iter().all(|v| v.abs() <= bound));
    assert_eq!(a.names().unwrap(), vec!["x/W".to_string(), "y/W".to_string()]);
}

#[test]
fn test_params_shape_conflict() {
    let store = ParamStore::new(0);
    store.get_or_init("l/b", 4, Init::Zeros).unwrap();
    let err = store.get_or_init("l/b", 5, Init::Zeros).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Contract);
}

// Registry

#[test]
fn test_registry_defaults() {
    let reg = LayerRegistry::with_defaults();
    for class in [
        "copy",
        "linear",
        "softmax",
        "activation",
        "combine",
        "compare",
        "constant",
        "rnn_cell",
        "get_last_hidden_state",
        "step_info",
        "choice",
    ] {
        assert!(reg.get(class).is_ok(), "missing {class}");
    }
    let err = reg.get("conv").err().unwrap();
    assert!(matches!(err, Error::UnknownLayerKind { ref kind } if kind == "conv"));
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(reg.cells().contains("lstm"));
    assert!(matches!(reg.cells().get("gru"), Err(Error::UnknownCell { .. })));
}

#[test]
fn test_registry_custom_kind() {
    struct Twice;
    impl LayerKind for Twice {
        fn kind(&self) -> &'static str {
            "twice"
        }
        fn infer_output(&self, _ctx: &InferCtx<'_>, inputs: &[TensorMeta]) -> recnet_core::Result<TensorMeta> {
            Ok(inputs[0].clone())
        }
        fn forward(
            &self,
            _ctx: &ForwardCtx<'_>,
            inputs: &[Tensor],
            _state: Option<&LayerState>,
        ) -> recnet_core::Result<LayerOutput> {
            Ok(LayerOutput::value(inputs[0].affine(2.0, 0.0)))
        }
    }
    let mut reg = LayerRegistry::new(Arc::new(CellRegistry::with_defaults()));
    reg.register(Arc::new(Twice));
    assert!(reg.get("twice").is_ok());
    assert!(reg.get("copy").is_err());
}

// Kinds

fn infer(kind: &dyn LayerKind, name: &str, desc: &LayerDesc, inputs: &[TensorMeta]) -> recnet_core::Result<TensorMeta> {
    let ctx = InferCtx {
        name,
        desc,
        flags: NetworkFlags::default(),
        target: None,
    };
    kind.infer_output(&ctx, inputs)
}

#[test]
fn test_linear_infer() {
    let desc = LayerDesc::new("linear").with_from(["data"]).with_opt("n_out", 4);
    let meta = infer(&LinearKind, "l", &desc, &[TensorMeta::dense(3)]).unwrap();
    assert_eq!(meta, TensorMeta::dense(4));

    let no_n_out = LayerDesc::new("linear").with_from(["data"]);
    let err = infer(&LinearKind, "l", &no_n_out, &[TensorMeta::dense(3)]).unwrap_err();
    assert!(matches!(err, Error::InvalidOption { ref option, .. } if option == "n_out"));

    let bad_act = desc.clone().with_opt("activation", "swish");
    assert!(infer(&LinearKind, "l", &bad_act, &[TensorMeta::dense(3)]).is_err());
}

#[test]
fn test_linear_on_labels_is_embedding() {
    let params = ParamStore::new(3);
    let desc = LayerDesc::new("linear").with_from(["data"]).with_opt("n_out", 2);
    let meta = TensorMeta::dense(2);
    let metas = [TensorMeta::sparse(3)];
    let ctx = ForwardCtx {
        name: "emb",
        desc: &desc,
        meta: &meta,
        input_metas: &metas,
        params: &params,
        flags: NetworkFlags::default(),
        rows: 2,
        step: None,
    };
    let labels = Tensor::from_labels(&[2, 0], 2).unwrap();
    let out = LinearKind.forward(&ctx, &[labels], None).unwrap().value;
    assert_eq!(out.dims(), &[2, 2]);

    let w = params.get("emb/W").unwrap().unwrap().to_vec();
    assert_close(&out.to_vec(), &[w[4], w[5], w[0], w[1]], 1e-6);
}

#[test]
fn test_compare_and_combine() {
    let params = ParamStore::default();
    let meta = TensorMeta::flag();
    let metas = [TensorMeta::sparse(4)];
    let desc = LayerDesc::new("compare").with_from(["output"]).with_opt("value", 0);
    assert_eq!(infer(&CompareKind, "end", &desc, &metas).unwrap(), TensorMeta::flag());
    let ctx = ForwardCtx {
        name: "end",
        desc: &desc,
        meta: &meta,
        input_metas: &metas,
        params: &params,
        flags: NetworkFlags::default(),
        rows: 3,
        step: None,
    };
    let labels = Tensor::from_labels(&[0, 2, 0], 3).unwrap();
    let out = CompareKind.forward(&ctx, &[labels], None).unwrap().value;
    assert_eq!(out.dtype(), DType::Bool);
    assert_eq!(out.to_bools(), vec![true, false, true]);

    let desc = LayerDesc::new("combine").with_from(["a", "b"]).with_opt("kind", "sub");
    let metas = [TensorMeta::dense(()), TensorMeta::dense(())];
    let meta = infer(&CombineKind, "c", &desc, &metas).unwrap();
    let ctx = ForwardCtx {
        name: "c",
        desc: &desc,
        meta: &meta,
        input_metas: &metas,
        params: &params,
        flags: NetworkFlags::default(),
        rows: 2,
        step: None,
    };
    let a = Tensor::from_vec(vec![3.0, 1.0], 2, DType::F32).unwrap();
    let b = Tensor::from_vec(vec![1.0, 0.5], 2, DType::F32).unwrap();
    let out = CombineKind.forward(&ctx, &[a, b], None).unwrap().value;
    assert_eq!(out.to_vec(), vec![2.0, 0.5]);
}

#[test]
fn test_constant_has_no_dependencies() {
    let desc = LayerDesc::new("constant").with_opt("value", 1.5).with_opt("shape", vec![2]);
    assert!(ConstantKind
        .dependencies("one", &desc, NetworkFlags::default())
        .unwrap()
        .is_empty());
    let meta = infer(&ConstantKind, "one", &desc, &[]).unwrap();
    assert_eq!(meta.feature_shape, Shape::from(2));
}

#[test]
fn test_rnn_cell_step() {
    let params = ParamStore::new(11);
    let reg = LayerRegistry::with_defaults();
    let kind = reg.get("rnn_cell").unwrap();
    let desc = LayerDesc::new("rnn_cell")
        .with_from(["data"])
        .with_opt("unit", "rnn")
        .with_opt("n_out", 2);
    let metas = [TensorMeta::dense(3)];
    let meta = infer(kind.as_ref(), "s", &desc, &metas).unwrap();
    assert_eq!(meta, TensorMeta::dense(2));
    assert!(kind.has_state(&desc, NetworkFlags::default()));
    assert!(!kind.position_wise(&desc, NetworkFlags::default()));

    let init = InitCtx {
        name: "s",
        desc: &desc,
        meta: &meta,
        params: &params,
        flags: NetworkFlags::default(),
        batch: 1,
        rows: 1,
        lookup: &no_lookup,
    };
    let state = kind.initial_state(&init).unwrap();
    assert_eq!(state.get("h").unwrap().to_vec(), vec![0.0, 0.0]);

    let ctx = ForwardCtx {
        name: "s",
        desc: &desc,
        meta: &meta,
        input_metas: &metas,
        params: &params,
        flags: NetworkFlags::default(),
        rows: 1,
        step: None,
    };
    let x = Tensor::from_vec(vec![1.0, -1.0, 0.5], (1, 3), DType::F32).unwrap();
    let out = kind.forward(&ctx, &[x], Some(&state)).unwrap();

    // h0 = 0: h1 = tanh(x W_ih + b)
    let w = params.get("s/W_ih").unwrap().unwrap().to_vec();
    let b = params.get("s/b").unwrap().unwrap().to_vec();
    let xs = [1.0f32, -1.0, 0.5];
    let expected: Vec<f32> = (0..2)
        .map(|j| (0..3).map(|i| xs[i] * w[i * 2 + j]).sum::<f32>() + b[j])
        .map(f32::tanh)
        .collect();
    assert_close(&out.value.to_vec(), &expected, 1e-5);
    assert_close(&out.state.unwrap().get("h").unwrap().to_vec(), &expected, 1e-5);
}

#[test]
fn test_lstm_state_keys_and_learned_initial_state() {
    let params = ParamStore::new(0);
    let reg = LayerRegistry::with_defaults();
    let kind = reg.get("rnn_cell").unwrap();
    let desc = LayerDesc::new("rnn_cell")
        .with_from(["data"])
        .with_opt("unit", "lstm")
        .with_opt("n_out", 3)
        .with_opt("initial_state", "var");
    let meta = TensorMeta::dense(3);
    let init = InitCtx {
        name: "enc",
        desc: &desc,
        meta: &meta,
        params: &params,
        flags: NetworkFlags::default(),
        batch: 2,
        rows: 4,
        lookup: &no_lookup,
    };
    let state = kind.initial_state(&init).unwrap();
    let keys: Vec<&String> = state.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["c", "h"]);
    assert_eq!(state.get("c").unwrap().dims(), &[4, 3]);
    assert!(params.get("enc/initial_c").unwrap().is_some());
    assert!(params.get("enc/initial_h").unwrap().is_some());
}

#[test]
fn test_layer_state_flatten_in_key_order() {
    let state = LayerState::new()
        .with("h", Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], (2, 2), DType::F32).unwrap())
        .with("c", Tensor::from_vec(vec![5.0, 6.0], (2, 1), DType::F32).unwrap());
    let flat = state.flatten().unwrap();
    assert_eq!(flat.dims(), &[2, 3]);
    assert_eq!(flat.to_vec(), vec![5.0, 1.0, 2.0, 6.0, 3.0, 4.0]);
    assert!(LayerState::new().flatten().is_err());
}

fn forward_ctx<'a>(
    name: &'a str,
    desc: &'a LayerDesc,
    meta: &'a TensorMeta,
    params: &'a ParamStore,
    rows: usize,
    step: Option<&'a StepInfo>,
) -> ForwardCtx<'a> {
    ForwardCtx {
        name,
        desc,
        meta,
        input_metas: &[],
        params,
        flags: NetworkFlags::default(),
        rows,
        step,
    }
}

#[test]
fn test_last_hidden_state_combines_sources() {
    let params = ParamStore::default();
    let kind = LastHiddenStateKind;
    assert!(kind.reads_hidden_state());
    let concat = LayerDesc::new("get_last_hidden_state")
        .with_from(["prev:s", "prev:t"])
        .with_opt("n_out", 4);
    let meta = infer(&kind, "h", &concat, &[TensorMeta::dense(2), TensorMeta::dense(2)]).unwrap();
    assert_eq!(meta, TensorMeta::dense(4));
    assert!(!kind.position_wise(&concat, NetworkFlags::default()));

    let a = Tensor::from_vec(vec![1.0, 2.0], (1, 2), DType::F32).unwrap();
    let b = Tensor::from_vec(vec![3.0, 4.0], (1, 2), DType::F32).unwrap();
    let out = kind
        .forward(&forward_ctx("h", &concat, &meta, &params, 1, None), &[a.clone(), b.clone()], None)
        .unwrap();
    assert_eq!(out.value.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);

    let add = concat.clone().with_opt("combine", "add").with_opt("n_out", 2);
    let meta = TensorMeta::dense(2);
    let out = kind
        .forward(&forward_ctx("h", &add, &meta, &params, 1, None), &[a.clone(), b], None)
        .unwrap();
    assert_eq!(out.value.to_vec(), vec![4.0, 6.0]);

    // wrong width
    let meta = TensorMeta::dense(5);
    let err = kind
        .forward(&forward_ctx("h", &concat, &meta, &params, 1, None), &[a], None)
        .err()
        .unwrap();
    assert!(matches!(err, Error::TemplateMismatch { .. }));

    let bad = concat.with_opt("combine", "max");
    assert!(matches!(
        infer(&kind, "h", &bad, &[]),
        Err(Error::InvalidOption { ref option, .. }) if option == "combine"
    ));
}

#[test]
fn test_step_info_only_inside_the_loop() {
    let params = ParamStore::default();
    let kind = StepInfoKind;
    let desc = LayerDesc::new("step_info");
    let meta = infer(&kind, STEP_INDEX_LAYER, &desc, &[]).unwrap();
    assert_eq!(meta, TensorMeta::dense(()).with_dtype(DType::I32));
    assert!(kind.dependencies(STEP_INDEX_LAYER, &desc, NetworkFlags::default()).unwrap().is_empty());
    assert!(!kind.position_wise(&desc, NetworkFlags::default()));

    let info = StepInfo { index: 3, ended: None };
    let out = kind
        .forward(&forward_ctx(STEP_INDEX_LAYER, &desc, &meta, &params, 2, Some(&info)), &[], None)
        .unwrap();
    assert_eq!(out.value.dtype(), DType::I32);
    assert_eq!(out.value.to_labels(), vec![3, 3]);
    assert!(kind
        .forward(&forward_ctx(STEP_INDEX_LAYER, &desc, &meta, &params, 2, None), &[], None)
        .is_err());
}

#[test]
fn test_choice_outside_search_returns_targets() {
    let params = ParamStore::default();
    let desc = LayerDesc::new("choice")
        .with_from(["output_prob"])
        .with_target("classes")
        .with_opt("beam_size", 4);
    let flags = NetworkFlags::training();
    assert_eq!(
        ChoiceKind.dependencies("output", &desc, flags).unwrap(),
        vec![LayerRef::Data("classes".into())]
    );
    assert!(!ChoiceKind.is_choice(flags));
    assert!(ChoiceKind.position_wise(&desc, flags));

    let target = TensorMeta::sparse(5);
    let ctx = InferCtx {
        name: "output",
        desc: &desc,
        flags,
        target: Some(&target),
    };
    let meta = ChoiceKind.infer_output(&ctx, &[target.clone()]).unwrap();
    assert_eq!(meta, TensorMeta::sparse(5));

    let fctx = ForwardCtx {
        name: "output",
        desc: &desc,
        meta: &meta,
        input_metas: &[],
        params: &params,
        flags,
        rows: 2,
        step: None,
    };
    let labels = Tensor::from_labels(&[3, 1], 2).unwrap();
    let out = ChoiceKind.forward(&fctx, &[labels], None).unwrap();
    assert_eq!(out.value.to_labels(), vec![3, 1]);
    assert!(out.choice.is_none());
}

#[test]
fn test_choice_search_step() {
    let params = ParamStore::default();
    let desc = LayerDesc::new("choice")
        .with_from(["output_prob"])
        .with_target("classes")
        .with_opt("beam_size", 2)
        .with_opt("input_type", "log_prob");
    let flags = NetworkFlags::searching();
    assert!(ChoiceKind.is_choice(flags));
    assert!(ChoiceKind.has_state(&desc, flags));

    let metas = [TensorMeta::dense(3)];
    let ctx = InferCtx {
        name: "output",
        desc: &desc,
        flags,
        target: None,
    };
    let meta = ChoiceKind.infer_output(&ctx, &metas).unwrap();
    assert_eq!(meta, TensorMeta::sparse(3).with_beam(Some(2)));

    let init = InitCtx {
        name: "output",
        desc: &desc,
        meta: &meta,
        params: &params,
        flags,
        batch: 1,
        rows: 2,
        lookup: &no_lookup,
    };
    let state = ChoiceKind.initial_state(&init).unwrap();
    let invariant = ChoiceKind.state_invariant(&init, &state);
    assert_eq!(invariant["scores"], vec![Some(1), None]);

    let info = StepInfo { index: 0, ended: None };
    let fctx = ForwardCtx {
        name: "output",
        desc: &desc,
        meta: &meta,
        input_metas: &metas,
        params: &params,
        flags,
        rows: 2,
        step: Some(&info),
    };
    let scores = Tensor::from_vec(vec![-1.0, -0.5, -2.0, -1.0, -0.5, -2.0], (2, 3), DType::F32).unwrap();
    let out = ChoiceKind.forward(&fctx, &[scores], Some(&state)).unwrap();
    assert_eq!(out.value.to_labels(), vec![1, 0]);
    assert_eq!(out.state.unwrap().get("scores").unwrap().to_vec(), vec![-0.5, -1.0]);
    assert_eq!(out.choice.unwrap().src_beams.to_labels(), vec![0, 0]);
}

#[test]
fn test_desc_options_from_json() {
    let net = LayerDesc::net_from_json(
        r#"{
            "output": {"class": "softmax", "from": ["s"], "loss": "ce", "target": "classes",
                       "loss_scale": 0.5},
            "s": {"class": "rnn_cell", "unit": "lstm", "from": ["data", "prev:output"], "n_out": 4,
                  "initial_state": "base:enc"}
        }"#,
    )
    .unwrap();
    assert_eq!(net["output"].loss_scale, Some(0.5));
    let s = &net["s"];
    assert_eq!(
        s.sources(),
        vec![LayerRef::Data("source".into()), LayerRef::Prev("output".into())]
    );
    let reg = LayerRegistry::with_defaults();
    let deps = reg
        .get("rnn_cell")
        .unwrap()
        .dependencies("s", s, NetworkFlags::default())
        .unwrap();
    assert_eq!(deps.last(), Some(&LayerRef::Base("enc".into())));
}

// RecLayer: a recurrent subnetwork inside an enclosing network
//
// Construction (RecLayer::new) is metadata only and reports every
// configuration error: templates, loop length source, partition.
//
// A forward pass then:
//   1. resolves extern data (trimmed, reversed for backward direction) and
//      base layers
//   2. runs the moved-in layers over whole sequences
//   3. runs the step loop
//   4. resolves the beam backtrace (search only)
//   5. runs the moved-out layers on the accumulated sequences
//   6. assembles the output, its lengths, the losses and the search beam
//
// Loop length:
//   not searching and the target is fed   -> lengths of the target
//   no `end` layer                         -> lengths of data:source
//   otherwise                              -> decided by `end`, needs max_seq_len

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use recnet_core::{bail, DType, Error, Result, Shape, Tensor, TensorMeta};
use recnet_nn::{frame_error, frame_loss, masked_sum, norm_factor, LayerRef, LayerRegistry, NetworkFlags, ParamStore};

use crate::config::{Direction, RecConfig};
use crate::network::{ExternalNetwork, Scope};

use super::accumulator::{AccKey, Accumulators};
use super::backtrace::{BacktraceResolver, SearchBeam};
use super::moved::{run_moved_in, Sequences};
use super::partition::{Partition, Placement};
use super::step::{LoopLength, LoopRun, StepLoop};
use super::template::TemplateGraph;
use super::Env;

/// Where the number of steps comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LengthSource {
    /// Lengths of extern data (reference key).
    Data(String),
    /// The `end` layer, bounded by `max_len`.
    End { max_len: usize },
}

/// Aggregated losses of one forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct LossSummary {
    /// `Σ loss_scale · loss` over all loss layers, summed over frames.
    pub loss: f32,
    /// Summed frame error of the last loss layer (by name) that defines one.
    pub error: Option<f32>,
    /// `1 / Σ seq_len`.
    pub norm_factor: f32,
    /// Unscaled summed loss per layer.
    pub per_layer: BTreeMap<String, f32>,
}

impl LossSummary {
    pub fn normalized_loss(&self) -> f32 {
        self.loss * self.norm_factor
    }

    pub fn normalized_error(&self) -> Option<f32> {
        self.error.map(|e| e * self.norm_factor)
    }
}

/// Result of [`RecLayer::forward`].
#[derive(Debug, Clone)]
pub struct RecOutput {
    /// `[T, batch * beam, ..]`
    pub output: Tensor,
    pub meta: TensorMeta,
    /// Per row of `output`.
    pub seq_lens: Vec<usize>,
    /// Loop iterations run.
    pub steps: usize,
    pub loss: Option<LossSummary>,
    pub search: Option<SearchBeam>,
}

/// A compiled recurrent layer.
pub struct RecLayer {
    name: String,
    config: RecConfig,
    registry: Arc<LayerRegistry>,
    graph: TemplateGraph,
    partition: Partition,
    length: LengthSource,
}

impl RecLayer {
    pub fn new(
        name: impl Into<String>,
        config: RecConfig,
        registry: Arc<LayerRegistry>,
        net: &dyn ExternalNetwork,
    ) -> Result<Self> {
        let name = name.into();
        let net_dict = config.net_dict(&name)?;
        let scope = Scope::new(net, config.source.as_deref());
        let flags = scope.flags();
        let graph = TemplateGraph::build(&net_dict, &registry, &scope)?;

        let length = match config.target.as_deref() {
            Some(target) if !flags.search && scope.has_data(target) => LengthSource::Data(target.to_string()),
            _ if !graph.has_end() => {
                if !scope.has_data("source") {
                    return Err(Error::MissingEndLayer);
                }
                LengthSource::Data("source".to_string())
            }
            _ => LengthSource::End {
                max_len: config.max_seq_len.ok_or(Error::MissingMaxSeqLen)?,
            },
        };
        if config.direction == Direction::Backward && matches!(length, LengthSource::End { .. }) {
            return Err(Error::invalid_option(
                &name,
                "direction",
                "backward iteration needs known sequence lengths",
            ));
        }

        let mut needed: BTreeSet<String> = BTreeSet::from(["output".to_string()]);
        needed.extend(graph.loss_layers().into_iter().map(|t| t.name.clone()));
        if matches!(length, LengthSource::End { .. }) {
            needed.insert("end".to_string());
        }
        let partition = if config.optimize_move_layers_out {
            Partition::optimized(&graph, &needed)?
        } else {
            Partition::all_in_loop(&graph, &needed)?
        };
        partition.check_choice(&graph)?;
        partition.log_summary(&name, &graph);
        tracing::debug!(layer = %name, length = ?length, flags = ?flags, "recurrent layer built");

        Ok(RecLayer {
            name,
            config,
            registry,
            graph,
            partition,
            length,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RecConfig {
        &self.config
    }

    pub fn registry(&self) -> &LayerRegistry {
        &self.registry
    }

    pub fn graph(&self) -> &TemplateGraph {
        &self.graph
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn flags(&self) -> NetworkFlags {
        self.graph.flags()
    }

    /// Whether `end` decides the number of steps.
    pub fn has_dynamic_length(&self) -> bool {
        matches!(self.length, LengthSource::End { .. })
    }

    /// Metadata of the output, per frame.
    pub fn output_meta(&self) -> Result<&TensorMeta> {
        Ok(&self.graph.get("output")?.meta)
    }

    /// In-loop layers read after the loop.
    fn accumulated(&self) -> Result<BTreeSet<String>> {
        let in_loop = &self.partition.in_loop;
        let mut acc = BTreeSet::new();
        if in_loop.contains("output") {
            acc.insert("output".to_string());
        }
        for name in &self.partition.moved_out {
            for d in self.graph.get(name)?.dependencies() {
                if in_loop.contains(d) {
                    acc.insert(d.to_string());
                }
            }
        }
        Ok(acc)
    }

    fn env<'a>(&'a self, net: &dyn ExternalNetwork, params: &'a ParamStore) -> Result<Env<'a>> {
        let scope = Scope::new(net, self.config.source.as_deref());
        let backward = self.config.direction == Direction::Backward;

        let mut keys = BTreeSet::new();
        let mut base = BTreeMap::new();
        for r in self.graph.external_refs() {
            match r {
                LayerRef::Data(key) => {
                    keys.insert(key.clone());
                }
                LayerRef::Base(name) => {
                    base.insert(name.clone(), scope.layer(name, &self.name)?.value.clone());
                }
                _ => {}
            }
        }
        if let LengthSource::Data(key) = &self.length {
            keys.insert(key.clone());
        }
        let mut data = BTreeMap::new();
        for key in keys {
            let mut seq = scope.data(&key)?.trimmed()?;
            if backward {
                seq = seq.reversed()?;
            }
            data.insert(key, seq);
        }

        let batch = data
            .values()
            .map(|d| d.batch())
            .chain(base.values().filter_map(|v: &Tensor| v.dim0().ok()))
            .next()
            .ok_or_else(|| Error::msg(format!("layer '{}': no extern data or base layer gives a batch size", self.name)))?;
        for (key, d) in &data {
            if d.batch() != batch {
                bail!("data '{key}' has batch {} instead of {batch}", d.batch());
            }
        }
        for (name, v) in &base {
            if v.dim0()? != batch {
                bail!("base:{name} has batch {} instead of {batch}", v.dim0()?);
            }
        }

        let flags = self.graph.flags();
        let beam = match self.graph.choice() {
            Some(choice) if flags.search => self.graph.get(choice)?.meta.beam_size.unwrap_or(1),
            _ => 1,
        };
        Ok(Env {
            graph: &self.graph,
            params,
            flags,
            batch,
            beam,
            data,
            base,
        })
    }

    /// Run the layer on the values of `net`.
    pub fn forward(&self, net: &dyn ExternalNetwork, params: &ParamStore) -> Result<RecOutput> {
        let env = self.env(net, params)?;
        let rows = env.rows();
        let length = match &self.length {
            LengthSource::Data(key) => LoopLength::Known(env.data(key)?.seq_lens.clone()),
            LengthSource::End { max_len } => LoopLength::Dynamic { max_len: *max_len },
        };

        let moved_in = run_moved_in(&env, &self.partition, length.horizon())?;
        let run = StepLoop::new(&env, &self.partition, &moved_in, self.accumulated()?)?.run(&length)?;
        let LoopRun {
            steps,
            accs,
            state,
            seq_lens,
            mut resolver,
        } = run;
        if let Some(r) = resolver.as_mut() {
            r.resolve()?;
        }

        let mut looped = BTreeMap::new();
        for (key, acc) in accs.iter() {
            if let AccKey::Output(name) = key {
                let t = self.graph.get(name)?;
                let stacked = acc.stack(&t.meta.value_shape(&[rows]), t.meta.dtype)?;
                looped.insert(name.clone(), self.resolve(resolver.as_ref(), name, stacked)?);
            }
        }
        let mut seqs = Sequences::new(&env, &self.partition, &moved_in, looped, steps);
        seqs.run_moved_out()?;

        let mut output = seqs.get("output")?;
        if self.has_dynamic_length() {
            let t_max = seq_lens.iter().copied().max().unwrap_or(0);
            if t_max < steps {
                output = output.narrow(0, 0, t_max)?;
            }
        }
        if self.config.direction == Direction::Backward {
            output = output.reverse_sequences(&seq_lens)?;
        }

        let loss = if env.flags.eval {
            Some(self.losses(&seqs, &accs, resolver.as_ref(), &seq_lens, rows)?)
        } else {
            None
        };

        let search = match resolver {
            Some(r) => {
                let choice = self.graph.choice().unwrap_or("output");
                let scores = state
                    .states
                    .get(choice)
                    .map(|s| s.get("scores").cloned())
                    .transpose()?
                    .ok_or_else(|| Error::msg(format!("choice layer '{choice}' has no beam scores")))?;
                Some(r.into_beam(scores)?)
            }
            None => None,
        };

        Ok(RecOutput {
            output,
            meta: self.output_meta()?.clone(),
            seq_lens,
            steps,
            loss,
            search,
        })
    }

    fn resolve(&self, resolver: Option<&BacktraceResolver>, name: &str, stacked: Tensor) -> Result<Tensor> {
        match resolver {
            Some(r) => r.apply(&stacked, self.graph.depends_on_choice(name)),
            None => Ok(stacked),
        }
    }

    fn losses(
        &self,
        seqs: &Sequences<'_, '_>,
        accs: &Accumulators,
        resolver: Option<&BacktraceResolver>,
        seq_lens: &[usize],
        rows: usize,
    ) -> Result<LossSummary> {
        let mut summary = LossSummary {
            loss: 0.0,
            error: None,
            norm_factor: norm_factor(seq_lens),
            per_layer: BTreeMap::new(),
        };
        for t in self.graph.loss_layers() {
            let (Some(kind), Some(key)) = (t.desc.loss, t.desc.target.as_deref()) else {
                continue;
            };
            let (loss_frames, error_frames) = match self.partition.placement(&t.name) {
                Some(Placement::InLoop) => {
                    let frame = Shape::from(rows);
                    let stacked = |k: AccKey| -> Result<Option<Tensor>> {
                        accs.get(&k)
                            .map(|a| a.stack(&frame, DType::F32))
                            .transpose()?
                            .map(|s| self.resolve(resolver, &t.name, s))
                            .transpose()
                    };
                    let loss = stacked(AccKey::Loss(t.name.clone()))?
                        .unwrap_or_else(|| Tensor::zeros((0, rows), DType::F32));
                    (loss, stacked(AccKey::Error(t.name.clone()))?)
                }
                _ => {
                    let output = seqs.get(&t.name)?;
                    let target = seqs.data(key)?;
                    (
                        frame_loss(kind, &output, &target, 2)?,
                        frame_error(kind, &output, &target, 2)?,
                    )
                }
            };
            let loss = masked_sum(&loss_frames, seq_lens)?;
            summary.per_layer.insert(t.name.clone(), loss);
            summary.loss += t.desc.loss_scale.unwrap_or(1.0) * loss;
            if let Some(e) = error_frames {
                summary.error = Some(masked_sum(&e, seq_lens)?);
            }
        }
        tracing::debug!(
            layer = %self.name,
            loss = summary.loss,
            norm = summary.norm_factor,
            "recurrent layer losses"
        );
        Ok(summary)
    }
}

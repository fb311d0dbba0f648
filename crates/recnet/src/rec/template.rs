// Layer templates: the subnetwork for one abstract step, metadata only
//
// Construction starts from the designated outputs (`output`, `end` if
// present, every loss layer when evaluating) and follows dependencies
// recursively. A layer may reach itself through `prev:`, so every layer is
// entered as an Unresolved stub before its dependencies are visited:
//
//   ensure(x):  slot[x] = Unresolved
//               visit every dependency
//               infer meta (a stub input reads as a placeholder scalar)
//               slot[x] = Resolved(template), or Deferred(template) when
//                         any input was a placeholder or deferred
//
// The refinement passes re-infer the deferred templates in creation order,
// replacing each one whose metadata changed, until a pass changes nothing.
// The deferred templates are then resolved; anything still failing is fatal.
// A resolved template is never touched again.
//
// A reference to `:i` that the subnetwork does not define is the step index.
//
// `prev:x` resolves to the same template as `x`; the previous-step copy is
// kept in a separate map and differs only by `is_prev_frame`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use recnet_core::{DType, Error, Result, Shape, TensorMeta};
use recnet_nn::{InferCtx, LayerDesc, LayerKind, LayerRef, LayerRegistry, NetDict, NetworkFlags, STEP_INDEX_LAYER};

use crate::network::Scope;

/// Output metadata of one layer plus everything the engine needs to run it.
#[derive(Clone)]
pub struct LayerTemplate {
    pub name: String,
    pub kind: Arc<dyn LayerKind>,
    pub desc: LayerDesc,
    pub meta: TensorMeta,
    /// References passed to `forward`, in order.
    pub inputs: Vec<LayerRef>,
    /// Metadata of the `target` data, when the layer names one.
    pub target_meta: Option<TensorMeta>,
    pub is_prev_frame: bool,
    /// Depends on the current step's search choice.
    pub has_search_choice: bool,
    pub has_state: bool,
    pub position_wise: bool,
}

impl fmt::Debug for LayerTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerTemplate")
            .field("name", &self.name)
            .field("kind", &self.kind.kind())
            .field("meta", &self.meta)
            .field("inputs", &self.inputs)
            .field("is_prev_frame", &self.is_prev_frame)
            .field("has_search_choice", &self.has_search_choice)
            .field("has_state", &self.has_state)
            .finish()
    }
}

impl LayerTemplate {
    /// Sibling layers this one depends on, current or previous step. A layer
    /// with recurrent state depends on itself.
    pub fn dependencies(&self) -> BTreeSet<&str> {
        let mut deps: BTreeSet<&str> = self.inputs.iter().filter_map(LayerRef::local_name).collect();
        if self.has_state {
            deps.insert(&self.name);
        }
        deps
    }

    /// Siblings read at the current step.
    pub fn current_deps(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().filter_map(|r| match r {
            LayerRef::Current(n) => Some(n.as_str()),
            _ => None,
        })
    }

    /// Siblings read at the previous step.
    pub fn prev_deps(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().filter_map(|r| match r {
            LayerRef::Prev(n) => Some(n.as_str()),
            _ => None,
        })
    }

    fn prev_frame(&self) -> LayerTemplate {
        LayerTemplate {
            is_prev_frame: true,
            ..self.clone()
        }
    }
}

/// Construction slot.
enum TemplateSlot {
    Unresolved,
    /// Inferred from placeholder or deferred inputs; may still change.
    Deferred(LayerTemplate),
    Resolved(LayerTemplate),
}

/// All templates of one recurrent layer instantiation.
#[derive(Debug)]
pub struct TemplateGraph {
    templates: BTreeMap<String, LayerTemplate>,
    prev_frames: BTreeMap<String, LayerTemplate>,
    order: Vec<String>,
    prev_needed: BTreeSet<String>,
    external: BTreeMap<LayerRef, TensorMeta>,
    choice: Option<String>,
    unused: Vec<String>,
    flags: NetworkFlags,
}

struct Builder<'a, 's> {
    net: &'a NetDict,
    registry: &'a LayerRegistry,
    scope: &'a Scope<'s>,
    flags: NetworkFlags,
    slots: BTreeMap<String, TemplateSlot>,
    order: Vec<String>,
    prev_needed: BTreeSet<String>,
    external: BTreeMap<LayerRef, TensorMeta>,
}

fn placeholder() -> TensorMeta {
    TensorMeta::dense(())
}

impl<'a, 's> Builder<'a, 's> {
    fn ensure(&mut self, name: &str, referenced_by: &str) -> Result<()> {
        if self.slots.contains_key(name) {
            return Ok(());
        }
        let (net, scope) = (self.net, self.scope);
        let desc = match net.get(name) {
            Some(desc) => desc.clone(),
            None if name == STEP_INDEX_LAYER => LayerDesc::new("step_info"),
            None => {
                return Err(Error::UnresolvedLayer {
                    name: name.to_string(),
                    referenced_by: referenced_by.to_string(),
                })
            }
        };
        let desc = &desc;
        let kind = self.registry.get(&desc.class)?;
        self.slots.insert(name.to_string(), TemplateSlot::Unresolved);

        let inputs = kind.dependencies(name, desc, self.flags)?;
        for r in &inputs {
            self.visit(r, name)?;
        }
        let target_meta = match &desc.target {
            Some(key) => scope.data_meta(key).ok().cloned(),
            None => None,
        };
        if self.flags.eval && desc.loss.is_some() {
            let key = desc
                .target
                .as_deref()
                .ok_or_else(|| Error::invalid_option(name, "target", "required with a loss"))?;
            let meta = scope.data_meta(key)?;
            self.external.insert(LayerRef::Data(key.to_string()), meta.clone());
        }

        let (metas, provisional) = self.input_metas(&inputs)?;
        let ctx = InferCtx {
            name,
            desc,
            flags: self.flags,
            target: target_meta.as_ref(),
        };
        let meta = match kind.infer_output(&ctx, &metas) {
            Ok(meta) => meta,
            Err(e) if provisional => {
                tracing::trace!(layer = name, error = %e, "template deferred");
                placeholder()
            }
            Err(e) => return Err(e),
        };
        tracing::trace!(layer = name, class = %desc.class, meta = %meta, "template created");

        let template = LayerTemplate {
            name: name.to_string(),
            has_state: kind.has_state(desc, self.flags),
            position_wise: kind.position_wise(desc, self.flags),
            kind,
            desc: desc.clone(),
            meta,
            inputs,
            target_meta,
            is_prev_frame: false,
            has_search_choice: false,
        };
        let slot = if provisional {
            TemplateSlot::Deferred(template)
        } else {
            TemplateSlot::Resolved(template)
        };
        self.slots.insert(name.to_string(), slot);
        self.order.push(name.to_string());
        Ok(())
    }

    fn visit(&mut self, r: &LayerRef, referenced_by: &str) -> Result<()> {
        match r {
            LayerRef::Current(n) => self.ensure(n, referenced_by),
            LayerRef::Prev(n) => {
                self.prev_needed.insert(n.clone());
                self.ensure(n, referenced_by)
            }
            LayerRef::Base(n) => {
                let layer = self.scope.layer(n, referenced_by)?;
                self.external.insert(r.clone(), layer.meta.clone());
                Ok(())
            }
            LayerRef::Data(k) => {
                let meta = self.scope.data_meta(k)?;
                self.external.insert(r.clone(), meta.clone());
                Ok(())
            }
        }
    }

    /// Input metadata, and whether any of it is a placeholder.
    fn input_metas(&self, inputs: &[LayerRef]) -> Result<(Vec<TensorMeta>, bool)> {
        let mut provisional = false;
        let mut metas = Vec::with_capacity(inputs.len());
        for r in inputs {
            let meta = match r.local_name() {
                Some(n) => match self.slots.get(n) {
                    Some(TemplateSlot::Resolved(t)) => t.meta.clone(),
                    Some(TemplateSlot::Deferred(t)) => {
                        provisional = true;
                        t.meta.clone()
                    }
                    _ => {
                        provisional = true;
                        placeholder()
                    }
                },
                None => self
                    .external
                    .get(r)
                    .cloned()
                    .ok_or_else(|| Error::msg(format!("no metadata for {r}")))?,
            };
            metas.push(meta);
        }
        Ok((metas, provisional))
    }

    /// Re-infer the deferred templates until their metadata is stable, then
    /// resolve them.
    fn refine(&mut self) -> Result<()> {
        let limit = self.order.len() + 1;
        let mut last_changed = String::new();
        for pass in 0..limit {
            let mut changed = false;
            let mut failure = None;
            for name in self.order.clone() {
                let t = match self.slots.get(&name) {
                    Some(TemplateSlot::Resolved(_)) => continue,
                    Some(TemplateSlot::Deferred(t)) => t,
                    _ => return Err(Error::msg(format!("template '{name}' left unresolved"))),
                };
                let (metas, _) = self.input_metas(&t.inputs)?;
                let ctx = InferCtx {
                    name: &name,
                    desc: &t.desc,
                    flags: self.flags,
                    target: t.target_meta.as_ref(),
                };
                match t.kind.infer_output(&ctx, &metas) {
                    Ok(meta) if meta != t.meta => {
                        tracing::trace!(layer = %name, pass, meta = %meta, "template refined");
                        let refined = LayerTemplate { meta, ..t.clone() };
                        self.slots.insert(name.clone(), TemplateSlot::Deferred(refined));
                        changed = true;
                        last_changed = name;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if failure.is_none() {
                            failure = Some(e);
                        }
                    }
                }
            }
            if !changed {
                if let Some(e) = failure {
                    return Err(e);
                }
                let slots = std::mem::take(&mut self.slots);
                self.slots = slots
                    .into_iter()
                    .map(|(name, slot)| match slot {
                        TemplateSlot::Deferred(t) => (name, TemplateSlot::Resolved(t)),
                        other => (name, other),
                    })
                    .collect();
                return Ok(());
            }
        }
        Err(Error::TemplateDiverges { layer: last_changed })
    }
}

impl TemplateGraph {
    pub(crate) fn build(net: &NetDict, registry: &LayerRegistry, scope: &Scope<'_>) -> Result<Self> {
        if !net.contains_key("output") {
            return Err(Error::MissingOutputLayer);
        }
        let flags = scope.flags();
        let mut b = Builder {
            net,
            registry,
            scope,
            flags,
            slots: BTreeMap::new(),
            order: Vec::new(),
            prev_needed: BTreeSet::new(),
            external: BTreeMap::new(),
        };
        b.ensure("output", "output")?;
        if net.contains_key("end") {
            b.ensure("end", "end")?;
        }
        if flags.eval {
            for (name, desc) in net {
                if desc.loss.is_some() {
                    b.ensure(name, name)?;
                }
            }
        }
        b.refine()?;

        let mut templates = BTreeMap::new();
        for (name, slot) in b.slots {
            if let TemplateSlot::Resolved(t) = slot {
                templates.insert(name, t);
            }
        }
        let unused = net
            .keys()
            .filter(|n| !templates.contains_key(*n))
            .cloned()
            .collect();

        let mut graph = TemplateGraph {
            templates,
            prev_frames: BTreeMap::new(),
            order: b.order,
            prev_needed: b.prev_needed,
            external: b.external,
            choice: None,
            unused,
            flags,
        };
        graph.check_end()?;
        graph.check_hidden_state_sources()?;
        graph.mark_choice()?;
        graph.prev_frames = graph
            .prev_needed
            .iter()
            .filter_map(|n| graph.templates.get(n).map(|t| (n.clone(), t.prev_frame())))
            .collect();
        Ok(graph)
    }

    fn check_end(&self) -> Result<()> {
        if let Some(end) = self.templates.get("end") {
            if end.meta.dtype != DType::Bool || end.meta.feature_shape != Shape::from(()) {
                return Err(Error::TemplateMismatch {
                    layer: "end".to_string(),
                    expected: TensorMeta::flag().to_string(),
                    got: end.meta.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Layers reading hidden states need stateful sources.
    fn check_hidden_state_sources(&self) -> Result<()> {
        for t in self.templates.values().filter(|t| t.kind.reads_hidden_state()) {
            for r in &t.inputs {
                let stateful = r
                    .local_name()
                    .and_then(|n| self.templates.get(n))
                    .map_or(false, |s| s.has_state);
                if !stateful {
                    return Err(Error::invalid_option(
                        &t.name,
                        "from",
                        format!("{r} carries no hidden state"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Find the choice layer and flag every layer depending on it within a step.
    fn mark_choice(&mut self) -> Result<()> {
        let choices: Vec<String> = self
            .templates
            .values()
            .filter(|t| t.kind.is_choice(self.flags))
            .map(|t| t.name.clone())
            .collect();
        if choices.len() > 1 {
            return Err(Error::MultipleChoices { layers: choices });
        }
        let Some(choice) = choices.into_iter().next() else {
            return Ok(());
        };
        let mut dependent = BTreeSet::from([choice.clone()]);
        loop {
            let before = dependent.len();
            for t in self.templates.values() {
                if t.current_deps().any(|d| dependent.contains(d)) {
                    dependent.insert(t.name.clone());
                }
            }
            if dependent.len() == before {
                break;
            }
        }
        for name in &dependent {
            if let Some(t) = self.templates.get(name) {
                let marked = LayerTemplate {
                    has_search_choice: true,
                    ..t.clone()
                };
                self.templates.insert(name.clone(), marked);
            }
        }
        self.choice = Some(choice);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&LayerTemplate> {
        self.templates
            .get(name)
            .ok_or_else(|| Error::msg(format!("no template for layer '{name}'")))
    }

    /// The current-step template, or its previous-step copy.
    pub fn frame(&self, name: &str, prev: bool) -> Option<&LayerTemplate> {
        if prev {
            self.prev_frames.get(name)
        } else {
            self.templates.get(name)
        }
    }

    pub fn templates(&self) -> impl Iterator<Item = &LayerTemplate> {
        self.templates.values()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Names in creation order (dependencies first, unless reached via `prev:`).
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Layers whose previous-step value is read.
    pub fn prev_needed(&self) -> &BTreeSet<String> {
        &self.prev_needed
    }

    pub fn has_end(&self) -> bool {
        self.templates.contains_key("end")
    }

    pub fn choice(&self) -> Option<&str> {
        self.choice.as_deref()
    }

    pub fn depends_on_choice(&self, name: &str) -> bool {
        self.templates.get(name).map_or(false, |t| t.has_search_choice)
    }

    /// Layers with a loss, when losses are computed.
    pub fn loss_layers(&self) -> Vec<&LayerTemplate> {
        if !self.flags.eval {
            return Vec::new();
        }
        self.templates.values().filter(|t| t.desc.loss.is_some()).collect()
    }

    pub fn external_refs(&self) -> impl Iterator<Item = &LayerRef> {
        self.external.keys()
    }

    pub fn unused(&self) -> &[String] {
        &self.unused
    }

    pub fn flags(&self) -> NetworkFlags {
        self.flags
    }

    /// Metadata of a template's inputs, in order.
    pub fn input_metas(&self, t: &LayerTemplate) -> Result<Vec<TensorMeta>> {
        t.inputs
            .iter()
            .map(|r| match r.local_name() {
                Some(n) => self.get(n).map(|d| d.meta.clone()),
                None => self
                    .external
                    .get(r)
                    .cloned()
                    .ok_or_else(|| Error::msg(format!("no metadata for {r}"))),
            })
            .collect()
    }

    /// Topological order of `subset` over current-step edges, and also
    /// over `prev:` edges between different layers when `with_prev` is set.
    /// Ties are broken by name.
    pub fn topo_order(&self, subset: &BTreeSet<String>, with_prev: bool) -> Result<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Open,
            Done,
        }
        struct Walk<'g> {
            graph: &'g TemplateGraph,
            subset: &'g BTreeSet<String>,
            with_prev: bool,
            marks: BTreeMap<&'g str, Mark>,
            stack: Vec<&'g str>,
            out: Vec<String>,
        }
        impl<'g> Walk<'g> {
            fn visit(&mut self, name: &'g str) -> Result<()> {
                match self.marks.get(name) {
                    Some(Mark::Done) => return Ok(()),
                    Some(Mark::Open) => {
                        let start = self.stack.iter().position(|n| *n == name).unwrap_or(0);
                        let mut layers: Vec<String> = self.stack[start..].iter().map(|n| n.to_string()).collect();
                        layers.push(name.to_string());
                        return Err(Error::CyclicDependency { layers });
                    }
                    None => {}
                }
                self.marks.insert(name, Mark::Open);
                self.stack.push(name);
                let graph = self.graph;
                let t = graph.get(name)?;
                let mut deps: BTreeSet<&'g str> = t.current_deps().collect();
                if self.with_prev {
                    deps.extend(t.prev_deps().filter(|d| *d != name));
                }
                for d in deps {
                    if self.subset.contains(d) {
                        self.visit(d)?;
                    }
                }
                self.stack.pop();
                self.marks.insert(name, Mark::Done);
                self.out.push(name.to_string());
                Ok(())
            }
        }

        let mut walk = Walk {
            graph: self,
            subset,
            with_prev,
            marks: BTreeMap::new(),
            stack: Vec::new(),
            out: Vec::with_capacity(subset.len()),
        };
        for name in subset {
            walk.visit(name)?;
        }
        Ok(walk.out)
    }
}

// Layer registry
//
// Maps class names to layer kinds. The engine receives a registry instead of
// consulting a global table, so callers can add their own kinds:
//
//   let mut reg = LayerRegistry::with_defaults();
//   reg.register(Arc::new(MyKind));

use std::collections::BTreeMap;
use std::sync::Arc;

use recnet_core::{Error, Result};

use crate::activation::ActivationKind;
use crate::choice::ChoiceKind;
use crate::combine::{CombineKind, CompareKind, CopyKind};
use crate::constant::ConstantKind;
use crate::kind::LayerKind;
use crate::linear::{LinearKind, SoftmaxKind};
use crate::rnn::{CellRegistry, LastHiddenStateKind, RnnCellKind};
use crate::step_info::StepInfoKind;

/// Layer kinds by class name, plus the recurrent cells `rnn_cell` can use.
pub struct LayerRegistry {
    kinds: BTreeMap<String, Arc<dyn LayerKind>>,
    cells: Arc<CellRegistry>,
}

impl LayerRegistry {
    /// An empty registry using the given cells.
    pub fn new(cells: Arc<CellRegistry>) -> Self {
        LayerRegistry {
            kinds: BTreeMap::new(),
            cells,
        }
    }

    /// Registry with every built-in kind and cell.
    pub fn with_defaults() -> Self {
        let cells = Arc::new(CellRegistry::with_defaults());
        let mut reg = LayerRegistry::new(cells.clone());
        reg.register(Arc::new(CopyKind));
        reg.register(Arc::new(LinearKind));
        reg.register(Arc::new(SoftmaxKind));
        reg.register(Arc::new(ActivationKind));
        reg.register(Arc::new(CombineKind));
        reg.register(Arc::new(CompareKind));
        reg.register(Arc::new(ConstantKind));
        reg.register(Arc::new(ChoiceKind));
        reg.register(Arc::new(RnnCellKind::new(cells)));
        reg.register(Arc::new(LastHiddenStateKind));
        reg.register(Arc::new(StepInfoKind));
        reg
    }

    /// Add or replace a kind.
    pub fn register(&mut self, kind: Arc<dyn LayerKind>) {
        self.kinds.insert(kind.kind().to_string(), kind);
    }

    pub fn get(&self, class: &str) -> Result<Arc<dyn LayerKind>> {
        self.kinds
            .get(class)
            .cloned()
            .ok_or_else(|| Error::UnknownLayerKind {
                kind: class.to_string(),
            })
    }

    pub fn cells(&self) -> &CellRegistry {
        &self.cells
    }
}

impl Default for LayerRegistry {
    fn default() -> Self {
        LayerRegistry::with_defaults()
    }
}

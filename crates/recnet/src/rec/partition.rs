// Loop partitioning: which layers really need to run per step
//
// Start from the dependency closure of the needed layers (everything is in
// the loop), then alternate two moves until neither applies:
//
//   move out   no layer still in the loop reads its current-step value
//              (itself included, through recurrent state), it is not `end`,
//              no `prev:` reference reads it, and it can be evaluated
//              position-wise.
//   move in    none of its dependencies is still in the loop, and it can
//              be evaluated position-wise.
//
// Moved-out layers run after the loop on the accumulated sequences,
// moved-in layers run before it over the whole time axis. A search choice
// never moves.

use std::collections::BTreeSet;

use recnet_core::{Error, Result};

use super::template::TemplateGraph;

/// Where a layer is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    InLoop,
    MovedIn,
    MovedOut,
}

/// Disjoint placement sets of one recurrent layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub in_loop: BTreeSet<String>,
    pub moved_in: BTreeSet<String>,
    pub moved_out: BTreeSet<String>,
}

/// Every sibling reachable from `needed`, current or previous step.
pub fn needed_closure(graph: &TemplateGraph, needed: &BTreeSet<String>) -> Result<BTreeSet<String>> {
    let mut closure = BTreeSet::new();
    let mut pending: Vec<String> = needed.iter().cloned().collect();
    while let Some(name) = pending.pop() {
        if !closure.insert(name.clone()) {
            continue;
        }
        let t = graph.get(&name)?;
        pending.extend(
            t.dependencies()
                .into_iter()
                .filter(|d| !closure.contains(*d))
                .map(str::to_string),
        );
    }
    Ok(closure)
}

impl Partition {
    /// No optimization: the whole closure runs per step.
    pub fn all_in_loop(graph: &TemplateGraph, needed: &BTreeSet<String>) -> Result<Self> {
        Ok(Partition {
            in_loop: needed_closure(graph, needed)?,
            ..Default::default()
        })
    }

    pub fn optimized(graph: &TemplateGraph, needed: &BTreeSet<String>) -> Result<Self> {
        let mut p = Partition::all_in_loop(graph, needed)?;
        let choice = if graph.flags().search { graph.choice() } else { None };

        loop {
            let mut changed = false;

            let candidates: Vec<String> = p.in_loop.iter().cloned().collect();
            for name in &candidates {
                if p.can_move_out(graph, name, choice)? {
                    p.in_loop.remove(name);
                    p.moved_out.insert(name.clone());
                    changed = true;
                }
            }

            let candidates: Vec<String> = p.in_loop.iter().cloned().collect();
            for name in &candidates {
                if p.can_move_in(graph, name, choice)? {
                    p.in_loop.remove(name);
                    p.moved_in.insert(name.clone());
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
        Ok(p)
    }

    fn can_move_out(&self, graph: &TemplateGraph, name: &str, choice: Option<&str>) -> Result<bool> {
        if name == "end" || choice == Some(name) || graph.prev_needed().contains(name) {
            return Ok(false);
        }
        if !graph.get(name)?.position_wise {
            return Ok(false);
        }
        for other in &self.in_loop {
            let t = graph.get(other)?;
            if t.current_deps().any(|d| d == name) || (other == name && t.has_state) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn can_move_in(&self, graph: &TemplateGraph, name: &str, choice: Option<&str>) -> Result<bool> {
        if choice == Some(name) {
            return Ok(false);
        }
        let t = graph.get(name)?;
        if !t.position_wise {
            return Ok(false);
        }
        Ok(!t.dependencies().iter().any(|d| self.in_loop.contains(*d)))
    }

    pub fn placement(&self, name: &str) -> Option<Placement> {
        if self.in_loop.contains(name) {
            Some(Placement::InLoop)
        } else if self.moved_in.contains(name) {
            Some(Placement::MovedIn)
        } else if self.moved_out.contains(name) {
            Some(Placement::MovedOut)
        } else {
            None
        }
    }

    /// Union of the three sets.
    pub fn all(&self) -> BTreeSet<String> {
        self.in_loop
            .iter()
            .chain(&self.moved_in)
            .chain(&self.moved_out)
            .cloned()
            .collect()
    }

    pub fn is_disjoint(&self) -> bool {
        self.in_loop.is_disjoint(&self.moved_in)
            && self.in_loop.is_disjoint(&self.moved_out)
            && self.moved_in.is_disjoint(&self.moved_out)
    }

    /// The choice layer must stay in the loop when searching.
    pub(crate) fn check_choice(&self, graph: &TemplateGraph) -> Result<()> {
        if !graph.flags().search {
            return Ok(());
        }
        match graph.choice() {
            Some(c) if self.moved_in.contains(c) || self.moved_out.contains(c) => {
                Err(Error::ChoiceMovedOut { layer: c.to_string() })
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn log_summary(&self, layer: &str, graph: &TemplateGraph) {
        let all = self.all();
        let unused: Vec<&String> = graph
            .templates()
            .map(|t| &t.name)
            .filter(|n| !all.contains(*n))
            .chain(graph.unused())
            .collect();
        tracing::debug!(
            layer,
            moved_in = ?self.moved_in,
            moved_out = ?self.moved_out,
            in_loop = ?self.in_loop,
            unused = ?unused,
            "recurrent layer partition"
        );
    }
}

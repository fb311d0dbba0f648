// Per-step buffers and the state carried between steps

use std::collections::BTreeMap;

use recnet_core::{DType, Error, Result, Shape, Tensor};
use recnet_nn::LayerState;

/// One value per step, written in order and read back by index.
#[derive(Debug, Clone)]
pub struct Accumulator {
    name: String,
    frames: Vec<Tensor>,
}

impl Accumulator {
    pub fn new(name: impl Into<String>) -> Self {
        Accumulator {
            name: name.into(),
            frames: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write the value of step `step`, which must be the next one.
    pub fn write(&mut self, step: usize, value: Tensor) -> Result<()> {
        if step != self.frames.len() {
            return Err(Error::msg(format!(
                "accumulator '{}': write of step {} after {} steps",
                self.name,
                step,
                self.frames.len()
            )));
        }
        if let Some(first) = self.frames.first() {
            if first.dims() != value.dims() {
                return Err(Error::ShapeMismatch {
                    expected: first.shape(),
                    got: value.shape(),
                });
            }
        }
        self.frames.push(value);
        Ok(())
    }

    pub fn read(&self, step: usize) -> Result<&Tensor> {
        self.frames.get(step).ok_or(Error::IndexOutOfBounds {
            index: step,
            size: self.frames.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// All steps stacked time-major. `frame_shape` and `dtype` describe the
    /// result when no step ran.
    pub fn stack(&self, frame_shape: &Shape, dtype: DType) -> Result<Tensor> {
        if self.frames.is_empty() {
            return Ok(Tensor::zeros(frame_shape.prepend(&[0]), dtype));
        }
        Tensor::stack(&self.frames)
    }
}

/// What an accumulator collects.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccKey {
    Output(String),
    Loss(String),
    Error(String),
}

/// The accumulators of one loop run.
#[derive(Debug, Clone, Default)]
pub struct Accumulators {
    map: BTreeMap<AccKey, Accumulator>,
}

impl Accumulators {
    pub fn write(&mut self, key: AccKey, step: usize, value: Tensor) -> Result<()> {
        self.map
            .entry(key.clone())
            .or_insert_with(|| {
                let name = match &key {
                    AccKey::Output(n) => n.clone(),
                    AccKey::Loss(n) => format!("{n}/loss"),
                    AccKey::Error(n) => format!("{n}/error"),
                };
                Accumulator::new(name)
            })
            .write(step, value)
    }

    pub fn get(&self, key: &AccKey) -> Option<&Accumulator> {
        self.map.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AccKey, &Accumulator)> {
        self.map.iter()
    }
}

/// Values carried from one step to the next.
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    /// Outputs of the in-loop layers read through `prev:`.
    pub outputs: BTreeMap<String, Tensor>,
    /// Recurrent state of in-loop layers that carry one.
    pub states: BTreeMap<String, LayerState>,
    /// Bool `[rows]`: hypotheses that have ended (decided by `end`).
    pub ended: Option<Tensor>,
    /// Per-row lengths counted so far (decided by `end`).
    pub seq_lens: Option<Vec<usize>>,
}

impl LoopState {
    /// Whether any hypothesis is still running.
    pub fn any_running(&self) -> bool {
        match &self.ended {
            Some(ended) => ended.to_bools().iter().any(|e| !e),
            None => true,
        }
    }

    /// Re-gather the rows of every output and state `keep` selects.
    pub fn reorder(&mut self, rows: &[usize], keep: impl Fn(&str) -> bool) -> Result<()> {
        for (name, value) in self.outputs.iter_mut() {
            if keep(name) {
                *value = value.select_rows(rows)?;
            }
        }
        for (name, state) in self.states.iter_mut() {
            if keep(name) {
                *state = state.try_map(|t| t.select_rows(rows))?;
            }
        }
        Ok(())
    }
}

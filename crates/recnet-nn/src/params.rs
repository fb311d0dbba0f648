// Parameters: named, lazily initialized weights
//
// Layers never own their weights. They ask the ParamStore for a parameter by
// key ("<layer>/W", "<layer>/b", ...) and the store creates it on first use.
//
// INITIALIZERS (following torch.nn.init):
//
//   zeros                      all zeros
//   ones                       all ones
//   uniform(bound)             U(-bound, bound)
//   xavier_uniform             U(-a, a), a = sqrt(6 / (fan_in + fan_out))
//
// Every parameter draws from its own StdRng, seeded from the store seed and
// the parameter key. A weight therefore has the same value no matter which
// layer asks for it first, so two compilations of the same network (e.g.
// with and without loop optimization) see identical parameters.

use std::collections::BTreeMap;
use std::sync::RwLock;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use recnet_core::{DType, Error, Result, Shape, Tensor};

/// Initialization rule for a new parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    Ones,
    Uniform(f32),
    XavierUniform,
}

/// Compute (fan_in, fan_out) for a weight stored as `[in, out]`.
fn compute_fans(shape: &Shape) -> (f32, f32) {
    let dims = shape.dims();
    match dims.len() {
        0 => (1.0, 1.0),
        1 => (dims[0] as f32, dims[0] as f32),
        _ => (dims[0] as f32, dims[1..].iter().product::<usize>() as f32),
    }
}

/// Create a tensor following `init`, drawing from `rng`.
pub fn init_tensor(shape: &Shape, init: Init, rng: &mut StdRng) -> Result<Tensor> {
    let n = shape.elem_count();
    let bound = match init {
        Init::Zeros => return Ok(Tensor::zeros(shape.clone(), DType::F32)),
        Init::Ones => return Ok(Tensor::ones(shape.clone(), DType::F32)),
        Init::Uniform(bound) => bound,
        Init::XavierUniform => {
            let (fan_in, fan_out) = compute_fans(shape);
            (6.0 / (fan_in + fan_out)).sqrt()
        }
    };
    let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-bound..=bound)).collect();
    Tensor::from_vec(data, shape.clone(), DType::F32)
}

/// FNV-1a over the key, mixed with the store seed.
fn key_seed(seed: u64, key: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325 ^ seed;
    for b in key.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    h
}

/// Shared store of named parameters.
#[derive(Debug)]
pub struct ParamStore {
    seed: u64,
    params: RwLock<BTreeMap<String, Tensor>>,
}

impl Default for ParamStore {
    fn default() -> Self {
        ParamStore::new(0)
    }
}

impl ParamStore {
    pub fn new(seed: u64) -> Self {
        ParamStore {
            seed,
            params: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Fetch the parameter `key`, creating it with `init` if absent.
    ///
    /// An existing parameter must have exactly `shape`.
    pub fn get_or_init(&self, key: &str, shape: impl Into<Shape>, init: Init) -> Result<Tensor> {
        let shape = shape.into();
        if let Some(t) = self.get(key)? {
            return check_shape(key, t, &shape);
        }
        let mut params = self
            .params
            .write()
            .map_err(|_| Error::msg("parameter store lock poisoned"))?;
        if let Some(t) = params.get(key) {
            return check_shape(key, t.clone(), &shape);
        }
        let mut rng = StdRng::seed_from_u64(key_seed(self.seed, key));
        let t = init_tensor(&shape, init, &mut rng)?;
        tracing::trace!(param = key, shape = %shape, "initialized parameter");
        params.insert(key.to_string(), t.clone());
        Ok(t)
    }

    pub fn get(&self, key: &str) -> Result<Option<Tensor>> {
        let params = self
            .params
            .read()
            .map_err(|_| Error::msg("parameter store lock poisoned"))?;
        Ok(params.get(key).cloned())
    }

    /// Insert or replace a parameter.
    pub fn insert(&self, key: impl Into<String>, value: Tensor) -> Result<()> {
        let mut params = self
            .params
            .write()
            .map_err(|_| Error::msg("parameter store lock poisoned"))?;
        params.insert(key.into(), value);
        Ok(())
    }

    /// All parameter keys in sorted order.
    pub fn names(&self) -> Result<Vec<String>> {
        let params = self
            .params
            .read()
            .map_err(|_| Error::msg("parameter store lock poisoned"))?;
        Ok(params.keys().cloned().collect())
    }
}

fn check_shape(key: &str, t: Tensor, shape: &Shape) -> Result<Tensor> {
    if t.dims() != shape.dims() {
        return Err(Error::TemplateMismatch {
            layer: key.to_string(),
            expected: shape.to_string(),
            got: t.shape().to_string(),
        });
    }
    Ok(t)
}

// The enclosing network, as seen from a recurrent layer
//
// A recurrent layer reads two kinds of values from outside its subnetwork:
//
//   data:<key>   extern data, time-major [T, B, ..] with per-sequence lengths
//   base:<name>  layers of the enclosing network, [B, ..], constant over steps
//
// Both are read-only. `ParentNetwork` is a plain in-memory implementation
// used by tests and by callers without a larger network around them.

use std::collections::BTreeMap;

use recnet_core::{Error, Result, Tensor, TensorMeta};
use recnet_nn::NetworkFlags;

/// A batch of sequences, time-major.
#[derive(Debug, Clone)]
pub struct SeqData {
    /// `[T, B, ..feature_shape]`
    pub values: Tensor,
    pub seq_lens: Vec<usize>,
    /// Per-frame metadata (no time or batch axis).
    pub meta: TensorMeta,
}

impl SeqData {
    pub fn new(values: Tensor, seq_lens: Vec<usize>, meta: TensorMeta) -> Result<Self> {
        let dims = values.dims();
        if dims.len() < 2 || dims[1] != seq_lens.len() {
            return Err(Error::msg(format!(
                "sequence data of shape {} does not match {} sequence lengths",
                values.shape(),
                seq_lens.len()
            )));
        }
        if let Some(&len) = seq_lens.iter().find(|&&l| l > dims[0]) {
            return Err(Error::IndexOutOfBounds {
                index: len,
                size: dims[0],
            });
        }
        let expected = meta.value_shape(&dims[..2]);
        if values.shape() != expected {
            return Err(Error::ShapeMismatch {
                expected,
                got: values.shape(),
            });
        }
        Ok(SeqData {
            values: values.to_dtype(meta.dtype),
            seq_lens,
            meta,
        })
    }

    /// Dense features; the metadata is taken from the value shape.
    pub fn dense(values: Tensor, seq_lens: Vec<usize>) -> Result<Self> {
        let meta = TensorMeta::dense(values.shape().skip(2));
        SeqData::new(values, seq_lens, meta)
    }

    /// Label sequences of varying length, one `Vec` per batch entry, padded
    /// with label 0.
    pub fn labels(seqs: &[Vec<usize>], classes: usize) -> Result<Self> {
        let t_max = seqs.iter().map(Vec::len).max().unwrap_or(0);
        let batch = seqs.len();
        let mut flat = vec![0usize; t_max * batch];
        for (b, seq) in seqs.iter().enumerate() {
            for (t, &label) in seq.iter().enumerate() {
                if label >= classes {
                    return Err(Error::IndexOutOfBounds {
                        index: label,
                        size: classes,
                    });
                }
                flat[t * batch + b] = label;
            }
        }
        let values = Tensor::from_labels(&flat, (t_max, batch))?;
        SeqData::new(values, seqs.iter().map(Vec::len).collect(), TensorMeta::sparse(classes))
    }

    pub fn batch(&self) -> usize {
        self.seq_lens.len()
    }

    /// Length of the time axis.
    pub fn max_len(&self) -> usize {
        self.values.dims()[0]
    }

    /// Frame `t`, `[B, ..]`.
    pub fn frame(&self, key: &str, t: usize) -> Result<Tensor> {
        if t >= self.max_len() {
            return Err(Error::DataUnavailable {
                key: key.to_string(),
                step: t,
                len: self.max_len(),
            });
        }
        self.values.index_axis0(t)
    }

    /// Drop trailing frames no sequence reaches.
    pub fn trimmed(&self) -> Result<Self> {
        let longest = self.seq_lens.iter().copied().max().unwrap_or(0);
        if longest == self.max_len() {
            return Ok(self.clone());
        }
        Ok(SeqData {
            values: self.values.narrow(0, 0, longest)?,
            seq_lens: self.seq_lens.clone(),
            meta: self.meta.clone(),
        })
    }

    /// Every sequence reversed within its own length.
    pub fn reversed(&self) -> Result<Self> {
        Ok(SeqData {
            values: self.values.reverse_sequences(&self.seq_lens)?,
            seq_lens: self.seq_lens.clone(),
            meta: self.meta.clone(),
        })
    }
}

/// A layer of the enclosing network.
#[derive(Debug, Clone)]
pub struct LayerValue {
    /// `[B, ..feature_shape]`
    pub value: Tensor,
    pub meta: TensorMeta,
}

impl LayerValue {
    pub fn new(value: Tensor, meta: TensorMeta) -> Result<Self> {
        let batch = value.dim0()?;
        let expected = meta.value_shape(&[batch]);
        if value.shape() != expected {
            return Err(Error::ShapeMismatch {
                expected,
                got: value.shape(),
            });
        }
        Ok(LayerValue {
            value: value.to_dtype(meta.dtype),
            meta,
        })
    }

    pub fn dense(value: Tensor) -> Result<Self> {
        let meta = TensorMeta::dense(value.shape().skip(1));
        LayerValue::new(value, meta)
    }
}

/// What a recurrent layer may ask of the network it lives in.
pub trait ExternalNetwork {
    fn flags(&self) -> NetworkFlags;

    fn layer(&self, name: &str) -> Option<&LayerValue>;

    fn data(&self, key: &str) -> Option<&SeqData>;

    /// Metadata of extern data, known even when no values are fed (e.g. the
    /// targets during search).
    fn data_meta(&self, key: &str) -> Option<&TensorMeta> {
        self.data(key).map(|d| &d.meta)
    }
}

/// In-memory [`ExternalNetwork`].
#[derive(Debug, Clone, Default)]
pub struct ParentNetwork {
    flags: NetworkFlags,
    data: BTreeMap<String, SeqData>,
    declared: BTreeMap<String, TensorMeta>,
    layers: BTreeMap<String, LayerValue>,
}

impl ParentNetwork {
    pub fn new(flags: NetworkFlags) -> Self {
        ParentNetwork {
            flags,
            ..Default::default()
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, data: SeqData) -> Self {
        self.data.insert(key.into(), data);
        self
    }

    /// Declare extern data without feeding values.
    pub fn with_data_meta(mut self, key: impl Into<String>, meta: TensorMeta) -> Self {
        self.declared.insert(key.into(), meta);
        self
    }

    pub fn with_layer(mut self, name: impl Into<String>, layer: LayerValue) -> Self {
        self.layers.insert(name.into(), layer);
        self
    }

    pub fn with_flags(mut self, flags: NetworkFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl ExternalNetwork for ParentNetwork {
    fn flags(&self) -> NetworkFlags {
        self.flags
    }

    fn layer(&self, name: &str) -> Option<&LayerValue> {
        self.layers.get(name)
    }

    fn data(&self, key: &str) -> Option<&SeqData> {
        self.data.get(key)
    }

    fn data_meta(&self, key: &str) -> Option<&TensorMeta> {
        self.data
            .get(key)
            .map(|d| &d.meta)
            .or_else(|| self.declared.get(key))
    }
}

/// An [`ExternalNetwork`] seen through a recurrent layer's configuration:
/// `data:source` is redirected to the configured source key.
pub(crate) struct Scope<'a> {
    net: &'a dyn ExternalNetwork,
    source: Option<&'a str>,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(net: &'a dyn ExternalNetwork, source: Option<&'a str>) -> Self {
        Scope { net, source }
    }

    pub(crate) fn flags(&self) -> NetworkFlags {
        self.net.flags()
    }

    /// Extern data key a `data:<key>` reference reads.
    pub(crate) fn data_key<'k>(&'k self, key: &'k str) -> &'k str {
        match (key, self.source) {
            ("source", Some(src)) => src,
            _ => key,
        }
    }

    pub(crate) fn has_data(&self, key: &str) -> bool {
        self.net.data_meta(self.data_key(key)).is_some()
    }

    pub(crate) fn data(&self, key: &str) -> Result<&'a SeqData> {
        let key = self.data_key(key);
        self.net.data(key).ok_or_else(|| Error::MissingData { key: key.to_string() })
    }

    pub(crate) fn data_meta(&self, key: &str) -> Result<&'a TensorMeta> {
        let key = self.data_key(key);
        self.net
            .data_meta(key)
            .ok_or_else(|| Error::MissingData { key: key.to_string() })
    }

    pub(crate) fn layer(&self, name: &str, referenced_by: &str) -> Result<&'a LayerValue> {
        self.net.layer(name).ok_or_else(|| Error::UnresolvedLayer {
            name: format!("base:{name}"),
            referenced_by: referenced_by.to_string(),
        })
    }
}

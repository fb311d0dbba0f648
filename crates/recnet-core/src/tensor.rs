use ndarray::{Array2, ArcArray, ArrayD, ArrayViewD, Axis, Ix2, IxDyn, Slice, Zip};

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;

// Tensor: the value type flowing through layers
//
// A Tensor is a shared, immutable n-dimensional f32 array plus a DType tag.
// Cloning is O(1) (ArcArray); every operation returns a new tensor, so a
// value published by a layer can be read by any number of consumers.
//
// AXIS CONVENTIONS used by the engine:
//
//   per step:        [batch * beam, ...features]
//   whole sequence:  [time, batch * beam, ...features]   (time-major)
//
// Beam hypotheses of one batch entry are adjacent rows: row b * K + k.
//
// Labels (I32) and flags (Bool) use the same f32 storage; every constructor
// and map coerces values into the dtype's domain.

/// An immutable n-dimensional array with a dtype tag.
#[derive(Debug, Clone)]
pub struct Tensor {
    data: ArcArray<f32, IxDyn>,
    dtype: DType,
}

impl Tensor {
    // Creation

    /// Wrap an ndarray. Values are coerced into `dtype`'s domain.
    pub fn from_array(data: ArrayD<f32>, dtype: DType) -> Self {
        let data = if dtype.is_float() {
            data
        } else {
            data.mapv(|v| dtype.coerce(v))
        };
        Tensor {
            data: data.into_shared(),
            dtype,
        }
    }

    pub fn zeros(shape: impl Into<Shape>, dtype: DType) -> Self {
        let shape = shape.into();
        Self::from_array(ArrayD::zeros(IxDyn(shape.dims())), dtype)
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType) -> Self {
        Self::full(shape, 1.0, dtype)
    }

    /// Tensor filled with a single value.
    pub fn full(shape: impl Into<Shape>, val: f32, dtype: DType) -> Self {
        let shape = shape.into();
        Self::from_array(ArrayD::from_elem(IxDyn(shape.dims()), val), dtype)
    }

    /// Create from a flat row-major vector.
    pub fn from_vec(data: Vec<f32>, shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let arr = ArrayD::from_shape_vec(IxDyn(shape.dims()), data)?;
        Ok(Self::from_array(arr, dtype))
    }

    /// I32 tensor of class labels.
    pub fn from_labels(labels: &[usize], shape: impl Into<Shape>) -> Result<Self> {
        Self::from_vec(
            labels.iter().map(|&l| l as f32).collect(),
            shape,
            DType::I32,
        )
    }

    /// Bool tensor of flags.
    pub fn from_bools(flags: &[bool], shape: impl Into<Shape>) -> Result<Self> {
        Self::from_vec(
            flags.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect(),
            shape,
            DType::Bool,
        )
    }

    // Accessors

    pub fn dims(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn shape(&self) -> Shape {
        Shape::from(self.data.shape())
    }

    pub fn rank(&self) -> usize {
        self.data.ndim()
    }

    pub fn elem_count(&self) -> usize {
        self.data.len()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Size of the leading axis.
    pub fn dim0(&self) -> Result<usize> {
        self.dims()
            .first()
            .copied()
            .ok_or(Error::DimOutOfRange { dim: 0, rank: 0 })
    }

    /// Values in logical row-major order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    pub fn to_labels(&self) -> Vec<usize> {
        self.data.iter().map(|&v| v.max(0.0).round() as usize).collect()
    }

    pub fn to_bools(&self) -> Vec<bool> {
        self.data.iter().map(|&v| v != 0.0).collect()
    }

    /// The single value of a one-element tensor.
    pub fn to_scalar(&self) -> Result<f32> {
        match self.data.iter().next() {
            Some(&v) if self.elem_count() == 1 => Ok(v),
            _ => Err(Error::msg(format!(
                "not a scalar: tensor has shape {}",
                self.shape()
            ))),
        }
    }

    /// Same values re-tagged with another dtype (coercing them).
    pub fn to_dtype(&self, dtype: DType) -> Self {
        if dtype == self.dtype {
            return self.clone();
        }
        Self::from_array(self.data.to_owned(), dtype)
    }

    // Layout

    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: self.elem_count(),
                shape,
            });
        }
        let arr = ArrayD::from_shape_vec(IxDyn(shape.dims()), self.to_vec())?;
        Ok(Tensor {
            data: arr.into_shared(),
            dtype: self.dtype,
        })
    }

    /// Insert a leading axis of size 1.
    pub fn unsqueeze0(&self) -> Result<Self> {
        self.reshape(self.shape().prepend(&[1]))
    }

    /// Merge the first two axes: `[a, b, ..] -> [a * b, ..]`.
    pub fn merge_lead(&self) -> Result<Self> {
        let dims = self.dims();
        if dims.len() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: dims.len(),
            });
        }
        let shape = self.shape().skip(2).prepend(&[dims[0] * dims[1]]);
        self.reshape(shape)
    }

    /// Split the leading axis: `[a * b, ..] -> [a, b, ..]`.
    pub fn split_lead(&self, a: usize, b: usize) -> Result<Self> {
        let shape = self.shape().skip(1).prepend(&[a, b]);
        self.reshape(shape)
    }

    /// Sub-tensor at index `i` of the leading axis.
    pub fn index_axis0(&self, i: usize) -> Result<Self> {
        let n = self.dim0()?;
        if i >= n {
            return Err(Error::IndexOutOfBounds { index: i, size: n });
        }
        Ok(Tensor {
            data: self.data.index_axis(Axis(0), i).to_owned().into_shared(),
            dtype: self.dtype,
        })
    }

    /// Slice `start..start + len` along `axis`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Self> {
        let size = *self.dims().get(axis).ok_or(Error::DimOutOfRange {
            dim: axis,
            rank: self.rank(),
        })?;
        if start + len > size {
            return Err(Error::IndexOutOfBounds {
                index: start + len,
                size,
            });
        }
        let view = self
            .data
            .slice_axis(Axis(axis), Slice::from(start..start + len));
        Ok(Tensor {
            data: view.to_owned().into_shared(),
            dtype: self.dtype,
        })
    }

    /// Gather rows of the leading axis: `out[i] = self[rows[i]]`.
    pub fn select_rows(&self, rows: &[usize]) -> Result<Self> {
        self.select(0, rows)
    }

    /// Gather along any axis: `out[.., i, ..] = self[.., idx[i], ..]`.
    pub fn select(&self, axis: usize, idx: &[usize]) -> Result<Self> {
        let n = *self.dims().get(axis).ok_or(Error::DimOutOfRange {
            dim: axis,
            rank: self.rank(),
        })?;
        if let Some(&bad) = idx.iter().find(|&&r| r >= n) {
            return Err(Error::IndexOutOfBounds { index: bad, size: n });
        }
        Ok(Tensor {
            data: self.data.select(Axis(axis), idx).into_shared(),
            dtype: self.dtype,
        })
    }

    /// Repeat every entry of `axis` `k` times in place, so entry `b * k + j`
    /// is a copy of entry `b`.
    pub fn tile_axis(&self, axis: usize, k: usize) -> Result<Self> {
        if k == 1 {
            return Ok(self.clone());
        }
        let n = *self.dims().get(axis).ok_or(Error::DimOutOfRange {
            dim: axis,
            rank: self.rank(),
        })?;
        let idx: Vec<usize> = (0..n).flat_map(|b| std::iter::repeat(b).take(k)).collect();
        self.select(axis, &idx)
    }

    /// Repeat every row `k` times in place: `[B, ..] -> [B * k, ..]`, with
    /// row `b * k + j` a copy of row `b`.
    pub fn tile_rows(&self, k: usize) -> Result<Self> {
        self.tile_axis(0, k)
    }

    /// Stack tensors of equal shape along a new leading axis.
    pub fn stack(tensors: &[Tensor]) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::msg("cannot stack an empty list of tensors"))?;
        let views: Vec<ArrayViewD<'_, f32>> = tensors.iter().map(|t| t.data.view()).collect();
        let arr = ndarray::stack(Axis(0), &views)?;
        Ok(Tensor {
            data: arr.into_shared(),
            dtype: first.dtype,
        })
    }

    /// Concatenate along an existing axis.
    pub fn concat(tensors: &[Tensor], axis: usize) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::msg("cannot concatenate an empty list of tensors"))?;
        let views: Vec<ArrayViewD<'_, f32>> = tensors.iter().map(|t| t.data.view()).collect();
        let arr = ndarray::concatenate(Axis(axis), &views)?;
        Ok(Tensor {
            data: arr.into_shared(),
            dtype: first.dtype,
        })
    }

    /// Repeat a `[B, ..]` value over `t` time steps: `[t, B, ..]`.
    pub fn expand_time(&self, t: usize) -> Result<Self> {
        if t == 0 {
            return Ok(Tensor::zeros(self.shape().prepend(&[0]), self.dtype));
        }
        Tensor::stack(&vec![self.clone(); t])
    }

    /// Shift a time-major sequence one step later: `out[0] = first`,
    /// `out[t] = self[t - 1]`. The last frame is dropped.
    pub fn time_shift(&self, first: &Tensor) -> Result<Self> {
        let t = self.dim0()?;
        if t == 0 {
            return Ok(self.clone());
        }
        let head = first.to_dtype(self.dtype).unsqueeze0()?;
        if t == 1 {
            return Ok(head);
        }
        Tensor::concat(&[head, self.narrow(0, 0, t - 1)?], 0)
    }

    /// Reverse each sequence of a time-major `[T, B, ..]` tensor within its
    /// own length. Frames past a sequence's length are kept in place.
    pub fn reverse_sequences(&self, seq_lens: &[usize]) -> Result<Self> {
        let dims = self.dims();
        if dims.len() < 2 || dims[1] != seq_lens.len() {
            return Err(Error::msg(format!(
                "reverse_sequences: shape {} does not match {} sequence lengths",
                self.shape(),
                seq_lens.len()
            )));
        }
        let t_max = dims[0];
        let mut out = self.data.to_owned();
        for (b, &len) in seq_lens.iter().enumerate() {
            if len > t_max {
                return Err(Error::IndexOutOfBounds {
                    index: len,
                    size: t_max,
                });
            }
            for t in 0..len {
                let src = self.data.index_axis(Axis(0), len - 1 - t);
                let src = src.index_axis(Axis(0), b);
                let mut frame = out.index_axis_mut(Axis(0), t);
                frame.index_axis_mut(Axis(0), b).assign(&src);
            }
        }
        Ok(Tensor {
            data: out.into_shared(),
            dtype: self.dtype,
        })
    }

    /// `[T, B]` mask with 1.0 where `t < seq_lens[b]`.
    pub fn sequence_mask(seq_lens: &[usize], t_max: usize) -> Self {
        let b = seq_lens.len();
        let arr = ArrayD::from_shape_fn(IxDyn(&[t_max, b]), |idx| {
            if idx[0] < seq_lens[idx[1]] {
                1.0
            } else {
                0.0
            }
        });
        Self::from_array(arr, DType::F32)
    }

    // Element-wise

    /// Apply `f` to every element, keeping the dtype.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self::from_array(self.data.mapv(f), self.dtype)
    }

    fn map_to(&self, dtype: DType, f: impl Fn(f32) -> f32) -> Self {
        Self::from_array(self.data.mapv(f), dtype)
    }

    pub fn tanh(&self) -> Self {
        self.map_to(DType::F32, f32::tanh)
    }

    pub fn sigmoid(&self) -> Self {
        self.map_to(DType::F32, |v| 1.0 / (1.0 + (-v).exp()))
    }

    pub fn relu(&self) -> Self {
        self.map_to(DType::F32, |v| v.max(0.0))
    }

    pub fn exp(&self) -> Self {
        self.map_to(DType::F32, f32::exp)
    }

    pub fn log(&self) -> Self {
        self.map_to(DType::F32, f32::ln)
    }

    /// `self * mul + add`.
    pub fn affine(&self, mul: f32, add: f32) -> Self {
        self.map_to(DType::F32, |v| v * mul + add)
    }

    pub fn logical_not(&self) -> Self {
        self.map_to(DType::Bool, |v| if v != 0.0 { 0.0 } else { 1.0 })
    }

    /// Broadcasting binary op producing `dtype`.
    fn zip_with(&self, rhs: &Tensor, dtype: DType, f: impl Fn(f32, f32) -> f32) -> Result<Self> {
        let shape = Shape::broadcast_shape(&self.shape(), &rhs.shape())?;
        let mismatch = || Error::ShapeMismatch {
            expected: self.shape(),
            got: rhs.shape(),
        };
        let lhs = self.data.broadcast(IxDyn(shape.dims())).ok_or_else(mismatch)?;
        let rhs = rhs.data.broadcast(IxDyn(shape.dims())).ok_or_else(mismatch)?;
        let out = Zip::from(lhs).and(rhs).map_collect(|&a, &b| f(a, b));
        Ok(Self::from_array(out, dtype))
    }

    pub fn add(&self, rhs: &Tensor) -> Result<Self> {
        self.zip_with(rhs, self.dtype, |a, b| a + b)
    }

    pub fn sub(&self, rhs: &Tensor) -> Result<Self> {
        self.zip_with(rhs, self.dtype, |a, b| a - b)
    }

    pub fn mul(&self, rhs: &Tensor) -> Result<Self> {
        self.zip_with(rhs, self.dtype, |a, b| a * b)
    }

    pub fn div(&self, rhs: &Tensor) -> Result<Self> {
        self.zip_with(rhs, DType::F32, |a, b| a / b)
    }

    /// Element-wise comparison producing a Bool tensor.
    pub fn compare(&self, rhs: &Tensor, cmp: impl Fn(f32, f32) -> bool) -> Result<Self> {
        self.zip_with(rhs, DType::Bool, |a, b| if cmp(a, b) { 1.0 } else { 0.0 })
    }

    pub fn logical_or(&self, rhs: &Tensor) -> Result<Self> {
        self.zip_with(rhs, DType::Bool, |a, b| {
            if a != 0.0 || b != 0.0 {
                1.0
            } else {
                0.0
            }
        })
    }

    /// Select `on_true` where `mask` is set, else `on_false` (broadcasting).
    pub fn where_cond(mask: &Tensor, on_true: &Tensor, on_false: &Tensor) -> Result<Self> {
        let shape = Shape::broadcast_shape(&mask.shape(), &on_true.shape())?;
        let shape = Shape::broadcast_shape(&shape, &on_false.shape())?;
        let dim = IxDyn(shape.dims());
        let mismatch = || Error::ShapeMismatch {
            expected: shape.clone(),
            got: mask.shape(),
        };
        let m = mask.data.broadcast(dim.clone()).ok_or_else(mismatch)?;
        let a = on_true.data.broadcast(dim.clone()).ok_or_else(mismatch)?;
        let b = on_false.data.broadcast(dim).ok_or_else(mismatch)?;
        let out = Zip::from(m)
            .and(a)
            .and(b)
            .map_collect(|&m, &a, &b| if m != 0.0 { a } else { b });
        Ok(Self::from_array(out, on_true.dtype))
    }

    // Last-axis operations

    fn last_axis(&self) -> Result<Axis> {
        match self.rank() {
            0 => Err(Error::RankMismatch {
                expected: 1,
                got: 0,
            }),
            r => Ok(Axis(r - 1)),
        }
    }

    /// `[.., k] @ [k, n] -> [.., n]`.
    pub fn matmul(&self, w: &Tensor) -> Result<Self> {
        if w.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: w.rank(),
            });
        }
        let (k2, n) = (w.dims()[0], w.dims()[1]);
        let k1 = self.shape().last().ok_or(Error::RankMismatch {
            expected: 1,
            got: 0,
        })?;
        let rows = if k1 == 0 { 0 } else { self.elem_count() / k1 };
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m: rows, k1, k2, n });
        }
        let x = Array2::from_shape_vec((rows, k1), self.to_vec())?;
        let w2 = w.data.view().into_dimensionality::<Ix2>()?;
        let out = x.dot(&w2);
        let out_shape = self.shape().with_last(n);
        let out = ArrayD::from_shape_vec(IxDyn(out_shape.dims()), out.iter().copied().collect())?;
        Ok(Self::from_array(out, DType::F32))
    }

    /// Numerically stable softmax over the last axis.
    pub fn softmax(&self) -> Result<Self> {
        let axis = self.last_axis()?;
        let mut out = self.data.to_owned();
        for mut lane in out.lanes_mut(axis) {
            let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            lane.mapv_inplace(|v| (v - max).exp());
            let sum = lane.sum();
            lane.mapv_inplace(|v| v / sum);
        }
        Ok(Self::from_array(out, DType::F32))
    }

    /// Log-softmax over the last axis.
    pub fn log_softmax(&self) -> Result<Self> {
        let axis = self.last_axis()?;
        let mut out = self.data.to_owned();
        for mut lane in out.lanes_mut(axis) {
            let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            let lse = lane.fold(0.0f32, |s, &v| s + (v - max).exp()).ln() + max;
            lane.mapv_inplace(|v| v - lse);
        }
        Ok(Self::from_array(out, DType::F32))
    }

    /// Index of the largest value along the last axis (first on ties).
    pub fn argmax(&self) -> Result<Self> {
        let axis = self.last_axis()?;
        let labels: Vec<f32> = self
            .data
            .lanes(axis)
            .into_iter()
            .map(|lane| {
                let mut best = 0usize;
                for (i, &v) in lane.iter().enumerate() {
                    if v > lane[best] {
                        best = i;
                    }
                }
                best as f32
            })
            .collect();
        let shape = Shape::from(&self.dims()[..self.rank() - 1]);
        Self::from_vec(labels, shape, DType::I32)
    }

    /// Sum over the last axis.
    pub fn sum_last(&self) -> Result<Self> {
        let axis = self.last_axis()?;
        Ok(Self::from_array(self.data.sum_axis(axis), DType::F32))
    }

    /// `out[..] = self[.., idx[..]]` for a label tensor `idx`.
    pub fn pick_last(&self, idx: &Tensor) -> Result<Self> {
        let axis = self.last_axis()?;
        let classes = self.dims()[axis.index()];
        let labels = idx.to_labels();
        let lanes: Vec<_> = self.data.lanes(axis).into_iter().collect();
        if lanes.len() != labels.len() {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(&self.dims()[..axis.index()]),
                got: idx.shape(),
            });
        }
        let mut out = Vec::with_capacity(labels.len());
        for (lane, &l) in lanes.iter().zip(&labels) {
            if l >= classes {
                return Err(Error::IndexOutOfBounds {
                    index: l,
                    size: classes,
                });
            }
            out.push(lane[l]);
        }
        Self::from_vec(out, idx.shape(), DType::F32)
    }

    /// One-hot encode labels: `[..] -> [.., classes]`.
    pub fn one_hot(&self, classes: usize) -> Result<Self> {
        let labels = self.to_labels();
        let mut data = vec![0.0f32; labels.len() * classes];
        for (i, &l) in labels.iter().enumerate() {
            if l >= classes {
                return Err(Error::IndexOutOfBounds {
                    index: l,
                    size: classes,
                });
            }
            data[i * classes + l] = 1.0;
        }
        let mut dims = self.dims().to_vec();
        dims.push(classes);
        Self::from_vec(data, dims, DType::F32)
    }

    // Reductions

    pub fn sum_all(&self) -> f32 {
        self.data.sum()
    }

    /// Largest absolute element-wise difference; shapes must be equal.
    pub fn max_abs_diff(&self, other: &Tensor) -> Result<f32> {
        if self.dims() != other.dims() {
            return Err(Error::ShapeMismatch {
                expected: self.shape(),
                got: other.shape(),
            });
        }
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .fold(0.0f32, |m, (a, b)| m.max((a - b).abs())))
    }
}

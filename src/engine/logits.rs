//! Backend-agnostic logits arrays.
//!
//! The sampling functions only need a handful of numeric primitives from the
//! backend. [`LogitsArray`] names them so the backend decides *how* they run
//! (device kernel, CPU loop) while the sampler decides *what* to run.

use candle_core::{DType, Tensor, D};

use crate::error::Result;

/// Numeric array holding one row of logits (any leading dims are size 1).
pub trait LogitsArray: Clone {
    /// Elementwise division by a scalar.
    fn divide(&self, divisor: f64) -> Result<Self>;

    /// Softmax over the last dimension.
    fn softmax(&self) -> Result<Self>;

    /// Log-softmax over the last dimension.
    fn log_softmax(&self) -> Result<Self>;

    /// Elementwise exponential.
    fn exp(&self) -> Result<Self>;

    /// Elementwise natural logarithm.
    fn log(&self) -> Result<Self>;

    /// All items as `f32`, flattened in row-major order.
    fn to_vec(&self) -> Result<Vec<f32>>;
}

impl LogitsArray for Tensor {
    fn divide(&self, divisor: f64) -> Result<Self> {
        Ok((self / divisor)?)
    }

    fn softmax(&self) -> Result<Self> {
        Ok(candle_nn::ops::softmax(self, D::Minus1)?)
    }

    fn log_softmax(&self) -> Result<Self> {
        Ok(candle_nn::ops::log_softmax(self, D::Minus1)?)
    }

    fn exp(&self) -> Result<Self> {
        Ok(Tensor::exp(self)?)
    }

    fn log(&self) -> Result<Self> {
        Ok(Tensor::log(self)?)
    }

    fn to_vec(&self) -> Result<Vec<f32>> {
        Ok(self.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_tensor_divide_and_items() {
        let logits = Tensor::new(&[[[2.0f32, 4.0, 6.0]]], &Device::Cpu).unwrap();
        let scaled = LogitsArray::divide(&logits, 2.0).unwrap();
        assert_eq!(scaled.to_vec().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_tensor_softmax_sums_to_one() {
        let logits = Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap();
        let probs = LogitsArray::softmax(&logits).unwrap().to_vec().unwrap();
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_tensor_f16_items() {
        let logits = Tensor::new(&[1.0f32, 2.0], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        assert_eq!(logits.to_vec().unwrap(), vec![1.0, 2.0]);
    }
}

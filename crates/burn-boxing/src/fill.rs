use alloc::vec;
use burn_tensor::{DType, TensorData};
use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// The constant a fill produces.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillKind {
    /// Every element is one.
    Ones,
    /// Every element is zero.
    Zeros,
}

/// A fill resolved for one dtype.
///
/// Only the value matching [`is_floating`](Self::is_floating) is meaningful; the other one
/// is zero.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FillConfig {
    /// Element type of the filled buffer.
    pub dtype: DType,
    /// Fill value for floating point dtypes.
    pub floating_value: f64,
    /// Fill value for integer dtypes.
    pub integer_value: i64,
    /// Whether `dtype` is a floating point type.
    pub is_floating: bool,
}

impl FillKind {
    /// Resolves the fill for `dtype`, defaulting to [`DType::F32`].
    pub fn config(self, dtype: Option<DType>) -> Result<FillConfig, ConfigError> {
        let dtype = dtype.unwrap_or(DType::F32);
        let is_floating = match dtype {
            DType::F64 | DType::F32 | DType::F16 | DType::BF16 => true,
            DType::I64
            | DType::I32
            | DType::I16
            | DType::I8
            | DType::U64
            | DType::U32
            | DType::U16
            | DType::U8 => false,
            dtype => return Err(ConfigError::UnsupportedFillDType { dtype }),
        };
        let value = match self {
            FillKind::Ones => 1,
            FillKind::Zeros => 0,
        };

        Ok(FillConfig {
            dtype,
            floating_value: if is_floating { value as f64 } else { 0.0 },
            integer_value: if is_floating { 0 } else { value },
            is_floating,
        })
    }
}

impl FillConfig {
    /// A buffer of `shape` holding the fill value in every element.
    pub fn data(&self, shape: &[usize]) -> Result<TensorData, ConfigError> {
        let numel = shape.iter().product::<usize>();
        let float = self.floating_value;
        let int = self.integer_value;
        let data = match self.dtype {
            DType::F64 => TensorData::new(vec![float; numel], shape.to_vec()),
            DType::F32 => TensorData::new(vec![float as f32; numel], shape.to_vec()),
            DType::F16 => TensorData::new(vec![f16::from_f64(float); numel], shape.to_vec()),
            DType::BF16 => TensorData::new(vec![bf16::from_f64(float); numel], shape.to_vec()),
            DType::I64 => TensorData::new(vec![int; numel], shape.to_vec()),
            DType::I32 => TensorData::new(vec![int as i32; numel], shape.to_vec()),
            DType::I16 => TensorData::new(vec![int as i16; numel], shape.to_vec()),
            DType::I8 => TensorData::new(vec![int as i8; numel], shape.to_vec()),
            DType::U64 => TensorData::new(vec![int as u64; numel], shape.to_vec()),
            DType::U32 => TensorData::new(vec![int as u32; numel], shape.to_vec()),
            DType::U16 => TensorData::new(vec![int as u16; numel], shape.to_vec()),
            DType::U8 => TensorData::new(vec![int as u8; numel], shape.to_vec()),
            dtype => return Err(ConfigError::UnsupportedFillDType { dtype }),
        };
        Ok(data)
    }
}

use burn_tensor::{DType, TensorData};
use core::fmt::Debug;
use core::ops::Add;
use half::{bf16, f16};

use super::CollectiveError;

fn payload_error<E: Debug>(err: E) -> CollectiveError {
    CollectiveError::Payload(format!("{err:?}"))
}

macro_rules! sum_elementwise {
    ($parts:expr, $elem:ty, $add:path) => {{
        let mut acc = $parts[0].to_vec::<$elem>().map_err(payload_error)?;
        for part in &$parts[1..] {
            let values = part.as_slice::<$elem>().map_err(payload_error)?;
            for (acc, value) in acc.iter_mut().zip(values) {
                *acc = $add(*acc, *value);
            }
        }
        TensorData::new(acc, $parts[0].shape.clone())
    }};
}

/// Elementwise sum of `parts`, accumulated in order and in the parts' own dtype.
///
/// Floats are added with IEEE semantics, integers wrap on overflow. Summing the same parts
/// in the same order yields bit-identical results on every participant.
pub fn sum_data(parts: &[TensorData]) -> Result<TensorData, CollectiveError> {
    let first = parts
        .first()
        .ok_or_else(|| CollectiveError::Payload("nothing to reduce".into()))?;
    if let Some(other) = parts
        .iter()
        .find(|part| part.shape != first.shape || part.dtype != first.dtype)
    {
        return Err(CollectiveError::Payload(format!(
            "cannot sum {:?} {:?} with {:?} {:?}",
            first.dtype, first.shape, other.dtype, other.shape
        )));
    }

    let sum = match first.dtype {
        DType::F64 => sum_elementwise!(parts, f64, Add::add),
        DType::F32 => sum_elementwise!(parts, f32, Add::add),
        DType::F16 => sum_elementwise!(parts, f16, Add::add),
        DType::BF16 => sum_elementwise!(parts, bf16, Add::add),
        DType::I64 => sum_elementwise!(parts, i64, i64::wrapping_add),
        DType::I32 => sum_elementwise!(parts, i32, i32::wrapping_add),
        DType::I16 => sum_elementwise!(parts, i16, i16::wrapping_add),
        DType::I8 => sum_elementwise!(parts, i8, i8::wrapping_add),
        DType::U64 => sum_elementwise!(parts, u64, u64::wrapping_add),
        DType::U32 => sum_elementwise!(parts, u32, u32::wrapping_add),
        DType::U16 => sum_elementwise!(parts, u16, u16::wrapping_add),
        DType::U8 => sum_elementwise!(parts, u8, u8::wrapping_add),
        dtype => {
            return Err(CollectiveError::Payload(format!(
                "sum is not defined for dtype {dtype:?}"
            )));
        }
    };
    Ok(sum)
}

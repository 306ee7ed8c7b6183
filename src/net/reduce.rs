// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Element-wise reductions over host byte buffers
//!
//! Used by the loopback transport and by the local steps of decomposed
//! operations. Callers fold contributions in rank order, which keeps floating
//! point results identical between native and decomposed paths.

use half::{bf16, f16};

use crate::data_types::DataType;
use crate::error::{CommError, CommResult};
use crate::net::comm_operations::ReduceOp;

/// Check that `op` is defined for `data_type`
pub fn check_reduce_op(data_type: DataType, op: ReduceOp) -> CommResult<()> {
    if op.is_bitwise() && data_type.is_floating() {
        return Err(CommError::invalid(format!(
            "{:?} is not defined for {} data",
            op, data_type
        )));
    }
    if op == ReduceOp::Avg && data_type.is_integer() {
        return Err(CommError::invalid(format!(
            "Avg is only supported for floating point data, got {}",
            data_type
        )));
    }
    Ok(())
}

trait Lane: Copy {
    const WIDTH: usize;
    fn load(bytes: &[u8]) -> Self;
    fn store(self, bytes: &mut [u8]);
    fn combine(op: ReduceOp, a: Self, b: Self) -> Option<Self>;
    fn divide(self, n: usize) -> Self;
}

macro_rules! int_lane {
    ($($t:ty),*) => {$(
        impl Lane for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn load(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_ne_bytes(raw)
            }

            fn store(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_ne_bytes());
            }

            fn combine(op: ReduceOp, a: Self, b: Self) -> Option<Self> {
                Some(match op {
                    ReduceOp::Sum => a.wrapping_add(b),
                    ReduceOp::Prod => a.wrapping_mul(b),
                    ReduceOp::Min => a.min(b),
                    ReduceOp::Max => a.max(b),
                    ReduceOp::Band => a & b,
                    ReduceOp::Bor => a | b,
                    ReduceOp::Bxor => a ^ b,
                    ReduceOp::Avg => return None,
                })
            }

            fn divide(self, n: usize) -> Self {
                self / (n as $t)
            }
        }
    )*};
}

int_lane!(u8, i8, i16, i32, i64);

macro_rules! float_lane {
    ($($t:ty),*) => {$(
        impl Lane for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn load(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_ne_bytes(raw)
            }

            fn store(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_ne_bytes());
            }

            fn combine(op: ReduceOp, a: Self, b: Self) -> Option<Self> {
                Some(match op {
                    ReduceOp::Sum | ReduceOp::Avg => a + b,
                    ReduceOp::Prod => a * b,
                    ReduceOp::Min => a.min(b),
                    ReduceOp::Max => a.max(b),
                    ReduceOp::Band | ReduceOp::Bor | ReduceOp::Bxor => return None,
                })
            }

            fn divide(self, n: usize) -> Self {
                self / (n as $t)
            }
        }
    )*};
}

float_lane!(f32, f64);

// Half precision types accumulate through f32 per step.
macro_rules! half_lane {
    ($($t:ty),*) => {$(
        impl Lane for $t {
            const WIDTH: usize = 2;

            fn load(bytes: &[u8]) -> Self {
                <$t>::from_bits(u16::from_ne_bytes([bytes[0], bytes[1]]))
            }

            fn store(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_bits().to_ne_bytes());
            }

            fn combine(op: ReduceOp, a: Self, b: Self) -> Option<Self> {
                let r = <f32 as Lane>::combine(op, a.to_f32(), b.to_f32())?;
                Some(<$t>::from_f32(r))
            }

            fn divide(self, n: usize) -> Self {
                <$t>::from_f32(self.to_f32() / n as f32)
            }
        }
    )*};
}

half_lane!(f16, bf16);

fn fold<T: Lane>(op: ReduceOp, acc: &mut [u8], src: &[u8]) -> CommResult<()> {
    for (a, s) in acc.chunks_exact_mut(T::WIDTH).zip(src.chunks_exact(T::WIDTH)) {
        let value = T::combine(op, T::load(a), T::load(s))
            .ok_or_else(|| CommError::invalid(format!("{:?} is not defined for this type", op)))?;
        value.store(a);
    }
    Ok(())
}

fn scale<T: Lane>(acc: &mut [u8], n: usize) {
    for a in acc.chunks_exact_mut(T::WIDTH) {
        T::load(a).divide(n).store(a);
    }
}

/// `acc[i] = op(acc[i], src[i])` for every element
pub fn reduce_into(
    data_type: DataType,
    op: ReduceOp,
    acc: &mut [u8],
    src: &[u8],
) -> CommResult<()> {
    check_reduce_op(data_type, op)?;
    if acc.len() != src.len() || acc.len() % data_type.size_in_bytes() != 0 {
        return Err(CommError::invalid(format!(
            "reduction over mismatched buffers ({} vs {} bytes of {})",
            acc.len(),
            src.len(),
            data_type
        )));
    }
    match data_type {
        DataType::UInt8 => fold::<u8>(op, acc, src),
        DataType::Int8 => fold::<i8>(op, acc, src),
        DataType::Int16 => fold::<i16>(op, acc, src),
        DataType::Int32 => fold::<i32>(op, acc, src),
        DataType::Int64 => fold::<i64>(op, acc, src),
        DataType::HalfFloat => fold::<f16>(op, acc, src),
        DataType::BFloat16 => fold::<bf16>(op, acc, src),
        DataType::Float => fold::<f32>(op, acc, src),
        DataType::Double => fold::<f64>(op, acc, src),
    }
}

/// Apply the final step of `op` after `contributors` inputs were folded
pub fn finish_reduction(data_type: DataType, op: ReduceOp, acc: &mut [u8], contributors: usize) {
    if op != ReduceOp::Avg || contributors == 0 {
        return;
    }
    match data_type {
        DataType::HalfFloat => scale::<f16>(acc, contributors),
        DataType::BFloat16 => scale::<bf16>(acc, contributors),
        DataType::Float => scale::<f32>(acc, contributors),
        DataType::Double => scale::<f64>(acc, contributors),
        // Avg is rejected for integers before any data moves
        _ => {}
    }
}

/// Fold `parts` in order into a fresh buffer and finish the reduction
pub fn reduce_all<'a, I>(data_type: DataType, op: ReduceOp, mut parts: I) -> CommResult<Vec<u8>>
where
    I: Iterator<Item = &'a [u8]>,
{
    let first = parts
        .next()
        .ok_or_else(|| CommError::invalid("reduction without contributions"))?;
    let mut acc = first.to_vec();
    let mut contributors = 1;
    for part in parts {
        reduce_into(data_type, op, &mut acc, part)?;
        contributors += 1;
    }
    finish_reduction(data_type, op, &mut acc, contributors);
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_f32(v: &[f32]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_ne_bytes()).collect()
    }

    fn to_f32(b: &[u8]) -> Vec<f32> {
        b.chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_sum_f32() {
        let a = bytes_f32(&[1.0, 2.0, 3.0]);
        let b = bytes_f32(&[0.5, 0.5, 0.5]);
        let inputs = [a.as_slice(), b.as_slice()];
        let out = reduce_all(DataType::Float, ReduceOp::Sum, inputs.into_iter()).unwrap();
        assert_eq!(to_f32(&out), vec![1.5, 2.5, 3.5]);
    }

    #[test]
    fn test_avg_f32() {
        let a = bytes_f32(&[2.0, 4.0]);
        let b = bytes_f32(&[4.0, 8.0]);
        let inputs = [a.as_slice(), b.as_slice()];
        let out = reduce_all(DataType::Float, ReduceOp::Avg, inputs.into_iter()).unwrap();
        assert_eq!(to_f32(&out), vec![3.0, 6.0]);
    }

    #[test]
    fn test_integer_ops() {
        let mut acc: Vec<u8> = [5i32, -3].iter().flat_map(|x| x.to_ne_bytes()).collect();
        let src: Vec<u8> = [2i32, 7].iter().flat_map(|x| x.to_ne_bytes()).collect();
        reduce_into(DataType::Int32, ReduceOp::Max, &mut acc, &src).unwrap();
        let got: Vec<i32> = acc
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(got, vec![5, 7]);

        let mut acc = vec![0b1100u8];
        reduce_into(DataType::UInt8, ReduceOp::Bxor, &mut acc, &[0b1010]).unwrap();
        assert_eq!(acc, vec![0b0110]);
    }

    #[test]
    fn test_half_sum() {
        let a = bf16::from_f32(1.5).to_bits().to_ne_bytes();
        let b = bf16::from_f32(2.0).to_bits().to_ne_bytes();
        let out = reduce_all(
            DataType::BFloat16,
            ReduceOp::Sum,
            [a.as_slice(), b.as_slice()].into_iter(),
        )
        .unwrap();
        let v = bf16::from_bits(u16::from_ne_bytes([out[0], out[1]]));
        assert_eq!(v.to_f32(), 3.5);
    }

    #[test]
    fn test_invalid_combinations() {
        assert!(check_reduce_op(DataType::Float, ReduceOp::Band).is_err());
        assert!(check_reduce_op(DataType::Int64, ReduceOp::Avg).is_err());
        assert!(check_reduce_op(DataType::Int64, ReduceOp::Bor).is_ok());
        let mut acc = vec![0u8; 4];
        assert!(reduce_into(DataType::Float, ReduceOp::Sum, &mut acc, &[0u8; 8]).is_err());
    }
}

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

//! Element types carried by buffer descriptors

use std::fmt;

use half::{bf16, f16};

/// The element type of a communication buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Unsigned 8-bit integer
    UInt8,
    /// Signed 8-bit integer
    Int8,
    /// Signed 16-bit integer
    Int16,
    /// Signed 32-bit integer
    Int32,
    /// Signed 64-bit integer
    Int64,
    /// 2-byte IEEE floating point value
    HalfFloat,
    /// 2-byte brain floating point value
    BFloat16,
    /// 4-byte floating point value
    Float,
    /// 8-byte floating point value
    Double,
}

impl DataType {
    /// Width of one element in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::UInt8 | DataType::Int8 => 1,
            DataType::Int16 | DataType::HalfFloat | DataType::BFloat16 => 2,
            DataType::Int32 | DataType::Float => 4,
            DataType::Int64 | DataType::Double => 8,
        }
    }

    pub fn is_floating(&self) -> bool {
        matches!(
            self,
            DataType::HalfFloat | DataType::BFloat16 | DataType::Float | DataType::Double
        )
    }

    pub fn is_integer(&self) -> bool {
        !self.is_floating()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::UInt8 => "uint8",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::HalfFloat => "float16",
            DataType::BFloat16 => "bfloat16",
            DataType::Float => "float32",
            DataType::Double => "float64",
        };
        f.write_str(name)
    }
}

/// Rust scalar types that map onto a [`DataType`]
///
/// Implemented only for plain-old-data types whose every bit pattern is valid.
pub trait Element: Copy + Send + Sync + 'static {
    const DATA_TYPE: DataType;
}

macro_rules! impl_element {
    ($($t:ty => $dt:ident),* $(,)?) => {
        $(impl Element for $t {
            const DATA_TYPE: DataType = DataType::$dt;
        })*
    };
}

impl_element! {
    u8 => UInt8,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f16 => HalfFloat,
    bf16 => BFloat16,
    f32 => Float,
    f64 => Double,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_match_rust_types() {
        assert_eq!(DataType::Float.size_in_bytes(), std::mem::size_of::<f32>());
        assert_eq!(DataType::HalfFloat.size_in_bytes(), std::mem::size_of::<f16>());
        assert_eq!(DataType::Int64.size_in_bytes(), std::mem::size_of::<i64>());
        assert_eq!(<bf16 as Element>::DATA_TYPE, DataType::BFloat16);
    }

    #[test]
    fn test_classes() {
        assert!(DataType::Double.is_floating());
        assert!(DataType::Int8.is_integer());
        assert_eq!(DataType::Float.to_string(), "float32");
    }
}

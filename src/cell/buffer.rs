use crate::n5::DataType;

/// Flat cell data, one variant per supported element type.
#[derive(Clone, Debug, PartialEq)]
pub enum TypedBuffer {
    Uint8(Vec<u8>),
    Int8(Vec<i8>),
    Uint16(Vec<u16>),
    Int16(Vec<i16>),
    Uint32(Vec<u32>),
    Int32(Vec<i32>),
    Uint64(Vec<u64>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

/// A single element read out of a [`TypedBuffer`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    Uint8(u8),
    Int8(i8),
    Uint16(u16),
    Int16(i16),
    Uint32(u32),
    Int32(i32),
    Uint64(u64),
    Int64(i64),
    Float32(f32),
    Float64(f64),
}

macro_rules! dispatch {
    ($buffer:expr, $data:ident => $body:expr) => {
        match $buffer {
            TypedBuffer::Uint8($data) => $body,
            TypedBuffer::Int8($data) => $body,
            TypedBuffer::Uint16($data) => $body,
            TypedBuffer::Int16($data) => $body,
            TypedBuffer::Uint32($data) => $body,
            TypedBuffer::Int32($data) => $body,
            TypedBuffer::Uint64($data) => $body,
            TypedBuffer::Int64($data) => $body,
            TypedBuffer::Float32($data) => $body,
            TypedBuffer::Float64($data) => $body,
        }
    };
}

macro_rules! by_data_type {
    ($data_type:expr, $t:ident => $body:expr) => {
        match $data_type {
            DataType::Uint8 => { type $t = u8; $body }
            DataType::Int8 => { type $t = i8; $body }
            DataType::Uint16 => { type $t = u16; $body }
            DataType::Int16 => { type $t = i16; $body }
            DataType::Uint32 => { type $t = u32; $body }
            DataType::Int32 => { type $t = i32; $body }
            DataType::Uint64 => { type $t = u64; $body }
            DataType::Int64 => { type $t = i64; $body }
            DataType::Float32 => { type $t = f32; $body }
            DataType::Float64 => { type $t = f64; $body }
        }
    };
}

/// Primitive element types that can live in a [`TypedBuffer`].
pub trait Element: Copy + Send + Sync + 'static {
    const DATA_TYPE: DataType;
    const SIZE: usize = std::mem::size_of::<Self>();

    /// Saturating conversion, used for fill values.
    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;
    fn from_be_slice(bytes: &[u8]) -> Self;
    fn extend_le(self, out: &mut Vec<u8>);
    fn into_value(self) -> Value;
    fn wrap(data: Vec<Self>) -> TypedBuffer;
    fn slice(buffer: &TypedBuffer) -> Option<&[Self]>;
    fn slice_mut(buffer: &mut TypedBuffer) -> Option<&mut [Self]>;
}

macro_rules! element_impl {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const DATA_TYPE: DataType = DataType::$variant;

            fn from_f64(value: f64) -> Self {
                value as $ty
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_be_slice(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                <$ty>::from_be_bytes(raw)
            }
            fn extend_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn into_value(self) -> Value {
                Value::$variant(self)
            }
            fn wrap(data: Vec<Self>) -> TypedBuffer {
                TypedBuffer::$variant(data)
            }
            fn slice(buffer: &TypedBuffer) -> Option<&[Self]> {
                match buffer {
                    TypedBuffer::$variant(data) => Some(data),
                    _ => None,
                }
            }
            fn slice_mut(buffer: &mut TypedBuffer) -> Option<&mut [Self]> {
                match buffer {
                    TypedBuffer::$variant(data) => Some(data),
                    _ => None,
                }
            }
        }
    };
}

element_impl!(u8, Uint8);
element_impl!(i8, Int8);
element_impl!(u16, Uint16);
element_impl!(i16, Int16);
element_impl!(u32, Uint32);
element_impl!(i32, Int32);
element_impl!(u64, Uint64);
element_impl!(i64, Int64);
element_impl!(f32, Float32);
element_impl!(f64, Float64);

impl Value {
    pub fn fill(data_type: DataType, value: f64) -> Self {
        by_data_type!(data_type, T => T::from_f64(value).into_value())
    }
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Uint8(_) => DataType::Uint8,
            Value::Int8(_) => DataType::Int8,
            Value::Uint16(_) => DataType::Uint16,
            Value::Int16(_) => DataType::Int16,
            Value::Uint32(_) => DataType::Uint32,
            Value::Int32(_) => DataType::Int32,
            Value::Uint64(_) => DataType::Uint64,
            Value::Int64(_) => DataType::Int64,
            Value::Float32(_) => DataType::Float32,
            Value::Float64(_) => DataType::Float64,
        }
    }
    pub fn to_f64(self) -> f64 {
        match self {
            Value::Uint8(v) => v as f64,
            Value::Int8(v) => v as f64,
            Value::Uint16(v) => v as f64,
            Value::Int16(v) => v as f64,
            Value::Uint32(v) => v as f64,
            Value::Int32(v) => v as f64,
            Value::Uint64(v) => v as f64,
            Value::Int64(v) => v as f64,
            Value::Float32(v) => v as f64,
            Value::Float64(v) => v,
        }
    }
}

impl TypedBuffer {
    /// Allocates `len` elements, all set to `fill`.
    pub fn filled(data_type: DataType, len: usize, fill: f64) -> Self {
        by_data_type!(data_type, T => T::wrap(vec![T::from_f64(fill); len]))
    }

    /// Decodes `num_elements` big-endian elements. Returns `None` if `bytes` is too short.
    pub fn from_be_bytes(data_type: DataType, bytes: &[u8], num_elements: usize) -> Option<Self> {
        by_data_type!(data_type, T => {
            if bytes.len() < num_elements * T::SIZE {
                return None;
            }
            let data: Vec<T> = bytes
                .chunks_exact(T::SIZE)
                .take(num_elements)
                .map(T::from_be_slice)
                .collect();
            Some(T::wrap(data))
        })
    }

    pub fn data_type(&self) -> DataType {
        match self {
            TypedBuffer::Uint8(_) => DataType::Uint8,
            TypedBuffer::Int8(_) => DataType::Int8,
            TypedBuffer::Uint16(_) => DataType::Uint16,
            TypedBuffer::Int16(_) => DataType::Int16,
            TypedBuffer::Uint32(_) => DataType::Uint32,
            TypedBuffer::Int32(_) => DataType::Int32,
            TypedBuffer::Uint64(_) => DataType::Uint64,
            TypedBuffer::Int64(_) => DataType::Int64,
            TypedBuffer::Float32(_) => DataType::Float32,
            TypedBuffer::Float64(_) => DataType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        dispatch!(self, data => data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Panics if `index` is out of range.
    pub fn get(&self, index: usize) -> Value {
        dispatch!(self, data => data[index].into_value())
    }

    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::slice(self)
    }

    /// Copies an n-dimensional region out of `src` into `self`, see [`nd_array_copy`].
    /// Returns `false` (and copies nothing) if the element types differ.
    pub fn copy_region_from(
        &mut self,
        src: &TypedBuffer,
        src_dims: &[usize],
        src_pos: &[usize],
        dest_dims: &[usize],
        dest_pos: &[usize],
        size: &[usize],
    ) -> bool {
        dispatch!(src, src_data => copy_into(src_data, self, src_dims, src_pos, dest_dims, dest_pos, size))
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        dispatch!(self, data => {
            let mut out = Vec::with_capacity(std::mem::size_of_val(&data[..]));
            for v in data.iter() {
                v.extend_le(&mut out);
            }
            out
        })
    }
}

fn copy_into<T: Element>(
    src: &[T],
    dest: &mut TypedBuffer,
    src_dims: &[usize],
    src_pos: &[usize],
    dest_dims: &[usize],
    dest_pos: &[usize],
    size: &[usize],
) -> bool {
    match T::slice_mut(dest) {
        Some(dest) => {
            nd_array_copy(src, src_dims, src_pos, dest, dest_dims, dest_pos, size);
            true
        }
        None => false,
    }
}

/// Like `copy_from_slice` but for flattened n-dimensional arrays.
///
/// Axis 0 is the contiguous one. Copies the box of extent `size` starting at
/// `src_pos` in `src` (shaped `src_dims`) to `dest_pos` in `dest` (shaped `dest_dims`).
pub fn nd_array_copy<T: Copy>(
    src: &[T],
    src_dims: &[usize],
    src_pos: &[usize],
    dest: &mut [T],
    dest_dims: &[usize],
    dest_pos: &[usize],
    size: &[usize],
) {
    let n = src_dims.len();
    if n == 0 || size.iter().any(|&s| s == 0) {
        return;
    }
    let mut src_stride = 1;
    let mut dest_stride = 1;
    let mut src_offset = 0;
    let mut dest_offset = 0;
    for d in 0..n {
        src_offset += src_stride * src_pos[d];
        src_stride *= src_dims[d];
        dest_offset += dest_stride * dest_pos[d];
        dest_stride *= dest_dims[d];
    }
    copy_axis(n - 1, src, src_dims, src_offset, dest, dest_dims, dest_offset, size);
}

#[allow(clippy::too_many_arguments)]
fn copy_axis<T: Copy>(
    d: usize,
    src: &[T],
    src_dims: &[usize],
    src_offset: usize,
    dest: &mut [T],
    dest_dims: &[usize],
    dest_offset: usize,
    size: &[usize],
) {
    if d == 0 {
        dest[dest_offset..dest_offset + size[0]].copy_from_slice(&src[src_offset..src_offset + size[0]]);
    } else {
        let src_stride: usize = src_dims[..d].iter().product();
        let dest_stride: usize = dest_dims[..d].iter().product();
        for x in 0..size[d] {
            copy_axis(
                d - 1,
                src,
                src_dims,
                src_offset + x * src_stride,
                dest,
                dest_dims,
                dest_offset + x * dest_stride,
                size,
            );
        }
    }
}

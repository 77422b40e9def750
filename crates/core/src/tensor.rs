use std::{fmt, sync::Arc};

use crate::{dim::Dimensions, fixed_dim::FixedDimensions};

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dims: FixedDimensions,
    data: Arc<TensorData>,
}

/// Element storage of a [`Tensor`].
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Bool(Vec<bool>),
    F32(Vec<f32>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

/// Represents a type and shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypedFixedShape {
    pub dims: FixedDimensions,
    pub elem_ty: TensorElemType,
}

/// Represents a type and shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypedShape {
    pub dims: Dimensions,
    pub elem_ty: TensorElemType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorElemType {
    Bool,
    F32,
    I32,
    I64,
}

pub trait TensorElemTypeExt: PartialEq + PartialOrd + Copy + fmt::Debug {
    fn get_type() -> TensorElemType;
    fn zero() -> Self;
    fn one() -> Self;
    fn close(a: Self, b: Self) -> bool;
    fn wrap(data: Vec<Self>) -> TensorData;
    fn unwrap(data: &TensorData) -> Option<&[Self]>;
    fn write_le(self, buf: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

impl Tensor {
    pub fn new<T: TensorElemTypeExt>(dims: FixedDimensions, data: Vec<T>) -> Self {
        debug_assert_eq!(dims.total_elems(), data.len());
        Self {
            dims,
            data: Arc::new(T::wrap(data)),
        }
    }

    /// Returns a rank-0 tensor.
    pub fn scalar<T: TensorElemTypeExt>(value: T) -> Self {
        Self::new(FixedDimensions(vec![]), vec![value])
    }

    pub fn ones<T: TensorElemTypeExt>(dims: FixedDimensions) -> Self {
        let total_elems = dims.total_elems();
        Self::new(dims, vec![T::one(); total_elems])
    }

    /// Decodes little-endian `bytes` (ONNX `raw_data`) into a tensor.
    /// Returns `None` if the byte length does not match `dims`.
    pub fn from_raw_bytes(
        dims: FixedDimensions,
        elem_ty: TensorElemType,
        bytes: &[u8],
    ) -> Option<Self> {
        fn decode<T: TensorElemTypeExt>(dims: FixedDimensions, bytes: &[u8]) -> Option<Tensor> {
            let size = T::get_type().size();
            if bytes.len() != dims.total_elems() * size {
                return None;
            }
            let data = bytes.chunks_exact(size).map(T::read_le).collect();
            Some(Tensor::new(dims, data))
        }

        match elem_ty {
            TensorElemType::Bool => decode::<bool>(dims, bytes),
            TensorElemType::F32 => decode::<f32>(dims, bytes),
            TensorElemType::I32 => decode::<i32>(dims, bytes),
            TensorElemType::I64 => decode::<i64>(dims, bytes),
        }
    }

    pub fn to_raw_bytes(&self) -> Vec<u8> {
        fn encode<T: TensorElemTypeExt>(data: &[T]) -> Vec<u8> {
            let mut buf = Vec::with_capacity(data.len() * T::get_type().size());
            for &x in data {
                x.write_le(&mut buf);
            }
            buf
        }

        match &*self.data {
            TensorData::Bool(d) => encode(d),
            TensorData::F32(d) => encode(d),
            TensorData::I32(d) => encode(d),
            TensorData::I64(d) => encode(d),
        }
    }

    pub fn dims(&self) -> &FixedDimensions {
        &self.dims
    }

    pub fn elem_ty(&self) -> TensorElemType {
        match &*self.data {
            TensorData::Bool(_) => TensorElemType::Bool,
            TensorData::F32(_) => TensorElemType::F32,
            TensorData::I32(_) => TensorElemType::I32,
            TensorData::I64(_) => TensorElemType::I64,
        }
    }

    pub fn data<T: TensorElemTypeExt>(&self) -> &[T] {
        assert_eq!(self.elem_ty(), T::get_type());
        T::unwrap(&self.data).unwrap_or_default()
    }

    pub fn try_data<T: TensorElemTypeExt>(&self) -> Option<&[T]> {
        T::unwrap(&self.data)
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_scalar() && self.dims.total_elems() == 1
    }

    /// The single element of a scalar `f32` tensor.
    pub fn scalar_f32(&self) -> Option<f32> {
        if !self.is_scalar() {
            return None;
        }
        self.try_data::<f32>().map(|d| d[0])
    }

    pub fn allclose<T: TensorElemTypeExt>(&self, other: &[T]) -> bool {
        let Some(x) = self.try_data::<T>() else {
            return false;
        };
        if x.len() != other.len() {
            return false;
        }

        x.iter().zip(other.iter()).all(|(&x, &y)| T::close(x, y))
    }

    pub fn byte_len(&self) -> usize {
        self.dims.total_elems() * self.elem_ty().size()
    }
}

impl TypedFixedShape {
    pub fn new(dims: FixedDimensions, elem_ty: TensorElemType) -> Self {
        Self { dims, elem_ty }
    }
}

impl TypedShape {
    pub fn new(dims: Dimensions, elem_ty: TensorElemType) -> Self {
        Self { dims, elem_ty }
    }
}

impl From<TypedFixedShape> for TypedShape {
    fn from(typed: TypedFixedShape) -> Self {
        Self {
            dims: typed.dims.into(),
            elem_ty: typed.elem_ty,
        }
    }
}

impl TensorElemType {
    pub fn size(&self) -> usize {
        match self {
            TensorElemType::Bool => 1,
            TensorElemType::F32 => 4,
            TensorElemType::I32 => 4,
            TensorElemType::I64 => 8,
        }
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Self::Bool)
    }

    pub fn is_f32(&self) -> bool {
        matches!(self, Self::F32)
    }

    pub fn is_i32(&self) -> bool {
        matches!(self, Self::I32)
    }

    pub fn is_i64(&self) -> bool {
        matches!(self, Self::I64)
    }
}

impl TensorElemTypeExt for bool {
    fn get_type() -> TensorElemType {
        TensorElemType::Bool
    }

    fn zero() -> Self {
        false
    }

    fn one() -> Self {
        true
    }

    fn close(a: Self, b: Self) -> bool {
        a == b
    }

    fn wrap(data: Vec<Self>) -> TensorData {
        TensorData::Bool(data)
    }

    fn unwrap(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::Bool(d) => Some(d),
            _ => None,
        }
    }

    fn write_le(self, buf: &mut Vec<u8>) {
        buf.push(self as u8)
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

impl TensorElemTypeExt for f32 {
    fn get_type() -> TensorElemType {
        TensorElemType::F32
    }

    fn zero() -> Self {
        0.
    }

    fn one() -> Self {
        1.
    }

    fn close(a: Self, b: Self) -> bool {
        ((a - b).abs() <= 1e-5) || (a.is_nan() && b.is_nan())
    }

    fn wrap(data: Vec<Self>) -> TensorData {
        TensorData::F32(data)
    }

    fn unwrap(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::F32(d) => Some(d),
            _ => None,
        }
    }

    fn write_le(self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes())
    }

    fn read_le(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl TensorElemTypeExt for i32 {
    fn get_type() -> TensorElemType {
        TensorElemType::I32
    }

    fn zero() -> Self {
        0
    }

    fn one() -> Self {
        1
    }

    fn close(a: Self, b: Self) -> bool {
        a == b
    }

    fn wrap(data: Vec<Self>) -> TensorData {
        TensorData::I32(data)
    }

    fn unwrap(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::I32(d) => Some(d),
            _ => None,
        }
    }

    fn write_le(self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes())
    }

    fn read_le(bytes: &[u8]) -> Self {
        i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl TensorElemTypeExt for i64 {
    fn get_type() -> TensorElemType {
        TensorElemType::I64
    }

    fn zero() -> Self {
        0
    }

    fn one() -> Self {
        1
    }

    fn close(a: Self, b: Self) -> bool {
        a == b
    }

    fn wrap(data: Vec<Self>) -> TensorData {
        TensorData::I64(data)
    }

    fn unwrap(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::I64(d) => Some(d),
            _ => None,
        }
    }

    fn write_le(self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes())
    }

    fn read_le(bytes: &[u8]) -> Self {
        let mut b = [0u8; 8];
        b.copy_from_slice(&bytes[..8]);
        i64::from_le_bytes(b)
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({:?}, {:?}, ", self.elem_ty(), self.dims)?;
        match &*self.data {
            TensorData::Bool(d) => write!(f, "{d:?})"),
            TensorData::F32(d) => write!(f, "{d:?})"),
            TensorData::I32(d) => write!(f, "{d:?})"),
            TensorData::I64(d) => write!(f, "{d:?})"),
        }
    }
}

#[test]
fn create_tensors() {
    let t = Tensor::ones::<f32>(vec![3].into());
    assert_eq!(t.elem_ty(), TensorElemType::F32);
    assert_eq!(t.data::<f32>(), &[1.0, 1.0, 1.0]);
    assert!(!t.is_scalar());

    let s = Tensor::scalar(0.5f32);
    assert!(s.is_scalar());
    assert_eq!(s.scalar_f32(), Some(0.5));
    assert_eq!(Tensor::scalar(2i64).scalar_f32(), None);
}

#[test]
fn raw_bytes() {
    let t = Tensor::new::<f32>(vec![2].into(), vec![1.5, -3.0]);
    let bytes = t.to_raw_bytes();
    assert_eq!(bytes.len(), t.byte_len());
    assert_eq!(
        Tensor::from_raw_bytes(vec![2].into(), TensorElemType::F32, &bytes),
        Some(t)
    );
    assert_eq!(
        Tensor::from_raw_bytes(vec![3].into(), TensorElemType::F32, &bytes),
        None
    );
}

#[test]
fn test_allclose() {
    let t = Tensor::scalar(1.4142135f32);
    assert!(t.allclose(&[1.4142135f32]));
    assert!(!t.allclose(&[1.41f32]));
    assert!(!t.allclose(&[1i64]));
}

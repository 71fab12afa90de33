use itertools::Itertools;
use thiserror::Error;

use super::{
    error::{ErrorKind, strict_ensure},
    flow::FlowPosition,
};

#[derive(Debug, Clone, Error)]
pub enum ShapeError {
    #[error("tensor shape must have at least one axis")]
    Empty,
    #[error("extent of axis {0} is zero")]
    ZeroExtent(usize),
    #[error("tensor size overflows")]
    Overflow,
    #[error("rank mismatch: expected {expected}, found {found}")]
    Rank { expected: usize, found: usize },
    #[error("axis {axis} out of bounds for rank {rank}")]
    Axis { axis: usize, rank: usize },
    #[error("index [{}] out of bounds for shape {shape}", index.iter().format(", "))]
    Index { index: Vec<u32>, shape: TensorShape },
    #[error("offset {offset} out of bounds for size {size}")]
    Offset { offset: u64, size: u64 },
    #[error("slice exceeds its parent on axis {axis}: {offset} + {extent} > {parent}")]
    Slice {
        axis: usize,
        offset: u32,
        extent: u32,
        parent: u32,
    },
}

impl ShapeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShapeError::Empty
            | ShapeError::ZeroExtent(_)
            | ShapeError::Overflow
            | ShapeError::Rank { .. } => ErrorKind::IllegalArgument,
            ShapeError::Axis { .. }
            | ShapeError::Index { .. }
            | ShapeError::Offset { .. }
            | ShapeError::Slice { .. } => ErrorKind::IndexOutOfBounds,
        }
    }
}

/// Per-axis extents of a tensor, laid out with axis 0 varying fastest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "Vec<u32>", into = "Vec<u32>")
)]
pub struct TensorShape {
    extents: Vec<u32>,
    size: u64,
}

impl std::fmt::Display for TensorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.extents.iter().format(", "))
    }
}

impl TryFrom<Vec<u32>> for TensorShape {
    type Error = ShapeError;

    #[inline]
    fn try_from(value: Vec<u32>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TensorShape> for Vec<u32> {
    #[inline]
    fn from(value: TensorShape) -> Self {
        value.extents
    }
}

impl TensorShape {
    /// Fails if there is no axis, an extent is zero or the size overflows.
    pub fn new(extents: impl Into<Vec<u32>>) -> Result<Self, ShapeError> {
        let extents = extents.into();
        if extents.is_empty() {
            return Err(ShapeError::Empty);
        }
        if let Some(axis) = extents.iter().position(|&extent| extent == 0) {
            return Err(ShapeError::ZeroExtent(axis));
        }
        let size = extents
            .iter()
            .try_fold(1u64, |size, &extent| size.checked_mul(extent as u64))
            .ok_or(ShapeError::Overflow)?;
        Ok(Self { extents, size })
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.extents.len()
    }

    /// Number of elements.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn extents(&self) -> &[u32] {
        &self.extents
    }

    pub fn extent(&self, axis: usize) -> Result<u32, ShapeError> {
        self.extents.get(axis).copied().ok_or(ShapeError::Axis {
            axis,
            rank: self.rank(),
        })
    }

    /// Linear offset of the element at `index`.
    pub fn offset_of(&self, index: &[u32]) -> Result<u64, ShapeError> {
        if index.len() != self.rank() {
            return Err(ShapeError::Rank {
                expected: self.rank(),
                found: index.len(),
            });
        }
        if index.iter().zip_eq(&self.extents).any(|(i, e)| i >= e) {
            return Err(ShapeError::Index {
                index: index.to_vec(),
                shape: self.clone(),
            });
        }
        Ok(linear(index.iter().map(|&i| i as u64), &self.extents))
    }

    /// Multi-index of the element at linear `offset`.
    pub fn index_of(&self, offset: u64) -> Result<Vec<u32>, ShapeError> {
        if offset >= self.size {
            return Err(ShapeError::Offset {
                offset,
                size: self.size,
            });
        }
        let mut rest = offset;
        let index = self
            .extents
            .iter()
            .map(|&extent| {
                let extent = extent as u64;
                let i = rest % extent;
                rest /= extent;
                i as u32
            })
            .collect();
        Ok(index)
    }
}

/// Column-major linear offset; axis 0 has unit stride.
fn linear(index: impl Iterator<Item = u64>, extents: &[u32]) -> u64 {
    let (offset, _) = index
        .zip(extents)
        .fold((0, 1), |(offset, stride), (i, &extent)| {
            (offset + i * stride, stride * extent as u64)
        });
    offset
}

/// A window into a parent shape: per-axis offsets plus the window's own shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SlicedTensorShape {
    parent: TensorShape,
    offsets: Vec<u32>,
    shape: TensorShape,
}

impl std::fmt::Display for SlicedTensorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let axes = self
            .offsets
            .iter()
            .zip_eq(self.shape.extents())
            .map(|(&offset, &extent)| format!("{offset}..{}", offset as u64 + extent as u64));
        write!(f, "{}[{}]", self.parent, axes.format(", "))
    }
}

impl SlicedTensorShape {
    /// Ranks are always checked; bounds only in debug or `strict` builds.
    pub fn new(
        parent: TensorShape,
        offsets: impl Into<Vec<u32>>,
        extents: impl Into<Vec<u32>>,
    ) -> Result<Self, ShapeError> {
        let offsets = offsets.into();
        let shape = TensorShape::new(extents)?;
        for found in [offsets.len(), shape.rank()] {
            if found != parent.rank() {
                return Err(ShapeError::Rank {
                    expected: parent.rank(),
                    found,
                });
            }
        }
        for (axis, ((&offset, &extent), &limit)) in offsets
            .iter()
            .zip(shape.extents())
            .zip(parent.extents())
            .enumerate()
        {
            strict_ensure!(
                offset as u64 + extent as u64 <= limit as u64,
                ShapeError::Slice {
                    axis,
                    offset,
                    extent,
                    parent: limit,
                }
            );
        }
        Ok(Self {
            parent,
            offsets,
            shape,
        })
    }

    /// The slice covering all of `parent`.
    pub fn full(parent: TensorShape) -> Self {
        let offsets = vec![0; parent.rank()];
        let shape = parent.clone();
        Self {
            parent,
            offsets,
            shape,
        }
    }

    #[inline]
    pub fn parent(&self) -> &TensorShape {
        &self.parent
    }

    #[inline]
    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    #[inline]
    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.shape.size()
    }

    pub fn offset(&self, axis: usize) -> Result<u32, ShapeError> {
        self.offsets.get(axis).copied().ok_or(ShapeError::Axis {
            axis,
            rank: self.rank(),
        })
    }

    #[inline]
    pub fn extent(&self, axis: usize) -> Result<u32, ShapeError> {
        self.shape.extent(axis)
    }

    #[inline]
    pub fn parent_extent(&self, axis: usize) -> Result<u32, ShapeError> {
        self.parent.extent(axis)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.shape == self.parent
    }

    /// Offset of `index` within the packed slice.
    #[inline]
    pub fn offset_of(&self, index: &[u32]) -> Result<u64, ShapeError> {
        self.shape.offset_of(index)
    }

    /// Offset in the parent of the element at `index` within the slice.
    pub fn parent_offset_of(&self, index: &[u32]) -> Result<u64, ShapeError> {
        self.shape.offset_of(index)?;
        let index = index
            .iter()
            .zip_eq(&self.offsets)
            .map(|(&i, &offset)| i + offset)
            .collect_vec();
        self.parent.offset_of(&index)
    }

    /// Rows gathering the slice out of a block holding the whole parent.
    pub fn parent_sites(&self, element_size: u64) -> Vec<FlowPosition> {
        let stride = self.parent.extents[0] as u64 * element_size;
        self.sites(element_size, stride, |index| {
            let index = index
                .iter()
                .zip(&self.offsets)
                .map(|(&i, &offset)| i as u64 + offset as u64);
            linear(index, &self.parent.extents) * element_size
        })
    }

    /// Rows of the same slice in a block holding only the slice, packed.
    pub fn packed_sites(&self, element_size: u64) -> Vec<FlowPosition> {
        let stride = self.shape.extents[0] as u64 * element_size;
        self.sites(element_size, stride, |index| {
            let index = index.iter().map(|&i| i as u64);
            linear(index, &self.shape.extents) * element_size
        })
    }

    /// One row per combination of the axes above 1, each spanning axis 1 with runs along axis 0.
    fn sites(
        &self,
        element_size: u64,
        stride: u64,
        offset_of: impl Fn(&[u32]) -> u64,
    ) -> Vec<FlowPosition> {
        let extents = self.shape.extents();
        let run = extents[0] as u64 * element_size;
        let length = extents.get(1).copied().unwrap_or(1) as u64;

        let outer = &extents[extents.len().min(2)..];
        let count: u64 = outer.iter().map(|&e| e as u64).product();
        let mut index = vec![0u32; extents.len()];
        (0..count)
            .map(|row| {
                let mut rest = row;
                for (i, &extent) in index[2.min(extents.len())..].iter_mut().zip(outer) {
                    *i = (rest % extent as u64) as u32;
                    rest /= extent as u64;
                }
                FlowPosition::new(length, offset_of(&index), run, stride)
            })
            .collect()
    }
}

use std::{
    fmt::Debug,
    ops::{Index, IndexMut},
    sync::Arc,
};

use derive_more::{Display, From};
use itertools::Itertools;
use thiserror::Error;

use super::{
    context::Context,
    error::{Error, ErrorKind},
    memory::{Access, Handle, HostBuffer},
    shape::{ShapeError, SlicedTensorShape, TensorShape},
    task::{Status, Task, TaskError, TaskHeader},
    tensor::TensorBlock,
};

#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("expected {expected_inputs} inputs and {expected_outputs} outputs, found {inputs} and {outputs}")]
    Count {
        expected_inputs: usize,
        expected_outputs: usize,
        inputs: usize,
        outputs: usize,
    },
    #[error("{side} {index}: {error}")]
    Axis {
        side: Side,
        index: usize,
        error: ShapeError,
    },
    #[error("nearest-neighbor padding {padding} must be smaller than k = {k}")]
    Padding { k: u32, padding: u32 },
    #[error("slicing is not a valid partition for operator {0}")]
    InvalidPartition(String),
}

impl DependencyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DependencyError::Count { .. }
            | DependencyError::Padding { .. }
            | DependencyError::InvalidPartition(_) => ErrorKind::IllegalArgument,
            DependencyError::Axis { .. } => ErrorKind::IndexOutOfBounds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Side {
    #[display("input")]
    Input,
    #[display("output")]
    Output,
}

/// How one output axis depends on one input axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OpDependency {
    /// The whole input axis is needed for any output element.
    #[display("everything")]
    Everything,
    /// Output element `i` needs input element `i` only.
    #[display("component-wise")]
    ComponentWise,
    /// Output element `i` needs a halo of `k - padding` input elements on each side.
    #[display("{k}-nearest-neighbor (padding {padding})")]
    NearestNeighbor { k: u32, padding: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OpDependencyCoordinate {
    pub input_axis: usize,
    pub output_axis: usize,
    pub dependency: OpDependency,
}

impl OpDependencyCoordinate {
    #[inline]
    pub fn new(input_axis: usize, output_axis: usize, dependency: OpDependency) -> Self {
        Self {
            input_axis,
            output_axis,
            dependency,
        }
    }
}

/// Per (input, output) pair, the axis dependencies of an operator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OpDependencyDescriptor {
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    entries: Vec<Vec<OpDependencyCoordinate>>,
}

impl Index<(usize, usize)> for OpDependencyDescriptor {
    type Output = Vec<OpDependencyCoordinate>;

    #[inline]
    fn index(&self, (input, output): (usize, usize)) -> &Self::Output {
        &self.entries[input * self.outputs.len() + output]
    }
}

impl IndexMut<(usize, usize)> for OpDependencyDescriptor {
    #[inline]
    fn index_mut(&mut self, (input, output): (usize, usize)) -> &mut Self::Output {
        let outputs = self.outputs.len();
        &mut self.entries[input * outputs + output]
    }
}

impl OpDependencyDescriptor {
    /// An empty descriptor for tensors of the given ranks.
    pub fn new(input_ranks: impl Into<Vec<usize>>, output_ranks: impl Into<Vec<usize>>) -> Self {
        let inputs = input_ranks.into();
        let outputs = output_ranks.into();
        let entries = vec![vec![]; inputs.len() * outputs.len()];
        Self {
            inputs,
            outputs,
            entries,
        }
    }

    /// Adds a coordinate to the `(input, output)` entry.
    pub fn with(mut self, input: usize, output: usize, coordinate: OpDependencyCoordinate) -> Self {
        self[(input, output)].push(coordinate);
        self
    }

    #[inline]
    pub fn input_ranks(&self) -> &[usize] {
        &self.inputs
    }

    #[inline]
    pub fn output_ranks(&self) -> &[usize] {
        &self.outputs
    }

    #[inline]
    pub fn get(&self, input: usize, output: usize) -> Option<&[OpDependencyCoordinate]> {
        match input < self.inputs.len() && output < self.outputs.len() {
            true => Some(&self[(input, output)]),
            false => None,
        }
    }

    /// Decides whether the sliced inputs and outputs form a legal partition of the operator.
    pub fn is_valid(
        &self,
        inputs: &[&SlicedTensorShape],
        outputs: &[&SlicedTensorShape],
    ) -> Result<bool, DependencyError> {
        if inputs.len() != self.inputs.len() || outputs.len() != self.outputs.len() {
            return Err(DependencyError::Count {
                expected_inputs: self.inputs.len(),
                expected_outputs: self.outputs.len(),
                inputs: inputs.len(),
                outputs: outputs.len(),
            });
        }

        for ((i, input), (j, output)) in inputs
            .iter()
            .enumerate()
            .cartesian_product(outputs.iter().enumerate())
        {
            for coordinate in &self[(i, j)] {
                let input = AxisSlice::new(input, coordinate.input_axis)
                    .map_err(|error| DependencyError::Axis {
                        side: Side::Input,
                        index: i,
                        error,
                    })?;
                let output = AxisSlice::new(output, coordinate.output_axis)
                    .map_err(|error| DependencyError::Axis {
                        side: Side::Output,
                        index: j,
                        error,
                    })?;
                if !coordinate.dependency.admits(input, output)? {
                    log::debug!(
                        "partition rejected: {} of input {i} axis {} vs output {j} axis {}",
                        coordinate.dependency,
                        coordinate.input_axis,
                        coordinate.output_axis
                    );
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

/// One axis of a sliced shape.
#[derive(Debug, Clone, Copy)]
struct AxisSlice {
    offset: i64,
    extent: i64,
    parent: i64,
}

impl AxisSlice {
    fn new(shape: &SlicedTensorShape, axis: usize) -> Result<Self, ShapeError> {
        Ok(Self {
            offset: shape.offset(axis)? as i64,
            extent: shape.extent(axis)? as i64,
            parent: shape.parent_extent(axis)? as i64,
        })
    }

    #[inline]
    fn end(self) -> i64 {
        self.offset + self.extent
    }
}

impl OpDependency {
    fn admits(self, input: AxisSlice, output: AxisSlice) -> Result<bool, DependencyError> {
        let valid = match self {
            OpDependency::Everything => input.offset == 0 && input.extent == input.parent,
            OpDependency::ComponentWise => {
                input.parent == output.parent
                    && input.offset <= output.offset
                    && input.end() >= output.end()
            }
            OpDependency::NearestNeighbor { k, padding } => {
                if padding >= k {
                    return Err(DependencyError::Padding { k, padding });
                }
                let delta = (k - padding) as i64;
                input.parent == output.parent + 2 * delta
                    && input.offset <= output.offset
                    && input.end() >= output.end() + 2 * delta
            }
        };
        Ok(valid)
    }
}

/// Integer-valued operator parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, From)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Parameter {
    Int(i64),
    Ints(Vec<i64>),
}

impl Parameter {
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Parameter::Int(value) => Some(*value),
            Parameter::Ints(_) => None,
        }
    }

    #[inline]
    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Parameter::Int(_) => None,
            Parameter::Ints(values) => Some(values),
        }
    }
}

/// Access held on a tensor block for the duration of a kernel call. Released on drop.
#[derive(Debug)]
pub struct Binding<'a> {
    block: &'a TensorBlock,
    access: Access,
    handle: Handle,
}

impl<'a> Binding<'a> {
    fn read(block: &'a TensorBlock) -> Result<Self, TaskError> {
        let handle = block.acquire_read_access()?;
        let access = Access::Read;
        Ok(Self {
            block,
            access,
            handle,
        })
    }

    fn write(block: &'a TensorBlock) -> Result<Self, TaskError> {
        let handle = block.acquire_write_access()?;
        let access = Access::Write;
        Ok(Self {
            block,
            access,
            handle,
        })
    }

    #[inline]
    pub fn block(&self) -> &TensorBlock {
        self.block
    }

    #[inline]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// The host buffer behind the block, if it lives in host memory.
    #[inline]
    pub fn host(&self) -> Option<&HostBuffer> {
        self.handle.downcast_ref()
    }
}

impl Drop for Binding<'_> {
    fn drop(&mut self) {
        let result = match self.access {
            Access::Read => self.block.release_read_access(),
            Access::Write => self.block.release_write_access(),
        };
        if let Err(err) = result {
            log::error!("{err}");
        }
    }
}

/// The concrete computation of an operator.
pub trait Kernel: Send + Sync + Debug {
    fn execute(&self, inputs: &[Binding<'_>], outputs: &[Binding<'_>]) -> Result<(), TaskError>;
}

/// An operator applied to concrete tensor blocks, driven as a [`Task`].
#[derive(Debug)]
pub struct Operator {
    header: TaskHeader,
    kernel: Box<dyn Kernel>,
    inputs: Vec<Arc<TensorBlock>>,
    outputs: Vec<Arc<TensorBlock>>,
}

impl Operator {
    #[inline]
    pub fn inputs(&self) -> &[Arc<TensorBlock>] {
        &self.inputs
    }

    #[inline]
    pub fn outputs(&self) -> &[Arc<TensorBlock>] {
        &self.outputs
    }
}

impl Task for Operator {
    #[inline]
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn run(&self) -> Result<Status, TaskError> {
        let inputs: Vec<_> = self
            .inputs
            .iter()
            .map(|block| Binding::read(block))
            .try_collect()?;
        let outputs: Vec<_> = self
            .outputs
            .iter()
            .map(|block| Binding::write(block))
            .try_collect()?;
        self.kernel.execute(&inputs, &outputs)?;
        Ok(Status::default())
    }
}

/// Describes one operator: its dependency structure, result shapes and kernel.
pub trait OperatorFactory: Send + Sync {
    fn name(&self) -> &str;

    fn dependencies(
        &self,
        input_ranks: &[usize],
        output_ranks: &[usize],
        params: &[Parameter],
    ) -> OpDependencyDescriptor;

    fn inferred_result_shape(
        &self,
        inputs: &[TensorShape],
        params: &[Parameter],
    ) -> Result<Vec<TensorShape>, ShapeError>;

    fn kernel(&self, params: &[Parameter]) -> Box<dyn Kernel>;

    /// Checks the slicing of `inputs` and `outputs` against [`OperatorFactory::dependencies`].
    fn is_valid(
        &self,
        inputs: &[&SlicedTensorShape],
        outputs: &[&SlicedTensorShape],
        params: &[Parameter],
    ) -> Result<bool, DependencyError> {
        let input_ranks = inputs.iter().map(|shape| shape.rank()).collect_vec();
        let output_ranks = outputs.iter().map(|shape| shape.rank()).collect_vec();
        self.dependencies(&input_ranks, &output_ranks, params)
            .is_valid(inputs, outputs)
    }

    /// Builds a registered operator task over the blocks, only if their slicing is a legal partition.
    fn apply(
        &self,
        context: &Context,
        inputs: Vec<Arc<TensorBlock>>,
        outputs: Vec<Arc<TensorBlock>>,
        params: &[Parameter],
    ) -> Result<Arc<Operator>, Error> {
        let sliced_inputs = inputs.iter().map(|block| block.sliced()).collect_vec();
        let sliced_outputs = outputs.iter().map(|block| block.sliced()).collect_vec();
        if !self.is_valid(&sliced_inputs, &sliced_outputs, params)? {
            let err = DependencyError::InvalidPartition(self.name().to_string());
            log::error!("{err}");
            return Err(err.into());
        }

        let operator = Arc::new(Operator {
            header: TaskHeader::new(context.generate_uuid(), self.name()),
            kernel: self.kernel(params),
            inputs,
            outputs,
        });
        context.register_task(&operator);
        Ok(operator)
    }
}

//! Compact encoding of op inputs recorded on the hot path.
//!
//! `push` appends a self-describing tag stream plus flat side vectors; no
//! per-op allocation happens beyond vector growth. [`ShapeDecoder`] walks the
//! stream back, yielding one [`OpInputs`] per recorded op.

use serde::Serialize;
use smallvec::SmallVec;

/// Sizes or strides of one tensor. Most tensors have rank <= 4.
pub type Shape = SmallVec<[i64; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[default]
    Cpu,
    Cuda,
    Hip,
    Xpu,
    Meta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Device {
    pub device_type: DeviceType,
    /// `-1` means "current device" for the device type.
    pub index: i8,
}

impl Device {
    pub const CPU: Device = Device {
        device_type: DeviceType::Cpu,
        index: -1,
    };

    pub const fn cuda(index: i8) -> Self {
        Self {
            device_type: DeviceType::Cuda,
            index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    #[default]
    Strided,
    Sparse,
    SparseCsr,
    Mkldnn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dtype {
    UInt8,
    Int8,
    Int16,
    Int32,
    Int64,
    Float16,
    BFloat16,
    #[default]
    Float32,
    Float64,
    Complex64,
    Bool,
}

impl Dtype {
    /// Element type name as it appears in profiler output.
    pub fn name(self) -> &'static str {
        match self {
            Dtype::UInt8 => "unsigned char",
            Dtype::Int8 => "signed char",
            Dtype::Int16 => "short int",
            Dtype::Int32 => "int",
            Dtype::Int64 => "long int",
            Dtype::Float16 => "c10::Half",
            Dtype::BFloat16 => "c10::BFloat16",
            Dtype::Float32 => "float",
            Dtype::Float64 => "double",
            Dtype::Complex64 => "c10::complex<float>",
            Dtype::Bool => "bool",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Double(f64),
    Bool(bool),
}

/// Resolved storage identity shared by every tensor and allocation believed to
/// reference the same memory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TensorId(pub usize);

/// A tensor argument as seen at the instrumentation boundary.
#[derive(Debug, Clone, Default)]
pub struct TensorArg {
    /// Address of the object that owns the tensor's metadata. Stable for the
    /// lifetime of the tensor, even if its storage is swapped.
    pub impl_addr: u64,
    /// Storage data pointer, `None` for tensors without storage.
    pub data: Option<u64>,
    pub device: Device,
    pub dtype: Dtype,
    pub layout: Layout,
    pub sizes: Shape,
    pub strides: Shape,
}

/// One argument of an instrumented op.
#[derive(Debug, Clone)]
pub enum OpInput {
    Tensor(TensorArg),
    UndefinedTensor,
    Scalar(Scalar),
    /// Lists are tagged but their elements are not recorded.
    TensorList(usize),
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TensorMetadata {
    pub impl_addr: u64,
    pub data: Option<u64>,
    pub device: Device,
    pub dtype: Dtype,
    pub layout: Layout,
    pub dim: u32,
    /// Filled in by storage identity resolution.
    pub id: Option<TensorId>,
}

impl TensorMetadata {
    fn new(t: &TensorArg) -> Self {
        Self {
            impl_addr: t.impl_addr,
            data: t.data,
            device: t.device,
            dtype: t.dtype,
            layout: t.layout,
            dim: t.sizes.len() as u32,
            id: None,
        }
    }
}

/// Decoded inputs of a single op, positionally aligned with its arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OpInputs {
    pub shapes: Vec<Shape>,
    pub strides: Vec<Shape>,
    pub dtypes: Vec<String>,
    pub scalars: Vec<Option<Scalar>>,
    pub tensor_metadata: Vec<Option<TensorMetadata>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Tensor,
    UndefinedTensor,
    TensorListBegin,
    Scalar,
    Other,
    Terminator,
}

#[derive(Debug, Default)]
pub struct InputOutputEncoder {
    tags: Vec<Tag>,
    tensor_metadata: Vec<TensorMetadata>,
    sizes_strides: Vec<i64>,
    scalars: Vec<Scalar>,
}

impl InputOutputEncoder {
    /// Record the inputs of one op, closing the run with a terminator.
    pub fn push(&mut self, inputs: &[OpInput]) {
        for input in inputs {
            match input {
                OpInput::Tensor(t) => self.push_tensor(t),
                OpInput::UndefinedTensor => self.tags.push(Tag::UndefinedTensor),
                OpInput::Scalar(s) => {
                    self.tags.push(Tag::Scalar);
                    self.scalars.push(*s);
                }
                OpInput::TensorList(_) => {
                    self.tags.push(Tag::TensorListBegin);
                    self.tags.push(Tag::Terminator);
                }
                OpInput::Other => self.tags.push(Tag::Other),
            }
        }
        self.tags.push(Tag::Terminator);
    }

    fn push_tensor(&mut self, t: &TensorArg) {
        self.tags.push(Tag::Tensor);
        self.tensor_metadata.push(TensorMetadata::new(t));
        self.sizes_strides.extend_from_slice(&t.sizes);
        // Only strided tensors carry strides.
        if t.layout == Layout::Strided {
            debug_assert_eq!(t.strides.len(), t.sizes.len());
            self.sizes_strides.extend(
                t.strides
                    .iter()
                    .copied()
                    .chain(std::iter::repeat(0))
                    .take(t.sizes.len()),
            );
        }
    }

    /// Number of ops recorded so far.
    pub fn op_count(&self) -> usize {
        let mut count = 0;
        let mut in_list = false;
        for tag in &self.tags {
            match tag {
                Tag::TensorListBegin => in_list = true,
                Tag::Terminator if in_list => in_list = false,
                Tag::Terminator => count += 1,
                _ => {}
            }
        }
        count
    }

    /// Move the recorded buffers into a decoder, leaving the encoder empty.
    pub fn drain(&mut self) -> ShapeDecoder {
        let taken = std::mem::take(self);
        ShapeDecoder {
            tags: taken.tags.into_iter(),
            tensor_metadata: taken.tensor_metadata.into_iter(),
            sizes_strides: taken.sizes_strides.into_iter(),
            scalars: taken.scalars.into_iter(),
        }
    }
}

/// Lazy decoder over a drained [`InputOutputEncoder`].
///
/// Each `next` resumes where the previous call stopped and yields the inputs
/// of exactly one op.
pub struct ShapeDecoder {
    tags: std::vec::IntoIter<Tag>,
    tensor_metadata: std::vec::IntoIter<TensorMetadata>,
    sizes_strides: std::vec::IntoIter<i64>,
    scalars: std::vec::IntoIter<Scalar>,
}

impl ShapeDecoder {
    fn take_shape(&mut self, dim: u32) -> Shape {
        self.sizes_strides.by_ref().take(dim as usize).collect()
    }
}

impl Iterator for ShapeDecoder {
    type Item = OpInputs;

    fn next(&mut self) -> Option<OpInputs> {
        let mut tag = self.tags.next()?;
        let mut out = OpInputs::default();
        loop {
            match tag {
                Tag::Terminator => return Some(out),
                Tag::Tensor => {
                    // An encoder never pushes a tensor tag without metadata.
                    let md = self.tensor_metadata.next()?;
                    out.shapes.push(self.take_shape(md.dim));
                    out.strides.push(if md.layout == Layout::Strided {
                        self.take_shape(md.dim)
                    } else {
                        Shape::new()
                    });
                    out.dtypes.push(md.dtype.name().to_string());
                    out.scalars.push(None);
                    out.tensor_metadata.push(Some(md));
                }
                Tag::TensorListBegin => {
                    for inner in self.tags.by_ref() {
                        if inner == Tag::Terminator {
                            break;
                        }
                    }
                    out.shapes.push(Shape::new());
                    out.strides.push(Shape::new());
                    out.dtypes.push("TensorList".to_string());
                    out.scalars.push(None);
                    out.tensor_metadata.push(None);
                }
                Tag::Scalar => {
                    out.shapes.push(Shape::new());
                    out.strides.push(Shape::new());
                    out.dtypes.push("Scalar".to_string());
                    out.scalars.push(self.scalars.next());
                    out.tensor_metadata.push(None);
                }
                Tag::UndefinedTensor | Tag::Other => {
                    out.shapes.push(Shape::new());
                    out.strides.push(Shape::new());
                    out.dtypes.push(String::new());
                    out.scalars.push(None);
                    out.tensor_metadata.push(None);
                }
            }
            match self.tags.next() {
                Some(t) => tag = t,
                None => return Some(out),
            }
        }
    }
}

//! Shape/format descriptor for memory regions
//!
//! A [`Layout`] is an immutable value describing how the bytes of a memory
//! region are interpreted: element type, format family, logical dimensions,
//! and per-dimension padding. The reuse-reset rule consumes the format
//! category predicates defined here.

/// Bits packed into one storage word of the single-bit element type.
const BIN_WORD_BITS: usize = 32;

/// Element data type
///
/// `Bin` is the packed single-bit type: elements are stored 32 per 4-byte
/// word, so its element size reports the word size and byte counts are
/// computed with the packed encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F16,
    F32,
    I8,
    U8,
    I32,
    /// Packed single-bit elements (32 per word)
    Bin,
}

impl DataType {
    /// Storage size of one element (one word for `Bin`)
    pub const fn size_bytes(self) -> usize {
        match self {
            DataType::F16 => 2,
            DataType::F32 => 4,
            DataType::I8 | DataType::U8 => 1,
            DataType::I32 => 4,
            DataType::Bin => 4,
        }
    }

    /// Whether byte counts use the packed single-bit encoding
    pub const fn is_packed_binary(self) -> bool {
        matches!(self, DataType::Bin)
    }
}

/// Memory format family
///
/// Closed set: every variant is classified by the four category predicates
/// below, and matches stay exhaustive so adding a format is a
/// compile-visible event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// Plain data, channels-first
    Nchw,
    /// Plain data, channels-last
    Nhwc,
    /// Blocked data layout, channels split in groups of 16
    NChw16c,
    /// Plain weights
    Oihw,
    /// Grouped weights
    Goihw,
    /// Winograd-transformed weights
    WinogradOihw,
    /// Image-backed weights
    Image2dOihw,
}

impl Format {
    /// Plain data layouts with no blocking or transformation
    pub const fn is_simple_data(self) -> bool {
        matches!(self, Format::Nchw | Format::Nhwc)
    }

    /// Weight layouts, including transformed and image-backed ones
    pub const fn is_weights(self) -> bool {
        matches!(
            self,
            Format::Oihw | Format::Goihw | Format::WinogradOihw | Format::Image2dOihw
        )
    }

    /// Winograd-encoded layouts
    pub const fn is_winograd(self) -> bool {
        matches!(self, Format::WinogradOihw)
    }

    /// Layouts backed by an image object rather than a linear buffer
    pub const fn is_image(self) -> bool {
        matches!(self, Format::Image2dOihw)
    }
}

/// Per-dimension padding extents
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Padding {
    lower: Vec<usize>,
    upper: Vec<usize>,
}

impl Padding {
    /// No padding on any side of any dimension
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(lower: Vec<usize>, upper: Vec<usize>) -> Self {
        Self { lower, upper }
    }

    pub fn lower(&self) -> &[usize] {
        &self.lower
    }

    pub fn upper(&self) -> &[usize] {
        &self.upper
    }

    /// True when every extent on every side is zero
    pub fn is_zero(&self) -> bool {
        self.lower.iter().all(|&p| p == 0) && self.upper.iter().all(|&p| p == 0)
    }
}

/// Immutable shape/format descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    data_type: DataType,
    format: Format,
    dims: Vec<usize>,
    padding: Padding,
}

impl Layout {
    pub fn new(data_type: DataType, format: Format, dims: Vec<usize>) -> Self {
        Self {
            data_type,
            format,
            dims,
            padding: Padding::none(),
        }
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn padding(&self) -> &Padding {
        &self.padding
    }

    /// Logical element count
    pub fn count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Required byte count, using the packed encoding for single-bit data
    pub fn bytes_count(&self) -> usize {
        let storage_elements = if self.data_type.is_packed_binary() {
            self.count().div_ceil(BIN_WORD_BITS)
        } else {
            self.count()
        };
        storage_elements * self.data_type.size_bytes()
    }
}

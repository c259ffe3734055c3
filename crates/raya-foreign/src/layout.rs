//! Value layouts and call signatures
//!
//! Two levels of signature exist:
//! - `FunctionType` is the C-level signature a binding asks for
//!   (scalars, addresses, structs by value, variadic tail).
//! - `MethodType` is the lowered form: one `Carrier` per hardware slot, the
//!   shape the stubs are generated for and the descriptors are keyed on.

use std::fmt;

/// Layout of one C value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueLayout {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// A pointer-sized address (native memory, or managed memory under heap access)
    Address,
    /// A struct passed or returned by value
    Struct(StructLayout),
}

impl ValueLayout {
    /// Size in bytes
    pub fn size(&self) -> usize {
        match self {
            ValueLayout::I8 => 1,
            ValueLayout::I16 => 2,
            ValueLayout::I32 | ValueLayout::F32 => 4,
            ValueLayout::I64 | ValueLayout::F64 | ValueLayout::Address => 8,
            ValueLayout::Struct(s) => s.size(),
        }
    }

    /// Alignment in bytes
    pub fn align(&self) -> usize {
        match self {
            ValueLayout::Struct(s) => s.align(),
            other => other.size(),
        }
    }

    /// True for `F32`/`F64`
    pub fn is_float(&self) -> bool {
        matches!(self, ValueLayout::F32 | ValueLayout::F64)
    }

    /// Carrier used when this scalar travels in a single slot.
    ///
    /// Structs have no single carrier; the calling convention splits them.
    pub fn scalar_carrier(&self) -> Option<Carrier> {
        match self {
            ValueLayout::I8 => Some(Carrier::I8),
            ValueLayout::I16 => Some(Carrier::I16),
            ValueLayout::I32 => Some(Carrier::I32),
            ValueLayout::I64 | ValueLayout::Address => Some(Carrier::I64),
            ValueLayout::F32 => Some(Carrier::F32),
            ValueLayout::F64 => Some(Carrier::F64),
            ValueLayout::Struct(_) => None,
        }
    }
}

impl fmt::Display for ValueLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueLayout::I8 => f.write_str("i8"),
            ValueLayout::I16 => f.write_str("i16"),
            ValueLayout::I32 => f.write_str("i32"),
            ValueLayout::I64 => f.write_str("i64"),
            ValueLayout::F32 => f.write_str("f32"),
            ValueLayout::F64 => f.write_str("f64"),
            ValueLayout::Address => f.write_str("ptr"),
            ValueLayout::Struct(s) => {
                f.write_str("{")?;
                for (i, field) in s.fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                f.write_str("}")
            }
        }
    }
}

/// A C struct with naturally aligned fields
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructLayout {
    pub fields: Vec<ValueLayout>,
}

impl StructLayout {
    pub fn new(fields: Vec<ValueLayout>) -> Self {
        Self { fields }
    }

    /// Byte offset of each field
    pub fn field_offsets(&self) -> Vec<usize> {
        let mut offset = 0;
        let mut offsets = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            offset = align_up(offset, field.align());
            offsets.push(offset);
            offset += field.size();
        }
        offsets
    }

    pub fn align(&self) -> usize {
        self.fields.iter().map(|f| f.align()).max().unwrap_or(1)
    }

    pub fn size(&self) -> usize {
        let end = match (self.field_offsets().last(), self.fields.last()) {
            (Some(offset), Some(field)) => offset + field.size(),
            _ => 0,
        };
        align_up(end, self.align())
    }

    /// Flatten nested structs into `(offset, scalar)` pairs
    pub fn flattened(&self) -> Vec<(usize, ValueLayout)> {
        let mut out = Vec::new();
        self.flatten_into(0, &mut out);
        out
    }

    fn flatten_into(&self, base: usize, out: &mut Vec<(usize, ValueLayout)>) {
        for (field, offset) in self.fields.iter().zip(self.field_offsets()) {
            match field {
                ValueLayout::Struct(inner) => inner.flatten_into(base + offset, out),
                scalar => out.push((base + offset, scalar.clone())),
            }
        }
    }
}

/// Round `value` up to a multiple of `align` (a power of two)
pub fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// C-level function signature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    pub params: Vec<ValueLayout>,
    pub ret: Option<ValueLayout>,
    /// Index of the first variadic parameter, if the callee is variadic
    pub first_variadic: Option<usize>,
}

impl FunctionType {
    pub fn new(params: Vec<ValueLayout>, ret: Option<ValueLayout>) -> Self {
        Self {
            params,
            ret,
            first_variadic: None,
        }
    }

    /// Mark every parameter from `index` on as variadic
    pub fn variadic_from(mut self, index: usize) -> Self {
        self.first_variadic = Some(index);
        self
    }

    pub fn is_variadic_param(&self, index: usize) -> bool {
        self.first_variadic.is_some_and(|first| index >= first)
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            if self.first_variadic == Some(i) {
                f.write_str("... ")?;
            }
            write!(f, "{}", p)?;
        }
        f.write_str(") -> ")?;
        match &self.ret {
            Some(r) => write!(f, "{}", r),
            None => f.write_str("void"),
        }
    }
}

/// Primitive type of one hardware slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Carrier {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Managed object reference (heap base of a fused address)
    Object,
}

impl Carrier {
    pub fn is_float(self) -> bool {
        matches!(self, Carrier::F32 | Carrier::F64)
    }

    /// Size in bytes
    pub fn size(self) -> usize {
        match self {
            Carrier::I8 => 1,
            Carrier::I16 => 2,
            Carrier::I32 | Carrier::F32 => 4,
            Carrier::I64 | Carrier::F64 | Carrier::Object => 8,
        }
    }

    /// Integer carrier of the same width (bit reinterpretation target)
    pub fn same_width_integer(self) -> Carrier {
        match self {
            Carrier::F32 => Carrier::I32,
            Carrier::F64 => Carrier::I64,
            other => other,
        }
    }

    /// Single-letter tag used in stub symbol names
    pub fn tag(self) -> char {
        match self {
            Carrier::I8 => 'B',
            Carrier::I16 => 'S',
            Carrier::I32 => 'I',
            Carrier::I64 => 'J',
            Carrier::F32 => 'F',
            Carrier::F64 => 'D',
            Carrier::Object => 'L',
        }
    }
}

impl fmt::Display for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Carrier::I8 => "i8",
            Carrier::I16 => "i16",
            Carrier::I32 => "i32",
            Carrier::I64 => "i64",
            Carrier::F32 => "f32",
            Carrier::F64 => "f64",
            Carrier::Object => "object",
        };
        f.write_str(name)
    }
}

/// Lowered signature: one carrier per hardware slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MethodType {
    pub params: Vec<Carrier>,
    pub ret: Option<Carrier>,
}

impl MethodType {
    pub fn new(params: Vec<Carrier>, ret: Option<Carrier>) -> Self {
        Self { params, ret }
    }
}

impl fmt::Display for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", p)?;
        }
        f.write_str(") -> ")?;
        match self.ret {
            Some(r) => write!(f, "{}", r),
            None => f.write_str("void"),
        }
    }
}

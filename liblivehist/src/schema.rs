//! Field tables describing the layout of event records.
//!
//! Histogram parameters are written as strings (`adc[3]`, `tof.ch[2][1]`) and have to be mapped
//! to a numeric location inside the live record. Instead of runtime reflection every record type
//! registers a [`RecordSchema`] through the [`impl_record!`](crate::impl_record) macro. The macro
//! takes offsets from `offset_of!` and field kinds from the field types themselves, so the table
//! always matches the compiled layout.
//!
//! ```
//! use liblivehist::impl_record;
//!
//! #[derive(Debug, Default)]
//! pub struct Tof {
//!     pub ch: [[u16; 2]; 4],
//!     pub sum: f64,
//! }
//! impl_record!(Tof { ch, sum });
//!
//! #[derive(Debug, Default)]
//! pub struct MyEvent {
//!     pub adc: [i32; 16],
//!     pub tof: Tof,
//!     pub hits: Vec<f32>,
//! }
//! impl_record!(MyEvent { adc, tof, hits });
//! ```
use std::marker::PhantomData;

/// The numeric types a leaf field may have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

/// Rust types which can be leaves in a record.
///
/// # Safety
/// `TYPE` must name exactly `Self`: values are read and written through raw pointers as the
/// type `TYPE` describes, including the elements of a `Vec<Self>`.
pub unsafe trait Scalar: Copy + Send + 'static {
    const TYPE: ScalarType;
    fn to_f64(self) -> f64;
}

macro_rules! impl_scalar {
    ($($t:ty => $tag:ident),* $(,)?) => {
        $(
            unsafe impl Scalar for $t {
                const TYPE: ScalarType = ScalarType::$tag;
                fn to_f64(self) -> f64 {
                    self as f64
                }
            }

            unsafe impl FieldType for $t {
                fn field_kind() -> FieldKind {
                    FieldKind::Scalar(ScalarType::$tag)
                }
            }
        )*
    };
}

impl_scalar!(
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
);

unsafe impl Scalar for bool {
    const TYPE: ScalarType = ScalarType::Bool;
    fn to_f64(self) -> f64 {
        if self {
            1.0
        } else {
            0.0
        }
    }
}

unsafe impl FieldType for bool {
    fn field_kind() -> FieldKind {
        FieldKind::Scalar(ScalarType::Bool)
    }
}

impl ScalarType {
    /// Read the value at `ptr` as a double.
    ///
    /// # Safety
    /// `ptr` must point to a live, initialized value of the type named by `self`.
    pub(crate) unsafe fn read(self, ptr: *const u8) -> f64 {
        match self {
            ScalarType::Bool => {
                if ptr.read() != 0 {
                    1.0
                } else {
                    0.0
                }
            }
            ScalarType::I8 => ptr.cast::<i8>().read() as f64,
            ScalarType::U8 => ptr.read() as f64,
            ScalarType::I16 => ptr.cast::<i16>().read_unaligned() as f64,
            ScalarType::U16 => ptr.cast::<u16>().read_unaligned() as f64,
            ScalarType::I32 => ptr.cast::<i32>().read_unaligned() as f64,
            ScalarType::U32 => ptr.cast::<u32>().read_unaligned() as f64,
            ScalarType::I64 => ptr.cast::<i64>().read_unaligned() as f64,
            ScalarType::U64 => ptr.cast::<u64>().read_unaligned() as f64,
            ScalarType::F32 => ptr.cast::<f32>().read_unaligned() as f64,
            ScalarType::F64 => ptr.cast::<f64>().read_unaligned(),
        }
    }

    /// Store `value` (converted with `as` semantics) at `ptr`.
    ///
    /// # Safety
    /// `ptr` must point to a live value of the type named by `self` that nobody else is
    /// reading or writing.
    pub(crate) unsafe fn write(self, ptr: *mut u8, value: f64) {
        match self {
            ScalarType::Bool => ptr.write(u8::from(value != 0.0)),
            ScalarType::I8 => ptr.cast::<i8>().write(value as i8),
            ScalarType::U8 => ptr.write(value as u8),
            ScalarType::I16 => ptr.cast::<i16>().write_unaligned(value as i16),
            ScalarType::U16 => ptr.cast::<u16>().write_unaligned(value as u16),
            ScalarType::I32 => ptr.cast::<i32>().write_unaligned(value as i32),
            ScalarType::U32 => ptr.cast::<u32>().write_unaligned(value as u32),
            ScalarType::I64 => ptr.cast::<i64>().write_unaligned(value as i64),
            ScalarType::U64 => ptr.cast::<u64>().write_unaligned(value as u64),
            ScalarType::F32 => ptr.cast::<f32>().write_unaligned(value as f32),
            ScalarType::F64 => ptr.cast::<f64>().write_unaligned(value),
        }
    }

    /// Read element `index` of the `Vec` at `ptr`. None if the index is past the end.
    ///
    /// # Safety
    /// `ptr` must point to a live `Vec<T>` where `T` is the type named by `self`.
    pub(crate) unsafe fn read_element(self, ptr: *const u8, index: usize) -> Option<f64> {
        macro_rules! element {
            ($t:ty) => {
                (&*ptr.cast::<Vec<$t>>()).get(index).map(|v| v.to_f64())
            };
        }
        match self {
            ScalarType::Bool => element!(bool),
            ScalarType::I8 => element!(i8),
            ScalarType::U8 => element!(u8),
            ScalarType::I16 => element!(i16),
            ScalarType::U16 => element!(u16),
            ScalarType::I32 => element!(i32),
            ScalarType::U32 => element!(u32),
            ScalarType::I64 => element!(i64),
            ScalarType::U64 => element!(u64),
            ScalarType::F32 => element!(f32),
            ScalarType::F64 => element!(f64),
        }
    }
}

/// What lives at a field
#[derive(Debug, Clone)]
pub enum FieldKind {
    Scalar(ScalarType),
    /// A `Vec` of scalars, indexed at evaluation time
    Vector(ScalarType),
    /// A (possibly multi-dimensional) fixed array. Extents are outermost first and the
    /// stride is the size of one innermost element.
    Array {
        element: Box<FieldKind>,
        extents: Vec<usize>,
        stride: usize,
    },
    Record(&'static RecordSchema),
}

/// Types which can appear as fields of a registered record.
///
/// # Safety
/// `field_kind()` must describe the in-memory layout of `Self`. The resolver reads and writes
/// through raw pointers according to this kind, so a wrong kind is undefined behavior. Records
/// get their impl from [`impl_record!`](crate::impl_record); nothing else should need one.
///
/// Reporting a field as something else takes an `unsafe impl`:
///
/// ```compile_fail
/// use liblivehist::schema::{FieldKind, FieldType, ScalarType};
///
/// struct Wide(u64);
///
/// impl FieldType for Wide {
///     fn field_kind() -> FieldKind {
///         FieldKind::Vector(ScalarType::F64)
///     }
/// }
/// ```
pub unsafe trait FieldType {
    fn field_kind() -> FieldKind;
}

unsafe impl<T: Scalar> FieldType for Vec<T> {
    fn field_kind() -> FieldKind {
        FieldKind::Vector(T::TYPE)
    }
}

unsafe impl<T: FieldType, const N: usize> FieldType for [T; N] {
    fn field_kind() -> FieldKind {
        match T::field_kind() {
            FieldKind::Array {
                element,
                mut extents,
                stride,
            } => {
                extents.insert(0, N);
                FieldKind::Array {
                    element,
                    extents,
                    stride,
                }
            }
            other => FieldKind::Array {
                element: Box::new(other),
                extents: vec![N],
                stride: std::mem::size_of::<T>(),
            },
        }
    }
}

/// Used by `impl_record!` to get the kind of a field from an accessor closure
pub fn kind_of<R, T: FieldType>(_accessor: impl Fn(&R) -> &T) -> FieldKind {
    T::field_kind()
}

/// One named field of a record
#[derive(Debug, Clone)]
pub struct FieldDesc {
    pub name: &'static str,
    pub offset: usize,
    pub kind: FieldKind,
}

impl FieldDesc {
    pub fn new(name: &'static str, offset: usize, kind: FieldKind) -> Self {
        Self { name, offset, kind }
    }
}

/// The field table of one record type
#[derive(Debug)]
pub struct RecordSchema {
    pub name: &'static str,
    pub size: usize,
    pub fields: Vec<FieldDesc>,
}

impl RecordSchema {
    pub fn new(name: &'static str, size: usize, fields: Vec<FieldDesc>) -> Self {
        Self { name, size, fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDesc> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Every numeric leaf reachable from this record, written as a path pattern
    /// (`adc[16]`, `tof.ch[4][2]`, `hits[]`).
    pub fn leaf_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for field in self.fields.iter() {
            collect_leaves(field.name.to_string(), &field.kind, &mut paths);
        }
        paths
    }
}

fn collect_leaves(prefix: String, kind: &FieldKind, paths: &mut Vec<String>) {
    match kind {
        FieldKind::Scalar(_) => paths.push(prefix),
        FieldKind::Vector(_) => paths.push(format!("{prefix}[]")),
        FieldKind::Array {
            element, extents, ..
        } => {
            let dims: String = extents.iter().map(|e| format!("[{e}]")).collect();
            collect_leaves(format!("{prefix}{dims}"), element, paths);
        }
        FieldKind::Record(schema) => {
            for field in schema.fields.iter() {
                collect_leaves(format!("{prefix}.{}", field.name), &field.kind, paths);
            }
        }
    }
}

/// A record whose layout is described by a [`RecordSchema`].
///
/// # Safety
/// `schema()` must describe the layout of `Self` exactly: every offset and kind is trusted when
/// reading and writing through a [`crate::resolver::FieldHandle`]. Implement it with
/// [`impl_record!`](crate::impl_record), which derives both from the compiler.
pub unsafe trait Record: Send + 'static {
    fn schema() -> &'static RecordSchema;
}

/// Register a struct as an event record.
///
/// List the fields that histograms may refer to; unlisted fields are invisible to formulas.
/// Listed fields must be scalars, `Vec`s of scalars, fixed arrays, or other registered records.
#[macro_export]
macro_rules! impl_record {
    ($ty:ty { $($field:ident),* $(,)? }) => {
        unsafe impl $crate::schema::Record for $ty {
            fn schema() -> &'static $crate::schema::RecordSchema {
                static SCHEMA: ::std::sync::OnceLock<$crate::schema::RecordSchema> =
                    ::std::sync::OnceLock::new();
                SCHEMA.get_or_init(|| {
                    $crate::schema::RecordSchema::new(
                        stringify!($ty),
                        ::std::mem::size_of::<$ty>(),
                        vec![$(
                            $crate::schema::FieldDesc::new(
                                stringify!($field),
                                ::std::mem::offset_of!($ty, $field),
                                $crate::schema::kind_of(|record: &$ty| &record.$field),
                            ),
                        )*],
                    )
                })
            }
        }

        unsafe impl $crate::schema::FieldType for $ty {
            fn field_kind() -> $crate::schema::FieldKind {
                $crate::schema::FieldKind::Record(<$ty as $crate::schema::Record>::schema())
            }
        }
    };
}

/// Read access to a record through its schema, borrowed for `'a`
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    base: *const u8,
    schema: &'static RecordSchema,
    _borrow: PhantomData<&'a ()>,
}

impl<'a> RecordView<'a> {
    pub fn new<R: Record>(record: &'a R) -> Self {
        Self {
            base: (record as *const R).cast::<u8>(),
            schema: R::schema(),
            _borrow: PhantomData,
        }
    }

    pub fn schema(&self) -> &'static RecordSchema {
        self.schema
    }

    pub(crate) fn base(&self) -> *const u8 {
        self.base
    }
}

/// Write access to a record through its schema, borrowed for `'a`
#[derive(Debug)]
pub struct RecordViewMut<'a> {
    base: *mut u8,
    schema: &'static RecordSchema,
    _borrow: PhantomData<&'a mut ()>,
}

impl<'a> RecordViewMut<'a> {
    pub fn new<R: Record>(record: &'a mut R) -> Self {
        Self {
            base: (record as *mut R).cast::<u8>(),
            schema: R::schema(),
            _borrow: PhantomData,
        }
    }

    pub fn schema(&self) -> &'static RecordSchema {
        self.schema
    }

    pub fn as_view(&self) -> RecordView<'_> {
        RecordView {
            base: self.base,
            schema: self.schema,
            _borrow: PhantomData,
        }
    }

    pub(crate) fn base_mut(&mut self) -> *mut u8 {
        self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Inner {
        a: u16,
        b: [f32; 3],
    }
    crate::impl_record!(Inner { a, b });

    #[derive(Debug, Default)]
    struct Outer {
        flag: bool,
        grid: [[i32; 4]; 3],
        inner: Inner,
        hits: Vec<f64>,
        hidden: u64,
    }
    crate::impl_record!(Outer {
        flag,
        grid,
        inner,
        hits
    });

    #[test]
    fn test_schema_offsets() {
        let schema = Outer::schema();
        assert_eq!(schema.name, "Outer");
        assert_eq!(schema.size, std::mem::size_of::<Outer>());
        assert_eq!(schema.fields.len(), 4);
        let grid = schema.field("grid").unwrap();
        assert_eq!(grid.offset, std::mem::offset_of!(Outer, grid));
        match &grid.kind {
            FieldKind::Array {
                element,
                extents,
                stride,
            } => {
                assert_eq!(extents, &vec![3, 4]);
                assert_eq!(*stride, 4);
                assert!(matches!(**element, FieldKind::Scalar(ScalarType::I32)));
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert!(schema.field("hidden").is_none());
        assert!(matches!(
            schema.field("hits").unwrap().kind,
            FieldKind::Vector(ScalarType::F64)
        ));
    }

    #[test]
    fn test_leaf_paths() {
        let paths = Outer::schema().leaf_paths();
        assert_eq!(
            paths,
            vec![
                "flag".to_string(),
                "grid[3][4]".to_string(),
                "inner.a".to_string(),
                "inner.b[3]".to_string(),
                "hits[]".to_string(),
            ]
        );
    }

    #[test]
    fn test_scalar_read_write() {
        let mut value: i16 = -12;
        let ptr = (&mut value as *mut i16).cast::<u8>();
        unsafe {
            assert_eq!(ScalarType::I16.read(ptr), -12.0);
            ScalarType::I16.write(ptr, 300.7);
            assert_eq!(ScalarType::I16.read(ptr), 300.0);
        }
        assert_eq!(value, 300);
    }
}

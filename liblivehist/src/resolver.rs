use super::error::ResolutionError;
use super::schema::{FieldKind, RecordSchema, RecordView, RecordViewMut, ScalarType};

/// Alternative spelling for a vector element: `hits_stl_vector_at_2` is `hits[2]`
pub const VECTOR_ELEMENT_SUFFIX: &str = "_stl_vector_at_";

/// The resolved location of a numeric value inside a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Leaf {
    Scalar {
        offset: usize,
        ty: ScalarType,
    },
    /// The element is looked up per read since the vector may be resized between buffers
    VectorElement {
        offset: usize,
        ty: ScalarType,
        index: usize,
    },
}

/// A field path resolved against one schema. Cheap to clone and safe to cache for the lifetime
/// of a histogram.
#[derive(Debug, Clone)]
pub struct FieldHandle {
    path: String,
    schema: &'static RecordSchema,
    leaf: Leaf,
}

impl FieldHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    #[cfg(test)]
    fn leaf(&self) -> Leaf {
        self.leaf
    }

    #[cfg(test)]
    fn is_writable(&self) -> bool {
        matches!(self.leaf, Leaf::Scalar { .. })
    }

    /// Read the value. None if the view is of a different record type, or if a vector element
    /// is past the current end of its vector.
    pub fn read(&self, view: &RecordView<'_>) -> Option<f64> {
        if !std::ptr::eq(self.schema, view.schema()) {
            return None;
        }
        // The offsets were computed from this exact schema, which describes the borrowed record
        unsafe {
            match self.leaf {
                Leaf::Scalar { offset, ty } => Some(ty.read(view.base().add(offset))),
                Leaf::VectorElement { offset, ty, index } => {
                    ty.read_element(view.base().add(offset), index)
                }
            }
        }
    }

    /// Overwrite the value. Vector elements cannot be written.
    pub fn write(&self, view: &mut RecordViewMut<'_>, value: f64) -> Result<(), ResolutionError> {
        if !std::ptr::eq(self.schema, view.schema()) {
            return Err(ResolutionError::UnknownField {
                record: view.schema().name.to_string(),
                field: self.path.clone(),
            });
        }
        match self.leaf {
            Leaf::Scalar { offset, ty } => {
                unsafe { ty.write(view.base_mut().add(offset), value) };
                Ok(())
            }
            Leaf::VectorElement { .. } => Err(ResolutionError::ReadOnly(self.path.clone())),
        }
    }
}

#[derive(Debug)]
struct PathToken<'a> {
    name: &'a str,
    indices: Vec<usize>,
}

fn parse_token<'a>(token: &'a str, path: &str) -> Result<PathToken<'a>, ResolutionError> {
    let bad = || ResolutionError::BadPath(path.to_string());
    let (mut name, mut rest) = match token.find('[') {
        Some(pos) => (&token[..pos], &token[pos..]),
        None => (token, ""),
    };

    let mut indices = Vec::new();
    if let Some((base, index)) = name.split_once(VECTOR_ELEMENT_SUFFIX) {
        indices.push(index.parse::<usize>().map_err(|_| bad())?);
        name = base;
    }
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[').ok_or_else(bad)?;
        let close = inner.find(']').ok_or_else(bad)?;
        indices.push(inner[..close].trim().parse::<usize>().map_err(|_| bad())?);
        rest = &inner[close + 1..];
    }

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(bad());
    }
    Ok(PathToken { name, indices })
}

enum Located {
    Leaf(Leaf),
    Record {
        offset: usize,
        schema: &'static RecordSchema,
    },
}

fn locate(
    field: &str,
    kind: &FieldKind,
    indices: &[usize],
    offset: usize,
) -> Result<Located, ResolutionError> {
    match kind {
        FieldKind::Scalar(ty) => {
            if indices.is_empty() {
                Ok(Located::Leaf(Leaf::Scalar { offset, ty: *ty }))
            } else {
                Err(ResolutionError::NotIndexable(field.to_string()))
            }
        }
        FieldKind::Vector(ty) => match indices {
            [] => Err(ResolutionError::MissingElementIndex(field.to_string())),
            [index] => Ok(Located::Leaf(Leaf::VectorElement {
                offset,
                ty: *ty,
                index: *index,
            })),
            _ => Err(ResolutionError::WrongIndexCount {
                field: field.to_string(),
                expected: 1,
                found: indices.len(),
            }),
        },
        FieldKind::Array {
            element,
            extents,
            stride,
        } => {
            let takes_more = matches!(**element, FieldKind::Vector(_));
            let expected = extents.len() + usize::from(takes_more);
            if indices.len() != expected {
                return Err(ResolutionError::WrongIndexCount {
                    field: field.to_string(),
                    expected,
                    found: indices.len(),
                });
            }
            let (own, rest) = indices.split_at(extents.len());
            let mut flat = 0;
            for (index, extent) in own.iter().zip(extents.iter()) {
                if index >= extent {
                    return Err(ResolutionError::IndexOutOfBounds {
                        field: field.to_string(),
                        index: *index,
                        extent: *extent,
                    });
                }
                flat = flat * extent + index;
            }
            locate(field, element, rest, offset + flat * stride)
        }
        FieldKind::Record(schema) => {
            if indices.is_empty() {
                Ok(Located::Record { offset, schema })
            } else {
                Err(ResolutionError::NotIndexable(field.to_string()))
            }
        }
    }
}

/// Resolve a field path such as `tof.ch[2][1]` or `hits_stl_vector_at_3` against `schema`.
///
/// Multi-dimensional arrays are flattened row-major. Fixed-array bounds are checked here;
/// vector bounds are checked on every read.
pub fn resolve(schema: &'static RecordSchema, path: &str) -> Result<FieldHandle, ResolutionError> {
    let path = path.trim();
    if path.is_empty() {
        return Err(ResolutionError::BadPath(path.to_string()));
    }
    let tokens = path
        .split('.')
        .map(|token| parse_token(token, path))
        .collect::<Result<Vec<_>, _>>()?;

    let mut current = schema;
    let mut offset = 0;
    let last = tokens.len() - 1;
    for (position, token) in tokens.iter().enumerate() {
        let field = current
            .field(token.name)
            .ok_or_else(|| ResolutionError::UnknownField {
                record: current.name.to_string(),
                field: token.name.to_string(),
            })?;
        match locate(token.name, &field.kind, &token.indices, offset + field.offset)? {
            Located::Record {
                offset: record_offset,
                schema: nested,
            } => {
                if position == last {
                    return Err(ResolutionError::NotNumeric(path.to_string()));
                }
                current = nested;
                offset = record_offset;
            }
            Located::Leaf(leaf) => {
                if position != last {
                    return Err(ResolutionError::UnknownField {
                        record: token.name.to_string(),
                        field: tokens[position + 1].name.to_string(),
                    });
                }
                return Ok(FieldHandle {
                    path: path.to_string(),
                    schema,
                    leaf,
                });
            }
        }
    }
    Err(ResolutionError::BadPath(path.to_string()))
}

/// Resolve a path that may be prefixed with the branch name, as in `evt.adc[3]`
pub fn resolve_in_branch(
    branch: &str,
    schema: &'static RecordSchema,
    path: &str,
) -> Result<FieldHandle, ResolutionError> {
    let path = path.trim();
    let unprefixed = path
        .strip_prefix(branch)
        .and_then(|rest| rest.strip_prefix('.'));
    match unprefixed.map(|rest| resolve(schema, rest)) {
        Some(Ok(handle)) => Ok(handle),
        _ => resolve(schema, path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Record;

    #[derive(Debug, Default, Clone, Copy)]
    struct Channel {
        energy: f32,
        time: u16,
    }
    crate::impl_record!(Channel { energy, time });

    #[derive(Debug, Default)]
    struct Detector {
        id: u8,
        grid: [[i32; 4]; 3],
        channels: [Channel; 2],
        hits: Vec<f64>,
        banks: [Vec<u16>; 2],
    }
    crate::impl_record!(Detector {
        id,
        grid,
        channels,
        hits,
        banks
    });

    fn detector() -> Detector {
        let mut det = Detector {
            id: 7,
            ..Default::default()
        };
        for row in 0..3 {
            for col in 0..4 {
                det.grid[row][col] = (row * 10 + col) as i32;
            }
        }
        det.channels[1].energy = 2.5;
        det.channels[1].time = 44;
        det.hits = vec![1.0, 2.0, 3.0];
        det.banks[1] = vec![9, 8];
        det
    }

    #[test]
    fn test_row_major_indexing() {
        let det = detector();
        let view = RecordView::new(&det);
        let handle = resolve(Detector::schema(), "grid[2][3]").unwrap();
        assert_eq!(handle.read(&view), Some(23.0));
        let handle = resolve(Detector::schema(), "grid[1][0]").unwrap();
        assert_eq!(handle.read(&view), Some(10.0));
    }

    #[test]
    fn test_nested_record_in_array() {
        let det = detector();
        let view = RecordView::new(&det);
        let energy = resolve(Detector::schema(), "channels[1].energy").unwrap();
        let time = resolve(Detector::schema(), "channels[1].time").unwrap();
        assert_eq!(energy.read(&view), Some(2.5));
        assert_eq!(time.read(&view), Some(44.0));
    }

    #[test]
    fn test_vector_elements() {
        let mut det = detector();
        let bracket = resolve(Detector::schema(), "hits[2]").unwrap();
        let suffix = resolve(Detector::schema(), "hits_stl_vector_at_2").unwrap();
        assert_eq!(bracket.leaf(), suffix.leaf());
        assert_eq!(bracket.read(&RecordView::new(&det)), Some(3.0));

        det.hits.truncate(1);
        assert_eq!(bracket.read(&RecordView::new(&det)), None);

        let bank = resolve(Detector::schema(), "banks[1][0]").unwrap();
        assert_eq!(bank.read(&RecordView::new(&det)), Some(9.0));
    }

    #[test]
    fn test_resolution_errors() {
        let schema = Detector::schema();
        assert!(matches!(
            resolve(schema, "nope"),
            Err(ResolutionError::UnknownField { .. })
        ));
        assert!(matches!(
            resolve(schema, "id[0]"),
            Err(ResolutionError::NotIndexable(_))
        ));
        assert!(matches!(
            resolve(schema, "grid[1]"),
            Err(ResolutionError::WrongIndexCount {
                expected: 2,
                found: 1,
                ..
            })
        ));
        assert!(matches!(
            resolve(schema, "grid[3][0]"),
            Err(ResolutionError::IndexOutOfBounds {
                index: 3,
                extent: 3,
                ..
            })
        ));
        assert!(matches!(
            resolve(schema, "channels[0]"),
            Err(ResolutionError::NotNumeric(_))
        ));
        assert!(matches!(
            resolve(schema, "hits"),
            Err(ResolutionError::MissingElementIndex(_))
        ));
        assert!(matches!(
            resolve(schema, "grid[a][0]"),
            Err(ResolutionError::BadPath(_))
        ));
        assert!(matches!(
            resolve(schema, "id.x"),
            Err(ResolutionError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_write_through_handle() {
        let mut det = detector();
        let handle = resolve(Detector::schema(), "channels[0].time").unwrap();
        handle.write(&mut RecordViewMut::new(&mut det), 12.0).unwrap();
        assert_eq!(det.channels[0].time, 12);

        let element = resolve(Detector::schema(), "hits[0]").unwrap();
        assert!(!element.is_writable());
        assert!(matches!(
            element.write(&mut RecordViewMut::new(&mut det), 1.0),
            Err(ResolutionError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_branch_prefix() {
        let det = detector();
        let view = RecordView::new(&det);
        let handle = resolve_in_branch("det", Detector::schema(), "det.grid[0][2]").unwrap();
        assert_eq!(handle.read(&view), Some(2.0));
        let handle = resolve_in_branch("det", Detector::schema(), "id").unwrap();
        assert_eq!(handle.read(&view), Some(7.0));
        assert!(resolve_in_branch("det", Detector::schema(), "other.id").is_err());
    }

    #[test]
    fn test_schema_mismatch_reads_none() {
        let channel = Channel::default();
        let handle = resolve(Detector::schema(), "id").unwrap();
        assert_eq!(handle.read(&RecordView::new(&channel)), None);
    }
}

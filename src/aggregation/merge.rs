//! Sub-array geometry: bounding boxes and N-dimensional block copies.
//!
//! All arrays are dense and row-major. A box is a `(start, count)` pair with
//! one entry per dimension; a box with no dimensions is a single scalar.

use bytes::Bytes;

use crate::error::{IofwdError, IofwdResult};

/// One client's contribution to a variable write.
#[derive(Debug, Clone, PartialEq)]
pub struct SubArray {
    pub start: Vec<usize>,
    pub count: Vec<usize>,
    pub data: Bytes,
}

impl SubArray {
    pub fn ndims(&self) -> usize {
        self.start.len()
    }

    pub fn element_count(&self) -> IofwdResult<usize> {
        box_elements(&self.start, &self.count)
    }
}

fn overflow(start: &[usize], count: &[usize]) -> IofwdError {
    IofwdError::UnexpectedMessage(format!("box {:?}+{:?} overflows", start, count))
}

/// Element count of the box `(start, count)`. Fails when an end coordinate
/// or the element count does not fit a `usize`.
pub fn box_elements(start: &[usize], count: &[usize]) -> IofwdResult<usize> {
    let mut elements = 1usize;
    for (s, c) in start.iter().zip(count) {
        s.checked_add(*c).ok_or_else(|| overflow(start, count))?;
        elements = elements
            .checked_mul(*c)
            .ok_or_else(|| overflow(start, count))?;
    }
    Ok(elements)
}

/// Smallest box covering `boxes`, or `None` when empty.
pub fn bounding_box<'a, I>(boxes: I) -> IofwdResult<Option<(Vec<usize>, Vec<usize>)>>
where
    I: IntoIterator<Item = (&'a [usize], &'a [usize])>,
{
    let mut iter = boxes.into_iter();
    let Some((first_start, first_count)) = iter.next() else {
        return Ok(None);
    };
    box_elements(first_start, first_count)?;
    let mut start = first_start.to_vec();
    let mut count = first_count.to_vec();

    for (s, c) in iter {
        widen(&mut start, &mut count, s, c)?;
    }
    Ok(Some((start, count)))
}

/// Grow `(start, count)` in place so that it also covers `(other_start, other_count)`.
/// Nothing changes when either box overflows.
pub fn widen(
    start: &mut [usize],
    count: &mut [usize],
    other_start: &[usize],
    other_count: &[usize],
) -> IofwdResult<()> {
    let dims = start.len().min(other_start.len());
    let mut ends = Vec::with_capacity(dims);
    for i in 0..dims {
        let end = start[i]
            .checked_add(count[i])
            .ok_or_else(|| overflow(start, count))?;
        let other_end = other_start[i]
            .checked_add(other_count[i])
            .ok_or_else(|| overflow(other_start, other_count))?;
        ends.push(end.max(other_end));
    }
    for (i, end) in ends.into_iter().enumerate() {
        start[i] = start[i].min(other_start[i]);
        count[i] = end - start[i];
    }
    Ok(())
}

/// Visit every contiguous innermost run of the `src` box placed inside the
/// `dst` box. `f` receives `(src_offset, dst_offset, run_len)` in elements.
///
/// The walk keeps an index over the outer dimensions, bumps the innermost of
/// them and carries into the next one out on overflow, adjusting the
/// destination offset by the destination stride of each dimension touched.
pub fn for_each_run<F>(
    src_start: &[usize],
    src_count: &[usize],
    dst_start: &[usize],
    dst_count: &[usize],
    mut f: F,
) where
    F: FnMut(usize, usize, usize),
{
    let ndims = src_count.len();
    if ndims == 0 {
        f(0, 0, 1);
        return;
    }
    if src_count.iter().any(|c| *c == 0) {
        return;
    }

    let mut dst_stride = vec![1usize; ndims];
    for i in (0..ndims - 1).rev() {
        dst_stride[i] = dst_stride[i + 1] * dst_count[i + 1];
    }

    let run = src_count[ndims - 1];
    let mut dst_offset: usize = (0..ndims)
        .map(|i| (src_start[i] - dst_start[i]) * dst_stride[i])
        .sum();
    let mut src_offset = 0usize;
    let mut index = vec![0usize; ndims];

    loop {
        f(src_offset, dst_offset, run);
        src_offset += run;

        let mut dim = ndims - 1;
        loop {
            if dim == 0 {
                return;
            }
            dim -= 1;
            index[dim] += 1;
            dst_offset += dst_stride[dim];
            if index[dim] < src_count[dim] {
                break;
            }
            dst_offset -= src_count[dim] * dst_stride[dim];
            index[dim] = 0;
        }
    }
}

/// Copy the `src` box into the dense `dst` buffer holding the `dst` box.
pub fn copy_sub_array(
    src: &[u8],
    src_start: &[usize],
    src_count: &[usize],
    dst: &mut [u8],
    dst_start: &[usize],
    dst_count: &[usize],
    elem_size: usize,
) {
    for_each_run(src_start, src_count, dst_start, dst_count, |s, d, n| {
        let (s, d, n) = (s * elem_size, d * elem_size, n * elem_size);
        dst[d..d + n].copy_from_slice(&src[s..s + n]);
    });
}

/// Merge contributions into a single dense sub-array covering their bounding
/// box. Each contribution is dropped as soon as it has been copied.
///
/// Cells of the bounding box that no contribution covers are left zeroed.
pub fn merge_sub_arrays(parts: Vec<SubArray>, elem_size: usize) -> IofwdResult<Option<SubArray>> {
    let Some(first) = parts.first() else {
        return Ok(None);
    };
    let ndims = first.ndims();

    for part in &parts {
        if part.ndims() != ndims || part.count.len() != ndims {
            return Err(IofwdError::WrongDimensionality {
                expected: ndims,
                actual: part.ndims().max(part.count.len()),
            });
        }
        let expected = part
            .element_count()?
            .checked_mul(elem_size)
            .ok_or_else(|| overflow(&part.start, &part.count))?;
        if part.data.len() != expected {
            return Err(IofwdError::UnexpectedMessage(format!(
                "sub-array carries {} bytes, its box needs {}",
                part.data.len(),
                expected
            )));
        }
    }

    let (start, count) = bounding_box(
        parts
            .iter()
            .map(|p| (p.start.as_slice(), p.count.as_slice())),
    )?
    .unwrap_or_default();

    let total = box_elements(&start, &count)?
        .checked_mul(elem_size)
        .ok_or_else(|| overflow(&start, &count))?;
    let mut dense = vec![0u8; total];

    for part in parts {
        copy_sub_array(
            &part.data,
            &part.start,
            &part.count,
            &mut dense,
            &start,
            &count,
            elem_size,
        );
    }

    Ok(Some(SubArray {
        start,
        count,
        data: Bytes::from(dense),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{to_le_bytes, Element};
    use proptest::prelude::*;

    fn part(start: &[usize], count: &[usize], values: &[f64]) -> SubArray {
        SubArray {
            start: start.to_vec(),
            count: count.to_vec(),
            data: Bytes::from(to_le_bytes(values)),
        }
    }

    #[test]
    fn test_widen() {
        let (start, count) = bounding_box([
            (&[2usize, 3][..], &[2usize, 2][..]),
            (&[0, 4][..], &[1, 4][..]),
        ])
        .unwrap()
        .unwrap();
        assert_eq!(start, vec![0, 3]);
        assert_eq!(count, vec![4, 5]);
    }

    #[test]
    fn test_merge_two_halves_of_four_by_four() {
        let top: Vec<f64> = (0..8).map(|v| v as f64).collect();
        let bottom: Vec<f64> = (8..16).map(|v| v as f64).collect();

        let merged = merge_sub_arrays(
            vec![part(&[2, 0], &[2, 4], &bottom), part(&[0, 0], &[2, 4], &top)],
            8,
        )
        .unwrap()
        .unwrap();

        assert_eq!(merged.start, vec![0, 0]);
        assert_eq!(merged.count, vec![4, 4]);
        let values = f64::from_le_slice(&merged.data);
        assert_eq!(values, (0..16).map(|v| v as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_merge_side_by_side_columns() {
        // Two 2x2 blocks next to each other in a 2x4 box.
        let left = [1.0, 2.0, 5.0, 6.0];
        let right = [3.0, 4.0, 7.0, 8.0];
        let merged = merge_sub_arrays(
            vec![part(&[0, 0], &[2, 2], &left), part(&[0, 2], &[2, 2], &right)],
            8,
        )
        .unwrap()
        .unwrap();

        assert_eq!(merged.count, vec![2, 4]);
        assert_eq!(
            f64::from_le_slice(&merged.data),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]
        );
    }

    #[test]
    fn test_merge_scalar_and_empty() {
        assert!(merge_sub_arrays(Vec::new(), 8).unwrap().is_none());

        let merged = merge_sub_arrays(vec![part(&[], &[], &[4.5])], 8).unwrap().unwrap();
        assert_eq!(f64::from_le_slice(&merged.data), vec![4.5]);
    }

    #[test]
    fn test_merge_rejects_mismatched_parts() {
        let err = merge_sub_arrays(
            vec![part(&[0, 0], &[1, 1], &[1.0]), part(&[0], &[1], &[1.0])],
            8,
        )
        .unwrap_err();
        assert!(matches!(err, IofwdError::WrongDimensionality { expected: 2, actual: 1 }));

        let err = merge_sub_arrays(vec![part(&[0], &[3], &[1.0])], 8).unwrap_err();
        assert!(matches!(err, IofwdError::UnexpectedMessage(_)));
    }

    #[test]
    fn test_overflowing_boxes_rejected() {
        // End coordinate past usize::MAX.
        let err = merge_sub_arrays(vec![part(&[usize::MAX, 0], &[2, 1], &[1.0, 2.0])], 8)
            .unwrap_err();
        assert!(matches!(err, IofwdError::UnexpectedMessage(_)));

        // Element count overflows.
        let huge = SubArray {
            start: vec![0, 0],
            count: vec![usize::MAX / 2, 4],
            data: Bytes::new(),
        };
        assert!(huge.element_count().is_err());
        assert!(merge_sub_arrays(vec![huge], 8).is_err());

        // Each box is fine alone, but its bytes do not fit.
        let wide = SubArray {
            start: vec![0],
            count: vec![usize::MAX / 4],
            data: Bytes::new(),
        };
        assert!(matches!(
            merge_sub_arrays(vec![wide], 8),
            Err(IofwdError::UnexpectedMessage(_))
        ));

        let (mut start, mut count) = (vec![0usize], vec![4usize]);
        assert!(widen(&mut start, &mut count, &[usize::MAX - 1], &[3]).is_err());
        assert_eq!((start, count), (vec![0], vec![4]));
    }

    #[test]
    fn test_runs_of_inner_block() {
        let mut runs = Vec::new();
        for_each_run(&[1, 1], &[2, 2], &[0, 0], &[4, 4], |s, d, n| runs.push((s, d, n)));
        assert_eq!(runs, vec![(0, 5, 2), (2, 9, 2)]);
    }

    proptest! {
        // Splitting a 3-D array into row slabs and merging them back in any
        // order reproduces the array.
        #[test]
        fn prop_merge_restores_slabs(
            dims in (1usize..5, 1usize..5, 1usize..5),
            cuts in proptest::collection::vec(any::<bool>(), 4),
            reverse in any::<bool>(),
        ) {
            let (nx, ny, nz) = dims;
            let full: Vec<f64> = (0..nx * ny * nz).map(|v| v as f64).collect();

            let mut parts = Vec::new();
            let mut row = 0;
            while row < nx {
                let mut rows = 1;
                while row + rows < nx && cuts.get(row + rows - 1).copied().unwrap_or(false) {
                    rows += 1;
                }
                let begin = row * ny * nz;
                let end = (row + rows) * ny * nz;
                parts.push(part(&[row, 0, 0], &[rows, ny, nz], &full[begin..end]));
                row += rows;
            }
            if reverse {
                parts.reverse();
            }

            let merged = merge_sub_arrays(parts, 8).unwrap().unwrap();
            prop_assert_eq!(merged.start, vec![0, 0, 0]);
            prop_assert_eq!(merged.count, vec![nx, ny, nz]);
            prop_assert_eq!(f64::from_le_slice(&merged.data), full);
        }
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Plane layouts and bounded plane copies.

use std::ops::Range;

use thiserror::Error;

use crate::utils::align_up;
use crate::video_frame::U_PLANE;
use crate::video_frame::V_PLANE;
use crate::video_frame::Y_PLANE;
use crate::PlaneLayout;

/// Chroma planes of the output buffers have their stride aligned to this value.
pub const CHROMA_STRIDE_ALIGNMENT: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlaneCopyError {
    #[error("line width {width} exceeds stride {stride}")]
    StrideTooSmall { width: usize, stride: usize },
    #[error("{lines} lines do not fit in a plane of {height} lines")]
    HeightTooSmall { lines: usize, height: usize },
    #[error("plane needs {needed} bytes but only {available} are available")]
    Overflow { needed: usize, available: usize },
}

/// Returns the dimensions of the chroma planes of a 4:2:0 frame of `width`x`height`.
pub fn chroma_dimensions(width: usize, height: usize) -> (usize, usize) {
    ((width + 1) / 2, (height + 1) / 2)
}

/// Returns the size of a tightly packed I420 frame of `width`x`height`.
pub fn i420_frame_size(width: usize, height: usize) -> usize {
    let (uv_width, uv_height) = chroma_dimensions(width, height);

    width * height + 2 * uv_width * uv_height
}

/// Layout of the YV12 buffers frames are delivered into.
///
/// The full-resolution Y plane comes first, followed by the V plane and then the U plane, both at
/// half resolution with a stride aligned to [`CHROMA_STRIDE_ALIGNMENT`]. The visible image starts
/// `border` texels from the top-left corner of the luma plane, and `border / 2` texels from the
/// top-left corner of each chroma plane.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Yv12Layout {
    pub stride: usize,
    pub height: usize,
    pub border: usize,
    pub chroma_stride: usize,
}

impl Yv12Layout {
    pub fn new(stride: usize, height: usize, border: usize) -> Self {
        Self {
            stride,
            height,
            border,
            chroma_stride: align_up(stride / 2, CHROMA_STRIDE_ALIGNMENT),
        }
    }

    pub fn y_size(&self) -> usize {
        self.stride * self.height
    }

    pub fn chroma_size(&self) -> usize {
        self.chroma_stride * self.height / 2
    }

    /// Total size of the buffer. This is also the filled length reported for output frames.
    pub fn size(&self) -> usize {
        self.y_size() + 2 * self.chroma_size()
    }

    /// Byte range occupied by `plane` in the buffer.
    ///
    /// # Panics
    ///
    /// If `plane` is not one of `Y_PLANE`, `U_PLANE` or `V_PLANE`.
    pub fn plane_region(&self, plane: usize) -> Range<usize> {
        let (start, len) = match plane {
            Y_PLANE => (0, self.y_size()),
            V_PLANE => (self.y_size(), self.chroma_size()),
            U_PLANE => (self.y_size() + self.chroma_size(), self.chroma_size()),
            _ => panic!("YV12 has no plane {}", plane),
        };

        start..start + len
    }

    /// Position of the first visible texel of `plane` and its stride.
    ///
    /// # Panics
    ///
    /// If `plane` is not one of `Y_PLANE`, `U_PLANE` or `V_PLANE`.
    pub fn plane(&self, plane: usize) -> PlaneLayout {
        // Rejects invalid planes.
        let region = self.plane_region(plane);
        if plane == Y_PLANE {
            PlaneLayout {
                offset: region.start + self.border * self.stride + self.border,
                stride: self.stride,
            }
        } else {
            PlaneLayout {
                offset: region.start + (self.border / 2) * self.chroma_stride + self.border / 2,
                stride: self.chroma_stride,
            }
        }
    }

    /// Visible origins of the Y, U and V planes, in plane index order.
    pub fn planes(&self) -> [PlaneLayout; 3] {
        [
            self.plane(Y_PLANE),
            self.plane(U_PLANE),
            self.plane(V_PLANE),
        ]
    }

    /// Checks that lines of `width` visible texels, once shifted by the border, end before the
    /// padding of the next line.
    pub fn check_visible_width(&self, width: usize) -> Result<(), PlaneCopyError> {
        let needed = self.border + width;
        if needed > self.stride {
            return Err(PlaneCopyError::StrideTooSmall {
                width: needed,
                stride: self.stride,
            });
        }

        Ok(())
    }

    /// Checks that `lines` visible lines, once shifted by the border, fit in the luma plane.
    pub fn check_visible_height(&self, lines: usize) -> Result<(), PlaneCopyError> {
        let needed = self.border + lines;
        if needed > self.height {
            return Err(PlaneCopyError::HeightTooSmall {
                lines: needed,
                height: self.height,
            });
        }

        Ok(())
    }
}

/// Copies `height` lines of `width` bytes from `src` to `dst`.
///
/// `dst_end` bounds the destination plane: no byte at or past it is written, so that a plane
/// cannot spill into the next one. All bounds are checked before anything is copied.
pub fn copy_plane(
    src: &[u8],
    src_layout: PlaneLayout,
    dst: &mut [u8],
    dst_layout: PlaneLayout,
    dst_end: usize,
    width: usize,
    height: usize,
) -> Result<(), PlaneCopyError> {
    if width == 0 || height == 0 {
        return Ok(());
    }

    for stride in [src_layout.stride, dst_layout.stride] {
        if stride < width {
            return Err(PlaneCopyError::StrideTooSmall { width, stride });
        }
    }

    let src_needed = src_layout.offset + (height - 1) * src_layout.stride + width;
    if src_needed > src.len() {
        return Err(PlaneCopyError::Overflow {
            needed: src_needed,
            available: src.len(),
        });
    }

    let dst_end = dst_end.min(dst.len());
    let dst_needed = dst_layout.offset + (height - 1) * dst_layout.stride + width;
    if dst_needed > dst_end {
        return Err(PlaneCopyError::Overflow {
            needed: dst_needed,
            available: dst_end,
        });
    }

    let src_lines = src[src_layout.offset..src_needed]
        .chunks(src_layout.stride)
        .map(|line| &line[..width]);
    let dst_lines = dst[dst_layout.offset..dst_needed]
        .chunks_mut(dst_layout.stride)
        .map(|line| &mut line[..width]);

    for (src_line, dst_line) in src_lines.zip(dst_lines) {
        dst_line.copy_from_slice(src_line);
    }

    Ok(())
}

/// Extracts the visible `width`x`height` image of a YV12 buffer with `layout` into a tightly
/// packed I420 frame, i.e. Y, then U, then V without any padding.
pub fn yv12_to_i420(
    src: &[u8],
    layout: &Yv12Layout,
    width: usize,
    height: usize,
) -> Result<Vec<u8>, PlaneCopyError> {
    let (uv_width, uv_height) = chroma_dimensions(width, height);
    let mut dst = vec![0u8; i420_frame_size(width, height)];

    let y_size = width * height;
    let uv_size = uv_width * uv_height;
    let planes = [
        (Y_PLANE, 0, width, height),
        (U_PLANE, y_size, uv_width, uv_height),
        (V_PLANE, y_size + uv_size, uv_width, uv_height),
    ];

    for (plane, dst_offset, plane_width, plane_height) in planes {
        let dst_layout = PlaneLayout {
            offset: dst_offset,
            stride: plane_width,
        };
        let dst_end = dst_offset + plane_width * plane_height;
        copy_plane(
            src,
            layout.plane(plane),
            &mut dst,
            dst_layout,
            dst_end,
            plane_width,
            plane_height,
        )?;
    }

    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yv12_layout() {
        let layout = Yv12Layout::new(80, 80, 8);

        assert_eq!(layout.chroma_stride, 48);
        assert_eq!(layout.y_size(), 6400);
        assert_eq!(layout.chroma_size(), 48 * 40);
        assert_eq!(layout.size(), 6400 + 2 * 1920);

        // V comes right after Y, then U.
        assert_eq!(layout.plane_region(V_PLANE), 6400..8320);
        assert_eq!(layout.plane_region(U_PLANE), 8320..10240);

        assert_eq!(layout.plane(Y_PLANE).offset, 8 * 80 + 8);
        assert_eq!(layout.plane(V_PLANE).offset, 6400 + 4 * 48 + 4);
        assert_eq!(layout.plane(U_PLANE).offset, 8320 + 4 * 48 + 4);
    }

    #[test]
    fn test_visible_width() {
        let layout = Yv12Layout::new(80, 80, 8);

        assert_eq!(layout.check_visible_width(64), Ok(()));
        assert_eq!(layout.check_visible_width(72), Ok(()));
        assert_eq!(
            layout.check_visible_width(73),
            Err(PlaneCopyError::StrideTooSmall {
                width: 81,
                stride: 80
            })
        );
    }

    #[test]
    fn test_visible_height() {
        let layout = Yv12Layout::new(96, 32, 8);

        assert_eq!(layout.check_visible_height(16), Ok(()));
        assert_eq!(layout.check_visible_height(24), Ok(()));
        assert_eq!(
            layout.check_visible_height(25),
            Err(PlaneCopyError::HeightTooSmall {
                lines: 33,
                height: 32
            })
        );
    }

    #[test]
    fn test_planes_in_index_order() {
        let layout = Yv12Layout::new(80, 80, 8);

        assert_eq!(
            layout.planes(),
            [
                layout.plane(Y_PLANE),
                layout.plane(U_PLANE),
                layout.plane(V_PLANE)
            ]
        );
    }

    #[test]
    #[should_panic(expected = "YV12 has no plane 3")]
    fn test_plane_region_rejects_invalid_plane() {
        Yv12Layout::new(80, 80, 8).plane_region(3);
    }

    #[test]
    #[should_panic(expected = "YV12 has no plane 3")]
    fn test_plane_rejects_invalid_plane() {
        Yv12Layout::new(80, 80, 8).plane(3);
    }

    #[test]
    fn test_plane_regions_do_not_overlap() {
        for (stride, height) in [(64, 64), (80, 96), (1984, 1152), (100, 30)] {
            let layout = Yv12Layout::new(stride, height, 8);
            let y = layout.plane_region(Y_PLANE);
            let v = layout.plane_region(V_PLANE);
            let u = layout.plane_region(U_PLANE);

            assert_eq!(y.end, v.start);
            assert_eq!(v.end, u.start);
            assert_eq!(u.end, layout.size());
        }
    }

    #[test]
    fn test_copy_plane_only_touches_visible_area() {
        let src: Vec<u8> = (0..16).collect();
        let mut dst = vec![0xffu8; 24];

        copy_plane(
            &src,
            PlaneLayout {
                offset: 0,
                stride: 4,
            },
            &mut dst,
            PlaneLayout {
                offset: 1,
                stride: 6,
            },
            24,
            3,
            2,
        )
        .unwrap();

        assert_eq!(
            dst,
            vec![
                0xff, 0, 1, 2, 0xff, 0xff, //
                0xff, 4, 5, 6, 0xff, 0xff, //
                0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
                0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            ]
        );
    }

    #[test]
    fn test_copy_plane_rejects_overflow() {
        let src = vec![0u8; 64];
        let mut dst = vec![0u8; 64];
        let layout = PlaneLayout {
            offset: 0,
            stride: 8,
        };

        // The last line would end at byte 36, past the end of the plane region.
        assert_eq!(
            copy_plane(&src, layout, &mut dst, layout, 32, 4, 5),
            Err(PlaneCopyError::Overflow {
                needed: 36,
                available: 32
            })
        );
        assert!(dst.iter().all(|&b| b == 0));

        assert_eq!(
            copy_plane(&src, layout, &mut dst, PlaneLayout { offset: 0, stride: 2 }, 64, 4, 1),
            Err(PlaneCopyError::StrideTooSmall {
                width: 4,
                stride: 2
            })
        );
    }

    #[test]
    fn test_yv12_to_i420() {
        let layout = Yv12Layout::new(16, 8, 2);
        let mut buffer = vec![0u8; layout.size()];
        // Mark the first visible texel of each plane.
        buffer[layout.plane(Y_PLANE).offset] = 1;
        buffer[layout.plane(U_PLANE).offset] = 2;
        buffer[layout.plane(V_PLANE).offset] = 3;

        let frame = yv12_to_i420(&buffer, &layout, 4, 4).unwrap();

        assert_eq!(frame.len(), 16 + 4 + 4);
        assert_eq!(frame[0], 1);
        assert_eq!(frame[16], 2);
        assert_eq!(frame[20], 3);
    }

    #[test]
    fn test_chroma_dimensions_round_up() {
        assert_eq!(chroma_dimensions(5, 3), (3, 2));
        assert_eq!(i420_frame_size(5, 3), 15 + 2 * 6);
    }
}

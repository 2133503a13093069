// image.rs — Runtime-sized image container, generic over pixel type.
//
// Two pixel types flow through the warp:
//   - `u8`   for the inside and blur masks (one weight per region pixel),
//   - `Rgba` for source frames and resampled output.
//
// Memory layout is row-major with an explicit stride. Rows built by this
// crate never carry padding, but frames handed in by a caller may (e.g. a
// camera buffer with aligned rows), so every accessor goes through `stride`.
//
// PACKED WORDS
// ────────────
// The compute kernel reads and writes one `u32` per pixel. The single
// packing used everywhere (upload, readback, the kernel's word copies) is
// little-endian RGBA:
//
//   bits  0.. 7  red
//   bits  8..15  green
//   bits 16..23  blue
//   bits 24..31  alpha
//
// so `u32::from_le_bytes([r, g, b, a])` and the kernel agree byte for byte.
// The alpha byte of the region buffer doubles as the blend weight on input.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Pixel Trait
// ---------------------------------------------------------------------------

/// Trait for types that can serve as pixel values in an Image.
///
/// `Default` is the empty value: 0 for masks, fully transparent black for
/// colour. A freshly allocated image is therefore an empty mask or a fully
/// transparent frame.
pub trait Pixel: Copy + Default + PartialEq + Send + Sync + 'static {}

impl Pixel for u8 {}

/// An 8-bit-per-channel RGBA colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Pixel for Rgba {}

impl Rgba {
    pub const TRANSPARENT: Rgba = Rgba { r: 0, g: 0, b: 0, a: 0 };

    #[inline]
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Rgba { r, g, b, a }
    }

    /// Pack into one word, red in the low byte.
    #[inline]
    pub fn pack(self) -> u32 {
        u32::from_le_bytes([self.r, self.g, self.b, self.a])
    }

    /// Inverse of [`Rgba::pack`].
    #[inline]
    pub fn unpack(word: u32) -> Self {
        let [r, g, b, a] = word.to_le_bytes();
        Rgba { r, g, b, a }
    }

    /// Largest per-channel absolute difference.
    #[inline]
    pub fn max_channel_diff(self, other: Rgba) -> u8 {
        self.r
            .abs_diff(other.r)
            .max(self.g.abs_diff(other.g))
            .max(self.b.abs_diff(other.b))
            .max(self.a.abs_diff(other.a))
    }
}

impl From<image::Rgba<u8>> for Rgba {
    fn from(p: image::Rgba<u8>) -> Self {
        let [r, g, b, a] = p.0;
        Rgba { r, g, b, a }
    }
}

impl From<Rgba> for image::Rgba<u8> {
    fn from(p: Rgba) -> Self {
        image::Rgba([p.r, p.g, p.b, p.a])
    }
}

// ---------------------------------------------------------------------------
// Image<T>
// ---------------------------------------------------------------------------

/// A 2D image with runtime dimensions, generic over pixel type `T`.
#[derive(Clone, PartialEq)]
pub struct Image<T: Pixel> {
    /// Pixel data in row-major order. Length = height * stride.
    data: Vec<T>,
    width: usize,
    height: usize,
    /// Row stride in *elements* (not bytes). stride >= width.
    stride: usize,
}

impl<T: Pixel> Image<T> {
    // --- Constructors ---

    /// Create an image filled with `T::default()`. Stride equals width.
    pub fn new(width: usize, height: usize) -> Self {
        Self::new_with_stride(width, height, width)
    }

    /// Create an empty image with an explicit stride.
    ///
    /// # Panics
    /// Panics if `stride < width`.
    pub fn new_with_stride(width: usize, height: usize, stride: usize) -> Self {
        assert!(stride >= width, "stride ({stride}) must be >= width ({width})");
        Image { data: vec![T::default(); height * stride], width, height, stride }
    }

    /// Create an image from an existing pixel vector with no row padding.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        Image { data, width, height, stride: width }
    }

    /// Create an image from raw data with explicit stride.
    ///
    /// # Panics
    /// Panics if `data.len() != height * stride` or `stride < width`.
    pub fn from_vec_with_stride(width: usize, height: usize, stride: usize, data: Vec<T>) -> Self {
        assert!(stride >= width, "stride ({stride}) must be >= width ({width})");
        assert_eq!(
            data.len(),
            height * stride,
            "data length ({}) must equal height * stride ({})",
            data.len(),
            height * stride,
        );
        Image { data, width, height, stride }
    }

    /// Build an image by evaluating `f(x, y)` at every pixel.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Image { data, width, height, stride: width }
    }

    // --- Accessors ---

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Get the pixel value at (x, y). x is column, y is row.
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.bounds_check(x, y);
        self.data[y * self.stride + x]
    }

    /// Signed lookup: `None` outside the image instead of a panic.
    ///
    /// This is the sampling primitive of the resampler, where a transformed
    /// coordinate may land anywhere in the plane.
    #[inline]
    pub fn get_checked(&self, x: i64, y: i64) -> Option<T> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return None;
        }
        Some(self.data[y as usize * self.stride + x as usize])
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        self.bounds_check(x, y);
        self.data[y * self.stride + x] = value;
    }

    /// Borrow a single row (without stride padding).
    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    /// Iterate over all pixels as `(x, y, value)` tuples, skipping padding.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        (0..self.height).flat_map(move |y| {
            (0..self.width).map(move |x| (x, y, self.data[y * self.stride + x]))
        })
    }

    /// Copy out the active pixels with padding removed (stride == width).
    pub fn to_compact_vec(&self) -> Vec<T> {
        if self.stride == self.width {
            return self.data.clone();
        }
        let mut out = Vec::with_capacity(self.width * self.height);
        for y in 0..self.height {
            out.extend_from_slice(self.row(y));
        }
        out
    }

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for image {}×{}",
            self.width,
            self.height,
        );
    }
}

// ---------------------------------------------------------------------------
// RGBA frames: packing and `image` crate interop
// ---------------------------------------------------------------------------

impl Image<Rgba> {
    /// Pack every pixel into one word (see module header), padding removed.
    pub fn to_packed(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.width * self.height);
        for y in 0..self.height {
            out.extend(self.row(y).iter().map(|p| p.pack()));
        }
        out
    }

    /// Rebuild a frame from packed words.
    ///
    /// # Panics
    /// Panics if `words.len() != width * height`.
    pub fn from_packed(width: usize, height: usize, words: &[u32]) -> Self {
        Image::from_vec(width, height, words.iter().map(|&w| Rgba::unpack(w)).collect())
    }

    /// Copy an `image::RgbaImage` into a frame.
    pub fn from_rgba_image(src: &image::RgbaImage) -> Self {
        let (w, h) = src.dimensions();
        let data = src.pixels().map(|&p| Rgba::from(p)).collect();
        Image::from_vec(w as usize, h as usize, data)
    }

    /// Copy a frame out into an `image::RgbaImage`.
    pub fn to_rgba_image(&self) -> image::RgbaImage {
        image::RgbaImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            self.get(x as usize, y as usize).into()
        })
    }

    /// Largest per-channel difference over all pixels where `mask` is set.
    ///
    /// # Panics
    /// Panics if the two frames or the mask differ in size.
    pub fn max_diff_where(&self, other: &Image<Rgba>, mask: &Image<u8>) -> u8 {
        assert_eq!((self.width, self.height), (other.width, other.height));
        assert_eq!((self.width, self.height), (mask.width, mask.height));
        let mut worst = 0;
        for (x, y, m) in mask.pixels() {
            if m > 0 {
                worst = worst.max(self.get(x, y).max_channel_diff(other.get(x, y)));
            }
        }
        worst
    }
}

impl From<&image::RgbaImage> for Image<Rgba> {
    fn from(src: &image::RgbaImage) -> Self {
        Image::from_rgba_image(src)
    }
}

impl Image<u8> {
    /// View a mask as a grayscale `image::GrayImage` (for dumping to PNG).
    pub fn to_gray_image(&self) -> image::GrayImage {
        image::GrayImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            image::Luma([self.get(x as usize, y as usize)])
        })
    }

    /// Number of nonzero pixels.
    pub fn count_nonzero(&self) -> usize {
        self.pixels().filter(|&(_, _, v)| v > 0).count()
    }
}

// Debug formatting, handy for small images in tests.
impl<T: Pixel + fmt::Debug> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Image<{}> {{ {}×{}, stride={} }}",
            std::any::type_name::<T>(),
            self.width,
            self.height,
            self.stride,
        )?;
        for y in 0..self.height.min(8) {
            write!(f, "  row {y}: [")?;
            for x in 0..self.width.min(16) {
                if x > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:?}", self.get(x, y))?;
            }
            if self.width > 16 {
                write!(f, ", ...")?;
            }
            writeln!(f, "]")?;
        }
        if self.height > 8 {
            writeln!(f, "  ...")?;
        }
        Ok(())
    }
}

impl<T: Pixel> std::ops::Index<(usize, usize)> for Image<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &T {
        self.bounds_check(x, y);
        &self.data[y * self.stride + x]
    }
}

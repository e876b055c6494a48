use ndarray::prelude::*;
use opencv::core::{self as cv, Mat, Scalar, Size};
use opencv::imgproc;
use opencv::prelude::*;

use crate::bbox::{BBox, Ltwh};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Gray8,
    Bgr8,
    Bgra8,
}

impl PixelFormat {
    #[inline]
    pub fn channels(&self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Bgr8 => 3,
            PixelFormat::Bgra8 => 4,
        }
    }

    fn mat_type(&self) -> i32 {
        match self {
            PixelFormat::Gray8 => cv::CV_8UC1,
            PixelFormat::Bgr8 => cv::CV_8UC3,
            PixelFormat::Bgra8 => cv::CV_8UC4,
        }
    }
}

/// Interleaved pixels as delivered by a capture source.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    /// Seconds.
    pub timestamp: f64,
}

impl RawFrame {
    pub fn to_gray(&self) -> Result<GrayFrame> {
        let (w, h) = (self.width as usize, self.height as usize);
        let expected = w * h * self.format.channels();

        if w == 0 || h == 0 {
            return Err(Error::malformed(format!("empty frame {}x{}", w, h)));
        }

        if self.data.len() != expected {
            return Err(Error::malformed(format!(
                "{}x{} {:?} needs {} bytes, got {}",
                w,
                h,
                self.format,
                expected,
                self.data.len()
            )));
        }

        if self.format == PixelFormat::Gray8 {
            let pixels = Array2::from_shape_vec((h, w), self.data.clone())
                .map_err(|e| Error::malformed(e.to_string()))?;

            return Ok(GrayFrame::new(pixels, self.timestamp));
        }

        let mut src = Mat::new_rows_cols_with_default(
            h as i32,
            w as i32,
            self.format.mat_type(),
            Scalar::all(0.),
        )?;
        src.data_bytes_mut()?.copy_from_slice(&self.data);

        let code = match self.format {
            PixelFormat::Bgra8 => imgproc::COLOR_BGRA2GRAY,
            _ => imgproc::COLOR_BGR2GRAY,
        };

        let mut gray = Mat::default();
        imgproc::cvt_color_def(&src, &mut gray, code)?;

        GrayFrame::from_mat(&gray, self.timestamp)
    }
}

/// Single-channel 8-bit image, rows x cols.
#[derive(Debug, Clone)]
pub struct GrayFrame {
    pub pixels: Array2<u8>,
    pub timestamp: f64,
}

impl GrayFrame {
    #[inline]
    pub fn new(pixels: Array2<u8>, timestamp: f64) -> Self {
        Self { pixels, timestamp }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.pixels.ncols()
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.pixels.nrows()
    }

    #[inline]
    pub fn dims(&self) -> (usize, usize) {
        (self.width(), self.height())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Copies the region clipped to the image; an empty intersection is an error.
    pub fn crop(&self, region: BBox<Ltwh>) -> Result<GrayFrame> {
        let x0 = region.left().max(0.0).round() as usize;
        let y0 = region.top().max(0.0).round() as usize;
        let x1 = ((region.left() + region.width()).round().max(0.0) as usize).min(self.width());
        let y1 = ((region.top() + region.height()).round().max(0.0) as usize).min(self.height());

        if x0 >= x1 || y0 >= y1 {
            return Err(Error::malformed(format!(
                "crop {:?} outside {}x{} image",
                region.as_slice(),
                self.width(),
                self.height()
            )));
        }

        let view = self.pixels.slice(s![y0..y1, x0..x1]);

        Ok(GrayFrame::new(view.to_owned(), self.timestamp))
    }

    /// Resamples by `scale` with area interpolation when shrinking.
    pub fn resized(&self, scale: f64) -> Result<GrayFrame> {
        if !(scale > 0.0 && scale.is_finite()) {
            return Err(Error::config(format!("invalid resize scale {}", scale)));
        }

        if (scale - 1.0).abs() < 1e-9 {
            return Ok(self.clone());
        }

        let w = ((self.width() as f64 * scale).round() as i32).max(1);
        let h = ((self.height() as f64 * scale).round() as i32).max(1);
        let interpolation = if scale < 1.0 {
            imgproc::INTER_AREA
        } else {
            imgproc::INTER_LINEAR
        };

        let src = self.to_mat()?;
        let mut dst = Mat::default();
        imgproc::resize(&src, &mut dst, Size::new(w, h), 0.0, 0.0, interpolation)?;

        GrayFrame::from_mat(&dst, self.timestamp)
    }

    pub fn to_mat(&self) -> Result<Mat> {
        if self.is_empty() {
            return Err(Error::malformed("empty frame"));
        }

        let pixels = self.pixels.as_standard_layout();
        let bytes = pixels
            .as_slice()
            .ok_or_else(|| Error::malformed("non-contiguous pixel buffer"))?;

        let mut mat = Mat::new_rows_cols_with_default(
            self.height() as i32,
            self.width() as i32,
            cv::CV_8UC1,
            Scalar::all(0.),
        )?;
        mat.data_bytes_mut()?.copy_from_slice(bytes);

        Ok(mat)
    }

    pub fn from_mat(mat: &Mat, timestamp: f64) -> Result<GrayFrame> {
        if mat.typ() != cv::CV_8UC1 {
            return Err(Error::malformed(format!("expected CV_8UC1, got type {}", mat.typ())));
        }

        let (rows, cols) = (mat.rows() as usize, mat.cols() as usize);
        let bytes = if mat.is_continuous() {
            mat.data_bytes()?.to_vec()
        } else {
            mat.try_clone()?.data_bytes()?.to_vec()
        };

        let pixels =
            Array2::from_shape_vec((rows, cols), bytes).map_err(|e| Error::malformed(e.to_string()))?;

        Ok(GrayFrame::new(pixels, timestamp))
    }
}

//! Vector data formats and conversion to/from the fp32 working buffer.
//!
//! The index accepts and hands back rows in one of four dense element
//! formats. All numeric kernels operate on fp32, so both build and query
//! paths convert through a working buffer: a range-indexed variant for
//! contiguous row spans and an offset-indexed variant for gather-style
//! access (partitioned builds pull scattered rows out of one dataset).

use half::{bf16, f16};

use crate::error::{IndexError, Result};

/// Element format of raw vector rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Fp32,
    Fp16,
    Bf16,
    Int8,
}

/// Owned raw rows in one of the supported formats.
#[derive(Debug, Clone)]
pub enum VectorData {
    Fp32(Vec<f32>),
    Fp16(Vec<f16>),
    Bf16(Vec<bf16>),
    Int8(Vec<i8>),
}

impl VectorData {
    /// Allocate a zeroed buffer of `len` elements in `format`.
    pub fn zeros(format: DataFormat, len: usize) -> Self {
        match format {
            DataFormat::Fp32 => VectorData::Fp32(vec![0.0; len]),
            DataFormat::Fp16 => VectorData::Fp16(vec![f16::ZERO; len]),
            DataFormat::Bf16 => VectorData::Bf16(vec![bf16::ZERO; len]),
            DataFormat::Int8 => VectorData::Int8(vec![0; len]),
        }
    }

    #[must_use]
    pub fn format(&self) -> DataFormat {
        match self {
            VectorData::Fp32(_) => DataFormat::Fp32,
            VectorData::Fp16(_) => DataFormat::Fp16,
            VectorData::Bf16(_) => DataFormat::Bf16,
            VectorData::Int8(_) => DataFormat::Int8,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            VectorData::Fp32(v) => v.len(),
            VectorData::Fp16(v) => v.len(),
            VectorData::Bf16(v) => v.len(),
            VectorData::Int8(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Convert `nrows` contiguous rows starting at `start_row` into fp32.
///
/// `dst` must hold `nrows * dim` elements.
pub fn convert_rows_to_fp32(
    src: &VectorData,
    dst: &mut [f32],
    start_row: usize,
    nrows: usize,
    dim: usize,
) -> Result<()> {
    let base = start_row * dim;
    let n = nrows * dim;
    match src {
        VectorData::Fp32(v) => dst[..n].copy_from_slice(&v[base..base + n]),
        VectorData::Fp16(v) => {
            for (d, s) in dst[..n].iter_mut().zip(&v[base..base + n]) {
                *d = s.to_f32();
            }
        }
        VectorData::Bf16(v) => {
            for (d, s) in dst[..n].iter_mut().zip(&v[base..base + n]) {
                *d = s.to_f32();
            }
        }
        VectorData::Int8(v) => {
            for (d, s) in dst[..n].iter_mut().zip(&v[base..base + n]) {
                *d = f32::from(*s);
            }
        }
    }
    Ok(())
}

/// Convert scattered rows (given by `offsets`) into a contiguous fp32 buffer.
pub fn gather_rows_to_fp32(
    src: &VectorData,
    dst: &mut [f32],
    offsets: &[u32],
    dim: usize,
) -> Result<()> {
    for (i, &off) in offsets.iter().enumerate() {
        convert_rows_to_fp32(src, &mut dst[i * dim..(i + 1) * dim], off as usize, 1, dim)?;
    }
    Ok(())
}

/// Convert fp32 rows back into the destination format, writing `nrows` rows
/// at `start_row` of `dst`.
///
/// The int8 path rejects values outside the i8 range rather than wrapping.
pub fn convert_rows_from_fp32(
    src: &[f32],
    dst: &mut VectorData,
    start_row: usize,
    nrows: usize,
    dim: usize,
) -> Result<()> {
    let base = start_row * dim;
    let n = nrows * dim;
    match dst {
        VectorData::Fp32(v) => v[base..base + n].copy_from_slice(&src[..n]),
        VectorData::Fp16(v) => {
            for (d, s) in v[base..base + n].iter_mut().zip(&src[..n]) {
                *d = f16::from_f32(*s);
            }
        }
        VectorData::Bf16(v) => {
            for (d, s) in v[base..base + n].iter_mut().zip(&src[..n]) {
                *d = bf16::from_f32(*s);
            }
        }
        VectorData::Int8(v) => {
            for (d, s) in v[base..base + n].iter_mut().zip(&src[..n]) {
                if *s < f32::from(i8::MIN) || *s > f32::from(i8::MAX) {
                    return Err(IndexError::InvalidArgs(format!(
                        "value {s} overflows int8 on conversion"
                    )));
                }
                *d = *s as i8;
            }
        }
    }
    Ok(())
}

impl VectorData {
    pub(crate) fn write(&self, w: &mut dyn std::io::Write) -> std::io::Result<()> {
        match self {
            VectorData::Fp32(v) => {
                w.write_all(&[0u8])?;
                crate::io::write_u64(w, v.len() as u64)?;
                for x in v {
                    w.write_all(&x.to_le_bytes())?;
                }
            }
            VectorData::Fp16(v) => {
                w.write_all(&[1u8])?;
                crate::io::write_u64(w, v.len() as u64)?;
                for x in v {
                    w.write_all(&x.to_le_bytes())?;
                }
            }
            VectorData::Bf16(v) => {
                w.write_all(&[2u8])?;
                crate::io::write_u64(w, v.len() as u64)?;
                for x in v {
                    w.write_all(&x.to_le_bytes())?;
                }
            }
            VectorData::Int8(v) => {
                w.write_all(&[3u8])?;
                crate::io::write_u64(w, v.len() as u64)?;
                for x in v {
                    w.write_all(&x.to_le_bytes())?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn read(r: &mut dyn std::io::Read) -> Result<Self> {
        let mut tag = [0u8; 1];
        r.read_exact(&mut tag)?;
        let len = crate::io::read_u64(r)? as usize;
        match tag[0] {
            0 => {
                let mut v = vec![0.0f32; len];
                let mut b = [0u8; 4];
                for x in &mut v {
                    r.read_exact(&mut b)?;
                    *x = f32::from_le_bytes(b);
                }
                Ok(VectorData::Fp32(v))
            }
            1 => {
                let mut v = vec![f16::ZERO; len];
                let mut b = [0u8; 2];
                for x in &mut v {
                    r.read_exact(&mut b)?;
                    *x = f16::from_le_bytes(b);
                }
                Ok(VectorData::Fp16(v))
            }
            2 => {
                let mut v = vec![bf16::ZERO; len];
                let mut b = [0u8; 2];
                for x in &mut v {
                    r.read_exact(&mut b)?;
                    *x = bf16::from_le_bytes(b);
                }
                Ok(VectorData::Bf16(v))
            }
            3 => {
                let mut v = vec![0i8; len];
                let mut b = [0u8; 1];
                for x in &mut v {
                    r.read_exact(&mut b)?;
                    *x = i8::from_le_bytes(b);
                }
                Ok(VectorData::Int8(v))
            }
            other => Err(IndexError::InvalidSerializedIndexType(format!(
                "unknown data format tag {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fp16_round_trips_through_fp32() {
        let src = VectorData::Fp16(vec![
            f16::from_f32(0.5),
            f16::from_f32(-1.25),
            f16::from_f32(3.0),
            f16::from_f32(0.0),
        ]);
        let mut buf = [0.0f32; 4];
        convert_rows_to_fp32(&src, &mut buf, 0, 2, 2).unwrap();
        assert_eq!(buf, [0.5, -1.25, 3.0, 0.0]);

        let mut back = VectorData::zeros(DataFormat::Fp16, 4);
        convert_rows_from_fp32(&buf, &mut back, 0, 2, 2).unwrap();
        let mut buf2 = [0.0f32; 4];
        convert_rows_to_fp32(&back, &mut buf2, 0, 2, 2).unwrap();
        assert_eq!(buf, buf2);
    }

    #[test]
    fn gather_pulls_scattered_rows() {
        let src = VectorData::Fp32(vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        let mut dst = [0.0f32; 4];
        gather_rows_to_fp32(&src, &mut dst, &[3, 1], 2).unwrap();
        assert_eq!(dst, [3.0, 3.0, 1.0, 1.0]);
    }

    #[test]
    fn int8_conversion_checks_overflow() {
        let mut dst = VectorData::zeros(DataFormat::Int8, 2);
        assert!(convert_rows_from_fp32(&[1.0, 200.0], &mut dst, 0, 1, 2).is_err());
        assert!(convert_rows_from_fp32(&[1.0, -7.0], &mut dst, 0, 1, 2).is_ok());
    }
}

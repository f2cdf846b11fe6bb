//! Little-endian binary codec for index streams.
//!
//! Streams begin with a four-byte index tag. Multi-partition streams use a
//! dedicated marker followed by a partition header, then each sub-index is
//! serialized independently. File-based loading can go through an mmap-backed
//! reader when the caller enables it.

use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;

use memmap2::Mmap;

/// Tag for an HNSW index over flat fp32 storage.
pub const FOURCC_HNSW_FLAT: [u8; 4] = *b"NFhf";
/// Tag for an HNSW index over scalar-quantized storage.
pub const FOURCC_HNSW_SQ: [u8; 4] = *b"NFhq";
/// Tag for an HNSW index over product-quantized storage.
pub const FOURCC_HNSW_PQ: [u8; 4] = *b"NFhp";
/// Tag for an HNSW index over product-residual-quantized storage.
pub const FOURCC_HNSW_PRQ: [u8; 4] = *b"NFhr";
/// Tag for a refine wrapper (base index + refine storage).
pub const FOURCC_REFINE: [u8; 4] = *b"NFrf";
/// Marker distinguishing a multi-partition stream from a single index.
pub const FOURCC_MV: [u8; 4] = *b"NFmv";

pub fn write_u32(w: &mut dyn Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_u32(r: &mut dyn Read) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

pub fn write_u64(w: &mut dyn Write, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_u64(r: &mut dyn Read) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

pub fn write_f32(w: &mut dyn Write, v: f32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_f32(r: &mut dyn Read) -> io::Result<f32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(f32::from_le_bytes(b))
}

pub fn write_f64(w: &mut dyn Write, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_f64(r: &mut dyn Read) -> io::Result<f64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(f64::from_le_bytes(b))
}

/// Write a length-prefixed u32 vector.
pub fn write_vec_u32(w: &mut dyn Write, v: &[u32]) -> io::Result<()> {
    write_u64(w, v.len() as u64)?;
    for x in v {
        write_u32(w, *x)?;
    }
    Ok(())
}

/// Read a length-prefixed u32 vector.
pub fn read_vec_u32(r: &mut dyn Read) -> io::Result<Vec<u32>> {
    let len = read_u64(r)? as usize;
    let mut v = Vec::with_capacity(len);
    for _ in 0..len {
        v.push(read_u32(r)?);
    }
    Ok(v)
}

/// Write a length-prefixed f32 vector.
pub fn write_vec_f32(w: &mut dyn Write, v: &[f32]) -> io::Result<()> {
    write_u64(w, v.len() as u64)?;
    for x in v {
        write_f32(w, *x)?;
    }
    Ok(())
}

/// Read a length-prefixed f32 vector.
pub fn read_vec_f32(r: &mut dyn Read) -> io::Result<Vec<f32>> {
    let len = read_u64(r)? as usize;
    let mut v = Vec::with_capacity(len);
    for _ in 0..len {
        v.push(read_f32(r)?);
    }
    Ok(v)
}

/// Write a length-prefixed u8 vector.
pub fn write_vec_u8(w: &mut dyn Write, v: &[u8]) -> io::Result<()> {
    write_u64(w, v.len() as u64)?;
    w.write_all(v)
}

/// Read a length-prefixed u8 vector.
pub fn read_vec_u8(r: &mut dyn Read) -> io::Result<Vec<u8>> {
    let len = read_u64(r)? as usize;
    let mut v = vec![0u8; len];
    r.read_exact(&mut v)?;
    Ok(v)
}

/// Read the leading four-byte tag of a stream.
pub fn read_fourcc(r: &mut dyn Read) -> io::Result<[u8; 4]> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(b)
}

/// Write the multi-partition marker.
pub fn write_mv(w: &mut dyn Write) -> io::Result<()> {
    w.write_all(&FOURCC_MV)
}

/// A loaded index stream, either heap-backed or memory-mapped.
///
/// Both variants expose the bytes as a slice, so deserialization runs over a
/// single `Cursor`-based reader regardless of the source.
pub enum IndexSource {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl IndexSource {
    /// Read a whole file into memory.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let mut f = File::open(path)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        Ok(IndexSource::Owned(buf))
    }

    /// Map a file without copying it.
    pub fn from_file_mmap(path: &Path) -> io::Result<Self> {
        let f = File::open(path)?;
        // Safety: the mapping is read-only and the file is not mutated by
        // this process while the source is alive.
        let mmap = unsafe { Mmap::map(&f)? };
        Ok(IndexSource::Mapped(mmap))
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            IndexSource::Owned(v) => v,
            IndexSource::Mapped(m) => m,
        }
    }

    /// A reader over the underlying bytes.
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 0xDEAD_BEEF).unwrap();
        write_u64(&mut buf, 42).unwrap();
        write_f32(&mut buf, -1.5).unwrap();
        let mut r = Cursor::new(buf.as_slice());
        assert_eq!(read_u32(&mut r).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_u64(&mut r).unwrap(), 42);
        assert_eq!(read_f32(&mut r).unwrap(), -1.5);
    }

    #[test]
    fn vector_round_trip() {
        let mut buf = Vec::new();
        write_vec_u32(&mut buf, &[1, 2, 3]).unwrap();
        write_vec_f32(&mut buf, &[0.5, -0.5]).unwrap();
        let mut r = Cursor::new(buf.as_slice());
        assert_eq!(read_vec_u32(&mut r).unwrap(), vec![1, 2, 3]);
        assert_eq!(read_vec_f32(&mut r).unwrap(), vec![0.5, -0.5]);
    }
}

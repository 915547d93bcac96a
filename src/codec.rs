//! Little-endian byte reader shared by the binary decoders

use crate::error::DecodeError;

/// Bounds-checked cursor over a borrowed buffer.
///
/// Every read either consumes exactly the requested width or fails with
/// [`DecodeError::Truncated`] naming the record being decoded.
pub struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
    what: &'static str,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, offset: 0, what }
    }

    pub fn position(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Rest of the buffer, without consuming it
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::truncated(
                self.what,
                self.offset + len,
                self.data.len(),
            ));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), DecodeError> {
        self.bytes(len).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(i8::from_le_bytes(self.array()?))
    }

    pub fn bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    /// u16 length prefix followed by UTF-8 text
    pub fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::Utf8 { what: self.what })
    }

    pub fn f32_array<const N: usize>(&mut self) -> Result<[f32; N], DecodeError> {
        let mut out = [0.0f32; N];
        for value in out.iter_mut() {
            *value = self.f32()?;
        }
        Ok(out)
    }

    pub fn i32_array<const N: usize>(&mut self) -> Result<[i32; N], DecodeError> {
        let mut out = [0i32; N];
        for value in out.iter_mut() {
            *value = self.i32()?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_little_endian() {
        let data = [0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0xff];
        let mut reader = ByteReader::new(&data, "sample");
        assert_eq!(reader.u16().unwrap(), 1);
        assert_eq!(reader.u32().unwrap(), 2);
        assert_eq!(reader.i8().unwrap(), -1);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_truncated_read_reports_sizes() {
        let data = [0u8; 3];
        let mut reader = ByteReader::new(&data, "sample");
        let err = reader.u32().unwrap_err();
        assert_eq!(err, DecodeError::Truncated { what: "sample", needed: 4, available: 3 });
        // A failed read consumes nothing
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_string_prefix() {
        let mut data = vec![3, 0];
        data.extend_from_slice(b"nao");
        let mut reader = ByteReader::new(&data, "sample");
        assert_eq!(reader.string().unwrap(), "nao");
    }
}

//! The sycoca file is a random-access stream of big-endian fixed-width
//! integers and length-prefixed strings.  Writers need to seek back to
//! patch headers once later offsets are known; readers seek to an
//! offset found in an index and decode exactly one record.
//!
//! A [`DataReader`] is a cursor over immutable bytes: every lookup
//! creates its own, so concurrent lookups never share a stream
//! position.
use std::collections::BTreeMap;
use std::io::Result;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;

use crate::error::DecodeError;
use crate::property::Property;
use crate::property::PropertyType;

/// Seekable writer that keeps track of its own position, so callers
/// can record offsets without a syscall per record.
#[derive(Debug)]
pub struct DataWriter<W> {
    inner: W,
    pos: u64,
}

impl<W: Write + Seek> DataWriter<W> {
    /// Wraps `inner`, which must be positioned at offset 0.
    pub fn new(inner: W) -> DataWriter<W> {
        DataWriter { inner, pos: 0 }
    }

    /// Returns the current write position.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Returns the current position as a record offset.  The format
    /// stores offsets as `i32`, so files are capped at 2 GiB.
    pub fn offset(&self) -> Result<i32> {
        i32::try_from(self.pos).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "sycoca file exceeds the 2 GiB offset range",
            )
        })
    }

    pub fn seek_to(&mut self, pos: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(pos))?;
        self.pos = pos;
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.pos += bytes.len() as u64;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_bytes(&[value])
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(value as u8)
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_bytes(&value.to_bits().to_be_bytes())
    }

    fn write_len(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "length exceeds u32")
        })?;
        self.write_u32(len)
    }

    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_len(value.len())?;
        self.write_bytes(value.as_bytes())
    }

    pub fn write_string_list<S: AsRef<str>>(&mut self, values: &[S]) -> Result<()> {
        self.write_len(values.len())?;
        for value in values {
            self.write_string(value.as_ref())?;
        }

        Ok(())
    }

    pub fn write_property(&mut self, value: &Property) -> Result<()> {
        self.write_u8(value.tag())?;
        match value {
            Property::String(s) => self.write_string(s),
            Property::Bool(b) => self.write_bool(*b),
            Property::Int(i) => self.write_i32(*i),
            Property::Double(d) => self.write_f64(*d),
            Property::StringList(list) => self.write_string_list(list),
        }
    }

    pub fn write_property_map(&mut self, map: &BTreeMap<String, Property>) -> Result<()> {
        self.write_len(map.len())?;
        for (key, value) in map {
            self.write_string(key)?;
            self.write_property(value)?;
        }

        Ok(())
    }

    pub fn write_property_defs(&mut self, defs: &BTreeMap<String, PropertyType>) -> Result<()> {
        self.write_len(defs.len())?;
        for (key, ty) in defs {
            self.write_string(key)?;
            self.write_u8(ty.tag())?;
        }

        Ok(())
    }

    /// Flushes and returns the wrapped writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Bounds-checked cursor over the bytes of a sycoca file.
#[derive(Clone, Debug)]
pub struct DataReader<'a> {
    data: &'a [u8],
    pos: usize,
}

type Decoded<T> = std::result::Result<T, DecodeError>;

impl<'a> DataReader<'a> {
    pub fn new(data: &'a [u8]) -> DataReader<'a> {
        DataReader { data, pos: 0 }
    }

    /// Returns a reader positioned at `offset`, which must lie within
    /// the data.
    pub fn at(data: &'a [u8], offset: i64) -> Decoded<DataReader<'a>> {
        let mut reader = DataReader::new(data);
        reader.seek(offset)?;
        Ok(reader)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn seek(&mut self, offset: i64) -> Decoded<()> {
        match usize::try_from(offset) {
            Ok(pos) if pos <= self.data.len() => {
                self.pos = pos;
                Ok(())
            }
            _ => Err(DecodeError::BadOffset(offset)),
        }
    }

    fn take(&mut self, len: usize) -> Decoded<&'a [u8]> {
        if len > self.remaining() {
            return Err(DecodeError::Truncated(self.pos));
        }

        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Decoded<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Decoded<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Decoded<bool> {
        let at = self.pos;
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(DecodeError::BadTag {
                at,
                tag: tag.into(),
            }),
        }
    }

    pub fn read_i32(&mut self) -> Decoded<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Decoded<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Decoded<i64> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Decoded<f64> {
        Ok(f64::from_bits(u64::from_be_bytes(self.take_array()?)))
    }

    /// Reads an element count, and rejects it before allocating if
    /// `count` elements of at least `min_size` bytes each cannot fit
    /// in the remaining data.
    pub fn read_count(&mut self, min_size: usize) -> Decoded<usize> {
        let at = self.pos;
        let count = self.read_u32()?;
        let needed = u64::from(count) * min_size as u64;
        if needed > self.remaining() as u64 {
            return Err(DecodeError::Oversized {
                at,
                len: u64::from(count),
            });
        }

        Ok(count as usize)
    }

    pub fn read_string(&mut self) -> Decoded<String> {
        let at = self.pos;
        let len = self.read_count(1)?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8(at))
    }

    pub fn read_string_list(&mut self) -> Decoded<Vec<String>> {
        let count = self.read_count(4)?;
        let mut ret = Vec::with_capacity(count);
        for _ in 0..count {
            ret.push(self.read_string()?);
        }

        Ok(ret)
    }

    pub fn read_property(&mut self) -> Decoded<Property> {
        let at = self.pos;
        let ret = match self.read_u8()? {
            1 => Property::String(self.read_string()?),
            2 => Property::Bool(self.read_bool()?),
            3 => Property::Int(self.read_i32()?),
            4 => Property::Double(self.read_f64()?),
            5 => Property::StringList(self.read_string_list()?),
            tag => {
                return Err(DecodeError::BadTag {
                    at,
                    tag: tag.into(),
                })
            }
        };

        Ok(ret)
    }

    pub fn read_property_map(&mut self) -> Decoded<BTreeMap<String, Property>> {
        // A key (4 bytes) and a tag (1 byte) at least.
        let count = self.read_count(5)?;
        let mut ret = BTreeMap::new();
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_property()?;
            ret.insert(key, value);
        }

        Ok(ret)
    }

    pub fn read_property_defs(&mut self) -> Decoded<BTreeMap<String, PropertyType>> {
        let count = self.read_count(5)?;
        let mut ret = BTreeMap::new();
        for _ in 0..count {
            let key = self.read_string()?;
            let at = self.pos;
            let tag = self.read_u8()?;
            let ty = PropertyType::from_tag(tag).ok_or(DecodeError::BadTag {
                at,
                tag: tag.into(),
            })?;
            ret.insert(key, ty);
        }

        Ok(ret)
    }
}

#[cfg(test)]
fn written(fill: impl FnOnce(&mut DataWriter<std::io::Cursor<Vec<u8>>>) -> Result<()>) -> Vec<u8> {
    let mut writer = DataWriter::new(std::io::Cursor::new(Vec::new()));
    fill(&mut writer).expect("writes to memory must succeed");
    writer
        .into_inner()
        .expect("flush must succeed")
        .into_inner()
}

#[test]
fn test_scalars_and_strings() {
    let mut map = BTreeMap::new();
    map.insert("X-Flag".to_string(), Property::Bool(true));
    map.insert(
        "X-List".to_string(),
        Property::StringList(vec!["a".into(), "b".into()]),
    );

    let bytes = written(|w| {
        w.write_i32(-7)?;
        w.write_u32(0xdead_beef)?;
        w.write_i64(1 << 40)?;
        w.write_string("héllo")?;
        w.write_string_list(&["x", "", "z"])?;
        w.write_property_map(&map)
    });

    let mut reader = DataReader::new(&bytes);
    assert_eq!(reader.read_i32(), Ok(-7));
    assert_eq!(reader.read_u32(), Ok(0xdead_beef));
    assert_eq!(reader.read_i64(), Ok(1 << 40));
    assert_eq!(reader.read_string().as_deref(), Ok("héllo"));
    assert_eq!(
        reader.read_string_list(),
        Ok(vec!["x".to_string(), String::new(), "z".to_string()])
    );
    assert_eq!(reader.read_property_map(), Ok(map));
    assert_eq!(reader.remaining(), 0);
    assert_eq!(reader.read_u8(), Err(DecodeError::Truncated(bytes.len())));
}

/// Big-endian, like the classic data stream format.
#[test]
fn test_byte_order() {
    let bytes = written(|w| w.write_i32(0x0102_0304));
    assert_eq!(bytes, vec![1, 2, 3, 4]);
}

/// Patching an earlier header must not move the end of the stream.
#[test]
fn test_seek_back_and_patch() {
    let bytes = written(|w| {
        w.write_i32(0)?;
        w.write_string("payload")?;
        let end = w.position();
        w.seek_to(0)?;
        w.write_i32(42)?;
        w.seek_to(end)?;
        w.write_i32(-1)
    });

    let mut reader = DataReader::new(&bytes);
    assert_eq!(reader.read_i32(), Ok(42));
    assert_eq!(reader.read_string().as_deref(), Ok("payload"));
    assert_eq!(reader.read_i32(), Ok(-1));
}

/// Corrupt length prefixes fail before allocating.
#[test]
fn test_oversized_counts() {
    let bytes = written(|w| w.write_u32(u32::MAX));
    assert!(matches!(
        DataReader::new(&bytes).read_string(),
        Err(DecodeError::Oversized { at: 0, .. })
    ));
    assert!(matches!(
        DataReader::new(&bytes).read_string_list(),
        Err(DecodeError::Oversized { .. })
    ));

    let bytes = written(|w| w.write_bytes(&[0, 0, 0, 2, 0xff, 0xfe]));
    assert_eq!(
        DataReader::new(&bytes).read_string(),
        Err(DecodeError::InvalidUtf8(0))
    );
}

#[test]
fn test_bad_offsets() {
    let data = [0u8; 8];
    assert!(DataReader::at(&data, 8).is_ok());
    assert_eq!(
        DataReader::at(&data, 9).map(|_| ()),
        Err(DecodeError::BadOffset(9))
    );
    assert_eq!(
        DataReader::at(&data, -4).map(|_| ()),
        Err(DecodeError::BadOffset(-4))
    );
}

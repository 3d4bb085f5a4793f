use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http_body_util::Full;

use crate::error::Error;

pub(crate) type BodyFactory = Arc<dyn Fn() -> io::Result<Box<dyn Read + Send>> + Send + Sync>;

pub enum BodySource {
    Bytes(Bytes),
    Reader(Box<dyn Read + Send>),
    Seekable(Box<dyn ReadSeek>),
    Factory(BodyFactory),
}

pub trait ReadSeek: Read + Seek + Send {}

impl<T> ReadSeek for T where T: Read + Seek + Send {}

impl BodySource {
    pub fn reader(reader: impl Read + Send + 'static) -> Self {
        Self::Reader(Box::new(reader))
    }

    pub fn seekable(reader: impl Read + Seek + Send + 'static) -> Self {
        Self::Seekable(Box::new(reader))
    }

    pub fn factory<F, R>(factory: F) -> Self
    where
        F: Fn() -> io::Result<R> + Send + Sync + 'static,
        R: Read + Send + 'static,
    {
        Self::Factory(Arc::new(move || {
            factory().map(|reader| Box::new(reader) as Box<dyn Read + Send>)
        }))
    }
}

impl fmt::Debug for BodySource {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Bytes(_) => "bytes",
            Self::Reader(_) => "reader",
            Self::Seekable(_) => "seekable",
            Self::Factory(_) => "factory",
        };
        formatter.debug_tuple("BodySource").field(&kind).finish()
    }
}

impl From<()> for BodySource {
    fn from(_: ()) -> Self {
        Self::Bytes(Bytes::new())
    }
}

impl From<Bytes> for BodySource {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<BytesMut> for BodySource {
    fn from(value: BytesMut) -> Self {
        Self::Bytes(value.freeze())
    }
}

impl From<Vec<u8>> for BodySource {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<&'static [u8]> for BodySource {
    fn from(value: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(value))
    }
}

impl From<String> for BodySource {
    fn from(value: String) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<&'static str> for BodySource {
    fn from(value: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(value.as_bytes()))
    }
}

#[derive(Clone)]
pub struct ReusableBody {
    data: Bytes,
    position: usize,
}

impl ReusableBody {
    pub fn new(source: impl Into<BodySource>) -> Result<Self, Error> {
        let data = match source.into() {
            BodySource::Bytes(bytes) => bytes,
            BodySource::Reader(mut reader) => read_to_bytes(&mut reader, None)?,
            BodySource::Seekable(mut reader) => {
                let length = seekable_length(&mut reader).map_err(body_source_error)?;
                read_to_bytes(&mut reader, Some(length))?
            }
            BodySource::Factory(factory) => {
                let mut reader = factory().map_err(body_source_error)?;
                read_to_bytes(&mut reader, None)?
            }
        };
        Ok(Self { data, position: 0 })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub(crate) fn wire_body(&self) -> Full<Bytes> {
        Full::new(self.data.clone())
    }
}

impl fmt::Debug for ReusableBody {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ReusableBody")
            .field("len", &self.data.len())
            .field("position", &self.position)
            .finish()
    }
}

impl Read for ReusableBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.position.min(self.data.len())..];
        let count = remaining.len().min(buf.len());
        buf[..count].copy_from_slice(&remaining[..count]);
        self.position += count;
        Ok(count)
    }
}

impl Seek for ReusableBody {
    fn seek(&mut self, position: SeekFrom) -> io::Result<u64> {
        let length = self.data.len() as i128;
        let target = match position {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(offset) => length + offset as i128,
            SeekFrom::Current(offset) => self.position as i128 + offset as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of body",
            ));
        }
        self.position = target.min(length) as usize;
        Ok(self.position as u64)
    }
}

fn body_source_error(source: io::Error) -> Error {
    Error::BodySource { source }
}

fn seekable_length(reader: &mut Box<dyn ReadSeek>) -> io::Result<u64> {
    let start = reader.stream_position()?;
    let end = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(start))?;
    Ok(end.saturating_sub(start))
}

fn read_to_bytes(reader: &mut dyn Read, expected: Option<u64>) -> Result<Bytes, Error> {
    let capacity = expected
        .and_then(|length| usize::try_from(length).ok())
        .unwrap_or(0);
    let mut collected = Vec::with_capacity(capacity);
    reader
        .read_to_end(&mut collected)
        .map_err(body_source_error)?;
    if let Some(expected) = expected
        && collected.len() as u64 != expected
    {
        return Err(body_source_error(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "body source produced {} bytes, expected {expected}",
                collected.len()
            ),
        )));
    }
    Ok(Bytes::from(collected))
}

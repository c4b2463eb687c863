//! Bounded capture of process output

use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8192;

/// Byte buffer that keeps at most `limit` bytes and remembers whether more arrived
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Decode as UTF-8, dropping a code point split by the cut
    pub fn into_string(self) -> String {
        let mut data = self.data;
        if self.truncated {
            if let Err(e) = std::str::from_utf8(&data) {
                if e.error_len().is_none() {
                    data.truncate(e.valid_up_to());
                }
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }
}

/// Read a stream to the end, keeping the first `limit` bytes
///
/// The rest is drained and discarded so the writer never blocks on a full pipe.
pub async fn read_capped<R>(mut reader: R, limit: usize) -> std::io::Result<OutputBuffer>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = OutputBuffer::new(limit);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.push(&chunk[..n]);
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_limit() {
        let mut buffer = OutputBuffer::new(10);
        buffer.push(b"hello");
        assert!(!buffer.is_truncated());
        assert_eq!(buffer.into_string(), "hello");
    }

    #[test]
    fn test_exact_limit_is_not_truncated() {
        let mut buffer = OutputBuffer::new(5);
        buffer.push(b"hello");
        assert!(!buffer.is_truncated());
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_over_limit_keeps_prefix() {
        let mut buffer = OutputBuffer::new(4);
        buffer.push(b"ab");
        buffer.push(b"cdef");
        buffer.push(b"gh");
        assert!(buffer.is_truncated());
        assert_eq!(buffer.into_string(), "abcd");
    }

    #[test]
    fn test_split_code_point_dropped() {
        let mut buffer = OutputBuffer::new(2);
        buffer.push("aé".as_bytes());
        assert!(buffer.is_truncated());
        assert_eq!(buffer.into_string(), "a");
    }

    #[tokio::test]
    async fn test_read_capped_drains_everything() {
        let input = vec![b'x'; 50_000];
        let buffer = read_capped(&input[..], 1000).await.unwrap();
        assert_eq!(buffer.len(), 1000);
        assert!(buffer.is_truncated());
    }
}

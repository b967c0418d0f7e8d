// SPDX-License-Identifier: Apache-2.0

/// One token handed out by [`BufferedTokenizer::extract`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub bytes: Vec<u8>,
    /// Input bytes this token accounts for, including its delimiter when it had one
    pub consumed: usize,
}

/// Accumulates bytes across reads and splits them into delimiter-terminated tokens.
///
/// Bytes after the last delimiter are retained until a later `extract` completes them.
/// With a size limit, longer tokens are handed out in pieces of at most that size, and a
/// partial token is not allowed to grow past it.
#[derive(Debug, Clone)]
pub struct BufferedTokenizer {
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
    max_size: Option<usize>,
}

impl BufferedTokenizer {
    pub fn new(delimiter: impl Into<Vec<u8>>) -> Self {
        Self {
            delimiter: delimiter.into(),
            buffer: Vec::new(),
            max_size: None,
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.set_max_size(max_size);
        self
    }

    /// Zero removes the limit.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = (max_size > 0).then_some(max_size);
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Append `data` and return every completed token, without delimiters.
    pub fn extract(&mut self, data: &[u8]) -> Vec<Token> {
        let dlen = self.delimiter.len();
        // Only the tail of the old buffer can start a delimiter that `data` completes
        let mut scan_from = self.buffer.len().saturating_sub(dlen.saturating_sub(1));
        self.buffer.extend_from_slice(data);

        if dlen == 0 {
            return Vec::new();
        }

        let mut tokens = Vec::new();
        let mut start = 0;
        while let Some(pos) = find(&self.buffer[scan_from..], &self.delimiter) {
            let end = scan_from + pos;
            push_token(&mut tokens, &self.buffer[start..end], dlen, self.max_size);
            start = end + dlen;
            scan_from = start;
        }

        // Keep the last dlen - 1 bytes, they may begin a delimiter
        if let Some(max) = self.max_size {
            while self.buffer.len() - start > max + dlen - 1 {
                tokens.push(Token {
                    bytes: self.buffer[start..start + max].to_vec(),
                    consumed: max,
                });
                start += max;
            }
        }

        if start > 0 {
            self.buffer.drain(..start);
        }
        tokens
    }

    /// Take whatever partial token is buffered.
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

fn push_token(tokens: &mut Vec<Token>, line: &[u8], dlen: usize, max_size: Option<usize>) {
    let piece = max_size.unwrap_or(line.len()).max(1);
    if line.len() <= piece {
        tokens.push(Token {
            bytes: line.to_vec(),
            consumed: line.len() + dlen,
        });
        return;
    }
    let mut pieces = line.chunks(piece).peekable();
    while let Some(bytes) = pieces.next() {
        let last = pieces.peek().is_none();
        tokens.push(Token {
            bytes: bytes.to_vec(),
            consumed: bytes.len() + if last { dlen } else { 0 },
        });
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() == 1 {
        return haystack.iter().position(|b| *b == needle[0]);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

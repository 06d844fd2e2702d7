use bytes::Bytes;

/// Cursor-based reader feeding a PUT payload to the transfer engine.
///
/// The engine pulls by handing over an output buffer; the feeder copies as
/// much of the remaining payload as fits, advances, and reports zero once
/// drained, which signals end of body. The cursor is rewound before every
/// retry attempt so each attempt uploads the full payload.
#[derive(Debug)]
pub(crate) struct PutBodyFeeder {
    data: Bytes,
    cursor: usize,
}

impl PutBodyFeeder {
    pub(crate) fn new(data: Bytes) -> Self {
        Self { data, cursor: 0 }
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub(crate) fn fill(&mut self, out: &mut [u8]) -> usize {
        let remaining = self.data.len() - self.cursor;
        let count = remaining.min(out.len());
        out[..count].copy_from_slice(&self.data[self.cursor..self.cursor + count]);
        self.cursor += count;
        count
    }
}

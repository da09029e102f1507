use bytes::Bytes;

/// One decoded video frame, packed RGB24.
///
/// The pixel buffer is reference counted so a frame can be handed to the
/// recorder and the display consumer without copying.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Position within the stream it was read from; restarts at 1 after a reconnect.
    pub sequence: u64,
    pub data: Bytes,
}

impl Frame {
    pub fn new(width: u32, height: u32, sequence: u64, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            sequence,
            data: data.into(),
        }
    }

    /// Byte length of an RGB24 frame with the given geometry.
    pub fn rgb24_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }

    pub fn is_complete(&self) -> bool {
        self.data.len() == Self::rgb24_len(self.width, self.height)
    }
}

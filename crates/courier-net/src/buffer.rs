/// Growable byte window with front and back cursors and a fixed ceiling.
///
/// The live window is `storage[begin..end]`. Extending past the current
/// capacity grows it by half, capped at `max_capacity`; retracting the
/// front past the midpoint compacts the window back to offset zero, so a
/// long-lived stream cannot strand dead bytes at the front.
pub struct Buffer {
    max_capacity: usize,
    begin: usize,
    end: usize,
    storage: Vec<u8>,
}

impl Buffer {
    pub fn new(max_capacity: usize) -> Self {
        Self { max_capacity, begin: 0, end: 0, storage: Vec::new() }
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Only meaningful while the buffer is empty.
    pub fn set_max_capacity(&mut self, max_capacity: usize) {
        assert!(self.is_empty(), "max capacity changed while data is buffered");

        self.max_capacity = max_capacity;
        self.storage.truncate(max_capacity.min(self.storage.len()));
        self.begin = 0;
        self.end = 0;
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// The live window.
    pub fn data(&self) -> &[u8] {
        &self.storage[self.begin..self.end]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.begin..self.end]
    }

    /// Grows the window at the back by `size` bytes of unspecified content.
    pub fn extend_back(&mut self, size: usize) {
        assert!(
            self.len() + size <= self.max_capacity,
            "buffer would exceed its max capacity"
        );

        if self.end + size > self.storage.len() {
            self.compact();
            if self.end + size > self.storage.len() {
                let wanted = (self.end + size)
                    .max(self.storage.len() + self.storage.len() / 2)
                    .min(self.max_capacity);
                self.storage.resize(wanted, 0);
            }
        }

        self.end += size;
    }

    /// Appends `data` at the back.
    pub fn push_back(&mut self, data: &[u8]) {
        let old_len = self.len();
        self.extend_back(data.len());
        let start = self.begin + old_len;
        self.storage[start..start + data.len()].copy_from_slice(data);
    }

    /// Advances the front cursor, dropping consumed bytes. Compacts the
    /// window to offset zero once the cursor passes the midpoint.
    pub fn retract_front(&mut self, size: usize) {
        assert!(size <= self.len());

        self.begin += size;
        if self.begin == self.end {
            self.begin = 0;
            self.end = 0;
        } else if self.begin > self.storage.len() / 2 {
            self.compact();
        }
    }

    /// Truncates the window at the back.
    pub fn retract_back(&mut self, size: usize) {
        assert!(size <= self.len());

        self.end -= size;
        if self.begin == self.end {
            self.begin = 0;
            self.end = 0;
        }
    }

    pub fn clear(&mut self) {
        self.begin = 0;
        self.end = 0;
    }

    fn compact(&mut self) {
        self.storage.copy_within(self.begin..self.end, 0);
        self.end -= self.begin;
        self.begin = 0;
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("max_capacity", &self.max_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_tracks_extend_and_retract() {
        let mut buffer = Buffer::new(1024);
        buffer.push_back(b"hello world");
        assert_eq!(buffer.data(), b"hello world");

        buffer.retract_front(6);
        assert_eq!(buffer.data(), b"world");

        buffer.retract_back(1);
        assert_eq!(buffer.data(), b"worl");

        buffer.retract_front(4);
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn empty_window_rewinds_to_origin() {
        let mut buffer = Buffer::new(1024);
        buffer.push_back(b"abc");
        buffer.retract_front(3);
        buffer.push_back(b"d");
        assert_eq!(buffer.data(), b"d");
    }

    #[test]
    fn front_retraction_compacts_past_the_midpoint() {
        let mut buffer = Buffer::new(64);
        buffer.push_back(&[1; 48]);
        buffer.retract_front(40);
        // The live window moved back to offset zero, so the ceiling
        // still has room for 50 more bytes.
        buffer.push_back(&[2; 50]);
        assert_eq!(buffer.len(), 58);
        assert_eq!(buffer.data()[..8], [1; 8]);
        assert_eq!(buffer.data()[8..], [2; 50]);
    }

    #[test]
    #[should_panic(expected = "max capacity")]
    fn refuses_to_grow_past_the_ceiling() {
        let mut buffer = Buffer::new(16);
        buffer.push_back(&[0; 17]);
    }
}

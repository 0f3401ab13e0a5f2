// src/core/buffer.rs

//! A bounded single-producer/single-consumer ring of 32-bit words used to
//! decouple the scan and trigger-log producers from the file-system drain.
//!
//! The writer reserves contiguous windows of up to `max_write` words; the
//! reader obtains contiguous windows between `min_read` and `max_read` words,
//! rounded to the configured block size. A write that crosses the logical end
//! of the usable region spills into slack storage and is copied back to the
//! physical start, so both sides always see contiguous word runs.

/// A contiguous run of pending words handed to the reader.
#[derive(Debug)]
pub struct ReadWindow<'a> {
    pub data: &'a [u32],
    /// True when this is the final, possibly short, window after `eof()`.
    pub eof: bool,
}

#[derive(Debug)]
pub struct FlowBuffer {
    buf: Vec<u32>,
    /// Usable window in words; `buf` additionally holds `max_write` slack.
    size: usize,
    free: usize,
    read_index: usize,
    write_index: usize,
    eof: bool,
    min_read: usize,
    max_read: usize,
    max_write: usize,
}

impl FlowBuffer {
    /// Builds a buffer of `nominal` words with the given block size and
    /// read/write window bounds.
    ///
    /// `min_read` and `max_read` are rounded down to block multiples and the
    /// usable window is shrunk to a `min_read` multiple after reserving
    /// `max_write` words of spill-over slack.
    pub fn setup(
        nominal: usize,
        block: usize,
        min_read: usize,
        max_read: usize,
        max_write: usize,
    ) -> Result<Self, &'static str> {
        if nominal == 0 {
            return Err("zero size buffer");
        }
        if block == 0 {
            return Err("zero block size");
        }

        let min_read = (min_read / block) * block;
        let max_read = (max_read / block) * block;

        if min_read < block {
            return Err("min read less than block size");
        }
        if max_read < block {
            return Err("max read less than block size");
        }
        if max_read < min_read {
            return Err("max read less than min read");
        }

        let mut size = nominal.saturating_sub(max_write);
        size = (size / block) * block;
        size = (size / min_read) * min_read;
        if size == 0 {
            return Err("zero usable space");
        }

        Ok(Self {
            buf: vec![0; size + max_write],
            size,
            free: size,
            read_index: 0,
            write_index: 0,
            eof: false,
            min_read,
            max_read,
            max_write,
        })
    }

    pub fn usable_words(&self) -> usize {
        self.size
    }

    pub fn free_words(&self) -> usize {
        self.free
    }

    pub fn used_words(&self) -> usize {
        self.size - self.free
    }

    pub fn min_read(&self) -> usize {
        self.min_read
    }

    pub fn max_write(&self) -> usize {
        self.max_write
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Reserves a contiguous write window of `sz` words.
    ///
    /// Succeeds only while strictly more than `sz` words are free; one word
    /// of slack always remains so the reader can tell full from empty. The
    /// reservation must be finished with `commit_write` for however many
    /// words were actually produced.
    pub fn write_window(&mut self, sz: usize) -> Option<&mut [u32]> {
        assert!(sz <= self.max_write, "write window exceeds max_write");
        if self.free > sz {
            let at = self.write_index;
            Some(&mut self.buf[at..at + sz])
        } else {
            None
        }
    }

    /// Commits `sz` words of a previously reserved write window. Words that
    /// spilled past the usable end are copied to the physical start.
    pub fn commit_write(&mut self, sz: usize) {
        assert!(sz <= self.max_write, "write commit exceeds max_write");
        assert!(sz <= self.free, "write commit exceeds reservation");
        self.free -= sz;
        let new = self.write_index + sz;
        if new < self.size {
            self.write_index = new;
            return;
        }
        let spill = new - self.size;
        let (head, tail) = self.buf.split_at_mut(self.size);
        head[..spill].copy_from_slice(&tail[..spill]);
        self.write_index = spill;
    }

    /// Copies `words` into the buffer as one committed write.
    pub fn push_words(&mut self, words: &[u32]) -> bool {
        let sz = words.len();
        match self.write_window(sz) {
            Some(window) => {
                window.copy_from_slice(words);
                self.commit_write(sz);
                true
            }
            None => false,
        }
    }

    /// Returns the next readable window, if any.
    ///
    /// With at least `min_read` words pending the window is
    /// `min(pending, max_read)` words rounded down to a `min_read` multiple
    /// and capped at the usable end. With fewer pending and `eof` marked, the
    /// short remainder is returned with `eof = true`. Otherwise `None`:
    /// come back later.
    pub fn read_window(&self) -> Option<ReadWindow<'_>> {
        let used = self.size - self.free;
        if used >= self.min_read {
            let mut len = used;
            if self.read_index + len > self.size {
                len = self.size - self.read_index;
            }
            if len > self.max_read {
                len = self.max_read;
            } else {
                len -= len % self.min_read;
            }
            return Some(ReadWindow {
                data: &self.buf[self.read_index..self.read_index + len],
                eof: false,
            });
        }
        if !self.eof {
            return None;
        }
        // Short final window; may extend into the spill slack, which still
        // holds the words of the last wrapping write.
        Some(ReadWindow {
            data: &self.buf[self.read_index..self.read_index + used],
            eof: true,
        })
    }

    /// Releases `sz` words previously obtained from `read_window`.
    pub fn release_read(&mut self, sz: usize) {
        assert!(sz <= self.size - self.free, "read release exceeds pending");
        self.free += sz;
        self.read_index = (self.read_index + sz) % self.size;
    }

    /// Marks end-of-stream; a subsequent read may return a short final window.
    pub fn mark_eof(&mut self) {
        self.eof = true;
    }

    /// Drains to empty and clears the end-of-stream mark.
    pub fn reset(&mut self) {
        self.read_index = 0;
        self.write_index = 0;
        self.free = self.size;
        self.eof = false;
    }
}

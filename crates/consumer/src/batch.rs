/// Buffers acknowledgements so they can be sent cumulatively.
///
/// Tags only ever increase within a subscription, so acking the newest
/// buffered tag with `ack_multiple` settles everything before it. A
/// threshold of zero or one disables batching.
#[derive(Debug, Clone)]
pub struct AckBatcher {
    threshold: usize,
    last_tag: Option<u64>,
    buffered: usize,
}

impl AckBatcher {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            last_tag: None,
            buffered: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold > 1
    }

    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Buffers a tag. Returns the tag to ack cumulatively once the
    /// threshold is reached.
    pub fn push(&mut self, tag: u64) -> Option<u64> {
        self.last_tag = Some(self.last_tag.map_or(tag, |last| last.max(tag)));
        self.buffered += 1;
        if self.buffered >= self.threshold {
            return self.take();
        }
        None
    }

    /// Drains the buffer, returning the tag to ack if anything was buffered.
    pub fn take(&mut self) -> Option<u64> {
        self.buffered = 0;
        self.last_tag.take()
    }
}

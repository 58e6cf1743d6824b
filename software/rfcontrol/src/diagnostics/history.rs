/// Fixed-depth record of the most recent values.
///
/// Pushing overwrites the oldest slot in place. Readers see the values
/// oldest-first with the newest last, padded at the front with zeros until
/// the ring has filled once.
#[derive(Clone, Debug)]
pub struct HistoryRing {
    buf: Vec<f64>,
    /// Slot the next push writes, which is also the oldest value
    head: usize,
}

impl HistoryRing {
    pub fn new(depth: usize) -> Self {
        Self {
            buf: vec![0.0; depth.max(1)],
            head: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, value: f64) {
        self.buf[self.head] = value;
        self.head = (self.head + 1) % self.buf.len();
    }

    /// Most recently pushed value
    pub fn latest(&self) -> f64 {
        let n = self.buf.len();
        self.buf[(self.head + n - 1) % n]
    }

    /// Copy the history oldest-first into `out`, which must hold `depth()` values.
    pub fn copy_into(&self, out: &mut [f64]) {
        let (newer, older) = self.buf.split_at(self.head);
        let n = older.len();
        out[..n].copy_from_slice(older);
        out[n..n + newer.len()].copy_from_slice(newer);
    }

    pub fn to_vec(&self) -> Vec<f64> {
        let mut out = vec![0.0; self.buf.len()];
        self.copy_into(&mut out);
        out
    }

    pub fn clear(&mut self) {
        self.buf.fill(0.0);
        self.head = 0;
    }
}

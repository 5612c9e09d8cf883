
/// Distance beyond which a jump in the raw 16-bit sequence is taken as a
/// wrap (forward) or as a late packet from the previous cycle (backward).
pub const WRAP_THRESHOLD: u64 = 32000;

const CYCLE: u64 = 1 << 16;

/// SequenceUnwrapper reconstructs a monotonic 64-bit sequence from raw RTP
/// sequence numbers as `seq + 65536 * resets`.
#[derive(Debug, Default, Clone)]
pub struct SequenceUnwrapper {
    resets: u64,
    highest: Option<u64>,
}

impl SequenceUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the reconstructed sequence for `seq`.
    ///
    /// `resets` is bumped when `seq` lands more than [`WRAP_THRESHOLD`] below the
    /// highest sequence seen so far. A packet landing more than the threshold
    /// above it belongs to the previous cycle and is corrected by one cycle.
    pub fn unwrap(&mut self, seq: u16) -> u64 {
        let mut extended = (self.resets << 16) + seq as u64;

        if let Some(highest) = self.highest {
            if extended + WRAP_THRESHOLD < highest {
                self.resets += 1;
                extended += CYCLE;
            } else if extended > highest + WRAP_THRESHOLD && extended >= CYCLE {
                extended -= CYCLE;
            }
        }

        if self.highest.is_none_or(|highest| extended > highest) {
            self.highest = Some(extended);
        }

        extended
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }

    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

//! PRFSTATE codec and peripheral change tracking
//!
//! The JA-121T reports peripheral states as a packed hex string
//! (`PRFSTATE 08000A…`). Each byte covers eight peripherals with the
//! least significant bit holding the lowest position, so bit `j` of byte
//! `x` belongs to peripheral `x * 8 + j`. [`decode`] and [`encode`] are
//! exact inverses over well-formed input.
//!
//! [`PrfTracker`] keeps the last two decoded snapshots so that rule
//! matchers can observe per-position transitions rather than absolute
//! states.

use std::collections::VecDeque;

use thiserror::Error;

/// Peripheral state reported on the wire.
pub const STATE_ON: &str = "ON";
/// Peripheral state reported on the wire.
pub const STATE_OFF: &str = "OFF";

#[derive(Debug, Error)]
pub enum PrfStateError {
    #[error("Cannot decode prfstate string '{value}'. {reason}")]
    Decode { value: String, reason: String },
}

/// Decodes a packed hex string into per-peripheral ON/OFF flags, eight
/// flags per hex byte, indexed by peripheral position.
pub fn decode(hex: &str) -> Result<Vec<bool>, PrfStateError> {
    if hex.is_empty() || hex.len() % 2 != 0 {
        return Err(PrfStateError::Decode {
            value: hex.to_string(),
            reason: format!("The length {} is not an even number of hex digits.", hex.len()),
        });
    }
    let mut flags = Vec::with_capacity(hex.len() * 4);
    for i in (0..hex.len()).step_by(2) {
        let byte = u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| PrfStateError::Decode {
            value: hex.to_string(),
            reason: e.to_string(),
        })?;
        for j in 0..8 {
            flags.push(byte & (1 << j) != 0);
        }
    }
    Ok(flags)
}

/// Encodes per-peripheral flags back into the packed hex form.
///
/// The flag vector is zero-padded up to `bits` positions; `bits` must be
/// a multiple of 8. Inverse of [`decode`]: `encode(&decode(x)?, bits) == x`
/// holds for every well-formed `x` of width `bits`.
pub fn encode(flags: &[bool], bits: usize) -> String {
    let mut out = String::with_capacity(bits / 4);
    for x in 0..bits / 8 {
        let mut byte = 0u8;
        for j in 0..8 {
            if flags.get(x * 8 + j).copied().unwrap_or(false) {
                byte |= 1 << j;
            }
        }
        out.push_str(&format!("{:02X}", byte));
    }
    out
}

/// Returns the wire representation of a single flag.
pub fn state_str(on: bool) -> &'static str {
    if on {
        STATE_ON
    } else {
        STATE_OFF
    }
}

#[derive(Debug)]
struct Snapshot {
    flags: Vec<bool>,
    /// Set when the snapshot was taken while the tracker was armed; every
    /// position then reports a transition once.
    forced: bool,
}

/// History of the two most recent PRFSTATE snapshots.
///
/// Seeded with an all-OFF snapshot so that the first real report produces
/// a transition for every peripheral that is ON. `arm()` makes the next
/// recorded snapshot report a transition on every position, which is how
/// `write_prf_state()` forces a full state dump through the rules.
#[derive(Debug)]
pub struct PrfTracker {
    bits: usize,
    history: VecDeque<Snapshot>,
    armed: bool,
}

impl PrfTracker {
    pub fn new(bits: usize) -> Self {
        let mut history = VecDeque::with_capacity(2);
        history.push_back(Snapshot {
            flags: vec![false; bits],
            forced: false,
        });
        Self {
            bits,
            history,
            armed: false,
        }
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Decodes a hex payload and appends it to the history, trimming to
    /// the last two snapshots.
    pub fn record(&mut self, hex: &str) -> Result<(), PrfStateError> {
        let flags = decode(hex)?;
        let forced = self.armed;
        self.armed = false;
        self.history.push_back(Snapshot { flags, forced });
        while self.history.len() > 2 {
            self.history.pop_front();
        }
        Ok(())
    }

    /// Arms the tracker: the next recorded snapshot reports a transition
    /// on every position.
    pub fn arm(&mut self) {
        self.armed = true;
    }

    /// True when the peripheral at `pos` changed between the two most
    /// recent snapshots, or when the latest snapshot was forced.
    pub fn changed(&self, pos: usize) -> bool {
        let latest = match self.history.back() {
            Some(s) => s,
            None => return false,
        };
        if latest.forced {
            return true;
        }
        if self.history.len() < 2 {
            return false;
        }
        let prev = &self.history[self.history.len() - 2];
        let now = latest.flags.get(pos).copied().unwrap_or(false);
        let before = prev.flags.get(pos).copied().unwrap_or(false);
        now != before
    }

    /// Current ON/OFF state of the peripheral at `pos`.
    pub fn state(&self, pos: usize) -> &'static str {
        let on = self
            .history
            .back()
            .and_then(|s| s.flags.get(pos).copied())
            .unwrap_or(false);
        state_str(on)
    }
}

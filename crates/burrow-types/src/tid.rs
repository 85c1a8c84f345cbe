use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

const ALPHABET: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";
const TID_LEN: usize = 13;
const CLOCK_ID_BITS: u32 = 10;
const CLOCK_ID_MASK: u64 = (1 << CLOCK_ID_BITS) - 1;
const MAX_MICROS: u64 = (1 << 53) - 1;

/// Timestamp identifier: a 64-bit value (53 bits of microseconds since the
/// UNIX epoch, 10 bits of clock id, top bit zero) rendered as 13 characters
/// of sortable base32.
///
/// Lexicographic order of the string form equals numeric order, so TIDs are
/// used directly as commit revisions, record keys and listing cursors.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tid(u64);

impl Tid {
    pub fn from_parts(micros: u64, clock_id: u16) -> Self {
        Self(((micros & MAX_MICROS) << CLOCK_ID_BITS) | (u64::from(clock_id) & CLOCK_ID_MASK))
    }

    pub fn timestamp_micros(&self) -> u64 {
        self.0 >> CLOCK_ID_BITS
    }

    pub fn clock_id(&self) -> u16 {
        (self.0 & CLOCK_ID_MASK) as u16
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn parse(s: &str) -> Result<Self, TypeError> {
        if s.len() != TID_LEN {
            return Err(TypeError::InvalidTid(format!("{s}: expected {TID_LEN} characters")));
        }
        let mut value: u64 = 0;
        for (i, c) in s.bytes().enumerate() {
            let digit = ALPHABET
                .iter()
                .position(|&a| a == c)
                .ok_or_else(|| TypeError::InvalidTid(format!("{s}: bad character")))?
                as u64;
            // The leading character carries the zero top bit.
            if i == 0 && digit >= 16 {
                return Err(TypeError::InvalidTid(format!("{s}: high bit set")));
            }
            value = (value << 5) | digit;
        }
        Ok(Self(value))
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [0u8; TID_LEN];
        let mut v = self.0;
        for slot in out.iter_mut().rev() {
            *slot = ALPHABET[(v & 0x1f) as usize];
            v >>= 5;
        }
        // Alphabet is ASCII.
        f.write_str(std::str::from_utf8(&out).map_err(|_| fmt::Error)?)
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({self})")
    }
}

impl FromStr for Tid {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Tid {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Tid> for String {
    fn from(tid: Tid) -> Self {
        tid.to_string()
    }
}

/// Monotonic TID source.
///
/// Every call returns a TID strictly greater than any previous TID from the
/// same clock, even when the wall clock stalls or steps backwards. Safe for
/// concurrent use across threads.
pub struct TidClock {
    clock_id: u16,
    last_micros: Mutex<u64>,
}

impl TidClock {
    pub fn new(clock_id: u16) -> Self {
        Self {
            clock_id: clock_id & CLOCK_ID_MASK as u16,
            last_micros: Mutex::new(0),
        }
    }

    /// Clock with a random clock id.
    pub fn random() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        Self::new((nanos as u16) ^ std::process::id() as u16)
    }

    /// Next TID from this clock.
    pub fn next(&self) -> Tid {
        self.advance(0)
    }

    /// Next TID that is also strictly greater than `prev`.
    ///
    /// Used for commit revisions so a repository's revisions keep increasing
    /// across restarts and clock changes.
    pub fn next_after(&self, prev: &Tid) -> Tid {
        self.advance(prev.timestamp_micros().saturating_add(1))
    }

    fn advance(&self, floor: u64) -> Tid {
        let wall = Self::wall_clock_micros();
        let mut last = self.last_micros.lock().expect("TID clock mutex poisoned");
        let micros = wall.max(last.saturating_add(1)).max(floor).min(MAX_MICROS);
        *last = micros;
        Tid::from_parts(micros, self.clock_id)
    }

    pub fn clock_id(&self) -> u16 {
        self.clock_id
    }

    fn wall_clock_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

impl Default for TidClock {
    fn default() -> Self {
        Self::random()
    }
}

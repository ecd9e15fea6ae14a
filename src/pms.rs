//! # Particulate-Matter Frame Parser
//!
//! Incremental decoder for the PMSx003 family of particulate sensors, which
//! push fixed-size measurement frames over a 9600-baud UART whenever they
//! feel like it. The parser is built around a cooperative, non-blocking
//! [`PmParser::poll`]: it consumes only the bytes currently available from the
//! [`ByteSource`], tolerates arbitrarily-chunked partial arrival, and
//! resynchronizes on the next sync pair after any corruption.
//!
//! ## Wire format
//! ```text
//! 0x42 0x4D | len_hi len_lo (== 28) | 26 data bytes | ck_hi ck_lo
//! ```
//! The body is 13 big-endian `u16` fields followed by a big-endian `u16`
//! checksum. The checksum is the byte sum of everything before it, including
//! the sync pair and the length field, modulo 65536.
//!
//! Only two of the 13 fields are surfaced: the PM2.5 "atmospheric"
//! concentration and a large-particle proxy derived from the ≥0.3 µm and
//! ≥2.5 µm particle counts. The rest are decoded for checksum purposes and
//! discarded.
//!
//! ## Failure semantics
//! All parser conditions are non-fatal: they are counted in [`ParserStats`],
//! logged, and reset the state machine to hunting for the next sync byte.

use log::{debug, warn};

/// First sync byte of every frame.
const SYNC1: u8 = 0x42;
/// Second sync byte of every frame.
const SYNC2: u8 = 0x4D;
/// Expected value of the length field: 2 × 13 data words + 2 checksum bytes.
const BODY_LEN: usize = 28;
/// Pending-byte backlog beyond which the stream is considered overrun and
/// flushed wholesale.
const OVERRUN_THRESHOLD: usize = 250;

/// Byte-field offsets within the frame body.
const PM2_5_ATM: usize = 4; // PM2.5 µg/m³, "atmospheric" compensation
const PCNT_0_3: usize = 6; // particles ≥ 0.3 µm per 0.1 L
const PCNT_2_5: usize = 9; // particles ≥ 2.5 µm per 0.1 L

/// Abstraction over an unbuffered serial byte stream.
///
/// `read` may deliver fewer bytes than requested; the parser treats that as a
/// [`ParserStats::short_reads`] condition and resynchronizes.
pub trait ByteSource {
    /// Number of bytes that can currently be read without blocking.
    fn available(&mut self) -> usize;
    /// Read up to `buf.len()` bytes, returning how many were delivered.
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// One checksum-validated particulate measurement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmFrame {
    /// PM2.5 concentration in µg/m³, atmospheric-environment compensation.
    pub pm25_atm: u16,
    /// Count of particles ≥ 0.3 µm per 0.1 L of air.
    pub particles_ge_0_3um: u16,
    /// Count of particles ≥ 2.5 µm per 0.1 L of air.
    pub particles_ge_2_5um: u16,
}

impl PmFrame {
    /// Large-particle proxy: small-particle count minus coarse count.
    ///
    /// The two counters come from the same optical measurement, so the ≥0.3 µm
    /// count includes the ≥2.5 µm one; the difference isolates the fine
    /// fraction the sensor is actually good at seeing.
    pub fn large_particle_proxy(&self) -> u16 {
        self.particles_ge_0_3um
            .saturating_sub(self.particles_ge_2_5um)
    }

    /// Serialize to the 32-byte wire form, with every unsurfaced field zero.
    /// Used by loopback sources in simulation and tests.
    pub fn encode(&self) -> [u8; 32] {
        let mut fields = [0u16; 13];
        fields[PM2_5_ATM] = self.pm25_atm;
        fields[PCNT_0_3] = self.particles_ge_0_3um;
        fields[PCNT_2_5] = self.particles_ge_2_5um;

        let mut out = [0u8; 32];
        out[0] = SYNC1;
        out[1] = SYNC2;
        out[3] = BODY_LEN as u8;
        for (ix, f) in fields.iter().enumerate() {
            out[4 + 2 * ix..6 + 2 * ix].copy_from_slice(&f.to_be_bytes());
        }
        let sum = out[..30]
            .iter()
            .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)));
        out[30..].copy_from_slice(&sum.to_be_bytes());
        out
    }
}

/// Parser position within the frame layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParserState {
    /// Hunting for the first sync byte (0x42); non-sync bytes are skipped.
    AwaitingSync1,
    /// Expecting the second sync byte (0x4D); anything else resets.
    AwaitingSync2,
    /// Accumulating the 2-byte big-endian length field.
    AwaitingLength,
    /// Accumulating the 28-byte body, checksum included.
    AwaitingBody,
}

/// Counters for every non-fatal parser condition, plus accepted frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParserStats {
    /// Frames that passed checksum validation.
    pub frames: u64,
    /// Backlog flushes caused by more than 250 pending bytes.
    pub framing_overruns: u64,
    /// Frames dropped because the checksum did not match.
    pub checksum_mismatches: u64,
    /// Reads that delivered fewer bytes than the source advertised.
    pub short_reads: u64,
    /// Length fields that did not equal the fixed body size.
    pub bad_lengths: u64,
}

/// Resumable frame decoder over a [`ByteSource`].
///
/// The state machine is an explicit enum plus partial length/body buffers so
/// that a frame split across any number of `poll` calls reassembles
/// correctly, and so the state stays inspectable in tests.
pub struct PmParser<S: ByteSource> {
    source: S,
    state: ParserState,
    length_buf: [u8; 2],
    length_have: usize,
    body_buf: [u8; BODY_LEN],
    body_have: usize,
    stats: ParserStats,
}

impl<S: ByteSource> PmParser<S> {
    pub fn new(source: S) -> Self {
        PmParser {
            source,
            state: ParserState::AwaitingSync1,
            length_buf: [0; 2],
            length_have: 0,
            body_buf: [0; BODY_LEN],
            body_have: 0,
            stats: ParserStats::default(),
        }
    }

    /// Current state machine position.
    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Condition counters since construction.
    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    fn reset(&mut self) {
        self.state = ParserState::AwaitingSync1;
        self.length_have = 0;
        self.body_have = 0;
    }

    /// Non-blocking poll: consume currently-available bytes and return the
    /// next validated frame, or `None` if no full frame is ready yet.
    ///
    /// Call repeatedly until `None` to drain a backlog of several frames.
    pub fn poll(&mut self) -> Option<PmFrame> {
        let mut budget = self.source.available();
        if budget > OVERRUN_THRESHOLD {
            // The sensor outpaced us; individual frames in the backlog are
            // stale anyway, so flush everything and start clean.
            warn!("pms: uart overrun ({} bytes pending), flushing", budget);
            self.stats.framing_overruns += 1;
            let mut scratch = [0u8; 64];
            while self.source.available() > 0 && self.source.read(&mut scratch) > 0 {}
            self.reset();
            return None;
        }

        while budget > 0 {
            match self.state {
                ParserState::AwaitingSync1 => {
                    let b = self.take_byte(&mut budget)?;
                    if b == SYNC1 {
                        self.state = ParserState::AwaitingSync2;
                    }
                }
                ParserState::AwaitingSync2 => {
                    let b = self.take_byte(&mut budget)?;
                    if b == SYNC2 {
                        self.state = ParserState::AwaitingLength;
                        self.length_have = 0;
                    } else {
                        self.state = ParserState::AwaitingSync1;
                    }
                }
                ParserState::AwaitingLength => {
                    let want = (2 - self.length_have).min(budget);
                    let got = self
                        .source
                        .read(&mut self.length_buf[self.length_have..self.length_have + want]);
                    if got < want {
                        self.on_short_read(want, got);
                        return None;
                    }
                    self.length_have += got;
                    budget -= got;
                    if self.length_have == 2 {
                        let ll = u16::from_be_bytes(self.length_buf) as usize;
                        if ll == BODY_LEN {
                            self.state = ParserState::AwaitingBody;
                            self.body_have = 0;
                        } else {
                            warn!("pms: bad frame length ({})", ll);
                            self.stats.bad_lengths += 1;
                            self.reset();
                        }
                    }
                }
                ParserState::AwaitingBody => {
                    let want = (BODY_LEN - self.body_have).min(budget);
                    let got = self
                        .source
                        .read(&mut self.body_buf[self.body_have..self.body_have + want]);
                    if got < want {
                        self.on_short_read(want, got);
                        return None;
                    }
                    self.body_have += got;
                    budget -= got;
                    if self.body_have == BODY_LEN {
                        self.reset();
                        if let Some(frame) = self.validate_body() {
                            return Some(frame);
                        }
                    }
                }
            }
        }
        None
    }

    /// Read a single byte, charging it to the poll budget.
    fn take_byte(&mut self, budget: &mut usize) -> Option<u8> {
        let mut b = [0u8; 1];
        let got = self.source.read(&mut b);
        if got < 1 {
            self.on_short_read(1, got);
            return None;
        }
        *budget -= 1;
        Some(b[0])
    }

    fn on_short_read(&mut self, want: usize, got: usize) {
        warn!("pms: short read ({} of {} bytes)", got, want);
        self.stats.short_reads += 1;
        self.reset();
    }

    /// Verify the body checksum and extract the surfaced fields.
    fn validate_body(&mut self) -> Option<PmFrame> {
        let mut sum = u16::from(SYNC1)
            .wrapping_add(u16::from(SYNC2))
            .wrapping_add(BODY_LEN as u16);
        for &b in &self.body_buf[..BODY_LEN - 2] {
            sum = sum.wrapping_add(u16::from(b));
        }
        let expected = word(&self.body_buf, (BODY_LEN - 2) / 2);
        if sum != expected {
            warn!("pms: bad checksum (got {:#06x}, want {:#06x})", sum, expected);
            self.stats.checksum_mismatches += 1;
            return None;
        }
        let frame = PmFrame {
            pm25_atm: word(&self.body_buf, PM2_5_ATM),
            particles_ge_0_3um: word(&self.body_buf, PCNT_0_3),
            particles_ge_2_5um: word(&self.body_buf, PCNT_2_5),
        };
        self.stats.frames += 1;
        debug!(
            "pms: frame pm2.5={}µg/m³ proxy={}",
            frame.pm25_atm,
            frame.large_particle_proxy()
        );
        Some(frame)
    }
}

/// Big-endian `u16` field `ix` of a frame body.
fn word(body: &[u8; BODY_LEN], ix: usize) -> u16 {
    u16::from_be_bytes([body[2 * ix], body[2 * ix + 1]])
}

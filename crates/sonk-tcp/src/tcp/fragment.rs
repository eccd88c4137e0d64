//! The per-connection fragment and the receive state machine.
//!
//! One [`Fragment`] lives for the lifetime of a connection and is recycled
//! in place between packets; callbacks receive it as an ephemeral view and
//! must not retain references past their return. Arrivals land in the
//! fragment's buffer at [`HEADER_RESERVE`]; header bytes (which may span
//! any number of reads) are copied down into the reserved front area.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::tcp::error::{TcpError, TcpResult};
use crate::tcp::types::{HEADER_RESERVE, LONG_HEADER, MAX_PREALLOC, SHORT_HEADER};

/// A byte window into the connection buffer, covering the portion of a
/// packet delivered by the most recent read.
pub struct Fragment {
    data: Vec<u8>,
    full_length: i64,
    cumulative_read_count: u64,
    current_read_count: usize,
    current_offset: usize,
    length_found: bool,
    completed: bool,
    accumulator: Option<Vec<u8>>,
    /// Caller-owned auxiliary slot; survives recycling.
    pub tag: Option<Box<dyn Any + Send>>,
}

impl Fragment {
    fn new(buffer_size: usize) -> Self {
        Self {
            data: vec![0u8; buffer_size + HEADER_RESERVE],
            full_length: -1,
            cumulative_read_count: 0,
            current_read_count: 0,
            current_offset: 0,
            length_found: false,
            completed: false,
            accumulator: None,
            tag: None,
        }
    }

    /// The whole connection buffer, header reserve included.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The payload window of the most recent delivery.
    pub fn current_slice(&self) -> &[u8] {
        &self.data[self.current_offset..self.current_offset + self.current_read_count]
    }

    /// Decoded packet length, or -1 while the header is still incomplete.
    pub fn full_length(&self) -> i64 {
        self.full_length
    }

    /// Payload bytes captured so far, header excluded.
    pub fn cumulative_read_count(&self) -> u64 {
        self.cumulative_read_count
    }

    pub fn current_read_count(&self) -> usize {
        self.current_read_count
    }

    pub fn current_offset(&self) -> usize {
        self.current_offset
    }

    pub fn length_found(&self) -> bool {
        self.length_found
    }

    pub fn completed(&self) -> bool {
        self.completed
    }
}

/// A single delivery produced while feeding received bytes.
pub(crate) enum Delivery<'a> {
    /// A payload window became available.
    Fragment(&'a Fragment),
    /// A packet completed with whole-packet buffering enabled.
    Packet(Vec<u8>),
}

/// Per-connection framing state: the recycled fragment plus the in-progress
/// header bookkeeping.
pub(crate) struct Framer {
    frag: Fragment,
    header_size: usize,
    header_cursor: usize,
    /// Latched from the connection's one-shot flag when a packet starts.
    suppress_buffering: bool,
}

impl Framer {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            frag: Fragment::new(buffer_size),
            header_size: SHORT_HEADER,
            header_cursor: 0,
            suppress_buffering: false,
        }
    }

    /// The region reads land in.
    pub fn read_buffer(&mut self) -> &mut [u8] {
        &mut self.frag.data[HEADER_RESERVE..]
    }

    /// Run the state machine over `n` freshly received bytes.
    ///
    /// `arm_long` selects the 64-bit header for the next starting packet and
    /// is reset once that header is consumed; `arm_unbuffered` suppresses
    /// whole-packet accumulation for the next starting packet and is reset
    /// when it starts. `collect_packets` reflects whether the owner asked
    /// for whole-packet delivery at all.
    ///
    /// The sink sees every payload window in order, and each completed
    /// packet's accumulated bytes right after that packet's final window.
    /// Header bytes never reach the sink.
    pub fn feed(
        &mut self,
        n: usize,
        arm_long: &AtomicBool,
        arm_unbuffered: &AtomicBool,
        collect_packets: bool,
        sink: &mut dyn FnMut(Delivery<'_>),
    ) -> TcpResult<()> {
        let mut pos = HEADER_RESERVE;
        let end = HEADER_RESERVE + n;

        while pos < end {
            if !self.frag.length_found {
                if self.header_cursor == 0 {
                    // A new packet starts here: latch the per-packet flags.
                    self.header_size = if arm_long.load(Ordering::SeqCst) {
                        LONG_HEADER
                    } else {
                        SHORT_HEADER
                    };
                    self.suppress_buffering = arm_unbuffered.swap(false, Ordering::SeqCst);
                }

                let need = self.header_size - self.header_cursor;
                let take = need.min(end - pos);
                self.frag.data.copy_within(pos..pos + take, self.header_cursor);
                self.header_cursor += take;
                pos += take;

                if self.header_cursor == self.header_size {
                    let full = decode_header(&self.frag.data[..self.header_size])?;
                    self.frag.full_length = full;
                    self.frag.length_found = true;
                    arm_long.store(false, Ordering::SeqCst);

                    if collect_packets && !self.suppress_buffering {
                        let cap = (full as usize).min(MAX_PREALLOC);
                        self.frag.accumulator = Some(Vec::with_capacity(cap));
                    }

                    if full == 0 {
                        // Empty packet: completes at header decode.
                        self.frag.current_offset = pos;
                        self.frag.current_read_count = 0;
                        self.frag.completed = true;
                        sink(Delivery::Fragment(&self.frag));
                        if let Some(acc) = self.frag.accumulator.take() {
                            sink(Delivery::Packet(acc));
                        }
                        self.recycle();
                    }
                }
            } else {
                let remaining =
                    (self.frag.full_length as u64 - self.frag.cumulative_read_count) as usize;
                let take = remaining.min(end - pos);
                self.frag.current_offset = pos;
                self.frag.current_read_count = take;
                self.frag.cumulative_read_count += take as u64;
                self.frag.completed =
                    self.frag.cumulative_read_count == self.frag.full_length as u64;
                if let Some(acc) = self.frag.accumulator.as_mut() {
                    acc.extend_from_slice(&self.frag.data[pos..pos + take]);
                }
                pos += take;

                sink(Delivery::Fragment(&self.frag));
                if self.frag.completed {
                    if let Some(acc) = self.frag.accumulator.take() {
                        sink(Delivery::Packet(acc));
                    }
                    self.recycle();
                }
            }
        }
        Ok(())
    }

    /// Reset for the next packet. Same object, same buffer; the caller tag
    /// survives.
    fn recycle(&mut self) {
        self.frag.full_length = -1;
        self.frag.cumulative_read_count = 0;
        self.frag.current_read_count = 0;
        self.frag.current_offset = 0;
        self.frag.length_found = false;
        self.frag.completed = false;
        self.frag.accumulator = None;
        self.header_cursor = 0;
        self.suppress_buffering = false;
    }
}

fn decode_header(bytes: &[u8]) -> TcpResult<i64> {
    let value = match bytes.len() {
        SHORT_HEADER => {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(bytes);
            i32::from_be_bytes(raw) as i64
        }
        _ => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            i64::from_be_bytes(raw)
        }
    };
    if value < 0 {
        return Err(TcpError::framing(format!(
            "length header decoded to {}",
            value
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        windows: Vec<Vec<u8>>,
        packets: Vec<Vec<u8>>,
        cumulative: Vec<u64>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                windows: Vec::new(),
                packets: Vec::new(),
                cumulative: Vec::new(),
            }
        }
    }

    /// Push `chunk` through the framer as if it had just been read.
    fn feed_chunk(
        framer: &mut Framer,
        chunk: &[u8],
        arm_long: &AtomicBool,
        arm_unbuffered: &AtomicBool,
        collect: bool,
        rec: &mut Recorder,
    ) -> TcpResult<()> {
        framer.read_buffer()[..chunk.len()].copy_from_slice(chunk);
        let mut sink = |d: Delivery<'_>| match d {
            Delivery::Fragment(frag) => {
                rec.windows.push(frag.current_slice().to_vec());
                rec.cumulative.push(frag.cumulative_read_count());
            }
            Delivery::Packet(buf) => rec.packets.push(buf),
        };
        framer.feed(chunk.len(), arm_long, arm_unbuffered, collect, &mut sink)
    }

    fn frame32(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn single_packet_one_read() {
        let mut framer = Framer::new(256);
        let long = AtomicBool::new(false);
        let unbuf = AtomicBool::new(false);
        let mut rec = Recorder::new();
        feed_chunk(&mut framer, &frame32(b"HELLOWORLD"), &long, &unbuf, true, &mut rec).unwrap();
        assert_eq!(rec.packets, vec![b"HELLOWORLD".to_vec()]);
        assert_eq!(rec.windows, vec![b"HELLOWORLD".to_vec()]);
        assert_eq!(rec.cumulative, vec![10]);
    }

    #[test]
    fn header_split_across_reads() {
        let mut framer = Framer::new(256);
        let long = AtomicBool::new(false);
        let unbuf = AtomicBool::new(false);
        let mut rec = Recorder::new();
        let wire = frame32(b"ABCD");
        feed_chunk(&mut framer, &wire[..2], &long, &unbuf, true, &mut rec).unwrap();
        assert!(rec.windows.is_empty());
        feed_chunk(&mut framer, &wire[2..], &long, &unbuf, true, &mut rec).unwrap();
        assert_eq!(rec.packets, vec![b"ABCD".to_vec()]);
    }

    #[test]
    fn two_packets_in_one_read() {
        let mut framer = Framer::new(256);
        let long = AtomicBool::new(false);
        let unbuf = AtomicBool::new(false);
        let mut rec = Recorder::new();
        let mut wire = frame32(b"AAAA");
        wire.extend_from_slice(&frame32(b"BBBB"));
        feed_chunk(&mut framer, &wire, &long, &unbuf, true, &mut rec).unwrap();
        assert_eq!(rec.packets, vec![b"AAAA".to_vec(), b"BBBB".to_vec()]);
    }

    #[test]
    fn any_chunking_yields_identical_packets() {
        let mut wire = frame32(b"first-payload");
        wire.extend_from_slice(&frame32(b"second"));
        wire.extend_from_slice(&frame32(b""));
        wire.extend_from_slice(&frame32(b"third!"));

        let reference = vec![
            b"first-payload".to_vec(),
            b"second".to_vec(),
            Vec::new(),
            b"third!".to_vec(),
        ];

        for chunk_size in [1usize, 2, 3, 5, 7, 11, wire.len()] {
            let mut framer = Framer::new(64);
            let long = AtomicBool::new(false);
            let unbuf = AtomicBool::new(false);
            let mut rec = Recorder::new();
            for chunk in wire.chunks(chunk_size) {
                feed_chunk(&mut framer, chunk, &long, &unbuf, true, &mut rec).unwrap();
            }
            assert_eq!(rec.packets, reference, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn fragment_windows_sum_to_full_length() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let wire = frame32(&payload);
        let mut framer = Framer::new(32);
        let long = AtomicBool::new(false);
        let unbuf = AtomicBool::new(false);
        let mut rec = Recorder::new();
        for chunk in wire.chunks(32) {
            feed_chunk(&mut framer, chunk, &long, &unbuf, true, &mut rec).unwrap();
        }
        let total: usize = rec.windows.iter().map(|w| w.len()).sum();
        assert_eq!(total, payload.len());
        assert_eq!(rec.packets, vec![payload.clone()]);
        assert_eq!(*rec.cumulative.last().unwrap(), payload.len() as u64);
    }

    #[test]
    fn long_header_consumes_arm_flag() {
        let mut framer = Framer::new(64);
        let long = AtomicBool::new(true);
        let unbuf = AtomicBool::new(false);
        let mut rec = Recorder::new();

        let mut wire = (9u64).to_be_bytes().to_vec();
        wire.extend_from_slice(b"ninebytes");
        // A second, 32-bit-framed packet directly behind it.
        wire.extend_from_slice(&frame32(b"after"));

        feed_chunk(&mut framer, &wire, &long, &unbuf, true, &mut rec).unwrap();
        assert_eq!(rec.packets, vec![b"ninebytes".to_vec(), b"after".to_vec()]);
        assert!(!long.load(Ordering::SeqCst));
    }

    #[test]
    fn unbuffered_one_shot_skips_packet_delivery() {
        let mut framer = Framer::new(64);
        let long = AtomicBool::new(false);
        let unbuf = AtomicBool::new(true);
        let mut rec = Recorder::new();

        let mut wire = frame32(b"skipme");
        wire.extend_from_slice(&frame32(b"keepme"));
        feed_chunk(&mut framer, &wire, &long, &unbuf, true, &mut rec).unwrap();

        // Both packets produce windows, only the second a whole-packet buffer.
        assert_eq!(rec.windows.len(), 2);
        assert_eq!(rec.packets, vec![b"keepme".to_vec()]);
        assert!(!unbuf.load(Ordering::SeqCst));
    }

    #[test]
    fn negative_length_is_a_framing_error() {
        let mut framer = Framer::new(64);
        let long = AtomicBool::new(false);
        let unbuf = AtomicBool::new(false);
        let mut rec = Recorder::new();
        let wire = (-1i32).to_be_bytes().to_vec();
        let err = feed_chunk(&mut framer, &wire, &long, &unbuf, true, &mut rec).unwrap_err();
        assert_eq!(err.kind, crate::tcp::error::TcpErrorKind::Framing);
    }

    #[test]
    fn no_packet_delivery_without_collection() {
        let mut framer = Framer::new(64);
        let long = AtomicBool::new(false);
        let unbuf = AtomicBool::new(false);
        let mut rec = Recorder::new();
        feed_chunk(&mut framer, &frame32(b"data"), &long, &unbuf, false, &mut rec).unwrap();
        assert_eq!(rec.windows.len(), 1);
        assert!(rec.packets.is_empty());
    }
}

// AXON IOK — NETWORK: IN-PLACE UDP SEGMENTATION
//
// Runtimes may enqueue UDP datagrams larger than the link MTU; they cannot be
// trusted to pre-segment (they know neither the MTU nor the offload
// capabilities). The segmenter rewrites the datagram inside the runtime's own
// region: payload chunks shift outward to open a header gap in front of each,
// the original headers are duplicated into the gaps, and the per-segment
// length fields are patched. No bytes cross an address space; the driver sees
// a flat list of MTU-sized frames.
//
// Completion contract: exactly one completion per original descriptor. Every
// segment except the last carries a zero (suppressed) token; the last carries
// the original.
//
// Checksums are not touched here: the offload flags on the descriptor ride
// along on every segment and the NIC recomputes.

use crate::engine::proc::{ShmRegion, TxNetHdr, TX_HDR_BYTES};

// ============================================================================
// DERIVED CONSTANTS
// ============================================================================

pub const MTU: usize = 1500;

pub const ETH_HDR_LEN: usize = 14;
pub const IPV4_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;

/// Fixed L2+L3+L4 prefix of a segmentable frame (IPv4 + UDP over Ethernet).
pub const WIRE_HDR_LEN: usize = ETH_HDR_LEN + IPV4_HDR_LEN + UDP_HDR_LEN;
const _: () = assert!(WIRE_HDR_LEN == 42);

// Field offsets within the wire frame.
pub const IP_TOTLEN_OFF: usize = ETH_HDR_LEN + 2;
pub const IP_PROTO_OFF: usize = ETH_HDR_LEN + 9;
pub const UDP_OFF: usize = ETH_HDR_LEN + IPV4_HDR_LEN;
pub const UDP_LEN_OFF: usize = UDP_OFF + 4;

pub const IPPROTO_UDP: u8 = 17;

/// Payload bytes carried by every segment but the last.
pub const SEG_PAYLOAD: usize = MTU - WIRE_HDR_LEN;
const _: () = assert!(SEG_PAYLOAD == 1458);

/// Per-segment header block in the region: descriptor header + wire headers,
/// rounded so consecutive blocks keep the L3 fields 4-byte aligned.
pub const SEG_BLOCK: usize = (TX_HDR_BYTES + WIRE_HDR_LEN + 3) & !3;
const _: () = assert!(SEG_BLOCK == 60);

/// Distance between consecutive segment blocks after expansion.
pub const SEG_STRIDE: usize = SEG_BLOCK + SEG_PAYLOAD;
const _: () = assert!(SEG_STRIDE == 1518);

/// Meaningful bytes duplicated per segment (the 4-byte rounding pad is not
/// copied; it would clobber the first payload bytes of the chunk behind it).
pub const SEG_HDR_COPY: usize = TX_HDR_BYTES + WIRE_HDR_LEN;

/// Segment count ceiling for one 16-bit UDP datagram.
pub const MAX_SEGS: usize = (u16::MAX as usize + SEG_PAYLOAD - 1) / SEG_PAYLOAD;

// ============================================================================
// SEGMENT OUTPUT
// ============================================================================

/// One driver-ready segment, still resident in the runtime's region.
#[derive(Clone, Copy, Debug)]
pub struct Segment {
    /// Region offset of the segment's TxNetHdr block.
    pub hdr_off: u64,
    /// On-wire length (Ethernet header included).
    pub wire_len: u32,
    pub olflags: u32,
    /// Zero on all but the last segment of a group.
    pub completion_data: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SegError {
    /// Drop the descriptor and echo the token with the error tag: zero UDP
    /// payload under an oversized total, or an oversized non-UDP frame.
    Malformed,
    /// The descriptor lies about its own geometry (extent outside the
    /// region, or declared length inconsistent with the UDP length field).
    /// Fatal for the runtime.
    BadLayout,
}

/// Segment (or pass through) the descriptor whose TxNetHdr sits at `hdr_off`.
/// Appends the resulting segments to `out` and returns how many were added.
///
/// The caller has already translated `hdr_off` for TX_HDR_BYTES; everything
/// beyond that is validated here before any byte moves.
pub fn segment(region: &ShmRegion, hdr_off: u64, out: &mut Vec<Segment>) -> Result<u32, SegError> {
    let hdr_ptr = region.to_ptr(hdr_off, TX_HDR_BYTES).ok_or(SegError::BadLayout)?;
    // SAFETY: to_ptr validated the 16-byte header extent.
    let hdr = unsafe { TxNetHdr::read(hdr_ptr) };
    let wire_len = hdr.len as usize;

    // Whole frame must sit inside the region regardless of size.
    region
        .to_ptr(hdr_off, TX_HDR_BYTES + wire_len)
        .ok_or(SegError::BadLayout)?;

    if wire_len <= MTU {
        out.push(Segment {
            hdr_off,
            wire_len: hdr.len,
            olflags: hdr.olflags,
            completion_data: hdr.completion_data,
        });
        return Ok(1);
    }

    // Oversized: only IPv4/UDP is segmentable.
    // SAFETY: frame extent validated above; offsets below are < WIRE_HDR_LEN
    // and wire_len > MTU > WIRE_HDR_LEN.
    let frame = unsafe { hdr_ptr.add(TX_HDR_BYTES) };
    let (ip_version, ip_proto, udp_len) = unsafe {
        (
            *frame.add(ETH_HDR_LEN) >> 4,
            *frame.add(IP_PROTO_OFF),
            u16::from_be_bytes([*frame.add(UDP_LEN_OFF), *frame.add(UDP_LEN_OFF + 1)]),
        )
    };
    if ip_version != 4 || ip_proto != IPPROTO_UDP {
        return Err(SegError::Malformed);
    }
    let payload_len = (udp_len as usize).saturating_sub(UDP_HDR_LEN);
    if payload_len == 0 {
        return Err(SegError::Malformed);
    }
    // The declared total and the UDP length field must agree; a frame that
    // cannot be reconstructed from its own headers is a protocol violation.
    if wire_len != WIRE_HDR_LEN + payload_len {
        return Err(SegError::BadLayout);
    }

    let segs = payload_len.div_ceil(SEG_PAYLOAD);
    let last_chunk = payload_len - (segs - 1) * SEG_PAYLOAD;

    // The expanded layout must fit: block k sits at hdr_off + k*SEG_STRIDE.
    let expanded = (segs - 1) * SEG_STRIDE + TX_HDR_BYTES + WIRE_HDR_LEN + last_chunk;
    region.to_ptr(hdr_off, expanded).ok_or(SegError::BadLayout)?;

    let base = hdr_ptr;
    // Shift payload chunks last-to-first so no chunk overwrites source bytes
    // it has yet to move. Chunk k: src at payload_start + k*SEG_PAYLOAD,
    // dst inside block k; chunk 0 stays put.
    // SAFETY: src and dst ranges lie inside the expanded extent validated
    // above; copy handles the overlap.
    unsafe {
        let payload0 = base.add(TX_HDR_BYTES + WIRE_HDR_LEN);
        for k in (1..segs).rev() {
            let chunk = if k == segs - 1 { last_chunk } else { SEG_PAYLOAD };
            let src = payload0.add(k * SEG_PAYLOAD);
            let dst = base.add(k * SEG_STRIDE + TX_HDR_BYTES + WIRE_HDR_LEN);
            std::ptr::copy(src, dst, chunk);
        }
        // Duplicate the original descriptor + wire headers into each gap.
        for k in 1..segs {
            std::ptr::copy_nonoverlapping(base, base.add(k * SEG_STRIDE), SEG_HDR_COPY);
        }
        // Patch per-segment lengths and tokens.
        for k in 0..segs {
            let block = base.add(k * SEG_STRIDE);
            let chunk = if k == segs - 1 { last_chunk } else { SEG_PAYLOAD };
            let seg_wire = (WIRE_HDR_LEN + chunk) as u32;
            let completion = if k == segs - 1 { hdr.completion_data } else { 0 };
            patch_segment(block, seg_wire, completion);
            out.push(Segment {
                hdr_off: hdr_off + (k * SEG_STRIDE) as u64,
                wire_len: seg_wire,
                olflags: hdr.olflags,
                completion_data: completion,
            });
        }
    }
    Ok(segs as u32)
}

/// Rewrite one segment's descriptor length, completion token, IPv4 total
/// length, and UDP length.
///
/// # Safety
/// `block` must be valid for `TX_HDR_BYTES + WIRE_HDR_LEN` bytes.
unsafe fn patch_segment(block: *mut u8, wire_len: u32, completion_data: u64) {
    let mut hdr = TxNetHdr::read(block);
    hdr.len = wire_len;
    hdr.completion_data = completion_data;
    TxNetHdr::write(block, hdr);

    let frame = block.add(TX_HDR_BYTES);
    let ip_total = ((wire_len as usize - ETH_HDR_LEN) as u16).to_be_bytes();
    std::ptr::copy_nonoverlapping(ip_total.as_ptr(), frame.add(IP_TOTLEN_OFF), 2);
    let udp_len = ((wire_len as usize - UDP_OFF) as u16).to_be_bytes();
    std::ptr::copy_nonoverlapping(udp_len.as_ptr(), frame.add(UDP_LEN_OFF), 2);
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::proc::OLFLAG_IP_CKSUM;

    struct HeapRegion {
        words: Vec<u64>,
    }

    impl HeapRegion {
        fn new(len: usize) -> HeapRegion {
            HeapRegion { words: vec![0u64; len.div_ceil(8)] }
        }
        fn region(&mut self) -> ShmRegion {
            // SAFETY: heap buffer is valid, aligned, and outlives the handle.
            unsafe { ShmRegion::from_raw(self.words.as_mut_ptr() as *mut u8, self.words.len() * 8) }
        }
    }

    /// Lay down a TxNetHdr + ETH/IPv4/UDP frame at `off`. The UDP length
    /// field and the descriptor length are kept consistent unless the caller
    /// patches them afterwards.
    fn build_udp_desc(region: &ShmRegion, off: u64, payload: &[u8], token: u64) {
        let wire_len = WIRE_HDR_LEN + payload.len();
        let p = region.to_ptr(off, TX_HDR_BYTES + wire_len).unwrap();
        // SAFETY: extent checked by to_ptr; test-owned memory.
        unsafe {
            TxNetHdr::write(
                p,
                TxNetHdr {
                    completion_data: token,
                    olflags: OLFLAG_IP_CKSUM,
                    len: wire_len as u32,
                },
            );
            let frame = std::slice::from_raw_parts_mut(p.add(TX_HDR_BYTES), wire_len);
            frame[..ETH_HDR_LEN].fill(0xEE); // MACs + ethertype, opaque here
            frame[12] = 0x08;
            frame[13] = 0x00;
            frame[ETH_HDR_LEN] = 0x45; // IPv4, IHL 5
            let ip_total = ((wire_len - ETH_HDR_LEN) as u16).to_be_bytes();
            frame[IP_TOTLEN_OFF..IP_TOTLEN_OFF + 2].copy_from_slice(&ip_total);
            frame[IP_PROTO_OFF] = IPPROTO_UDP;
            let udp_len = ((payload.len() + UDP_HDR_LEN) as u16).to_be_bytes();
            frame[UDP_LEN_OFF..UDP_LEN_OFF + 2].copy_from_slice(&udp_len);
            frame[WIRE_HDR_LEN..].copy_from_slice(payload);
        }
    }

    fn read_frame(region: &ShmRegion, seg: &Segment) -> Vec<u8> {
        let p = region
            .to_ptr(seg.hdr_off + TX_HDR_BYTES as u64, seg.wire_len as usize)
            .unwrap();
        // SAFETY: bounds checked.
        unsafe { std::slice::from_raw_parts(p, seg.wire_len as usize) }.to_vec()
    }

    #[test]
    fn derived_constants() {
        assert_eq!(WIRE_HDR_LEN, 42);
        assert_eq!(SEG_PAYLOAD, 1458);
        assert_eq!(SEG_BLOCK, 60);
        assert_eq!(SEG_STRIDE, 1518);
        assert_eq!(UDP_LEN_OFF, 38);
        assert_eq!(IP_TOTLEN_OFF, 16);
        assert_eq!(MAX_SEGS, 45);
    }

    #[test]
    fn small_frame_passes_through() {
        let mut mem = HeapRegion::new(8192);
        let r = mem.region();
        let payload = vec![0x5A; 58]; // wire = 100
        build_udp_desc(&r, 256, &payload, 0xAA);

        let mut out = Vec::new();
        assert_eq!(segment(&r, 256, &mut out), Ok(1));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].hdr_off, 256);
        assert_eq!(out[0].wire_len, 100);
        assert_eq!(out[0].completion_data, 0xAA);
        assert_eq!(out[0].olflags, OLFLAG_IP_CKSUM);
    }

    #[test]
    fn three_segment_split_matches_arithmetic() {
        // The reference case: 4000-byte payload, H=42, MTU=1500.
        let mut mem = HeapRegion::new(64 * 1024);
        let r = mem.region();
        let payload: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        build_udp_desc(&r, 512, &payload, 0xC0FFEE);

        let mut out = Vec::new();
        assert_eq!(segment(&r, 512, &mut out), Ok(3));

        let lens: Vec<u32> = out.iter().map(|s| s.wire_len).collect();
        assert_eq!(lens, vec![1500, 1500, 1126]);
        assert_eq!(out[0].completion_data, 0);
        assert_eq!(out[1].completion_data, 0);
        assert_eq!(out[2].completion_data, 0xC0FFEE);
        for (k, s) in out.iter().enumerate() {
            assert_eq!(s.hdr_off, 512 + (k * SEG_STRIDE) as u64);
            assert_eq!(s.olflags, OLFLAG_IP_CKSUM);
        }

        // Per-segment L3/L4 length fields.
        let expect_udp = [1458 + 8u16, 1458 + 8, 1084 + 8];
        for (k, s) in out.iter().enumerate() {
            let f = read_frame(&r, s);
            let ip_total = u16::from_be_bytes([f[IP_TOTLEN_OFF], f[IP_TOTLEN_OFF + 1]]);
            let udp_len = u16::from_be_bytes([f[UDP_LEN_OFF], f[UDP_LEN_OFF + 1]]);
            assert_eq!(ip_total as u32, s.wire_len - ETH_HDR_LEN as u32);
            assert_eq!(udp_len, expect_udp[k]);
            assert!(s.wire_len as usize <= MTU);
            // Every segment carries a full copy of the original headers.
            assert_eq!(f[12], 0x08);
            assert_eq!(f[ETH_HDR_LEN], 0x45);
            assert_eq!(f[IP_PROTO_OFF], IPPROTO_UDP);
        }
    }

    #[test]
    fn payload_reassembles_exactly() {
        let mut mem = HeapRegion::new(128 * 1024);
        let r = mem.region();
        let mut rng_state = 0x12345678u64;
        let payload: Vec<u8> = (0..10_000)
            .map(|_| {
                // xorshift; deterministic pseudo-random payload
                rng_state ^= rng_state << 13;
                rng_state ^= rng_state >> 7;
                rng_state ^= rng_state << 17;
                rng_state as u8
            })
            .collect();
        build_udp_desc(&r, 1024, &payload, 7);

        let mut out = Vec::new();
        let n = segment(&r, 1024, &mut out).unwrap();
        assert_eq!(n as usize, payload.len().div_ceil(SEG_PAYLOAD));

        let mut reassembled = Vec::new();
        for s in &out {
            let f = read_frame(&r, s);
            reassembled.extend_from_slice(&f[WIRE_HDR_LEN..]);
        }
        assert_eq!(reassembled, payload, "concatenated segment payloads must equal the original");
    }

    #[test]
    fn exact_multiple_has_full_last_segment() {
        let mut mem = HeapRegion::new(64 * 1024);
        let r = mem.region();
        let payload = vec![0x33; 2 * SEG_PAYLOAD];
        build_udp_desc(&r, 64, &payload, 0xF00D);

        let mut out = Vec::new();
        assert_eq!(segment(&r, 64, &mut out), Ok(2));
        assert_eq!(out[0].wire_len as usize, MTU);
        assert_eq!(out[1].wire_len as usize, MTU);
        assert_eq!(out[1].completion_data, 0xF00D);
    }

    #[test]
    fn zero_payload_oversized_is_malformed() {
        let mut mem = HeapRegion::new(16 * 1024);
        let r = mem.region();
        let payload = vec![0x44; 2000];
        build_udp_desc(&r, 128, &payload, 1);
        // Lie: UDP length says header-only.
        let p = r.to_ptr(128 + TX_HDR_BYTES as u64, WIRE_HDR_LEN).unwrap();
        // SAFETY: in-bounds test memory.
        unsafe {
            let udp_len = (UDP_HDR_LEN as u16).to_be_bytes();
            std::ptr::copy_nonoverlapping(udp_len.as_ptr(), p.add(UDP_LEN_OFF), 2);
        }
        let mut out = Vec::new();
        assert_eq!(segment(&r, 128, &mut out), Err(SegError::Malformed));
        assert!(out.is_empty());
    }

    #[test]
    fn oversized_non_udp_is_malformed() {
        let mut mem = HeapRegion::new(16 * 1024);
        let r = mem.region();
        let payload = vec![0x55; 3000];
        build_udp_desc(&r, 128, &payload, 1);
        let p = r.to_ptr(128 + TX_HDR_BYTES as u64, WIRE_HDR_LEN).unwrap();
        // SAFETY: in-bounds test memory.
        unsafe { *p.add(IP_PROTO_OFF) = 6 }; // TCP
        let mut out = Vec::new();
        assert_eq!(segment(&r, 128, &mut out), Err(SegError::Malformed));
    }

    #[test]
    fn inconsistent_declared_length_is_fatal() {
        let mut mem = HeapRegion::new(16 * 1024);
        let r = mem.region();
        let payload = vec![0x66; 3000];
        build_udp_desc(&r, 128, &payload, 1);
        // Shrink the UDP view of the payload without touching the descriptor.
        let p = r.to_ptr(128 + TX_HDR_BYTES as u64, WIRE_HDR_LEN).unwrap();
        // SAFETY: in-bounds test memory.
        unsafe {
            let udp_len = ((1500 + UDP_HDR_LEN) as u16).to_be_bytes();
            std::ptr::copy_nonoverlapping(udp_len.as_ptr(), p.add(UDP_LEN_OFF), 2);
        }
        let mut out = Vec::new();
        assert_eq!(segment(&r, 128, &mut out), Err(SegError::BadLayout));
    }

    #[test]
    fn expansion_past_region_end_is_fatal() {
        // 4000-byte payload needs ~4600 bytes after expansion; give it less.
        let need = TX_HDR_BYTES + WIRE_HDR_LEN + 4000;
        let mut mem = HeapRegion::new(need + 8);
        let r = mem.region();
        let payload = vec![0x77; 4000];
        build_udp_desc(&r, 0, &payload, 1);
        let mut out = Vec::new();
        assert_eq!(segment(&r, 0, &mut out), Err(SegError::BadLayout));
    }

    #[test]
    fn frame_extent_outside_region_is_fatal() {
        let mut mem = HeapRegion::new(256);
        let r = mem.region();
        let p = r.to_ptr(200, TX_HDR_BYTES).unwrap();
        // SAFETY: in-bounds 16-byte write.
        unsafe {
            TxNetHdr::write(p, TxNetHdr { completion_data: 1, olflags: 0, len: 1000 });
        }
        let mut out = Vec::new();
        assert_eq!(segment(&r, 200, &mut out), Err(SegError::BadLayout));
    }
}

//! ISOBMFF (MP4) box walking and the minimal header boxes used when
//! reassembling fragmented MP4 segments without an external muxer.

use bytes::{BufMut, Bytes, BytesMut};

pub type FourCC = [u8; 4];

pub const FTYP: FourCC = *b"ftyp";
pub const STYP: FourCC = *b"styp";
pub const SIDX: FourCC = *b"sidx";
pub const MOOV: FourCC = *b"moov";
pub const MVHD: FourCC = *b"mvhd";
pub const MOOF: FourCC = *b"moof";
pub const MDAT: FourCC = *b"mdat";

/// Size of a compact box header (32-bit size + fourcc).
pub const BOX_HEADER_SIZE: usize = 8;
/// Size of a box header carrying a 64-bit `largesize`.
pub const LARGE_BOX_HEADER_SIZE: usize = 16;

/// Box types that may legitimately start a fragmented MP4 segment.
const LEADING_FMP4_BOXES: [FourCC; 5] = [FTYP, STYP, MOOF, MDAT, SIDX];

/// Decoded box header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    /// Total box size in bytes, header included.
    pub size: u64,
    pub fourcc: FourCC,
    pub header_size: usize,
}

impl BoxHeader {
    pub fn payload_len(&self) -> u64 {
        self.size - self.header_size as u64
    }
}

/// Decode the header of a box starting at `data[0]`.
///
/// `available` is the number of bytes from the start of the box to the end
/// of its container (it may exceed `data.len()` when only the header bytes
/// were read from a file). Handles the 32-bit size, the 64-bit `largesize`
/// (`size == 1`) and the box-extends-to-end form (`size == 0`).
///
/// Returns `None` when the header is incomplete, the declared size is
/// smaller than the header, or the box runs past `available`.
pub fn parse_box_header(data: &[u8], available: u64) -> Option<BoxHeader> {
    if data.len() < BOX_HEADER_SIZE {
        return None;
    }

    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
    let fourcc: FourCC = [data[4], data[5], data[6], data[7]];

    let (size, header_size) = match size {
        1 => {
            if data.len() < LARGE_BOX_HEADER_SIZE {
                return None;
            }
            let large = u64::from_be_bytes([
                data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
            ]);
            (large, LARGE_BOX_HEADER_SIZE)
        }
        0 => (available, BOX_HEADER_SIZE),
        _ => (size, BOX_HEADER_SIZE),
    };

    if size < header_size as u64 || size > available {
        return None;
    }

    Some(BoxHeader {
        size,
        fourcc,
        header_size,
    })
}

/// A top-level box borrowed from a segment buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mp4Box<'a> {
    pub fourcc: FourCC,
    /// Offset of the box header within the walked buffer.
    pub offset: usize,
    /// Box body, header excluded.
    pub payload: &'a [u8],
}

/// Iterator over the sibling boxes of a buffer. See [`boxes`].
#[derive(Debug, Clone)]
pub struct BoxIter<'a> {
    data: &'a [u8],
    offset: usize,
    malformed: bool,
}

impl<'a> BoxIter<'a> {
    /// True once iteration stopped on a truncated or invalid box rather
    /// than at the end of the buffer.
    pub fn is_malformed(&self) -> bool {
        self.malformed
    }
}

impl<'a> Iterator for BoxIter<'a> {
    type Item = Mp4Box<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let remaining = &self.data[self.offset..];
        let Some(header) = parse_box_header(remaining, remaining.len() as u64) else {
            self.malformed = true;
            self.offset = self.data.len();
            return None;
        };

        // size <= remaining.len() was checked, so this fits in usize
        let end = header.size as usize;
        let item = Mp4Box {
            fourcc: header.fourcc,
            offset: self.offset,
            payload: &remaining[header.header_size..end],
        };
        self.offset += end;
        Some(item)
    }
}

/// Walk the sibling boxes of `data`, yielding `(fourcc, payload)` views in
/// order. Iteration stops at the end of the buffer or at the first
/// truncated/invalid box.
pub fn boxes(data: &[u8]) -> BoxIter<'_> {
    BoxIter {
        data,
        offset: 0,
        malformed: false,
    }
}

/// Payloads of every top-level `mdat` box in `data`, in order.
pub fn mdat_payloads(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    boxes(data)
        .filter(|b| b.fourcc == MDAT)
        .map(|b| b.payload)
}

/// Total `mdat` payload length of a segment buffer.
pub fn mdat_payload_len(data: &[u8]) -> u64 {
    mdat_payloads(data).map(|p| p.len() as u64).sum()
}

/// Whether `data` starts with a box that opens a fragmented MP4 segment.
pub fn starts_with_fmp4_box(data: &[u8]) -> bool {
    data.len() >= BOX_HEADER_SIZE && LEADING_FMP4_BOXES.iter().any(|t| data[4..8] == t[..])
}

/// Write a box header for a box of `total_size` bytes (header included by
/// the caller's accounting). Uses the 64-bit form when the size does not
/// fit in 32 bits.
pub fn put_box_header(buf: &mut impl BufMut, total_size: u64, fourcc: FourCC) {
    if total_size <= u32::MAX as u64 {
        buf.put_u32(total_size as u32);
        buf.put_slice(&fourcc);
    } else {
        buf.put_u32(1);
        buf.put_slice(&fourcc);
        buf.put_u64(total_size);
    }
}

/// Header for an `mdat` box wrapping `payload_len` bytes.
pub fn mdat_header(payload_len: u64) -> Bytes {
    let compact = payload_len + BOX_HEADER_SIZE as u64;
    let mut buf = BytesMut::with_capacity(LARGE_BOX_HEADER_SIZE);
    if compact <= u32::MAX as u64 {
        put_box_header(&mut buf, compact, MDAT);
    } else {
        put_box_header(&mut buf, payload_len + LARGE_BOX_HEADER_SIZE as u64, MDAT);
    }
    buf.freeze()
}

/// `ftyp` with major brand `iso5` (minor version 512) and compatible
/// brands `iso5`, `iso6`, `mp41`.
pub fn ftyp_box() -> Bytes {
    let brands: [&[u8; 4]; 3] = [b"iso5", b"iso6", b"mp41"];
    let size = BOX_HEADER_SIZE + 8 + brands.len() * 4;

    let mut buf = BytesMut::with_capacity(size);
    put_box_header(&mut buf, size as u64, FTYP);
    buf.put_slice(b"iso5");
    buf.put_u32(0x200);
    for brand in brands {
        buf.put_slice(brand);
    }
    buf.freeze()
}

/// Movie timescale of the synthesized `mvhd` (milliseconds).
pub const MOVIE_TIMESCALE: u32 = 1000;

const MVHD_V0_PAYLOAD_SIZE: usize = 100;
const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// A `moov` holding only a version-0 `mvhd`: timescale 1000, the given
/// duration in milliseconds, rate and volume 1.0, unity matrix.
///
/// It carries no tracks, so players that require a track table will not
/// accept the file produced with it.
pub fn minimal_moov(duration_ms: u32) -> Bytes {
    let mvhd_size = BOX_HEADER_SIZE + MVHD_V0_PAYLOAD_SIZE;
    let moov_size = BOX_HEADER_SIZE + mvhd_size;

    let mut buf = BytesMut::with_capacity(moov_size);
    put_box_header(&mut buf, moov_size as u64, MOOV);
    put_box_header(&mut buf, mvhd_size as u64, MVHD);

    buf.put_u32(0); // version 0, flags 0
    buf.put_u32(0); // creation_time
    buf.put_u32(0); // modification_time
    buf.put_u32(MOVIE_TIMESCALE);
    buf.put_u32(duration_ms);
    buf.put_u32(0x0001_0000); // rate 1.0
    buf.put_u16(0x0100); // volume 1.0
    buf.put_bytes(0, 10); // reserved
    for value in UNITY_MATRIX {
        buf.put_u32(value);
    }
    buf.put_bytes(0, 24); // pre_defined
    buf.put_u32(1); // next_track_ID

    debug_assert_eq!(buf.len(), moov_size);
    buf.freeze()
}

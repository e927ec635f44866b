//! Heap/index page header access and the Postgres page checksum.

use byteorder::{ByteOrder, LittleEndian};

use crate::pg::lsn::Lsn;
use crate::pg::BLCKSZ;

// PageHeaderData field offsets.
const PD_LSN_HI: usize = 0;
const PD_LSN_LO: usize = 4;
const PD_CHECKSUM: usize = 8;
const PD_LOWER: usize = 12;
const PD_UPPER: usize = 14;
const PD_SPECIAL: usize = 16;
const PD_PAGESIZE_VERSION: usize = 18;

/// Page layout version carried in `pd_pagesize_version` since 8.3.
const PG_PAGE_LAYOUT_VERSION: u16 = 4;

const N_SUMS: usize = 32;
const FNV_PRIME: u32 = 16777619;

// Base offsets initializing each of the parallel FNV hashes into a different
// starting state, per src/include/storage/checksum_impl.h.
const CHECKSUM_BASE_OFFSETS: [u32; N_SUMS] = [
    0x5B1F36E9, 0xB8525960, 0x02AB50AA, 0x1DE66D2A, 0x79FF467A, 0x9BB9F8A3, 0x217E7CD2, 0x83E13D2C,
    0xF8D4474F, 0xE39EB970, 0x42C6AE16, 0x993216FA, 0x7B093B5D, 0x98DAFF3C, 0xF718902A, 0x0B1C9CDB,
    0xE58F764B, 0x187636BC, 0x5D7B3BB1, 0xE73DE7DE, 0x92BEC979, 0xCCA6C0B2, 0x304A0979, 0x85AA43D4,
    0x783125BB, 0x6CA8EAA2, 0xE407EAC6, 0x4B5CFC3E, 0x9FBF8C76, 0x15CA20BE, 0xF2CA9FD3, 0x959BD756,
];

/// LSN of the last WAL record that touched this page (`pd_lsn`).
pub fn page_lsn(page: &[u8]) -> Lsn {
    let hi = LittleEndian::read_u32(&page[PD_LSN_HI..PD_LSN_HI + 4]);
    let lo = LittleEndian::read_u32(&page[PD_LSN_LO..PD_LSN_LO + 4]);
    Lsn(((hi as u64) << 32) | lo as u64)
}

pub fn page_is_zeroed(page: &[u8]) -> bool {
    page.iter().all(|b| *b == 0)
}

fn checksum_comp(checksum: u32, value: u32) -> u32 {
    let tmp = checksum ^ value;
    tmp.wrapping_mul(FNV_PRIME) ^ (tmp >> 17)
}

/// Compute the checksum for a page, with the on-page `pd_checksum` field
/// treated as zero. The block number is mixed in to catch transposed pages.
pub fn pg_checksum_page(page: &[u8], blkno: u32) -> u16 {
    debug_assert_eq!(page.len(), BLCKSZ);

    let mut sums = CHECKSUM_BASE_OFFSETS;
    for i in 0..BLCKSZ / (4 * N_SUMS) {
        for (j, sum) in sums.iter_mut().enumerate() {
            let off = (i * N_SUMS + j) * 4;
            let mut value = LittleEndian::read_u32(&page[off..off + 4]);
            if off == PD_CHECKSUM {
                // pd_checksum occupies the low half of this word
                value &= 0xFFFF_0000;
            }
            *sum = checksum_comp(*sum, value);
        }
    }
    // two rounds of zeroes for additional mixing
    for _ in 0..2 {
        for sum in sums.iter_mut() {
            *sum = checksum_comp(*sum, 0);
        }
    }

    let mut checksum: u32 = 0;
    for sum in sums {
        checksum ^= sum;
    }
    checksum ^= blkno;

    // Reduce to u16 with an offset of one so a valid checksum is never zero.
    ((checksum % 65535) + 1) as u16
}

/// Verify a page against its stored checksum. Zeroed (freshly extended) pages
/// carry no checksum and are accepted as-is.
pub fn verify_page(page: &[u8], blkno: u32) -> bool {
    if page_is_zeroed(page) {
        return true;
    }
    let stored = LittleEndian::read_u16(&page[PD_CHECKSUM..PD_CHECKSUM + 2]);
    stored == pg_checksum_page(page, blkno)
}

/// Build an empty page with a valid header, the given `pd_lsn` and a correct
/// checksum. Used to synthesize relation files in tests and fixtures.
pub fn format_page(lsn: Lsn, blkno: u32, with_checksum: bool) -> Vec<u8> {
    let mut page = vec![0u8; BLCKSZ];
    LittleEndian::write_u32(&mut page[PD_LSN_HI..PD_LSN_HI + 4], (lsn.0 >> 32) as u32);
    LittleEndian::write_u32(&mut page[PD_LSN_LO..PD_LSN_LO + 4], lsn.0 as u32);
    // header-only page: lower right after the header, upper == special == end
    LittleEndian::write_u16(&mut page[PD_LOWER..PD_LOWER + 2], 24);
    LittleEndian::write_u16(&mut page[PD_UPPER..PD_UPPER + 2], BLCKSZ as u16);
    LittleEndian::write_u16(&mut page[PD_SPECIAL..PD_SPECIAL + 2], BLCKSZ as u16);
    LittleEndian::write_u16(
        &mut page[PD_PAGESIZE_VERSION..PD_PAGESIZE_VERSION + 2],
        BLCKSZ as u16 | PG_PAGE_LAYOUT_VERSION,
    );
    if with_checksum {
        let sum = pg_checksum_page(&page, blkno);
        LittleEndian::write_u16(&mut page[PD_CHECKSUM..PD_CHECKSUM + 2], sum);
    }
    page
}

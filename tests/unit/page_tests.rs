use pgcatchup::pg::lsn::Lsn;
use pgcatchup::pg::page::{format_page, page_is_zeroed, page_lsn, pg_checksum_page, verify_page};
use pgcatchup::pg::BLCKSZ;

#[test]
fn formatted_page_carries_its_lsn() {
    let lsn = Lsn(0xA_0000_1234);
    let page = format_page(lsn, 7, false);
    assert_eq!(page.len(), BLCKSZ);
    assert_eq!(page_lsn(&page), lsn);
}

#[test]
fn zeroed_page_detection() {
    assert!(page_is_zeroed(&vec![0u8; BLCKSZ]));
    assert!(!page_is_zeroed(&format_page(Lsn(1), 0, false)));
}

#[test]
fn checksummed_page_verifies() {
    let page = format_page(Lsn(0x3000028), 12, true);
    assert!(verify_page(&page, 12));
}

#[test]
fn checksum_mixes_in_the_block_number() {
    let page = format_page(Lsn(0x3000028), 12, true);
    assert!(!verify_page(&page, 13));
}

#[test]
fn corruption_fails_verification() {
    let mut page = format_page(Lsn(0x3000028), 12, true);
    page[4096] ^= 0x40;
    assert!(!verify_page(&page, 12));
}

#[test]
fn zeroed_page_is_accepted_without_a_checksum() {
    assert!(verify_page(&vec![0u8; BLCKSZ], 3));
}

#[test]
fn checksum_is_never_zero_and_depends_on_content() {
    let a = format_page(Lsn(0x1000), 0, false);
    let b = format_page(Lsn(0x2000), 0, false);
    assert_ne!(pg_checksum_page(&a, 0), 0);
    assert_ne!(pg_checksum_page(&a, 0), pg_checksum_page(&b, 0));
}

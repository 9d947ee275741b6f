//! Unsigned security catalog.
//!
//! A DER `ContentInfo` shaped like a signed certificate trust list with a
//! single member: the SHA-1 of the hash table. No certificates and no
//! signer infos are present.

use sha1::{Digest, Sha1};

const OID_SIGNED_DATA: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x02];
const OID_SHA1: &[u8] = &[0x2B, 0x0E, 0x03, 0x02, 0x1A];
const OID_CTL: &[u8] = &[0x2B, 0x06, 0x01, 0x04, 0x01, 0x82, 0x37, 0x0A, 0x01];
const OID_CATALOG_LIST: &[u8] = &[0x2B, 0x06, 0x01, 0x04, 0x01, 0x82, 0x37, 0x0C, 0x01, 0x01];
const OID_CATALOG_MEMBER: &[u8] = &[0x2B, 0x06, 0x01, 0x04, 0x01, 0x82, 0x37, 0x0C, 0x01, 0x02];

const LIST_IDENTIFIER: [u8; 16] = [
    0x4C, 0x75, 0x6D, 0x69, 0x61, 0x46, 0x46, 0x55, 0x43, 0x61, 0x74, 0x61, 0x6C, 0x6F, 0x67, 0x00,
];
const THIS_UPDATE: &[u8] = b"150101000000Z";

const SEQUENCE: u8 = 0x30;
const SET: u8 = 0x31;
const INTEGER: u8 = 0x02;
const OCTET_STRING: u8 = 0x04;
const NULL: u8 = 0x05;
const OID: u8 = 0x06;
const UTC_TIME: u8 = 0x17;
const CONTEXT_0: u8 = 0xA0;

pub const DIGEST_LEN: usize = 20;

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let len = content.len();
    let mut out = Vec::with_capacity(content.len() + 4);
    out.push(tag);
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xFF {
        out.extend_from_slice(&[0x81, len as u8]);
    } else {
        out.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]);
    }
    out.extend_from_slice(content);
    out
}

fn seq(items: &[Vec<u8>]) -> Vec<u8> {
    tlv(SEQUENCE, &items.concat())
}

fn algorithm(oid: &[u8]) -> Vec<u8> {
    seq(&[tlv(OID, oid), tlv(NULL, &[])])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub bytes: Vec<u8>,
    pub digest_offset: usize,
}

impl Catalog {
    /// Catalog vouching for `hash_table`.
    pub fn for_hash_table(hash_table: &[u8]) -> Self {
        let digest: [u8; DIGEST_LEN] = Sha1::digest(hash_table).into();
        Self::with_digest(&digest)
    }

    fn with_digest(digest: &[u8; DIGEST_LEN]) -> Self {
        let member = seq(&[tlv(OCTET_STRING, digest), tlv(SET, &[])]);
        let ctl = seq(&[
            seq(&[tlv(OID, OID_CATALOG_LIST)]),
            tlv(OCTET_STRING, &LIST_IDENTIFIER),
            tlv(UTC_TIME, THIS_UPDATE),
            algorithm(OID_CATALOG_MEMBER),
            seq(&[member]),
        ]);
        let signed_data = seq(&[
            tlv(INTEGER, &[0x01]),
            tlv(SET, &algorithm(OID_SHA1)),
            seq(&[tlv(OID, OID_CTL), tlv(CONTEXT_0, &ctl)]),
            tlv(SET, &[]),
        ]);
        let bytes = seq(&[tlv(OID, OID_SIGNED_DATA), tlv(CONTEXT_0, &signed_data)]);

        // Only the member's empty attribute set and the empty signer-info
        // set follow the digest.
        let digest_offset = bytes.len() - 4 - DIGEST_LEN;
        Self { bytes, digest_offset }
    }

    pub fn digest(&self) -> &[u8] {
        &self.bytes[self.digest_offset..self.digest_offset + DIGEST_LEN]
    }
}
